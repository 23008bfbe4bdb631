//! The backup tool contract consumed by the orchestrator.

use async_trait::async_trait;
use std::path::Path;

use crate::error::AdapterResult;
use crate::types::{
    BackupOptions, BackupStats, CheckOptions, CheckResult, DiffResult, ForgetResult, RepoStats,
    ResticConfig, RestoreOptions, RestoreSummary, RetentionPolicy, Snapshot, SnapshotFile,
};

/// Operations the orchestrator needs from the external backup tool.
///
/// Every call is independent: the repository to act on travels with the
/// call as a [`ResticConfig`], so a single implementation can serve any
/// number of repositories concurrently.
#[async_trait]
pub trait BackupTool: Send + Sync {
    /// Create a new repository.
    async fn init(&self, repo: &ResticConfig) -> AdapterResult<()>;

    /// Back up `paths` and return the run summary.
    async fn backup(
        &self,
        repo: &ResticConfig,
        paths: &[String],
        excludes: &[String],
        options: &BackupOptions,
    ) -> AdapterResult<BackupStats>;

    /// Restore a snapshot into `target`.
    async fn restore(
        &self,
        repo: &ResticConfig,
        snapshot_id: &str,
        target: &Path,
        options: &RestoreOptions,
    ) -> AdapterResult<RestoreSummary>;

    /// List all snapshots, oldest first.
    async fn snapshots(&self, repo: &ResticConfig) -> AdapterResult<Vec<Snapshot>>;

    /// List the nodes in a snapshot, optionally restricted to a path prefix.
    async fn list_files(
        &self,
        repo: &ResticConfig,
        snapshot_id: &str,
        path_prefix: Option<&str>,
    ) -> AdapterResult<Vec<SnapshotFile>>;

    /// Apply a retention policy, optionally pruning unreferenced data.
    async fn forget(
        &self,
        repo: &ResticConfig,
        policy: &RetentionPolicy,
        prune: bool,
    ) -> AdapterResult<ForgetResult>;

    /// Remove unreferenced data.
    async fn prune(&self, repo: &ResticConfig) -> AdapterResult<()>;

    /// Verify repository integrity.
    async fn check(&self, repo: &ResticConfig, options: &CheckOptions) -> AdapterResult<CheckResult>;

    /// Copy one snapshot from `source` into `target`.
    async fn copy(
        &self,
        source: &ResticConfig,
        target: &ResticConfig,
        snapshot_id: &str,
    ) -> AdapterResult<()>;

    /// Repository-wide size and file count.
    async fn stats(&self, repo: &ResticConfig) -> AdapterResult<RepoStats>;

    /// Paths that differ between two snapshots.
    async fn diff(&self, repo: &ResticConfig, snapshot_a: &str, snapshot_b: &str) -> AdapterResult<DiffResult>;
}
