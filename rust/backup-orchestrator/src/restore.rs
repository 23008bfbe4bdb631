//! Restores, including restores onto a different agent than the one that
//! was backed up, and the scratch restores used by DR tests and
//! verifications.

use std::path::Path;
use std::sync::Arc;

use backup_adapter::{BackupTool, RestoreOptions, Snapshot};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::Instrument;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::database::RestoreStore;
use crate::domain::{JobStatus, Restore};
use crate::error::{OrchestratorError, Result, StoreResultExt};
use crate::logging::OpTimer;

/// What to restore, and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub source_agent_id: Uuid,
    /// Defaults to the source agent.
    #[serde(default)]
    pub target_agent_id: Option<Uuid>,
    pub repository_id: Uuid,
    /// Full or short id, or `latest`.
    pub snapshot_id: String,
    pub target_path: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Runs restores and records them.
pub struct RestoreService {
    store: Arc<dyn RestoreStore>,
    tool: Arc<dyn BackupTool>,
    credentials: Credentials,
}

impl std::fmt::Debug for RestoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreService")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl RestoreService {
    #[must_use]
    pub fn new(
        store: Arc<dyn RestoreStore>,
        tool: Arc<dyn BackupTool>,
        credentials: Credentials,
    ) -> Self {
        Self {
            store,
            tool,
            credentials,
        }
    }

    /// Restore a snapshot and return the finished record.
    ///
    /// Failures after the record exists are recorded on it rather than
    /// returned.
    ///
    /// # Errors
    ///
    /// Store failures, and [`OrchestratorError::NotFound`] for an unknown
    /// source or target agent.
    pub async fn restore_snapshot(&self, request: RestoreRequest) -> Result<Restore> {
        let target_agent_id = request.target_agent_id.unwrap_or(request.source_agent_id);
        for agent_id in [request.source_agent_id, target_agent_id] {
            self.store
                .get_agent(agent_id)
                .await
                .store_err()?
                .ok_or_else(|| OrchestratorError::not_found("agent", agent_id))?;
        }

        let mut restore = Restore {
            id: Uuid::new_v4(),
            source_agent_id: request.source_agent_id,
            target_agent_id,
            repository_id: request.repository_id,
            snapshot_id: request.snapshot_id,
            target_path: request.target_path,
            include: request.include,
            exclude: request.exclude,
            status: JobStatus::Pending,
            files_restored: 0,
            bytes_restored: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };
        self.store.create_restore(&restore).await.store_err()?;

        let span = tracing::info_span!(
            "restore",
            restore_id = %restore.id,
            repository_id = %restore.repository_id,
            cross_agent = restore.is_cross_agent(),
        );
        async move {
            restore.start();
            self.store.update_restore(&restore).await.store_err()?;

            if let Err(e) = self.run(&mut restore).await {
                tracing::error!(error = %e, "Restore failed");
                restore.fail(e.to_string());
            }
            self.store.update_restore(&restore).await.store_err()?;
            Ok(restore)
        }
        .instrument(span)
        .await
    }

    /// # Errors
    ///
    /// Store failures.
    pub async fn get_restore(&self, restore_id: Uuid) -> Result<Option<Restore>> {
        self.store.get_restore(restore_id).await.store_err()
    }

    async fn run(&self, restore: &mut Restore) -> Result<()> {
        let repository = self
            .store
            .get_repository(restore.repository_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("repository", restore.repository_id))?;
        let config = self.credentials.resolve(&repository)?;

        if restore.snapshot_id == "latest" {
            let snapshots = self.tool.snapshots(&config).await?;
            let latest = latest_snapshot(&snapshots)
                .ok_or_else(|| OrchestratorError::Verification("repository has no snapshots".into()))?;
            restore.snapshot_id.clone_from(&latest.id);
        }

        let options = RestoreOptions {
            include: restore.include.clone(),
            exclude: restore.exclude.clone(),
        };
        let timer = OpTimer::new("restore", format!("restore {}", restore.snapshot_id));
        let result = self
            .tool
            .restore(&config, &restore.snapshot_id, Path::new(&restore.target_path), &options)
            .await;
        timer.finish_with_result(result.as_ref());

        restore.complete(&result?);
        tracing::info!(
            files_restored = restore.files_restored,
            bytes_restored = restore.bytes_restored,
            "Restore completed"
        );
        Ok(())
    }
}

/// The most recent snapshot by time.
#[must_use]
pub fn latest_snapshot(snapshots: &[Snapshot]) -> Option<&Snapshot> {
    snapshots.iter().max_by_key(|s| s.time)
}

/// A throwaway directory for a trial restore; removed when dropped.
pub(crate) fn scratch_dir(root: Option<&Path>, prefix: &str) -> std::io::Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
}
