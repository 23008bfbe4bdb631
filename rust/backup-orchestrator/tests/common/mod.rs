//! Shared fixtures for the orchestrator integration tests.
//!
//! [`FakeTool`] records every call instead of running restic. Repositories
//! are stored with plaintext configs; [`credentials`] passes them through,
//! except for configs equal to `broken`, which fail to decrypt.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use backup_adapter::{
    AdapterError, AdapterResult, BackupOptions, BackupStats, BackupTool, CheckOptions,
    CheckResult, DiffResult, ForgetResult, NodeType, RepoStats, RepositoryType, ResticConfig,
    RestoreOptions, RestoreSummary, RetentionPolicy, Snapshot, SnapshotFile,
};
use backup_orchestrator::Credentials;
use backup_orchestrator::database::MemoryStore;
use backup_orchestrator::domain::{
    Agent, BackupScript, NetworkMount, Organization, Repository, Schedule, ScheduleRepository,
    ScriptType,
};
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

pub const SNAPSHOT_ID: &str = "abc123";

/// A call made against [`FakeTool`], by repository location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Backup { repository: String },
    Forget { repository: String, prune: bool },
    Copy { source: String, target: String, snapshot_id: String },
    Restore { repository: String, snapshot_id: String },
    Check { repository: String, read_data: bool, subset: Option<String> },
}

/// Recording stand-in for restic.
#[derive(Debug, Default)]
pub struct FakeTool {
    calls: Mutex<Vec<Call>>,
    failing_backups: Mutex<HashSet<String>>,
    fail_forget: AtomicBool,
    fail_restore: AtomicBool,
    no_snapshots: AtomicBool,
    check_errors: Mutex<Vec<String>>,
}

impl FakeTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn backups_to(&self, repository: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Backup { repository: r } if r == repository))
            .count()
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Copy { source, target, .. } => Some((source, target)),
                _ => None,
            })
            .collect()
    }

    pub fn forgets(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Forget { .. }))
            .count()
    }

    /// Make backups into `repository` fail.
    pub fn fail_backup(&self, repository: &str) {
        self.failing_backups.lock().insert(repository.to_string());
    }

    pub fn fail_forget(&self) {
        self.fail_forget.store(true, Ordering::SeqCst);
    }

    pub fn fail_restore(&self) {
        self.fail_restore.store(true, Ordering::SeqCst);
    }

    pub fn without_snapshots(&self) {
        self.no_snapshots.store(true, Ordering::SeqCst);
    }

    /// Make `check` report these errors.
    pub fn check_errors(&self, errors: &[&str]) {
        *self.check_errors.lock() = errors.iter().map(ToString::to_string).collect();
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BackupTool for FakeTool {
    async fn init(&self, _repo: &ResticConfig) -> AdapterResult<()> {
        Ok(())
    }

    async fn backup(
        &self,
        repo: &ResticConfig,
        _paths: &[String],
        _excludes: &[String],
        _options: &BackupOptions,
    ) -> AdapterResult<BackupStats> {
        self.record(Call::Backup {
            repository: repo.repository.clone(),
        });
        if self.failing_backups.lock().contains(&repo.repository) {
            return Err(AdapterError::CommandFailed {
                command: "backup".into(),
                stderr: format!("unable to reach {}", repo.repository),
            });
        }
        Ok(BackupStats {
            snapshot_id: SNAPSHOT_ID.into(),
            files_new: 5,
            files_changed: 2,
            data_added: 1024,
            total_files_processed: 7,
            total_bytes_processed: 4096,
            ..BackupStats::default()
        })
    }

    async fn restore(
        &self,
        repo: &ResticConfig,
        snapshot_id: &str,
        _target: &Path,
        _options: &RestoreOptions,
    ) -> AdapterResult<RestoreSummary> {
        self.record(Call::Restore {
            repository: repo.repository.clone(),
            snapshot_id: snapshot_id.to_string(),
        });
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(AdapterError::SnapshotNotFound(snapshot_id.to_string()));
        }
        Ok(RestoreSummary {
            total_files: 3,
            files_restored: 3,
            total_bytes: 2048,
            bytes_restored: 2048,
        })
    }

    async fn snapshots(&self, _repo: &ResticConfig) -> AdapterResult<Vec<Snapshot>> {
        if self.no_snapshots.load(Ordering::SeqCst) {
            return Ok(vec![]);
        }
        Ok(vec![Snapshot {
            id: SNAPSHOT_ID.into(),
            short_id: SNAPSHOT_ID.into(),
            time: Utc::now(),
            hostname: "files-1".into(),
            username: "root".into(),
            paths: vec!["/srv/data".into()],
            tags: vec![],
        }])
    }

    async fn list_files(
        &self,
        _repo: &ResticConfig,
        _snapshot_id: &str,
        _path_prefix: Option<&str>,
    ) -> AdapterResult<Vec<SnapshotFile>> {
        Ok(["a.txt", "b.txt"]
            .into_iter()
            .map(|name| SnapshotFile {
                name: name.into(),
                node_type: NodeType::File,
                path: format!("/srv/data/{name}"),
                size: 10,
                mtime: Some(Utc::now()),
            })
            .collect())
    }

    async fn forget(
        &self,
        repo: &ResticConfig,
        _policy: &RetentionPolicy,
        prune: bool,
    ) -> AdapterResult<ForgetResult> {
        self.record(Call::Forget {
            repository: repo.repository.clone(),
            prune,
        });
        if self.fail_forget.load(Ordering::SeqCst) {
            return Err(AdapterError::CommandFailed {
                command: "forget".into(),
                stderr: "repository is already locked".into(),
            });
        }
        Ok(ForgetResult {
            snapshots_kept: 7,
            snapshots_removed: 2,
            removed_ids: vec!["old1".into(), "old2".into()],
            pruned: prune,
        })
    }

    async fn prune(&self, _repo: &ResticConfig) -> AdapterResult<()> {
        Ok(())
    }

    async fn check(&self, repo: &ResticConfig, options: &CheckOptions) -> AdapterResult<CheckResult> {
        self.record(Call::Check {
            repository: repo.repository.clone(),
            read_data: options.read_data,
            subset: options.read_data_subset.clone(),
        });
        let errors = self.check_errors.lock().clone();
        Ok(CheckResult {
            success: errors.is_empty(),
            errors,
        })
    }

    async fn copy(
        &self,
        source: &ResticConfig,
        target: &ResticConfig,
        snapshot_id: &str,
    ) -> AdapterResult<()> {
        self.record(Call::Copy {
            source: source.repository.clone(),
            target: target.repository.clone(),
            snapshot_id: snapshot_id.to_string(),
        });
        Ok(())
    }

    async fn stats(&self, _repo: &ResticConfig) -> AdapterResult<RepoStats> {
        Ok(RepoStats::default())
    }

    async fn diff(&self, _repo: &ResticConfig, _a: &str, _b: &str) -> AdapterResult<DiffResult> {
        Ok(DiffResult::default())
    }
}

/// Decrypt passes bytes through, except `broken`; every password is `secret`.
pub fn credentials() -> Credentials {
    Credentials::new()
        .with_decrypt(Arc::new(|bytes: &[u8]| -> anyhow::Result<Vec<u8>> {
            if bytes == b"broken" {
                anyhow::bail!("authentication tag mismatch");
            }
            Ok(bytes.to_vec())
        }))
        .with_password(Arc::new(|_: Uuid| -> anyhow::Result<String> { Ok("secret".to_string()) }))
}

/// One organization with one agent.
pub struct Fleet {
    pub store: Arc<MemoryStore>,
    pub tool: Arc<FakeTool>,
    pub org_id: Uuid,
    pub agent_id: Uuid,
}

impl Fleet {
    pub fn new(org_limit: Option<u32>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let org_id = Uuid::new_v4();
        store.insert_organization(Organization {
            id: org_id,
            name: "acme".into(),
            max_concurrent_backups: org_limit,
        });
        let fleet = Self {
            store,
            tool: FakeTool::new(),
            org_id,
            agent_id: Uuid::nil(),
        };
        let agent_id = fleet.add_agent(None, vec![]);
        Self { agent_id, ..fleet }
    }

    pub fn add_agent(&self, limit: Option<u32>, mounts: Vec<NetworkMount>) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_agent(Agent {
            id,
            org_id: self.org_id,
            hostname: format!("host-{}", &id.to_string()[..8]),
            max_concurrent_backups: limit,
            network_mounts: mounts,
        });
        id
    }

    /// A local repository at `path`.
    pub fn add_repository(&self, path: &str) -> Uuid {
        let config = serde_json::json!({ "path": path }).to_string();
        self.insert_repository(path, config.into_bytes())
    }

    /// A repository whose config cannot be decrypted.
    pub fn add_broken_repository(&self, name: &str) -> Uuid {
        self.insert_repository(name, b"broken".to_vec())
    }

    fn insert_repository(&self, name: &str, config: Vec<u8>) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_repository(Repository {
            id,
            org_id: self.org_id,
            name: name.to_string(),
            repo_type: RepositoryType::Local,
            config_encrypted: config,
            password_encrypted: b"secret".to_vec(),
            created_at: Utc::now(),
        });
        id
    }

    /// An enabled schedule for the default agent targeting `repositories`
    /// in priority order, stored in the fleet's store.
    pub fn add_schedule(&self, repositories: &[Uuid]) -> Schedule {
        self.add_schedule_for(self.agent_id, repositories)
    }

    pub fn add_schedule_for(&self, agent_id: Uuid, repositories: &[Uuid]) -> Schedule {
        let schedule: Schedule = serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "agent_id": agent_id,
            "name": "nightly",
            "cron_expression": "0 2 * * *",
            "paths": ["/srv/data"],
            "repositories": repositories
                .iter()
                .enumerate()
                .map(|(priority, id)| ScheduleRepository {
                    repository_id: *id,
                    priority: u32::try_from(priority).unwrap(),
                    enabled: true,
                })
                .collect::<Vec<_>>(),
        }))
        .unwrap();
        self.store.upsert_schedule(schedule.clone());
        schedule
    }

    /// Store a changed schedule.
    pub fn save(&self, schedule: &Schedule) {
        self.store.upsert_schedule(schedule.clone());
    }

    pub fn add_script(&self, schedule_id: Uuid, script_type: ScriptType, body: &str, fail_on_error: bool) {
        self.store.insert_script(BackupScript {
            id: Uuid::new_v4(),
            schedule_id,
            script_type,
            script: body.to_string(),
            timeout_seconds: 10,
            fail_on_error,
            enabled: true,
        });
    }
}
