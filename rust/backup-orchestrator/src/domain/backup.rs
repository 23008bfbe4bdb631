//! Backup job records and the concurrency queue.

use backup_adapter::BackupStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle shared by every job record: backups, restores, verifications,
/// DR tests and validations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One backup of one schedule into one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub agent_id: Uuid,
    pub repository_id: Uuid,
    pub status: JobStatus,
    pub snapshot_id: Option<String>,
    pub files_new: u64,
    pub files_changed: u64,
    /// Bytes added to the repository.
    pub size_bytes: u64,
    pub total_files: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Backup {
    /// A fresh `pending` record.
    #[must_use]
    pub fn new(schedule_id: Uuid, agent_id: Uuid, repository_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            agent_id,
            repository_id,
            status: JobStatus::Pending,
            snapshot_id: None,
            files_new: 0,
            files_changed: 0,
            size_bytes: 0,
            total_files: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Finalize as completed with the tool's summary.
    pub fn complete(&mut self, stats: &BackupStats) {
        self.status = JobStatus::Completed;
        self.snapshot_id = Some(stats.snapshot_id.clone());
        self.files_new = stats.files_new;
        self.files_changed = stats.files_changed;
        self.size_bytes = stats.data_added;
        self.total_files = stats.total_files_processed;
        self.completed_at = Some(Utc::now());
    }

    /// Finalize as failed.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }
}

/// State of a deferred backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Started,
    Cancelled,
}

/// A backup deferred because a concurrency ceiling was reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupQueueEntry {
    pub id: Uuid,
    pub org_id: Uuid,
    pub agent_id: Uuid,
    pub schedule_id: Uuid,
    pub queued_at: DateTime<Utc>,
    /// 1-based position among the org's queued entries. Recomputed on read.
    #[serde(default)]
    pub queue_position: u32,
    pub status: QueueStatus,
    pub started_at: Option<DateTime<Utc>>,
}

impl BackupQueueEntry {
    #[must_use]
    pub fn new(org_id: Uuid, agent_id: Uuid, schedule_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            agent_id,
            schedule_id,
            queued_at: Utc::now(),
            queue_position: 0,
            status: QueueStatus::Queued,
            started_at: None,
        }
    }
}
