//! Restore requests, including restores on behalf of another agent.

use backup_adapter::RestoreSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JobStatus;

/// A restore of one snapshot to a target path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Restore {
    pub id: Uuid,
    /// Agent whose backup is being restored.
    pub source_agent_id: Uuid,
    /// Agent receiving the files. Differs from the source for cross-agent restores.
    pub target_agent_id: Uuid,
    pub repository_id: Uuid,
    pub snapshot_id: String,
    pub target_path: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    pub status: JobStatus,
    pub files_restored: u64,
    pub bytes_restored: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Restore {
    #[must_use]
    pub fn is_cross_agent(&self) -> bool {
        self.source_agent_id != self.target_agent_id
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, summary: &RestoreSummary) {
        self.status = JobStatus::Completed;
        self.files_restored = summary.files_restored;
        self.bytes_restored = summary.bytes_restored;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }
}
