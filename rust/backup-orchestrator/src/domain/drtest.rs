//! Disaster-recovery runbooks and their test runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JobStatus;

/// A documented recovery procedure, optionally tied to the schedule whose
/// backups it recovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrRunbook {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Backup schedule whose primary repository is restored during a test.
    #[serde(default)]
    pub schedule_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Recurring test of a runbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrTestSchedule {
    pub id: Uuid,
    pub runbook_id: Uuid,
    pub cron_expression: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One DR test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrTest {
    pub id: Uuid,
    pub runbook_id: Uuid,
    /// `None` for manually triggered tests.
    pub schedule_id: Option<Uuid>,
    pub status: JobStatus,
    pub snapshot_id: Option<String>,
    pub files_restored: u64,
    pub restore_size_bytes: u64,
    pub restore_duration_ms: Option<u64>,
    pub verification_passed: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub notes: String,
}

impl DrTest {
    #[must_use]
    pub fn new(runbook_id: Uuid, schedule_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            runbook_id,
            schedule_id,
            status: JobStatus::Pending,
            snapshot_id: None,
            files_restored: 0,
            restore_size_bytes: 0,
            restore_duration_ms: None,
            verification_passed: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            notes: String::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, files_restored: u64, bytes_restored: u64, duration_ms: u64) {
        self.status = JobStatus::Completed;
        self.files_restored = files_restored;
        self.restore_size_bytes = bytes_restored;
        self.restore_duration_ms = Some(duration_ms);
        self.verification_passed = Some(true);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.verification_passed = Some(false);
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }
}

fn default_true() -> bool {
    true
}
