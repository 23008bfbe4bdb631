//! Repository verifications and post-backup validations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JobStatus;

/// What a verification run does against the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    /// Structural integrity check.
    Check,
    /// Integrity check that also reads (a subset of) pack data.
    CheckReadData,
    /// Restore the latest snapshot into a scratch directory.
    TestRestore,
}

impl std::fmt::Display for VerificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Check => "check",
            Self::CheckReadData => "check_read_data",
            Self::TestRestore => "test_restore",
        };
        f.write_str(s)
    }
}

/// A recurring verification of one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSchedule {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub verification_type: VerificationType,
    pub cron_expression: String,
    /// Passed to `--read-data-subset`, e.g. `5%` or `1/10`.
    #[serde(default)]
    pub read_data_subset: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Structured outcome of a verification run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationDetails {
    #[serde(default)]
    pub errors_found: Vec<String>,
    pub read_data_subset: Option<String>,
    pub snapshot_id: Option<String>,
    pub files_restored: u64,
    pub bytes_restored: u64,
}

/// One verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub id: Uuid,
    pub repository_id: Uuid,
    /// `None` for manually triggered runs.
    pub schedule_id: Option<Uuid>,
    pub verification_type: VerificationType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub details: Option<VerificationDetails>,
    pub error_message: Option<String>,
}

impl Verification {
    /// A `running` record for a verification that starts now.
    #[must_use]
    pub fn start(
        repository_id: Uuid,
        schedule_id: Option<Uuid>,
        verification_type: VerificationType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            repository_id,
            schedule_id,
            verification_type,
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            details: None,
            error_message: None,
        }
    }

    /// Finalize; a present `error` marks the run failed.
    pub fn finish(&mut self, details: VerificationDetails, error: Option<String>) {
        let now = Utc::now();
        self.status = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        self.completed_at = Some(now);
        self.duration_ms = u64::try_from((now - self.started_at).num_milliseconds()).ok();
        self.details = Some(details);
        self.error_message = error;
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// One file compared between the snapshot and its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotCheckResult {
    pub path: String,
    pub snapshot_size: u64,
    /// `None` when no source file could be located.
    pub source_size: Option<u64>,
    pub passed: bool,
}

/// Structured outcome of a post-backup validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupValidationDetails {
    pub snapshot_found: bool,
    pub metadata_valid: bool,
    #[serde(default)]
    pub metadata_issues: Vec<String>,
    pub expected_file_count: u64,
    pub actual_file_count: u64,
    pub file_count_within_margin: bool,
    #[serde(default)]
    pub spot_checks: Vec<SpotCheckResult>,
    pub spot_checks_passed: u32,
    pub spot_checks_failed: u32,
    /// `None` when the integrity check was not requested.
    pub integrity_passed: Option<bool>,
}

impl BackupValidationDetails {
    /// Every check that ran passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.snapshot_found
            && self.metadata_valid
            && self.file_count_within_margin
            && self.spot_checks_failed == 0
            && self.integrity_passed.unwrap_or(true)
    }

    /// Human-readable list of the checks that failed, `None` when all passed.
    #[must_use]
    pub fn failure_summary(&self, snapshot_id: &str) -> Option<String> {
        if !self.snapshot_found {
            return Some(format!("snapshot {snapshot_id} not found"));
        }
        let mut failures = Vec::new();
        if !self.metadata_valid {
            if self.metadata_issues.is_empty() {
                failures.push("invalid snapshot metadata".to_string());
            } else {
                failures.push(self.metadata_issues.join("; "));
            }
        }
        if !self.file_count_within_margin {
            failures.push(format!(
                "file count {} outside margin of expected {}",
                self.actual_file_count, self.expected_file_count
            ));
        }
        if self.spot_checks_failed > 0 {
            failures.push(format!("{} spot check(s) failed", self.spot_checks_failed));
        }
        if self.integrity_passed == Some(false) {
            failures.push("integrity check failed".to_string());
        }
        if failures.is_empty() {
            None
        } else {
            Some(failures.join(", "))
        }
    }
}

/// A validation of one completed backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupValidation {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub repository_id: Uuid,
    pub snapshot_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub details: Option<BackupValidationDetails>,
    pub error_message: Option<String>,
}

impl BackupValidation {
    #[must_use]
    pub fn start(backup_id: Uuid, repository_id: Uuid, snapshot_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            repository_id,
            snapshot_id: snapshot_id.into(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            details: None,
            error_message: None,
        }
    }

    /// Completed only when there is no error and every check passed.
    ///
    /// A failed validation always carries a message; without an explicit
    /// error it names the failing checks.
    pub fn finish(&mut self, details: BackupValidationDetails, error: Option<String>) {
        self.status = if error.is_none() && details.passed() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.error_message = error.or_else(|| details.failure_summary(&self.snapshot_id));
        self.details = Some(details);
        self.completed_at = Some(Utc::now());
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

fn default_true() -> bool {
    true
}
