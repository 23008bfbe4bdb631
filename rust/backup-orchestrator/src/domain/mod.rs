//! Domain model of the orchestrator.
//!
//! Plain data: every record is created and finalized by exactly one execution
//! unit and persisted through the store traits in [`crate::database`].

pub mod backup;
pub mod drtest;
pub mod fleet;
pub mod restore;
pub mod schedule;
pub mod verification;

pub use backup::{Backup, BackupQueueEntry, JobStatus, QueueStatus};
pub use drtest::{DrRunbook, DrTest, DrTestSchedule};
pub use fleet::{Agent, MountStatus, NetworkMount, Organization, Repository};
pub use restore::Restore;
pub use schedule::{
    BackupScript, MountUnavailableBehavior, Schedule, ScheduleRepository, ScheduleScripts,
    ScriptType,
};
pub use verification::{
    BackupValidation, BackupValidationDetails, SpotCheckResult, Verification,
    VerificationDetails, VerificationSchedule, VerificationType,
};
