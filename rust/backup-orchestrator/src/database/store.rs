//! Persistence seams consumed by the schedulers.
//!
//! Every method returns `anyhow::Result`; a lookup that finds nothing is
//! `Ok(None)`, never an error. Implementations must be safe for concurrent
//! use since many execution units call into them at once.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{
    Agent, Backup, BackupQueueEntry, BackupScript, BackupValidation, DrRunbook, DrTest,
    DrTestSchedule, Organization, Repository, Restore, Schedule, Verification,
    VerificationSchedule,
};

/// Organizations, agents and repositories.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn get_organization(&self, org_id: Uuid) -> anyhow::Result<Option<Organization>>;

    async fn get_agent(&self, agent_id: Uuid) -> anyhow::Result<Option<Agent>>;

    async fn get_repository(&self, repository_id: Uuid) -> anyhow::Result<Option<Repository>>;
}

/// Running counts and the per-organization backup queue.
#[async_trait]
pub trait ConcurrencyStore: FleetStore {
    /// Backups currently `running` for agents of the organization.
    async fn count_running_backups_by_org(&self, org_id: Uuid) -> anyhow::Result<u32>;

    /// Backups currently `running` for the agent.
    async fn count_running_backups_by_agent(&self, agent_id: Uuid) -> anyhow::Result<u32>;

    async fn create_queue_entry(&self, entry: &BackupQueueEntry) -> anyhow::Result<()>;

    async fn update_queue_entry(&self, entry: &BackupQueueEntry) -> anyhow::Result<()>;

    async fn get_queue_entry(&self, entry_id: Uuid) -> anyhow::Result<Option<BackupQueueEntry>>;

    /// Oldest `queued` entry of the organization.
    async fn get_oldest_queued(&self, org_id: Uuid) -> anyhow::Result<Option<BackupQueueEntry>>;

    /// 1-based position of a queued entry within its organization.
    async fn get_queue_position(&self, entry_id: Uuid) -> anyhow::Result<Option<u32>>;

    /// Queued entries of the organization in FIFO order, positions filled in.
    async fn list_queued(&self, org_id: Uuid) -> anyhow::Result<Vec<BackupQueueEntry>>;
}

/// Schedules, their scripts and the backups they produce.
#[async_trait]
pub trait ScheduleStore: FleetStore {
    async fn get_enabled_schedules(&self) -> anyhow::Result<Vec<Schedule>>;

    async fn get_schedule(&self, schedule_id: Uuid) -> anyhow::Result<Option<Schedule>>;

    /// Enabled scripts of one schedule.
    async fn get_enabled_scripts(&self, schedule_id: Uuid) -> anyhow::Result<Vec<BackupScript>>;

    async fn create_backup(&self, backup: &Backup) -> anyhow::Result<()>;

    async fn update_backup(&self, backup: &Backup) -> anyhow::Result<()>;

    async fn get_backup(&self, backup_id: Uuid) -> anyhow::Result<Option<Backup>>;

    /// Backups of a schedule, newest first.
    async fn list_backups_by_schedule(&self, schedule_id: Uuid) -> anyhow::Result<Vec<Backup>>;
}

/// Verification schedules and runs.
#[async_trait]
pub trait VerificationStore: FleetStore {
    async fn get_enabled_verification_schedules(&self)
    -> anyhow::Result<Vec<VerificationSchedule>>;

    async fn get_verification_schedule(
        &self,
        schedule_id: Uuid,
    ) -> anyhow::Result<Option<VerificationSchedule>>;

    async fn create_verification(&self, verification: &Verification) -> anyhow::Result<()>;

    async fn update_verification(&self, verification: &Verification) -> anyhow::Result<()>;

    /// Failed runs for the repository counted back from the most recent
    /// finished run until the first one that passed.
    async fn get_consecutive_failed_verifications(&self, repository_id: Uuid)
    -> anyhow::Result<u32>;

    /// Runs of a repository, newest first.
    async fn list_verifications(&self, repository_id: Uuid) -> anyhow::Result<Vec<Verification>>;
}

/// DR runbooks, their test schedules and runs.
#[async_trait]
pub trait DrTestStore: ScheduleStore {
    async fn get_enabled_dr_test_schedules(&self) -> anyhow::Result<Vec<DrTestSchedule>>;

    async fn get_dr_test_schedule(&self, schedule_id: Uuid)
    -> anyhow::Result<Option<DrTestSchedule>>;

    async fn get_runbook(&self, runbook_id: Uuid) -> anyhow::Result<Option<DrRunbook>>;

    async fn create_dr_test(&self, test: &DrTest) -> anyhow::Result<()>;

    async fn update_dr_test(&self, test: &DrTest) -> anyhow::Result<()>;

    /// Tests of a runbook, newest first.
    async fn list_dr_tests(&self, runbook_id: Uuid) -> anyhow::Result<Vec<DrTest>>;
}

/// Post-backup validation results.
#[async_trait]
pub trait ValidationStore: Send + Sync {
    async fn create_validation(&self, validation: &BackupValidation) -> anyhow::Result<()>;

    async fn update_validation(&self, validation: &BackupValidation) -> anyhow::Result<()>;

    async fn get_validation_by_backup(
        &self,
        backup_id: Uuid,
    ) -> anyhow::Result<Option<BackupValidation>>;
}

/// Restore records.
#[async_trait]
pub trait RestoreStore: FleetStore {
    async fn create_restore(&self, restore: &Restore) -> anyhow::Result<()>;

    async fn update_restore(&self, restore: &Restore) -> anyhow::Result<()>;

    async fn get_restore(&self, restore_id: Uuid) -> anyhow::Result<Option<Restore>>;
}
