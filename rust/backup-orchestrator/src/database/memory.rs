//! In-memory implementation of every store trait.
//!
//! Backs the daemon when it runs from an inventory file and serves as the
//! store in tests. All tables sit behind one `parking_lot::RwLock`; no lock
//! is held across an await point.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{
    ConcurrencyStore, DrTestStore, FleetStore, RestoreStore, ScheduleStore, ValidationStore,
    VerificationStore,
};
use crate::domain::{
    Agent, Backup, BackupQueueEntry, BackupScript, BackupValidation, DrRunbook, DrTest,
    DrTestSchedule, JobStatus, Organization, QueueStatus, Repository, Restore, Schedule,
    Verification, VerificationSchedule,
};

#[derive(Default)]
struct Tables {
    organizations: HashMap<Uuid, Organization>,
    agents: HashMap<Uuid, Agent>,
    repositories: HashMap<Uuid, Repository>,
    schedules: HashMap<Uuid, Schedule>,
    scripts: Vec<BackupScript>,
    // Insertion-ordered so equal timestamps keep creation order.
    backups: Vec<Backup>,
    queue: Vec<BackupQueueEntry>,
    verification_schedules: HashMap<Uuid, VerificationSchedule>,
    verifications: Vec<Verification>,
    runbooks: HashMap<Uuid, DrRunbook>,
    dr_test_schedules: HashMap<Uuid, DrTestSchedule>,
    dr_tests: Vec<DrTest>,
    validations: Vec<BackupValidation>,
    restores: Vec<Restore>,
}

impl Tables {
    fn queued_for_org(&self, org_id: Uuid) -> Vec<&BackupQueueEntry> {
        let mut queued: Vec<_> = self
            .queue
            .iter()
            .filter(|e| e.org_id == org_id && e.status == QueueStatus::Queued)
            .collect();
        // Stable: ties on queued_at keep insertion order.
        queued.sort_by_key(|e| e.queued_at);
        queued
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryStore")
            .field("schedules", &tables.schedules.len())
            .field("backups", &tables.backups.len())
            .field("queue", &tables.queue.len())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_organization(&self, org: Organization) {
        self.tables.write().organizations.insert(org.id, org);
    }

    pub fn insert_agent(&self, agent: Agent) {
        self.tables.write().agents.insert(agent.id, agent);
    }

    pub fn insert_repository(&self, repository: Repository) {
        self.tables.write().repositories.insert(repository.id, repository);
    }

    /// Insert or replace a schedule.
    pub fn upsert_schedule(&self, schedule: Schedule) {
        self.tables.write().schedules.insert(schedule.id, schedule);
    }

    pub fn remove_schedule(&self, schedule_id: Uuid) -> bool {
        self.tables.write().schedules.remove(&schedule_id).is_some()
    }

    pub fn insert_script(&self, script: BackupScript) {
        self.tables.write().scripts.push(script);
    }

    pub fn upsert_verification_schedule(&self, schedule: VerificationSchedule) {
        self.tables
            .write()
            .verification_schedules
            .insert(schedule.id, schedule);
    }

    pub fn insert_runbook(&self, runbook: DrRunbook) {
        self.tables.write().runbooks.insert(runbook.id, runbook);
    }

    pub fn upsert_dr_test_schedule(&self, schedule: DrTestSchedule) {
        self.tables.write().dr_test_schedules.insert(schedule.id, schedule);
    }

    /// Encrypted password of a repository. Synchronous so it can back a
    /// [`crate::credentials::PasswordFunc`].
    #[must_use]
    pub fn repository_password(&self, repository_id: Uuid) -> Option<Vec<u8>> {
        self.tables
            .read()
            .repositories
            .get(&repository_id)
            .map(|r| r.password_encrypted.clone())
    }

    /// Every backup record in creation order.
    #[must_use]
    pub fn backups(&self) -> Vec<Backup> {
        self.tables.read().backups.clone()
    }

    #[must_use]
    pub fn queue_entries(&self) -> Vec<BackupQueueEntry> {
        self.tables.read().queue.clone()
    }

    #[must_use]
    pub fn verifications(&self) -> Vec<Verification> {
        self.tables.read().verifications.clone()
    }

    #[must_use]
    pub fn dr_tests(&self) -> Vec<DrTest> {
        self.tables.read().dr_tests.clone()
    }

    #[must_use]
    pub fn validations(&self) -> Vec<BackupValidation> {
        self.tables.read().validations.clone()
    }

    #[must_use]
    pub fn restores(&self) -> Vec<Restore> {
        self.tables.read().restores.clone()
    }
}

fn replace<T>(rows: &mut [T], item: &T, id: impl Fn(&T) -> Uuid, kind: &str) -> anyhow::Result<()>
where
    T: Clone,
{
    let target = id(item);
    let row = rows
        .iter_mut()
        .find(|r| id(r) == target)
        .ok_or_else(|| anyhow::anyhow!("{kind} {target} not found"))?;
    *row = item.clone();
    Ok(())
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn get_organization(&self, org_id: Uuid) -> anyhow::Result<Option<Organization>> {
        Ok(self.tables.read().organizations.get(&org_id).cloned())
    }

    async fn get_agent(&self, agent_id: Uuid) -> anyhow::Result<Option<Agent>> {
        Ok(self.tables.read().agents.get(&agent_id).cloned())
    }

    async fn get_repository(&self, repository_id: Uuid) -> anyhow::Result<Option<Repository>> {
        Ok(self.tables.read().repositories.get(&repository_id).cloned())
    }
}

#[async_trait]
impl ConcurrencyStore for MemoryStore {
    async fn count_running_backups_by_org(&self, org_id: Uuid) -> anyhow::Result<u32> {
        let tables = self.tables.read();
        let count = tables
            .backups
            .iter()
            .filter(|b| b.status == JobStatus::Running)
            .filter(|b| {
                tables
                    .agents
                    .get(&b.agent_id)
                    .is_some_and(|a| a.org_id == org_id)
            })
            .count();
        Ok(u32::try_from(count)?)
    }

    async fn count_running_backups_by_agent(&self, agent_id: Uuid) -> anyhow::Result<u32> {
        let count = self
            .tables
            .read()
            .backups
            .iter()
            .filter(|b| b.agent_id == agent_id && b.status == JobStatus::Running)
            .count();
        Ok(u32::try_from(count)?)
    }

    async fn create_queue_entry(&self, entry: &BackupQueueEntry) -> anyhow::Result<()> {
        self.tables.write().queue.push(entry.clone());
        Ok(())
    }

    async fn update_queue_entry(&self, entry: &BackupQueueEntry) -> anyhow::Result<()> {
        replace(&mut self.tables.write().queue, entry, |e| e.id, "queue entry")
    }

    async fn get_queue_entry(&self, entry_id: Uuid) -> anyhow::Result<Option<BackupQueueEntry>> {
        Ok(self
            .tables
            .read()
            .queue
            .iter()
            .find(|e| e.id == entry_id)
            .cloned())
    }

    async fn get_oldest_queued(&self, org_id: Uuid) -> anyhow::Result<Option<BackupQueueEntry>> {
        let tables = self.tables.read();
        Ok(tables.queued_for_org(org_id).first().map(|e| {
            let mut entry = (*e).clone();
            entry.queue_position = 1;
            entry
        }))
    }

    async fn get_queue_position(&self, entry_id: Uuid) -> anyhow::Result<Option<u32>> {
        let tables = self.tables.read();
        let Some(entry) = tables.queue.iter().find(|e| e.id == entry_id) else {
            return Ok(None);
        };
        let position = tables
            .queued_for_org(entry.org_id)
            .iter()
            .position(|e| e.id == entry_id)
            .map(|idx| u32::try_from(idx + 1))
            .transpose()?;
        Ok(position)
    }

    async fn list_queued(&self, org_id: Uuid) -> anyhow::Result<Vec<BackupQueueEntry>> {
        let tables = self.tables.read();
        tables
            .queued_for_org(org_id)
            .into_iter()
            .enumerate()
            .map(|(idx, e)| -> anyhow::Result<BackupQueueEntry> {
                let mut entry = e.clone();
                entry.queue_position = u32::try_from(idx + 1)?;
                Ok(entry)
            })
            .collect()
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn get_enabled_schedules(&self) -> anyhow::Result<Vec<Schedule>> {
        let tables = self.tables.read();
        let mut schedules: Vec<_> = tables
            .schedules
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn get_schedule(&self, schedule_id: Uuid) -> anyhow::Result<Option<Schedule>> {
        Ok(self.tables.read().schedules.get(&schedule_id).cloned())
    }

    async fn get_enabled_scripts(&self, schedule_id: Uuid) -> anyhow::Result<Vec<BackupScript>> {
        Ok(self
            .tables
            .read()
            .scripts
            .iter()
            .filter(|s| s.schedule_id == schedule_id && s.enabled)
            .cloned()
            .collect())
    }

    async fn create_backup(&self, backup: &Backup) -> anyhow::Result<()> {
        self.tables.write().backups.push(backup.clone());
        Ok(())
    }

    async fn update_backup(&self, backup: &Backup) -> anyhow::Result<()> {
        replace(&mut self.tables.write().backups, backup, |b| b.id, "backup")
    }

    async fn get_backup(&self, backup_id: Uuid) -> anyhow::Result<Option<Backup>> {
        Ok(self
            .tables
            .read()
            .backups
            .iter()
            .find(|b| b.id == backup_id)
            .cloned())
    }

    async fn list_backups_by_schedule(&self, schedule_id: Uuid) -> anyhow::Result<Vec<Backup>> {
        Ok(self
            .tables
            .read()
            .backups
            .iter()
            .rev()
            .filter(|b| b.schedule_id == schedule_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn get_enabled_verification_schedules(
        &self,
    ) -> anyhow::Result<Vec<VerificationSchedule>> {
        Ok(self
            .tables
            .read()
            .verification_schedules
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn get_verification_schedule(
        &self,
        schedule_id: Uuid,
    ) -> anyhow::Result<Option<VerificationSchedule>> {
        Ok(self
            .tables
            .read()
            .verification_schedules
            .get(&schedule_id)
            .cloned())
    }

    async fn create_verification(&self, verification: &Verification) -> anyhow::Result<()> {
        self.tables.write().verifications.push(verification.clone());
        Ok(())
    }

    async fn update_verification(&self, verification: &Verification) -> anyhow::Result<()> {
        replace(
            &mut self.tables.write().verifications,
            verification,
            |v| v.id,
            "verification",
        )
    }

    async fn get_consecutive_failed_verifications(
        &self,
        repository_id: Uuid,
    ) -> anyhow::Result<u32> {
        let count = self
            .tables
            .read()
            .verifications
            .iter()
            .rev()
            .filter(|v| v.repository_id == repository_id && v.status.is_terminal())
            .take_while(|v| v.status == JobStatus::Failed)
            .count();
        Ok(u32::try_from(count)?)
    }

    async fn list_verifications(&self, repository_id: Uuid) -> anyhow::Result<Vec<Verification>> {
        Ok(self
            .tables
            .read()
            .verifications
            .iter()
            .rev()
            .filter(|v| v.repository_id == repository_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DrTestStore for MemoryStore {
    async fn get_enabled_dr_test_schedules(&self) -> anyhow::Result<Vec<DrTestSchedule>> {
        Ok(self
            .tables
            .read()
            .dr_test_schedules
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn get_dr_test_schedule(
        &self,
        schedule_id: Uuid,
    ) -> anyhow::Result<Option<DrTestSchedule>> {
        Ok(self.tables.read().dr_test_schedules.get(&schedule_id).cloned())
    }

    async fn get_runbook(&self, runbook_id: Uuid) -> anyhow::Result<Option<DrRunbook>> {
        Ok(self.tables.read().runbooks.get(&runbook_id).cloned())
    }

    async fn create_dr_test(&self, test: &DrTest) -> anyhow::Result<()> {
        self.tables.write().dr_tests.push(test.clone());
        Ok(())
    }

    async fn update_dr_test(&self, test: &DrTest) -> anyhow::Result<()> {
        replace(&mut self.tables.write().dr_tests, test, |t| t.id, "dr test")
    }

    async fn list_dr_tests(&self, runbook_id: Uuid) -> anyhow::Result<Vec<DrTest>> {
        Ok(self
            .tables
            .read()
            .dr_tests
            .iter()
            .rev()
            .filter(|t| t.runbook_id == runbook_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ValidationStore for MemoryStore {
    async fn create_validation(&self, validation: &BackupValidation) -> anyhow::Result<()> {
        self.tables.write().validations.push(validation.clone());
        Ok(())
    }

    async fn update_validation(&self, validation: &BackupValidation) -> anyhow::Result<()> {
        replace(
            &mut self.tables.write().validations,
            validation,
            |v| v.id,
            "validation",
        )
    }

    async fn get_validation_by_backup(
        &self,
        backup_id: Uuid,
    ) -> anyhow::Result<Option<BackupValidation>> {
        Ok(self
            .tables
            .read()
            .validations
            .iter()
            .rev()
            .find(|v| v.backup_id == backup_id)
            .cloned())
    }
}

#[async_trait]
impl RestoreStore for MemoryStore {
    async fn create_restore(&self, restore: &Restore) -> anyhow::Result<()> {
        self.tables.write().restores.push(restore.clone());
        Ok(())
    }

    async fn update_restore(&self, restore: &Restore) -> anyhow::Result<()> {
        replace(&mut self.tables.write().restores, restore, |r| r.id, "restore")
    }

    async fn get_restore(&self, restore_id: Uuid) -> anyhow::Result<Option<Restore>> {
        Ok(self
            .tables
            .read()
            .restores
            .iter()
            .find(|r| r.id == restore_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VerificationDetails;
    use crate::domain::VerificationType;

    fn agent(org_id: Uuid) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            org_id,
            hostname: "db-1".into(),
            max_concurrent_backups: None,
            network_mounts: vec![],
        }
    }

    #[tokio::test]
    async fn test_running_counts_follow_backup_status() {
        let store = MemoryStore::new();
        let org_id = Uuid::new_v4();
        let a = agent(org_id);
        let b = agent(org_id);
        store.insert_agent(a.clone());
        store.insert_agent(b.clone());

        let mut first = Backup::new(Uuid::new_v4(), a.id, Uuid::new_v4());
        first.start();
        store.create_backup(&first).await.unwrap();
        let mut second = Backup::new(Uuid::new_v4(), b.id, Uuid::new_v4());
        second.start();
        store.create_backup(&second).await.unwrap();
        store
            .create_backup(&Backup::new(Uuid::new_v4(), b.id, Uuid::new_v4()))
            .await
            .unwrap();

        assert_eq!(store.count_running_backups_by_org(org_id).await.unwrap(), 2);
        assert_eq!(store.count_running_backups_by_agent(b.id).await.unwrap(), 1);

        second.fail("boom");
        store.update_backup(&second).await.unwrap();
        assert_eq!(store.count_running_backups_by_org(org_id).await.unwrap(), 1);
        assert_eq!(store.count_running_backups_by_org(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_positions_are_fifo() {
        let store = MemoryStore::new();
        let org_id = Uuid::new_v4();
        let entries: Vec<_> = (0..3)
            .map(|_| BackupQueueEntry::new(org_id, Uuid::new_v4(), Uuid::new_v4()))
            .collect();
        for entry in &entries {
            store.create_queue_entry(entry).await.unwrap();
        }
        store
            .create_queue_entry(&BackupQueueEntry::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()))
            .await
            .unwrap();

        assert_eq!(store.get_queue_position(entries[2].id).await.unwrap(), Some(3));
        let oldest = store.get_oldest_queued(org_id).await.unwrap().unwrap();
        assert_eq!(oldest.id, entries[0].id);

        let mut started = oldest;
        started.status = QueueStatus::Started;
        store.update_queue_entry(&started).await.unwrap();

        let queued = store.list_queued(org_id).await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, entries[1].id);
        assert_eq!(queued[0].queue_position, 1);
        assert_eq!(store.get_queue_position(entries[0].id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_of_unknown_record_fails() {
        let store = MemoryStore::new();
        let backup = Backup::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(store.update_backup(&backup).await.is_err());
    }

    #[tokio::test]
    async fn test_consecutive_failures_stop_at_last_pass() {
        let store = MemoryStore::new();
        let repo_id = Uuid::new_v4();
        let record = |error: Option<&str>| {
            let mut v = Verification::start(repo_id, None, VerificationType::Check);
            v.finish(VerificationDetails::default(), error.map(String::from));
            v
        };

        for v in [record(Some("a")), record(None), record(Some("b")), record(Some("c"))] {
            store.create_verification(&v).await.unwrap();
        }
        // Still running: not counted either way.
        store
            .create_verification(&Verification::start(repo_id, None, VerificationType::Check))
            .await
            .unwrap();

        assert_eq!(
            store.get_consecutive_failed_verifications(repo_id).await.unwrap(),
            2
        );
    }
}
