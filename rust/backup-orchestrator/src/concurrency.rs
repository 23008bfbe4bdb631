//! Admission control for backups.
//!
//! The [`ConcurrencyManager`] enforces per-organization and per-agent ceilings
//! on running backups. Denied backups are persisted in a per-organization
//! FIFO queue; every released slot promotes at most one queued entry, and
//! only if that entry would now be admitted.
//!
//! In-memory running counts are a cache. Admission always uses
//! `max(in-memory, persisted)` so a restart never under-counts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::database::ConcurrencyStore;
use crate::domain::{BackupQueueEntry, QueueStatus};
use crate::error::{OrchestratorError, Result, StoreResultExt};
use crate::notify::{Notification, Notifier, notify_best_effort};

/// Why a backup has to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum QueueReason {
    OrgLimit { limit: u32, running: u32 },
    AgentLimit { limit: u32, running: u32 },
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Queue(QueueReason),
}

impl Admission {
    #[must_use]
    pub fn can_start(self) -> bool {
        self == Self::Admit
    }

    #[must_use]
    pub fn should_queue(self) -> bool {
        !self.can_start()
    }
}

/// Outcome of [`ConcurrencyManager::acquire_slot`].
#[derive(Debug, Clone)]
pub enum SlotAcquisition {
    /// The caller holds a slot and must release it exactly once.
    Acquired,
    /// The backup was queued; it will be handed out as a promotion.
    Queued(BackupQueueEntry),
}

/// Snapshot of one organization's admission state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrencyStatus {
    pub org_id: Uuid,
    pub max_concurrent_backups: Option<u32>,
    /// Effective running count used for admission.
    pub running: u32,
    /// Running count tracked by this process alone.
    pub running_in_memory: u32,
    pub queued: usize,
}

#[derive(Debug, Default)]
struct RunningCounts {
    org: HashMap<Uuid, u32>,
    agent: HashMap<Uuid, u32>,
}

impl RunningCounts {
    fn increment(&mut self, org_id: Uuid, agent_id: Uuid) {
        *self.org.entry(org_id).or_default() += 1;
        *self.agent.entry(agent_id).or_default() += 1;
    }

    fn decrement(&mut self, org_id: Uuid, agent_id: Uuid) {
        for count in [self.org.get_mut(&org_id), self.agent.get_mut(&agent_id)]
            .into_iter()
            .flatten()
        {
            *count = count.saturating_sub(1);
        }
    }
}

/// Admits, queues and promotes backups.
pub struct ConcurrencyManager {
    store: Arc<dyn ConcurrencyStore>,
    notifier: Option<Arc<dyn Notifier>>,
    notify_on_queue: bool,
    // Held across store calls so check-then-increment is one step.
    counts: Mutex<RunningCounts>,
    promotions: mpsc::UnboundedSender<BackupQueueEntry>,
    promotions_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<BackupQueueEntry>>>,
}

impl std::fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("notify_on_queue", &self.notify_on_queue)
            .finish_non_exhaustive()
    }
}

impl ConcurrencyManager {
    #[must_use]
    pub fn new(store: Arc<dyn ConcurrencyStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            notifier: None,
            notify_on_queue: true,
            counts: Mutex::new(RunningCounts::default()),
            promotions: tx,
            promotions_rx: parking_lot::Mutex::new(Some(rx)),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, notify_on_queue: bool) -> Self {
        self.notifier = Some(notifier);
        self.notify_on_queue = notify_on_queue;
        self
    }

    /// Receiver of promoted queue entries. Each promoted entry already holds a
    /// slot. Can be taken once.
    pub fn take_promotions(&self) -> Option<mpsc::UnboundedReceiver<BackupQueueEntry>> {
        self.promotions_rx.lock().take()
    }

    /// Whether a backup for `agent_id` could start now.
    ///
    /// # Errors
    ///
    /// Store failures reading the organization or agent, and
    /// [`OrchestratorError::NotFound`] if either does not exist.
    pub async fn can_start_backup(&self, org_id: Uuid, agent_id: Uuid) -> Result<Admission> {
        let counts = self.counts.lock().await;
        self.evaluate(&counts, org_id, agent_id).await
    }

    /// Take a slot or queue the backup.
    ///
    /// # Errors
    ///
    /// Store failures on the admission path are returned; the caller must
    /// record them against the backup it could not start.
    pub async fn acquire_slot(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
        schedule_id: Uuid,
    ) -> Result<SlotAcquisition> {
        let mut entry = {
            let mut counts = self.counts.lock().await;
            match self.evaluate(&counts, org_id, agent_id).await? {
                Admission::Admit => {
                    counts.increment(org_id, agent_id);
                    tracing::debug!(%org_id, %agent_id, %schedule_id, "Backup slot acquired");
                    return Ok(SlotAcquisition::Acquired);
                }
                Admission::Queue(reason) => {
                    let entry = BackupQueueEntry::new(org_id, agent_id, schedule_id);
                    self.store.create_queue_entry(&entry).await.store_err()?;
                    tracing::info!(
                        %org_id,
                        %agent_id,
                        %schedule_id,
                        ?reason,
                        "Backup queued by concurrency limit"
                    );
                    entry
                }
            }
        };

        match self.store.get_queue_position(entry.id).await {
            Ok(Some(position)) => entry.queue_position = position,
            Ok(None) => {}
            Err(e) => tracing::warn!(entry_id = %entry.id, error = %e, "Failed to read queue position"),
        }

        if self.notify_on_queue {
            if let Some(notifier) = &self.notifier {
                notify_best_effort(
                    notifier.as_ref(),
                    Notification::BackupQueued {
                        org_id,
                        agent_id,
                        schedule_id,
                        queue_position: (entry.queue_position > 0).then_some(entry.queue_position),
                    },
                )
                .await;
            }
        }

        Ok(SlotAcquisition::Queued(entry))
    }

    /// Give back a slot and promote the oldest queued entry of the
    /// organization if it now fits. Returns the promoted entry.
    ///
    /// # Errors
    ///
    /// Store failures while promoting. The slot itself is always released.
    pub async fn release_slot(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<BackupQueueEntry>> {
        let mut counts = self.counts.lock().await;
        counts.decrement(org_id, agent_id);
        tracing::debug!(%org_id, %agent_id, "Backup slot released");
        self.process_queue(&mut counts, org_id).await
    }

    /// Effective running count for an organization.
    pub async fn running_count_for_org(&self, org_id: Uuid) -> u32 {
        let counts = self.counts.lock().await;
        self.running_for_org(&counts, org_id).await
    }

    /// Effective running count for an agent.
    pub async fn running_count_for_agent(&self, agent_id: Uuid) -> u32 {
        let counts = self.counts.lock().await;
        self.running_for_agent(&counts, agent_id).await
    }

    /// # Errors
    ///
    /// Store failures reading the organization or its queue.
    pub async fn get_concurrency_status(&self, org_id: Uuid) -> Result<ConcurrencyStatus> {
        let org = self
            .store
            .get_organization(org_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("organization", org_id))?;
        let queued = self.store.list_queued(org_id).await.store_err()?.len();

        let counts = self.counts.lock().await;
        Ok(ConcurrencyStatus {
            org_id,
            max_concurrent_backups: effective_limit(org.max_concurrent_backups),
            running: self.running_for_org(&counts, org_id).await,
            running_in_memory: counts.org.get(&org_id).copied().unwrap_or(0),
            queued,
        })
    }

    /// Queued entries of an organization in promotion order.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn get_queued_backups(&self, org_id: Uuid) -> Result<Vec<BackupQueueEntry>> {
        self.store.list_queued(org_id).await.store_err()
    }

    /// Cancel an entry that is still queued.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NotFound`] when there is no such queued entry.
    pub async fn cancel_queued_backup(&self, entry_id: Uuid) -> Result<()> {
        // Under the lock so a concurrent promotion cannot start it meanwhile.
        let _counts = self.counts.lock().await;
        let mut entry = self
            .store
            .get_queue_entry(entry_id)
            .await
            .store_err()?
            .filter(|e| e.status == QueueStatus::Queued)
            .ok_or_else(|| OrchestratorError::not_found("queued backup", entry_id))?;
        entry.status = QueueStatus::Cancelled;
        self.store.update_queue_entry(&entry).await.store_err()?;
        tracing::info!(%entry_id, schedule_id = %entry.schedule_id, "Queued backup cancelled");
        Ok(())
    }

    /// Forget every in-memory count and rely on the persisted counts until
    /// this process acquires slots again.
    pub async fn sync_running_counts(&self) {
        let mut counts = self.counts.lock().await;
        counts.org.clear();
        counts.agent.clear();
        tracing::info!("In-memory running counts reset");
    }

    async fn evaluate(
        &self,
        counts: &RunningCounts,
        org_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Admission> {
        let org = self
            .store
            .get_organization(org_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("organization", org_id))?;

        if let Some(limit) = effective_limit(org.max_concurrent_backups) {
            let running = self.running_for_org(counts, org_id).await;
            if running >= limit {
                return Ok(Admission::Queue(QueueReason::OrgLimit { limit, running }));
            }
        }

        let agent = self
            .store
            .get_agent(agent_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("agent", agent_id))?;

        // The agent limit overrides rather than falls back to the org limit.
        if let Some(limit) = effective_limit(agent.max_concurrent_backups) {
            let running = self.running_for_agent(counts, agent_id).await;
            if running >= limit {
                return Ok(Admission::Queue(QueueReason::AgentLimit { limit, running }));
            }
        }

        Ok(Admission::Admit)
    }

    async fn process_queue(
        &self,
        counts: &mut RunningCounts,
        org_id: Uuid,
    ) -> Result<Option<BackupQueueEntry>> {
        let Some(mut entry) = self.store.get_oldest_queued(org_id).await.store_err()? else {
            return Ok(None);
        };

        // Same check the entry originally failed; no blind promotion.
        if let Admission::Queue(reason) = self.evaluate(counts, entry.org_id, entry.agent_id).await? {
            tracing::debug!(entry_id = %entry.id, ?reason, "Oldest queued backup still blocked");
            return Ok(None);
        }

        if !self.has_promotion_consumer() {
            tracing::debug!(entry_id = %entry.id, "No consumer for promoted backups yet, leaving queued");
            return Ok(None);
        }

        entry.status = QueueStatus::Started;
        entry.started_at = Some(Utc::now());
        self.store.update_queue_entry(&entry).await.store_err()?;
        counts.increment(entry.org_id, entry.agent_id);

        if self.promotions.send(entry.clone()).is_err() {
            // Nobody will run it: hand the slot back and leave it queued.
            counts.decrement(entry.org_id, entry.agent_id);
            entry.status = QueueStatus::Queued;
            entry.started_at = None;
            self.store.update_queue_entry(&entry).await.store_err()?;
            tracing::warn!(entry_id = %entry.id, "No consumer for promoted backups");
            return Ok(None);
        }

        tracing::info!(
            entry_id = %entry.id,
            %org_id,
            agent_id = %entry.agent_id,
            schedule_id = %entry.schedule_id,
            "Queued backup promoted"
        );
        Ok(Some(entry))
    }

    /// The receiver has been taken and is still alive.
    fn has_promotion_consumer(&self) -> bool {
        let parked = self.promotions_rx.lock().is_some();
        !parked && !self.promotions.is_closed()
    }

    async fn running_for_org(&self, counts: &RunningCounts, org_id: Uuid) -> u32 {
        let in_memory = counts.org.get(&org_id).copied().unwrap_or(0);
        match self.store.count_running_backups_by_org(org_id).await {
            Ok(persisted) => persisted.max(in_memory),
            Err(e) => {
                tracing::warn!(%org_id, error = %e, "Running count unavailable, using in-memory count");
                in_memory
            }
        }
    }

    async fn running_for_agent(&self, counts: &RunningCounts, agent_id: Uuid) -> u32 {
        let in_memory = counts.agent.get(&agent_id).copied().unwrap_or(0);
        match self.store.count_running_backups_by_agent(agent_id).await {
            Ok(persisted) => persisted.max(in_memory),
            Err(e) => {
                tracing::warn!(%agent_id, error = %e, "Running count unavailable, using in-memory count");
                in_memory
            }
        }
    }
}

/// `None` and 0 both mean unlimited.
fn effective_limit(limit: Option<u32>) -> Option<u32> {
    limit.filter(|l| *l > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use crate::domain::{Agent, Organization};
    use crate::notify::MemoryNotifier;

    struct Fixture {
        store: Arc<MemoryStore>,
        org_id: Uuid,
    }

    impl Fixture {
        fn new(org_limit: Option<u32>) -> Self {
            let store = Arc::new(MemoryStore::new());
            let org_id = Uuid::new_v4();
            store.insert_organization(Organization {
                id: org_id,
                name: "acme".into(),
                max_concurrent_backups: org_limit,
            });
            Self { store, org_id }
        }

        fn agent(&self, limit: Option<u32>) -> Uuid {
            let id = Uuid::new_v4();
            self.store.insert_agent(Agent {
                id,
                org_id: self.org_id,
                hostname: format!("host-{id}"),
                max_concurrent_backups: limit,
                network_mounts: vec![],
            });
            id
        }

        fn manager(&self) -> ConcurrencyManager {
            ConcurrencyManager::new(Arc::clone(&self.store) as Arc<dyn ConcurrencyStore>)
        }
    }

    #[tokio::test]
    async fn test_unlimited_always_admits() {
        let fx = Fixture::new(Some(0));
        let agent = fx.agent(None);
        let manager = fx.manager();
        for _ in 0..5 {
            let got = manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap();
            assert!(matches!(got, SlotAcquisition::Acquired));
        }
        assert_eq!(manager.running_count_for_org(fx.org_id).await, 5);
    }

    #[tokio::test]
    async fn test_org_limit_queues() {
        let fx = Fixture::new(Some(1));
        let a = fx.agent(None);
        let b = fx.agent(None);
        let manager = fx.manager();

        assert!(matches!(
            manager.acquire_slot(fx.org_id, a, Uuid::new_v4()).await.unwrap(),
            SlotAcquisition::Acquired
        ));
        let decision = manager.can_start_backup(fx.org_id, b).await.unwrap();
        assert_eq!(
            decision,
            Admission::Queue(QueueReason::OrgLimit { limit: 1, running: 1 })
        );
        assert!(decision.should_queue());

        let SlotAcquisition::Queued(entry) =
            manager.acquire_slot(fx.org_id, b, Uuid::new_v4()).await.unwrap()
        else {
            panic!("expected the second backup to queue");
        };
        assert_eq!(entry.queue_position, 1);
        assert_eq!(entry.status, QueueStatus::Queued);
    }

    #[tokio::test]
    async fn test_agent_limit_overrides_org() {
        let fx = Fixture::new(Some(10));
        let agent = fx.agent(Some(1));
        let other = fx.agent(None);
        let manager = fx.manager();

        manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap();
        assert_eq!(
            manager.can_start_backup(fx.org_id, agent).await.unwrap(),
            Admission::Queue(QueueReason::AgentLimit { limit: 1, running: 1 })
        );
        assert!(manager.can_start_backup(fx.org_id, other).await.unwrap().can_start());
    }

    #[tokio::test]
    async fn test_release_promotes_one_entry_in_fifo_order() {
        let fx = Fixture::new(Some(1));
        let agent = fx.agent(None);
        let manager = fx.manager();
        let mut promotions = manager.take_promotions().unwrap();

        manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap();
        let mut queued = Vec::new();
        for _ in 0..3 {
            match manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap() {
                SlotAcquisition::Queued(entry) => queued.push(entry),
                SlotAcquisition::Acquired => panic!("limit is 1"),
            }
        }

        let promoted = manager.release_slot(fx.org_id, agent).await.unwrap().unwrap();
        assert_eq!(promoted.id, queued[0].id);
        assert_eq!(promotions.try_recv().unwrap().id, queued[0].id);
        assert!(promotions.try_recv().is_err());

        // The promoted entry holds the slot: nothing else moves.
        assert_eq!(manager.running_count_for_org(fx.org_id).await, 1);
        assert_eq!(manager.get_queued_backups(fx.org_id).await.unwrap().len(), 2);

        let promoted = manager.release_slot(fx.org_id, agent).await.unwrap().unwrap();
        assert_eq!(promoted.id, queued[1].id);
    }

    #[tokio::test]
    async fn test_no_promotion_before_receiver_is_taken() {
        let fx = Fixture::new(Some(1));
        let agent = fx.agent(None);
        let manager = fx.manager();

        manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap();
        let SlotAcquisition::Queued(entry) =
            manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap()
        else {
            panic!("limit is 1");
        };

        assert!(manager.release_slot(fx.org_id, agent).await.unwrap().is_none());
        assert_eq!(manager.running_count_for_org(fx.org_id).await, 0);
        let queued = manager.get_queued_backups(fx.org_id).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, QueueStatus::Queued);

        // Once someone listens, the next release hands it out.
        let mut promotions = manager.take_promotions().unwrap();
        let promoted = manager.release_slot(fx.org_id, agent).await.unwrap().unwrap();
        assert_eq!(promoted.id, entry.id);
        assert_eq!(promotions.try_recv().unwrap().id, entry.id);
        assert_eq!(manager.running_count_for_org(fx.org_id).await, 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_leaves_entry_queued() {
        let fx = Fixture::new(Some(1));
        let agent = fx.agent(None);
        let manager = fx.manager();
        drop(manager.take_promotions());

        manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap();
        manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap();

        assert!(manager.release_slot(fx.org_id, agent).await.unwrap().is_none());
        assert_eq!(manager.running_count_for_org(fx.org_id).await, 0);
        assert_eq!(manager.get_queued_backups(fx.org_id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_acquires_respect_org_limit() {
        const CALLERS: usize = 16;
        const LIMIT: u32 = 3;

        let fx = Fixture::new(Some(LIMIT));
        let agents: Vec<Uuid> = (0..CALLERS).map(|_| fx.agent(None)).collect();
        let manager = Arc::new(fx.manager());
        let start = Arc::new(tokio::sync::Barrier::new(CALLERS));

        let handles: Vec<_> = agents
            .into_iter()
            .map(|agent| {
                let manager = Arc::clone(&manager);
                let start = Arc::clone(&start);
                let org_id = fx.org_id;
                tokio::spawn(async move {
                    start.wait().await;
                    manager.acquire_slot(org_id, agent, Uuid::new_v4()).await
                })
            })
            .collect();

        let mut acquired = 0;
        let mut queued = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                SlotAcquisition::Acquired => acquired += 1,
                SlotAcquisition::Queued(_) => queued += 1,
            }
        }

        assert_eq!(acquired, LIMIT as usize);
        assert_eq!(queued, CALLERS - LIMIT as usize);
        assert_eq!(manager.running_count_for_org(fx.org_id).await, LIMIT);
        assert_eq!(
            manager.get_queued_backups(fx.org_id).await.unwrap().len(),
            CALLERS - LIMIT as usize
        );
    }

    #[tokio::test]
    async fn test_release_never_goes_negative() {
        let fx = Fixture::new(Some(1));
        let agent = fx.agent(None);
        let manager = fx.manager();

        assert!(manager.release_slot(fx.org_id, agent).await.unwrap().is_none());
        assert_eq!(manager.running_count_for_org(fx.org_id).await, 0);
        assert!(matches!(
            manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap(),
            SlotAcquisition::Acquired
        ));
    }

    #[tokio::test]
    async fn test_cancel_and_sync() {
        let fx = Fixture::new(Some(1));
        let agent = fx.agent(None);
        let manager = fx.manager();

        manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap();
        let SlotAcquisition::Queued(entry) =
            manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap()
        else {
            panic!("expected queue");
        };

        manager.cancel_queued_backup(entry.id).await.unwrap();
        assert!(manager.cancel_queued_backup(entry.id).await.is_err());
        assert!(manager.get_queued_backups(fx.org_id).await.unwrap().is_empty());

        let status = manager.get_concurrency_status(fx.org_id).await.unwrap();
        assert_eq!(status.running, 1);
        assert_eq!(status.queued, 0);

        manager.sync_running_counts().await;
        assert_eq!(manager.running_count_for_org(fx.org_id).await, 0);
    }

    #[tokio::test]
    async fn test_queue_notification_failure_does_not_fail_enqueue() {
        let fx = Fixture::new(Some(1));
        let agent = fx.agent(None);
        let notifier = Arc::new(MemoryNotifier::failing());
        let manager = fx
            .manager()
            .with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>, true);

        manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap();
        let got = manager.acquire_slot(fx.org_id, agent, Uuid::new_v4()).await.unwrap();
        assert!(matches!(got, SlotAcquisition::Queued(_)));
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_organization_is_error() {
        let fx = Fixture::new(None);
        let manager = fx.manager();
        let err = manager
            .acquire_slot(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { kind: "organization", .. }));
    }
}
