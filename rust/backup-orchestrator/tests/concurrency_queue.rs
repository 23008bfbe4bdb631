//! Admission limits, the FIFO backup queue and promotion through the
//! scheduler.

mod common;

use std::sync::Arc;
use std::time::Duration;

use backup_orchestrator::domain::{JobStatus, QueueStatus};
use backup_orchestrator::notify::MemoryNotifier;
use backup_orchestrator::{
    BackupExecutor, BackupScheduler, ConcurrencyManager, ExecutionOutcome, Notification,
    SlotAcquisition,
};
use common::{Fleet, credentials};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn manager(fleet: &Fleet) -> Arc<ConcurrencyManager> {
    Arc::new(ConcurrencyManager::new(fleet.store.clone()))
}

fn executor(fleet: &Fleet, manager: &Arc<ConcurrencyManager>) -> BackupExecutor {
    BackupExecutor::new(fleet.store.clone(), fleet.tool.clone(), credentials())
        .with_concurrency(Arc::clone(manager))
}

#[tokio::test]
async fn test_backup_over_org_limit_is_queued_without_record() {
    let fleet = Fleet::new(Some(1));
    let repo = fleet.add_repository("/srv/restic");
    let schedule = fleet.add_schedule(&[repo]);
    let notifier = Arc::new(MemoryNotifier::new());
    let manager = Arc::new(
        ConcurrencyManager::new(fleet.store.clone()).with_notifier(notifier.clone(), true),
    );

    // Another backup of the organization is running.
    let other_agent = fleet.add_agent(None, vec![]);
    let held = manager
        .acquire_slot(fleet.org_id, other_agent, Uuid::new_v4())
        .await
        .unwrap();
    assert!(matches!(held, SlotAcquisition::Acquired));

    let outcome = executor(&fleet, &manager).execute_backup(&schedule).await;

    let ExecutionOutcome::Queued(entry) = outcome else {
        panic!("expected the backup to be queued");
    };
    assert_eq!(entry.schedule_id, schedule.id);
    assert_eq!(entry.queue_position, 1);
    assert!(fleet.store.backups().is_empty());
    assert!(fleet.tool.calls().is_empty());

    let queued = manager.get_queued_backups(fleet.org_id).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert!(notifier.sent().iter().any(|n| matches!(
        n,
        Notification::BackupQueued { queue_position: Some(1), .. }
    )));
}

#[tokio::test]
async fn test_agent_limit_overrides_org_limit() {
    let fleet = Fleet::new(Some(5));
    let agent = fleet.add_agent(Some(1), vec![]);
    let repo = fleet.add_repository("/srv/restic");
    let schedule = fleet.add_schedule_for(agent, &[repo]);
    let manager = manager(&fleet);

    manager
        .acquire_slot(fleet.org_id, agent, Uuid::new_v4())
        .await
        .unwrap();
    let outcome = executor(&fleet, &manager).execute_backup(&schedule).await;
    assert!(matches!(outcome, ExecutionOutcome::Queued(_)));

    // The org still has room for other agents.
    let other = fleet.add_schedule(&[repo]);
    let outcome = executor(&fleet, &manager).execute_backup(&other).await;
    assert!(matches!(outcome, ExecutionOutcome::Ran(_)));
}

#[tokio::test]
async fn test_admitted_backup_releases_its_slot() {
    let fleet = Fleet::new(Some(1));
    let repo = fleet.add_repository("/srv/restic");
    let schedule = fleet.add_schedule(&[repo]);
    let manager = manager(&fleet);

    let outcome = executor(&fleet, &manager).execute_backup(&schedule).await;
    assert!(matches!(outcome, ExecutionOutcome::Ran(_)));
    assert_eq!(manager.running_count_for_org(fleet.org_id).await, 0);

    // A second firing is admitted again.
    let outcome = executor(&fleet, &manager).execute_backup(&schedule).await;
    assert!(matches!(outcome, ExecutionOutcome::Ran(_)));
    assert_eq!(fleet.store.backups().len(), 2);
}

#[tokio::test]
async fn test_release_promotes_one_entry_in_fifo_order() {
    let fleet = Fleet::new(Some(1));
    let repo = fleet.add_repository("/srv/restic");
    let manager = manager(&fleet);
    let mut promotions = manager.take_promotions().unwrap();

    let holder = fleet.add_agent(None, vec![]);
    manager
        .acquire_slot(fleet.org_id, holder, Uuid::new_v4())
        .await
        .unwrap();

    let executor = executor(&fleet, &manager);
    let mut queued = Vec::new();
    for _ in 0..3 {
        let schedule = fleet.add_schedule(&[repo]);
        let ExecutionOutcome::Queued(entry) = executor.execute_backup(&schedule).await else {
            panic!("expected queueing");
        };
        queued.push(entry);
    }
    let positions: Vec<_> = queued.iter().map(|e| e.queue_position).collect();
    assert_eq!(positions, vec![1, 2, 3]);

    let promoted = manager
        .release_slot(fleet.org_id, holder)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(promoted.id, queued[0].id);
    assert_eq!(promotions.try_recv().unwrap().id, queued[0].id);
    // One release, one promotion.
    assert!(promotions.try_recv().is_err());
    assert_eq!(manager.get_queued_backups(fleet.org_id).await.unwrap().len(), 2);

    // The promoted entry runs with its slot and frees it for the next one.
    let outcome = executor.execute_promoted(promoted).await;
    assert!(matches!(outcome, ExecutionOutcome::Ran(_)));
    assert_eq!(promotions.try_recv().unwrap().id, queued[1].id);
    assert!(promotions.try_recv().is_err());

    let statuses: Vec<_> = fleet
        .store
        .queue_entries()
        .into_iter()
        .map(|e| (e.id, e.status))
        .collect();
    assert!(statuses.contains(&(queued[0].id, QueueStatus::Started)));
    assert!(statuses.contains(&(queued[1].id, QueueStatus::Started)));
    assert!(statuses.contains(&(queued[2].id, QueueStatus::Queued)));
}

#[tokio::test]
async fn test_promoted_backup_of_disabled_schedule_releases_slot() {
    let fleet = Fleet::new(Some(1));
    let repo = fleet.add_repository("/srv/restic");
    let mut schedule = fleet.add_schedule(&[repo]);
    let manager = manager(&fleet);
    let mut promotions = manager.take_promotions().unwrap();

    let holder = fleet.add_agent(None, vec![]);
    manager
        .acquire_slot(fleet.org_id, holder, Uuid::new_v4())
        .await
        .unwrap();
    let executor = executor(&fleet, &manager);
    assert!(matches!(
        executor.execute_backup(&schedule).await,
        ExecutionOutcome::Queued(_)
    ));

    schedule.enabled = false;
    fleet.save(&schedule);
    manager.release_slot(fleet.org_id, holder).await.unwrap();
    let entry = promotions.try_recv().unwrap();

    let outcome = executor.execute_promoted(entry).await;
    assert!(matches!(outcome, ExecutionOutcome::Skipped(_)));
    assert_eq!(manager.running_count_for_org(fleet.org_id).await, 0);
    assert!(fleet.store.backups().is_empty());
}

#[tokio::test]
async fn test_admission_error_records_failed_backup() {
    let fleet = Fleet::new(Some(1));
    let repo = fleet.add_repository("/srv/restic");
    // Agent unknown to the store.
    let schedule = fleet.add_schedule_for(Uuid::new_v4(), &[repo]);
    let manager = manager(&fleet);

    let outcome = executor(&fleet, &manager).execute_backup(&schedule).await;

    let ExecutionOutcome::Failed { backup: Some(backup), error } = outcome else {
        panic!("expected a recorded failure");
    };
    assert!(error.contains("not found"));
    assert_eq!(backup.status, JobStatus::Failed);
    assert_eq!(fleet.store.backups().len(), 1);
}

#[tokio::test]
async fn test_scheduler_runs_promoted_backups() {
    let fleet = Fleet::new(Some(1));
    let repo = fleet.add_repository("/srv/restic");
    let schedule = fleet.add_schedule(&[repo]);
    let manager = manager(&fleet);
    let scheduler = BackupScheduler::new(executor(&fleet, &manager), Duration::from_secs(60));
    let cancel = CancellationToken::new();
    scheduler.start(cancel.clone()).await.unwrap();

    let holder = fleet.add_agent(None, vec![]);
    manager
        .acquire_slot(fleet.org_id, holder, Uuid::new_v4())
        .await
        .unwrap();
    assert!(matches!(
        scheduler.executor().execute_backup(&schedule).await,
        ExecutionOutcome::Queued(_)
    ));

    manager.release_slot(fleet.org_id, holder).await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let backups = fleet.store.backups();
            if backups.iter().any(|b| b.status == JobStatus::Completed) {
                return backups;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("promoted backup never ran");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].schedule_id, schedule.id);

    cancel.cancel();
}
