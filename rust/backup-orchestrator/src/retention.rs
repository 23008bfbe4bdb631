//! Periodic retention enforcement.
//!
//! Backups already apply their schedule's policy to the repository they
//! wrote to. The enforcer sweeps every enabled target of every enabled
//! schedule on an interval, which catches repositories whose post-backup
//! forget failed or that were never written to since the policy changed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backup_adapter::BackupTool;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::database::ScheduleStore;
use crate::domain::Schedule;
use crate::error::{OrchestratorError, Result, StoreResultExt};
use crate::logging::OpTimer;

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionSummary {
    /// Schedules with a non-empty policy.
    pub schedules: usize,
    pub repositories_succeeded: usize,
    pub repositories_failed: usize,
    pub snapshots_removed: usize,
}

/// Applies schedule retention policies to their repositories.
pub struct RetentionEnforcer {
    store: Arc<dyn ScheduleStore>,
    tool: Arc<dyn BackupTool>,
    credentials: Credentials,
    interval: Duration,
    running: AtomicBool,
}

impl std::fmt::Debug for RetentionEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionEnforcer")
            .field("interval", &self.interval)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl RetentionEnforcer {
    /// A zero `interval` disables the periodic pass; [`Self::enforce`]
    /// still works on demand.
    #[must_use]
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        tool: Arc<dyn BackupTool>,
        credentials: Credentials,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            tool,
            credentials,
            interval,
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Spawn the periodic pass. The first pass runs one interval after start.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::AlreadyRunning`] on a second start.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if !self.is_enabled() {
            tracing::info!("Retention enforcement disabled");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyRunning("retention enforcer"));
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.enforce().await {
                            tracing::error!(error = %e, "Retention pass failed");
                        }
                    }
                }
            }
            this.running.store(false, Ordering::SeqCst);
            tracing::info!("Retention enforcer stopped");
        });
        tracing::info!(interval_secs = self.interval.as_secs(), "Retention enforcer started");
        Ok(())
    }

    /// Run one pass over every enabled schedule.
    ///
    /// # Errors
    ///
    /// Only when the enabled schedules cannot be loaded. Per-repository
    /// failures are counted in the summary.
    pub async fn enforce(&self) -> Result<RetentionSummary> {
        let schedules = self.store.get_enabled_schedules().await.store_err()?;
        let timer = OpTimer::new("retention", "enforce retention policies");

        let mut summary = RetentionSummary::default();
        for schedule in &schedules {
            if schedule.retention_policy.as_ref().is_none_or(|p| p.is_empty()) {
                continue;
            }
            summary.schedules += 1;
            self.enforce_schedule(schedule, &mut summary)
                .instrument(tracing::info_span!("retention", schedule_id = %schedule.id))
                .await;
        }

        timer.finish();
        tracing::info!(
            schedules = summary.schedules,
            succeeded = summary.repositories_succeeded,
            failed = summary.repositories_failed,
            removed = summary.snapshots_removed,
            "Retention pass finished"
        );
        Ok(summary)
    }

    /// Repositories of one schedule are independent and swept concurrently.
    async fn enforce_schedule(&self, schedule: &Schedule, summary: &mut RetentionSummary) {
        let targets: Vec<Uuid> = schedule
            .enabled_repositories()
            .into_iter()
            .map(|target| target.repository_id)
            .collect();
        let results = join_all(
            targets
                .iter()
                .map(|repository_id| self.enforce_repository(schedule, *repository_id)),
        )
        .await;

        for (repository_id, result) in targets.iter().zip(results) {
            match result {
                Ok(removed) => {
                    summary.repositories_succeeded += 1;
                    summary.snapshots_removed += removed;
                }
                Err(e) => {
                    tracing::warn!(%repository_id, error = %e, "Failed to enforce retention");
                    summary.repositories_failed += 1;
                }
            }
        }
    }

    async fn enforce_repository(&self, schedule: &Schedule, repository_id: Uuid) -> Result<usize> {
        let Some(policy) = schedule.retention_policy.as_ref() else {
            return Ok(0);
        };
        let repository = self
            .store
            .get_repository(repository_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("repository", repository_id))?;
        let config = self.credentials.resolve(&repository)?;
        let result = self.tool.forget(&config, policy, true).await?;
        tracing::debug!(
            repository = %repository.name,
            kept = result.snapshots_kept,
            removed = result.snapshots_removed,
            "Retention applied"
        );
        Ok(result.snapshots_removed)
    }
}
