//! Scheduled disaster-recovery tests.
//!
//! A DR test restores the latest snapshot of the runbook's backup schedule
//! (from its primary repository) into a scratch directory. A test that
//! cannot run is a failed test on record, never a silent skip.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backup_adapter::{BackupTool, RestoreOptions};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::database::DrTestStore;
use crate::domain::DrTest;
use crate::error::{OrchestratorError, Result, StoreResultExt};
use crate::logging::OpTimer;
use crate::notify::{LogNotifier, Notification, Notifier, notify_best_effort};
use crate::restore::{latest_snapshot, scratch_dir};
use crate::scheduler::{CronJob, CronSource, CronTable, ReloadSummary};

/// Runs DR tests.
pub struct DrTestExecutor {
    store: Arc<dyn DrTestStore>,
    tool: Arc<dyn BackupTool>,
    credentials: Credentials,
    notifier: Arc<dyn Notifier>,
    restore_root: Option<PathBuf>,
}

impl std::fmt::Debug for DrTestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrTestExecutor")
            .field("credentials", &self.credentials)
            .field("restore_root", &self.restore_root)
            .finish_non_exhaustive()
    }
}

impl DrTestExecutor {
    #[must_use]
    pub fn new(store: Arc<dyn DrTestStore>, tool: Arc<dyn BackupTool>, credentials: Credentials) -> Self {
        Self {
            store,
            tool,
            credentials,
            notifier: Arc::new(LogNotifier),
            restore_root: None,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_restore_root(mut self, root: Option<PathBuf>) -> Self {
        self.restore_root = root;
        self
    }

    /// Test `runbook_id` now and return the finished record.
    ///
    /// # Errors
    ///
    /// Store failures creating or finalizing the record.
    pub async fn execute_dr_test(&self, runbook_id: Uuid, schedule_id: Option<Uuid>) -> Result<DrTest> {
        let span = tracing::info_span!("dr_test", %runbook_id);
        async move {
            let mut test = DrTest::new(runbook_id, schedule_id);
            self.store.create_dr_test(&test).await.store_err()?;
            test.start();
            self.store.update_dr_test(&test).await.store_err()?;

            let mut runbook_name = None;
            if let Err(e) = self.run(runbook_id, &mut test, &mut runbook_name).await {
                tracing::error!(test_id = %test.id, error = %e, "DR test failed");
                test.fail(e.to_string());
            }
            self.store.update_dr_test(&test).await.store_err()?;

            notify_best_effort(
                self.notifier.as_ref(),
                Notification::DrTestFinished {
                    runbook_id,
                    runbook_name: runbook_name.unwrap_or_else(|| runbook_id.to_string()),
                    test_id: test.id,
                    passed: test.verification_passed == Some(true),
                    error: test.error_message.clone(),
                },
            )
            .await;
            Ok(test)
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        runbook_id: Uuid,
        test: &mut DrTest,
        runbook_name: &mut Option<String>,
    ) -> Result<()> {
        let runbook = self
            .store
            .get_runbook(runbook_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("runbook", runbook_id))?;
        *runbook_name = Some(runbook.name.clone());
        let schedule_id = runbook.schedule_id.ok_or_else(|| {
            OrchestratorError::Config(format!("runbook '{}' references no backup schedule", runbook.name))
        })?;
        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("schedule", schedule_id))?;
        let primary = schedule.primary_repository().ok_or_else(|| {
            OrchestratorError::Config(format!(
                "schedule '{}' has no enabled primary repository",
                schedule.name
            ))
        })?;
        let repository = self
            .store
            .get_repository(primary.repository_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("repository", primary.repository_id))?;
        let config = self.credentials.resolve(&repository)?;

        let snapshots = self.tool.snapshots(&config).await?;
        let snapshot = latest_snapshot(&snapshots)
            .ok_or_else(|| OrchestratorError::Verification("repository has no snapshots".into()))?;
        test.snapshot_id = Some(snapshot.id.clone());

        let scratch = scratch_dir(self.restore_root.as_deref(), "dr-test-")
            .map_err(|e| OrchestratorError::Internal(format!("cannot create scratch directory: {e}")))?;
        let timer = OpTimer::new("dr_test", format!("restore {} from {}", snapshot.id, repository.name));
        let result = self
            .tool
            .restore(&config, &snapshot.id, scratch.path(), &RestoreOptions::default())
            .await;
        let duration_ms = timer.finish_with_result(result.as_ref());
        let summary = result?;

        test.complete(summary.files_restored, summary.bytes_restored, duration_ms);
        tracing::info!(
            snapshot_id = %snapshot.id,
            files_restored = summary.files_restored,
            bytes_restored = summary.bytes_restored,
            "DR test passed"
        );
        Ok(())
    }
}

#[async_trait]
impl CronJob for DrTestExecutor {
    fn kind(&self) -> &'static str {
        "DR test scheduler"
    }

    async fn load_enabled(&self) -> Result<Vec<CronSource>> {
        let schedules = self.store.get_enabled_dr_test_schedules().await.store_err()?;
        Ok(schedules
            .into_iter()
            .map(|s| CronSource::new(s.id, s.cron_expression))
            .collect())
    }

    async fn run(&self, id: Uuid) {
        let schedule = match self.store.get_dr_test_schedule(id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                tracing::warn!(schedule_id = %id, "Fired DR test schedule no longer exists");
                return;
            }
            Err(e) => {
                tracing::error!(schedule_id = %id, error = %e, "Failed to load DR test schedule");
                return;
            }
        };
        if let Err(e) = self.execute_dr_test(schedule.runbook_id, Some(schedule.id)).await {
            tracing::error!(schedule_id = %id, error = %e, "DR test could not be recorded");
        }
    }
}

/// Cron-driven front of [`DrTestExecutor`].
#[derive(Debug)]
pub struct DrTestScheduler {
    table: Arc<CronTable<DrTestExecutor>>,
}

impl DrTestScheduler {
    #[must_use]
    pub fn new(executor: DrTestExecutor, reload_interval: Duration) -> Self {
        Self {
            table: Arc::new(CronTable::new(Arc::new(executor), reload_interval)),
        }
    }

    #[must_use]
    pub fn table(&self) -> &Arc<CronTable<DrTestExecutor>> {
        &self.table
    }

    /// # Errors
    ///
    /// [`OrchestratorError::AlreadyRunning`] on a second start, or a failed
    /// initial reload.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.table.start(cancel).await
    }

    /// # Errors
    ///
    /// Only when the enabled schedules cannot be loaded.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        self.table.reload().await
    }

    /// Test a runbook now, outside any schedule.
    ///
    /// # Errors
    ///
    /// See [`DrTestExecutor::execute_dr_test`].
    pub async fn run_now(&self, runbook_id: Uuid) -> Result<DrTest> {
        self.table.job().execute_dr_test(runbook_id, None).await
    }
}
