//! Scheduled repository verification.
//!
//! A verification either runs the backup tool's integrity check (optionally
//! reading pack data) or restores the latest snapshot into a scratch
//! directory that is removed afterwards whatever the outcome. Consecutive
//! failures only notify once they reach the configured threshold.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backup_adapter::{BackupTool, CheckOptions, ResticConfig, RestoreOptions};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::database::VerificationStore;
use crate::domain::{Repository, Verification, VerificationDetails, VerificationType};
use crate::error::{OrchestratorError, Result, StoreResultExt};
use crate::logging::OpTimer;
use crate::notify::{LogNotifier, Notification, Notifier, notify_best_effort};
use crate::restore::{latest_snapshot, scratch_dir};
use crate::scheduler::{CronJob, CronSource, CronTable, ReloadSummary};

/// What to verify; a schedule, or a manual request.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub repository_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub verification_type: VerificationType,
    pub read_data_subset: Option<String>,
}

/// Runs verifications.
pub struct VerificationExecutor {
    store: Arc<dyn VerificationStore>,
    tool: Arc<dyn BackupTool>,
    credentials: Credentials,
    notifier: Arc<dyn Notifier>,
    failure_alert_threshold: u32,
    temp_root: Option<PathBuf>,
}

impl std::fmt::Debug for VerificationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationExecutor")
            .field("failure_alert_threshold", &self.failure_alert_threshold)
            .field("temp_root", &self.temp_root)
            .finish_non_exhaustive()
    }
}

impl VerificationExecutor {
    #[must_use]
    pub fn new(
        store: Arc<dyn VerificationStore>,
        tool: Arc<dyn BackupTool>,
        credentials: Credentials,
    ) -> Self {
        Self {
            store,
            tool,
            credentials,
            notifier: Arc::new(LogNotifier),
            failure_alert_threshold: 3,
            temp_root: None,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Consecutive failures needed before a notification; at least 1.
    #[must_use]
    pub fn with_failure_alert_threshold(mut self, threshold: u32) -> Self {
        self.failure_alert_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_temp_root(mut self, root: Option<PathBuf>) -> Self {
        self.temp_root = root;
        self
    }

    /// Run one verification and return its finished record.
    ///
    /// # Errors
    ///
    /// Store failures creating or finalizing the record. Everything else is
    /// recorded as a failed verification.
    pub async fn execute_verification(&self, request: VerificationRequest) -> Result<Verification> {
        let span = tracing::info_span!(
            "verification",
            repository_id = %request.repository_id,
            verification_type = %request.verification_type,
        );
        async move {
            let mut verification = Verification::start(
                request.repository_id,
                request.schedule_id,
                request.verification_type,
            );
            self.store.create_verification(&verification).await.store_err()?;

            let mut details = VerificationDetails {
                read_data_subset: request.read_data_subset.clone(),
                ..VerificationDetails::default()
            };
            let timer = OpTimer::new("verification", request.verification_type.to_string());
            let result = self.run(&request, &mut details).await;
            timer.finish_with_result(result.as_ref());

            verification.finish(details, result.err().map(|e| e.to_string()));
            self.store.update_verification(&verification).await.store_err()?;

            if !verification.passed() {
                self.check_failure_threshold(&verification).await;
            }
            Ok(verification)
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &VerificationRequest, details: &mut VerificationDetails) -> Result<()> {
        let repository = self.repository(request.repository_id).await?;
        let config = self.credentials.resolve(&repository)?;

        match request.verification_type {
            VerificationType::Check => self.check(&config, CheckOptions::default(), details).await,
            VerificationType::CheckReadData => {
                let options = CheckOptions {
                    read_data: request.read_data_subset.is_none(),
                    read_data_subset: request.read_data_subset.clone(),
                };
                self.check(&config, options, details).await
            }
            VerificationType::TestRestore => self.test_restore(&config, details).await,
        }
    }

    async fn repository(&self, repository_id: Uuid) -> Result<Repository> {
        self.store
            .get_repository(repository_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("repository", repository_id))
    }

    async fn check(
        &self,
        config: &ResticConfig,
        options: CheckOptions,
        details: &mut VerificationDetails,
    ) -> Result<()> {
        let result = self.tool.check(config, &options).await?;
        details.errors_found = result.errors;
        if result.success {
            return Ok(());
        }
        let first = details
            .errors_found
            .first()
            .map_or("repository check reported errors", String::as_str);
        Err(OrchestratorError::Verification(format!(
            "{} error(s) found: {first}",
            details.errors_found.len()
        )))
    }

    async fn test_restore(&self, config: &ResticConfig, details: &mut VerificationDetails) -> Result<()> {
        let snapshots = self.tool.snapshots(config).await?;
        let snapshot = latest_snapshot(&snapshots)
            .ok_or_else(|| OrchestratorError::Verification("repository has no snapshots".into()))?;
        details.snapshot_id = Some(snapshot.id.clone());

        // Removed on drop, on every path out of this function.
        let scratch = scratch_dir(self.temp_root.as_deref(), "verify-")
            .map_err(|e| OrchestratorError::Internal(format!("cannot create scratch directory: {e}")))?;

        let summary = self
            .tool
            .restore(config, &snapshot.id, scratch.path(), &RestoreOptions::default())
            .await?;
        details.files_restored = summary.files_restored;
        details.bytes_restored = summary.bytes_restored;
        tracing::info!(
            snapshot_id = %snapshot.id,
            files_restored = summary.files_restored,
            bytes_restored = summary.bytes_restored,
            "Test restore completed"
        );
        Ok(())
    }

    async fn check_failure_threshold(&self, verification: &Verification) {
        let failures = match self
            .store
            .get_consecutive_failed_verifications(verification.repository_id)
            .await
        {
            Ok(failures) => failures,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to count consecutive verification failures");
                return;
            }
        };

        tracing::warn!(
            consecutive_failures = failures,
            threshold = self.failure_alert_threshold,
            error = verification.error_message.as_deref().unwrap_or_default(),
            "Verification failed"
        );
        if failures < self.failure_alert_threshold {
            return;
        }

        let repository_name = match self.store.get_repository(verification.repository_id).await {
            Ok(Some(repository)) => repository.name,
            _ => verification.repository_id.to_string(),
        };
        notify_best_effort(
            self.notifier.as_ref(),
            Notification::VerificationFailing {
                repository_id: verification.repository_id,
                repository_name,
                consecutive_failures: failures,
                error: verification.error_message.clone().unwrap_or_default(),
            },
        )
        .await;
    }
}

#[async_trait]
impl CronJob for VerificationExecutor {
    fn kind(&self) -> &'static str {
        "verification scheduler"
    }

    async fn load_enabled(&self) -> Result<Vec<CronSource>> {
        let schedules = self
            .store
            .get_enabled_verification_schedules()
            .await
            .store_err()?;
        Ok(schedules
            .into_iter()
            .map(|s| CronSource::new(s.id, s.cron_expression))
            .collect())
    }

    async fn run(&self, id: Uuid) {
        let schedule = match self.store.get_verification_schedule(id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                tracing::warn!(schedule_id = %id, "Fired verification schedule no longer exists");
                return;
            }
            Err(e) => {
                tracing::error!(schedule_id = %id, error = %e, "Failed to load verification schedule");
                return;
            }
        };

        let request = VerificationRequest {
            repository_id: schedule.repository_id,
            schedule_id: Some(schedule.id),
            verification_type: schedule.verification_type,
            read_data_subset: schedule.read_data_subset,
        };
        if let Err(e) = self.execute_verification(request).await {
            tracing::error!(schedule_id = %id, error = %e, "Verification could not be recorded");
        }
    }
}

/// Cron-driven front of [`VerificationExecutor`].
#[derive(Debug)]
pub struct VerificationScheduler {
    table: Arc<CronTable<VerificationExecutor>>,
}

impl VerificationScheduler {
    #[must_use]
    pub fn new(executor: VerificationExecutor, reload_interval: Duration) -> Self {
        Self {
            table: Arc::new(CronTable::new(Arc::new(executor), reload_interval)),
        }
    }

    #[must_use]
    pub fn table(&self) -> &Arc<CronTable<VerificationExecutor>> {
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

    /// Verify a repository now, outside any schedule.
    ///
    /// # Errors
    ///
    /// See [`VerificationExecutor::execute_verification`].
    pub async fn run_now(
        &self,
        repository_id: Uuid,
        verification_type: VerificationType,
        read_data_subset: Option<String>,
    ) -> Result<Verification> {
        self.table
            .job()
            .execute_verification(VerificationRequest {
                repository_id,
                schedule_id: None,
                verification_type,
                read_data_subset,
            })
            .await
    }
}
