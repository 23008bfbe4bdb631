//! Scheduled backups.
//!
//! [`BackupExecutor`] is the unit of work: one firing of one schedule, from
//! preconditions through per-repository backups, replication and hook
//! scripts. [`BackupScheduler`] drives it from a [`CronTable`] and runs
//! backups promoted out of the concurrency queue.
//!
//! Outcomes of a firing:
//!
//! - a precondition that does not hold (blackout hour, maintenance window,
//!   mount with `skip`, failed blocking pre-script) creates no record
//! - a mount with `fail`, or an admission error, creates one failed record
//! - otherwise every enabled repository gets exactly one record

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backup_adapter::{BackupTool, ResticConfig};
use chrono::{DateTime, Timelike, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::cron::CronExpression;
use super::mounts::check_network_mounts;
use super::scripts::{ScriptContext, ScriptRunner, blocks_backup};
use super::table::{CronJob, CronSource, CronTable, ReloadSummary};
use crate::concurrency::{ConcurrencyManager, SlotAcquisition};
use crate::credentials::Credentials;
use crate::database::ScheduleStore;
use crate::domain::{
    Backup, BackupQueueEntry, BackupScript, JobStatus, MountUnavailableBehavior, Schedule,
    ScheduleScripts,
};
use crate::error::{OrchestratorError, Result, StoreResultExt};
use crate::logging::OpTimer;
use crate::maintenance::MaintenanceGate;
use crate::notify::{LogNotifier, Notification, Notifier, notify_best_effort};
use crate::validator::BackupValidator;

/// Upper bound on candidate runs inspected when skipping blackout hours.
const MAX_ALLOWED_RUN_CANDIDATES: usize = 10_000;

/// Why a firing ended without running any backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MountUnavailable,
    ExcludedHour(u32),
    MaintenanceWindow(String),
    /// Hook scripts could not be loaded; running without them could skip a
    /// pre-script that should have blocked the backup.
    ScriptsUnavailable,
    PreScriptFailed,
    ScheduleUnavailable,
}

/// Records produced by a firing that ran.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// One per enabled repository, in priority order.
    pub backups: Vec<Backup>,
    /// Repositories the source snapshot was copied into.
    pub replicated_to: Vec<Uuid>,
}

impl ExecutionReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.backups
            .iter()
            .filter(|b| b.status == JobStatus::Completed)
            .count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.backups.len() - self.succeeded()
    }
}

/// What one firing did.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Nothing recorded.
    Skipped(SkipReason),
    /// Deferred by the concurrency limits.
    Queued(BackupQueueEntry),
    /// The firing failed as a whole; `backup` is the record standing for it.
    Failed {
        backup: Option<Backup>,
        error: String,
    },
    Ran(ExecutionReport),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    org_id: Uuid,
    agent_id: Uuid,
}

/// Result of backing up into one repository.
struct RepoAttempt {
    backup: Backup,
    config: Option<ResticConfig>,
}

/// Runs backups for schedules.
pub struct BackupExecutor {
    store: Arc<dyn ScheduleStore>,
    tool: Arc<dyn BackupTool>,
    credentials: Credentials,
    scripts: ScriptRunner,
    notifier: Arc<dyn Notifier>,
    concurrency: Option<Arc<ConcurrencyManager>>,
    validator: Option<Arc<BackupValidator>>,
    maintenance: RwLock<Option<Arc<dyn MaintenanceGate>>>,
}

impl std::fmt::Debug for BackupExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupExecutor")
            .field("credentials", &self.credentials)
            .field("scripts", &self.scripts)
            .field("concurrency", &self.concurrency.is_some())
            .field("validator", &self.validator.is_some())
            .field("maintenance", &self.maintenance.read().is_some())
            .finish_non_exhaustive()
    }
}

impl BackupExecutor {
    #[must_use]
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        tool: Arc<dyn BackupTool>,
        credentials: Credentials,
    ) -> Self {
        Self {
            store,
            tool,
            credentials,
            scripts: ScriptRunner::default(),
            notifier: Arc::new(LogNotifier),
            concurrency: None,
            validator: None,
            maintenance: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_script_runner(mut self, scripts: ScriptRunner) -> Self {
        self.scripts = scripts;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Without a manager every firing runs immediately.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: Arc<ConcurrencyManager>) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<BackupValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Install or remove the gate that can hold back firings.
    pub fn set_maintenance_gate(&self, gate: Option<Arc<dyn MaintenanceGate>>) {
        *self.maintenance.write() = gate;
    }

    #[must_use]
    pub fn concurrency(&self) -> Option<&Arc<ConcurrencyManager>> {
        self.concurrency.as_ref()
    }

    /// Run one firing of `schedule`.
    pub async fn execute_backup(&self, schedule: &Schedule) -> ExecutionOutcome {
        let span = tracing::info_span!(
            "backup_execution",
            schedule_id = %schedule.id,
            agent_id = %schedule.agent_id,
        );
        self.execute(schedule, None).instrument(span).await
    }

    /// Run a backup promoted out of the queue. The entry already holds a slot.
    pub async fn execute_promoted(&self, entry: BackupQueueEntry) -> ExecutionOutcome {
        let span = tracing::info_span!(
            "backup_execution",
            schedule_id = %entry.schedule_id,
            agent_id = %entry.agent_id,
            queue_entry_id = %entry.id,
        );
        async move {
            let slot = Slot {
                org_id: entry.org_id,
                agent_id: entry.agent_id,
            };
            match self.store.get_schedule(entry.schedule_id).await {
                Ok(Some(schedule)) if schedule.enabled => self.execute(&schedule, Some(slot)).await,
                Ok(_) => {
                    tracing::warn!("Promoted backup's schedule is gone or disabled");
                    self.release(slot).await;
                    ExecutionOutcome::Skipped(SkipReason::ScheduleUnavailable)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load schedule of promoted backup");
                    self.release(slot).await;
                    ExecutionOutcome::Skipped(SkipReason::ScheduleUnavailable)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, schedule: &Schedule, held: Option<Slot>) -> ExecutionOutcome {
        if let Some(outcome) = self.check_preconditions(schedule).await {
            if let Some(slot) = held {
                self.release(slot).await;
            }
            return outcome;
        }

        let scripts = match self.store.get_enabled_scripts(schedule.id).await {
            Ok(scripts) => ScheduleScripts::from_scripts(scripts),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load backup scripts, aborting");
                if let Some(slot) = held {
                    self.release(slot).await;
                }
                return ExecutionOutcome::Skipped(SkipReason::ScriptsUnavailable);
            }
        };

        let slot = match held {
            Some(slot) => Some(slot),
            None => match self.acquire(schedule).await {
                ControlFlow::Continue(slot) => slot,
                ControlFlow::Break(outcome) => return outcome,
            },
        };

        let outcome = self.run_with_slot(schedule, &scripts).await;

        if let Some(slot) = slot {
            self.release(slot).await;
        }
        outcome
    }

    /// Mount, blackout and maintenance checks, in that order.
    async fn check_preconditions(&self, schedule: &Schedule) -> Option<ExecutionOutcome> {
        let unavailable = check_network_mounts(self.store.as_ref(), schedule).await;
        if !unavailable.is_empty() {
            let paths = unavailable
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Some(match schedule.on_mount_unavailable {
                MountUnavailableBehavior::Skip => {
                    tracing::warn!(paths = %paths, "Network mount unavailable, skipping backup");
                    ExecutionOutcome::Skipped(SkipReason::MountUnavailable)
                }
                MountUnavailableBehavior::Fail => {
                    self.fail_execution(schedule, format!("network mount unavailable: {paths}"))
                        .await
                }
            });
        }

        let hour = Utc::now().hour();
        if schedule.is_excluded_hour(hour) {
            tracing::info!(hour, "Current hour is excluded, skipping backup");
            return Some(ExecutionOutcome::Skipped(SkipReason::ExcludedHour(hour)));
        }

        let gate = self.maintenance.read().clone();
        if let Some(gate) = gate {
            if let Some(window) = self.active_maintenance(gate.as_ref(), schedule).await {
                tracing::info!(window = %window, "Maintenance window active, skipping backup");
                return Some(ExecutionOutcome::Skipped(SkipReason::MaintenanceWindow(window)));
            }
        }
        None
    }

    async fn active_maintenance(
        &self,
        gate: &dyn MaintenanceGate,
        schedule: &Schedule,
    ) -> Option<String> {
        // Without an org, only global windows can apply.
        let org_id = match self.store.get_agent(schedule.agent_id).await {
            Ok(Some(agent)) => agent.org_id,
            Ok(None) | Err(_) => Uuid::nil(),
        };
        gate.active_window(org_id, Utc::now())
            .await
            .map(|window| window.name)
    }

    async fn acquire(&self, schedule: &Schedule) -> ControlFlow<ExecutionOutcome, Option<Slot>> {
        let Some(concurrency) = &self.concurrency else {
            return ControlFlow::Continue(None);
        };

        let org_id = match self.store.get_agent(schedule.agent_id).await {
            Ok(Some(agent)) => agent.org_id,
            Ok(None) => {
                let message = format!("agent {} not found", schedule.agent_id);
                return ControlFlow::Break(self.fail_execution(schedule, message).await);
            }
            Err(e) => {
                let message = format!("agent lookup failed: {e}");
                return ControlFlow::Break(self.fail_execution(schedule, message).await);
            }
        };

        match concurrency
            .acquire_slot(org_id, schedule.agent_id, schedule.id)
            .await
        {
            Ok(SlotAcquisition::Acquired) => ControlFlow::Continue(Some(Slot {
                org_id,
                agent_id: schedule.agent_id,
            })),
            Ok(SlotAcquisition::Queued(entry)) => {
                tracing::info!(
                    queue_entry_id = %entry.id,
                    queue_position = entry.queue_position,
                    "Concurrency limit reached, backup queued"
                );
                ControlFlow::Break(ExecutionOutcome::Queued(entry))
            }
            Err(e) => {
                let message = format!("admission failed: {e}");
                ControlFlow::Break(self.fail_execution(schedule, message).await)
            }
        }
    }

    async fn release(&self, slot: Slot) {
        let Some(concurrency) = &self.concurrency else {
            return;
        };
        if let Err(e) = concurrency.release_slot(slot.org_id, slot.agent_id).await {
            tracing::error!(
                org_id = %slot.org_id,
                error = %e,
                "Failed to promote queued backup after release"
            );
        }
    }

    /// Record one failed backup for the whole firing, against the primary
    /// repository (or the first enabled one).
    async fn fail_execution(&self, schedule: &Schedule, message: String) -> ExecutionOutcome {
        let target = schedule
            .primary_repository()
            .or_else(|| schedule.enabled_repositories().into_iter().next());

        let Some(target) = target else {
            tracing::error!(error = %message, "Backup failed and schedule has no enabled repository to record it on");
            return ExecutionOutcome::Failed {
                backup: None,
                error: message,
            };
        };

        let mut backup = Backup::new(schedule.id, schedule.agent_id, target.repository_id);
        backup.fail(&message);
        if let Err(e) = self.store.create_backup(&backup).await {
            tracing::error!(backup_id = %backup.id, error = %e, "Failed to record failed backup");
        }
        tracing::error!(backup_id = %backup.id, error = %message, "Backup failed");
        ExecutionOutcome::Failed {
            backup: Some(backup),
            error: message,
        }
    }

    async fn run_with_slot(&self, schedule: &Schedule, scripts: &ScheduleScripts) -> ExecutionOutcome {
        let context = ScriptContext {
            schedule_id: schedule.id,
            schedule_name: schedule.name.clone(),
            error: None,
        };

        if let Some(script) = &scripts.pre_backup {
            match self.scripts.run(script, &context).await {
                Ok(output) => tracing::debug!(output = %output.trim(), "Pre-backup script finished"),
                Err(e) if blocks_backup(script) => {
                    tracing::warn!(error = %e, "Pre-backup script failed, aborting backup");
                    return ExecutionOutcome::Skipped(SkipReason::PreScriptFailed);
                }
                Err(e) => tracing::warn!(error = %e, "Pre-backup script failed, continuing"),
            }
        }

        let targets = schedule.enabled_repositories();
        if targets.is_empty() {
            tracing::info!("Schedule has no enabled repositories");
            return ExecutionOutcome::Ran(ExecutionReport::default());
        }

        let mut attempts = Vec::with_capacity(targets.len());
        for (attempt, target) in targets.iter().enumerate() {
            attempts.push(
                self.run_backup_to_repo(schedule, target.repository_id, attempt)
                    .await,
            );
        }

        let mut report = ExecutionReport::default();
        let source = attempts.iter().find_map(|a| {
            let snapshot_id = a.backup.snapshot_id.as_deref()?;
            let config = a.config.as_ref()?;
            (a.backup.status == JobStatus::Completed).then_some((a.backup.repository_id, snapshot_id, config))
        });
        if let Some((repository_id, snapshot_id, config)) = source {
            report.replicated_to = self
                .replicate_to_other_repos(schedule, repository_id, snapshot_id, config)
                .await;
        }
        report.backups = attempts.into_iter().map(|a| a.backup).collect();

        let first_error = report
            .backups
            .iter()
            .find_map(|b| b.error_message.clone());
        self.run_post_scripts(scripts, context, first_error.clone()).await;

        let notification = match first_error {
            None => Notification::BackupSucceeded {
                schedule_id: schedule.id,
                schedule_name: schedule.name.clone(),
                agent_id: schedule.agent_id,
                repositories: report.backups.len(),
                snapshot_ids: report
                    .backups
                    .iter()
                    .filter_map(|b| b.snapshot_id.clone())
                    .collect(),
            },
            Some(error) => Notification::BackupFailed {
                schedule_id: schedule.id,
                schedule_name: schedule.name.clone(),
                agent_id: schedule.agent_id,
                succeeded: report.succeeded(),
                failed: report.failed(),
                error,
            },
        };
        notify_best_effort(self.notifier.as_ref(), notification).await;

        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            replicated = report.replicated_to.len(),
            "Backup execution finished"
        );
        ExecutionOutcome::Ran(report)
    }

    /// Back up into one repository. Never fails: the outcome is on the record.
    async fn run_backup_to_repo(
        &self,
        schedule: &Schedule,
        repository_id: Uuid,
        attempt: usize,
    ) -> RepoAttempt {
        let mut backup = Backup::new(schedule.id, schedule.agent_id, repository_id);
        let span = tracing::info_span!("repository", %repository_id, backup_id = %backup.id, attempt);

        async {
            if let Err(e) = self.store.create_backup(&backup).await {
                tracing::error!(error = %e, "Failed to create backup record");
                backup.fail(format!("failed to create backup record: {e}"));
                return RepoAttempt { backup, config: None };
            }

            match self.backup_to_repo(schedule, &mut backup).await {
                Ok(config) => {
                    self.apply_retention(schedule, &config).await;
                    self.validate(schedule, &backup, &config).await;
                    RepoAttempt {
                        backup,
                        config: Some(config),
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Backup to repository failed");
                    backup.fail(e.to_string());
                    if let Err(e) = self.store.update_backup(&backup).await {
                        tracing::error!(error = %e, "Failed to record backup failure");
                    }
                    RepoAttempt { backup, config: None }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn backup_to_repo(&self, schedule: &Schedule, backup: &mut Backup) -> Result<ResticConfig> {
        let repository = self
            .store
            .get_repository(backup.repository_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("repository", backup.repository_id))?;
        let config = self.credentials.resolve(&repository)?;

        backup.start();
        self.store.update_backup(backup).await.store_err()?;

        let timer = OpTimer::new("backup", format!("backup to {}", repository.name));
        let result = self
            .tool
            .backup(&config, &schedule.paths, &schedule.excludes, &schedule.backup_options())
            .await;
        timer.finish_with_result(result.as_ref());
        let stats = result?;

        backup.complete(&stats);
        self.store.update_backup(backup).await.store_err()?;
        tracing::info!(
            snapshot_id = %stats.snapshot_id,
            files_new = stats.files_new,
            files_changed = stats.files_changed,
            data_added = stats.data_added,
            "Backup completed"
        );
        Ok(config)
    }

    /// Forget and prune per the schedule's policy. Failures never reach the
    /// backup record.
    async fn apply_retention(&self, schedule: &Schedule, config: &ResticConfig) {
        let Some(policy) = schedule.retention_policy.as_ref().filter(|p| !p.is_empty()) else {
            return;
        };
        match self.tool.forget(config, policy, true).await {
            Ok(result) => tracing::info!(
                kept = result.snapshots_kept,
                removed = result.snapshots_removed,
                "Retention policy applied"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to apply retention policy"),
        }
    }

    async fn validate(&self, schedule: &Schedule, backup: &Backup, config: &ResticConfig) {
        let Some(validator) = &self.validator else {
            return;
        };
        if let Err(e) = validator.validate_backup(backup, config, &schedule.paths).await {
            tracing::warn!(error = %e, "Backup validation could not be recorded");
        }
    }

    /// Copy `snapshot_id` into every other enabled repository of the
    /// schedule. Each target is independent. Returns the targets copied to.
    async fn replicate_to_other_repos(
        &self,
        schedule: &Schedule,
        source_repository: Uuid,
        snapshot_id: &str,
        source: &ResticConfig,
    ) -> Vec<Uuid> {
        let mut copied = Vec::new();
        for target in schedule.enabled_repositories() {
            let repository_id = target.repository_id;
            if repository_id == source_repository {
                continue;
            }

            let repository = match self.store.get_repository(repository_id).await {
                Ok(Some(repository)) => repository,
                Ok(None) => {
                    tracing::warn!(%repository_id, "Replication target not found");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%repository_id, error = %e, "Failed to load replication target");
                    continue;
                }
            };
            let target_config = match self.credentials.resolve(&repository) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(%repository_id, error = %e, "Cannot reach replication target");
                    continue;
                }
            };

            let timer = OpTimer::new("replication", format!("copy {snapshot_id} to {}", repository.name));
            let result = self.tool.copy(source, &target_config, snapshot_id).await;
            timer.finish_with_result(result.as_ref());
            if result.is_ok() {
                copied.push(repository_id);
            }
        }
        copied
    }

    async fn run_post_scripts(
        &self,
        scripts: &ScheduleScripts,
        mut context: ScriptContext,
        error: Option<String>,
    ) {
        let failed = error.is_some();
        context.error = error;

        let outcome_script = if failed {
            scripts.post_failure.as_ref()
        } else {
            scripts.post_success.as_ref()
        };
        for script in [outcome_script, scripts.post_always.as_ref()].into_iter().flatten() {
            self.run_post_script(script, &context).await;
        }
    }

    async fn run_post_script(&self, script: &BackupScript, context: &ScriptContext) {
        match self.scripts.run(script, context).await {
            Ok(output) => tracing::debug!(
                script_type = %script.script_type,
                output = %output.trim(),
                "Post-backup script finished"
            ),
            Err(e) => tracing::warn!(
                script_type = %script.script_type,
                error = %e,
                "Post-backup script failed"
            ),
        }
    }
}

#[async_trait]
impl CronJob for BackupExecutor {
    fn kind(&self) -> &'static str {
        "backup scheduler"
    }

    async fn load_enabled(&self) -> Result<Vec<CronSource>> {
        let schedules = self.store.get_enabled_schedules().await.store_err()?;
        Ok(schedules
            .into_iter()
            .map(|s| CronSource::new(s.id, s.cron_expression))
            .collect())
    }

    async fn run(&self, id: Uuid) {
        // The schedule is captured once per firing.
        match self.store.get_schedule(id).await {
            Ok(Some(schedule)) => {
                self.execute_backup(&schedule).await;
            }
            Ok(None) => tracing::warn!(schedule_id = %id, "Fired schedule no longer exists"),
            Err(e) => tracing::error!(schedule_id = %id, error = %e, "Failed to load fired schedule"),
        }
    }
}

/// A schedule currently in the cron table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSchedule {
    pub schedule_id: Uuid,
    pub next_run: Option<DateTime<Utc>>,
}

/// Cron-driven front of [`BackupExecutor`].
#[derive(Debug)]
pub struct BackupScheduler {
    table: Arc<CronTable<BackupExecutor>>,
}

impl BackupScheduler {
    #[must_use]
    pub fn new(executor: BackupExecutor, reload_interval: Duration) -> Self {
        Self {
            table: Arc::new(CronTable::new(Arc::new(executor), reload_interval)),
        }
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<BackupExecutor> {
        self.table.job()
    }

    #[must_use]
    pub fn table(&self) -> &Arc<CronTable<BackupExecutor>> {
        &self.table
    }

    /// Start the cron table and, with a concurrency manager, the consumer of
    /// promoted queue entries.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::AlreadyRunning`] on a second start, or a failed
    /// initial reload.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.table.start(cancel.clone()).await?;

        let promotions = self
            .executor()
            .concurrency()
            .and_then(|c| c.take_promotions());
        if let Some(mut promotions) = promotions {
            let executor = Arc::clone(self.executor());
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        entry = promotions.recv() => {
                            let Some(entry) = entry else { break };
                            let executor = Arc::clone(&executor);
                            tokio::spawn(async move {
                                executor.execute_promoted(entry).await;
                            });
                        }
                    }
                }
            });
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Only when the enabled schedules cannot be loaded.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        self.table.reload().await
    }

    pub fn set_maintenance_gate(&self, gate: Option<Arc<dyn MaintenanceGate>>) {
        self.executor().set_maintenance_gate(gate);
    }

    #[must_use]
    pub fn get_active_schedules(&self) -> Vec<ActiveSchedule> {
        let mut active: Vec<_> = self
            .table
            .ids()
            .into_iter()
            .map(|schedule_id| ActiveSchedule {
                schedule_id,
                next_run: self.table.next_run(schedule_id),
            })
            .collect();
        active.sort_by_key(|a| a.next_run);
        active
    }

    #[must_use]
    pub fn get_next_run(&self, schedule_id: Uuid) -> Option<DateTime<Utc>> {
        self.table.next_run(schedule_id)
    }

    /// Next run that does not fall in one of the schedule's excluded hours.
    ///
    /// # Errors
    ///
    /// Store failures loading the schedule.
    pub async fn get_next_allowed_run(&self, schedule_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let (Some(expression), Some(next)) = (
            self.table.expression(schedule_id),
            self.table.next_run(schedule_id),
        ) else {
            return Ok(None);
        };
        let schedule = self
            .executor()
            .store
            .get_schedule(schedule_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("schedule", schedule_id))?;
        Ok(next_allowed_run(&expression, &schedule.excluded_hours, next))
    }

    /// Run a schedule now, outside its cron timing.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NotFound`] if the schedule does not exist.
    pub async fn trigger_backup(&self, schedule_id: Uuid) -> Result<()> {
        self.executor()
            .store
            .get_schedule(schedule_id)
            .await
            .store_err()?
            .ok_or_else(|| OrchestratorError::not_found("schedule", schedule_id))?;
        tracing::info!(%schedule_id, "Backup triggered manually");
        self.table.trigger(schedule_id);
        Ok(())
    }
}

/// First run at or after `first` outside `excluded_hours`.
fn next_allowed_run(
    expression: &CronExpression,
    excluded_hours: &[u32],
    first: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut candidate = first;
    for _ in 0..MAX_ALLOWED_RUN_CANDIDATES {
        if !excluded_hours.contains(&candidate.hour()) {
            return Some(candidate);
        }
        candidate = expression.next_after(&candidate)?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::cron::CronParser;
    use chrono::TimeZone;

    #[test]
    fn test_next_allowed_run_skips_excluded_hours() {
        let hourly = CronParser::parse("0 * * * *").unwrap();
        let first = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

        assert_eq!(next_allowed_run(&hourly, &[], first), Some(first));
        assert_eq!(
            next_allowed_run(&hourly, &[9, 10, 11], first),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_allowed_run_never_when_all_hours_excluded() {
        let daily_at_two = CronParser::parse("0 2 * * *").unwrap();
        let first = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        assert_eq!(next_allowed_run(&daily_at_two, &[2], first), None);
    }

    #[test]
    fn test_report_counts() {
        let mut ok = Backup::new(Uuid::nil(), Uuid::nil(), Uuid::nil());
        ok.status = JobStatus::Completed;
        let mut bad = ok.clone();
        bad.fail("boom");
        let report = ExecutionReport {
            backups: vec![ok, bad],
            replicated_to: vec![],
        };
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
    }
}
