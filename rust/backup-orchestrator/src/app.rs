//! Daemon assembly: store, credentials, schedulers and satellite services
//! wired from an [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backup_adapter::{BackupTool, Restic};
use tokio_util::sync::CancellationToken;

use crate::concurrency::ConcurrencyManager;
use crate::config::AppConfig;
use crate::credentials::Credentials;
use crate::database::{Inventory, KeyManager, MemoryStore};
use crate::drtest::{DrTestExecutor, DrTestScheduler};
use crate::logging::OpTimer;
use crate::maintenance::{MaintenanceGate, MaintenanceWindows};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::restore::RestoreService;
use crate::retention::RetentionEnforcer;
use crate::scheduler::{BackupExecutor, BackupScheduler, ScriptRunner};
use crate::validator::BackupValidator;
use crate::verification::{VerificationExecutor, VerificationScheduler};

/// Everything the daemon runs.
#[derive(Debug)]
pub struct App {
    pub store: Arc<MemoryStore>,
    pub backups: BackupScheduler,
    pub verifications: VerificationScheduler,
    pub dr_tests: DrTestScheduler,
    pub retention: Arc<RetentionEnforcer>,
    pub restores: RestoreService,
    pub maintenance: Arc<MaintenanceWindows>,
}

impl App {
    /// Production wiring: restic from the configured binary and the key at
    /// `security.key_path` (or the default location).
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be loaded, the inventory cannot be
    /// read or seeded, or the webhook notifier cannot be built.
    pub fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let key_path = match &config.security.key_path {
            Some(path) => path.clone(),
            None => KeyManager::default_path()?,
        };
        let keys = KeyManager::new(&key_path)
            .with_context(|| format!("Failed to load encryption key {}", key_path.display()))?;
        let tool: Arc<dyn BackupTool> = Arc::new(Restic::new(&config.scheduler.restic_binary));
        Self::assemble(config, Arc::new(keys), tool)
    }

    /// Wire everything around an existing key and backup tool.
    ///
    /// # Errors
    ///
    /// See [`App::build`].
    pub fn assemble(
        config: &AppConfig,
        keys: Arc<KeyManager>,
        tool: Arc<dyn BackupTool>,
    ) -> anyhow::Result<Self> {
        let timer = OpTimer::new("app", "assemble");
        let store = Arc::new(MemoryStore::new());

        let maintenance = Arc::new(MaintenanceWindows::default());
        if let Some(path) = &config.inventory.path {
            let mut inventory = Inventory::load(path)?;
            for window in std::mem::take(&mut inventory.maintenance_windows) {
                maintenance.add(window);
            }
            inventory.seed(&store, &keys)?;
        } else {
            tracing::warn!("No inventory configured; nothing will be scheduled");
        }

        let credentials = Credentials::from_key_manager(keys, Arc::clone(&store));
        let notifier = build_notifier(config)?;
        let reload_interval = config.scheduler.reload_interval();

        let mut executor = BackupExecutor::new(store.clone(), Arc::clone(&tool), credentials.clone())
            .with_script_runner(ScriptRunner::new(config.scheduler.default_script_timeout()))
            .with_notifier(Arc::clone(&notifier));
        if config.concurrency.enabled {
            let manager = ConcurrencyManager::new(store.clone())
                .with_notifier(Arc::clone(&notifier), config.concurrency.notify_on_queue);
            executor = executor.with_concurrency(Arc::new(manager));
        } else {
            tracing::info!("Concurrency limits disabled");
        }
        if config.validation.enabled {
            executor = executor.with_validator(Arc::new(BackupValidator::new(
                Arc::clone(&tool),
                store.clone(),
                config.validation.clone(),
            )));
        }
        let backups = BackupScheduler::new(executor, reload_interval);
        let gate: Arc<dyn MaintenanceGate> = maintenance.clone();
        backups.set_maintenance_gate(Some(gate));

        let verifications = VerificationScheduler::new(
            VerificationExecutor::new(store.clone(), Arc::clone(&tool), credentials.clone())
                .with_notifier(Arc::clone(&notifier))
                .with_failure_alert_threshold(config.verification.failure_alert_threshold)
                .with_temp_root(config.verification.temp_dir.clone()),
            reload_interval,
        );

        let dr_tests = DrTestScheduler::new(
            DrTestExecutor::new(store.clone(), Arc::clone(&tool), credentials.clone())
                .with_notifier(notifier)
                .with_restore_root(config.dr.restore_root.clone()),
            reload_interval,
        );

        let retention = Arc::new(RetentionEnforcer::new(
            store.clone(),
            Arc::clone(&tool),
            credentials.clone(),
            Duration::from_secs(config.retention.enforce_interval_secs),
        ));
        let restores = RestoreService::new(store.clone(), tool, credentials);

        timer.finish();
        Ok(Self {
            store,
            backups,
            verifications,
            dr_tests,
            retention,
            restores,
            maintenance,
        })
    }

    /// Start every scheduler. They stop when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if a scheduler is already running or its initial
    /// load fails.
    pub async fn start(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.backups.start(cancel.clone()).await?;
        self.verifications.start(cancel.clone()).await?;
        self.dr_tests.start(cancel.clone()).await?;
        self.retention.start(cancel.clone())?;
        tracing::info!(
            backup_schedules = self.backups.get_active_schedules().len(),
            verification_schedules = self.verifications.table().ids().len(),
            dr_test_schedules = self.dr_tests.table().ids().len(),
            "Orchestrator started"
        );
        Ok(())
    }
}

fn build_notifier(config: &AppConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    let Some(raw) = &config.notifications.webhook_url else {
        return Ok(Arc::new(LogNotifier));
    };
    let url = url::Url::parse(raw).with_context(|| format!("Invalid webhook URL '{raw}'"))?;
    let timeout = Duration::from_secs(config.notifications.timeout_secs);
    tracing::info!(host = url.host_str().unwrap_or_default(), "Webhook notifications enabled");
    Ok(Arc::new(WebhookNotifier::new(url, timeout)?))
}
