//! Configuration for the orchestrator daemon.
//!
//! Sources, later ones winning:
//!
//! 1. Built-in defaults
//! 2. `config/backup-orchestrator.{yaml,toml,json}` (or the file given on the
//!    command line)
//! 3. Environment variables prefixed `ORCHESTRATOR`, nested with `__`
//!    (`ORCHESTRATOR_SCHEDULER__RELOAD_INTERVAL_SECS=30`)
//!
//! A `.env` file is read first if present. Use [`ConfigValidator`] before
//! acting on a loaded config; [`AppConfig::load`] does so already.

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub dr: DrConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or parsed, or if the
    /// result fails validation.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(file)?;
        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;
        Ok(config)
    }

    /// Load without validation.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or parsed.
    pub fn load_unchecked(file: Option<&Path>) -> anyhow::Result<Self> {
        // A missing .env is normal.
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "Failed to read .env");
            }
        }

        let mut builder = config::Config::builder();
        builder = match file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(
                config::File::with_name("config/backup-orchestrator").required(false),
            ),
        };

        let config = builder
            .add_source(
                config::Environment::with_prefix("ORCHESTRATOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Cron tables and hook scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often every cron table re-reads its enabled items.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
    #[serde(default = "default_restic_binary")]
    pub restic_binary: PathBuf,
    /// Timeout for scripts that do not set their own.
    #[serde(default = "default_script_timeout")]
    pub default_script_timeout_secs: u64,
}

fn default_reload_interval() -> u64 {
    60
}

fn default_restic_binary() -> PathBuf {
    PathBuf::from("restic")
}

fn default_script_timeout() -> u64 {
    300
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reload_interval_secs: default_reload_interval(),
            restic_binary: default_restic_binary(),
            default_script_timeout_secs: default_script_timeout(),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    #[must_use]
    pub fn default_script_timeout(&self) -> Duration {
        Duration::from_secs(self.default_script_timeout_secs)
    }
}

/// Backup admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub notify_on_queue: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            notify_on_queue: true,
        }
    }
}

/// Scheduled repository verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Consecutive failures before anyone is notified.
    #[serde(default = "default_failure_threshold")]
    pub failure_alert_threshold: u32,
    /// Parent directory for trial restores; the system temp dir if unset.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            failure_alert_threshold: default_failure_threshold(),
            temp_dir: None,
        }
    }
}

/// Disaster-recovery tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrConfig {
    /// Parent directory for DR restores; the system temp dir if unset.
    #[serde(default)]
    pub restore_root: Option<PathBuf>,
}

/// Periodic retention enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// 0 disables the periodic pass.
    #[serde(default = "default_enforce_interval")]
    pub enforce_interval_secs: u64,
}

fn default_enforce_interval() -> u64 {
    86_400
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enforce_interval_secs: default_enforce_interval(),
        }
    }
}

/// Post-backup validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Allowed relative difference between source and snapshot file counts.
    #[serde(default = "default_file_count_margin")]
    pub file_count_margin: f64,
    #[serde(default = "default_spot_check_count")]
    pub spot_check_count: usize,
    #[serde(default)]
    pub run_integrity_check: bool,
}

fn default_file_count_margin() -> f64 {
    0.01
}

fn default_spot_check_count() -> usize {
    10
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_count_margin: default_file_count_margin(),
            spot_check_count: default_spot_check_count(),
            run_integrity_check: false,
        }
    }
}

/// Where notifications go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Notifications are only logged when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notification_timeout")]
    pub timeout_secs: u64,
}

fn default_notification_timeout() -> u64 {
    10
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notification_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// 32-byte key used to decrypt repository configs and passwords.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// YAML or JSON file seeding the store at startup.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.reload_interval(), Duration::from_secs(60));
        assert_eq!(config.scheduler.restic_binary, PathBuf::from("restic"));
        assert!(config.concurrency.enabled);
        assert_eq!(config.verification.failure_alert_threshold, 3);
        assert!((config.validation.file_count_margin - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.validation.spot_check_count, 10);
        assert_eq!(config.retention.enforce_interval_secs, 86_400);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    #[serial_test::serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "scheduler:\n  reload_interval_secs: 15\nvalidation:\n  spot_check_count: 3\nnotifications:\n  webhook_url: http://localhost:9000/hook"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.scheduler.reload_interval_secs, 15);
        assert_eq!(config.validation.spot_check_count, 3);
        assert_eq!(
            config.notifications.webhook_url.as_deref(),
            Some("http://localhost:9000/hook")
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.verification.failure_alert_threshold, 3);
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "scheduler:\n  reload_interval_secs: 0").unwrap();

        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("reload_interval_secs"));
    }
}
