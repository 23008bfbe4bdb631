//! Startup validation of [`AppConfig`].
//!
//! Every rule runs; all violations are reported together.

use super::AppConfig;
use super::error::{ConfigResult, ConfigurationError};

#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the whole configuration.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if config.scheduler.reload_interval_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "scheduler.reload_interval_secs must be positive",
                "Set ORCHESTRATOR_SCHEDULER__RELOAD_INTERVAL_SECS to at least 1",
            ));
        }

        if config.scheduler.restic_binary.as_os_str().is_empty() {
            errors.push(ConfigurationError::missing_required(
                "scheduler.restic_binary",
                "running any backup, restore or verification",
                "ORCHESTRATOR_SCHEDULER__RESTIC_BINARY",
            ));
        }

        if config.verification.failure_alert_threshold == 0 {
            errors.push(ConfigurationError::invalid(
                "verification.failure_alert_threshold must be at least 1",
                "Use 1 to be notified on every failed verification",
            ));
        }

        Self::validate_validation(config, &mut errors);

        if let Some(url) = &config.notifications.webhook_url {
            if let Err(e) = url::Url::parse(url) {
                errors.push(ConfigurationError::invalid(
                    format!("notifications.webhook_url '{url}' is not a valid URL: {e}"),
                    "Use an absolute http(s) URL or unset the webhook",
                ));
            }
        }

        ConfigurationError::collect(errors)
    }

    fn validate_validation(config: &AppConfig, errors: &mut Vec<ConfigurationError>) {
        let validation = &config.validation;
        if !(0.0..=1.0).contains(&validation.file_count_margin) {
            errors.push(ConfigurationError::invalid(
                format!(
                    "validation.file_count_margin {} is outside [0, 1]",
                    validation.file_count_margin
                ),
                "Use a fraction, e.g. 0.01 for 1%",
            ));
        }
        if validation.enabled && validation.spot_check_count == 0 {
            errors.push(ConfigurationError::invalid(
                "validation.spot_check_count is 0 while validation is enabled",
                "Set a positive spot check count or disable validation",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_all_violations_reported() {
        let mut config = AppConfig::default();
        config.scheduler.reload_interval_secs = 0;
        config.validation.file_count_margin = 1.5;
        config.verification.failure_alert_threshold = 0;
        config.notifications.webhook_url = Some("not a url".into());

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.count(), 4);
    }

    #[test]
    fn test_spot_checks_only_required_when_enabled() {
        let mut config = AppConfig::default();
        config.validation.spot_check_count = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        config.validation.enabled = false;
        assert!(ConfigValidator::validate(&config).is_ok());
    }
}
