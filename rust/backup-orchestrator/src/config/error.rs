//! Configuration errors with actionable messages.

use std::fmt;

/// What is wrong with a configuration, and how to fix it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A value outside its allowed range or format.
    Invalid {
        /// What is wrong.
        message: String,
        /// How to fix it.
        fix_hint: String,
    },
    /// A setting that an enabled feature needs.
    MissingRequired {
        setting: String,
        context: String,
        env_var: String,
    },
    Multiple(Vec<ConfigurationError>),
}

impl std::error::Error for ConfigurationError {}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { message, fix_hint } => {
                write!(f, "Invalid configuration: {message}\n\nHow to fix: {fix_hint}")
            }
            Self::MissingRequired {
                setting,
                context,
                env_var,
            } => write!(
                f,
                "Missing required configuration: {setting}\n\n\
                Required for: {context}\n\
                Set via: {env_var}"
            ),
            Self::Multiple(errors) => {
                writeln!(f, "Multiple configuration errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "\n{}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl ConfigurationError {
    #[must_use]
    pub fn invalid(message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    #[must_use]
    pub fn missing_required(
        setting: impl Into<String>,
        context: impl Into<String>,
        env_var: impl Into<String>,
    ) -> Self {
        Self::MissingRequired {
            setting: setting.into(),
            context: context.into(),
            env_var: env_var.into(),
        }
    }

    /// Collapse a list: none is `Ok`, one is itself, more are `Multiple`.
    pub fn collect(mut errors: Vec<ConfigurationError>) -> ConfigResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Number of errors (1 for single errors, N for multiple).
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_error_display() {
        let err = ConfigurationError::invalid(
            "scheduler.reload_interval_secs must be positive",
            "Set ORCHESTRATOR_SCHEDULER__RELOAD_INTERVAL_SECS to at least 1",
        );
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("How to fix"));
    }

    #[test]
    fn test_missing_required_error_display() {
        let err = ConfigurationError::missing_required(
            "restic binary",
            "running backups",
            "ORCHESTRATOR_SCHEDULER__RESTIC_BINARY",
        );
        let msg = err.to_string();
        assert!(msg.contains("Missing required"));
        assert!(msg.contains("RESTIC_BINARY"));
    }

    #[test]
    fn test_collect() {
        assert!(ConfigurationError::collect(vec![]).is_ok());

        let one = ConfigurationError::collect(vec![ConfigurationError::invalid("a", "b")]);
        assert_eq!(one.unwrap_err().count(), 1);

        let many = ConfigurationError::collect(vec![
            ConfigurationError::invalid("Error 1", "Fix 1"),
            ConfigurationError::invalid("Error 2", "Fix 2"),
        ])
        .unwrap_err();
        assert_eq!(many.count(), 2);
        let msg = many.to_string();
        assert!(msg.contains("1.") && msg.contains("2."));
    }
}
