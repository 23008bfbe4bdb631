//! Logging setup and operation timing.

use std::time::Instant;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("backup_orchestrator={0},backup_adapter={0}", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

/// Measures one operation and logs its duration.
///
/// ```rust,ignore
/// let timer = OpTimer::new("backup", "copy");
/// let result = tool.copy(&source, &target, &snapshot_id).await;
/// timer.finish_with_result(result.as_ref());
/// ```
#[derive(Debug)]
pub struct OpTimer {
    component: &'static str,
    operation: String,
    start: Instant,
}

impl OpTimer {
    #[must_use]
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        tracing::debug!(component, operation = %operation, "Operation started");
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Milliseconds since the timer was created.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Log completion and return the elapsed milliseconds.
    pub fn finish(self) -> u64 {
        let duration_ms = self.elapsed_ms();
        tracing::info!(
            component = self.component,
            operation = %self.operation,
            duration_ms,
            "Operation completed"
        );
        duration_ms
    }

    /// Log success or failure and return the elapsed milliseconds.
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) -> u64 {
        let duration_ms = self.elapsed_ms();
        match result {
            Ok(_) => tracing::info!(
                component = self.component,
                operation = %self.operation,
                duration_ms,
                "Operation completed"
            ),
            Err(e) => tracing::error!(
                component = self.component,
                operation = %self.operation,
                duration_ms,
                error = %e,
                "Operation failed"
            ),
        }
        duration_ms
    }
}
