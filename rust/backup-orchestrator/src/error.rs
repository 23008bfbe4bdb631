use backup_adapter::AdapterError;
use thiserror::Error;

/// Core error type for the backup orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Persistence errors
    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    /// Backup tool errors
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// A collaborator the operation cannot run without was never wired in
    #[error("{0} is not configured")]
    MissingCollaborator(&'static str),

    #[error("Failed to decrypt repository {repository}: {reason}")]
    Decrypt { repository: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("Script failed: {0}")]
    Script(String),

    /// A check or trial restore ran and found a problem
    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Wrap a store failure.
    pub fn store(err: anyhow::Error) -> Self {
        OrchestratorError::Store(err)
    }

    /// A lookup that came back empty.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        OrchestratorError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Lift store results (`anyhow`) into [`OrchestratorError::Store`].
pub trait StoreResultExt<T> {
    fn store_err(self) -> Result<T>;
}

impl<T> StoreResultExt<T> for anyhow::Result<T> {
    fn store_err(self) -> Result<T> {
        self.map_err(OrchestratorError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::MissingCollaborator("decrypt function");
        assert_eq!(err.to_string(), "decrypt function is not configured");

        let err = OrchestratorError::not_found("schedule", "42");
        assert_eq!(err.to_string(), "schedule not found: 42");
    }

    #[test]
    fn test_adapter_errors_are_transparent() {
        let err: OrchestratorError = AdapterError::SnapshotNotFound("abc".into()).into();
        assert_eq!(err.to_string(), "Snapshot not found: abc");
    }

    #[test]
    fn test_store_err_wraps_anyhow() {
        let result: anyhow::Result<()> = Err(anyhow::anyhow!("connection reset"));
        let err = result.store_err().unwrap_err();
        assert_eq!(err.to_string(), "Store error: connection reset");
    }
}
