use thiserror::Error;

/// Errors produced while driving the external backup tool.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// The repository has not been initialized yet.
    #[error("Repository not initialized: {0}")]
    NotInitialized(String),

    /// The requested snapshot does not exist in the repository.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// The tool exited unsuccessfully.
    #[error("restic {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// The tool did not finish in time.
    #[error("restic {command} timed out after {seconds} seconds")]
    Timeout { command: String, seconds: u64 },

    /// Output could not be decoded.
    #[error("Failed to parse restic output: {0}")]
    Parse(String),

    /// Backend configuration is incomplete or malformed.
    #[error("Invalid backend configuration: {0}")]
    InvalidBackend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Parse(err.to_string())
    }
}

impl AdapterError {
    /// Classify a failed invocation by the text restic printed on stderr.
    pub fn from_stderr(command: impl Into<String>, stderr: &str) -> Self {
        let command = command.into();
        let lowered = stderr.to_lowercase();

        if lowered.contains("is there a repository at the following location")
            || lowered.contains("repository does not exist")
            || lowered.contains("unable to open config file")
        {
            return AdapterError::NotInitialized(stderr.trim().to_string());
        }

        if lowered.contains("no matching id found")
            || lowered.contains("snapshot not found")
            || lowered.contains("no snapshot found")
        {
            return AdapterError::SnapshotNotFound(stderr.trim().to_string());
        }

        AdapterError::CommandFailed {
            command,
            stderr: stderr.trim().to_string(),
        }
    }

    /// Whether this error means the repository must be initialized first.
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, AdapterError::NotInitialized(_))
    }

    /// Whether this error means the snapshot id did not resolve.
    pub fn is_snapshot_not_found(&self) -> bool {
        matches!(self, AdapterError::SnapshotNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_uninitialized_repository() {
        let err = AdapterError::from_stderr(
            "snapshots",
            "Fatal: unable to open config file: Stat: stat /srv/repo/config: no such file or directory\n\
             Is there a repository at the following location?\n/srv/repo",
        );
        assert!(err.is_not_initialized());
    }

    #[test]
    fn test_classifies_missing_snapshot() {
        let err = AdapterError::from_stderr("restore", "Fatal: no matching ID found for prefix \"deadbeef\"");
        assert!(err.is_snapshot_not_found());
    }

    #[test]
    fn test_generic_failure_keeps_stderr() {
        let err = AdapterError::from_stderr("backup", "Fatal: wrong password or no key found\n");
        assert_eq!(
            err.to_string(),
            "restic backup failed: Fatal: wrong password or no key found"
        );
    }
}
