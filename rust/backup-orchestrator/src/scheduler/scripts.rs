//! Pre- and post-backup hook scripts.
//!
//! Scripts run through `sh -c` with their own timeout, independent of any
//! scheduler cancellation. The child is killed if the timeout elapses.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use uuid::Uuid;

use crate::domain::{BackupScript, ScriptType};
use crate::error::{OrchestratorError, Result};

/// Values exposed to scripts as environment variables.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    pub schedule_id: Uuid,
    pub schedule_name: String,
    /// Error of the failed run, for post-failure and post-always scripts.
    pub error: Option<String>,
}

/// Runs hook scripts with a fallback timeout.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    default_timeout: Duration,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl ScriptRunner {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    fn timeout_for(&self, script: &BackupScript) -> Duration {
        if script.timeout_seconds == 0 {
            self.default_timeout
        } else {
            Duration::from_secs(script.timeout_seconds)
        }
    }

    /// Run `script` and return its combined stdout and stderr.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Script`] if the script cannot be spawned, exits
    /// non-zero, or outlives its timeout.
    pub async fn run(&self, script: &BackupScript, context: &ScriptContext) -> Result<String> {
        let timeout = self.timeout_for(script);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&script.script)
            .env("BACKUP_SCHEDULE_ID", context.schedule_id.to_string())
            .env("BACKUP_SCHEDULE_NAME", &context.schedule_name)
            .env("BACKUP_HOOK", script.script_type.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(error) = &context.error {
            cmd.env("BACKUP_ERROR", error);
        }

        let child = cmd.spawn().map_err(|e| {
            OrchestratorError::Script(format!("failed to start {} script: {e}", script.script_type))
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                OrchestratorError::Script(format!("{} script: {e}", script.script_type))
            })?,
            Err(_) => {
                return Err(OrchestratorError::Script(format!(
                    "{} script timed out after {}s",
                    script.script_type,
                    timeout.as_secs()
                )));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(OrchestratorError::Script(format!(
                "{} script exited with {code}: {}",
                script.script_type,
                combined.trim()
            )));
        }

        Ok(combined)
    }
}

/// Only pre-backup scripts can veto a run.
#[must_use]
pub fn blocks_backup(script: &BackupScript) -> bool {
    script.script_type == ScriptType::PreBackup && script.fail_on_error
}
