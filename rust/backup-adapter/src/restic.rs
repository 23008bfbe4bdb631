//! [`BackupTool`] implementation that shells out to the `restic` binary.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{AdapterError, AdapterResult};
use crate::output;
use crate::tool::BackupTool;
use crate::types::{
    BackupOptions, BackupStats, CheckOptions, CheckResult, DiffResult, ForgetResult, RepoStats,
    ResticConfig, RestoreOptions, RestoreSummary, RetentionPolicy, Snapshot, SnapshotFile,
};

/// Default upper bound for a single restic invocation.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// restic driven as a subprocess.
#[derive(Debug, Clone)]
pub struct Restic {
    binary: PathBuf,
    command_timeout: Duration,
}

impl Default for Restic {
    fn default() -> Self {
        Self::new("restic")
    }
}

impl Restic {
    /// Use the restic binary at `binary` (looked up on `PATH` when relative).
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the per-invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    fn command(&self, repo: &ResticConfig) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.env("RESTIC_REPOSITORY", &repo.repository)
            .env("RESTIC_PASSWORD", &repo.password);
        for (key, value) in &repo.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a prepared command; non-zero exit is classified from stderr.
    async fn run(&self, name: &str, mut cmd: Command) -> AdapterResult<Output> {
        tracing::debug!(command = name, "Running restic");

        let result = timeout(self.command_timeout, cmd.output()).await;
        let output = match result {
            Ok(output) => output?,
            Err(_) => {
                return Err(AdapterError::Timeout {
                    command: name.to_string(),
                    seconds: self.command_timeout.as_secs(),
                });
            }
        };

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(command = name, status = ?output.status.code(), "restic exited unsuccessfully");
            Err(AdapterError::from_stderr(name, &stderr))
        }
    }

    async fn run_stdout(&self, name: &str, cmd: Command) -> AdapterResult<String> {
        let output = self.run(name, cmd).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Flags shared by every backup invocation.
fn backup_args(paths: &[String], excludes: &[String], options: &BackupOptions) -> Vec<String> {
    let mut args = vec!["backup".to_string(), "--json".to_string()];
    for exclude in excludes {
        args.push("--exclude".to_string());
        args.push(exclude.clone());
    }
    for tag in &options.tags {
        args.push("--tag".to_string());
        args.push(tag.clone());
    }
    if let Some(limit) = options.bandwidth_limit_kbps.filter(|l| *l > 0) {
        args.push("--limit-upload".to_string());
        args.push(limit.to_string());
    }
    if let Some(compression) = options.compression {
        args.push("--compression".to_string());
        args.push(compression.as_str().to_string());
    }
    if let Some(max) = options.max_file_size_mb.filter(|m| *m > 0) {
        args.push("--exclude-larger-than".to_string());
        args.push(format!("{max}M"));
    }
    args.extend(paths.iter().cloned());
    args
}

#[async_trait]
impl BackupTool for Restic {
    async fn init(&self, repo: &ResticConfig) -> AdapterResult<()> {
        let mut cmd = self.command(repo);
        cmd.arg("init");
        self.run("init", cmd).await.map(|_| ())
    }

    async fn backup(
        &self,
        repo: &ResticConfig,
        paths: &[String],
        excludes: &[String],
        options: &BackupOptions,
    ) -> AdapterResult<BackupStats> {
        if paths.is_empty() {
            return Err(AdapterError::CommandFailed {
                command: "backup".into(),
                stderr: "no paths to back up".into(),
            });
        }
        let mut cmd = self.command(repo);
        cmd.args(backup_args(paths, excludes, options));
        let stdout = self.run_stdout("backup", cmd).await?;
        output::parse_backup_summary(&stdout)
    }

    async fn restore(
        &self,
        repo: &ResticConfig,
        snapshot_id: &str,
        target: &Path,
        options: &RestoreOptions,
    ) -> AdapterResult<RestoreSummary> {
        let mut cmd = self.command(repo);
        cmd.arg("restore").arg(snapshot_id).arg("--json").arg("--target").arg(target);
        for include in &options.include {
            cmd.arg("--include").arg(include);
        }
        for exclude in &options.exclude {
            cmd.arg("--exclude").arg(exclude);
        }
        let stdout = self.run_stdout("restore", cmd).await?;
        Ok(output::parse_restore_summary(&stdout))
    }

    async fn snapshots(&self, repo: &ResticConfig) -> AdapterResult<Vec<Snapshot>> {
        let mut cmd = self.command(repo);
        cmd.args(["snapshots", "--json"]);
        let stdout = self.run_stdout("snapshots", cmd).await?;
        output::parse_snapshots(&stdout)
    }

    async fn list_files(
        &self,
        repo: &ResticConfig,
        snapshot_id: &str,
        path_prefix: Option<&str>,
    ) -> AdapterResult<Vec<SnapshotFile>> {
        let mut cmd = self.command(repo);
        cmd.args(["ls", "--json", snapshot_id]);
        if let Some(prefix) = path_prefix {
            cmd.arg(prefix);
        }
        let stdout = self.run_stdout("ls", cmd).await?;
        output::parse_ls(&stdout)
    }

    async fn forget(
        &self,
        repo: &ResticConfig,
        policy: &RetentionPolicy,
        prune: bool,
    ) -> AdapterResult<ForgetResult> {
        if policy.is_empty() {
            return Err(AdapterError::CommandFailed {
                command: "forget".into(),
                stderr: "retention policy has no keep rules".into(),
            });
        }
        let mut cmd = self.command(repo);
        cmd.args(["forget", "--json"]).args(policy.to_args());
        if prune {
            cmd.arg("--prune");
        }
        let stdout = self.run_stdout("forget", cmd).await?;
        output::parse_forget(&stdout, prune)
    }

    async fn prune(&self, repo: &ResticConfig) -> AdapterResult<()> {
        let mut cmd = self.command(repo);
        cmd.arg("prune");
        self.run("prune", cmd).await.map(|_| ())
    }

    async fn check(&self, repo: &ResticConfig, options: &CheckOptions) -> AdapterResult<CheckResult> {
        let mut cmd = self.command(repo);
        cmd.arg("check");
        if let Some(subset) = options.read_data_subset.as_deref().filter(|s| !s.is_empty()) {
            cmd.arg(format!("--read-data-subset={subset}"));
        } else if options.read_data {
            cmd.arg("--read-data");
        }

        // A failed check is a result, not an adapter error.
        match self.run("check", cmd).await {
            Ok(_) => Ok(CheckResult {
                success: true,
                errors: Vec::new(),
            }),
            Err(AdapterError::CommandFailed { stderr, .. }) => {
                let mut errors = output::parse_check_errors("", &stderr);
                if errors.is_empty() {
                    errors.push(stderr);
                }
                Ok(CheckResult {
                    success: false,
                    errors,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn copy(
        &self,
        source: &ResticConfig,
        target: &ResticConfig,
        snapshot_id: &str,
    ) -> AdapterResult<()> {
        let mut cmd = self.command(target);
        cmd.env("RESTIC_FROM_REPOSITORY", &source.repository)
            .env("RESTIC_FROM_PASSWORD", &source.password);
        for (key, value) in &source.env {
            // Both repositories share the process environment; target wins on clash.
            if !target.env.contains_key(key) {
                cmd.env(key, value);
            }
        }
        cmd.args(["copy", snapshot_id]);
        self.run("copy", cmd).await.map(|_| ())
    }

    async fn stats(&self, repo: &ResticConfig) -> AdapterResult<RepoStats> {
        let mut cmd = self.command(repo);
        cmd.args(["stats", "--json", "--mode", "raw-data"]);
        let stdout = self.run_stdout("stats", cmd).await?;
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with('{'))
            .ok_or_else(|| AdapterError::Parse("no JSON in stats output".into()))?;
        Ok(serde_json::from_str(line)?)
    }

    async fn diff(&self, repo: &ResticConfig, snapshot_a: &str, snapshot_b: &str) -> AdapterResult<DiffResult> {
        let mut cmd = self.command(repo);
        cmd.args(["diff", "--json", snapshot_a, snapshot_b]);
        let stdout = self.run_stdout("diff", cmd).await?;
        output::parse_diff(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompressionMode;

    #[test]
    fn test_backup_args_carry_limits() {
        let options = BackupOptions {
            bandwidth_limit_kbps: Some(512),
            compression: Some(CompressionMode::Max),
            max_file_size_mb: Some(100),
            tags: vec!["schedule:nightly".into()],
        };
        let args = backup_args(&["/data".into()], &["*.tmp".into()], &options);
        assert_eq!(
            args,
            vec![
                "backup",
                "--json",
                "--exclude",
                "*.tmp",
                "--tag",
                "schedule:nightly",
                "--limit-upload",
                "512",
                "--compression",
                "max",
                "--exclude-larger-than",
                "100M",
                "/data",
            ]
        );
    }

    #[test]
    fn test_backup_args_skip_zero_limits() {
        let options = BackupOptions {
            bandwidth_limit_kbps: Some(0),
            max_file_size_mb: Some(0),
            ..Default::default()
        };
        let args = backup_args(&["/a".into(), "/b".into()], &[], &options);
        assert_eq!(args, vec!["backup", "--json", "/a", "/b"]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let restic = Restic::new("/nonexistent/restic-binary");
        let err = restic
            .snapshots(&ResticConfig::new("/tmp/none", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Io(_)));
    }

    #[tokio::test]
    async fn test_empty_paths_rejected_before_spawning() {
        let restic = Restic::new("/nonexistent/restic-binary");
        let err = restic
            .backup(&ResticConfig::new("/tmp/none", "pw"), &[], &[], &BackupOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no paths"));
    }
}
