//! Typed inputs and results exchanged with the backup tool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything needed to reach one repository.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ResticConfig {
    /// Repository location string (`/srv/repo`, `s3:https://host/bucket`, ...).
    pub repository: String,
    /// Repository password.
    pub password: String,
    /// Extra environment for the backend (credentials, endpoints).
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl std::fmt::Debug for ResticConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResticConfig")
            .field("repository", &self.repository)
            .field("password", &"<redacted>")
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResticConfig {
    /// Create a config for a repository location and password.
    #[must_use]
    pub fn new(repository: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            password: password.into(),
            env: HashMap::new(),
        }
    }

    /// Add a backend environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Compression mode passed to `--compression`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    Auto,
    Off,
    Max,
}

impl CompressionMode {
    /// Flag value understood by restic.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Off => "off",
            Self::Max => "max",
        }
    }
}

/// Per-invocation backup knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupOptions {
    /// Upload limit in KiB/s.
    pub bandwidth_limit_kbps: Option<u32>,
    pub compression: Option<CompressionMode>,
    /// Files larger than this are skipped.
    pub max_file_size_mb: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Summary reported at the end of a backup run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupStats {
    pub snapshot_id: String,
    #[serde(default)]
    pub files_new: u64,
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub files_unmodified: u64,
    #[serde(default)]
    pub dirs_new: u64,
    #[serde(default)]
    pub dirs_changed: u64,
    /// Bytes added to the repository after deduplication.
    #[serde(default)]
    pub data_added: u64,
    #[serde(default)]
    pub total_files_processed: u64,
    #[serde(default)]
    pub total_bytes_processed: u64,
    /// Seconds.
    #[serde(default)]
    pub total_duration: f64,
}

/// A snapshot as listed by `restic snapshots`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Snapshot {
    /// Whether `id` names this snapshot by full or short id.
    #[must_use]
    pub fn matches_id(&self, id: &str) -> bool {
        !id.is_empty() && (self.id == id || self.short_id == id || self.id.starts_with(id))
    }
}

/// Kind of node inside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Dir,
    Symlink,
    #[serde(other)]
    Other,
}

/// A node listed by `restic ls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Keep-N-per-period retention rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
}

impl RetentionPolicy {
    /// True when no rule is set; forgetting with such a policy is refused.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_args().is_empty()
    }

    /// Command line flags for `restic forget`.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let rules = [
            ("--keep-last", self.keep_last),
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ];

        rules
            .into_iter()
            .filter_map(|(flag, value)| value.filter(|v| *v > 0).map(|v| [flag.to_string(), v.to_string()]))
            .flatten()
            .collect()
    }
}

/// Outcome of `restic forget [--prune]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForgetResult {
    pub snapshots_kept: usize,
    pub snapshots_removed: usize,
    #[serde(default)]
    pub removed_ids: Vec<String>,
    pub pruned: bool,
}

/// Options for `restic check`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckOptions {
    /// Read all pack data.
    pub read_data: bool,
    /// Read a subset such as `5%` or `1/10`.
    pub read_data_subset: Option<String>,
}

/// Outcome of `restic check`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Options for `restic restore`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreOptions {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Totals reported by a restore, when the tool reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreSummary {
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub files_restored: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub bytes_restored: u64,
}

/// Repository-wide totals from `restic stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
    #[serde(default)]
    pub snapshots_count: u64,
}

/// How a path differs between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One changed path in a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffChange {
    pub path: String,
    pub kind: ChangeKind,
}

/// Outcome of `restic diff`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub changes: Vec<DiffChange>,
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}
