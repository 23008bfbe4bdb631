//! Backup schedules and their hook scripts.

use backup_adapter::{BackupOptions, CompressionMode, RetentionPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What to do when a path of the schedule sits on a mount that is not connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountUnavailableBehavior {
    /// End the firing without recording anything.
    #[default]
    Skip,
    /// Record a single failed backup.
    Fail,
}

/// A target repository of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRepository {
    pub repository_id: Uuid,
    /// 0 is the primary; replication copies from the repository that produced the snapshot.
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A recurring backup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,
    #[serde(default)]
    pub bandwidth_limit_kbps: Option<u32>,
    #[serde(default)]
    pub compression: Option<CompressionMode>,
    #[serde(default)]
    pub max_file_size_mb: Option<u64>,
    /// UTC hours (0-23) during which the schedule must not run.
    #[serde(default)]
    pub excluded_hours: Vec<u32>,
    #[serde(default)]
    pub on_mount_unavailable: MountUnavailableBehavior,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub repositories: Vec<ScheduleRepository>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Enabled targets ordered by priority.
    #[must_use]
    pub fn enabled_repositories(&self) -> Vec<&ScheduleRepository> {
        let mut repos: Vec<_> = self.repositories.iter().filter(|r| r.enabled).collect();
        repos.sort_by_key(|r| r.priority);
        repos
    }

    /// The enabled priority-0 target.
    #[must_use]
    pub fn primary_repository(&self) -> Option<&ScheduleRepository> {
        self.repositories
            .iter()
            .find(|r| r.enabled && r.priority == 0)
    }

    #[must_use]
    pub fn is_excluded_hour(&self, hour: u32) -> bool {
        self.excluded_hours.contains(&hour)
    }

    /// Options handed to the backup tool for every target of this schedule.
    #[must_use]
    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            bandwidth_limit_kbps: self.bandwidth_limit_kbps,
            compression: self.compression,
            max_file_size_mb: self.max_file_size_mb,
            tags: vec![format!("schedule:{}", self.id)],
        }
    }
}

/// When a hook script runs relative to the backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    PreBackup,
    PostSuccess,
    PostFailure,
    PostAlways,
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PreBackup => "pre_backup",
            Self::PostSuccess => "post_success",
            Self::PostFailure => "post_failure",
            Self::PostAlways => "post_always",
        };
        f.write_str(s)
    }
}

/// A shell snippet run around a schedule's backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupScript {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub script_type: ScriptType,
    /// Script body, executed with `sh -c`.
    pub script: String,
    /// 0 means the configured default timeout.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Only meaningful for pre-backup scripts: abort the firing when the script fails.
    #[serde(default)]
    pub fail_on_error: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// The enabled scripts of one schedule, keyed by when they run.
#[derive(Debug, Clone, Default)]
pub struct ScheduleScripts {
    pub pre_backup: Option<BackupScript>,
    pub post_success: Option<BackupScript>,
    pub post_failure: Option<BackupScript>,
    pub post_always: Option<BackupScript>,
}

impl ScheduleScripts {
    /// Sort loaded scripts into their slots. Disabled scripts are ignored; when
    /// several share a type the first one wins.
    #[must_use]
    pub fn from_scripts(scripts: Vec<BackupScript>) -> Self {
        let mut sorted = Self::default();
        for script in scripts.into_iter().filter(|s| s.enabled) {
            let slot = match script.script_type {
                ScriptType::PreBackup => &mut sorted.pre_backup,
                ScriptType::PostSuccess => &mut sorted.post_success,
                ScriptType::PostFailure => &mut sorted.post_failure,
                ScriptType::PostAlways => &mut sorted.post_always,
            };
            if slot.is_none() {
                *slot = Some(script);
            }
        }
        sorted
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(priority: u32, enabled: bool) -> ScheduleRepository {
        ScheduleRepository {
            repository_id: Uuid::new_v4(),
            priority,
            enabled,
        }
    }

    fn schedule(repositories: Vec<ScheduleRepository>) -> Schedule {
        serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "agent_id": Uuid::new_v4(),
            "name": "nightly",
            "cron_expression": "0 2 * * *",
            "paths": ["/srv"],
            "repositories": repositories,
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_when_deserializing() {
        let s = schedule(vec![]);
        assert!(s.enabled);
        assert_eq!(s.on_mount_unavailable, MountUnavailableBehavior::Skip);
        assert!(s.excluded_hours.is_empty());
        assert!(s.retention_policy.is_none());
    }

    #[test]
    fn test_enabled_repositories_sorted_by_priority() {
        let s = schedule(vec![target(2, true), target(0, true), target(1, false)]);
        let priorities: Vec<_> = s.enabled_repositories().iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![0, 2]);
        assert_eq!(s.primary_repository().unwrap().priority, 0);
    }

    #[test]
    fn test_primary_requires_enabled_priority_zero() {
        let s = schedule(vec![target(0, false), target(1, true)]);
        assert!(s.primary_repository().is_none());
    }

    #[test]
    fn test_backup_options_carry_limits_and_tag() {
        let mut s = schedule(vec![]);
        s.bandwidth_limit_kbps = Some(512);
        s.compression = Some(CompressionMode::Max);
        let opts = s.backup_options();
        assert_eq!(opts.bandwidth_limit_kbps, Some(512));
        assert_eq!(opts.compression, Some(CompressionMode::Max));
        assert_eq!(opts.tags, vec![format!("schedule:{}", s.id)]);
    }

    #[test]
    fn test_scripts_sorted_into_slots() {
        let schedule_id = Uuid::new_v4();
        let script = |script_type, body: &str, enabled| BackupScript {
            id: Uuid::new_v4(),
            schedule_id,
            script_type,
            script: body.to_string(),
            timeout_seconds: 0,
            fail_on_error: false,
            enabled,
        };

        let scripts = ScheduleScripts::from_scripts(vec![
            script(ScriptType::PreBackup, "echo disabled", false),
            script(ScriptType::PreBackup, "echo pre", true),
            script(ScriptType::PostAlways, "echo always", true),
        ]);

        assert_eq!(scripts.pre_backup.unwrap().script, "echo pre");
        assert_eq!(scripts.post_always.unwrap().script, "echo always");
        assert!(scripts.post_success.is_none());
        assert!(scripts.post_failure.is_none());
    }
}
