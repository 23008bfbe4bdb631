//! Organizations, agents and the repositories they back up into.

use backup_adapter::RepositoryType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant owning agents and repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Ceiling on backups running at once across all agents. `None` or 0 is unlimited.
    #[serde(default)]
    pub max_concurrent_backups: Option<u32>,
}

/// A host that produces backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub hostname: String,
    /// Per-agent ceiling. Overrides rather than falls back to the org limit.
    #[serde(default)]
    pub max_concurrent_backups: Option<u32>,
    /// Network filesystems the agent reported at its last check-in.
    #[serde(default)]
    pub network_mounts: Vec<NetworkMount>,
}

impl Agent {
    /// The mount containing `path`, preferring the longest matching mount point.
    #[must_use]
    pub fn mount_for(&self, path: &str) -> Option<&NetworkMount> {
        self.network_mounts
            .iter()
            .filter(|m| m.contains(path))
            .max_by_key(|m| m.path.trim_end_matches('/').len())
    }
}

/// State of a network mount as last reported by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountStatus {
    Connected,
    Stale,
    Disconnected,
}

/// A network filesystem mounted on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMount {
    /// Local mount point.
    pub path: String,
    /// `nfs`, `smb`, ...
    #[serde(default)]
    pub mount_type: String,
    /// Remote export, e.g. `nas:/exports/data`.
    #[serde(default)]
    pub remote: String,
    pub status: MountStatus,
}

impl NetworkMount {
    /// Whether `path` lies on this mount.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        let root = self.path.trim_end_matches('/');
        if root.is_empty() {
            return path.starts_with('/');
        }
        path == root
            || path
                .strip_prefix(root)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == MountStatus::Connected
    }
}

/// A configured backup destination.
///
/// Connection parameters and the repository password are stored encrypted;
/// they are only ever decrypted right before the backup tool is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub repo_type: RepositoryType,
    /// Encrypted backend configuration JSON.
    pub config_encrypted: Vec<u8>,
    /// Encrypted repository password.
    pub password_encrypted: Vec<u8>,
    pub created_at: DateTime<Utc>,
}
