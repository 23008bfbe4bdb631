//! Network-mount precondition for backups.

use crate::database::FleetStore;
use crate::domain::{MountStatus, Schedule};

/// A schedule path that sits on a mount which is not connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableMount {
    pub path: String,
    pub mount_path: String,
    pub status: MountStatus,
}

impl std::fmt::Display for UnavailableMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (mount {} is {:?})",
            self.path, self.mount_path, self.status
        )
    }
}

/// Paths of `schedule` whose network mount is unavailable.
///
/// This check is advisory and fails open: when the agent cannot be looked
/// up, the backup proceeds as if it had no mounts. Credential resolution,
/// by contrast, fails closed.
pub async fn check_network_mounts(
    store: &dyn FleetStore,
    schedule: &Schedule,
) -> Vec<UnavailableMount> {
    let agent = match store.get_agent(schedule.agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            tracing::debug!(agent_id = %schedule.agent_id, "Agent not found, skipping mount check");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(
                agent_id = %schedule.agent_id,
                error = %e,
                "Agent lookup failed, skipping mount check"
            );
            return Vec::new();
        }
    };

    schedule
        .paths
        .iter()
        .filter_map(|path| {
            let mount = agent.mount_for(path)?;
            (!mount.is_available()).then(|| UnavailableMount {
                path: path.clone(),
                mount_path: mount.path.clone(),
                status: mount.status,
            })
        })
        .collect()
}
