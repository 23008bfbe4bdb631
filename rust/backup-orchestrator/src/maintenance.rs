//! Maintenance windows that hold back scheduled backups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A period during which scheduled backups do not start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: Uuid,
    /// `None` applies to every organization.
    #[serde(default)]
    pub org_id: Option<Uuid>,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl MaintenanceWindow {
    /// Half-open: `starts_at <= at < ends_at`.
    #[must_use]
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && at < self.ends_at
    }

    #[must_use]
    pub fn applies_to(&self, org_id: Uuid) -> bool {
        self.org_id.is_none_or(|id| id == org_id)
    }
}

/// Can veto a scheduled firing.
#[async_trait]
pub trait MaintenanceGate: Send + Sync {
    /// The window blocking `org_id` at `at`, if any.
    async fn active_window(&self, org_id: Uuid, at: DateTime<Utc>) -> Option<MaintenanceWindow>;
}

/// In-memory set of windows.
#[derive(Debug, Default)]
pub struct MaintenanceWindows {
    windows: RwLock<Vec<MaintenanceWindow>>,
}

impl MaintenanceWindows {
    #[must_use]
    pub fn new(windows: Vec<MaintenanceWindow>) -> Self {
        Self {
            windows: RwLock::new(windows),
        }
    }

    pub fn add(&self, window: MaintenanceWindow) {
        self.windows.write().push(window);
    }

    pub fn remove(&self, window_id: Uuid) -> bool {
        let mut windows = self.windows.write();
        let before = windows.len();
        windows.retain(|w| w.id != window_id);
        windows.len() != before
    }

    /// Drop windows that ended before `now`. Returns how many were dropped.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut windows = self.windows.write();
        let before = windows.len();
        windows.retain(|w| w.ends_at > now);
        before - windows.len()
    }

    #[must_use]
    pub fn list(&self) -> Vec<MaintenanceWindow> {
        self.windows.read().clone()
    }
}

#[async_trait]
impl MaintenanceGate for MaintenanceWindows {
    async fn active_window(&self, org_id: Uuid, at: DateTime<Utc>) -> Option<MaintenanceWindow> {
        self.windows
            .read()
            .iter()
            .find(|w| w.applies_to(org_id) && w.is_active(at))
            .cloned()
    }
}
