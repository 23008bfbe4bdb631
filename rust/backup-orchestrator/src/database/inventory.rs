//! Startup inventory: a YAML or JSON file describing the fleet, loaded into a
//! [`MemoryStore`].
//!
//! Repository configuration and passwords are written in plaintext in the
//! inventory and encrypted with the [`KeyManager`] on the way into the store.

use std::path::Path;

use anyhow::{Context, Result};
use backup_adapter::{RepositoryType, parse_backend};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::encryption::KeyManager;
use super::memory::MemoryStore;
use crate::domain::{
    Agent, BackupScript, DrRunbook, DrTestSchedule, Organization, Repository, Schedule,
    VerificationSchedule,
};
use crate::maintenance::MaintenanceWindow;

/// A repository as written in the inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositorySeed {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub repo_type: RepositoryType,
    /// Backend configuration, e.g. `{"path": "/srv/restic"}`.
    pub config: serde_json::Value,
    pub password: String,
}

/// Everything the daemon schedules.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub organizations: Vec<Organization>,
    pub agents: Vec<Agent>,
    pub repositories: Vec<RepositorySeed>,
    pub schedules: Vec<Schedule>,
    pub scripts: Vec<BackupScript>,
    pub verification_schedules: Vec<VerificationSchedule>,
    pub runbooks: Vec<DrRunbook>,
    pub dr_test_schedules: Vec<DrTestSchedule>,
    /// Not stored; handed to the backup scheduler's maintenance gate.
    pub maintenance_windows: Vec<MaintenanceWindow>,
}

/// Counts of what was seeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub organizations: usize,
    pub agents: usize,
    pub repositories: usize,
    pub schedules: usize,
}

impl Inventory {
    /// Read an inventory file. `.json` files are parsed as JSON, anything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&raw).context("Invalid JSON inventory")
        } else {
            serde_yaml::from_str(&raw).context("Invalid YAML inventory")
        }
    }

    /// Validate every repository backend and insert everything into `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if a repository's backend config does not validate or
    /// its credentials cannot be encrypted. Nothing is inserted in that case.
    pub fn seed(self, store: &MemoryStore, keys: &KeyManager) -> Result<SeedSummary> {
        let mut repositories = Vec::with_capacity(self.repositories.len());
        for seed in self.repositories {
            let config = serde_json::to_vec(&seed.config)?;
            parse_backend(seed.repo_type, &config)
                .with_context(|| format!("Repository '{}' has an invalid backend", seed.name))?;
            repositories.push(Repository {
                id: seed.id,
                org_id: seed.org_id,
                name: seed.name,
                repo_type: seed.repo_type,
                config_encrypted: keys.encrypt(&config)?,
                password_encrypted: keys.encrypt(seed.password.as_bytes())?,
                created_at: Utc::now(),
            });
        }

        let summary = SeedSummary {
            organizations: self.organizations.len(),
            agents: self.agents.len(),
            repositories: repositories.len(),
            schedules: self.schedules.len(),
        };

        for org in self.organizations {
            store.insert_organization(org);
        }
        for agent in self.agents {
            store.insert_agent(agent);
        }
        for repository in repositories {
            store.insert_repository(repository);
        }
        for schedule in self.schedules {
            store.upsert_schedule(schedule);
        }
        for script in self.scripts {
            store.insert_script(script);
        }
        for schedule in self.verification_schedules {
            store.upsert_verification_schedule(schedule);
        }
        for runbook in self.runbooks {
            store.insert_runbook(runbook);
        }
        for schedule in self.dr_test_schedules {
            store.upsert_dr_test_schedule(schedule);
        }

        tracing::info!(
            organizations = summary.organizations,
            agents = summary.agents,
            repositories = summary.repositories,
            schedules = summary.schedules,
            "Inventory loaded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{FleetStore, ScheduleStore};

    const INVENTORY: &str = r#"
organizations:
  - id: 6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a01
    name: acme
    max_concurrent_backups: 2
agents:
  - id: 6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a02
    org_id: 6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a01
    hostname: web-1
repositories:
  - id: 6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a03
    org_id: 6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a01
    name: local
    type: local
    config: { path: /srv/restic }
    password: hunter2
schedules:
  - id: 6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a04
    agent_id: 6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a02
    name: nightly
    cron_expression: "0 2 * * *"
    paths: [/etc]
    excluded_hours: [9, 10]
    repositories:
      - repository_id: 6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a03
"#;

    #[tokio::test]
    async fn test_seed_encrypts_repository_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.yaml");
        std::fs::write(&path, INVENTORY).unwrap();

        let keys = KeyManager::from_key([3u8; 32]);
        let store = MemoryStore::new();
        let summary = Inventory::load(&path).unwrap().seed(&store, &keys).unwrap();
        assert_eq!(summary.repositories, 1);
        assert_eq!(summary.schedules, 1);

        let repo_id: Uuid = "6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a03".parse().unwrap();
        let repo = store.get_repository(repo_id).await.unwrap().unwrap();
        assert_eq!(repo.repo_type, RepositoryType::Local);
        assert_eq!(keys.decrypt_string(&repo.password_encrypted).unwrap(), "hunter2");
        let config: serde_json::Value =
            serde_json::from_slice(&keys.decrypt(&repo.config_encrypted).unwrap()).unwrap();
        assert_eq!(config["path"], "/srv/restic");

        let schedules = store.get_enabled_schedules().await.unwrap();
        assert_eq!(schedules[0].excluded_hours, vec![9, 10]);
        assert_eq!(schedules[0].repositories[0].priority, 0);
    }

    #[test]
    fn test_maintenance_windows_parsed() {
        let inventory: Inventory = serde_yaml::from_str(
            r#"
maintenance_windows:
  - id: 6f1c1a52-8f59-4a37-9d3a-0d5c3b1f0a09
    name: storage migration
    starts_at: 2026-03-01T00:00:00Z
    ends_at: 2026-03-01T06:00:00Z
"#,
        )
        .unwrap();
        assert_eq!(inventory.maintenance_windows.len(), 1);
        assert!(inventory.maintenance_windows[0].org_id.is_none());
    }

    #[test]
    fn test_invalid_backend_rejected() {
        let inventory: Inventory = serde_json::from_value(serde_json::json!({
            "repositories": [{
                "id": Uuid::new_v4(),
                "org_id": Uuid::new_v4(),
                "name": "broken",
                "type": "s3",
                "config": { "bucket": "" },
                "password": "x"
            }]
        }))
        .unwrap();

        let store = MemoryStore::new();
        let err = inventory
            .seed(&store, &KeyManager::from_key([3u8; 32]))
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
