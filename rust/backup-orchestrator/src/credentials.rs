//! Turning a stored [`Repository`] into something the backup tool can reach.
//!
//! Both collaborators are required. Without them the only possible outcome
//! would be a wrong or default destination, so their absence is a hard
//! [`OrchestratorError::MissingCollaborator`] rather than a skip.

use std::sync::Arc;

use backup_adapter::{ResticConfig, parse_backend};
use uuid::Uuid;

use crate::database::{KeyManager, MemoryStore};
use crate::domain::Repository;
use crate::error::{OrchestratorError, Result};

/// Decrypts a repository's stored backend configuration into plaintext JSON.
pub type DecryptFunc = Arc<dyn Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Looks up the password of a repository.
pub type PasswordFunc = Arc<dyn Fn(Uuid) -> anyhow::Result<String> + Send + Sync>;

/// The decrypt/password pair shared by every scheduler.
#[derive(Clone, Default)]
pub struct Credentials {
    decrypt: Option<DecryptFunc>,
    password: Option<PasswordFunc>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("decrypt", &self.decrypt.is_some())
            .field("password", &self.password.is_some())
            .finish()
    }
}

impl Credentials {
    /// No collaborators yet; every resolution fails until both are set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_decrypt(mut self, decrypt: DecryptFunc) -> Self {
        self.decrypt = Some(decrypt);
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: PasswordFunc) -> Self {
        self.password = Some(password);
        self
    }

    /// Production wiring: configs and passwords both decrypted with `keys`,
    /// passwords read from `store`.
    #[must_use]
    pub fn from_key_manager(keys: Arc<KeyManager>, store: Arc<MemoryStore>) -> Self {
        let decrypt_keys = Arc::clone(&keys);
        let decrypt: DecryptFunc = Arc::new(move |encrypted| decrypt_keys.decrypt(encrypted));
        let password: PasswordFunc = Arc::new(move |repository_id| {
            let encrypted = store
                .repository_password(repository_id)
                .ok_or_else(|| anyhow::anyhow!("repository {repository_id} has no password"))?;
            keys.decrypt_string(&encrypted)
        });
        Self::new().with_decrypt(decrypt).with_password(password)
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.decrypt.is_some() && self.password.is_some()
    }

    /// Decrypt, parse and validate the repository's backend, and build the
    /// config the backup tool is invoked with.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::MissingCollaborator`] when either function is unset
    /// - [`OrchestratorError::Decrypt`] when decryption or password lookup fails
    /// - [`OrchestratorError::Adapter`] when the backend config is invalid
    pub fn resolve(&self, repository: &Repository) -> Result<ResticConfig> {
        let decrypt = self
            .decrypt
            .as_ref()
            .ok_or(OrchestratorError::MissingCollaborator("decrypt function"))?;
        let password_fn = self
            .password
            .as_ref()
            .ok_or(OrchestratorError::MissingCollaborator("password function"))?;

        let config = decrypt(&repository.config_encrypted).map_err(|e| {
            OrchestratorError::Decrypt {
                repository: repository.name.clone(),
                reason: e.to_string(),
            }
        })?;
        let password = password_fn(repository.id).map_err(|e| OrchestratorError::Decrypt {
            repository: repository.name.clone(),
            reason: format!("password: {e}"),
        })?;

        let backend = parse_backend(repository.repo_type, &config)?;
        Ok(backend.to_restic_config(&password)?)
    }
}
