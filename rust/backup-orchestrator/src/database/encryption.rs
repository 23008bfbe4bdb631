//! Repository credential encryption using AES-256-GCM.
//!
//! Backend configuration JSON and repository passwords are stored as
//! base64(nonce || ciphertext). A fresh random nonce is drawn per encryption.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;
use std::path::{Path, PathBuf};

const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;

/// Holds the cipher used for repository credentials.
pub struct KeyManager {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("cipher", &"<redacted>")
            .finish()
    }
}

impl KeyManager {
    /// Load the key at `key_path`, generating and saving a new one if the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the key file cannot be read or written, or holds
    /// something other than a base64-encoded 32-byte key.
    pub fn new(key_path: &Path) -> Result<Self> {
        let key = Self::load_or_generate_key(key_path)?;
        Ok(Self::from_key(key))
    }

    /// Build from raw key material.
    #[must_use]
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// `~/.backup-orchestrator/encryption.key`.
    ///
    /// # Errors
    ///
    /// Returns an error if no home directory can be determined.
    pub fn default_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .context("Could not determine home directory")?;
        Ok(PathBuf::from(home)
            .join(".backup-orchestrator")
            .join("encryption.key"))
    }

    /// Encrypt `plaintext` into base64(nonce || ciphertext).
    ///
    /// # Errors
    ///
    /// Returns an error if the cipher rejects the input.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("Encryption failed: {e}"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(combined).into_bytes())
    }

    /// Reverse of [`KeyManager::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns an error on invalid base64, truncated input, or a failed
    /// authentication tag (wrong key or tampered data).
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        let combined = general_purpose::STANDARD
            .decode(encrypted)
            .context("Invalid base64")?;

        if combined.len() < NONCE_SIZE {
            anyhow::bail!("Invalid encrypted data: too short");
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {e}"))
    }

    /// Decrypt into a UTF-8 string (passwords).
    ///
    /// # Errors
    ///
    /// Same as [`KeyManager::decrypt`], plus invalid UTF-8.
    pub fn decrypt_string(&self, encrypted: &[u8]) -> Result<String> {
        String::from_utf8(self.decrypt(encrypted)?).context("Invalid UTF-8 in decrypted data")
    }

    fn load_or_generate_key(path: &Path) -> Result<[u8; KEY_SIZE]> {
        if path.exists() {
            let encoded =
                std::fs::read_to_string(path).context("Failed to read encryption key file")?;
            let bytes = general_purpose::STANDARD
                .decode(encoded.trim())
                .context("Invalid base64 in key file")?;

            let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("Invalid key size: expected {KEY_SIZE}, got {}", bytes.len())
            })?;
            return Ok(key);
        }

        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create key directory")?;
        }
        std::fs::write(path, general_purpose::STANDARD.encode(key))
            .context("Failed to write encryption key file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)
                .context("Failed to get key file metadata")?
                .permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms).context("Failed to set key file permissions")?;
        }

        tracing::info!(path = %path.display(), "Generated new encryption key");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_encrypt_decrypt() {
        let dir = tempdir().unwrap();
        let km = KeyManager::new(&dir.path().join("test.key")).unwrap();

        let config = br#"{"path":"/srv/restic"}"#;
        let encrypted = km.encrypt(config).unwrap();
        assert_ne!(encrypted.as_slice(), config.as_slice());
        assert_eq!(km.decrypt(&encrypted).unwrap(), config);

        // Fresh nonce every time.
        assert_ne!(km.encrypt(config).unwrap(), encrypted);
    }

    #[test]
    fn test_key_is_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("test.key");

        let encrypted = KeyManager::new(&path).unwrap().encrypt(b"hunter2").unwrap();
        let reloaded = KeyManager::new(&path).unwrap();
        assert_eq!(reloaded.decrypt_string(&encrypted).unwrap(), "hunter2");
    }

    #[test]
    fn test_wrong_key_and_garbage_rejected() {
        let km = KeyManager::from_key([7u8; 32]);
        let other = KeyManager::from_key([8u8; 32]);
        let encrypted = km.encrypt(b"secret").unwrap();

        assert!(other.decrypt(&encrypted).is_err());
        assert!(km.decrypt(b"not-base64!@#$").is_err());
        assert!(
            km.decrypt(general_purpose::STANDARD.encode([1, 2, 3]).as_bytes())
                .is_err()
        );
    }

    #[test]
    fn test_bad_key_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.key");
        std::fs::write(&path, general_purpose::STANDARD.encode([0u8; 16])).unwrap();
        let err = KeyManager::new(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid key size"));
    }
}
