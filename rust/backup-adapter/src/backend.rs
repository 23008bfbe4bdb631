//! Typed repository backends.
//!
//! A repository row stores its backend parameters as an (encrypted) JSON
//! blob plus a type tag. [`parse_backend`] turns the decrypted blob into a
//! [`Backend`], which knows how to validate itself and how to express
//! itself as a [`ResticConfig`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AdapterError, AdapterResult};
use crate::types::ResticConfig;

/// Repository backend kind as persisted alongside the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    Local,
    S3,
    B2,
    Sftp,
    Rest,
    /// Any remote reachable through rclone.
    Rclone,
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::B2 => "b2",
            Self::Sftp => "sftp",
            Self::Rest => "rest",
            Self::Rclone => "rclone",
        };
        f.write_str(name)
    }
}

impl FromStr for RepositoryType {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "b2" => Ok(Self::B2),
            "sftp" => Ok(Self::Sftp),
            "rest" => Ok(Self::Rest),
            "rclone" => Ok(Self::Rclone),
            other => Err(AdapterError::InvalidBackend(format!(
                "unknown repository type '{other}'"
            ))),
        }
    }
}

/// Local filesystem repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBackend {
    pub path: String,
}

/// Amazon S3 or any S3-compatible object store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Backend {
    /// Defaults to `s3.amazonaws.com`.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Backblaze B2.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct B2Backend {
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    pub account_id: String,
    pub application_key: String,
}

/// Repository on a host reachable over SFTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftpBackend {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub user: String,
    pub path: String,
}

/// restic REST server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestBackend {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Any rclone remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcloneBackend {
    pub remote: String,
    pub path: String,
}

macro_rules! redacted_debug {
    ($ty:ty, $name:literal, [$($field:ident),*]) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct($name)
                    $(.field(stringify!($field), &self.$field))*
                    .finish_non_exhaustive()
            }
        }
    };
}

redacted_debug!(S3Backend, "S3Backend", [endpoint, bucket, prefix, region]);
redacted_debug!(B2Backend, "B2Backend", [bucket, prefix]);
redacted_debug!(RestBackend, "RestBackend", [url, username]);

/// A repository backend, closed over the supported kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Local(LocalBackend),
    S3(S3Backend),
    B2(B2Backend),
    Sftp(SftpBackend),
    Rest(RestBackend),
    Rclone(RcloneBackend),
}

/// Parse a decrypted backend configuration blob for the given type.
pub fn parse_backend(repo_type: RepositoryType, config_json: &[u8]) -> AdapterResult<Backend> {
    let backend = match repo_type {
        RepositoryType::Local => Backend::Local(decode(repo_type, config_json)?),
        RepositoryType::S3 => Backend::S3(decode(repo_type, config_json)?),
        RepositoryType::B2 => Backend::B2(decode(repo_type, config_json)?),
        RepositoryType::Sftp => Backend::Sftp(decode(repo_type, config_json)?),
        RepositoryType::Rest => Backend::Rest(decode(repo_type, config_json)?),
        RepositoryType::Rclone => Backend::Rclone(decode(repo_type, config_json)?),
    };
    backend.validate()?;
    Ok(backend)
}

fn decode<T: for<'de> Deserialize<'de>>(repo_type: RepositoryType, json: &[u8]) -> AdapterResult<T> {
    serde_json::from_slice(json)
        .map_err(|e| AdapterError::InvalidBackend(format!("{repo_type} config: {e}")))
}

fn require(field: &str, value: &str, kind: RepositoryType) -> AdapterResult<()> {
    if value.trim().is_empty() {
        return Err(AdapterError::InvalidBackend(format!(
            "{kind} backend requires '{field}'"
        )));
    }
    Ok(())
}

impl Backend {
    /// The kind tag of this backend.
    #[must_use]
    pub fn repo_type(&self) -> RepositoryType {
        match self {
            Self::Local(_) => RepositoryType::Local,
            Self::S3(_) => RepositoryType::S3,
            Self::B2(_) => RepositoryType::B2,
            Self::Sftp(_) => RepositoryType::Sftp,
            Self::Rest(_) => RepositoryType::Rest,
            Self::Rclone(_) => RepositoryType::Rclone,
        }
    }

    /// Check that all required fields are present and well formed.
    pub fn validate(&self) -> AdapterResult<()> {
        let kind = self.repo_type();
        match self {
            Self::Local(b) => require("path", &b.path, kind),
            Self::S3(b) => {
                require("bucket", &b.bucket, kind)?;
                require("access_key_id", &b.access_key_id, kind)?;
                require("secret_access_key", &b.secret_access_key, kind)?;
                if let Some(endpoint) = &b.endpoint {
                    if endpoint.contains("://") {
                        url::Url::parse(endpoint).map_err(|e| {
                            AdapterError::InvalidBackend(format!("s3 endpoint '{endpoint}': {e}"))
                        })?;
                    }
                }
                Ok(())
            }
            Self::B2(b) => {
                require("bucket", &b.bucket, kind)?;
                require("account_id", &b.account_id, kind)?;
                require("application_key", &b.application_key, kind)
            }
            Self::Sftp(b) => {
                require("host", &b.host, kind)?;
                require("user", &b.user, kind)?;
                require("path", &b.path, kind)
            }
            Self::Rest(b) => {
                require("url", &b.url, kind)?;
                let parsed = url::Url::parse(&b.url)
                    .map_err(|e| AdapterError::InvalidBackend(format!("rest url '{}': {e}", b.url)))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(AdapterError::InvalidBackend(format!(
                        "rest url must be http or https, got '{}'",
                        parsed.scheme()
                    )));
                }
                Ok(())
            }
            Self::Rclone(b) => {
                require("remote", &b.remote, kind)?;
                require("path", &b.path, kind)
            }
        }
    }

    /// Express this backend as a restic repository location plus environment.
    pub fn to_restic_config(&self, password: &str) -> AdapterResult<ResticConfig> {
        self.validate()?;

        let config = match self {
            Self::Local(b) => ResticConfig::new(&b.path, password),
            Self::S3(b) => {
                let endpoint = b
                    .endpoint
                    .as_deref()
                    .unwrap_or("s3.amazonaws.com")
                    .trim_end_matches('/');
                let mut location = format!("s3:{endpoint}/{}", b.bucket);
                if let Some(prefix) = b.prefix.as_deref().filter(|p| !p.is_empty()) {
                    location.push('/');
                    location.push_str(prefix.trim_matches('/'));
                }
                let mut config = ResticConfig::new(location, password)
                    .with_env("AWS_ACCESS_KEY_ID", &b.access_key_id)
                    .with_env("AWS_SECRET_ACCESS_KEY", &b.secret_access_key);
                if let Some(region) = &b.region {
                    config = config.with_env("AWS_DEFAULT_REGION", region);
                }
                config
            }
            Self::B2(b) => {
                let prefix = b.prefix.as_deref().unwrap_or("").trim_matches('/');
                ResticConfig::new(format!("b2:{}:{prefix}", b.bucket), password)
                    .with_env("B2_ACCOUNT_ID", &b.account_id)
                    .with_env("B2_ACCOUNT_KEY", &b.application_key)
            }
            Self::Sftp(b) => {
                let host = match b.port {
                    Some(port) if port != 22 => format!("{}:{port}", b.host),
                    _ => b.host.clone(),
                };
                ResticConfig::new(format!("sftp:{}@{host}:{}", b.user, b.path), password)
            }
            Self::Rest(b) => {
                let mut url = url::Url::parse(&b.url)
                    .map_err(|e| AdapterError::InvalidBackend(e.to_string()))?;
                if let Some(user) = &b.username {
                    url.set_username(user)
                        .map_err(|()| AdapterError::InvalidBackend("rest url cannot carry a username".into()))?;
                    url.set_password(b.password.as_deref())
                        .map_err(|()| AdapterError::InvalidBackend("rest url cannot carry a password".into()))?;
                }
                ResticConfig::new(format!("rest:{url}"), password)
            }
            Self::Rclone(b) => {
                ResticConfig::new(format!("rclone:{}:{}", b.remote, b.path), password)
            }
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_backend() {
        let backend = parse_backend(RepositoryType::Local, br#"{"path":"/srv/restic"}"#).unwrap();
        let cfg = backend.to_restic_config("pw").unwrap();
        assert_eq!(cfg.repository, "/srv/restic");
        assert_eq!(cfg.password, "pw");
        assert!(cfg.env.is_empty());
    }

    #[test]
    fn test_s3_backend_builds_location_and_env() {
        let json = br#"{
            "endpoint": "https://minio.internal:9000/",
            "bucket": "backups",
            "prefix": "/fleet/",
            "region": "eu-west-1",
            "access_key_id": "AKIA",
            "secret_access_key": "secret"
        }"#;
        let backend = parse_backend(RepositoryType::S3, json).unwrap();
        let cfg = backend.to_restic_config("pw").unwrap();
        assert_eq!(cfg.repository, "s3:https://minio.internal:9000/backups/fleet");
        assert_eq!(cfg.env.get("AWS_ACCESS_KEY_ID").map(String::as_str), Some("AKIA"));
        assert_eq!(cfg.env.get("AWS_DEFAULT_REGION").map(String::as_str), Some("eu-west-1"));
    }

    #[test]
    fn test_s3_defaults_to_aws_endpoint() {
        let json = br#"{"bucket":"b","access_key_id":"a","secret_access_key":"s"}"#;
        let cfg = parse_backend(RepositoryType::S3, json)
            .unwrap()
            .to_restic_config("pw")
            .unwrap();
        assert_eq!(cfg.repository, "s3:s3.amazonaws.com/b");
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let err = parse_backend(RepositoryType::S3, br#"{"bucket":"b","access_key_id":"","secret_access_key":"s"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("access_key_id"));

        let err = parse_backend(RepositoryType::Sftp, br#"{"host":"h"}"#).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidBackend(_)));
    }

    #[test]
    fn test_sftp_non_default_port() {
        let json = br#"{"host":"nas","port":2222,"user":"backup","path":"/volume1/restic"}"#;
        let cfg = parse_backend(RepositoryType::Sftp, json)
            .unwrap()
            .to_restic_config("pw")
            .unwrap();
        assert_eq!(cfg.repository, "sftp:backup@nas:2222:/volume1/restic");
    }

    #[test]
    fn test_rest_backend_embeds_credentials() {
        let json = br#"{"url":"https://rest.example.com/repo","username":"u","password":"p"}"#;
        let cfg = parse_backend(RepositoryType::Rest, json)
            .unwrap()
            .to_restic_config("pw")
            .unwrap();
        assert_eq!(cfg.repository, "rest:https://u:p@rest.example.com/repo");

        let err = parse_backend(RepositoryType::Rest, br#"{"url":"ftp://x/repo"}"#).unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[test]
    fn test_repository_type_round_trips_through_str() {
        for kind in ["local", "s3", "b2", "sftp", "rest", "rclone"] {
            let parsed: RepositoryType = kind.parse().unwrap();
            assert_eq!(parsed.to_string(), kind);
        }
        assert!("ftp".parse::<RepositoryType>().is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let json = br#"{"bucket":"b","access_key_id":"a","secret_access_key":"very-secret"}"#;
        let backend = parse_backend(RepositoryType::S3, json).unwrap();
        assert!(!format!("{backend:?}").contains("very-secret"));
    }
}
