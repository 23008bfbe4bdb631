//! Backup Adapter - typed access to the restic backup tool
//!
//! This crate wraps the `restic` command line behind the [`BackupTool`]
//! trait so the orchestrator never deals with process spawning or output
//! formats:
//!
//! - [`tool`]: the [`BackupTool`] contract
//! - [`restic`]: the subprocess implementation ([`Restic`])
//! - [`output`]: decoding of restic's line-delimited JSON output
//! - [`backend`]: typed repository backends and their restic locations
//! - [`types`]: options and results shared by all of the above
//!
//! # Example
//!
//! ```rust,ignore
//! use backup_adapter::{BackupTool, Restic, ResticConfig, BackupOptions};
//!
//! let restic = Restic::default();
//! let repo = ResticConfig::new("/srv/restic", "secret");
//! let stats = restic
//!     .backup(&repo, &["/etc".into()], &[], &BackupOptions::default())
//!     .await?;
//! println!("snapshot {}", stats.snapshot_id);
//! ```

pub mod backend;
pub mod error;
pub mod output;
pub mod restic;
pub mod tool;
pub mod types;

pub use backend::{Backend, RepositoryType, parse_backend};
pub use error::{AdapterError, AdapterResult};
pub use restic::Restic;
pub use tool::BackupTool;
pub use types::{
    BackupOptions, BackupStats, ChangeKind, CheckOptions, CheckResult, CompressionMode,
    DiffChange, DiffResult, ForgetResult, NodeType, RepoStats, ResticConfig, RestoreOptions,
    RestoreSummary, RetentionPolicy, Snapshot, SnapshotFile,
};
