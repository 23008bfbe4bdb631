//! Backup Orchestrator - scheduling and concurrency control on top of restic
//!
//! This crate drives a fleet of backup agents through the [`backup_adapter`]
//! crate, adding everything a bare backup tool lacks:
//!
//! - **Scheduling**: cron tables for backups, verifications and DR tests,
//!   reconciled against the store on an interval
//! - **Admission control**: per-organization and per-agent ceilings with a
//!   FIFO queue and one promotion per released slot
//! - **Fan-out**: one firing backs up to every enabled repository of a
//!   schedule and replicates the first snapshot to the others
//! - **Hooks and preconditions**: pre/post scripts, network mounts,
//!   excluded hours and maintenance windows
//! - **Verification**: integrity checks, trial restores, DR tests and
//!   post-backup validation
//!
//! # Architecture
//!
//! - [`scheduler`]: the cron table and the backup executor
//! - [`concurrency`]: slot accounting and the backup queue
//! - [`verification`], [`drtest`], [`validator`]: checking what was written
//! - [`restore`], [`retention`]: satellite workflows
//! - [`database`]: store traits, the in-memory store, encryption, inventory
//! - [`domain`]: records and their lifecycles
//! - [`app`]: daemon wiring
//!
//! # Example
//!
//! ```rust,ignore
//! use backup_orchestrator::{App, config::AppConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = AppConfig::load(None)?;
//! let app = App::build(&config)?;
//! let cancel = CancellationToken::new();
//! app.start(&cancel).await?;
//! ```

pub mod app;
pub mod concurrency;
pub mod config;
pub mod credentials;
pub mod database;
pub mod domain;
pub mod drtest;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod notify;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod validator;
pub mod verification;

pub use app::App;
pub use concurrency::{Admission, ConcurrencyManager, ConcurrencyStatus, QueueReason, SlotAcquisition};
pub use credentials::Credentials;
pub use drtest::{DrTestExecutor, DrTestScheduler};
pub use error::{OrchestratorError, Result};
pub use maintenance::{MaintenanceGate, MaintenanceWindow, MaintenanceWindows};
pub use notify::{Notification, Notifier};
pub use restore::{RestoreRequest, RestoreService};
pub use retention::{RetentionEnforcer, RetentionSummary};
pub use scheduler::{BackupExecutor, BackupScheduler, ExecutionOutcome, SkipReason};
pub use validator::BackupValidator;
pub use verification::{VerificationExecutor, VerificationRequest, VerificationScheduler};
