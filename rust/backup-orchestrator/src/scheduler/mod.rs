//! Cron-driven scheduling.
//!
//! - [`cron`]: expression parsing and next-run computation
//! - [`table`]: the reconciled cron table every scheduler is built on
//! - [`backup`]: scheduled backups
//! - [`scripts`]: pre/post backup hooks
//! - [`mounts`]: the network-mount precondition

pub mod backup;
pub mod cron;
pub mod mounts;
pub mod scripts;
pub mod table;

pub use backup::{
    ActiveSchedule, BackupExecutor, BackupScheduler, ExecutionOutcome, ExecutionReport,
    SkipReason,
};
pub use cron::{CronExpression, CronParser};
pub use mounts::{UnavailableMount, check_network_mounts};
pub use scripts::{ScriptContext, ScriptRunner};
pub use table::{CronJob, CronSource, CronTable, ReloadSummary};
