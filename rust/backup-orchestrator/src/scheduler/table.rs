//! The cron table shared by the backup, DR test and verification schedulers.
//!
//! A [`CronTable`] owns one entry per enabled item, keyed by the item's id.
//! A single dispatcher task sleeps until the earliest next run and spawns one
//! execution unit per due entry, so a slow job never delays another. A second
//! task reloads the table on a fixed interval.
//!
//! Reloading is a diff against the current entries, never a rebuild:
//! entries whose id and expression are unchanged keep their entry id and
//! next-run time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cron::{CronExpression, CronParser};
use crate::error::{OrchestratorError, Result};

/// Longest the dispatcher sleeps before re-reading the table.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// An item that wants a cron entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSource {
    pub id: Uuid,
    pub expression: String,
}

impl CronSource {
    pub fn new(id: Uuid, expression: impl Into<String>) -> Self {
        Self {
            id,
            expression: expression.into(),
        }
    }
}

/// The unit of work behind a cron table.
#[async_trait]
pub trait CronJob: Send + Sync + 'static {
    /// Short name used in logs and errors (`"backup scheduler"`).
    fn kind(&self) -> &'static str;

    /// Every item that should currently be scheduled.
    async fn load_enabled(&self) -> Result<Vec<CronSource>>;

    /// One firing. Runs in its own task; failures are the job's to record.
    async fn run(&self, id: Uuid);
}

#[derive(Debug)]
struct Entry {
    entry_id: u64,
    expression: CronExpression,
    next_run: Option<DateTime<Utc>>,
}

/// What a reload changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Items skipped because their expression did not parse.
    pub invalid: usize,
}

/// A reconciled cron table driving one [`CronJob`].
pub struct CronTable<J: CronJob> {
    job: Arc<J>,
    entries: RwLock<HashMap<Uuid, Entry>>,
    next_entry_id: AtomicU64,
    running: AtomicBool,
    changed: Notify,
    reload_interval: Duration,
}

impl<J: CronJob> std::fmt::Debug for CronTable<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronTable")
            .field("kind", &self.job.kind())
            .field("entries", &self.entries.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<J: CronJob> CronTable<J> {
    #[must_use]
    pub fn new(job: Arc<J>, reload_interval: Duration) -> Self {
        Self {
            job,
            entries: RwLock::new(HashMap::new()),
            next_entry_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            changed: Notify::new(),
            reload_interval,
        }
    }

    #[must_use]
    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    /// Reload once, then start the dispatcher and the periodic reload loop.
    ///
    /// Both tasks stop when `cancel` fires. Executions already spawned run to
    /// completion.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::AlreadyRunning`] on a second start, or the error
    /// of the initial reload.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyRunning(self.job.kind()));
        }

        if let Err(e) = self.reload().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        tokio::spawn(Arc::clone(self).dispatch(cancel.clone()));
        tokio::spawn(Arc::clone(self).reload_loop(cancel));

        tracing::info!(
            kind = self.job.kind(),
            entries = self.len(),
            reload_interval_secs = self.reload_interval.as_secs(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Reconcile the table against the job's enabled items.
    ///
    /// An expression that fails to parse is logged and that item stays out of
    /// the table; it never fails the reload.
    ///
    /// # Errors
    ///
    /// Only when loading the enabled items fails.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let sources = self.job.load_enabled().await?;
        let now = Utc::now();
        let mut summary = ReloadSummary::default();

        {
            let mut entries = self.entries.write();

            let wanted: HashSet<Uuid> = sources.iter().map(|s| s.id).collect();
            let before = entries.len();
            entries.retain(|id, _| wanted.contains(id));
            summary.removed = before - entries.len();

            for source in &sources {
                let expression = source.expression.trim();
                if let Some(entry) = entries.get(&source.id) {
                    if entry.expression.source() == expression {
                        summary.unchanged += 1;
                        continue;
                    }
                    entries.remove(&source.id);
                    summary.removed += 1;
                }

                match CronParser::parse(expression) {
                    Ok(parsed) => {
                        let next_run = parsed.next_after(&now);
                        let entry_id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
                        entries.insert(
                            source.id,
                            Entry {
                                entry_id,
                                expression: parsed,
                                next_run,
                            },
                        );
                        summary.added += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            kind = self.job.kind(),
                            id = %source.id,
                            error = %e,
                            "Skipping item with invalid cron expression"
                        );
                        summary.invalid += 1;
                    }
                }
            }
        }

        if summary.added > 0 || summary.removed > 0 {
            self.changed.notify_one();
        }

        tracing::debug!(
            kind = self.job.kind(),
            added = summary.added,
            removed = summary.removed,
            unchanged = summary.unchanged,
            invalid = summary.invalid,
            "Cron table reloaded"
        );
        Ok(summary)
    }

    /// Spawn the job for `id` now, outside the table.
    pub fn trigger(&self, id: Uuid) {
        let job = Arc::clone(&self.job);
        tokio::spawn(async move { job.run(id).await });
    }

    /// Spawn every entry whose next run is at or before `now` and advance it.
    /// Returns the ids that were fired.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<Uuid> = {
            let mut entries = self.entries.write();
            entries
                .iter_mut()
                .filter_map(|(id, entry)| {
                    let at = entry.next_run.filter(|t| *t <= now)?;
                    // Never compute from a time before the slot just fired.
                    entry.next_run = entry.expression.next_after(&at.max(now));
                    Some(*id)
                })
                .collect()
        };

        for id in &due {
            tracing::debug!(kind = self.job.kind(), id = %id, "Cron entry fired");
            self.trigger(*id);
        }
        due
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Ids currently in the table.
    #[must_use]
    pub fn ids(&self) -> Vec<Uuid> {
        self.entries.read().keys().copied().collect()
    }

    /// Identity of the entry for `id`; changes only when the entry is replaced.
    #[must_use]
    pub fn entry_id(&self, id: Uuid) -> Option<u64> {
        self.entries.read().get(&id).map(|e| e.entry_id)
    }

    #[must_use]
    pub fn next_run(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.entries.read().get(&id).and_then(|e| e.next_run)
    }

    /// Parsed expression of the entry for `id`.
    #[must_use]
    pub fn expression(&self, id: Uuid) -> Option<CronExpression> {
        self.entries.read().get(&id).map(|e| e.expression.clone())
    }

    fn earliest_next_run(&self) -> Option<DateTime<Utc>> {
        self.entries.read().values().filter_map(|e| e.next_run).min()
    }

    async fn dispatch(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let wait = self.earliest_next_run().map_or(MAX_IDLE, |at| {
                (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(MAX_IDLE)
            });

            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.changed.notified() => continue,
                () = tokio::time::sleep(wait) => {}
            }

            self.fire_due(Utc::now());
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(kind = self.job.kind(), "Scheduler stopped");
    }

    async fn reload_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.reload_interval);
        // The first tick completes immediately; start() already reloaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reload().await {
                        tracing::error!(kind = self.job.kind(), error = %e, "Failed to reload schedules");
                    }
                }
            }
        }
    }
}
