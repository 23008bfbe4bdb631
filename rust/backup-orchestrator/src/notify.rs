//! Best-effort notifications.
//!
//! Every call site goes through [`notify_best_effort`]: a notification that
//! cannot be delivered is logged and never changes the outcome it reports.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

/// Events worth telling someone about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    BackupSucceeded {
        schedule_id: Uuid,
        schedule_name: String,
        agent_id: Uuid,
        repositories: usize,
        snapshot_ids: Vec<String>,
    },
    BackupFailed {
        schedule_id: Uuid,
        schedule_name: String,
        agent_id: Uuid,
        succeeded: usize,
        failed: usize,
        error: String,
    },
    BackupQueued {
        org_id: Uuid,
        agent_id: Uuid,
        schedule_id: Uuid,
        queue_position: Option<u32>,
    },
    VerificationFailing {
        repository_id: Uuid,
        repository_name: String,
        consecutive_failures: u32,
        error: String,
    },
    DrTestFinished {
        runbook_id: Uuid,
        runbook_name: String,
        test_id: Uuid,
        passed: bool,
        error: Option<String>,
    },
}

impl Notification {
    /// Event name as serialized.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::BackupSucceeded { .. } => "backup_succeeded",
            Self::BackupFailed { .. } => "backup_failed",
            Self::BackupQueued { .. } => "backup_queued",
            Self::VerificationFailing { .. } => "verification_failing",
            Self::DrTestFinished { .. } => "dr_test_finished",
        }
    }
}

/// Delivers notifications somewhere.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Send and swallow any error after logging it.
pub async fn notify_best_effort(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.notify(&notification).await {
        tracing::warn!(
            event = notification.event(),
            error = %e,
            "Failed to send notification"
        );
    }
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let payload = serde_json::to_string(notification)?;
        tracing::info!(event = notification.event(), %payload, "Notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    notification: &'a Notification,
    timestamp: DateTime<Utc>,
}

/// POSTs each notification as JSON to a URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: url::Url,
}

impl WebhookNotifier {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: url::Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.client
            .post(self.url.clone())
            .json(&WebhookPayload {
                notification,
                timestamp: Utc::now(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Keeps notifications in memory; for inspection in tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl MemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails (after recording).
    #[must_use]
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().push(notification.clone());
        if self.fail {
            anyhow::bail!("delivery refused");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_with_event_tag() {
        let n = Notification::BackupQueued {
            org_id: Uuid::nil(),
            agent_id: Uuid::nil(),
            schedule_id: Uuid::nil(),
            queue_position: Some(2),
        };
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["event"], "backup_queued");
        assert_eq!(value["queue_position"], 2);
        assert_eq!(n.event(), "backup_queued");
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        let notifier = MemoryNotifier::failing();
        notify_best_effort(
            &notifier,
            Notification::DrTestFinished {
                runbook_id: Uuid::nil(),
                runbook_name: "db failover".into(),
                test_id: Uuid::nil(),
                passed: false,
                error: Some("no snapshots".into()),
            },
        )
        .await;
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_error() {
        let notifier = WebhookNotifier::new(
            "http://127.0.0.1:9/hook".parse().unwrap(),
            Duration::from_millis(500),
        )
        .unwrap();
        let result = notifier
            .notify(&Notification::BackupQueued {
                org_id: Uuid::nil(),
                agent_id: Uuid::nil(),
                schedule_id: Uuid::nil(),
                queue_position: None,
            })
            .await;
        assert!(result.is_err());
    }
}
