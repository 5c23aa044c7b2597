use std::sync::Arc;

use async_trait::async_trait;
use common_observability::FulfillmentMetrics;
use uuid::Uuid;

/// What happened, from the buyer's point of view. The dispatcher itself is
/// an external collaborator; this core only fires and forgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    OrderConfirmed,
    OrderCancelled,
    OrderRefunded,
    WaitlistPromoted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OrderConfirmed => "order.confirmed",
            NotificationKind::OrderCancelled => "order.cancelled",
            NotificationKind::OrderRefunded => "order.refunded",
            NotificationKind::WaitlistPromoted => "waitlist.promoted",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: NotificationKind, subject_id: Uuid) -> anyhow::Result<()>;
}

/// Posts notification requests to the dispatcher service.
pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, kind: NotificationKind, subject_id: Uuid) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(format!("{}/notifications", self.base_url))
            .json(&serde_json::json!({
                "kind": kind.as_str(),
                "subject_id": subject_id,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("dispatcher returned {}", resp.status());
        }
        Ok(())
    }
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _kind: NotificationKind, _subject_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fire-and-forget handle: a failed delivery is counted and logged, never
/// surfaced to the state transition that triggered it.
#[derive(Clone)]
pub struct NotifyHandle {
    notifier: Arc<dyn Notifier>,
    metrics: Arc<FulfillmentMetrics>,
}

impl NotifyHandle {
    pub fn new(notifier: Arc<dyn Notifier>, metrics: Arc<FulfillmentMetrics>) -> Self {
        Self { notifier, metrics }
    }

    pub fn fire(&self, kind: NotificationKind, subject_id: Uuid) {
        let notifier = self.notifier.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(kind, subject_id).await {
                metrics.notify_failures.inc();
                tracing::warn!(
                    error = %err,
                    kind = kind.as_str(),
                    subject_id = %subject_id,
                    "Notification dispatch failed"
                );
            }
        });
    }
}
