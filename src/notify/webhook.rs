use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{AppError, AppResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct CompletedNotice {
    pub organization: String,
    pub item_count: i64,
    pub amount_cents: i64,
    pub transfer_id: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedNotice {
    pub organization: String,
    pub item_count: i64,
    pub amount_cents: i64,
    pub error: String,
    pub idempotency_key: String,
}

/// Human notification channel. Delivery failures are logged by the caller and
/// never affect billing state.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn disbursement_completed(&self, notice: &CompletedNotice) -> AppResult<()>;
    async fn disbursement_failed(&self, notice: &FailedNotice) -> AppResult<()>;
}

/// Posts billing notices to an incoming-webhook channel
pub struct WebhookNotifier {
    http: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url,
        }
    }

    async fn post_text(&self, text: String) -> AppResult<()> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": text }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "webhook returned status {}",
                response.status()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn disbursement_completed(&self, notice: &CompletedNotice) -> AppResult<()> {
        let text = format!(
            ":money_with_wings: Billed {} - {} items, ${:.2} (transfer {}, key {})",
            notice.organization,
            notice.item_count,
            notice.amount_cents as f64 / 100.0,
            notice.transfer_id,
            notice.idempotency_key,
        );
        self.post_text(text).await
    }

    async fn disbursement_failed(&self, notice: &FailedNotice) -> AppResult<()> {
        let text = format!(
            ":rotating_light: Billing failed for {} - {} items, ${:.2}: {} (key {})",
            notice.organization,
            notice.item_count,
            notice.amount_cents as f64 / 100.0,
            notice.error,
            notice.idempotency_key,
        );
        self.post_text(text).await
    }
}

/// Sink used when no webhook is configured
pub struct NoopNotifier;

#[async_trait]
impl NotificationSink for NoopNotifier {
    async fn disbursement_completed(&self, notice: &CompletedNotice) -> AppResult<()> {
        debug!(
            "Notification suppressed (no webhook configured): billed {}",
            notice.organization
        );
        Ok(())
    }

    async fn disbursement_failed(&self, notice: &FailedNotice) -> AppResult<()> {
        debug!(
            "Notification suppressed (no webhook configured): billing failed for {}",
            notice.organization
        );
        Ok(())
    }
}
