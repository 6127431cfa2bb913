//! Outbound notification delivery.
//!
//! Delivery is fire-and-forget: a failed send is logged and reported as
//! `false`, never retried indefinitely, and never blocks tick processing.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

/// External notification channel (eg/ a chat-bot relay).
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    /// Deliver one message. Returns whether delivery succeeded.
    async fn notify(&self, message: &str) -> bool;
}

/// Sink that POSTs messages as JSON `{"text": ...}` to a webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    http: reqwest::Client,
    endpoint: Url,
}

impl WebhookSink {
    pub fn new(endpoint: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, message: &str) -> bool {
        let result = self
            .http
            .post(self.endpoint.clone())
            .json(&json!({ "text": message }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match result {
            Ok(_) => true,
            Err(error) => {
                warn!(%error, "webhook notification delivery failed");
                false
            }
        }
    }
}

/// Sink that only logs, for deployments without an external channel wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, message: &str) -> bool {
        debug!(%message, "notification");
        true
    }
}
