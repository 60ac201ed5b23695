// ============================================================================
// Notifications
// ============================================================================
//
// Text messages to users and channels. Delivery is best-effort: callers log
// a failed notification and carry on, a ledger change is never undone because
// a message did not go out.
//
// ============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::market_resolve::markets::{ChannelId, UserId};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, user_id: UserId, text: &str) -> Result<(), NotifyError>;

    async fn notify_channel(&self, channel_id: ChannelId, text: &str) -> Result<(), NotifyError>;
}

/// Send to a user, logging instead of failing.
pub async fn send_user(notifier: &dyn Notifier, user_id: UserId, text: &str) {
    if let Err(e) = notifier.notify_user(user_id, text).await {
        warn!(user_id, error = %e, "user notification dropped");
    }
}

/// Send to a channel, logging instead of failing.
pub async fn send_channel(notifier: &dyn Notifier, channel_id: ChannelId, text: &str) {
    if let Err(e) = notifier.notify_channel(channel_id, text).await {
        warn!(channel_id, error = %e, "channel notification dropped");
    }
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_user(&self, user_id: UserId, text: &str) -> Result<(), NotifyError> {
        info!(user_id, message = text, "notify user");
        Ok(())
    }

    async fn notify_channel(&self, channel_id: ChannelId, text: &str) -> Result<(), NotifyError> {
        info!(channel_id, message = text, "notify channel");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    User(UserId),
    Channel(ChannelId),
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipient: Recipient,
    text: &'a str,
}

/// POSTs `{ "recipient": {"kind", "id"}, "text" }` to a webhook (a chat bot bridge)
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = crate::http::client_with_timeout(Duration::from_secs(5), "notify webhook");
        Self {
            url: url.into(),
            client,
        }
    }

    async fn post(&self, recipient: Recipient, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { recipient, text })
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Delivery(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_user(&self, user_id: UserId, text: &str) -> Result<(), NotifyError> {
        self.post(Recipient::User(user_id), text).await
    }

    async fn notify_channel(&self, channel_id: ChannelId, text: &str) -> Result<(), NotifyError> {
        self.post(Recipient::Channel(channel_id), text).await
    }
}

/// Keeps every message in memory, in send order
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(Recipient, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Recipient, String)> {
        self.sent.lock().clone()
    }

    pub fn messages_for(&self, recipient: Recipient) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(r, _)| *r == recipient)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify_user(&self, user_id: UserId, text: &str) -> Result<(), NotifyError> {
        self.sent.lock().push((Recipient::User(user_id), text.to_string()));
        Ok(())
    }

    async fn notify_channel(&self, channel_id: ChannelId, text: &str) -> Result<(), NotifyError> {
        self.sent.lock().push((Recipient::Channel(channel_id), text.to_string()));
        Ok(())
    }
}
