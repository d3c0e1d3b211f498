// Outbound email seam
// Decision: Job modules send through the Mailer trait so tests can record messages

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// File attached to an outbound email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAttachment {
    pub filename: String,
    /// Base64-encoded content
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A rendered-on-delivery email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub template: String,
    pub variables: BTreeMap<String, Value>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attachments: Vec<EmailAttachment>,
}

/// Errors from email delivery
#[derive(Debug, thiserror::Error)]
pub enum MailerError {
    /// The message can never be delivered as given
    #[error("rejected: {0}")]
    Rejected(String),

    /// Delivery failed and may succeed later
    #[error("delivery failed: {0}")]
    Unavailable(String),
}

impl MailerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Sends emails; returns the provider's message id
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, message: EmailMessage) -> Result<String, MailerError>;
}

/// Mailer that only logs, for development and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: EmailMessage) -> Result<String, MailerError> {
        let message_id = Uuid::now_v7().to_string();
        info!(
            message_id = %message_id,
            to = %message.to,
            template = %message.template,
            cc = message.cc.len(),
            bcc = message.bcc.len(),
            attachments = message.attachments.len(),
            "Email sent (log mailer)"
        );
        Ok(message_id)
    }
}
