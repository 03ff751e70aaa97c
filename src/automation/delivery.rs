//! Outbound send intents and the downstream delivery contract.
//!
//! The core renders what to send; a delivery client owns transport. The call
//! is synchronous from the core's point of view: state only advances after the
//! sender returns `Ok`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DeliveryError;

/// Provider limit on reply buttons per message.
pub const MAX_REPLY_BUTTONS: usize = 3;
/// Provider limit on a reply button title, in characters.
pub const MAX_BUTTON_TITLE_CHARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

/// Message payload, one variant per provider message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        body: String,
    },
    Buttons {
        body: String,
        buttons: Vec<ReplyButton>,
    },
    Template {
        name: String,
        language: String,
        parameters: Vec<String>,
    },
    /// Structured data-collection form.
    Form {
        form_id: String,
        body: String,
        cta: String,
        /// Correlates the completion callback with the waiting state.
        state_id: Uuid,
    },
}

impl OutboundMessage {
    /// Everything except templates is free-form and needs an open window.
    pub fn requires_window(&self) -> bool {
        !matches!(self, OutboundMessage::Template { .. })
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            OutboundMessage::Text { .. } => "text",
            OutboundMessage::Buttons { .. } => "buttons",
            OutboundMessage::Template { .. } => "template",
            OutboundMessage::Form { .. } => "form",
        }
    }

    /// Check provider limits before handing the message to transport.
    pub fn validate(&self) -> Result<(), DeliveryError> {
        match self {
            OutboundMessage::Buttons { buttons, .. } => {
                if buttons.is_empty() || buttons.len() > MAX_REPLY_BUTTONS {
                    return Err(DeliveryError::InvalidIntent(format!(
                        "buttons message needs 1..={MAX_REPLY_BUTTONS} buttons, got {}",
                        buttons.len()
                    )));
                }
                if let Some(b) = buttons
                    .iter()
                    .find(|b| b.title.chars().count() > MAX_BUTTON_TITLE_CHARS)
                {
                    return Err(DeliveryError::InvalidIntent(format!(
                        "button '{}' title exceeds {MAX_BUTTON_TITLE_CHARS} characters",
                        b.id
                    )));
                }
                Ok(())
            }
            OutboundMessage::Text { body } if body.trim().is_empty() => Err(
                DeliveryError::InvalidIntent("text message body is empty".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// A request to send one message to one phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendIntent {
    pub workspace_id: String,
    pub account_id: String,
    pub phone_number: String,
    pub message: OutboundMessage,
}

/// Successful delivery result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: Option<String>,
}

/// Downstream delivery client.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, intent: &SendIntent) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Response body expected from the delivery endpoint.
#[derive(Debug, Deserialize)]
struct DeliveryResponse {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    provider_message_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Posts intents as JSON to a delivery service.
pub struct HttpSender {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpSender {
    pub fn new(url: String, token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
        }
    }
}

#[async_trait]
impl MessageSender for HttpSender {
    async fn send(&self, intent: &SendIntent) -> Result<DeliveryReceipt, DeliveryError> {
        intent.message.validate()?;

        let mut request = self.client.post(&self.url).json(intent);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let reason = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                reason,
            });
        }

        let body: DeliveryResponse = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Transport(format!("unreadable delivery response: {e}")))?;

        if !body.success {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                reason: body.error.unwrap_or_else(|| "unspecified".into()),
            });
        }

        debug!(
            phone_number = %intent.phone_number,
            message_type = intent.message.type_tag(),
            provider_message_id = ?body.provider_message_id,
            "Message delivered"
        );
        Ok(DeliveryReceipt {
            provider_message_id: body.provider_message_id,
        })
    }
}

/// Logs intents instead of sending them. Used when no delivery endpoint is
/// configured.
#[derive(Debug, Default)]
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send(&self, intent: &SendIntent) -> Result<DeliveryReceipt, DeliveryError> {
        intent.message.validate()?;
        let id = format!("log-{}", Uuid::new_v4());
        info!(
            workspace_id = %intent.workspace_id,
            phone_number = %intent.phone_number,
            message_type = intent.message.type_tag(),
            provider_message_id = %id,
            "Send intent (not delivered)"
        );
        Ok(DeliveryReceipt {
            provider_message_id: Some(id),
        })
    }
}
