//! AI fallback collaborator.
//!
//! The core does no language understanding of its own. `ai_chat` rules and
//! `ai` responses hand the message to an [`AiResponder`] and send back
//! whatever text it returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AutomationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiRequest {
    pub workspace_id: String,
    pub account_id: String,
    pub phone_number: String,
    pub message: String,
    /// Extra instructions configured on the rule.
    pub instructions: Option<String>,
}

#[async_trait]
pub trait AiResponder: Send + Sync {
    /// Produce a reply, or `None` to stay silent. Failures should be reported
    /// as [`AutomationError::Collaborator`].
    async fn respond(&self, request: &AiRequest) -> Result<Option<String>, AutomationError>;
}
