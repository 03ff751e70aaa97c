//! Error types for the automation core.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by the downstream delivery client.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Provider rejected message ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Invalid send intent: {0}")]
    InvalidIntent(String),
}

/// Flow definition problems detected at load or execution time.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Flow {flow_id} is invalid: {reason}")]
    InvalidGraph { flow_id: Uuid, reason: String },

    #[error("Node {node_id} not found in flow {flow_id}")]
    NodeNotFound { flow_id: Uuid, node_id: String },

    #[error("Flow {0} not found")]
    FlowNotFound(Uuid),
}

/// Failure kinds of the automation layer.
///
/// "No match" is deliberately absent: it is a normal outcome, not an error.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("Messaging window closed for {phone_number} (last inbound {last_inbound_at:?})")]
    WindowClosed {
        phone_number: String,
        last_inbound_at: Option<DateTime<Utc>>,
    },

    #[error("Rule {rule_id} rate limited: {reason}")]
    RateLimited { rule_id: Uuid, reason: String },

    #[error("Input '{input}' matches no continuation of node {node_id} (state {state_id})")]
    UnmatchedContinuation {
        state_id: Uuid,
        node_id: String,
        input: String,
    },

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("State {state_id} is stale ({idle_hours}h since last inbound)")]
    StaleState { state_id: Uuid, idle_hours: i64 },

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Collaborator {name} failed: {reason}")]
    Collaborator { name: String, reason: String },
}

impl AutomationError {
    /// Short label for logging and outcome reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WindowClosed { .. } => "window_closed",
            Self::RateLimited { .. } => "rate_limited",
            Self::UnmatchedContinuation { .. } => "unmatched_continuation",
            Self::Delivery(_) => "delivery_failure",
            Self::StaleState { .. } => "stale_state",
            Self::Flow(_) => "flow",
            Self::Database(_) => "database",
            Self::Collaborator { .. } => "collaborator",
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automation_error_kinds() {
        let err = AutomationError::WindowClosed {
            phone_number: "+15550001".into(),
            last_inbound_at: None,
        };
        assert_eq!(err.kind(), "window_closed");

        let err: AutomationError = DeliveryError::Transport("timeout".into()).into();
        assert_eq!(err.kind(), "delivery_failure");
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn top_level_wraps_database_error() {
        let err: Error = DatabaseError::Query("boom".into()).into();
        assert!(matches!(err, Error::Database(_)));
        assert!(err.to_string().contains("boom"));
    }
}
