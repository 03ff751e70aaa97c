//! Automation rules: the simpler keyword/command/FAQ/AI layer that sits next
//! to visual flows.
//!
//! A rule pairs one trigger with one response. Unlike flows it keeps no
//! conversation state, but it is rate limited per conversation through the
//! append-only trigger log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::automation::trigger::{TriggerConfig, TriggerKind};
use crate::flows::ButtonOption;

fn default_language() -> String {
    "en".to_string()
}

/// What a rule sends (or starts) when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleResponse {
    /// Plain text reply.
    Text { text: String },
    /// Text plus up to three reply buttons.
    Buttons {
        text: String,
        buttons: Vec<ButtonOption>,
    },
    /// Pre-approved template; allowed outside the messaging window.
    Template {
        name: String,
        #[serde(default = "default_language")]
        language: String,
        #[serde(default)]
        parameters: Vec<String>,
    },
    /// Hand the conversation over to a flow.
    StartFlow { flow_id: Uuid },
    /// Ask the AI collaborator for a reply.
    Ai {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
}

impl RuleResponse {
    pub fn type_tag(&self) -> &'static str {
        match self {
            RuleResponse::Text { .. } => "text",
            RuleResponse::Buttons { .. } => "buttons",
            RuleResponse::Template { .. } => "template",
            RuleResponse::StartFlow { .. } => "start_flow",
            RuleResponse::Ai { .. } => "ai",
        }
    }

    /// Parse a response from its DB representation (type column + config JSON).
    pub fn from_db(response_type: &str, config: serde_json::Value) -> Result<Self, String> {
        let mut object = match config {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => return Err(format!("response config must be an object, got {other}")),
        };
        object.insert("type".into(), serde_json::Value::String(response_type.into()));
        serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| format!("invalid {response_type} response: {e}"))
    }

    /// Config JSON for the DB, without the type tag.
    pub fn to_config_json(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("type");
                serde_json::Value::Object(map)
            }
            _ => serde_json::json!({}),
        }
    }
}

/// A keyword/command/FAQ/AI rule scoped to (workspace, account).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub workspace_id: String,
    pub account_id: String,
    pub name: String,
    pub trigger: TriggerKind,
    pub trigger_config: TriggerConfig,
    pub response: RuleResponse,
    pub is_active: bool,
    /// Lower value wins.
    pub priority: i64,
    /// Minimum seconds between firings for one conversation. 0 disables.
    pub cooldown_seconds: u64,
    /// Firings per conversation per local day. 0 disables.
    pub max_triggers_per_day: u32,

    // Statistics (core-managed)
    pub trigger_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRule {
    pub fn new(
        workspace_id: &str,
        account_id: &str,
        name: &str,
        trigger: TriggerKind,
        response: RuleResponse,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.into(),
            account_id: account_id.into(),
            name: name.into(),
            trigger,
            trigger_config: TriggerConfig::default(),
            response,
            is_active: true,
            priority: 100,
            cooldown_seconds: 0,
            max_triggers_per_day: 0,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trigger_config(mut self, config: TriggerConfig) -> Self {
        self.trigger_config = config;
        self
    }

    pub fn with_cooldown(mut self, seconds: u64) -> Self {
        self.cooldown_seconds = seconds;
        self
    }

    pub fn with_daily_cap(mut self, max: u32) -> Self {
        self.max_triggers_per_day = max;
        self
    }

    pub fn has_limits(&self) -> bool {
        self.cooldown_seconds > 0 || self.max_triggers_per_day > 0
    }
}

/// One row of the append-only rule trigger log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTriggerLogEntry {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub conversation_id: String,
    pub trigger_message_id: Option<String>,
    pub trigger_text: String,
    pub matched_keyword: Option<String>,
    /// Whether the response was delivered. Only successful entries count
    /// toward cooldowns and daily caps.
    pub response_success: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_db_roundtrip() {
        let responses = [
            RuleResponse::Text { text: "hi".into() },
            RuleResponse::Buttons {
                text: "pick".into(),
                buttons: vec![ButtonOption::new("y", "Yes")],
            },
            RuleResponse::Template {
                name: "reengage".into(),
                language: "pt_BR".into(),
                parameters: vec!["Ana".into()],
            },
            RuleResponse::StartFlow {
                flow_id: Uuid::new_v4(),
            },
            RuleResponse::Ai { instructions: None },
        ];
        for response in responses {
            let config = response.to_config_json();
            assert!(config.get("type").is_none());
            let parsed = RuleResponse::from_db(response.type_tag(), config).unwrap();
            assert_eq!(parsed, response);
        }
    }

    #[test]
    fn template_language_defaults() {
        let parsed =
            RuleResponse::from_db("template", serde_json::json!({ "name": "hello" })).unwrap();
        assert_eq!(
            parsed,
            RuleResponse::Template {
                name: "hello".into(),
                language: "en".into(),
                parameters: vec![],
            }
        );
    }

    #[test]
    fn from_db_rejects_bad_config() {
        assert!(RuleResponse::from_db("text", serde_json::json!({})).is_err());
        assert!(RuleResponse::from_db("bogus", serde_json::json!({})).is_err());
        assert!(RuleResponse::from_db("text", serde_json::json!([1])).is_err());
        assert!(RuleResponse::from_db("ai", serde_json::Value::Null).is_ok());
    }

    #[test]
    fn limits_are_optional() {
        let rule = AutomationRule::new(
            "ws",
            "acc",
            "greet",
            TriggerKind::Keyword,
            RuleResponse::Text { text: "hello".into() },
        );
        assert!(!rule.has_limits());
        assert!(rule.with_cooldown(60).has_limits());
    }
}
