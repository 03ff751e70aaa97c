//! `Database` trait: single async interface for all automation persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::automation::rules::{AutomationRule, RuleTriggerLogEntry};
use crate::automation::state::ConversationState;
use crate::automation::window::AccountSettings;
use crate::error::DatabaseError;
use crate::flows::{FlowDefinition, FlowStatus};

/// Backend-agnostic database trait covering flows, rules, the trigger log,
/// conversation states and account settings.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Flows ───────────────────────────────────────────────────────

    /// Insert or replace a flow definition (flow-builder side).
    async fn upsert_flow(&self, flow: &FlowDefinition) -> Result<(), DatabaseError>;

    async fn get_flow(&self, id: Uuid) -> Result<Option<FlowDefinition>, DatabaseError>;

    /// Active flows for an account, ordered by priority then creation time.
    async fn list_active_flows(
        &self,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Vec<FlowDefinition>, DatabaseError>;

    async fn set_flow_status(&self, id: Uuid, status: FlowStatus) -> Result<(), DatabaseError>;

    /// Atomically bump `trigger_count` and set `last_triggered_at`.
    async fn record_flow_triggered(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn upsert_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, DatabaseError>;

    /// Active rules for an account, ordered by priority then creation time.
    async fn list_active_rules(
        &self,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Vec<AutomationRule>, DatabaseError>;

    // ── Rule trigger log ────────────────────────────────────────────

    /// Append a log entry. Successful entries also bump the rule's
    /// statistics in the same transaction.
    async fn log_rule_trigger(&self, entry: &RuleTriggerLogEntry) -> Result<(), DatabaseError>;

    /// Most recent successful trigger of a rule for a conversation.
    async fn last_rule_trigger_at(
        &self,
        rule_id: Uuid,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Successful triggers of a rule for a conversation at or after `since`.
    async fn count_rule_triggers_since(
        &self,
        rule_id: Uuid,
        conversation_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Full log for a rule, newest first.
    async fn list_rule_triggers(
        &self,
        rule_id: Uuid,
    ) -> Result<Vec<RuleTriggerLogEntry>, DatabaseError>;

    // ── Conversation states ─────────────────────────────────────────

    /// Deactivate any active state for the same (workspace, phone) and insert
    /// `state`, in one transaction.
    async fn create_state(&self, state: &ConversationState) -> Result<(), DatabaseError>;

    async fn get_state(&self, id: Uuid) -> Result<Option<ConversationState>, DatabaseError>;

    async fn get_active_state(
        &self,
        workspace_id: &str,
        phone_number: &str,
    ) -> Result<Option<ConversationState>, DatabaseError>;

    /// Write every mutable field of `state` if the stored row still has
    /// `expected_version`; the stored version becomes `state.version`.
    /// Returns false when the row changed underneath.
    async fn update_state(
        &self,
        state: &ConversationState,
        expected_version: i64,
    ) -> Result<bool, DatabaseError>;

    /// Active states whose delay has elapsed.
    async fn list_due_delays(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationState>, DatabaseError>;

    async fn count_active_states(
        &self,
        workspace_id: &str,
        phone_number: &str,
    ) -> Result<u64, DatabaseError>;

    // ── Account settings ────────────────────────────────────────────

    async fn get_account_settings(
        &self,
        workspace_id: &str,
        account_id: &str,
    ) -> Result<Option<AccountSettings>, DatabaseError>;

    async fn set_account_settings(
        &self,
        workspace_id: &str,
        account_id: &str,
        settings: &AccountSettings,
    ) -> Result<(), DatabaseError>;
}
