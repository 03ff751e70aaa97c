//! Automation orchestrator: the entry point for every inbound event, delay
//! resume and form completion.
//!
//! Per event:
//! 1. Serialize on the (workspace, phone number) key
//! 2. Load a fresh [`AutomationSnapshot`] for the account
//! 3. Continue the active conversation state, or expire it when stale
//! 4. Otherwise pick a flow or rule with the trigger matcher and run it
//!
//! Component failures stop here. Callers always get an
//! [`AutomationOutcome`]; at worst it says no automated response was sent.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::automation::ai::{AiRequest, AiResponder};
use crate::automation::clock::{Clock, SystemClock};
use crate::automation::delivery::{MessageSender, OutboundMessage};
use crate::automation::executor::{
    NodeExecutor, PassOutcome, PassStop, match_continuation, render_buttons, render_template,
};
use crate::automation::matcher::{
    AutomationSnapshot, Candidate, KnowledgeBase, MatchResult, TriggerMatcher,
};
use crate::automation::rate_limit::{RateLimitOutcome, RateLimiter, TriggerRecord};
use crate::automation::rules::{AutomationRule, RuleResponse};
use crate::automation::state::{ConversationState, StateStore};
use crate::automation::window::{delay_due, is_stale};
use crate::config::AutomationConfig;
use crate::error::{AutomationError, FlowError};
use crate::flows::{FlowDefinition, NodeKind};
use crate::store::Database;

/// A message received from the upstream pipeline, already deduplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub workspace_id: String,
    pub account_id: String,
    pub conversation_id: String,
    pub phone_number: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_first_message: bool,
    #[serde(default)]
    pub is_button_reply: bool,
    #[serde(default)]
    pub button_payload: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// What the automation layer did with an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutomationOutcome {
    /// Nothing matched. Not an error.
    NoMatch,
    /// The event required no action (e.g. a delay that is not yet due).
    Ignored { reason: String },
    RateLimited { rule_id: Uuid, reason: String },
    /// A free-form send was refused because the 24-hour window is closed.
    WindowClosed { phone_number: String },
    /// A rule replied directly.
    Responded {
        rule_id: Uuid,
        provider_message_id: Option<String>,
    },
    FlowStarted {
        flow_id: Uuid,
        state_id: Uuid,
        pass: PassOutcome,
    },
    FlowAdvanced {
        flow_id: Uuid,
        state_id: Uuid,
        pass: PassOutcome,
    },
    /// The state is parked on a delay or form; the inbound only reset the
    /// window.
    Waiting { state_id: Uuid, node_id: String },
    /// The reply matched no continuation; the state was closed and a recovery
    /// message sent.
    Recovered { state_id: Uuid, node_id: String },
    /// A component failed; no automated response.
    Degraded { kind: String, reason: String },
}

impl AutomationOutcome {
    fn from_error(err: AutomationError) -> Self {
        match err {
            AutomationError::WindowClosed { phone_number, .. } => {
                AutomationOutcome::WindowClosed { phone_number }
            }
            AutomationError::RateLimited { rule_id, reason } => {
                AutomationOutcome::RateLimited { rule_id, reason }
            }
            other => AutomationOutcome::Degraded {
                kind: other.kind().to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Whether a rule that produced this outcome counts as triggered.
    fn is_success(&self) -> bool {
        matches!(
            self,
            AutomationOutcome::Responded { .. } | AutomationOutcome::FlowStarted { .. }
        )
    }
}

pub struct Orchestrator {
    db: Arc<dyn Database>,
    states: Arc<StateStore>,
    sender: Arc<dyn MessageSender>,
    clock: Arc<dyn Clock>,
    executor: NodeExecutor,
    matcher: TriggerMatcher,
    limiter: RateLimiter,
    ai: Option<Arc<dyn AiResponder>>,
    recovery_message: String,
    max_nodes_per_pass: usize,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        sender: Arc<dyn MessageSender>,
        config: &AutomationConfig,
    ) -> Self {
        let states = Arc::new(StateStore::new(db.clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let executor = NodeExecutor::new(
            states.clone(),
            sender.clone(),
            clock.clone(),
            config.max_nodes_per_pass,
        );
        Self {
            limiter: RateLimiter::new(db.clone()),
            matcher: TriggerMatcher::new(config.faq_threshold),
            db,
            states,
            sender,
            clock,
            executor,
            ai: None,
            recovery_message: config.recovery_message.clone(),
            max_nodes_per_pass: config.max_nodes_per_pass,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.executor = NodeExecutor::new(
            self.states.clone(),
            self.sender.clone(),
            clock.clone(),
            self.max_nodes_per_pass,
        );
        self.clock = clock;
        self
    }

    pub fn with_knowledge_base(mut self, kb: Arc<dyn KnowledgeBase>) -> Self {
        self.matcher = self.matcher.with_knowledge_base(kb);
        self
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiResponder>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    /// Handle one inbound message or button click. Never fails.
    pub async fn handle_inbound(&self, event: &InboundEvent) -> AutomationOutcome {
        let _guard = self
            .states
            .lock(&event.workspace_id, &event.phone_number)
            .await;

        match self.process_inbound(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    workspace_id = %event.workspace_id,
                    phone_number = %event.phone_number,
                    kind = e.kind(),
                    error = %e,
                    "Inbound event not automated"
                );
                AutomationOutcome::from_error(e)
            }
        }
    }

    async fn process_inbound(
        &self,
        event: &InboundEvent,
    ) -> Result<AutomationOutcome, AutomationError> {
        let now = self.clock.now();
        let snapshot =
            AutomationSnapshot::load(self.db.as_ref(), &event.workspace_id, &event.account_id)
                .await?;

        if let Some(state) = self
            .states
            .get_active(&event.workspace_id, &event.phone_number)
            .await?
        {
            if let Some(outcome) = self.continue_state(&snapshot, state, event, now).await? {
                return Ok(outcome);
            }
        }

        let Some(matched) = self
            .matcher
            .select(&snapshot, &event.text, event.is_first_message, now)
            .await
        else {
            return Ok(AutomationOutcome::NoMatch);
        };

        match matched.candidate {
            Candidate::Flow(flow) => self.start_flow(flow, event, now).await,
            Candidate::Rule(rule) => self.fire_rule(&snapshot, rule, &matched, event, now).await,
        }
    }

    /// Feed the event to the active state. `None` means the state was closed
    /// and trigger matching should run.
    async fn continue_state(
        &self,
        snapshot: &AutomationSnapshot,
        mut state: ConversationState,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<AutomationOutcome>, AutomationError> {
        if self.expire_if_stale(&mut state, now).await? {
            return Ok(None);
        }

        // A paused or deleted flow releases its users. Re-activating the flow
        // later does not bring these states back.
        let Some(flow) = snapshot.flow(state.flow_id) else {
            info!(state_id = %state.id, flow_id = %state.flow_id, "Flow no longer active, closing state");
            self.states.complete(&mut state, now).await?;
            return Ok(None);
        };
        let Some(node) = flow.node(&state.current_node_id) else {
            warn!(
                state_id = %state.id,
                flow_id = %flow.id,
                node_id = %state.current_node_id,
                "State points at a node missing from the flow, closing state"
            );
            self.states.complete(&mut state, now).await?;
            return Ok(None);
        };

        self.states
            .record_inbound(&mut state, event.received_at, now)
            .await?;

        let outcome = match &node.kind {
            NodeKind::Buttons { .. } => {
                let payload = if event.is_button_reply {
                    event.button_payload.as_deref()
                } else {
                    None
                };
                match match_continuation(flow, &node.id, payload, &event.text) {
                    Some(choice) => {
                        self.states
                            .record_button(&mut state, &choice.button_id, now)
                            .await?;
                        if let Some(variable) = choice.variable {
                            self.states
                                .merge_variables(&mut state, [(variable, choice.title)], now)
                                .await?;
                        }
                        self.states
                            .advance(&mut state, &choice.target_node_id, now)
                            .await?;
                        self.advance_pass(flow, &mut state).await?
                    }
                    None => {
                        let input = payload.unwrap_or(&event.text);
                        self.recover(snapshot, &mut state, input, now).await?
                    }
                }
            }
            NodeKind::Delay { .. } | NodeKind::Subflow { .. } => AutomationOutcome::Waiting {
                state_id: state.id,
                node_id: node.id.clone(),
            },
            // Parked on a sending node after a failed delivery or an exhausted
            // node budget: retry from there.
            NodeKind::Trigger | NodeKind::Message { .. } | NodeKind::End { .. } => {
                self.advance_pass(flow, &mut state).await?
            }
        };
        Ok(Some(outcome))
    }

    /// Complete a state that has seen no inbound for the whole messaging
    /// window. Returns whether it was expired.
    async fn expire_if_stale(
        &self,
        state: &mut ConversationState,
        now: DateTime<Utc>,
    ) -> Result<bool, AutomationError> {
        if !is_stale(state.last_inbound_at, now) {
            return Ok(false);
        }
        let stale = AutomationError::StaleState {
            state_id: state.id,
            idle_hours: state.idle_hours(now),
        };
        info!(state_id = %state.id, flow_id = %state.flow_id, reason = %stale, "Expiring conversation state");
        self.states.complete(state, now).await?;
        Ok(true)
    }

    async fn advance_pass(
        &self,
        flow: &FlowDefinition,
        state: &mut ConversationState,
    ) -> Result<AutomationOutcome, AutomationError> {
        let pass = self.executor.run_pass(flow, state).await?;
        Ok(AutomationOutcome::FlowAdvanced {
            flow_id: flow.id,
            state_id: state.id,
            pass,
        })
    }

    /// Close the state and tell the user, instead of guessing an edge.
    async fn recover(
        &self,
        snapshot: &AutomationSnapshot,
        state: &mut ConversationState,
        input: &str,
        now: DateTime<Utc>,
    ) -> Result<AutomationOutcome, AutomationError> {
        let unmatched = AutomationError::UnmatchedContinuation {
            state_id: state.id,
            node_id: state.current_node_id.clone(),
            input: input.to_string(),
        };
        info!(state_id = %state.id, reason = %unmatched, "Closing state after unmatched reply");
        let node_id = state.current_node_id.clone();
        self.states.complete(state, now).await?;

        let body = snapshot
            .settings
            .recovery_message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.recovery_message.clone());
        match self
            .executor
            .send_guarded(
                &state.workspace_id,
                &state.account_id,
                &state.phone_number,
                state.last_inbound_at,
                OutboundMessage::Text { body },
            )
            .await
        {
            Ok(_) => info!(state_id = %state.id, phone_number = %state.phone_number, "Recovery message sent"),
            Err(e) => warn!(state_id = %state.id, error = %e, "Recovery message not delivered"),
        }

        Ok(AutomationOutcome::Recovered {
            state_id: state.id,
            node_id,
        })
    }

    async fn start_flow(
        &self,
        flow: &FlowDefinition,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<AutomationOutcome, AutomationError> {
        let start = flow.start_node().ok_or_else(|| FlowError::InvalidGraph {
            flow_id: flow.id,
            reason: "no start node".into(),
        })?;

        let mut state = self
            .states
            .create(
                &event.workspace_id,
                &event.account_id,
                &event.phone_number,
                flow.id,
                &start.id,
                Some(event.received_at),
                now,
            )
            .await?;
        self.db.record_flow_triggered(flow.id, now).await?;
        info!(
            flow_id = %flow.id,
            state_id = %state.id,
            phone_number = %event.phone_number,
            "Flow started"
        );

        let pass = self.executor.run_pass(flow, &mut state).await?;
        Ok(AutomationOutcome::FlowStarted {
            flow_id: flow.id,
            state_id: state.id,
            pass,
        })
    }

    async fn fire_rule(
        &self,
        snapshot: &AutomationSnapshot,
        rule: &AutomationRule,
        matched: &MatchResult<'_>,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<AutomationOutcome, AutomationError> {
        if let RateLimitOutcome::Limited(hit) = self
            .limiter
            .check(rule, &event.conversation_id, now, snapshot.settings.tz())
            .await?
        {
            info!(rule_id = %rule.id, conversation_id = %event.conversation_id, %hit, "Rule skipped");
            return Err(AutomationError::RateLimited {
                rule_id: rule.id,
                reason: hit.to_string(),
            });
        }

        let result = self.respond(snapshot, rule, matched, event, now).await;
        let success = result.as_ref().is_ok_and(AutomationOutcome::is_success);

        let record = TriggerRecord {
            conversation_id: &event.conversation_id,
            trigger_message_id: event.message_id.as_deref(),
            text: &event.text,
            matched_keyword: matched.matched_keyword.as_deref(),
        };
        if let Err(e) = self.limiter.log_trigger(rule.id, &record, success, now).await {
            error!(rule_id = %rule.id, error = %e, "Failed to write rule trigger log");
        }

        result
    }

    async fn respond(
        &self,
        snapshot: &AutomationSnapshot,
        rule: &AutomationRule,
        matched: &MatchResult<'_>,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<AutomationOutcome, AutomationError> {
        let no_vars = BTreeMap::new();

        let message = if let Some(faq) = &matched.faq {
            OutboundMessage::Text {
                body: faq.answer.clone(),
            }
        } else {
            match &rule.response {
                RuleResponse::Text { text } => OutboundMessage::Text {
                    body: render_template(text, &no_vars, &event.phone_number),
                },
                RuleResponse::Buttons { text, buttons } => OutboundMessage::Buttons {
                    body: render_template(text, &no_vars, &event.phone_number),
                    buttons: render_buttons(&rule.name, buttons, &no_vars, &event.phone_number),
                },
                RuleResponse::Template {
                    name,
                    language,
                    parameters,
                } => OutboundMessage::Template {
                    name: name.clone(),
                    language: language.clone(),
                    parameters: parameters.clone(),
                },
                RuleResponse::StartFlow { flow_id } => {
                    let flow = snapshot
                        .flow(*flow_id)
                        .ok_or(FlowError::FlowNotFound(*flow_id))?;
                    return self.start_flow(flow, event, now).await;
                }
                RuleResponse::Ai { instructions } => {
                    match self.ask_ai(event, instructions.clone()).await? {
                        Some(body) => OutboundMessage::Text { body },
                        None => {
                            return Ok(AutomationOutcome::Ignored {
                                reason: "AI responder returned no reply".into(),
                            });
                        }
                    }
                }
            }
        };

        let receipt = self
            .executor
            .send_guarded(
                &event.workspace_id,
                &event.account_id,
                &event.phone_number,
                Some(event.received_at),
                message,
            )
            .await?;
        info!(rule_id = %rule.id, phone_number = %event.phone_number, "Rule responded");
        Ok(AutomationOutcome::Responded {
            rule_id: rule.id,
            provider_message_id: receipt.provider_message_id,
        })
    }

    async fn ask_ai(
        &self,
        event: &InboundEvent,
        instructions: Option<String>,
    ) -> Result<Option<String>, AutomationError> {
        let ai = self.ai.as_ref().ok_or_else(|| AutomationError::Collaborator {
            name: "ai".into(),
            reason: "no AI responder configured".into(),
        })?;
        let request = AiRequest {
            workspace_id: event.workspace_id.clone(),
            account_id: event.account_id.clone(),
            phone_number: event.phone_number.clone(),
            message: event.text.clone(),
            instructions,
        };
        Ok(ai
            .respond(&request)
            .await?
            .filter(|reply| !reply.trim().is_empty()))
    }

    /// Continue a state parked on a delay node once its deadline passes.
    /// Safe to call repeatedly; anything not due is ignored.
    pub async fn resume(&self, state_id: Uuid) -> AutomationOutcome {
        let state = match self.states.get(state_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                return AutomationOutcome::Ignored {
                    reason: format!("unknown state {state_id}"),
                };
            }
            Err(e) => return AutomationOutcome::from_error(e.into()),
        };
        let _guard = self
            .states
            .lock(&state.workspace_id, &state.phone_number)
            .await;

        match self.resume_locked(state_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(state_id = %state_id, kind = e.kind(), error = %e, "Delay resume failed");
                AutomationOutcome::from_error(e)
            }
        }
    }

    async fn resume_locked(&self, state_id: Uuid) -> Result<AutomationOutcome, AutomationError> {
        let now = self.clock.now();
        // Re-read under the lock; the copy used to find the key may be stale.
        let Some(mut state) = self.states.get(state_id).await? else {
            return Ok(ignored("state disappeared"));
        };
        if !state.is_active {
            return Ok(ignored("state is no longer active"));
        }
        if !delay_due(state.resume_at, now) {
            return Ok(ignored("delay not due"));
        }
        if self.expire_if_stale(&mut state, now).await? {
            return Ok(ignored("state expired"));
        }

        // Besides delay nodes, any sending node carries a due `resume_at` when
        // an earlier callback failed to deliver from it.
        let Some((snapshot, node_id)) = self.waiting_node(&mut state, now, |_| true).await? else {
            return Ok(ignored("state is not waiting on a delay"));
        };
        let flow = snapshot
            .flow(state.flow_id)
            .ok_or(FlowError::FlowNotFound(state.flow_id))?;
        if matches!(flow.require_node(&node_id)?.kind, NodeKind::Delay { .. }) {
            self.step_past(flow, &mut state, &node_id, now).await
        } else {
            info!(state_id = %state.id, node_id = %node_id, "Retrying failed delivery");
            self.states.clear_resume(&mut state, now).await?;
            self.callback_pass(flow, &mut state, None, now).await
        }
    }

    /// Deliver a completed form to the state waiting on its subflow node.
    /// Submitted values become collected variables.
    pub async fn complete_subflow(
        &self,
        state_id: Uuid,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> AutomationOutcome {
        let state = match self.states.get(state_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                return AutomationOutcome::Ignored {
                    reason: format!("unknown state {state_id}"),
                };
            }
            Err(e) => return AutomationOutcome::from_error(e.into()),
        };
        let _guard = self
            .states
            .lock(&state.workspace_id, &state.phone_number)
            .await;

        match self.complete_subflow_locked(state_id, fields).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(state_id = %state_id, kind = e.kind(), error = %e, "Form completion failed");
                AutomationOutcome::from_error(e)
            }
        }
    }

    async fn complete_subflow_locked(
        &self,
        state_id: Uuid,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AutomationOutcome, AutomationError> {
        let now = self.clock.now();
        let Some(mut state) = self.states.get(state_id).await? else {
            return Ok(ignored("state disappeared"));
        };
        if !state.is_active {
            return Ok(ignored("state is no longer active"));
        }

        if self.expire_if_stale(&mut state, now).await? {
            return Ok(ignored("state expired"));
        }

        let Some((snapshot, node_id)) = self
            .waiting_node(&mut state, now, |kind| matches!(kind, NodeKind::Subflow { .. }))
            .await?
        else {
            return Ok(ignored("state is not waiting on a form"));
        };
        let flow = snapshot
            .flow(state.flow_id)
            .ok_or(FlowError::FlowNotFound(state.flow_id))?;

        let vars = fields
            .into_iter()
            .map(|(key, value)| (key, form_value_to_string(value)));
        self.states.merge_variables(&mut state, vars, now).await?;
        self.step_past(flow, &mut state, &node_id, now).await
    }

    /// Load the state's flow and return the current node id if it satisfies
    /// `wanted`. A state whose flow is gone is closed.
    async fn waiting_node<F>(
        &self,
        state: &mut ConversationState,
        now: DateTime<Utc>,
        wanted: F,
    ) -> Result<Option<(AutomationSnapshot, String)>, AutomationError>
    where
        F: Fn(&NodeKind) -> bool,
    {
        let snapshot =
            AutomationSnapshot::load(self.db.as_ref(), &state.workspace_id, &state.account_id)
                .await?;
        let node_id = match snapshot.flow(state.flow_id) {
            None => {
                info!(state_id = %state.id, flow_id = %state.flow_id, "Flow no longer active, closing state");
                self.states.complete(state, now).await?;
                return Ok(None);
            }
            Some(flow) => match flow.node(&state.current_node_id) {
                Some(node) if wanted(&node.kind) => node.id.clone(),
                _ => return Ok(None),
            },
        };
        Ok(Some((snapshot, node_id)))
    }

    /// Move past a waiting node and run the pass from its successor.
    async fn step_past(
        &self,
        flow: &FlowDefinition,
        state: &mut ConversationState,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AutomationOutcome, AutomationError> {
        match flow.next_node_id(node_id) {
            Some(next) => {
                let pending = state.resume_at;
                self.states.advance(state, next, now).await?;
                self.callback_pass(flow, state, Some((node_id, pending)), now)
                    .await
            }
            None => {
                self.states.complete(state, now).await?;
                Ok(AutomationOutcome::FlowAdvanced {
                    flow_id: flow.id,
                    state_id: state.id,
                    pass: PassOutcome {
                        executed: 0,
                        messages_sent: 0,
                        stop: PassStop::Completed,
                    },
                })
            }
        }
    }

    /// Run a pass on behalf of a delay or form callback. A failed send leaves
    /// the state where repeating the callback repeats the send: back on the
    /// waiting node `rewind_to` when the pass delivered nothing, otherwise on
    /// the failed node with an immediate `resume_at` for the delay ticker.
    async fn callback_pass(
        &self,
        flow: &FlowDefinition,
        state: &mut ConversationState,
        rewind_to: Option<(&str, Option<DateTime<Utc>>)>,
        now: DateTime<Utc>,
    ) -> Result<AutomationOutcome, AutomationError> {
        let entry = state.current_node_id.clone();
        let err = match self.executor.run_pass(flow, state).await {
            Ok(pass) => {
                return Ok(AutomationOutcome::FlowAdvanced {
                    flow_id: flow.id,
                    state_id: state.id,
                    pass,
                });
            }
            Err(e @ AutomationError::Delivery(_)) => e,
            Err(e) => return Err(e),
        };

        if state.is_active {
            match rewind_to {
                Some((waiting, pending)) if state.current_node_id == entry => {
                    self.states.rewind(state, waiting, pending, now).await?;
                }
                _ => self.states.schedule_resume(state, now, now).await?,
            }
            info!(
                state_id = %state.id,
                node_id = %state.current_node_id,
                "Callback delivery failed, state kept for retry"
            );
        }
        Err(err)
    }
}

fn ignored(reason: &str) -> AutomationOutcome {
    AutomationOutcome::Ignored {
        reason: reason.to_string(),
    }
}

fn form_value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
