//! Node executor: interprets one flow node at a time and moves the
//! conversation pointer.
//!
//! `execute` handles a single node and is idempotent: running it for a node the
//! state has already left does nothing. `run_pass` chains nodes that need no
//! user input, bounded by `max_nodes_per_pass` so a zero-delay cycle in a
//! flow graph cannot spin forever.
//!
//! Nothing is advanced past a send until the sender confirms delivery, so a
//! failed send can be retried by replaying the same event.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::automation::clock::Clock;
use crate::automation::delivery::{
    DeliveryReceipt, MAX_BUTTON_TITLE_CHARS, MAX_REPLY_BUTTONS, MessageSender, OutboundMessage,
    ReplyButton, SendIntent,
};
use crate::automation::state::{ConversationState, StateStore};
use crate::automation::window::can_send_free_form;
use crate::error::{AutomationError, FlowError};
use crate::flows::{ButtonOption, FlowDefinition, NodeKind};

/// Result of executing one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeResult {
    /// Where the pointer moved (or will move once a delay elapses).
    pub next_node_id: Option<String>,
    /// The node waits for a click, text or form completion.
    pub wait_for_input: bool,
    /// The node is a delay that resumes at this instant.
    pub resume_at: Option<DateTime<Utc>>,
    /// The state was completed.
    pub terminal: bool,
    /// A message was delivered.
    pub sent: bool,
    pub provider_message_id: Option<String>,
    /// The state had already left this node; nothing was done.
    pub already_advanced: bool,
}

impl NodeResult {
    fn advanced(next: &str, receipt: Option<DeliveryReceipt>) -> Self {
        Self {
            next_node_id: Some(next.to_string()),
            sent: receipt.is_some(),
            provider_message_id: receipt.and_then(|r| r.provider_message_id),
            ..Self::default()
        }
    }

    fn waiting(receipt: DeliveryReceipt) -> Self {
        Self {
            wait_for_input: true,
            sent: true,
            provider_message_id: receipt.provider_message_id,
            ..Self::default()
        }
    }

    fn terminal(receipt: Option<DeliveryReceipt>) -> Self {
        Self {
            terminal: true,
            sent: receipt.is_some(),
            provider_message_id: receipt.and_then(|r| r.provider_message_id),
            ..Self::default()
        }
    }
}

/// Why a pass stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stop", rename_all = "snake_case")]
pub enum PassStop {
    /// Parked on a buttons or subflow node.
    Waiting { node_id: String },
    /// Parked on a delay node.
    Delayed {
        node_id: String,
        resume_at: DateTime<Utc>,
    },
    /// The state reached an end (or a dead end) and was completed.
    Completed,
    /// The node budget ran out; the pointer stays on `node_id`.
    LimitReached { node_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassOutcome {
    pub executed: usize,
    pub messages_sent: usize,
    #[serde(flatten)]
    pub stop: PassStop,
}

/// A button choice resolved against the current node's outgoing edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub button_id: String,
    pub title: String,
    pub target_node_id: String,
    /// Variable that captures the title, if the node names one.
    pub variable: Option<String>,
}

pub struct NodeExecutor {
    states: Arc<StateStore>,
    sender: Arc<dyn MessageSender>,
    clock: Arc<dyn Clock>,
    max_nodes_per_pass: usize,
}

impl NodeExecutor {
    pub fn new(
        states: Arc<StateStore>,
        sender: Arc<dyn MessageSender>,
        clock: Arc<dyn Clock>,
        max_nodes_per_pass: usize,
    ) -> Self {
        Self {
            states,
            sender,
            clock,
            max_nodes_per_pass: max_nodes_per_pass.max(1),
        }
    }

    /// Execute `node_id` for `state` as of `expected_version`. A no-op when
    /// the state is inactive, belongs to another flow, already points
    /// elsewhere or has been written since the caller read it.
    pub async fn execute(
        &self,
        flow: &FlowDefinition,
        state: &mut ConversationState,
        node_id: &str,
        expected_version: i64,
    ) -> Result<NodeResult, AutomationError> {
        if !state.is_active
            || state.flow_id != flow.id
            || state.current_node_id != node_id
            || state.version != expected_version
        {
            debug!(
                state_id = %state.id,
                node_id,
                current = %state.current_node_id,
                version = state.version,
                expected_version,
                "Node already handled, skipping"
            );
            return Ok(NodeResult {
                next_node_id: Some(state.current_node_id.clone()),
                already_advanced: true,
                ..NodeResult::default()
            });
        }

        let node = flow.require_node(node_id)?;
        let now = self.clock.now();
        debug!(state_id = %state.id, flow_id = %flow.id, node_id, node_type = node.kind.type_tag(), "Executing node");

        match &node.kind {
            NodeKind::Trigger => self.follow_edge(flow, state, node_id, None, now).await,
            NodeKind::Message { text } => {
                let body = render_template(text, &state.collected_variables, &state.phone_number);
                let receipt = self.deliver(state, OutboundMessage::Text { body }).await?;
                self.follow_edge(flow, state, node_id, Some(receipt), now)
                    .await
            }
            NodeKind::Buttons { text, buttons, .. } => {
                let message = OutboundMessage::Buttons {
                    body: render_template(text, &state.collected_variables, &state.phone_number),
                    buttons: render_buttons(
                        node_id,
                        buttons,
                        &state.collected_variables,
                        &state.phone_number,
                    ),
                };
                let receipt = self.deliver(state, message).await?;
                self.states.mark_waiting(state, now).await?;
                Ok(NodeResult::waiting(receipt))
            }
            NodeKind::Delay { delay_seconds } => {
                let resume_at = match state.resume_at {
                    Some(at) => at,
                    None => {
                        let at = delay_deadline(now, *delay_seconds).ok_or_else(|| {
                            FlowError::InvalidGraph {
                                flow_id: flow.id,
                                reason: format!("delay node '{node_id}' duration out of range"),
                            }
                        })?;
                        self.states.schedule_resume(state, at, now).await?;
                        at
                    }
                };
                Ok(NodeResult {
                    next_node_id: flow.next_node_id(node_id).map(String::from),
                    resume_at: Some(resume_at),
                    ..NodeResult::default()
                })
            }
            NodeKind::Subflow { form_id, body, cta } => {
                let message = OutboundMessage::Form {
                    form_id: form_id.clone(),
                    body: render_template(body, &state.collected_variables, &state.phone_number),
                    cta: cta.clone(),
                    state_id: state.id,
                };
                let receipt = self.deliver(state, message).await?;
                self.states.mark_waiting(state, now).await?;
                Ok(NodeResult::waiting(receipt))
            }
            NodeKind::End { message } => {
                let receipt = match message.as_deref().filter(|m| !m.trim().is_empty()) {
                    Some(text) => {
                        let body =
                            render_template(text, &state.collected_variables, &state.phone_number);
                        Some(self.deliver(state, OutboundMessage::Text { body }).await?)
                    }
                    None => None,
                };
                self.states.complete(state, now).await?;
                Ok(NodeResult::terminal(receipt))
            }
        }
    }

    /// Execute from the state's current node until input is needed, a delay
    /// parks the state, the flow ends or the node budget is spent.
    pub async fn run_pass(
        &self,
        flow: &FlowDefinition,
        state: &mut ConversationState,
    ) -> Result<PassOutcome, AutomationError> {
        let mut executed = 0;
        let mut messages_sent = 0;

        let stop = loop {
            if !state.is_active {
                break PassStop::Completed;
            }
            if executed >= self.max_nodes_per_pass {
                warn!(
                    state_id = %state.id,
                    flow_id = %flow.id,
                    node_id = %state.current_node_id,
                    limit = self.max_nodes_per_pass,
                    "Node budget exhausted for this pass"
                );
                break PassStop::LimitReached {
                    node_id: state.current_node_id.clone(),
                };
            }

            let node_id = state.current_node_id.clone();
            let version = state.version;
            let result = self.execute(flow, state, &node_id, version).await?;
            executed += 1;
            if result.sent {
                messages_sent += 1;
            }

            if result.terminal {
                break PassStop::Completed;
            }
            if result.wait_for_input {
                break PassStop::Waiting { node_id };
            }
            if let Some(resume_at) = result.resume_at {
                break PassStop::Delayed { node_id, resume_at };
            }
        };

        Ok(PassOutcome {
            executed,
            messages_sent,
            stop,
        })
    }

    /// Send a message subject to the messaging window.
    pub async fn send_guarded(
        &self,
        workspace_id: &str,
        account_id: &str,
        phone_number: &str,
        last_inbound_at: Option<DateTime<Utc>>,
        message: OutboundMessage,
    ) -> Result<DeliveryReceipt, AutomationError> {
        if message.requires_window() && !can_send_free_form(last_inbound_at, self.clock.now()) {
            warn!(
                workspace_id,
                phone_number,
                message_type = message.type_tag(),
                "Messaging window closed, not sending"
            );
            return Err(AutomationError::WindowClosed {
                phone_number: phone_number.to_string(),
                last_inbound_at,
            });
        }

        let intent = SendIntent {
            workspace_id: workspace_id.to_string(),
            account_id: account_id.to_string(),
            phone_number: phone_number.to_string(),
            message,
        };
        self.sender.send(&intent).await.map_err(|e| {
            warn!(workspace_id, phone_number, error = %e, "Delivery failed");
            AutomationError::Delivery(e)
        })
    }

    async fn deliver(
        &self,
        state: &ConversationState,
        message: OutboundMessage,
    ) -> Result<DeliveryReceipt, AutomationError> {
        self.send_guarded(
            &state.workspace_id,
            &state.account_id,
            &state.phone_number,
            state.last_inbound_at,
            message,
        )
        .await
    }

    /// Advance over the node's single outgoing edge, or complete the state at
    /// a dead end.
    async fn follow_edge(
        &self,
        flow: &FlowDefinition,
        state: &mut ConversationState,
        node_id: &str,
        receipt: Option<DeliveryReceipt>,
        now: DateTime<Utc>,
    ) -> Result<NodeResult, AutomationError> {
        match flow.next_node_id(node_id) {
            Some(next) => {
                self.states.advance(state, next, now).await?;
                Ok(NodeResult::advanced(next, receipt))
            }
            None => {
                info!(state_id = %state.id, node_id, "Flow reached a node without successor");
                self.states.complete(state, now).await?;
                Ok(NodeResult::terminal(receipt))
            }
        }
    }
}

fn delay_deadline(now: DateTime<Utc>, delay_seconds: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(delay_seconds).ok()?;
    now.checked_add_signed(Duration::try_seconds(seconds)?)
}

/// Render at most three buttons with provider-sized titles. `source` names
/// the node or rule the buttons belong to, for logging.
pub(crate) fn render_buttons(
    source: &str,
    buttons: &[ButtonOption],
    vars: &BTreeMap<String, String>,
    phone_number: &str,
) -> Vec<ReplyButton> {
    if buttons.len() > MAX_REPLY_BUTTONS {
        warn!(
            source,
            count = buttons.len(),
            "More than {MAX_REPLY_BUTTONS} buttons configured, dropping extras"
        );
    }
    buttons
        .iter()
        .take(MAX_REPLY_BUTTONS)
        .map(|b| ReplyButton {
            id: b.id.clone(),
            title: truncate_chars(
                &render_template(&b.title, vars, phone_number),
                MAX_BUTTON_TITLE_CHARS,
            ),
        })
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Replace `{{name}}` placeholders with collected variables. `phone_number`
/// is always available; unknown names render empty.
pub fn render_template(
    template: &str,
    vars: &BTreeMap<String, String>,
    phone_number: &str,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after[..end].trim();
        if name == "phone_number" {
            out.push_str(phone_number);
        } else if let Some(value) = vars.get(name) {
            out.push_str(value);
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Resolve a click or free-text reply on a buttons node. A button payload
/// must name a button with an edge; free text must equal a button title
/// (trimmed, case-insensitive). Never guesses.
pub fn match_continuation(
    flow: &FlowDefinition,
    node_id: &str,
    button_payload: Option<&str>,
    text: &str,
) -> Option<Continuation> {
    let node = flow.node(node_id)?;
    let NodeKind::Buttons {
        buttons, variable, ..
    } = &node.kind
    else {
        return None;
    };

    let button = match button_payload {
        Some(payload) => buttons.iter().find(|b| b.id == payload),
        None => {
            let wanted = text.trim().to_lowercase();
            buttons.iter().find(|b| {
                let title = b.title.trim().to_lowercase();
                title == wanted || truncate_chars(&title, MAX_BUTTON_TITLE_CHARS) == wanted
            })
        }
    }?;

    let target = flow.target_for_handle(node_id, &button.id)?;
    Some(Continuation {
        button_id: button.id.clone(),
        title: button.title.clone(),
        target_node_id: target.to_string(),
        variable: variable.clone(),
    })
}
