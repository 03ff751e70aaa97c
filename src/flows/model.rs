//! Flow definitions: versioned directed graphs of conversation nodes.
//!
//! Flows are authored by an external flow builder. The core only reads them
//! (and bumps their statistics), so everything here is plain data plus the
//! graph queries the runtime needs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::automation::trigger::{TriggerConfig, TriggerKind};
use crate::error::FlowError;

/// Lifecycle status of a flow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
    /// Stops new matches and releases in-flight users: each active state of
    /// the flow is completed on its next event. Re-activating the flow does
    /// not restore those states.
    Paused,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStatus::Draft => write!(f, "draft"),
            FlowStatus::Active => write!(f, "active"),
            FlowStatus::Paused => write!(f, "paused"),
        }
    }
}

impl FromStr for FlowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(FlowStatus::Draft),
            "active" => Ok(FlowStatus::Active),
            "paused" => Ok(FlowStatus::Paused),
            other => Err(format!("unknown flow status: {other}")),
        }
    }
}

/// One reply button offered by a `buttons` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonOption {
    pub id: String,
    pub title: String,
}

impl ButtonOption {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

fn default_cta() -> String {
    "Open".to_string()
}

/// What a node does. One variant per node type; the executor matches on it
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point of the flow. Sends nothing.
    Trigger,
    /// Free-form text message.
    Message { text: String },
    /// Text plus reply buttons; waits for a click.
    Buttons {
        text: String,
        buttons: Vec<ButtonOption>,
        /// Variable that receives the clicked button's title.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variable: Option<String>,
    },
    /// Pause for a fixed duration; an external scheduler resumes the flow.
    Delay {
        #[serde(alias = "delaySeconds")]
        delay_seconds: u64,
    },
    /// Structured data-collection form; waits for its completion callback.
    Subflow {
        form_id: String,
        #[serde(default)]
        body: String,
        #[serde(default = "default_cta")]
        cta: String,
    },
    /// Terminal node, optionally with a closing message.
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl NodeKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Message { .. } => "message",
            NodeKind::Buttons { .. } => "buttons",
            NodeKind::Delay { .. } => "delay",
            NodeKind::Subflow { .. } => "subflow",
            NodeKind::End { .. } => "end",
        }
    }
}

/// A single step in a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn trigger(id: &str) -> Self {
        Self::new(id, NodeKind::Trigger)
    }

    pub fn message(id: &str, text: &str) -> Self {
        Self::new(id, NodeKind::Message { text: text.into() })
    }

    pub fn buttons(id: &str, text: &str, buttons: Vec<ButtonOption>) -> Self {
        Self::new(
            id,
            NodeKind::Buttons {
                text: text.into(),
                buttons,
                variable: None,
            },
        )
    }

    pub fn delay(id: &str, delay_seconds: u64) -> Self {
        Self::new(id, NodeKind::Delay { delay_seconds })
    }

    pub fn subflow(id: &str, form_id: &str) -> Self {
        Self::new(
            id,
            NodeKind::Subflow {
                form_id: form_id.into(),
                body: String::new(),
                cta: default_cta(),
            },
        )
    }

    pub fn end(id: &str, message: Option<&str>) -> Self {
        Self::new(
            id,
            NodeKind::End {
                message: message.map(String::from),
            },
        )
    }
}

/// Directed edge between two nodes. `source_handle` names the button that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
            source_handle: None,
        }
    }

    pub fn from_button(source: &str, handle: &str, target: &str) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
            source_handle: Some(handle.into()),
        }
    }
}

/// A versioned conversation flow scoped to (workspace, account).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub workspace_id: String,
    pub account_id: String,
    pub name: String,
    pub trigger: TriggerKind,
    pub trigger_config: TriggerConfig,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub status: FlowStatus,
    /// Lower value wins.
    pub priority: i64,
    pub version: i64,

    // Statistics (core-managed)
    pub trigger_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowDefinition {
    /// New active flow with an empty graph.
    pub fn new(workspace_id: &str, account_id: &str, name: &str, trigger: TriggerKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.into(),
            account_id: account_id.into(),
            name: name.into(),
            trigger,
            trigger_config: TriggerConfig::default(),
            nodes: Vec::new(),
            edges: Vec::new(),
            status: FlowStatus::Active,
            priority: 100,
            version: 1,
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

    pub fn with_graph(mut self, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        self.nodes = nodes;
        self.edges = edges;
        self
    }

    pub fn with_status(mut self, status: FlowStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == FlowStatus::Active
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up a node, reporting a missing id as a flow error.
    pub fn require_node(&self, id: &str) -> Result<&Node, FlowError> {
        self.node(id).ok_or_else(|| FlowError::NodeNotFound {
            flow_id: self.id,
            node_id: id.to_string(),
        })
    }

    /// The single `trigger` node.
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Trigger))
    }

    pub fn outgoing<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.source_node_id == node_id)
    }

    /// Target of the node's only outgoing edge, if it has one.
    pub fn next_node_id(&self, node_id: &str) -> Option<&str> {
        self.outgoing(node_id).next().map(|e| e.target_node_id.as_str())
    }

    /// Target of the edge produced by the given button.
    pub fn target_for_handle(&self, node_id: &str, handle: &str) -> Option<&str> {
        self.outgoing(node_id)
            .find(|e| e.source_handle.as_deref() == Some(handle))
            .map(|e| e.target_node_id.as_str())
    }

    /// Check the graph invariants: unique node ids, exactly one start node,
    /// edges between existing nodes, fan-out only from `buttons` nodes.
    pub fn validate(&self) -> Result<(), FlowError> {
        let invalid = |reason: String| FlowError::InvalidGraph {
            flow_id: self.id,
            reason,
        };

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
        }

        let starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Trigger))
            .count();
        if starts != 1 {
            return Err(invalid(format!("expected exactly one start node, found {starts}")));
        }

        let mut fan_out: HashMap<&str, usize> = HashMap::new();
        for edge in &self.edges {
            for endpoint in [&edge.source_node_id, &edge.target_node_id] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(invalid(format!("edge references unknown node '{endpoint}'")));
                }
            }
            *fan_out.entry(edge.source_node_id.as_str()).or_default() += 1;
        }

        for node in &self.nodes {
            let out = fan_out.get(node.id.as_str()).copied().unwrap_or(0);
            if out > 1 && !matches!(node.kind, NodeKind::Buttons { .. }) {
                return Err(invalid(format!(
                    "{} node '{}' has {out} outgoing edges",
                    node.kind.type_tag(),
                    node.id
                )));
            }
        }

        Ok(())
    }
}
