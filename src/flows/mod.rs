//! Flow definitions: the directed conversation graphs the runtime interprets.

pub mod model;

pub use model::{ButtonOption, Edge, FlowDefinition, FlowStatus, Node, NodeKind};
