//! Automation core: trigger matching, conversation state, the flow runtime
//! and the guards around outbound sends.

pub mod ai;
pub mod clock;
pub mod delivery;
pub mod executor;
pub mod matcher;
pub mod orchestrator;
pub mod rate_limit;
pub mod rules;
pub mod scheduler;
pub mod state;
pub mod trigger;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{HttpSender, LoggingSender, MessageSender, OutboundMessage, SendIntent};
pub use matcher::{AutomationSnapshot, KnowledgeBase, TriggerMatcher};
pub use orchestrator::{AutomationOutcome, InboundEvent, Orchestrator};
pub use state::{ConversationState, StateStore};
