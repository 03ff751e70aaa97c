//! Autoflow: chat automation core.
//!
//! Decides, for every inbound message or button click, whether an automated
//! response fires, which conversation flow owns the user and what to send
//! next, within the 24-hour messaging window and per-rule rate limits.

pub mod automation;
pub mod config;
pub mod error;
pub mod flows;
pub mod server;
pub mod store;
