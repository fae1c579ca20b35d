//! Chat layer
//!
//! Conversation history and the orchestrator that turns user input into
//! completion requests against the current engine.

pub mod conversation;
pub mod orchestrator;
