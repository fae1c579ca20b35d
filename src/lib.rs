//! chatworker library
//!
//! Engine lifecycle and conversation orchestration for a local LLM chat client.

pub mod app;
pub mod chat;
pub mod inference;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
