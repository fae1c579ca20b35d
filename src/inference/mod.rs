//! LLM inference engine
//!
//! This module owns the model catalog, the background workers hosting a
//! backend, and the lifecycle of the single active engine.

pub mod backend;
pub mod catalog;
pub mod engine;
pub mod lifecycle;
pub mod state;
pub mod worker;
