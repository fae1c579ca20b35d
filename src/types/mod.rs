//! Shared type definitions
//!
//! This module contains the data types shared by the engine and chat layers.

pub mod message;
pub mod model;
