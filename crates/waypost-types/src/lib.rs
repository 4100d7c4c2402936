//! Shared domain types for Waypost.
//!
//! Workflow definitions, node positions, instance and node state, wait
//! registrations, outbox records, and the error types shared by every layer.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod correlation;
pub mod definition;
pub mod duration;
pub mod error;
pub mod event;
pub mod instance;
pub mod outbox;
pub mod position;
pub mod retry;
pub mod wait;
