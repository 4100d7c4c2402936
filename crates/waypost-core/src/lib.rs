//! Durable workflow execution for Waypost.
//!
//! This crate holds the interpreter, suspension and correlation logic plus
//! the repository traits (ports) that the infrastructure layer implements.
//! It depends only on `waypost-types`, never on `waypost-infra` or any
//! database crate.

pub mod event;
pub mod repository;
pub mod workflow;
