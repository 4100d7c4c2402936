//! Observability setup for Waypost hosts.
//!
//! The engine crates only emit `tracing` events; installing a subscriber is
//! left to the embedding process, which calls
//! [`tracing_setup::init_tracing`] once at startup.

pub mod tracing_setup;
