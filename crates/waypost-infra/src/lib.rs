//! Infrastructure layer for Waypost.
//!
//! Contains the SQLite implementation of the `InstanceRepository` port defined
//! in `waypost-core` and the `waypost.toml` configuration loader.

pub mod config;
pub mod sqlite;
