//! SQLite storage layer.
//!
//! `SqliteInstanceRepository` implements the engine's `InstanceRepository`
//! over a WAL-mode database with split read/write pools.

pub mod instance;
pub mod pool;

pub use instance::SqliteInstanceRepository;
pub use pool::DatabasePool;
