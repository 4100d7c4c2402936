//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (waypost-infra) implements. The core crate never depends on any specific
//! storage technology; `memory` is an in-process implementation used by
//! tests and embedders that do not need durability.

pub mod instance;
pub mod memory;

pub use instance::{InstanceCommit, InstanceRepository};
pub use memory::InMemoryRepository;
