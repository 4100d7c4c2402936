//! Workflow engine core: node graph, interpreter, and durable suspension.
//!
//! - `graph` -- node graph builder, position index, definition validation
//! - `expression` -- JEXL evaluator for guards, transforms and correlation keys
//! - `context` -- evaluation scope (input, context, bindings, deadlines)
//! - `activity` -- activity invoker port and name-based registry
//! - `retry` -- retry/backoff evaluator
//! - `propagation` -- error filters and handler chain resolution
//! - `interpreter` -- resumable task-tree state machine
//! - `suspension` -- commit building for suspend, complete, fault and cancel
//! - `correlation` -- event filters, correlation keys and fan-in
//! - `scheduler` -- timer and deadline firing
//! - `dispatcher` -- outbox delivery and notification sink port
//! - `source` -- inbound event source port
//! - `schema` -- input/output schema validation port
//! - `engine` -- public engine facade and background workers

pub mod activity;
pub mod context;
pub mod correlation;
pub mod dispatcher;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod interpreter;
pub mod propagation;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod source;
pub mod suspension;

pub use engine::{Engine, EngineBuilder, EngineError, TickReport};
pub use suspension::ResumeOutcome;
