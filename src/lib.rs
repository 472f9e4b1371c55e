//! OpenSkelo - DAG execution core for multi-step AI pipelines
//!
//! Pipelines are directed acyclic graphs of typed blocks. Each block either
//! dispatches to an AI provider, runs a deterministic handler, or pauses for
//! human approval. Gates guard every transition, outputs are validated against
//! a declared contract (with a bounded repair loop), and downstream blocks are
//! scheduled the moment their inputs become available.
//!
//! The crate is a library: hosts supply provider adapters, deterministic
//! handlers, an optional approval waiter, and observability callbacks.

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{BlockDef, Dag, DagRun, FailureCode};
pub use services::block_engine;
pub use services::dag_executor::{DagExecutor, ExecutorConfig};
pub use services::dag_parser::parse_dag;
