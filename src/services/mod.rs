//! Services: the DAG execution core.

pub mod block_engine;
pub mod builtin_handlers;
pub mod dag_executor;
pub mod dag_parser;
pub mod expr;
pub mod gates;
pub mod llm_review;
pub mod output_contract;
pub mod prompt;

pub use dag_executor::{DagExecutor, ExecutorConfig};
pub use dag_parser::{parse_dag, parse_dag_json, parse_dag_yaml};
