//! Domain models for DAG definitions and run state.

pub mod agent;
pub mod block;
pub mod canon;
pub mod dag;
pub mod dispatch;
pub mod failure;
pub mod gate;
pub mod run;

pub use agent::{AgentCatalog, AgentSpec, RouteError};
pub use block::{
    hash_block_def, AgentRef, ApprovalPolicy, Backoff, BlockDef, BlockMode, Compose,
    DeterministicSpec, GateComposition, OnGateFailRule, PortDef, PortType, RetryPolicy,
};
pub use canon::canonical_string;
pub use dag::{Dag, Edge};
pub use dispatch::{AgentIdentity, DispatchRequest, DispatchResult, TokenUsage};
pub use failure::{FailureCode, FailureInfo, FailureStage};
pub use gate::{DiffMode, GateCheck, GateResult, GateSpec, ValueKind};
pub use run::{
    context_keys, ApprovalRequest, BlockInstance, BlockStatus, BlockedBlock, ContractTrace,
    DagRun, ExecutionRecord, RepairAttempt, RetryState, RunStatus, StructuredRepair,
    StuckDiagnostics, UnmetEdge,
};
