//! Run state domain models.
//!
//! A `DagRun` is the mutable container for one execution of a DAG: per-block
//! instances, a free-form context map, and the run-level status. The executor
//! owns all status mutation; hosts may only write the approval-protocol
//! context keys and read snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::block::BlockDef;
use super::gate::GateResult;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    PausedApproval,
    Completed,
    Failed,
    Cancelled,
    /// Set by higher-level review tooling, never by the executor itself.
    Iterated,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Iterated
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::PausedApproval => "paused_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Iterated => "iterated",
        };
        write!(f, "{s}")
    }
}

/// Status of a block instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Waiting out a retry delay; flips back to `Pending` when it elapses.
    Retrying,
    Skipped,
}

impl BlockStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Retry bookkeeping on a block instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    /// Attempts started so far (incremented on each start).
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Whether the provider itself attempted structured-output repair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StructuredRepair {
    pub attempted: bool,
    pub succeeded: bool,
}

/// One repair attempt in a contract trace: the validation errors remaining
/// after the attempt (empty when the attempt fixed the contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub errors: Vec<String>,
}

/// Forensic record of the output-contract repair loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractTrace {
    pub initial_errors: Vec<String>,
    pub attempts: Vec<RepairAttempt>,
    pub final_ok: bool,
}

/// Record of one completed dispatch attempt, attached to the instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub agent_id: Option<String>,
    pub provider: Option<String>,
    pub transport_provider: Option<String>,
    pub model: Option<String>,
    pub raw_output: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_repair: Option<StructuredRepair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_trace: Option<ContractTrace>,
}

impl ExecutionRecord {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// Per-run state for a block definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInstance {
    pub instance_id: Uuid,
    pub block_id: String,
    pub run_id: Uuid,
    pub status: BlockStatus,
    /// Materialized inputs (wired at start).
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Produced outputs (recorded at completion).
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub pre_gate_results: Vec<GateResult>,
    #[serde(default)]
    pub post_gate_results: Vec<GateResult>,
    pub execution: Option<ExecutionRecord>,
    /// Eagerly populated at start so observer UIs can show routing.
    pub active_agent: Option<String>,
    pub active_model: Option<String>,
    pub active_provider: Option<String>,
    pub retry_state: RetryState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BlockInstance {
    pub fn new(def: &BlockDef, run_id: Uuid) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            block_id: def.id.clone(),
            run_id,
            status: BlockStatus::Pending,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            pre_gate_results: Vec::new(),
            post_gate_results: Vec::new(),
            execution: None,
            active_agent: None,
            active_model: None,
            active_provider: None,
            retry_state: RetryState {
                attempt: 0,
                max_attempts: def.retry.max_attempts,
                next_retry_at: None,
                last_error: None,
            },
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Reset the instance to `pending` as part of a gate-fail reroute,
    /// clearing outputs, gate results, execution, and timestamps. The retry
    /// counter survives only in `attempt` history semantics: a reroute is a
    /// fresh start, so it resets too.
    pub fn reset_for_reroute(&mut self) {
        self.status = BlockStatus::Pending;
        self.outputs.clear();
        self.pre_gate_results.clear();
        self.post_gate_results.clear();
        self.execution = None;
        self.retry_state.attempt = 0;
        self.retry_state.next_retry_at = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Pending approval request, stashed in the run context while paused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub token: Uuid,
    pub run_id: Uuid,
    pub block_id: String,
    pub dag_name: String,
    pub status: String,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    pub context_preview: HashMap<String, Value>,
}

/// One blocked block in a stuck-run diagnostics record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedBlock {
    pub block_id: String,
    pub missing_required_inputs: Vec<String>,
    /// Unmet upstream edges as `(edge description, upstream status)`.
    pub unmet_edges: Vec<UnmetEdge>,
}

/// An upstream edge that could not deliver its value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmetEdge {
    pub from_block: String,
    pub from_port: String,
    pub to_port: String,
    pub upstream_status: BlockStatus,
}

/// Diagnostics written to `__stuck_diagnostics` when no progress is possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckDiagnostics {
    pub blocked: Vec<BlockedBlock>,
}

/// Mutable container for one execution of a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagRun {
    pub id: Uuid,
    pub dag_name: String,
    pub status: RunStatus,
    /// Block instances keyed by block id.
    pub blocks: HashMap<String, BlockInstance>,
    /// Seed inputs, reserved keys, and per-block overrides.
    pub context: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DagRun {
    pub fn instance(&self, block_id: &str) -> Option<&BlockInstance> {
        self.blocks.get(block_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Total tokens recorded across all block executions.
    pub fn total_tokens(&self) -> u64 {
        self.blocks
            .values()
            .filter_map(|b| b.execution.as_ref())
            .map(ExecutionRecord::total_tokens)
            .sum()
    }

    /// Whether a context value is boolean `true` (or the string `"true"`).
    pub fn context_flag(&self, key: &str) -> bool {
        match self.context.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        }
    }
}

/// Reserved context keys: the contract between the executor and its host.
/// Hosts must not write other `__`-prefixed keys.
pub mod context_keys {
    /// Pending approval request metadata.
    pub const APPROVAL_REQUEST: &str = "__approval_request";
    /// Development toggle that auto-approves every approval block.
    pub const DEV_AUTO_APPROVE: &str = "__dev_auto_approve";
    /// Stuck-run diagnostics record.
    pub const STUCK_DIAGNOSTICS: &str = "__stuck_diagnostics";
    /// Machine-readable failure code for a failed run.
    pub const FAILURE_CODE: &str = "__failure_code";
    /// Human-readable failure reason for a failed run.
    pub const FAILURE_REASON: &str = "__failure_reason";
    /// Last failed gate payload stashed by a `feedback_from` reroute rule.
    pub const GATE_VERDICTS: &str = "gate_verdicts";

    /// Resume flag for a paused approval block.
    pub fn approval(block_id: &str) -> String {
        format!("__approval_{block_id}")
    }

    /// Wiring override for one input port.
    pub fn override_input(block_id: &str, port: &str) -> String {
        format!("__override_input_{block_id}_{port}")
    }

    /// Bounce counter for one (block, gate) pair.
    pub fn bounce(block_id: &str, gate: &str) -> String {
        format!("__bounce_{block_id}_{gate}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::PausedApproval.is_terminal());
        assert!(BlockStatus::Skipped.is_terminal());
        assert!(!BlockStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_context_keys() {
        assert_eq!(context_keys::approval("Build"), "__approval_Build");
        assert_eq!(
            context_keys::override_input("Build", "spec"),
            "__override_input_Build_spec"
        );
        assert_eq!(context_keys::bounce("Build", "judge"), "__bounce_Build_judge");
    }

    #[test]
    fn test_context_flag() {
        let mut run = DagRun {
            id: Uuid::new_v4(),
            dag_name: "d".to_string(),
            status: RunStatus::Pending,
            blocks: HashMap::new(),
            context: HashMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!run.context_flag("missing"));
        run.context
            .insert("a".to_string(), Value::Bool(true));
        run.context
            .insert("b".to_string(), Value::String("true".to_string()));
        run.context
            .insert("c".to_string(), Value::String("yes".to_string()));
        assert!(run.context_flag("a"));
        assert!(run.context_flag("b"));
        assert!(!run.context_flag("c"));
    }
}
