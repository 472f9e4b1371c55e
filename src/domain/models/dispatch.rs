//! Provider dispatch request/result shapes.
//!
//! The executor builds a `DispatchRequest` per attempt; providers return a
//! `DispatchResult` whose `output` is an arbitrary string the executor is
//! responsible for parsing.

use std::collections::HashMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identity of the agent the executor resolved for this dispatch.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub id: String,
    pub model: Option<String>,
    pub provider: String,
}

/// A single provider invocation.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Block instance id this dispatch serves.
    pub task_id: Uuid,
    pub dag_name: String,
    pub block_name: String,
    /// Structured prompt (inputs table, expected outputs, criteria).
    pub prompt: String,
    pub inputs: HashMap<String, Value>,
    /// Post-gate derived acceptance criteria, plus bounce feedback if any.
    pub acceptance_criteria: Vec<String>,
    /// How many times this block has been bounced by gate-fail reroutes.
    pub bounce_count: u32,
    /// JSON schema inferred from the block's output ports.
    pub output_schema: Value,
    pub model_params: Option<Value>,
    pub agent: Option<AgentIdentity>,
    /// Cooperative cancellation; the executor composes its own timeout into
    /// this token, so providers only need to observe one signal.
    pub cancel: CancellationToken,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Result of a provider invocation.
#[derive(Debug, Clone, Default)]
pub struct DispatchResult {
    pub success: bool,
    /// Raw output text; parsing is the executor's job.
    pub output: Option<String>,
    pub tokens_used: Option<TokenUsage>,
    pub actual_agent_id: Option<String>,
    pub actual_model: Option<String>,
    pub actual_provider: Option<String>,
    pub actual_model_provider: Option<String>,
    pub error: Option<String>,
    pub repair_attempted: bool,
    pub repair_succeeded: bool,
}

impl DispatchResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.tokens_used = Some(TokenUsage { input, output });
        self
    }
}
