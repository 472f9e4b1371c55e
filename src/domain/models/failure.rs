//! Block failure classification.

use serde::{Deserialize, Serialize};

use super::run::ContractTrace;

/// User-visible failure codes emitted through the block-fail callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    PreGateFailed,
    PostGateFailed,
    /// Non-terminal: a gate failure consumed a bounce and rerouted.
    GateFailReroute,
    AgentNotFound,
    AgentRouteAmbiguous,
    ProviderNotFound,
    DispatchFailed,
    DispatchException,
    DispatchTimeout,
    DetConfigInvalid,
    DetExecFailed,
    OutputContractFailed,
    BudgetExceeded,
    HandoffUnsatisfiable,
    RunStuck,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreGateFailed => "PRE_GATE_FAILED",
            Self::PostGateFailed => "POST_GATE_FAILED",
            Self::GateFailReroute => "GATE_FAIL_REROUTE",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::AgentRouteAmbiguous => "AGENT_ROUTE_AMBIGUOUS",
            Self::ProviderNotFound => "PROVIDER_NOT_FOUND",
            Self::DispatchFailed => "DISPATCH_FAILED",
            Self::DispatchException => "DISPATCH_EXCEPTION",
            Self::DispatchTimeout => "DISPATCH_TIMEOUT",
            Self::DetConfigInvalid => "DET_CONFIG_INVALID",
            Self::DetExecFailed => "DET_EXEC_FAILED",
            Self::OutputContractFailed => "OUTPUT_CONTRACT_FAILED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::HandoffUnsatisfiable => "HANDOFF_UNSATISFIABLE",
            Self::RunStuck => "RUN_STUCK",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Dispatch,
    Parse,
    Contract,
    Gate,
    Handoff,
    Timeout,
    Budget,
    Orphan,
    Unknown,
}

/// Structured failure details surfaced with every terminal block failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub stage: FailureStage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_trace: Option<ContractTrace>,
    /// Truncated preview of the raw output for contract failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output_preview: Option<String>,
}

impl FailureInfo {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            contract_trace: None,
            raw_output_preview: None,
        }
    }

    pub fn with_contract_trace(mut self, trace: ContractTrace) -> Self {
        self.contract_trace = Some(trace);
        self
    }

    pub fn with_raw_preview(mut self, raw: &str) -> Self {
        const PREVIEW_LIMIT: usize = 512;
        let preview: String = raw.chars().take(PREVIEW_LIMIT).collect();
        self.raw_output_preview = Some(preview);
        self
    }
}
