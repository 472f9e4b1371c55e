//! Gate domain models.
//!
//! A gate is a named pre- or post-condition over a block's ports. The check
//! variants here are the parsed, validated form; the DAG parser is
//! responsible for rejecting unknown check types and out-of-range fields
//! before any of these are constructed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dynamic value kinds used by the `port_type` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

impl ValueKind {
    /// Classify a JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::String,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Boolean,
            Value::Object(_) => Self::Object,
            Value::Array(_) => Self::Array,
            Value::Null => Self::Null,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "null" => Some(Self::Null),
            _ => None,
        }
    }
}

/// Comparison mode for the `diff` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    Equal,
    NotEqual,
}

/// The check a gate performs, tagged by its `type` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateCheck {
    /// Fails when the port value is null, missing, or whitespace-only.
    PortNotEmpty { port: String },
    /// Fails when the stringified port value does not match the pattern.
    PortMatches { port: String, pattern: String },
    /// Fails when the stringified port value is shorter than `min`.
    PortMinLength { port: String, min: usize },
    /// Fails when the dynamic kind of the port value is not `expected`.
    PortType { port: String, expected: ValueKind },
    /// Lightweight structural check for `type: object` schemas.
    JsonSchema { port: String, schema: Value },
    /// Compares two ports under canonical JSON form.
    Diff {
        left: String,
        right: String,
        mode: DiffMode,
    },
    /// Reads a numeric port (default `__cost`), fails when > `max`.
    Cost { port: Option<String>, max: f64 },
    /// Reads a numeric port (default `__latency_ms`), fails when > `max`.
    Latency { port: Option<String>, max: f64 },
    /// Counts case-insensitive keyword occurrences in the port value.
    SemanticReview {
        port: String,
        keywords: Vec<String>,
        min_matches: usize,
    },
    /// Sandboxed expression over `{inputs, outputs}`; passes iff truthy.
    Expr { expr: String },
    /// Runs a command; fails closed unless shell gates are enabled by the host.
    Shell {
        command: String,
        timeout_ms: Option<u64>,
    },
    /// Issues a request and compares the status code. `mock://status/NNN`
    /// returns NNN without network I/O.
    Http {
        url: String,
        expect_status: u16,
        timeout_ms: u64,
    },
    /// Out-of-band: the executor dispatches a review request to a judge
    /// provider and scores the returned verdicts against `pass_threshold`.
    LlmReview {
        port: String,
        criteria: Vec<String>,
        provider: String,
        model: Option<String>,
        pass_threshold: f64,
    },
}

impl GateCheck {
    /// The wire-format `type` string for this check.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PortNotEmpty { .. } => "port_not_empty",
            Self::PortMatches { .. } => "port_matches",
            Self::PortMinLength { .. } => "port_min_length",
            Self::PortType { .. } => "port_type",
            Self::JsonSchema { .. } => "json_schema",
            Self::Diff { .. } => "diff",
            Self::Cost { .. } => "cost",
            Self::Latency { .. } => "latency",
            Self::SemanticReview { .. } => "semantic_review",
            Self::Expr { .. } => "expr",
            Self::Shell { .. } => "shell",
            Self::Http { .. } => "http",
            Self::LlmReview { .. } => "llm_review",
        }
    }

    /// All check type strings accepted by the parser.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "port_not_empty",
        "port_matches",
        "port_min_length",
        "port_type",
        "json_schema",
        "diff",
        "cost",
        "latency",
        "semantic_review",
        "expr",
        "shell",
        "http",
        "llm_review",
    ];
}

/// A named gate: the check plus the name gate-fail rules route on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    #[serde(flatten)]
    pub check: GateCheck,
}

/// Outcome of evaluating a single gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Evidence for out-of-band checks (full prompt, raw response, verdicts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<Value>,
}

impl GateResult {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            reason: None,
            audit: None,
        }
    }

    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            reason: Some(reason.into()),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Value) -> Self {
        self.audit = Some(audit);
        self
    }
}
