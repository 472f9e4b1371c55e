//! Block definition domain models.
//!
//! A `BlockDef` is the static template for one unit of work in a DAG: its
//! typed input/output ports, how it executes (AI dispatch, deterministic
//! handler, or human approval), the gates guarding it, and its retry and
//! repair policies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::canon::canonical_string;
use super::gate::GateSpec;

/// Semantic type of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    String,
    Number,
    Boolean,
    Json,
    File,
    Artifact,
}

impl PortType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Json => "json",
            Self::File => "file",
            Self::Artifact => "artifact",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "json" => Some(Self::Json),
            "file" => Some(Self::File),
            "artifact" => Some(Self::Artifact),
            _ => None,
        }
    }

    /// Whether a runtime value satisfies this port type.
    ///
    /// `json` accepts any object or array; `file` and `artifact` carry their
    /// payload as strings (a path or an artifact reference).
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Json => value.is_object() || value.is_array(),
            Self::File | Self::Artifact => value.is_string(),
        }
    }
}

/// A typed connection point on a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDef {
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_true() -> bool {
    true
}

impl PortDef {
    pub fn new(port_type: PortType) -> Self {
        Self {
            port_type,
            required: true,
            description: None,
            default: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// How a block executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockMode {
    Ai,
    Deterministic,
    Approval,
}

impl BlockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Deterministic => "deterministic",
            Self::Approval => "approval",
        }
    }
}

/// Agent selection for AI blocks: a specific id, role/capability selectors,
/// or empty for deterministic blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

impl AgentRef {
    pub fn specific(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.role.is_none() && self.capability.is_none()
    }
}

/// Deterministic execution spec: handler name plus free-form config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeterministicSpec {
    pub handler: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

/// Aggregation rule for a gate sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compose {
    #[default]
    All,
    Any,
}

/// Pre/post gate aggregation rules.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GateComposition {
    #[serde(default)]
    pub pre: Compose,
    #[serde(default)]
    pub post: Compose,
}

/// A gate-failure reroute rule ("bounce").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnGateFailRule {
    /// Name of the gate this rule matches.
    pub when_gate: String,
    /// Block reset to `pending` as the reroute target.
    pub route_to: String,
    /// Additional blocks reset alongside the target.
    #[serde(default)]
    pub reset_blocks: Vec<String>,
    /// Bounce budget for this (block, gate) pair. Must be > 0.
    pub max_bounces: u32,
    /// When `gate_verdicts`, the failing gate's payload is stashed into the
    /// run context for the rerouted blocks to read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    None,
    Linear,
    Exponential,
}

/// Retry policy for dispatch failures. Gate failures are never auto-retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            delay_ms: 1000,
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the attempt that just failed
    /// (1-based). Capped by `max_delay_ms` when set.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let raw = match self.backoff {
            Backoff::None => self.delay_ms,
            Backoff::Linear => self.delay_ms.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => {
                let shift = (attempt - 1).min(32);
                self.delay_ms.saturating_mul(1u64 << shift)
            }
        };
        match self.max_delay_ms {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }
}

/// Approval policy for `approval`-mode blocks (or AI blocks that opt in).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
}

/// Static template for one block in a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDef {
    /// Unique within the DAG.
    pub id: String,
    /// Display name.
    pub name: String,
    pub mode: BlockMode,
    #[serde(default)]
    pub inputs: HashMap<String, PortDef>,
    #[serde(default)]
    pub outputs: HashMap<String, PortDef>,
    #[serde(default)]
    pub agent: AgentRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deterministic: Option<DeterministicSpec>,
    #[serde(default)]
    pub pre_gates: Vec<GateSpec>,
    #[serde(default)]
    pub post_gates: Vec<GateSpec>,
    #[serde(default)]
    pub gate_composition: GateComposition,
    #[serde(default)]
    pub on_gate_fail: Vec<OnGateFailRule>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalPolicy>,
    /// Hard dispatch timeout. 0 or unset means no timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub strict_output: bool,
    /// Clamped to [0, 3] at parse time.
    #[serde(default = "default_repair_attempts")]
    pub contract_repair_attempts: u8,
}

fn default_repair_attempts() -> u8 {
    1
}

impl BlockDef {
    /// Look up a gate by name across pre- and post-gates.
    pub fn gate(&self, name: &str) -> Option<&GateSpec> {
        self.pre_gates
            .iter()
            .chain(self.post_gates.iter())
            .find(|g| g.name == name)
    }

    /// Required input port names, sorted for determinism.
    pub fn required_inputs(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .inputs
            .iter()
            .filter(|(_, port)| port.required)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

/// Stable hash of a block's canonical contract.
///
/// Covers the fields that define the block's observable interface: id, mode,
/// ports, agent reference, deterministic spec, gates, and composition.
/// Retry/approval/timeout tuning is excluded so operational adjustments do
/// not change a block's identity.
pub fn hash_block_def(def: &BlockDef) -> String {
    let ports = |map: &HashMap<String, PortDef>| -> Value {
        let entries: serde_json::Map<String, Value> = map
            .iter()
            .map(|(name, port)| {
                (
                    name.clone(),
                    json!({
                        "type": port.port_type.as_str(),
                        "required": port.required,
                        "default": port.default,
                    }),
                )
            })
            .collect();
        Value::Object(entries)
    };

    let contract = json!({
        "id": def.id,
        "mode": def.mode.as_str(),
        "inputs": ports(&def.inputs),
        "outputs": ports(&def.outputs),
        "agent": def.agent,
        "deterministic": def.deterministic,
        "pre_gates": def.pre_gates,
        "post_gates": def.post_gates,
        "gate_composition": def.gate_composition,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical_string(&contract).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: &str) -> BlockDef {
        BlockDef {
            id: id.to_string(),
            name: id.to_string(),
            mode: BlockMode::Ai,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            agent: AgentRef::default(),
            deterministic: None,
            pre_gates: vec![],
            post_gates: vec![],
            gate_composition: GateComposition::default(),
            on_gate_fail: vec![],
            retry: RetryPolicy::default(),
            approval: None,
            timeout_ms: None,
            strict_output: true,
            contract_repair_attempts: 1,
        }
    }

    #[test]
    fn test_port_type_accepts() {
        use serde_json::json;
        assert!(PortType::String.accepts(&json!("x")));
        assert!(!PortType::String.accepts(&json!(1)));
        assert!(PortType::Json.accepts(&json!({"a": 1})));
        assert!(PortType::Json.accepts(&json!([1, 2])));
        assert!(!PortType::Json.accepts(&json!("not json")));
        assert!(PortType::File.accepts(&json!("path/to/file")));
        assert!(PortType::Artifact.accepts(&json!("artifact-ref")));
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Backoff::Exponential,
            delay_ms: 100,
            max_delay_ms: Some(300),
        };
        assert_eq!(policy.delay_for(1), 100);
        assert_eq!(policy.delay_for(2), 200);
        assert_eq!(policy.delay_for(3), 300); // capped from 400

        let linear = RetryPolicy {
            backoff: Backoff::Linear,
            max_delay_ms: None,
            ..policy
        };
        assert_eq!(linear.delay_for(3), 300);

        let none = RetryPolicy {
            backoff: Backoff::None,
            max_delay_ms: None,
            ..policy
        };
        assert_eq!(none.delay_for(3), 100);
    }

    #[test]
    fn test_hash_stable_and_contract_sensitive() {
        let a = block("b1");
        let b = block("b1");
        assert_eq!(hash_block_def(&a), hash_block_def(&b));

        let mut c = block("b1");
        c.outputs
            .insert("result".to_string(), PortDef::new(PortType::String));
        assert_ne!(hash_block_def(&a), hash_block_def(&c));

        // Operational tuning does not change identity.
        let mut d = block("b1");
        d.retry.max_attempts = 5;
        d.timeout_ms = Some(9000);
        assert_eq!(hash_block_def(&a), hash_block_def(&d));
    }
}
