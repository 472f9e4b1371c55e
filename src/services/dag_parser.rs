//! DAG configuration parser.
//!
//! Accepts a tree-shaped configuration (JSON or YAML) and produces a
//! validated [`Dag`], or fails with a precise error naming the offending
//! block/port and, where it helps, suggesting the closest known identifier.
//!
//! Validation order: document shape, blocks (ports, agent, deterministic
//! spec, gates with the ReDoS guard, retry/approval/timeout), edges,
//! `on_gate_fail` references, entrypoints/terminals, and finally cycle
//! detection via Kahn's topological sort.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentRef, ApprovalPolicy, Backoff, BlockDef, BlockMode, Compose, Dag, DeterministicSpec,
    DiffMode, Edge, GateCheck, GateComposition, GateSpec, OnGateFailRule, PortDef, PortType,
    RetryPolicy, ValueKind,
};
use crate::services::expr;

const MAX_REGEX_LEN: usize = 256;
const MAX_REPAIR_ATTEMPTS: u8 = 3;

fn parse_err(msg: impl Into<String>) -> DomainError {
    DomainError::Parse(msg.into())
}

/// Parse a DAG from a YAML document.
pub fn parse_dag_yaml(source: &str) -> DomainResult<Dag> {
    let value: Value = serde_yaml::from_str(source)?;
    parse_dag(&value)
}

/// Parse a DAG from a JSON document.
pub fn parse_dag_json(source: &str) -> DomainResult<Dag> {
    let value: Value = serde_json::from_str(source)?;
    parse_dag(&value)
}

/// Parse a DAG from an already-loaded configuration tree.
pub fn parse_dag(config: &Value) -> DomainResult<Dag> {
    let root = config
        .as_object()
        .ok_or_else(|| parse_err("DAG configuration must be an object"))?;

    let name = root
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| parse_err("DAG configuration requires a non-empty 'name'"))?
        .to_string();

    let blocks = parse_blocks(root.get("blocks"))?;
    if blocks.is_empty() {
        return Err(parse_err(format!("DAG '{name}' has no blocks")));
    }

    let edges = parse_edges(root.get("edges"), &blocks)?;
    validate_gate_fail_rules(&blocks)?;

    let mut dag = Dag {
        name,
        blocks,
        edges,
        entrypoints: Vec::new(),
        terminals: Vec::new(),
    };

    dag.entrypoints = match root.get("entrypoints") {
        Some(value) => parse_block_id_list(value, "entrypoints", &dag.blocks)?,
        None => dag.compute_entrypoints(),
    };
    dag.terminals = match root.get("terminals") {
        Some(value) => parse_block_id_list(value, "terminals", &dag.blocks)?,
        None => dag.compute_terminals(),
    };

    if let Err(remaining) = dag.topological_order() {
        return Err(parse_err(format!(
            "DAG '{}' contains a cycle involving: {}",
            dag.name,
            remaining.join(", ")
        )));
    }

    Ok(dag)
}

// ============================================================================
// Blocks
// ============================================================================

fn parse_blocks(value: Option<&Value>) -> DomainResult<HashMap<String, BlockDef>> {
    let list: Vec<&Value> = match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Object(map)) => {
            // Map form: keys are ids; inject them so both forms parse alike.
            return map
                .iter()
                .map(|(id, body)| {
                    let mut body = body.clone();
                    if let Some(obj) = body.as_object_mut() {
                        obj.entry("id".to_string())
                            .or_insert_with(|| Value::String(id.clone()));
                    }
                    let def = parse_block(&body)?;
                    Ok((def.id.clone(), def))
                })
                .collect();
        }
        _ => return Err(parse_err("'blocks' must be an array or object")),
    };

    let mut blocks = HashMap::new();
    for item in list {
        let def = parse_block(item)?;
        if blocks.contains_key(&def.id) {
            return Err(parse_err(format!("duplicate block id '{}'", def.id)));
        }
        blocks.insert(def.id.clone(), def);
    }
    Ok(blocks)
}

fn parse_block(value: &Value) -> DomainResult<BlockDef> {
    let obj = value
        .as_object()
        .ok_or_else(|| parse_err("each block must be an object"))?;

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| parse_err("block requires a non-empty 'id'"))?
        .to_string();
    let at = |msg: String| parse_err(format!("block '{id}': {msg}"));

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&id)
        .to_string();

    let mode_str = obj
        .get("mode")
        .and_then(Value::as_str)
        .ok_or_else(|| at("requires a 'mode'".to_string()))?;
    let mode = match mode_str {
        "ai" => BlockMode::Ai,
        "deterministic" => BlockMode::Deterministic,
        "approval" => BlockMode::Approval,
        other => {
            return Err(at(format!(
                "unknown mode '{other}'{}",
                suggest(other, &["ai", "deterministic", "approval"])
            )))
        }
    };

    let inputs = parse_ports(obj.get("inputs"), &id, "inputs")?;
    let outputs = parse_ports(obj.get("outputs"), &id, "outputs")?;
    let agent = parse_agent_ref(obj.get("agent"), &id)?;

    let deterministic = match (mode, obj.get("deterministic")) {
        (BlockMode::Deterministic, Some(spec)) => Some(parse_deterministic(spec, &id)?),
        (BlockMode::Deterministic, None) => {
            return Err(at("deterministic mode requires a 'deterministic' spec".to_string()))
        }
        (_, Some(_)) => {
            return Err(at(format!(
                "'deterministic' spec is only valid for deterministic mode (mode is '{mode_str}')"
            )))
        }
        (_, None) => None,
    };

    let pre_gates = parse_gates(obj.get("pre_gates"), &id, "pre_gates")?;
    let post_gates = parse_gates(obj.get("post_gates"), &id, "post_gates")?;
    let gate_composition = parse_gate_composition(obj.get("gate_composition"), &id)?;
    let on_gate_fail = parse_gate_fail(obj.get("on_gate_fail"), &id)?;
    let retry = parse_retry(obj.get("retry"), &id)?;
    let approval = match obj.get("approval") {
        Some(value) => Some(parse_approval(value, &id)?),
        None => None,
    };

    let timeout_ms = match obj.get("timeout_ms") {
        None => None,
        Some(value) => Some(
            value
                .as_u64()
                .ok_or_else(|| at("'timeout_ms' must be a non-negative integer".to_string()))?,
        ),
    };

    let strict_output = match obj.get("strict_output") {
        None => true,
        Some(value) => value
            .as_bool()
            .ok_or_else(|| at("'strict_output' must be a boolean".to_string()))?,
    };

    let contract_repair_attempts = match obj.get("contract_repair_attempts") {
        None => 1,
        Some(value) => {
            let n = value.as_u64().ok_or_else(|| {
                at("'contract_repair_attempts' must be a non-negative integer".to_string())
            })?;
            u8::try_from(n.min(u64::from(MAX_REPAIR_ATTEMPTS))).unwrap_or(MAX_REPAIR_ATTEMPTS)
        }
    };

    Ok(BlockDef {
        id,
        name,
        mode,
        inputs,
        outputs,
        agent,
        deterministic,
        pre_gates,
        post_gates,
        gate_composition,
        on_gate_fail,
        retry,
        approval,
        timeout_ms,
        strict_output,
        contract_repair_attempts,
    })
}

fn parse_ports(
    value: Option<&Value>,
    block_id: &str,
    section: &str,
) -> DomainResult<HashMap<String, PortDef>> {
    let Some(value) = value else {
        return Ok(HashMap::new());
    };
    let map = value
        .as_object()
        .ok_or_else(|| parse_err(format!("block '{block_id}': '{section}' must be an object")))?;

    let mut ports = HashMap::new();
    for (port_name, spec) in map {
        let port = match spec {
            // Shorthand: `idea: string` promotes to {type, required: true}.
            Value::String(type_str) => PortDef::new(parse_port_type(type_str, block_id, port_name)?),
            Value::Object(fields) => {
                let type_str = fields
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        parse_err(format!(
                            "block '{block_id}': port '{port_name}' requires a 'type'"
                        ))
                    })?;
                let mut port = PortDef::new(parse_port_type(type_str, block_id, port_name)?);
                if let Some(required) = fields.get("required") {
                    port.required = required.as_bool().ok_or_else(|| {
                        parse_err(format!(
                            "block '{block_id}': port '{port_name}' 'required' must be a boolean"
                        ))
                    })?;
                }
                port.description = fields
                    .get("description")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                port.default = fields.get("default").cloned();
                port
            }
            _ => {
                return Err(parse_err(format!(
                    "block '{block_id}': port '{port_name}' must be a type string or an object"
                )))
            }
        };
        ports.insert(port_name.clone(), port);
    }
    Ok(ports)
}

fn parse_port_type(type_str: &str, block_id: &str, port_name: &str) -> DomainResult<PortType> {
    const KNOWN: &[&str] = &["string", "number", "boolean", "json", "file", "artifact"];
    PortType::from_str(type_str).ok_or_else(|| {
        parse_err(format!(
            "block '{block_id}': port '{port_name}' has unknown type '{type_str}'{}",
            suggest(type_str, KNOWN)
        ))
    })
}

fn parse_agent_ref(value: Option<&Value>, block_id: &str) -> DomainResult<AgentRef> {
    match value {
        None => Ok(AgentRef::default()),
        Some(Value::String(id)) => Ok(AgentRef::specific(id.clone())),
        Some(Value::Object(map)) => Ok(AgentRef {
            id: map.get("id").and_then(Value::as_str).map(ToString::to_string),
            role: map
                .get("role")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            capability: map
                .get("capability")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }),
        Some(_) => Err(parse_err(format!(
            "block '{block_id}': 'agent' must be an id string or a selector object"
        ))),
    }
}

fn parse_deterministic(value: &Value, block_id: &str) -> DomainResult<DeterministicSpec> {
    let obj = value.as_object().ok_or_else(|| {
        parse_err(format!("block '{block_id}': 'deterministic' must be an object"))
    })?;
    let handler = obj
        .get("handler")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            parse_err(format!(
                "block '{block_id}': deterministic spec requires a non-empty 'handler'"
            ))
        })?
        .to_string();
    let config = match obj.get("config") {
        None => HashMap::new(),
        Some(Value::Object(map)) => map.clone().into_iter().collect(),
        Some(_) => {
            return Err(parse_err(format!(
                "block '{block_id}': deterministic 'config' must be an object"
            )))
        }
    };
    Ok(DeterministicSpec { handler, config })
}

fn parse_gate_composition(value: Option<&Value>, block_id: &str) -> DomainResult<GateComposition> {
    let Some(value) = value else {
        return Ok(GateComposition::default());
    };
    let obj = value.as_object().ok_or_else(|| {
        parse_err(format!("block '{block_id}': 'gate_composition' must be an object"))
    })?;
    let parse_compose = |key: &str| -> DomainResult<Compose> {
        match obj.get(key).and_then(Value::as_str) {
            None => Ok(Compose::All),
            Some("all") => Ok(Compose::All),
            Some("any") => Ok(Compose::Any),
            Some(other) => Err(parse_err(format!(
                "block '{block_id}': gate composition '{key}' must be 'all' or 'any', got '{other}'"
            ))),
        }
    };
    Ok(GateComposition {
        pre: parse_compose("pre")?,
        post: parse_compose("post")?,
    })
}

fn parse_retry(value: Option<&Value>, block_id: &str) -> DomainResult<RetryPolicy> {
    let Some(value) = value else {
        return Ok(RetryPolicy::default());
    };
    let obj = value
        .as_object()
        .ok_or_else(|| parse_err(format!("block '{block_id}': 'retry' must be an object")))?;

    let mut policy = RetryPolicy::default();
    if let Some(n) = obj.get("max_attempts") {
        let n = n.as_u64().filter(|n| *n >= 1).ok_or_else(|| {
            parse_err(format!("block '{block_id}': retry 'max_attempts' must be >= 1"))
        })?;
        policy.max_attempts = u32::try_from(n).unwrap_or(u32::MAX);
    }
    if let Some(backoff) = obj.get("backoff").and_then(Value::as_str) {
        policy.backoff = match backoff {
            "none" => Backoff::None,
            "linear" => Backoff::Linear,
            "exponential" => Backoff::Exponential,
            other => {
                return Err(parse_err(format!(
                    "block '{block_id}': unknown backoff '{other}'{}",
                    suggest(other, &["none", "linear", "exponential"])
                )))
            }
        };
    }
    if let Some(delay) = obj.get("delay_ms") {
        policy.delay_ms = delay.as_u64().ok_or_else(|| {
            parse_err(format!("block '{block_id}': retry 'delay_ms' must be a non-negative integer"))
        })?;
    }
    if let Some(cap) = obj.get("max_delay_ms") {
        policy.max_delay_ms = Some(cap.as_u64().ok_or_else(|| {
            parse_err(format!(
                "block '{block_id}': retry 'max_delay_ms' must be a non-negative integer"
            ))
        })?);
    }
    Ok(policy)
}

fn parse_approval(value: &Value, block_id: &str) -> DomainResult<ApprovalPolicy> {
    let obj = value
        .as_object()
        .ok_or_else(|| parse_err(format!("block '{block_id}': 'approval' must be an object")))?;
    Ok(ApprovalPolicy {
        required: obj.get("required").and_then(Value::as_bool).unwrap_or(true),
        prompt: obj
            .get("prompt")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        approver: obj
            .get("approver")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        timeout_sec: obj.get("timeout_sec").and_then(Value::as_u64),
    })
}

// ============================================================================
// Gates
// ============================================================================

fn parse_gates(value: Option<&Value>, block_id: &str, section: &str) -> DomainResult<Vec<GateSpec>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let list = value
        .as_array()
        .ok_or_else(|| parse_err(format!("block '{block_id}': '{section}' must be an array")))?;
    list.iter()
        .map(|item| parse_gate(item, block_id, section))
        .collect()
}

#[allow(clippy::too_many_lines)]
fn parse_gate(value: &Value, block_id: &str, section: &str) -> DomainResult<GateSpec> {
    let obj = value.as_object().ok_or_else(|| {
        parse_err(format!("block '{block_id}': each gate in '{section}' must be an object"))
    })?;

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            parse_err(format!("block '{block_id}': gate in '{section}' requires a non-empty 'name'"))
        })?
        .to_string();
    let at = |msg: String| parse_err(format!("block '{block_id}': gate '{name}': {msg}"));

    let check_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| at("requires a check 'type'".to_string()))?;

    let require_str = |key: &str| -> DomainResult<String> {
        obj.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| at(format!("requires a non-empty '{key}'")))
    };

    let check = match check_type {
        "port_not_empty" => GateCheck::PortNotEmpty {
            port: require_str("port")?,
        },
        "port_matches" => {
            let pattern = require_str("pattern")?;
            validate_regex_pattern(&pattern).map_err(at)?;
            GateCheck::PortMatches {
                port: require_str("port")?,
                pattern,
            }
        }
        "port_min_length" => {
            let min = obj
                .get("min")
                .and_then(Value::as_u64)
                .ok_or_else(|| at("requires a non-negative integer 'min'".to_string()))?;
            GateCheck::PortMinLength {
                port: require_str("port")?,
                min: usize::try_from(min).unwrap_or(usize::MAX),
            }
        }
        "port_type" => {
            let expected_str = require_str("expected")?;
            let expected = ValueKind::from_str(&expected_str).ok_or_else(|| {
                at(format!(
                    "unknown expected type '{expected_str}'{}",
                    suggest(
                        &expected_str,
                        &["string", "number", "boolean", "object", "array", "null"]
                    )
                ))
            })?;
            GateCheck::PortType {
                port: require_str("port")?,
                expected,
            }
        }
        "json_schema" => {
            let schema = obj
                .get("schema")
                .filter(|s| s.is_object())
                .cloned()
                .ok_or_else(|| at("requires an object 'schema'".to_string()))?;
            GateCheck::JsonSchema {
                port: require_str("port")?,
                schema,
            }
        }
        "diff" => {
            let mode = match obj.get("mode").and_then(Value::as_str) {
                None | Some("equal") => DiffMode::Equal,
                Some("not_equal") => DiffMode::NotEqual,
                Some(other) => {
                    return Err(at(format!(
                        "unknown diff mode '{other}'{}",
                        suggest(other, &["equal", "not_equal"])
                    )))
                }
            };
            GateCheck::Diff {
                left: require_str("left")?,
                right: require_str("right")?,
                mode,
            }
        }
        "cost" | "latency" => {
            let max = obj
                .get("max")
                .and_then(Value::as_f64)
                .filter(|m| *m >= 0.0)
                .ok_or_else(|| at("requires a non-negative number 'max'".to_string()))?;
            let port = obj
                .get("port")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            if check_type == "cost" {
                GateCheck::Cost { port, max }
            } else {
                GateCheck::Latency { port, max }
            }
        }
        "semantic_review" => {
            let keywords: Vec<String> = obj
                .get("keywords")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .filter(|kws: &Vec<String>| !kws.is_empty())
                .ok_or_else(|| at("requires a non-empty string array 'keywords'".to_string()))?;
            let min_matches = obj.get("min_matches").and_then(Value::as_u64).unwrap_or(1);
            GateCheck::SemanticReview {
                port: require_str("port")?,
                keywords,
                min_matches: usize::try_from(min_matches).unwrap_or(usize::MAX),
            }
        }
        "expr" => {
            let source = require_str("expr")?;
            expr::check(&source).map_err(|e| at(format!("invalid expression: {e}")))?;
            GateCheck::Expr { expr: source }
        }
        "shell" => GateCheck::Shell {
            command: require_str("command")?,
            timeout_ms: obj.get("timeout_ms").and_then(Value::as_u64),
        },
        "http" => {
            let expect_status = obj
                .get("expect_status")
                .and_then(Value::as_u64)
                .filter(|s| (100..=599).contains(s))
                .ok_or_else(|| at("requires 'expect_status' in 100..=599".to_string()))?;
            GateCheck::Http {
                url: require_str("url")?,
                expect_status: u16::try_from(expect_status).unwrap_or(599),
                timeout_ms: obj.get("timeout_ms").and_then(Value::as_u64).unwrap_or(5000),
            }
        }
        "llm_review" => {
            let criteria: Vec<String> = obj
                .get("criteria")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .filter(|c: &Vec<String>| !c.is_empty())
                .ok_or_else(|| at("requires a non-empty string array 'criteria'".to_string()))?;
            let pass_threshold = match obj.get("pass_threshold") {
                None => 1.0,
                Some(value) => value
                    .as_f64()
                    .filter(|t| (0.0..=1.0).contains(t))
                    .ok_or_else(|| at("'pass_threshold' must be in [0, 1]".to_string()))?,
            };
            GateCheck::LlmReview {
                port: require_str("port")?,
                criteria,
                provider: require_str("provider")?,
                model: obj
                    .get("model")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                pass_threshold,
            }
        }
        other => {
            return Err(at(format!(
                "unknown check type '{other}'{}",
                suggest(other, GateCheck::KNOWN_TYPES)
            )))
        }
    };

    Ok(GateSpec { name, check })
}

/// ReDoS guard: cap pattern length and reject a quantified group that is
/// itself quantified (`(a+)+`, `(x*){2,}` and friends), then require the
/// pattern to compile.
fn validate_regex_pattern(pattern: &str) -> Result<(), String> {
    if pattern.len() > MAX_REGEX_LEN {
        return Err(format!(
            "pattern exceeds the {MAX_REGEX_LEN}-character safety guard"
        ));
    }
    if has_nested_quantifier(pattern) {
        return Err(
            "pattern contains a nested quantifier, rejected by the ReDoS safety guard".to_string(),
        );
    }
    Regex::new(pattern).map_err(|e| format!("pattern does not compile: {e}"))?;
    Ok(())
}

fn has_nested_quantifier(pattern: &str) -> bool {
    let chars: Vec<char> = pattern.chars().collect();
    // Stack of (group start, quantifier seen inside).
    let mut stack: Vec<bool> = Vec::new();
    let mut in_class = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => i += 1, // skip escaped char
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            _ if in_class => {}
            '(' => stack.push(false),
            ')' => {
                let had_inner_quantifier = stack.pop().unwrap_or(false);
                let quantified = matches!(chars.get(i + 1), Some('+' | '*' | '{'));
                if had_inner_quantifier && quantified {
                    return true;
                }
                // A quantified group counts as a quantifier for its parent.
                if quantified {
                    if let Some(parent) = stack.last_mut() {
                        *parent = true;
                    }
                }
            }
            '+' | '*' | '{' => {
                if let Some(current) = stack.last_mut() {
                    *current = true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

// ============================================================================
// Edges and references
// ============================================================================

fn parse_edges(
    value: Option<&Value>,
    blocks: &HashMap<String, BlockDef>,
) -> DomainResult<Vec<Edge>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let list = value
        .as_array()
        .ok_or_else(|| parse_err("'edges' must be an array"))?;

    let mut edges: Vec<Edge> = Vec::with_capacity(list.len());
    for item in list {
        let edge = parse_edge(item, blocks)?;
        if edges
            .iter()
            .any(|e| e.to_block == edge.to_block && e.to_port == edge.to_port)
        {
            return Err(parse_err(format!(
                "input port '{}.{}' is wired by more than one edge",
                edge.to_block, edge.to_port
            )));
        }
        edges.push(edge);
    }
    Ok(edges)
}

fn parse_edge(value: &Value, blocks: &HashMap<String, BlockDef>) -> DomainResult<Edge> {
    let obj = value
        .as_object()
        .ok_or_else(|| parse_err("each edge must be an object"))?;

    // Two accepted shapes: dotted shorthand {from: "A.out", to: "B.in"} or
    // explicit {from_block, from_port, to_block, to_port}.
    let (from_block, from_port) = if let Some(dotted) = obj.get("from").and_then(Value::as_str) {
        split_endpoint(dotted, "from")?
    } else {
        (
            required_field(obj, "from_block")?,
            required_field(obj, "from_port")?,
        )
    };
    let (to_block, to_port) = if let Some(dotted) = obj.get("to").and_then(Value::as_str) {
        split_endpoint(dotted, "to")?
    } else {
        (
            required_field(obj, "to_block")?,
            required_field(obj, "to_port")?,
        )
    };

    let block_ids: Vec<&str> = blocks.keys().map(String::as_str).collect();
    let source = blocks.get(&from_block).ok_or_else(|| {
        parse_err(format!(
            "edge references unknown block '{from_block}'{}",
            suggest(&from_block, &block_ids)
        ))
    })?;
    let target = blocks.get(&to_block).ok_or_else(|| {
        parse_err(format!(
            "edge references unknown block '{to_block}'{}",
            suggest(&to_block, &block_ids)
        ))
    })?;

    if !source.outputs.contains_key(&from_port) {
        let ports: Vec<&str> = source.outputs.keys().map(String::as_str).collect();
        return Err(parse_err(format!(
            "edge references unknown output port '{from_block}.{from_port}'{}",
            suggest(&from_port, &ports)
        )));
    }
    if !target.inputs.contains_key(&to_port) {
        let ports: Vec<&str> = target.inputs.keys().map(String::as_str).collect();
        return Err(parse_err(format!(
            "edge references unknown input port '{to_block}.{to_port}'{}",
            suggest(&to_port, &ports)
        )));
    }

    let transform = obj
        .get("transform")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    if let Some(ref source) = transform {
        expr::check(source).map_err(|e| {
            parse_err(format!(
                "edge '{from_block}.{from_port}' -> '{to_block}.{to_port}': invalid transform: {e}"
            ))
        })?;
    }

    Ok(Edge {
        from_block,
        from_port,
        to_block,
        to_port,
        transform,
    })
}

fn split_endpoint(dotted: &str, field: &str) -> DomainResult<(String, String)> {
    dotted
        .rsplit_once('.')
        .map(|(block, port)| (block.to_string(), port.to_string()))
        .filter(|(block, port)| !block.is_empty() && !port.is_empty())
        .ok_or_else(|| parse_err(format!("edge '{field}' must be 'block.port', got '{dotted}'")))
}

fn required_field(obj: &serde_json::Map<String, Value>, key: &str) -> DomainResult<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| parse_err(format!("edge requires '{key}'")))
}

fn parse_gate_fail(value: Option<&Value>, block_id: &str) -> DomainResult<Vec<OnGateFailRule>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let list = value
        .as_array()
        .ok_or_else(|| parse_err(format!("block '{block_id}': 'on_gate_fail' must be an array")))?;

    list.iter()
        .map(|item| {
            let obj = item.as_object().ok_or_else(|| {
                parse_err(format!("block '{block_id}': each on_gate_fail rule must be an object"))
            })?;
            let get = |key: &str| -> DomainResult<String> {
                obj.get(key)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .ok_or_else(|| {
                        parse_err(format!(
                            "block '{block_id}': on_gate_fail rule requires '{key}'"
                        ))
                    })
            };
            let max_bounces = obj
                .get("max_bounces")
                .and_then(Value::as_u64)
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    parse_err(format!(
                        "block '{block_id}': on_gate_fail 'max_bounces' must be > 0"
                    ))
                })?;
            let reset_blocks = match obj.get("reset_blocks") {
                None => Vec::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect(),
                Some(_) => {
                    return Err(parse_err(format!(
                        "block '{block_id}': on_gate_fail 'reset_blocks' must be an array"
                    )))
                }
            };
            Ok(OnGateFailRule {
                when_gate: get("when_gate")?,
                route_to: get("route_to")?,
                reset_blocks,
                max_bounces: u32::try_from(max_bounces).unwrap_or(u32::MAX),
                feedback_from: obj
                    .get("feedback_from")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                reason: obj
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            })
        })
        .collect()
}

/// Cross-block validation of `on_gate_fail` references, after every block
/// parsed: `route_to` and `reset_blocks` must name known blocks, `when_gate`
/// a gate defined on the same block.
fn validate_gate_fail_rules(blocks: &HashMap<String, BlockDef>) -> DomainResult<()> {
    let block_ids: Vec<&str> = blocks.keys().map(String::as_str).collect();
    for def in blocks.values() {
        for rule in &def.on_gate_fail {
            if def.gate(&rule.when_gate).is_none() {
                let gates: Vec<&str> = def
                    .pre_gates
                    .iter()
                    .chain(def.post_gates.iter())
                    .map(|g| g.name.as_str())
                    .collect();
                return Err(parse_err(format!(
                    "block '{}': on_gate_fail references unknown gate '{}'{}",
                    def.id,
                    rule.when_gate,
                    suggest(&rule.when_gate, &gates)
                )));
            }
            if !blocks.contains_key(&rule.route_to) {
                return Err(parse_err(format!(
                    "block '{}': on_gate_fail 'route_to' references unknown block '{}'{}",
                    def.id,
                    rule.route_to,
                    suggest(&rule.route_to, &block_ids)
                )));
            }
            for reset in &rule.reset_blocks {
                if !blocks.contains_key(reset) {
                    return Err(parse_err(format!(
                        "block '{}': on_gate_fail 'reset_blocks' references unknown block '{}'{}",
                        def.id,
                        reset,
                        suggest(reset, &block_ids)
                    )));
                }
            }
        }
    }
    Ok(())
}

fn parse_block_id_list(
    value: &Value,
    field: &str,
    blocks: &HashMap<String, BlockDef>,
) -> DomainResult<Vec<String>> {
    let list = value
        .as_array()
        .ok_or_else(|| parse_err(format!("'{field}' must be an array of block ids")))?;
    let block_ids: Vec<&str> = blocks.keys().map(String::as_str).collect();
    list.iter()
        .map(|item| {
            let id = item
                .as_str()
                .ok_or_else(|| parse_err(format!("'{field}' entries must be strings")))?;
            if blocks.contains_key(id) {
                Ok(id.to_string())
            } else {
                Err(parse_err(format!(
                    "'{field}' references unknown block '{id}'{}",
                    suggest(id, &block_ids)
                )))
            }
        })
        .collect()
}

// ============================================================================
// Suggestions
// ============================================================================

/// "did you mean" helper: closest candidate within 40% of the longer length.
fn suggest(input: &str, candidates: &[&str]) -> String {
    let mut best: Option<(usize, &str)> = None;
    for candidate in candidates {
        let distance = levenshtein(input, candidate);
        if best.is_none_or(|(d, _)| distance < d) {
            best = Some((distance, candidate));
        }
    }
    match best {
        Some((distance, candidate)) => {
            let longer = input.chars().count().max(candidate.chars().count());
            if longer > 0 && distance * 100 <= longer * 40 {
                format!(" (did you mean '{candidate}'?)")
            } else {
                String::new()
            }
        }
        None => String::new(),
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_config() -> Value {
        json!({
            "name": "pipeline",
            "blocks": [
                {
                    "id": "Plan",
                    "mode": "ai",
                    "inputs": {"idea": "string"},
                    "outputs": {"plan": "string"},
                },
                {
                    "id": "Build",
                    "mode": "ai",
                    "inputs": {"plan": "string"},
                    "outputs": {"artifact": "json"},
                },
            ],
            "edges": [
                {"from": "Plan.plan", "to": "Build.plan"},
            ],
        })
    }

    #[test]
    fn test_parse_minimal() {
        let dag = parse_dag(&minimal_config()).unwrap();
        assert_eq!(dag.name, "pipeline");
        assert_eq!(dag.blocks.len(), 2);
        assert_eq!(dag.entrypoints, vec!["Plan"]);
        assert_eq!(dag.terminals, vec!["Build"]);
        let idea = &dag.blocks["Plan"].inputs["idea"];
        assert_eq!(idea.port_type, PortType::String);
        assert!(idea.required);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let a = parse_dag(&minimal_config()).unwrap();
        let b = parse_dag(&minimal_config()).unwrap();
        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }

    #[test]
    fn test_unknown_mode_suggests() {
        let mut config = minimal_config();
        config["blocks"][0]["mode"] = json!("determinstic");
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("did you mean 'deterministic'"), "{err}");
    }

    #[test]
    fn test_unknown_gate_type_suggests() {
        let mut config = minimal_config();
        config["blocks"][0]["post_gates"] = json!([
            {"name": "g", "type": "port_not_emty", "port": "plan"}
        ]);
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("did you mean 'port_not_empty'"), "{err}");
    }

    #[test]
    fn test_edge_unknown_port_suggests() {
        let mut config = minimal_config();
        config["edges"] = json!([{"from": "Plan.pla", "to": "Build.plan"}]);
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("unknown output port"), "{err}");
        assert!(err.contains("did you mean 'plan'"), "{err}");
    }

    #[test]
    fn test_duplicate_input_wiring_rejected() {
        let mut config = minimal_config();
        config["blocks"][0]["outputs"] = json!({"plan": "string", "alt": "string"});
        config["edges"] = json!([
            {"from": "Plan.plan", "to": "Build.plan"},
            {"from": "Plan.alt", "to": "Build.plan"},
        ]);
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("more than one edge"), "{err}");
    }

    #[test]
    fn test_cycle_detected_names_blocks() {
        let mut config = minimal_config();
        config["blocks"][0]["inputs"] = json!({"idea": "string", "loop": {"type": "json", "required": false}});
        config["blocks"][1]["outputs"] = json!({"artifact": "json"});
        config["edges"] = json!([
            {"from": "Plan.plan", "to": "Build.plan"},
            {"from": "Build.artifact", "to": "Plan.loop"},
        ]);
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("cycle"), "{err}");
        assert!(err.contains("Build") && err.contains("Plan"), "{err}");
    }

    #[test]
    fn test_redos_guard_rejects_nested_quantifier() {
        let mut config = minimal_config();
        config["blocks"][0]["post_gates"] = json!([
            {"name": "g", "type": "port_matches", "port": "plan", "pattern": "(a+)+$"}
        ]);
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("safety guard"), "{err}");
    }

    #[test]
    fn test_redos_guard_rejects_long_patterns() {
        let mut config = minimal_config();
        let long = "a".repeat(MAX_REGEX_LEN + 1);
        config["blocks"][0]["post_gates"] = json!([
            {"name": "g", "type": "port_matches", "port": "plan", "pattern": long}
        ]);
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("safety guard"), "{err}");
    }

    #[test]
    fn test_redos_guard_allows_reasonable_patterns() {
        assert!(validate_regex_pattern("^hello [a-z]+ world$").is_ok());
        assert!(validate_regex_pattern(r"\d{3}-\d{4}").is_ok());
        assert!(validate_regex_pattern("(foo|bar) baz").is_ok());
        // Quantifier inside a character class is literal.
        assert!(validate_regex_pattern("([+*])+").is_ok());
    }

    #[test]
    fn test_deterministic_spec_required() {
        let mut config = minimal_config();
        config["blocks"][0]["mode"] = json!("deterministic");
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("requires a 'deterministic' spec"), "{err}");

        config["blocks"][0]["deterministic"] = json!({"handler": ""});
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("non-empty 'handler'"), "{err}");
    }

    #[test]
    fn test_gate_fail_rule_validation() {
        let mut config = minimal_config();
        config["blocks"][1]["post_gates"] = json!([
            {"name": "judge", "type": "port_not_empty", "port": "artifact"}
        ]);
        config["blocks"][1]["on_gate_fail"] = json!([
            {"when_gate": "judge", "route_to": "Pln", "max_bounces": 1}
        ]);
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("did you mean 'Plan'"), "{err}");

        config["blocks"][1]["on_gate_fail"] = json!([
            {"when_gate": "judge", "route_to": "Plan", "max_bounces": 0}
        ]);
        let err = parse_dag(&config).unwrap_err().to_string();
        assert!(err.contains("max_bounces"), "{err}");
    }

    #[test]
    fn test_contract_repair_attempts_clamped() {
        let mut config = minimal_config();
        config["blocks"][0]["contract_repair_attempts"] = json!(9);
        let dag = parse_dag(&config).unwrap();
        assert_eq!(dag.blocks["Plan"].contract_repair_attempts, 3);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r"
name: yaml-pipeline
blocks:
  - id: Solo
    mode: ai
    inputs:
      seed: string
    outputs:
      answer: string
";
        let dag = parse_dag_yaml(yaml).unwrap();
        assert_eq!(dag.name, "yaml-pipeline");
        assert_eq!(dag.entrypoints, vec!["Solo"]);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_suggestion_threshold() {
        // Distance must be within 40% of the longer string.
        assert_eq!(suggest("plan", &["plan"]), " (did you mean 'plan'?)");
        assert_eq!(suggest("pln", &["plan"]), " (did you mean 'plan'?)");
        assert_eq!(suggest("zzzzz", &["plan"]), "");
    }
}
