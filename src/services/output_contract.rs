//! Output parsing and contract validation.
//!
//! Provider output arrives as text and must fit the block's typed output
//! contract. Parsing tries strict JSON first, then JSON inside a fenced code
//! block. A multi-output block with unparseable text fails the contract
//! rather than guessing which port the raw text belongs to; a single-output
//! block may take the raw string as that one port's value.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::domain::models::BlockDef;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    // (?s) so the body may span lines; non-greedy so multiple fences are
    // tried separately.
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap_or_else(|_| unreachable!())
});

/// Extract a JSON value from raw model text: strict parse first, then each
/// fenced code block in order.
pub fn parse_json_text(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    for captures in FENCED_BLOCK.captures_iter(raw) {
        if let Some(body) = captures.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim()) {
                return Some(value);
            }
        }
    }
    None
}

/// Map raw provider text onto the block's declared output ports.
///
/// A parsed JSON object is treated as the outputs mapping (declared ports
/// only; extra keys are dropped). A parsed non-object, or fully unparseable
/// text, is assigned to the port only when the block declares exactly one
/// output; otherwise the mapping comes back empty and contract validation
/// reports the missing ports.
pub fn parse_outputs(def: &BlockDef, raw: &str) -> HashMap<String, Value> {
    let mut outputs = HashMap::new();
    let single_port = if def.outputs.len() == 1 {
        def.outputs.keys().next().cloned()
    } else {
        None
    };

    match parse_json_text(raw) {
        Some(Value::Object(map)) => {
            for name in def.outputs.keys() {
                if let Some(value) = map.get(name) {
                    outputs.insert(name.clone(), value.clone());
                }
            }
        }
        Some(other) => {
            if let Some(port) = single_port {
                outputs.insert(port, other);
            }
        }
        None => {
            if let Some(port) = single_port {
                outputs.insert(port, Value::String(raw.to_string()));
            }
        }
    }
    outputs
}

/// Validate outputs against the declared contract.
///
/// Returns one message per violation, empty when the contract holds. `null`
/// counts as absent.
pub fn validate_outputs(def: &BlockDef, outputs: &HashMap<String, Value>) -> Vec<String> {
    let mut errors = Vec::new();
    let mut names: Vec<&String> = def.outputs.keys().collect();
    names.sort();

    for name in names {
        let port = &def.outputs[name];
        match outputs.get(name.as_str()) {
            None | Some(Value::Null) => {
                if port.required {
                    errors.push(format!("missing required output '{name}'"));
                }
            }
            Some(value) => {
                if !port.port_type.accepts(value) {
                    errors.push(format!(
                        "output '{name}' has invalid type (expected {})",
                        port.port_type.as_str()
                    ));
                }
            }
        }
    }
    errors
}

/// Overlay repair-dispatch outputs onto the previous attempt's outputs.
///
/// Partial repairs ("add the missing key") converge without requiring the
/// model to resend ports that already validated.
pub fn merge_outputs(base: &mut HashMap<String, Value>, repair: HashMap<String, Value>) {
    for (name, value) in repair {
        if !value.is_null() {
            base.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        AgentRef, BlockMode, GateComposition, PortDef, PortType, RetryPolicy,
    };
    use serde_json::json;

    fn block_with_outputs(outputs: &[(&str, PortType)]) -> BlockDef {
        BlockDef {
            id: "b".to_string(),
            name: "b".to_string(),
            mode: BlockMode::Ai,
            inputs: HashMap::new(),
            outputs: outputs
                .iter()
                .map(|(name, ty)| ((*name).to_string(), PortDef::new(*ty)))
                .collect(),
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
    fn test_parse_strict_json() {
        let v = parse_json_text(r#"{"a": 1}"#).unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "Sure, here is the result:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(parse_json_text(raw).unwrap(), json!({"a": 1}));

        let unlabeled = "```\n[1, 2]\n```";
        assert_eq!(parse_json_text(unlabeled).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_parse_skips_non_json_fences() {
        let raw = "```\nnot json\n```\n```json\n{\"ok\": true}\n```";
        assert_eq!(parse_json_text(raw).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_multi_output_unparseable_yields_empty() {
        let def = block_with_outputs(&[
            ("game_spec", PortType::Json),
            ("dev_plan", PortType::String),
        ]);
        let outputs = parse_outputs(&def, "free-form prose, no JSON anywhere");
        assert!(outputs.is_empty());
        let errors = validate_outputs(&def, &outputs);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("'dev_plan'")));
    }

    #[test]
    fn test_single_output_takes_raw_string() {
        let def = block_with_outputs(&[("summary", PortType::String)]);
        let outputs = parse_outputs(&def, "Just a plain answer.");
        assert_eq!(outputs["summary"], json!("Just a plain answer."));
        assert!(validate_outputs(&def, &outputs).is_empty());
    }

    #[test]
    fn test_object_maps_declared_ports_only() {
        let def = block_with_outputs(&[("a", PortType::Number)]);
        let outputs = parse_outputs(&def, r#"{"a": 1, "extra": true}"#);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["a"], json!(1));
    }

    #[test]
    fn test_type_validation() {
        let def = block_with_outputs(&[("n", PortType::Number)]);
        let outputs = HashMap::from([("n".to_string(), json!("not a number"))]);
        let errors = validate_outputs(&def, &outputs);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("invalid type"));
    }

    #[test]
    fn test_optional_port_may_be_absent() {
        let mut def = block_with_outputs(&[("opt", PortType::String)]);
        if let Some(port) = def.outputs.get_mut("opt") {
            port.required = false;
        }
        assert!(validate_outputs(&def, &HashMap::new()).is_empty());
    }

    #[test]
    fn test_merge_overlays_without_clobbering_with_null() {
        let mut base = HashMap::from([("a".to_string(), json!(1))]);
        merge_outputs(
            &mut base,
            HashMap::from([
                ("b".to_string(), json!(2)),
                ("a".to_string(), Value::Null),
            ]),
        );
        assert_eq!(base["a"], json!(1));
        assert_eq!(base["b"], json!(2));
    }
}
