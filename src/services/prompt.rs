//! Structured prompt construction for provider dispatches.
//!
//! Prompts carry an inputs table, the expected-output list with a JSON shape
//! template, and quality criteria derived from the block's post-gates. The
//! repair prompt reuses the shape template and enumerates the specific
//! contract violations to fix.

use serde_json::{json, Map, Value};

use crate::domain::models::{BlockDef, GateCheck, PortDef, PortType};

/// Human-readable placeholder for a port's expected JSON value.
fn placeholder(port: &PortDef) -> Value {
    match port.port_type {
        PortType::String => json!("<string>"),
        PortType::Number => json!("<number>"),
        PortType::Boolean => json!("<true|false>"),
        PortType::Json => json!({"...": "..."}),
        PortType::File => json!("<file path>"),
        PortType::Artifact => json!("<artifact reference>"),
    }
}

/// JSON shape template listing every declared output port.
pub fn output_template(def: &BlockDef) -> Value {
    let mut names: Vec<&String> = def.outputs.keys().collect();
    names.sort();
    let map: Map<String, Value> = names
        .into_iter()
        .map(|name| (name.clone(), placeholder(&def.outputs[name])))
        .collect();
    Value::Object(map)
}

/// JSON schema inferred from the block's output ports, handed to providers
/// that support structured output.
pub fn infer_output_schema(def: &BlockDef) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    let mut names: Vec<&String> = def.outputs.keys().collect();
    names.sort();

    for name in names {
        let port = &def.outputs[name];
        let prop = match port.port_type {
            PortType::String | PortType::File | PortType::Artifact => json!({"type": "string"}),
            PortType::Number => json!({"type": "number"}),
            PortType::Boolean => json!({"type": "boolean"}),
            PortType::Json => json!({}),
        };
        properties.insert(name.clone(), prop);
        if port.required {
            required.push(Value::String(name.clone()));
        }
    }

    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": Value::Array(required),
    })
}

/// Quality criteria shown to the provider, derived from post-gates.
pub fn acceptance_criteria(def: &BlockDef) -> Vec<String> {
    def.post_gates
        .iter()
        .map(|gate| match &gate.check {
            GateCheck::PortNotEmpty { port } => format!("'{port}' must not be empty"),
            GateCheck::PortMatches { port, pattern } => {
                format!("'{port}' must match the pattern /{pattern}/")
            }
            GateCheck::PortMinLength { port, min } => {
                format!("'{port}' must be at least {min} characters")
            }
            GateCheck::PortType { port, expected } => {
                format!("'{port}' must be of type {}", expected.as_str())
            }
            GateCheck::SemanticReview { port, keywords, .. } => {
                format!("'{port}' should cover: {}", keywords.join(", "))
            }
            GateCheck::LlmReview { criteria, .. } => criteria.join("; "),
            other => format!("gate '{}' ({}) must pass", gate.name, other.type_name()),
        })
        .collect()
}

/// Build the main dispatch prompt for an AI block.
pub fn build_dispatch_prompt(
    def: &BlockDef,
    inputs: &std::collections::HashMap<String, Value>,
    feedback: Option<&Value>,
) -> String {
    let mut prompt = format!("# Task: {}\n\n", def.name);

    if !inputs.is_empty() {
        prompt.push_str("## Inputs\n\n");
        let mut names: Vec<&String> = inputs.keys().collect();
        names.sort();
        for name in names {
            let rendered = match &inputs[name] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            prompt.push_str(&format!("### {name}\n\n{rendered}\n\n"));
        }
    }

    prompt.push_str("## Expected outputs\n\n");
    let mut names: Vec<&String> = def.outputs.keys().collect();
    names.sort();
    for name in names {
        let port = &def.outputs[name];
        let requirement = if port.required { "required" } else { "optional" };
        prompt.push_str(&format!(
            "- `{name}` ({}, {requirement}){}\n",
            port.port_type.as_str(),
            port.description
                .as_deref()
                .map(|d| format!(": {d}"))
                .unwrap_or_default()
        ));
    }
    prompt.push_str(&format!(
        "\nRespond with a single JSON object shaped exactly like:\n\n```json\n{}\n```\n",
        serde_json::to_string_pretty(&output_template(def)).unwrap_or_default()
    ));

    let criteria = acceptance_criteria(def);
    if !criteria.is_empty() {
        prompt.push_str("\n## Quality criteria\n\n");
        for criterion in &criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
    }

    if let Some(verdicts) = feedback {
        prompt.push_str(&format!(
            "\n## Previous attempt feedback\n\nA prior attempt failed review. \
             Address this feedback:\n\n```json\n{}\n```\n",
            serde_json::to_string_pretty(verdicts).unwrap_or_default()
        ));
    }

    prompt
}

/// Build the targeted repair prompt for an output-contract violation.
pub fn build_repair_prompt(def: &BlockDef, errors: &[String], raw_output: &str) -> String {
    let mut prompt = format!(
        "# Fix output format for: {}\n\nYour previous response did not satisfy \
         the output contract.\n\n## Errors\n\n",
        def.name
    );
    for error in errors {
        prompt.push_str(&format!("- {error}\n"));
    }
    prompt.push_str(&format!(
        "\n## Previous response\n\n{}\n\n## Required shape\n\nRespond with ONLY \
         a single JSON object shaped exactly like:\n\n```json\n{}\n```\n",
        raw_output.chars().take(2000).collect::<String>(),
        serde_json::to_string_pretty(&output_template(def)).unwrap_or_default()
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AgentRef, BlockMode, GateComposition, GateSpec, RetryPolicy};
    use std::collections::HashMap;

    fn block() -> BlockDef {
        BlockDef {
            id: "build".to_string(),
            name: "Build".to_string(),
            mode: BlockMode::Ai,
            inputs: HashMap::new(),
            outputs: HashMap::from([
                ("plan".to_string(), PortDef::new(PortType::String)),
                ("spec".to_string(), PortDef::new(PortType::Json)),
            ]),
            agent: AgentRef::default(),
            deterministic: None,
            pre_gates: vec![],
            post_gates: vec![GateSpec {
                name: "nonempty".to_string(),
                check: GateCheck::PortNotEmpty {
                    port: "plan".to_string(),
                },
            }],
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
    fn test_schema_inference() {
        let schema = infer_output_schema(&block());
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["plan"]["type"], "string");
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(required, vec!["plan", "spec"]);
    }

    #[test]
    fn test_dispatch_prompt_sections() {
        let inputs = HashMap::from([("idea".to_string(), serde_json::json!("a game"))]);
        let prompt = build_dispatch_prompt(&block(), &inputs, None);
        assert!(prompt.contains("# Task: Build"));
        assert!(prompt.contains("### idea"));
        assert!(prompt.contains("`plan` (string, required)"));
        assert!(prompt.contains("```json"));
        assert!(prompt.contains("'plan' must not be empty"));
    }

    #[test]
    fn test_repair_prompt_lists_errors() {
        let prompt = build_repair_prompt(
            &block(),
            &["missing required output 'plan'".to_string()],
            "{\"spec\": {}}",
        );
        assert!(prompt.contains("missing required output 'plan'"));
        assert!(prompt.contains("Required shape"));
    }
}
