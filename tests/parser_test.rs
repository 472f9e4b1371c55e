//! Parser-facing integration tests: configuration loading, error quality,
//! and block-hash stability.

use serde_json::json;

use openskelo::domain::models::hash_block_def;
use openskelo::services::{parse_dag, parse_dag_json, parse_dag_yaml};

const PIPELINE_YAML: &str = r#"
name: review-loop
blocks:
  - id: Draft
    mode: ai
    inputs:
      topic: string
    outputs:
      essay: string
    post_gates:
      - name: long_enough
        type: port_min_length
        port: essay
        min: 40
      - name: on_topic
        type: semantic_review
        port: essay
        keywords: [rust, async]
        min_matches: 2
    on_gate_fail:
      - when_gate: on_topic
        route_to: Draft
        max_bounces: 2
        feedback_from: gate_verdicts
  - id: Publish
    mode: deterministic
    inputs:
      essay: string
    outputs:
      page: string
    deterministic:
      handler: "builtin:template"
      config:
        page: "<html>${essay}</html>"
edges:
  - from: Draft.essay
    to: Publish.essay
"#;

#[test]
fn test_yaml_pipeline_parses() {
    let dag = parse_dag_yaml(PIPELINE_YAML).unwrap();
    assert_eq!(dag.name, "review-loop");
    assert_eq!(dag.entrypoints, vec!["Draft"]);
    assert_eq!(dag.terminals, vec!["Publish"]);
    assert_eq!(dag.blocks["Draft"].post_gates.len(), 2);
    assert_eq!(dag.blocks["Draft"].on_gate_fail[0].max_bounces, 2);
    assert_eq!(
        dag.blocks["Publish"].deterministic.as_ref().unwrap().handler,
        "builtin:template"
    );
}

#[test]
fn test_json_and_yaml_agree() {
    let yaml = parse_dag_yaml(PIPELINE_YAML).unwrap();
    let json_text = serde_json::to_string(
        &serde_yaml::from_str::<serde_json::Value>(PIPELINE_YAML).unwrap(),
    )
    .unwrap();
    let json = parse_dag_json(&json_text).unwrap();
    assert_eq!(
        serde_json::to_value(&yaml).unwrap(),
        serde_json::to_value(&json).unwrap()
    );
}

#[test]
fn test_reparse_produces_identical_structure_and_hashes() {
    let a = parse_dag_yaml(PIPELINE_YAML).unwrap();
    let b = parse_dag_yaml(PIPELINE_YAML).unwrap();
    assert_eq!(
        serde_json::to_value(&a).unwrap(),
        serde_json::to_value(&b).unwrap()
    );
    for (id, def) in &a.blocks {
        assert_eq!(hash_block_def(def), hash_block_def(&b.blocks[id]));
    }
}

#[test]
fn test_error_names_block_and_suggests() {
    let config = json!({
        "name": "p",
        "blocks": [
            {
                "id": "Check",
                "mode": "ai",
                "inputs": {"text": "string"},
                "outputs": {"ok": "boolean"},
                "pre_gates": [
                    {"name": "g", "type": "port_mn_length", "port": "text", "min": 3}
                ],
            },
        ],
    });
    let err = parse_dag(&config).unwrap_err().to_string();
    assert!(err.contains("block 'Check'"), "{err}");
    assert!(err.contains("did you mean 'port_min_length'"), "{err}");
}

#[test]
fn test_empty_and_nameless_configs_rejected() {
    assert!(parse_dag(&json!({"blocks": []})).is_err());
    assert!(parse_dag(&json!({"name": "p", "blocks": []})).is_err());
    assert!(parse_dag(&json!({"name": "p"})).is_err());
}

#[test]
fn test_explicit_entrypoints_validated() {
    let config = json!({
        "name": "p",
        "blocks": [
            {"id": "A", "mode": "ai", "inputs": {}, "outputs": {"x": "string"}},
        ],
        "entrypoints": ["Missing"],
    });
    let err = parse_dag(&config).unwrap_err().to_string();
    assert!(err.contains("unknown block 'Missing'"), "{err}");
}
