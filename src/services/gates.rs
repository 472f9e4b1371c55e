//! Gate evaluation.
//!
//! Gates see `ports = inputs ∪ outputs` with outputs overriding on name
//! conflicts. Most checks are pure over that mapping; `shell`, `http`, and
//! `llm_review` perform I/O — the executor hands the gate layer the provider
//! registry so the judged gate can issue its own out-of-band dispatch.

use std::collections::HashMap;

use regex::Regex;
use serde_json::{json, Value};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::models::{
    canonical_string, Compose, DiffMode, GateCheck, GateResult, GateSpec, ValueKind,
};
use crate::domain::ports::ProviderRegistry;
use crate::infrastructure::settings::GateSettings;
use crate::services::{expr, llm_review};

/// Default port names for the budget-style checks.
pub const COST_PORT: &str = "__cost";
pub const LATENCY_PORT: &str = "__latency_ms";

/// Everything a gate evaluation can see.
pub struct GateContext<'a> {
    pub inputs: &'a HashMap<String, Value>,
    pub outputs: &'a HashMap<String, Value>,
    pub settings: &'a GateSettings,
    /// Present when the executor allows out-of-band dispatches (llm_review).
    pub providers: Option<&'a dyn ProviderRegistry>,
    pub cancel: CancellationToken,
    pub dag_name: &'a str,
    pub block_name: &'a str,
    pub instance_id: Uuid,
}

impl GateContext<'_> {
    /// Port lookup: outputs shadow inputs.
    pub fn port(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name).or_else(|| self.inputs.get(name))
    }
}

/// Aggregate outcome of a gate sequence.
#[derive(Debug, Clone)]
pub struct GatesOutcome {
    pub passed: bool,
    pub results: Vec<GateResult>,
    /// Name of the first failing gate (reroute rules match on this).
    pub first_failure: Option<String>,
}

/// Evaluate a gate sequence under the given composition rule.
///
/// Every gate is evaluated (results are recorded for forensics even after a
/// failure). `all` requires every gate to pass; `any` requires at least one,
/// and an empty sequence passes either way.
pub async fn evaluate_gates(
    gates: &[GateSpec],
    compose: Compose,
    ctx: &GateContext<'_>,
) -> GatesOutcome {
    let mut results = Vec::with_capacity(gates.len());
    for gate in gates {
        results.push(evaluate_gate(gate, ctx).await);
    }

    let passed = match compose {
        Compose::All => results.iter().all(|r| r.passed),
        Compose::Any => results.is_empty() || results.iter().any(|r| r.passed),
    };
    let first_failure = if passed {
        None
    } else {
        results.iter().find(|r| !r.passed).map(|r| r.name.clone())
    };

    GatesOutcome {
        passed,
        results,
        first_failure,
    }
}

/// Evaluate one gate.
pub async fn evaluate_gate(gate: &GateSpec, ctx: &GateContext<'_>) -> GateResult {
    let name = gate.name.as_str();
    match &gate.check {
        GateCheck::PortNotEmpty { port } => check_port_not_empty(name, port, ctx),
        GateCheck::PortMatches { port, pattern } => check_port_matches(name, port, pattern, ctx),
        GateCheck::PortMinLength { port, min } => check_port_min_length(name, port, *min, ctx),
        GateCheck::PortType { port, expected } => check_port_type(name, port, *expected, ctx),
        GateCheck::JsonSchema { port, schema } => check_json_schema(name, port, schema, ctx),
        GateCheck::Diff { left, right, mode } => check_diff(name, left, right, *mode, ctx),
        GateCheck::Cost { port, max } => {
            check_numeric_ceiling(name, port.as_deref().unwrap_or(COST_PORT), *max, ctx)
        }
        GateCheck::Latency { port, max } => {
            check_numeric_ceiling(name, port.as_deref().unwrap_or(LATENCY_PORT), *max, ctx)
        }
        GateCheck::SemanticReview {
            port,
            keywords,
            min_matches,
        } => check_semantic_review(name, port, keywords, *min_matches, ctx),
        GateCheck::Expr { expr } => check_expr(name, expr, ctx),
        GateCheck::Shell {
            command,
            timeout_ms,
        } => check_shell(name, command, *timeout_ms, ctx).await,
        GateCheck::Http {
            url,
            expect_status,
            timeout_ms,
        } => check_http(name, url, *expect_status, *timeout_ms).await,
        GateCheck::LlmReview {
            port,
            criteria,
            provider,
            model,
            pass_threshold,
        } => {
            llm_review::evaluate(
                name,
                port,
                criteria,
                provider,
                model.as_deref(),
                *pass_threshold,
                ctx,
            )
            .await
        }
    }
}

/// Stringify a port value the way gates see text: strings raw, everything
/// else as JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn check_port_not_empty(name: &str, port: &str, ctx: &GateContext<'_>) -> GateResult {
    match ctx.port(port) {
        None => GateResult::failed(name, format!("port '{port}' is missing")),
        Some(Value::Null) => GateResult::failed(name, format!("port '{port}' is null")),
        Some(Value::String(s)) if s.trim().is_empty() => {
            GateResult::failed(name, format!("port '{port}' is empty"))
        }
        Some(_) => GateResult::passed(name),
    }
}

fn check_port_matches(name: &str, port: &str, pattern: &str, ctx: &GateContext<'_>) -> GateResult {
    let Some(value) = ctx.port(port) else {
        return GateResult::failed(name, format!("port '{port}' is missing"));
    };
    // The parser pre-validates patterns; a failure here means the gate was
    // constructed without going through it.
    let regex = match Regex::new(pattern) {
        Ok(r) => r,
        Err(e) => return GateResult::failed(name, format!("invalid pattern: {e}")),
    };
    let text = stringify(value);
    if regex.is_match(&text) {
        GateResult::passed(name)
    } else {
        GateResult::failed(
            name,
            format!("port '{port}' does not match /{pattern}/"),
        )
    }
}

fn check_port_min_length(name: &str, port: &str, min: usize, ctx: &GateContext<'_>) -> GateResult {
    let text = ctx.port(port).map(stringify).unwrap_or_default();
    let len = text.chars().count();
    if len < min {
        GateResult::failed(
            name,
            format!("port '{port}' length {len} is below minimum {min}"),
        )
    } else {
        GateResult::passed(name)
    }
}

fn check_port_type(
    name: &str,
    port: &str,
    expected: ValueKind,
    ctx: &GateContext<'_>,
) -> GateResult {
    let Some(value) = ctx.port(port) else {
        return GateResult::failed(name, format!("port '{port}' is missing"));
    };
    let actual = ValueKind::of(value);
    if actual == expected {
        GateResult::passed(name)
    } else {
        GateResult::failed(
            name,
            format!(
                "port '{port}' is {} (expected {})",
                actual.as_str(),
                expected.as_str()
            ),
        )
    }
}

fn check_json_schema(name: &str, port: &str, schema: &Value, ctx: &GateContext<'_>) -> GateResult {
    let Some(value) = ctx.port(port) else {
        return GateResult::failed(name, format!("port '{port}' is missing"));
    };
    let schema_type = schema.get("type").and_then(Value::as_str).unwrap_or("object");

    if schema_type != "object" {
        let Some(expected) = ValueKind::from_str(schema_type) else {
            return GateResult::failed(name, format!("unsupported schema type '{schema_type}'"));
        };
        return if ValueKind::of(value) == expected {
            GateResult::passed(name)
        } else {
            GateResult::failed(
                name,
                format!("port '{port}' is not of type {schema_type}"),
            )
        };
    }

    let Some(object) = value.as_object() else {
        return GateResult::failed(name, format!("port '{port}' is not an object"));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return GateResult::failed(name, format!("missing required key '{key}'"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, prop_schema) in props {
            let Some(prop_value) = object.get(key) else {
                continue;
            };
            let Some(declared) = prop_schema.get("type").and_then(Value::as_str) else {
                continue;
            };
            let actual = ValueKind::of(prop_value);
            if declared != actual.as_str() {
                return GateResult::failed(
                    name,
                    format!("key '{key}' is {} (expected {declared})", actual.as_str()),
                );
            }
        }
    }

    GateResult::passed(name)
}

fn check_diff(
    name: &str,
    left: &str,
    right: &str,
    mode: DiffMode,
    ctx: &GateContext<'_>,
) -> GateResult {
    let lhs = ctx.port(left).cloned().unwrap_or(Value::Null);
    let rhs = ctx.port(right).cloned().unwrap_or(Value::Null);
    let equal = canonical_string(&lhs) == canonical_string(&rhs);
    let pass = match mode {
        DiffMode::Equal => equal,
        DiffMode::NotEqual => !equal,
    };
    if pass {
        GateResult::passed(name)
    } else {
        let what = match mode {
            DiffMode::Equal => "differ",
            DiffMode::NotEqual => "are identical",
        };
        GateResult::failed(name, format!("ports '{left}' and '{right}' {what}"))
    }
}

fn check_numeric_ceiling(name: &str, port: &str, max: f64, ctx: &GateContext<'_>) -> GateResult {
    let Some(value) = ctx.port(port).and_then(Value::as_f64) else {
        return GateResult::failed(name, format!("port '{port}' is not numeric"));
    };
    if value > max {
        GateResult::failed(name, format!("{value} exceeds ceiling {max}"))
    } else {
        GateResult::passed(name)
    }
}

fn check_semantic_review(
    name: &str,
    port: &str,
    keywords: &[String],
    min_matches: usize,
    ctx: &GateContext<'_>,
) -> GateResult {
    let text = ctx
        .port(port)
        .map(stringify)
        .unwrap_or_default()
        .to_lowercase();
    let matches: usize = keywords
        .iter()
        .map(|kw| text.matches(&kw.to_lowercase()).count())
        .sum();
    if matches < min_matches {
        GateResult::failed(
            name,
            format!("found {matches} keyword occurrence(s), need {min_matches}"),
        )
    } else {
        GateResult::passed(name)
    }
}

fn check_expr(name: &str, source: &str, ctx: &GateContext<'_>) -> GateResult {
    let scope: HashMap<String, Value> = [
        (
            "inputs".to_string(),
            Value::Object(ctx.inputs.clone().into_iter().collect()),
        ),
        (
            "outputs".to_string(),
            Value::Object(ctx.outputs.clone().into_iter().collect()),
        ),
    ]
    .into();

    match expr::evaluate_truthy(source, &scope) {
        Ok(true) => GateResult::passed(name),
        Ok(false) => GateResult::failed(name, format!("expression '{source}' is falsy")),
        Err(e) => GateResult::failed(name, format!("expression error: {e}")),
    }
}

async fn check_shell(
    name: &str,
    command: &str,
    timeout_ms: Option<u64>,
    ctx: &GateContext<'_>,
) -> GateResult {
    if !ctx.settings.allow_shell_gates {
        return GateResult::failed(
            name,
            "shell gates are disabled (set OPENSKELO_ALLOW_SHELL_GATES=true to enable)",
        );
    }
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(ctx.settings.shell_gate_timeout_ms));
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Err(_) => GateResult::failed(name, format!("command timed out after {}ms", timeout.as_millis())),
        Ok(Err(e)) => GateResult::failed(name, format!("failed to spawn command: {e}")),
        Ok(Ok(output)) => {
            if output.status.success() {
                GateResult::passed(name)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                GateResult::failed(
                    name,
                    format!(
                        "command exited with {}: {}",
                        output.status,
                        stderr.trim().chars().take(200).collect::<String>()
                    ),
                )
            }
        }
    }
}

async fn check_http(name: &str, url: &str, expect_status: u16, timeout_ms: u64) -> GateResult {
    // Deterministic test scheme: mock://status/NNN yields status NNN.
    if let Some(rest) = url.strip_prefix("mock://status/") {
        return match rest.parse::<u16>() {
            Ok(status) if status == expect_status => GateResult::passed(name),
            Ok(status) => GateResult::failed(
                name,
                format!("status {status} (expected {expect_status})"),
            ),
            Err(_) => GateResult::failed(name, format!("invalid mock url '{url}'")),
        };
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
    {
        Ok(c) => c,
        Err(e) => return GateResult::failed(name, format!("http client error: {e}")),
    };

    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if status == expect_status {
                GateResult::passed(name)
            } else {
                GateResult::failed(
                    name,
                    format!("status {status} (expected {expect_status})"),
                )
            }
        }
        Err(e) => GateResult::failed(name, format!("request failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(
        inputs: &'a HashMap<String, Value>,
        outputs: &'a HashMap<String, Value>,
        settings: &'a GateSettings,
    ) -> GateContext<'a> {
        GateContext {
            inputs,
            outputs,
            settings,
            providers: None,
            cancel: CancellationToken::new(),
            dag_name: "test",
            block_name: "block",
            instance_id: Uuid::new_v4(),
        }
    }

    fn ports(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn gate(name: &str, check: GateCheck) -> GateSpec {
        GateSpec {
            name: name.to_string(),
            check,
        }
    }

    #[tokio::test]
    async fn test_port_not_empty() {
        let settings = GateSettings::default();
        let inputs = ports(&[
            ("ok", json!("text")),
            ("blank", json!("   ")),
            ("null", json!(null)),
        ]);
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let pass = evaluate_gate(
            &gate("g", GateCheck::PortNotEmpty { port: "ok".into() }),
            &c,
        )
        .await;
        assert!(pass.passed);

        for port in ["blank", "null", "missing"] {
            let r = evaluate_gate(
                &gate("g", GateCheck::PortNotEmpty { port: port.into() }),
                &c,
            )
            .await;
            assert!(!r.passed, "port {port} should fail");
        }
    }

    #[tokio::test]
    async fn test_outputs_shadow_inputs() {
        let settings = GateSettings::default();
        let inputs = ports(&[("x", json!("from-input"))]);
        let outputs = ports(&[("x", json!(42))]);
        let c = ctx(&inputs, &outputs, &settings);

        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::PortType {
                    port: "x".into(),
                    expected: ValueKind::Number,
                },
            ),
            &c,
        )
        .await;
        assert!(r.passed);
    }

    #[tokio::test]
    async fn test_port_matches_and_min_length() {
        let settings = GateSettings::default();
        let inputs = ports(&[("text", json!("hello world"))]);
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::PortMatches {
                    port: "text".into(),
                    pattern: "^hello".into(),
                },
            ),
            &c,
        )
        .await;
        assert!(r.passed);

        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::PortMinLength {
                    port: "text".into(),
                    min: 50,
                },
            ),
            &c,
        )
        .await;
        assert!(!r.passed);
    }

    #[tokio::test]
    async fn test_json_schema_object() {
        let settings = GateSettings::default();
        let inputs = ports(&[("doc", json!({"title": "x", "tags": ["a"], "count": 2}))]);
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let schema = json!({
            "type": "object",
            "required": ["title", "tags"],
            "properties": {
                "title": {"type": "string"},
                "tags": {"type": "array"},
                "count": {"type": "number"},
            }
        });
        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::JsonSchema {
                    port: "doc".into(),
                    schema,
                },
            ),
            &c,
        )
        .await;
        assert!(r.passed, "{:?}", r.reason);

        let bad = json!({"type": "object", "required": ["missing_key"]});
        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::JsonSchema {
                    port: "doc".into(),
                    schema: bad,
                },
            ),
            &c,
        )
        .await;
        assert!(!r.passed);
    }

    #[tokio::test]
    async fn test_diff_canonical() {
        let settings = GateSettings::default();
        // Key order differs; canonical form does not.
        let inputs = ports(&[
            ("a", json!({"x": 1, "y": 2})),
            ("b", json!({"y": 2, "x": 1})),
            ("c", json!({"x": 1})),
        ]);
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::Diff {
                    left: "a".into(),
                    right: "b".into(),
                    mode: DiffMode::Equal,
                },
            ),
            &c,
        )
        .await;
        assert!(r.passed);

        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::Diff {
                    left: "a".into(),
                    right: "c".into(),
                    mode: DiffMode::NotEqual,
                },
            ),
            &c,
        )
        .await;
        assert!(r.passed);
    }

    #[tokio::test]
    async fn test_cost_and_latency_ceilings() {
        let settings = GateSettings::default();
        let inputs = ports(&[("__cost", json!(0.5)), ("__latency_ms", json!(1200))]);
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let under = evaluate_gate(&gate("g", GateCheck::Cost { port: None, max: 1.0 }), &c).await;
        assert!(under.passed);
        let over = evaluate_gate(
            &gate("g", GateCheck::Latency { port: None, max: 1000.0 }),
            &c,
        )
        .await;
        assert!(!over.passed);
    }

    #[tokio::test]
    async fn test_semantic_review_counts_occurrences() {
        let settings = GateSettings::default();
        let inputs = ports(&[("essay", json!("Tests matter. TESTS catch bugs early."))]);
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::SemanticReview {
                    port: "essay".into(),
                    keywords: vec!["tests".into(), "bugs".into()],
                    min_matches: 3,
                },
            ),
            &c,
        )
        .await;
        assert!(r.passed);

        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::SemanticReview {
                    port: "essay".into(),
                    keywords: vec!["coverage".into()],
                    min_matches: 1,
                },
            ),
            &c,
        )
        .await;
        assert!(!r.passed);
    }

    #[tokio::test]
    async fn test_expr_gate() {
        let settings = GateSettings::default();
        let inputs = ports(&[("n", json!(5))]);
        let outputs = ports(&[("result", json!("done"))]);
        let c = ctx(&inputs, &outputs, &settings);

        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::Expr {
                    expr: "inputs.n > 3 && outputs.result === 'done'".into(),
                },
            ),
            &c,
        )
        .await;
        assert!(r.passed, "{:?}", r.reason);

        // Errors fail closed.
        let r = evaluate_gate(
            &gate("g", GateCheck::Expr { expr: "boom()".into() }),
            &c,
        )
        .await;
        assert!(!r.passed);
    }

    #[tokio::test]
    async fn test_shell_gate_fails_closed() {
        let settings = GateSettings::default();
        let inputs = HashMap::new();
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let r = evaluate_gate(
            &gate(
                "g",
                GateCheck::Shell {
                    command: "true".into(),
                    timeout_ms: None,
                },
            ),
            &c,
        )
        .await;
        assert!(!r.passed);
        assert!(r.reason.as_deref().unwrap_or_default().contains("disabled"));
    }

    #[tokio::test]
    async fn test_shell_gate_enabled() {
        let settings = GateSettings::with_shell_enabled();
        let inputs = HashMap::new();
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let ok = evaluate_gate(
            &gate(
                "g",
                GateCheck::Shell {
                    command: "exit 0".into(),
                    timeout_ms: None,
                },
            ),
            &c,
        )
        .await;
        assert!(ok.passed);

        let fail = evaluate_gate(
            &gate(
                "g",
                GateCheck::Shell {
                    command: "exit 3".into(),
                    timeout_ms: None,
                },
            ),
            &c,
        )
        .await;
        assert!(!fail.passed);
    }

    #[tokio::test]
    async fn test_http_mock_scheme() {
        let settings = GateSettings::default();
        let inputs = HashMap::new();
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let ok = evaluate_gate(
            &gate(
                "g",
                GateCheck::Http {
                    url: "mock://status/200".into(),
                    expect_status: 200,
                    timeout_ms: 1000,
                },
            ),
            &c,
        )
        .await;
        assert!(ok.passed);

        let not_found = evaluate_gate(
            &gate(
                "g",
                GateCheck::Http {
                    url: "mock://status/404".into(),
                    expect_status: 200,
                    timeout_ms: 1000,
                },
            ),
            &c,
        )
        .await;
        assert!(!not_found.passed);
    }

    #[tokio::test]
    async fn test_composition_any_and_all() {
        let settings = GateSettings::default();
        let inputs = ports(&[("x", json!("value"))]);
        let outputs = HashMap::new();
        let c = ctx(&inputs, &outputs, &settings);

        let passing = gate("ok", GateCheck::PortNotEmpty { port: "x".into() });
        let failing = gate("bad", GateCheck::PortNotEmpty { port: "missing".into() });

        let all = evaluate_gates(
            &[passing.clone(), failing.clone()],
            Compose::All,
            &c,
        )
        .await;
        assert!(!all.passed);
        assert_eq!(all.first_failure.as_deref(), Some("bad"));

        let any = evaluate_gates(&[passing, failing], Compose::Any, &c).await;
        assert!(any.passed);

        let empty = evaluate_gates(&[], Compose::All, &c).await;
        assert!(empty.passed);
        let empty_any = evaluate_gates(&[], Compose::Any, &c).await;
        assert!(empty_any.passed);
    }
}
