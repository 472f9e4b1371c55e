//! Out-of-band LLM-judged gate.
//!
//! `llm_review` is resolved by the executor rather than evaluated purely:
//! the gate layer issues its own dispatch to a named judge provider, parses
//! a verdict list, and scores it against the configured threshold. The full
//! prompt, raw response, verdicts, score, and token usage are retained in
//! the gate's audit record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::models::{AgentIdentity, DispatchRequest, GateResult};
use crate::services::gates::GateContext;
use crate::services::output_contract::parse_json_text;

/// One criterion verdict returned by the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub criterion: String,
    pub passed: bool,
    #[serde(default)]
    pub reasoning: String,
}

/// Evaluate an `llm_review` gate by dispatching to the judge provider.
pub async fn evaluate(
    name: &str,
    port: &str,
    criteria: &[String],
    provider_name: &str,
    model: Option<&str>,
    pass_threshold: f64,
    ctx: &GateContext<'_>,
) -> GateResult {
    let content = match ctx.port(port) {
        None | Some(Value::Null) => {
            return GateResult::failed(name, "empty_port");
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            return GateResult::failed(name, "empty_port");
        }
        Some(value) => match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    };

    let Some(provider) = ctx.providers.and_then(|reg| reg.get(provider_name)) else {
        return GateResult::failed(name, "provider_not_found");
    };

    let prompt = build_review_prompt(&content, criteria);
    let request = DispatchRequest {
        task_id: ctx.instance_id,
        dag_name: ctx.dag_name.to_string(),
        block_name: format!("{}#{}", ctx.block_name, name),
        prompt: prompt.clone(),
        inputs: HashMap::from([(port.to_string(), Value::String(content))]),
        acceptance_criteria: criteria.to_vec(),
        bounce_count: 0,
        output_schema: json!({
            "type": "array",
            "items": {
                "type": "object",
                "required": ["criterion", "passed"],
                "properties": {
                    "criterion": {"type": "string"},
                    "passed": {"type": "boolean"},
                    "reasoning": {"type": "string"},
                }
            }
        }),
        model_params: model.map(|m| json!({"model": m})),
        agent: Some(AgentIdentity {
            id: format!("llm_review:{name}"),
            model: model.map(ToString::to_string),
            provider: provider_name.to_string(),
        }),
        cancel: ctx.cancel.clone(),
    };

    let result = match provider.dispatch(request).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(gate = name, error = %e, "llm_review dispatch errored");
            return GateResult::failed(name, "dispatch_failed");
        }
    };
    if !result.success {
        return GateResult::failed(name, "dispatch_failed");
    }

    let raw = result.output.unwrap_or_default();
    let Some(verdicts) = parse_verdicts(&raw) else {
        return GateResult::failed(name, "invalid_review_output").with_audit(json!({
            "prompt": prompt,
            "raw_response": raw,
        }));
    };

    let passed_count = verdicts.iter().filter(|v| v.passed).count();
    let criteria_count = criteria.len().max(1);
    #[allow(clippy::cast_precision_loss)]
    let score = passed_count as f64 / criteria_count as f64;
    let passed = score >= pass_threshold;

    let (tokens_in, tokens_out) = result
        .tokens_used
        .map_or((0, 0), |t| (t.input, t.output));

    let audit = json!({
        "prompt": prompt,
        "raw_response": raw,
        "verdicts": verdicts,
        "score": score,
        "tokens_in": tokens_in,
        "tokens_out": tokens_out,
    });

    if passed {
        GateResult::passed(name).with_audit(audit)
    } else {
        GateResult::failed(
            name,
            format!("score {score:.2} below threshold {pass_threshold:.2} ({passed_count}/{criteria_count} criteria passed)"),
        )
        .with_audit(audit)
    }
}

fn build_review_prompt(content: &str, criteria: &[String]) -> String {
    let mut prompt = String::from(
        "You are a strict reviewer. Evaluate the content below against each \
         criterion independently.\n\n## Content\n\n",
    );
    prompt.push_str(content);
    prompt.push_str("\n\n## Criteria\n\n");
    for (i, criterion) in criteria.iter().enumerate() {
        prompt.push_str(&format!("{}. {criterion}\n", i + 1));
    }
    prompt.push_str(
        "\n## Response format\n\nRespond with ONLY a JSON array, one entry per \
         criterion, shaped as:\n\
         [{\"criterion\": \"...\", \"passed\": true, \"reasoning\": \"...\"}]\n",
    );
    prompt
}

/// Accepts a bare array or an object wrapping it under `verdicts`.
fn parse_verdicts(raw: &str) -> Option<Vec<ReviewVerdict>> {
    let value = parse_json_text(raw)?;
    let array = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("verdicts") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };
    let verdicts: Vec<ReviewVerdict> = array
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<_, _>>()
        .ok()?;
    if verdicts.is_empty() {
        None
    } else {
        Some(verdicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdicts_bare_array() {
        let raw = r#"[{"criterion": "c1", "passed": true, "reasoning": "ok"}]"#;
        let verdicts = parse_verdicts(raw).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert!(verdicts[0].passed);
    }

    #[test]
    fn test_parse_verdicts_fenced_and_wrapped() {
        let raw = "Here you go:\n```json\n{\"verdicts\": [{\"criterion\": \"c\", \"passed\": false}]}\n```";
        let verdicts = parse_verdicts(raw).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert!(!verdicts[0].passed);
    }

    #[test]
    fn test_parse_verdicts_rejects_garbage() {
        assert!(parse_verdicts("not json at all").is_none());
        assert!(parse_verdicts("{\"other\": 1}").is_none());
        assert!(parse_verdicts("[]").is_none());
    }
}
