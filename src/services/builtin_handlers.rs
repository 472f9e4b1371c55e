//! Built-in deterministic handlers.
//!
//! Registered under `builtin:` names. All handlers are pure over their
//! invocation: same inputs and config, same outputs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{DeterministicHandler, HandlerInvocation, HandlerRegistry};
use crate::services::expr;

/// Register every built-in handler.
pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register("builtin:transform", Arc::new(TransformHandler));
    registry.register("builtin:template", Arc::new(TemplateHandler));
    registry.register("builtin:const", Arc::new(ConstHandler));
}

/// Registry preloaded with the built-ins.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry);
    registry
}

/// `builtin:transform` — each config entry is an expression evaluated with
/// `{inputs, config}` in scope; the result becomes the output of that name.
pub struct TransformHandler;

#[async_trait]
impl DeterministicHandler for TransformHandler {
    async fn run(&self, invocation: HandlerInvocation) -> DomainResult<HashMap<String, Value>> {
        let scope: HashMap<String, Value> = [
            (
                "inputs".to_string(),
                Value::Object(invocation.inputs.clone().into_iter().collect()),
            ),
            (
                "config".to_string(),
                Value::Object(invocation.config.clone().into_iter().collect()),
            ),
        ]
        .into();

        let mut outputs = HashMap::new();
        for (name, source) in &invocation.config {
            let Some(source) = source.as_str() else {
                return Err(DomainError::ExecutionFailed(format!(
                    "transform for output '{name}' must be an expression string"
                )));
            };
            let value = expr::evaluate(source, &scope).map_err(|e| {
                DomainError::ExecutionFailed(format!("transform for output '{name}': {e}"))
            })?;
            outputs.insert(name.clone(), value);
        }
        Ok(outputs)
    }
}

/// `builtin:template` — each config entry is a string with `${port}`
/// placeholders substituted from inputs.
pub struct TemplateHandler;

#[async_trait]
impl DeterministicHandler for TemplateHandler {
    async fn run(&self, invocation: HandlerInvocation) -> DomainResult<HashMap<String, Value>> {
        let mut outputs = HashMap::new();
        for (name, template) in &invocation.config {
            let Some(template) = template.as_str() else {
                return Err(DomainError::ExecutionFailed(format!(
                    "template for output '{name}' must be a string"
                )));
            };
            let mut rendered = template.to_string();
            for (port, value) in &invocation.inputs {
                let needle = format!("${{{port}}}");
                let replacement = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                rendered = rendered.replace(&needle, &replacement);
            }
            outputs.insert(name.clone(), Value::String(rendered));
        }
        Ok(outputs)
    }
}

/// `builtin:const` — emits its config verbatim.
pub struct ConstHandler;

#[async_trait]
impl DeterministicHandler for ConstHandler {
    async fn run(&self, invocation: HandlerInvocation) -> DomainResult<HashMap<String, Value>> {
        Ok(invocation.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn invocation(
        inputs: &[(&str, Value)],
        config: &[(&str, Value)],
    ) -> HandlerInvocation {
        HandlerInvocation {
            inputs: inputs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            config: config
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            block_id: "block".to_string(),
            run_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_transform_handler() {
        let outputs = TransformHandler
            .run(invocation(
                &[("n", json!(4))],
                &[("doubled", json!("inputs.n * 2"))],
            ))
            .await
            .unwrap();
        assert_eq!(outputs["doubled"], json!(8));
    }

    #[tokio::test]
    async fn test_transform_rejects_calls() {
        let err = TransformHandler
            .run(invocation(&[], &[("x", json!("inputs.toString()"))]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("transform"));
    }

    #[tokio::test]
    async fn test_template_handler() {
        let outputs = TemplateHandler
            .run(invocation(
                &[("name", json!("skelo")), ("n", json!(2))],
                &[("greeting", json!("hi ${name} x${n}"))],
            ))
            .await
            .unwrap();
        assert_eq!(outputs["greeting"], json!("hi skelo x2"));
    }

    #[tokio::test]
    async fn test_const_handler() {
        let outputs = ConstHandler
            .run(invocation(&[], &[("version", json!("1.0"))]))
            .await
            .unwrap();
        assert_eq!(outputs["version"], json!("1.0"));
    }

    #[test]
    fn test_builtin_registry_names() {
        let registry = builtin_registry();
        assert!(registry.get("builtin:transform").is_some());
        assert!(registry.get("builtin:template").is_some());
        assert!(registry.get("builtin:const").is_some());
        assert!(registry.get("builtin:unknown").is_none());
    }
}
