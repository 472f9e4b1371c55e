//! Deterministic handler port.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::DomainResult;

/// Arguments passed to a deterministic handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    pub inputs: HashMap<String, Value>,
    pub config: HashMap<String, Value>,
    pub block_id: String,
    pub run_id: Uuid,
}

/// A named deterministic handler (e.g. `builtin:transform`).
///
/// Returns the block's outputs mapping; errors become `DET_EXEC_FAILED`.
#[async_trait]
pub trait DeterministicHandler: Send + Sync {
    async fn run(&self, invocation: HandlerInvocation) -> DomainResult<HashMap<String, Value>>;
}

/// Name-keyed handler registry.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DeterministicHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn DeterministicHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn with_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn DeterministicHandler>,
    ) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeterministicHandler>> {
        self.handlers.get(name).cloned()
    }
}
