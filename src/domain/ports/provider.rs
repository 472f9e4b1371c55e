//! Provider port - interface for AI backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{DispatchRequest, DispatchResult};

/// A provider adapter dispatches one request and returns the raw result.
///
/// Implementations wrap concrete backends (Anthropic, OpenAI, Ollama, a local
/// mock). Errors returned here are treated as dispatch exceptions and retried
/// under the block's retry policy; a `success=false` result is a dispatch
/// failure with the same retry semantics.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name this provider registers under.
    fn name(&self) -> &str;

    /// Execute one dispatch to completion.
    async fn dispatch(&self, request: DispatchRequest) -> DomainResult<DispatchResult>;
}

/// Name-keyed provider lookup.
pub trait ProviderRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<dyn Provider>>;

    fn names(&self) -> Vec<String>;
}

/// Simple map-backed registry.
#[derive(Default, Clone)]
pub struct MapProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl MapProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn insert(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }
}

impl ProviderRegistry for MapProviderRegistry {
    fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
