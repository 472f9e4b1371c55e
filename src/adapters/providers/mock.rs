//! Mock provider for tests and local dry runs.
//!
//! Responses are scripted per block name; a block may carry a queue of
//! responses so contract-repair and bounce flows can be exercised
//! deterministically. The mock observes the request's cancellation token
//! while simulating latency.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{DispatchRequest, DispatchResult};
use crate::domain::ports::Provider;

/// One scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub output: String,
    /// Simulate a `success=false` dispatch result.
    pub fail: bool,
    pub error_message: Option<String>,
    /// Simulate an adapter exception instead of a result.
    pub raise: bool,
    /// Artificial latency before responding.
    pub delay_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            output: "{}".to_string(),
            fail: false,
            error_message: None,
            raise: false,
            delay_ms: 0,
            tokens_in: 100,
            tokens_out: 50,
        }
    }
}

impl MockResponse {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            fail: true,
            error_message: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn exception(error: impl Into<String>) -> Self {
        Self {
            raise: true,
            error_message: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }
}

#[derive(Default)]
struct MockState {
    /// Scripted response queues keyed by block name; each dispatch pops the
    /// front, the last entry repeats.
    scripts: HashMap<String, Vec<MockResponse>>,
    /// Every request seen, for assertions.
    requests: Vec<DispatchRequest>,
}

/// Scripted provider adapter.
pub struct MockProvider {
    name: String,
    default_response: MockResponse,
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_response: MockResponse::default(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_response = response;
        self
    }

    /// Queue scripted responses for a block name. Matching is by exact block
    /// name or by prefix up to `#` (so `Review#judge` gate dispatches can be
    /// scripted under `Review#judge` or fall back to `Review`).
    pub async fn script(&self, block_name: impl Into<String>, responses: Vec<MockResponse>) {
        let mut state = self.state.lock().await;
        state.scripts.insert(block_name.into(), responses);
    }

    /// All requests dispatched so far.
    pub async fn requests(&self) -> Vec<DispatchRequest> {
        self.state.lock().await.requests.clone()
    }

    async fn next_response(&self, block_name: &str) -> MockResponse {
        let mut state = self.state.lock().await;
        let key = if state.scripts.contains_key(block_name) {
            Some(block_name.to_string())
        } else {
            // "Build (repair)" and "Review#judge" fall back to "Build" and
            // "Review" scripts when no dedicated script exists.
            let base = block_name
                .split(['#', '('])
                .next()
                .unwrap_or(block_name)
                .trim()
                .to_string();
            state.scripts.contains_key(&base).then_some(base)
        };

        match key {
            Some(key) => {
                let queue = state.scripts.get_mut(&key);
                match queue {
                    Some(queue) if queue.len() > 1 => queue.remove(0),
                    Some(queue) => queue.first().cloned().unwrap_or_default(),
                    None => self.default_response.clone(),
                }
            }
            None => self.default_response.clone(),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, request: DispatchRequest) -> DomainResult<DispatchResult> {
        let response = self.next_response(&request.block_name).await;
        {
            let mut state = self.state.lock().await;
            state.requests.push(request.clone());
        }

        if response.delay_ms > 0 {
            tokio::select! {
                () = sleep(Duration::from_millis(response.delay_ms)) => {}
                () = request.cancel.cancelled() => {
                    return Err(DomainError::ExecutionFailed("dispatch cancelled".to_string()));
                }
            }
        }

        if response.raise {
            return Err(DomainError::ExecutionFailed(
                response
                    .error_message
                    .unwrap_or_else(|| "mock exception".to_string()),
            ));
        }

        if response.fail {
            let mut result = DispatchResult::failure(
                response
                    .error_message
                    .unwrap_or_else(|| "mock failure".to_string()),
            );
            result.tokens_used = Some(crate::domain::models::TokenUsage {
                input: response.tokens_in,
                output: response.tokens_out,
            });
            return Ok(result);
        }

        let mut result = DispatchResult::success(response.output)
            .with_tokens(response.tokens_in, response.tokens_out);
        result.actual_agent_id = request.agent.as_ref().map(|a| a.id.clone());
        result.actual_model = request.agent.as_ref().and_then(|a| a.model.clone());
        result.actual_provider = Some(self.name.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn request(block_name: &str) -> DispatchRequest {
        DispatchRequest {
            task_id: Uuid::new_v4(),
            dag_name: "test".to_string(),
            block_name: block_name.to_string(),
            prompt: "do it".to_string(),
            inputs: HashMap::new(),
            acceptance_criteria: vec![],
            bounce_count: 0,
            output_schema: json!({}),
            model_params: None,
            agent: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_scripted_queue_pops_until_last() {
        let provider = MockProvider::new("mock");
        provider
            .script(
                "Build",
                vec![
                    MockResponse::success("first"),
                    MockResponse::success("second"),
                ],
            )
            .await;

        let r1 = provider.dispatch(request("Build")).await.unwrap();
        let r2 = provider.dispatch(request("Build")).await.unwrap();
        let r3 = provider.dispatch(request("Build")).await.unwrap();
        assert_eq!(r1.output.as_deref(), Some("first"));
        assert_eq!(r2.output.as_deref(), Some("second"));
        // The last scripted response repeats.
        assert_eq!(r3.output.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_repair_requests_fall_back_to_base_script() {
        let provider = MockProvider::new("mock");
        provider
            .script("Build", vec![MockResponse::success("base")])
            .await;
        let r = provider.dispatch(request("Build (repair)")).await.unwrap();
        assert_eq!(r.output.as_deref(), Some("base"));
    }

    #[tokio::test]
    async fn test_failure_and_exception() {
        let provider = MockProvider::new("mock");
        provider
            .script("Fail", vec![MockResponse::failure("nope")])
            .await;
        let r = provider.dispatch(request("Fail")).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("nope"));

        provider
            .script("Boom", vec![MockResponse::exception("kaput")])
            .await;
        assert!(provider.dispatch(request("Boom")).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_during_delay() {
        let provider = MockProvider::new("mock");
        provider
            .script("Slow", vec![MockResponse::success("late").with_delay(5000)])
            .await;
        let req = request("Slow");
        let cancel = req.cancel.clone();
        let dispatch = tokio::spawn({
            let provider = Arc::new(provider);
            async move { provider.dispatch(req).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = dispatch.await.unwrap();
        assert!(result.is_err());
    }
}
