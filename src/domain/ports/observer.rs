//! Observability callbacks.
//!
//! All callbacks are best-effort and fire synchronously after a state
//! change; implementations must be non-blocking or offload their work.

use async_trait::async_trait;

use crate::domain::models::{ApprovalRequest, DagRun, FailureCode, FailureInfo};

/// Block/run lifecycle callbacks consumed by the executor.
#[allow(unused_variables)]
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn on_block_start(&self, run: &DagRun, block_id: &str) {}

    async fn on_block_complete(&self, run: &DagRun, block_id: &str) {}

    /// Fired for every block failure, including non-terminal
    /// `GATE_FAIL_REROUTE` bounces (so dashboards can visualize iteration).
    async fn on_block_fail(
        &self,
        run: &DagRun,
        block_id: &str,
        human_error: &str,
        code: FailureCode,
        info: &FailureInfo,
    ) {
    }

    async fn on_run_complete(&self, run: &DagRun) {}

    async fn on_run_fail(&self, run: &DagRun) {}

    async fn on_approval_required(&self, run: &DagRun, block_id: &str, request: &ApprovalRequest) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl RunObserver for NoopObserver {}
