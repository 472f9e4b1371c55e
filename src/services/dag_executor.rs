//! DAG executor: the run driver.
//!
//! One driver per run. The driver computes the ready set, starts block tasks
//! up to the parallelism bound, and serializes all run mutation through the
//! block engine behind a single `RwLock`. Block tasks are pure with respect
//! to the run until they call back into engine routines; a panic inside a
//! block task is caught and fails that block, never the driver.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    context_keys, AgentCatalog, AgentIdentity, AgentSpec, ApprovalRequest, BlockDef, BlockMode,
    BlockStatus, BlockedBlock, ContractTrace, Dag, DagRun, DispatchRequest, DispatchResult,
    ExecutionRecord, FailureCode, FailureInfo, FailureStage, GateResult, RepairAttempt,
    RouteError, RunStatus, StructuredRepair, StuckDiagnostics, TokenUsage, UnmetEdge,
};
use crate::domain::ports::{
    ApprovalWaiter, HandlerInvocation, HandlerRegistry, NoopObserver, Provider, ProviderRegistry,
    RunObserver,
};
use crate::infrastructure::settings::GateSettings;
use crate::services::gates::{self, GateContext};
use crate::services::{block_engine, output_contract, prompt};

/// Configuration for the DAG executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum blocks in flight at any instant.
    pub max_parallel: usize,
    /// Per-block token ceiling (dispatch + repairs). None = unlimited.
    pub max_tokens_per_block: Option<u64>,
    /// Whole-run token ceiling. None = unlimited.
    pub max_tokens_per_run: Option<u64>,
    /// Re-inspection interval while paused without an approval waiter.
    pub approval_poll_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_tokens_per_block: None,
            max_tokens_per_run: None,
            approval_poll_ms: 250,
        }
    }
}

/// What a block task reports back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOutcome {
    Completed,
    /// Terminal failure, or a retry was scheduled.
    Failed,
    /// A gate-fail rule consumed a bounce and reset blocks to pending.
    Rerouted,
    /// The run paused for approval before the block started.
    ApprovalPending,
    /// Cancellation observed before the block started.
    Cancelled,
    /// The run was marked failed (handoff break); stop scheduling.
    RunFatal,
}

/// Shared state handed to every block task.
struct ExecCtx {
    dag: Arc<Dag>,
    run: Arc<RwLock<DagRun>>,
    providers: Arc<dyn ProviderRegistry>,
    handlers: Arc<HandlerRegistry>,
    agents: Arc<AgentCatalog>,
    observer: Arc<dyn RunObserver>,
    settings: GateSettings,
    config: ExecutorConfig,
    cancel: CancellationToken,
}

/// The scheduler driving one run at a time.
pub struct DagExecutor {
    providers: Arc<dyn ProviderRegistry>,
    handlers: Arc<HandlerRegistry>,
    agents: Arc<AgentCatalog>,
    observer: Arc<dyn RunObserver>,
    approval_waiter: Option<Arc<dyn ApprovalWaiter>>,
    settings: GateSettings,
    config: ExecutorConfig,
    cancel: CancellationToken,
}

impl DagExecutor {
    pub fn new(
        providers: Arc<dyn ProviderRegistry>,
        handlers: Arc<HandlerRegistry>,
        agents: Arc<AgentCatalog>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            providers,
            handlers,
            agents,
            observer: Arc::new(NoopObserver),
            approval_waiter: None,
            settings: GateSettings::default(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach lifecycle callbacks.
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Attach a signal the host fires when a paused run should be re-read.
    pub fn with_approval_waiter(mut self, waiter: Arc<dyn ApprovalWaiter>) -> Self {
        self.approval_waiter = Some(waiter);
        self
    }

    pub fn with_gate_settings(mut self, settings: GateSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Token the host cancels to stop the run cooperatively.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive a run to a terminal status.
    pub async fn execute(&self, dag: Arc<Dag>, run: Arc<RwLock<DagRun>>) -> DomainResult<RunStatus> {
        let ctx = Arc::new(ExecCtx {
            dag: dag.clone(),
            run: run.clone(),
            providers: self.providers.clone(),
            handlers: self.handlers.clone(),
            agents: self.agents.clone(),
            observer: self.observer.clone(),
            settings: self.settings.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        });

        let mut in_flight: JoinSet<(String, BlockOutcome)> = JoinSet::new();
        let mut in_flight_ids: HashSet<String> = HashSet::new();
        let mut run_fail_emitted = false;

        loop {
            // Terminal and cancellation checks come before any scheduling.
            let status = run.read().await.status;
            if status.is_terminal() {
                if status == RunStatus::Failed && !run_fail_emitted {
                    let snapshot = run.read().await.clone();
                    self.observer.on_run_fail(&snapshot).await;
                }
                in_flight.abort_all();
                return Ok(status);
            }
            if self.cancel.is_cancelled() {
                let snapshot = {
                    let mut run_w = run.write().await;
                    run_w.status = RunStatus::Cancelled;
                    // In-flight providers that ignore the signal may still
                    // produce a result; their instances are skipped.
                    for instance in run_w.blocks.values_mut() {
                        if instance.status == BlockStatus::Running {
                            instance.status = BlockStatus::Skipped;
                            instance.completed_at = Some(Utc::now());
                        }
                    }
                    run_w.touch();
                    run_w.clone()
                };
                tracing::info!(run_id = %snapshot.id, "run cancelled");
                in_flight.abort_all();
                return Ok(RunStatus::Cancelled);
            }

            if status == RunStatus::PausedApproval {
                match &self.approval_waiter {
                    Some(waiter) => {
                        tokio::select! {
                            () = waiter.wait() => {}
                            () = self.cancel.cancelled() => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            () = sleep(Duration::from_millis(self.config.approval_poll_ms)) => {}
                            () = self.cancel.cancelled() => {}
                        }
                    }
                }
                try_resume_approval(&run).await;
                continue;
            }

            let ready: Vec<String> = {
                let run_r = run.read().await;
                block_engine::resolve_ready(&dag, &run_r)
                    .into_iter()
                    .filter(|id| !in_flight_ids.contains(id))
                    .collect()
            };

            if ready.is_empty() {
                // Completion first: declared terminals may all be done while
                // unrelated blocks idle.
                let complete = {
                    let run_r = run.read().await;
                    block_engine::is_complete(&dag, &run_r)
                };
                if complete {
                    let snapshot = {
                        let mut run_w = run.write().await;
                        run_w.status = RunStatus::Completed;
                        run_w.touch();
                        run_w.clone()
                    };
                    self.observer.on_run_complete(&snapshot).await;
                    in_flight.abort_all();
                    return Ok(RunStatus::Completed);
                }

                let earliest_retry = {
                    let mut run_w = run.write().await;
                    block_engine::release_due_retries(&mut run_w, Utc::now())
                };
                // A due retry may have just been released back to pending.
                {
                    let run_r = run.read().await;
                    if !block_engine::resolve_ready(&dag, &run_r).is_empty() {
                        continue;
                    }
                }
                if let Some(at) = earliest_retry {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    if in_flight.is_empty() {
                        tokio::select! {
                            () = sleep(wait) => {}
                            () = self.cancel.cancelled() => {}
                        }
                    } else {
                        tokio::select! {
                            () = sleep(wait) => {}
                            joined = in_flight.join_next() => {
                                handle_join(joined, &mut in_flight_ids);
                            }
                            () = self.cancel.cancelled() => {}
                        }
                    }
                    continue;
                }

                if !in_flight.is_empty() {
                    tokio::select! {
                        joined = in_flight.join_next() => {
                            handle_join(joined, &mut in_flight_ids);
                        }
                        () = self.cancel.cancelled() => {}
                    }
                    continue;
                }

                // No ready blocks, nothing in flight, nothing retrying,
                // not complete: the run is stuck.
                let snapshot = {
                    let mut run_w = run.write().await;
                    mark_stuck(&dag, &mut run_w);
                    run_w.clone()
                };
                run_fail_emitted = true;
                self.observer.on_run_fail(&snapshot).await;
                in_flight.abort_all();
                return Ok(RunStatus::Failed);
            }

            for block_id in ready {
                if in_flight_ids.len() >= self.config.max_parallel {
                    break;
                }
                in_flight_ids.insert(block_id.clone());
                let ctx = ctx.clone();
                let id_for_task = block_id.clone();
                in_flight.spawn(async move {
                    let protocol = run_block(ctx.clone(), id_for_task.clone());
                    match std::panic::AssertUnwindSafe(protocol).catch_unwind().await {
                        Ok(outcome) => (id_for_task, outcome),
                        Err(_) => {
                            tracing::error!(block_id = %id_for_task, "block task panicked");
                            let outcome = fail_panicked(&ctx, &id_for_task).await;
                            (id_for_task, outcome)
                        }
                    }
                });
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    handle_join(joined, &mut in_flight_ids);
                }
                () = self.cancel.cancelled() => {}
            }
        }
    }
}

fn handle_join(
    joined: Option<Result<(String, BlockOutcome), tokio::task::JoinError>>,
    in_flight_ids: &mut HashSet<String>,
) {
    match joined {
        Some(Ok((block_id, outcome))) => {
            tracing::debug!(block_id = %block_id, ?outcome, "block task finished");
            in_flight_ids.remove(&block_id);
        }
        Some(Err(join_error)) => {
            // Panics are converted inside the task; this is an abort.
            tracing::warn!(error = %join_error, "block task aborted");
        }
        None => {}
    }
}

/// Convert a caught panic into a terminal block failure.
async fn fail_panicked(ctx: &ExecCtx, block_id: &str) -> BlockOutcome {
    let result = {
        let mut run_w = ctx.run.write().await;
        block_engine::fail_block_terminal(&mut run_w, block_id, "block task panicked", None)
    };
    if result.is_err() {
        // The instance never started or already ended; nothing to record.
        return BlockOutcome::Failed;
    }
    let snapshot = ctx.run.read().await.clone();
    let info = FailureInfo::new(FailureStage::Unknown, "block task panicked");
    ctx.observer
        .on_block_fail(
            &snapshot,
            block_id,
            "block task panicked",
            FailureCode::DispatchException,
            &info,
        )
        .await;
    BlockOutcome::Failed
}

/// Resume a paused run when the approval flag arrived.
async fn try_resume_approval(run: &Arc<RwLock<DagRun>>) {
    let mut run_w = run.write().await;
    if run_w.status != RunStatus::PausedApproval {
        return;
    }
    let block_id = run_w
        .context
        .get(context_keys::APPROVAL_REQUEST)
        .and_then(|v| v.get("block_id"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let Some(block_id) = block_id else {
        // No request on record; unblock the loop rather than spin forever.
        run_w.status = RunStatus::Running;
        return;
    };
    if run_w.context_flag(&context_keys::approval(&block_id))
        || run_w.context_flag(context_keys::DEV_AUTO_APPROVE)
    {
        run_w.context.remove(context_keys::APPROVAL_REQUEST);
        run_w.status = RunStatus::Running;
        run_w.touch();
        tracing::info!(block_id = %block_id, "approval received, resuming run");
    }
}

/// Build stuck diagnostics and fail the run.
fn mark_stuck(dag: &Dag, run: &mut DagRun) {
    let mut blocked = Vec::new();
    let mut block_ids: Vec<&String> = run.blocks.keys().collect();
    block_ids.sort();

    for block_id in block_ids {
        let instance = &run.blocks[block_id];
        if instance.status != BlockStatus::Pending {
            continue;
        }
        let Some(def) = dag.block(block_id) else {
            continue;
        };

        let mut missing = Vec::new();
        let mut unmet = Vec::new();
        for port_name in def.required_inputs() {
            let has_override = run
                .context
                .contains_key(&context_keys::override_input(block_id, port_name));
            if has_override || run.context.contains_key(port_name) {
                continue;
            }
            if def.inputs[port_name].default.is_some() {
                continue;
            }
            if let Some(edge) = dag.incoming_edge(block_id, port_name) {
                let upstream_status = run
                    .instance(&edge.from_block)
                    .map_or(BlockStatus::Pending, |i| i.status);
                let delivered = upstream_status == BlockStatus::Completed
                    && run
                        .instance(&edge.from_block)
                        .is_some_and(|i| i.outputs.contains_key(&edge.from_port));
                if !delivered {
                    missing.push(port_name.to_string());
                    unmet.push(UnmetEdge {
                        from_block: edge.from_block.clone(),
                        from_port: edge.from_port.clone(),
                        to_port: port_name.to_string(),
                        upstream_status,
                    });
                }
            } else {
                missing.push(port_name.to_string());
            }
        }
        if !missing.is_empty() {
            blocked.push(BlockedBlock {
                block_id: block_id.clone(),
                missing_required_inputs: missing,
                unmet_edges: unmet,
            });
        }
    }

    let diagnostics = StuckDiagnostics { blocked };
    let reason = format!(
        "run stuck: {} block(s) cannot obtain required inputs",
        diagnostics.blocked.len()
    );
    tracing::error!(run_id = %run.id, %reason, "marking run stuck");
    run.context.insert(
        context_keys::STUCK_DIAGNOSTICS.to_string(),
        serde_json::to_value(&diagnostics).unwrap_or(Value::Null),
    );
    run.context.insert(
        context_keys::FAILURE_CODE.to_string(),
        Value::String(FailureCode::RunStuck.as_str().to_string()),
    );
    run.context
        .insert(context_keys::FAILURE_REASON.to_string(), Value::String(reason));
    run.status = RunStatus::Failed;
    run.touch();
}

// ============================================================================
// Single-block protocol
// ============================================================================

#[allow(clippy::too_many_lines)]
async fn run_block(ctx: Arc<ExecCtx>, block_id: String) -> BlockOutcome {
    let Some(def) = ctx.dag.block(&block_id) else {
        tracing::error!(block_id = %block_id, "block vanished from DAG");
        return BlockOutcome::Failed;
    };

    // 1. Cancellation: leave the instance alone.
    if ctx.cancel.is_cancelled() {
        return BlockOutcome::Cancelled;
    }

    // 2. Wire inputs.
    let inputs = {
        let run_r = ctx.run.read().await;
        block_engine::wire_inputs(&ctx.dag, &run_r, &block_id)
    };

    // 3. Approval pause, before the instance starts.
    let needs_approval =
        def.mode == BlockMode::Approval || def.approval.as_ref().is_some_and(|a| a.required);
    if needs_approval {
        let approved = {
            let run_r = ctx.run.read().await;
            run_r.context_flag(&context_keys::approval(&block_id))
                || run_r.context_flag(context_keys::DEV_AUTO_APPROVE)
        };
        if !approved {
            let (snapshot, request) = {
                let mut run_w = ctx.run.write().await;
                let request = ApprovalRequest {
                    token: Uuid::new_v4(),
                    run_id: run_w.id,
                    block_id: block_id.clone(),
                    dag_name: ctx.dag.name.clone(),
                    status: "pending".to_string(),
                    requested_at: Utc::now(),
                    prompt: def.approval.as_ref().and_then(|a| a.prompt.clone()),
                    approver: def.approval.as_ref().and_then(|a| a.approver.clone()),
                    timeout_sec: def.approval.as_ref().and_then(|a| a.timeout_sec),
                    context_preview: inputs.clone(),
                };
                run_w.context.insert(
                    context_keys::APPROVAL_REQUEST.to_string(),
                    serde_json::to_value(&request).unwrap_or(Value::Null),
                );
                run_w.status = RunStatus::PausedApproval;
                run_w.touch();
                (run_w.clone(), request)
            };
            tracing::info!(block_id = %block_id, "pausing run for approval");
            ctx.observer
                .on_approval_required(&snapshot, &block_id, &request)
                .await;
            return BlockOutcome::ApprovalPending;
        }
    }

    // 4. Start; populate routing identity eagerly for observer UIs.
    let agent_resolution = if def.mode == BlockMode::Ai {
        Some(ctx.agents.resolve(&def.agent).map(Clone::clone))
    } else {
        None
    };
    {
        let mut run_w = ctx.run.write().await;
        if let Err(e) = block_engine::start_block(&mut run_w, &block_id, inputs.clone()) {
            tracing::warn!(block_id = %block_id, error = %e, "could not start block");
            return BlockOutcome::Failed;
        }
        if let Some(Ok(agent)) = &agent_resolution {
            if let Some(instance) = run_w.blocks.get_mut(&block_id) {
                instance.active_agent = Some(agent.id.clone());
                instance.active_model = agent.model.clone();
                instance.active_provider = Some(agent.provider.clone());
            }
        }
    }
    {
        let snapshot = ctx.run.read().await.clone();
        ctx.observer.on_block_start(&snapshot, &block_id).await;
    }

    // 5. Pre-gates.
    let empty = HashMap::new();
    let instance_id = ctx
        .run
        .read()
        .await
        .instance(&block_id)
        .map_or_else(Uuid::new_v4, |i| i.instance_id);
    let pre_outcome = {
        let gate_ctx = GateContext {
            inputs: &inputs,
            outputs: &empty,
            settings: &ctx.settings,
            providers: Some(ctx.providers.as_ref()),
            cancel: ctx.cancel.child_token(),
            dag_name: &ctx.dag.name,
            block_name: &def.name,
            instance_id,
        };
        gates::evaluate_gates(&def.pre_gates, def.gate_composition.pre, &gate_ctx).await
    };
    {
        let mut run_w = ctx.run.write().await;
        if let Some(instance) = run_w.blocks.get_mut(&block_id) {
            instance.pre_gate_results = pre_outcome.results.clone();
        }
    }
    if !pre_outcome.passed {
        return handle_gate_failure(
            &ctx,
            def,
            &block_id,
            &pre_outcome.results,
            pre_outcome.first_failure.as_deref(),
            FailureCode::PreGateFailed,
        )
        .await;
    }

    // 6-10. Execute and validate.
    let execution = match def.mode {
        BlockMode::Deterministic => run_deterministic(&ctx, def, &block_id, &inputs).await,
        BlockMode::Ai => {
            let agent = match agent_resolution {
                Some(Ok(agent)) => agent,
                Some(Err(RouteError::NotFound(what))) => {
                    return fail_block(
                        &ctx,
                        &block_id,
                        FailureCode::AgentNotFound,
                        FailureInfo::new(FailureStage::Dispatch, format!("no agent matching {what}")),
                        Retry::Never,
                        None,
                    )
                    .await;
                }
                Some(Err(err @ RouteError::Ambiguous { .. })) => {
                    return fail_block(
                        &ctx,
                        &block_id,
                        FailureCode::AgentRouteAmbiguous,
                        FailureInfo::new(FailureStage::Dispatch, err.to_string()),
                        Retry::Never,
                        None,
                    )
                    .await;
                }
                None => unreachable!("ai mode always resolves"),
            };
            run_ai(&ctx, def, &block_id, &inputs, &agent, instance_id).await
        }
        BlockMode::Approval => {
            // An approved gate block passes its inputs through to the
            // declared output ports; the contract still applies.
            let outputs: HashMap<String, Value> = def
                .outputs
                .keys()
                .filter_map(|name| inputs.get(name).map(|v| (name.clone(), v.clone())))
                .collect();
            let errors = output_contract::validate_outputs(def, &outputs);
            if !errors.is_empty() && def.strict_output {
                let message = format!("output contract failed: {}", errors.join("; "));
                Err(fail_block(
                    &ctx,
                    &block_id,
                    FailureCode::OutputContractFailed,
                    FailureInfo::new(FailureStage::Contract, message),
                    Retry::Never,
                    None,
                )
                .await)
            } else {
                Ok((outputs, None))
            }
        }
    };

    let (outputs, execution) = match execution {
        Ok(pair) => pair,
        Err(outcome) => return outcome,
    };

    // 11. Post-gates over inputs ∪ outputs.
    let post_outcome = {
        let gate_ctx = GateContext {
            inputs: &inputs,
            outputs: &outputs,
            settings: &ctx.settings,
            providers: Some(ctx.providers.as_ref()),
            cancel: ctx.cancel.child_token(),
            dag_name: &ctx.dag.name,
            block_name: &def.name,
            instance_id,
        };
        gates::evaluate_gates(&def.post_gates, def.gate_composition.post, &gate_ctx).await
    };
    {
        let mut run_w = ctx.run.write().await;
        if let Some(instance) = run_w.blocks.get_mut(&block_id) {
            instance.post_gate_results = post_outcome.results.clone();
            if let Some(record) = &execution {
                instance.execution = Some(record.clone());
            }
        }
    }
    if !post_outcome.passed {
        return handle_gate_failure(
            &ctx,
            def,
            &block_id,
            &post_outcome.results,
            post_outcome.first_failure.as_deref(),
            FailureCode::PostGateFailed,
        )
        .await;
    }

    // 12. Complete, then verify downstream handoffs are still satisfiable.
    {
        let mut run_w = ctx.run.write().await;
        if let Err(e) = block_engine::complete_block(&mut run_w, &block_id, outputs, execution) {
            tracing::warn!(block_id = %block_id, error = %e, "could not complete block");
            return BlockOutcome::Failed;
        }
    }
    {
        let snapshot = ctx.run.read().await.clone();
        ctx.observer.on_block_complete(&snapshot, &block_id).await;
    }

    if let Some(broken) = check_handoffs(&ctx, &block_id).await {
        let message = format!(
            "completed block '{block_id}' left downstream input '{}.{}' unsatisfiable",
            broken.0, broken.1
        );
        let snapshot = {
            let mut run_w = ctx.run.write().await;
            run_w.status = RunStatus::Failed;
            run_w.context.insert(
                context_keys::FAILURE_CODE.to_string(),
                Value::String(FailureCode::HandoffUnsatisfiable.as_str().to_string()),
            );
            run_w.context.insert(
                context_keys::FAILURE_REASON.to_string(),
                Value::String(message.clone()),
            );
            run_w.touch();
            run_w.clone()
        };
        let info = FailureInfo::new(FailureStage::Handoff, message.clone());
        ctx.observer
            .on_block_fail(
                &snapshot,
                &block_id,
                &message,
                FailureCode::HandoffUnsatisfiable,
                &info,
            )
            .await;
        return BlockOutcome::RunFatal;
    }

    BlockOutcome::Completed
}

/// After completion: every required input of every downstream block must
/// still have a source that is completed-with-value or still progressable,
/// a default, or a context value. Returns the first broken (block, port).
async fn check_handoffs(ctx: &ExecCtx, block_id: &str) -> Option<(String, String)> {
    let run_r = ctx.run.read().await;
    let mut downstream: Vec<&str> = ctx
        .dag
        .edges_from(block_id)
        .map(|e| e.to_block.as_str())
        .collect();
    downstream.sort_unstable();
    downstream.dedup();

    for target_id in downstream {
        let def = ctx.dag.block(target_id)?;
        for port_name in def.required_inputs() {
            if run_r
                .context
                .contains_key(&context_keys::override_input(target_id, port_name))
                || run_r.context.contains_key(port_name)
                || def.inputs[port_name].default.is_some()
            {
                continue;
            }
            let Some(edge) = ctx.dag.incoming_edge(target_id, port_name) else {
                continue;
            };
            let satisfiable = run_r.instance(&edge.from_block).is_some_and(|source| {
                match source.status {
                    BlockStatus::Completed => source.outputs.contains_key(&edge.from_port),
                    // Still progressable: it may yet deliver.
                    BlockStatus::Pending | BlockStatus::Running | BlockStatus::Retrying => true,
                    BlockStatus::Failed | BlockStatus::Skipped => false,
                }
            });
            if !satisfiable {
                return Some((target_id.to_string(), port_name.to_string()));
            }
        }
    }
    None
}

// ============================================================================
// Gate failure and reroute
// ============================================================================

async fn handle_gate_failure(
    ctx: &ExecCtx,
    def: &BlockDef,
    block_id: &str,
    results: &[GateResult],
    failed_gate: Option<&str>,
    code: FailureCode,
) -> BlockOutcome {
    let failed_gate = failed_gate.unwrap_or("unknown");
    let failed_result = results.iter().find(|r| r.name == failed_gate);
    let reason = failed_result
        .and_then(|r| r.reason.clone())
        .unwrap_or_else(|| "gate failed".to_string());

    let rule = def
        .on_gate_fail
        .iter()
        .find(|rule| rule.when_gate == failed_gate);

    if let Some(rule) = rule {
        let bounce_key = context_keys::bounce(block_id, failed_gate);
        let (bounced, snapshot) = {
            let mut run_w = ctx.run.write().await;
            let count = run_w
                .context
                .get(&bounce_key)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if count < u64::from(rule.max_bounces) {
                run_w
                    .context
                    .insert(bounce_key.clone(), Value::Number((count + 1).into()));

                if rule.feedback_from.as_deref() == Some(context_keys::GATE_VERDICTS) {
                    let payload = json!({
                        "gate": failed_gate,
                        "reason": reason,
                        "audit": failed_result.and_then(|r| r.audit.clone()),
                    });
                    run_w
                        .context
                        .insert(context_keys::GATE_VERDICTS.to_string(), payload);
                }

                // Reset the focal block, the route target, and every listed
                // reset block back to pending.
                let mut to_reset: Vec<&str> = vec![block_id, rule.route_to.as_str()];
                to_reset.extend(rule.reset_blocks.iter().map(String::as_str));
                for reset_id in to_reset {
                    if let Some(instance) = run_w.blocks.get_mut(reset_id) {
                        instance.reset_for_reroute();
                    }
                }
                run_w.touch();
                (true, run_w.clone())
            } else {
                (false, run_w.clone())
            }
        };

        if bounced {
            let message = rule
                .reason
                .clone()
                .unwrap_or_else(|| format!("gate '{failed_gate}' failed, rerouting to '{}'", rule.route_to));
            tracing::info!(block_id = %block_id, gate = failed_gate, route_to = %rule.route_to, "gate-fail bounce");
            let info = FailureInfo::new(FailureStage::Gate, message.clone());
            ctx.observer
                .on_block_fail(
                    &snapshot,
                    block_id,
                    &message,
                    FailureCode::GateFailReroute,
                    &info,
                )
                .await;
            return BlockOutcome::Rerouted;
        }
    }

    let message = format!("gate '{failed_gate}' failed: {reason}");
    fail_block(
        ctx,
        block_id,
        code,
        FailureInfo::new(FailureStage::Gate, message),
        Retry::Never,
        None,
    )
    .await
}

// ============================================================================
// Failure plumbing
// ============================================================================

/// Whether a failure class participates in the block's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Provider exceptions and `success=false` results retry while attempts
    /// remain.
    Allowed,
    /// Gate, contract, budget, routing, and handler failures are terminal.
    Never,
}

async fn fail_block(
    ctx: &ExecCtx,
    block_id: &str,
    code: FailureCode,
    info: FailureInfo,
    retry: Retry,
    execution: Option<ExecutionRecord>,
) -> BlockOutcome {
    let (outcome, snapshot) = {
        let mut run_w = ctx.run.write().await;
        let result = match retry {
            Retry::Allowed => block_engine::fail_block(
                &ctx.dag,
                &mut run_w,
                block_id,
                info.message.clone(),
                execution,
            ),
            Retry::Never => block_engine::fail_block_terminal(
                &mut run_w,
                block_id,
                info.message.clone(),
                execution,
            ),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(block_id = %block_id, error = %e, "failure on non-running instance");
                return BlockOutcome::Failed;
            }
        };
        if run_w.status == RunStatus::Failed {
            run_w.context.insert(
                context_keys::FAILURE_CODE.to_string(),
                Value::String(code.as_str().to_string()),
            );
            run_w.context.insert(
                context_keys::FAILURE_REASON.to_string(),
                Value::String(info.message.clone()),
            );
        }
        (outcome, run_w.clone())
    };

    match outcome {
        block_engine::FailOutcome::Retrying { next_retry_at } => {
            tracing::info!(
                block_id = %block_id,
                code = code.as_str(),
                retry_at = %next_retry_at,
                "block failed, retry scheduled"
            );
        }
        block_engine::FailOutcome::Failed { .. } => {
            tracing::warn!(block_id = %block_id, code = code.as_str(), message = %info.message, "block failed");
            ctx.observer
                .on_block_fail(&snapshot, block_id, &info.message, code, &info)
                .await;
        }
    }
    BlockOutcome::Failed
}

// ============================================================================
// Deterministic path
// ============================================================================

type ExecutionOutputs = (HashMap<String, Value>, Option<ExecutionRecord>);

async fn run_deterministic(
    ctx: &ExecCtx,
    def: &BlockDef,
    block_id: &str,
    inputs: &HashMap<String, Value>,
) -> Result<ExecutionOutputs, BlockOutcome> {
    let Some(spec) = &def.deterministic else {
        return Err(fail_block(
            ctx,
            block_id,
            FailureCode::DetConfigInvalid,
            FailureInfo::new(FailureStage::Dispatch, "deterministic block has no spec"),
            Retry::Never,
            None,
        )
        .await);
    };
    let Some(handler) = ctx.handlers.get(&spec.handler) else {
        return Err(fail_block(
            ctx,
            block_id,
            FailureCode::DetConfigInvalid,
            FailureInfo::new(
                FailureStage::Dispatch,
                format!("handler '{}' is not registered", spec.handler),
            ),
            Retry::Never,
            None,
        )
        .await);
    };

    let run_id = ctx.run.read().await.id;
    let started = Instant::now();
    let invocation = HandlerInvocation {
        inputs: inputs.clone(),
        config: spec.config.clone(),
        block_id: block_id.to_string(),
        run_id,
    };

    let outputs = match handler.run(invocation).await {
        Ok(outputs) => outputs,
        Err(e) => {
            return Err(fail_block(
                ctx,
                block_id,
                FailureCode::DetExecFailed,
                FailureInfo::new(
                    FailureStage::Dispatch,
                    format!("handler '{}' failed: {e}", spec.handler),
                ),
                Retry::Never,
                None,
            )
            .await);
        }
    };

    #[allow(clippy::cast_possible_truncation)]
    let record = ExecutionRecord {
        provider: Some("deterministic".to_string()),
        duration_ms: started.elapsed().as_millis() as u64,
        ..Default::default()
    };

    // Deterministic outputs face the same contract; there is no repair
    // dispatch for a handler, so violations are terminal under strict mode.
    let errors = output_contract::validate_outputs(def, &outputs);
    if !errors.is_empty() && def.strict_output {
        let message = format!("output contract failed: {}", errors.join("; "));
        let info = FailureInfo::new(FailureStage::Contract, message);
        return Err(fail_block(
            ctx,
            block_id,
            FailureCode::OutputContractFailed,
            info,
            Retry::Never,
            Some(record),
        )
        .await);
    }

    Ok((outputs, Some(record)))
}

// ============================================================================
// AI path
// ============================================================================

#[allow(clippy::too_many_lines)]
async fn run_ai(
    ctx: &ExecCtx,
    def: &BlockDef,
    block_id: &str,
    inputs: &HashMap<String, Value>,
    agent: &AgentSpec,
    instance_id: Uuid,
) -> Result<ExecutionOutputs, BlockOutcome> {
    let Some(provider) = ctx.providers.get(&agent.provider) else {
        return Err(fail_block(
            ctx,
            block_id,
            FailureCode::ProviderNotFound,
            FailureInfo::new(
                FailureStage::Dispatch,
                format!("provider '{}' is not registered", agent.provider),
            ),
            Retry::Never,
            None,
        )
        .await);
    };

    let (feedback, bounce_count) = {
        let run_r = ctx.run.read().await;
        let feedback = run_r.context.get(context_keys::GATE_VERDICTS).cloned();
        let prefix = format!("__bounce_{block_id}_");
        let bounces: u64 = run_r
            .context
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, v)| v.as_u64())
            .sum();
        (feedback, bounces)
    };

    let dispatch_prompt = prompt::build_dispatch_prompt(def, inputs, feedback.as_ref());
    let output_schema = prompt::infer_output_schema(def);
    let criteria = prompt::acceptance_criteria(def);
    let bounce_count = u32::try_from(bounce_count).unwrap_or(u32::MAX);
    let identity = AgentIdentity {
        id: agent.id.clone(),
        model: agent.model.clone(),
        provider: agent.provider.clone(),
    };

    let started = Instant::now();
    let cancel = ctx.cancel.child_token();
    let request = DispatchRequest {
        task_id: instance_id,
        dag_name: ctx.dag.name.clone(),
        block_name: def.name.clone(),
        prompt: dispatch_prompt,
        inputs: inputs.clone(),
        acceptance_criteria: criteria,
        bounce_count,
        output_schema: output_schema.clone(),
        model_params: agent.model_params.clone(),
        agent: Some(identity),
        cancel: cancel.clone(),
    };

    let result = match dispatch_with_timeout(provider.as_ref(), request, def.timeout_ms, &cancel).await {
        Ok(result) => result,
        Err(DispatchError::Timeout(ms)) => {
            let record = base_record(agent, None, started.elapsed());
            return Err(fail_block(
                ctx,
                block_id,
                FailureCode::DispatchTimeout,
                FailureInfo::new(
                    FailureStage::Timeout,
                    format!("provider dispatch timed out after {ms}ms"),
                ),
                Retry::Allowed,
                Some(record),
            )
            .await);
        }
        Err(DispatchError::Exception(message)) => {
            let record = base_record(agent, None, started.elapsed());
            return Err(fail_block(
                ctx,
                block_id,
                FailureCode::DispatchException,
                FailureInfo::new(FailureStage::Dispatch, message),
                Retry::Allowed,
                Some(record),
            )
            .await);
        }
    };

    if !result.success {
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "provider reported failure".to_string());
        let mut record = base_record(agent, Some(&result), started.elapsed());
        record.error = Some(message.clone());
        return Err(fail_block(
            ctx,
            block_id,
            FailureCode::DispatchFailed,
            FailureInfo::new(FailureStage::Dispatch, message),
            Retry::Allowed,
            Some(record),
        )
        .await);
    }

    let raw_output = result.output.clone().unwrap_or_default();
    let mut record = base_record(agent, Some(&result), started.elapsed());
    record.raw_output = Some(raw_output.clone());

    // 8-9. Parse the output text and enforce the contract, with bounded
    // targeted repair dispatches.
    let mut outputs = output_contract::parse_outputs(def, &raw_output);
    let mut errors = output_contract::validate_outputs(def, &outputs);

    if !errors.is_empty() && def.strict_output {
        let initial_errors = errors.clone();
        let mut attempts: Vec<RepairAttempt> = Vec::new();
        let mut last_raw = raw_output.clone();

        for _ in 0..def.contract_repair_attempts {
            let repair_prompt = prompt::build_repair_prompt(def, &errors, &last_raw);
            let repair_request = DispatchRequest {
                task_id: instance_id,
                dag_name: ctx.dag.name.clone(),
                block_name: format!("{} (repair)", def.name),
                prompt: repair_prompt,
                inputs: inputs.clone(),
                acceptance_criteria: errors.clone(),
                bounce_count,
                output_schema: output_schema.clone(),
                model_params: agent.model_params.clone(),
                agent: Some(AgentIdentity {
                    id: agent.id.clone(),
                    model: agent.model.clone(),
                    provider: agent.provider.clone(),
                }),
                cancel: cancel.clone(),
            };

            match dispatch_with_timeout(provider.as_ref(), repair_request, def.timeout_ms, &cancel)
                .await
            {
                Ok(repair) if repair.success => {
                    if let Some(tokens) = repair.tokens_used {
                        record.tokens_in += tokens.input;
                        record.tokens_out += tokens.output;
                    }
                    last_raw = repair.output.unwrap_or_default();
                    let repaired = output_contract::parse_outputs(def, &last_raw);
                    output_contract::merge_outputs(&mut outputs, repaired);
                    errors = output_contract::validate_outputs(def, &outputs);
                    attempts.push(RepairAttempt {
                        errors: errors.clone(),
                    });
                    if errors.is_empty() {
                        break;
                    }
                }
                Ok(repair) => {
                    let message = repair
                        .error
                        .unwrap_or_else(|| "repair dispatch reported failure".to_string());
                    attempts.push(RepairAttempt {
                        errors: vec![format!("repair dispatch failed: {message}")],
                    });
                }
                Err(e) => {
                    attempts.push(RepairAttempt {
                        errors: vec![format!("repair dispatch failed: {e}")],
                    });
                }
            }
        }

        let final_ok = errors.is_empty();
        let trace = ContractTrace {
            initial_errors,
            attempts,
            final_ok,
        };
        record.structured_repair = Some(StructuredRepair {
            attempted: !trace.attempts.is_empty(),
            succeeded: final_ok,
        });
        record.contract_trace = Some(trace.clone());

        if !final_ok {
            let message = format!("output contract failed: {}", errors.join("; "));
            let info = FailureInfo::new(FailureStage::Contract, message)
                .with_contract_trace(trace)
                .with_raw_preview(&last_raw);
            record.error = Some(errors.join("; "));
            return Err(fail_block(
                ctx,
                block_id,
                FailureCode::OutputContractFailed,
                info,
                Retry::Never,
                Some(record),
            )
            .await);
        }
    }

    // 10. Token budgets: the current block's spend, then the whole run.
    let block_tokens = record.total_tokens();
    if let Some(ceiling) = ctx.config.max_tokens_per_block {
        if block_tokens > ceiling {
            let info = FailureInfo::new(
                FailureStage::Budget,
                format!("block used {block_tokens} tokens, per-block budget is {ceiling}"),
            );
            return Err(fail_block(
                ctx,
                block_id,
                FailureCode::BudgetExceeded,
                info,
                Retry::Never,
                Some(record),
            )
            .await);
        }
    }
    if let Some(ceiling) = ctx.config.max_tokens_per_run {
        let prior = ctx.run.read().await.total_tokens();
        if prior + block_tokens > ceiling {
            let info = FailureInfo::new(
                FailureStage::Budget,
                format!(
                    "run used {} tokens including this block, per-run budget is {ceiling}",
                    prior + block_tokens
                ),
            );
            return Err(fail_block(
                ctx,
                block_id,
                FailureCode::BudgetExceeded,
                info,
                Retry::Never,
                Some(record),
            )
            .await);
        }
    }

    Ok((outputs, Some(record)))
}

fn base_record(
    agent: &AgentSpec,
    result: Option<&DispatchResult>,
    elapsed: std::time::Duration,
) -> ExecutionRecord {
    let tokens = result
        .and_then(|r| r.tokens_used)
        .unwrap_or(TokenUsage { input: 0, output: 0 });
    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = elapsed.as_millis() as u64;
    ExecutionRecord {
        agent_id: result
            .and_then(|r| r.actual_agent_id.clone())
            .or_else(|| Some(agent.id.clone())),
        provider: result
            .and_then(|r| r.actual_provider.clone())
            .or_else(|| Some(agent.provider.clone())),
        transport_provider: result.and_then(|r| r.actual_model_provider.clone()),
        model: result
            .and_then(|r| r.actual_model.clone())
            .or_else(|| agent.model.clone()),
        raw_output: None,
        tokens_in: tokens.input,
        tokens_out: tokens.output,
        duration_ms,
        error: None,
        structured_repair: result.map(|r| StructuredRepair {
            attempted: r.repair_attempted,
            succeeded: r.repair_succeeded,
        }),
        contract_trace: None,
    }
}

enum DispatchError {
    Timeout(u64),
    Exception(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(ms) => write!(f, "timed out after {ms}ms"),
            Self::Exception(msg) => write!(f, "{msg}"),
        }
    }
}

/// Dispatch with the driver-enforced timeout. The timeout composes into the
/// request's cancellation token so the semantics hold even against providers
/// that ignore signals.
async fn dispatch_with_timeout(
    provider: &dyn Provider,
    request: DispatchRequest,
    timeout_ms: Option<u64>,
    cancel: &CancellationToken,
) -> Result<DispatchResult, DispatchError> {
    let effective = timeout_ms.filter(|ms| *ms > 0);
    let dispatch = provider.dispatch(request);

    let result = match effective {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), dispatch).await {
            Ok(inner) => inner,
            Err(_) => {
                cancel.cancel();
                return Err(DispatchError::Timeout(ms));
            }
        },
        None => dispatch.await,
    };

    result.map_err(|e: DomainError| DispatchError::Exception(e.to_string()))
}
