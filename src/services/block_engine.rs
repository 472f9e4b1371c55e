//! Block engine: stateless helpers over a parsed DAG and a mutable run.
//!
//! The executor owns the run and calls into these functions at well-defined
//! points; nothing here performs I/O. Status transitions are checked so that
//! repeated completion/failure of a terminal instance is rejected rather
//! than silently applied.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    context_keys, BlockInstance, BlockStatus, Dag, DagRun, ExecutionRecord, RunStatus,
};
use crate::services::expr;

/// Build a run from a DAG and seed context; every instance starts `pending`.
pub fn create_run(dag: &Dag, context: HashMap<String, Value>) -> DagRun {
    let run_id = Uuid::new_v4();
    let now = Utc::now();
    DagRun {
        id: run_id,
        dag_name: dag.name.clone(),
        status: RunStatus::Pending,
        blocks: dag
            .blocks
            .values()
            .map(|def| (def.id.clone(), BlockInstance::new(def, run_id)))
            .collect(),
        context,
        created_at: now,
        updated_at: now,
    }
}

/// Whether one required input port is currently satisfiable.
fn input_satisfied(dag: &Dag, run: &DagRun, block_id: &str, port: &str) -> bool {
    if run
        .context
        .contains_key(&context_keys::override_input(block_id, port))
    {
        return true;
    }
    if let Some(edge) = dag.incoming_edge(block_id, port) {
        return run
            .instance(&edge.from_block)
            .is_some_and(|source| {
                source.status == BlockStatus::Completed && source.outputs.contains_key(&edge.from_port)
            });
    }
    if run.context.contains_key(port) {
        return true;
    }
    dag.block(block_id)
        .and_then(|def| def.inputs.get(port))
        .is_some_and(|p| p.default.is_some())
}

/// Block ids in `pending` whose required inputs are all satisfiable, sorted
/// for determinism. Idempotent over an unchanged run.
pub fn resolve_ready(dag: &Dag, run: &DagRun) -> Vec<String> {
    let mut ready: Vec<String> = run
        .blocks
        .iter()
        .filter(|(_, instance)| instance.status == BlockStatus::Pending)
        .filter(|(block_id, _)| {
            dag.block(block_id).is_some_and(|def| {
                def.inputs
                    .iter()
                    .filter(|(_, port)| port.required)
                    .all(|(port_name, _)| input_satisfied(dag, run, block_id, port_name))
            })
        })
        .map(|(block_id, _)| block_id.clone())
        .collect();
    ready.sort();
    ready
}

/// Materialize a block's inputs.
///
/// Priority per port: per-block override key, then the incoming edge (with
/// its transform applied), then the run context, then the port default.
/// Missing required inputs are left unset; the pre-gate catches them.
pub fn wire_inputs(dag: &Dag, run: &DagRun, block_id: &str) -> HashMap<String, Value> {
    let Some(def) = dag.block(block_id) else {
        return HashMap::new();
    };

    let mut inputs = HashMap::new();
    for (port_name, port) in &def.inputs {
        let override_key = context_keys::override_input(block_id, port_name);
        if let Some(value) = run.context.get(&override_key) {
            inputs.insert(port_name.clone(), value.clone());
            continue;
        }

        if let Some(edge) = dag.incoming_edge(block_id, port_name) {
            let source_value = run
                .instance(&edge.from_block)
                .filter(|source| source.status == BlockStatus::Completed)
                .and_then(|source| source.outputs.get(&edge.from_port));
            if let Some(value) = source_value {
                inputs.insert(port_name.clone(), apply_transform(edge.transform.as_deref(), value));
                continue;
            }
        }

        if let Some(value) = run.context.get(port_name) {
            inputs.insert(port_name.clone(), value.clone());
            continue;
        }

        if let Some(default) = &port.default {
            inputs.insert(port_name.clone(), default.clone());
        }
    }
    inputs
}

/// Run the edge transform with `{value}` in scope. If evaluation throws, the
/// original value is forwarded unchanged.
fn apply_transform(transform: Option<&str>, value: &Value) -> Value {
    let Some(source) = transform else {
        return value.clone();
    };
    let scope = HashMap::from([("value".to_string(), value.clone())]);
    match expr::evaluate(source, &scope) {
        Ok(transformed) => transformed,
        Err(e) => {
            tracing::warn!(transform = source, error = %e, "edge transform failed, forwarding value unchanged");
            value.clone()
        }
    }
}

fn instance_mut<'a>(run: &'a mut DagRun, block_id: &str) -> DomainResult<&'a mut BlockInstance> {
    run.blocks
        .get_mut(block_id)
        .ok_or_else(|| DomainError::BlockNotFound(block_id.to_string()))
}

/// Transition a pending instance to `running` and the run to `running`.
pub fn start_block(
    run: &mut DagRun,
    block_id: &str,
    inputs: HashMap<String, Value>,
) -> DomainResult<()> {
    let instance = instance_mut(run, block_id)?;
    if instance.status != BlockStatus::Pending {
        return Err(DomainError::InvalidStateTransition {
            from: instance.status.to_string(),
            to: BlockStatus::Running.to_string(),
        });
    }
    instance.status = BlockStatus::Running;
    instance.inputs = inputs;
    instance.started_at = Some(Utc::now());
    instance.retry_state.attempt += 1;
    instance.retry_state.next_retry_at = None;

    if run.status == RunStatus::Pending || run.status == RunStatus::PausedApproval {
        run.status = RunStatus::Running;
    }
    run.touch();
    Ok(())
}

/// Record outputs and the execution record; transition to `completed`.
pub fn complete_block(
    run: &mut DagRun,
    block_id: &str,
    outputs: HashMap<String, Value>,
    execution: Option<ExecutionRecord>,
) -> DomainResult<()> {
    let instance = instance_mut(run, block_id)?;
    if instance.status != BlockStatus::Running {
        return Err(DomainError::InvalidStateTransition {
            from: instance.status.to_string(),
            to: BlockStatus::Completed.to_string(),
        });
    }
    instance.status = BlockStatus::Completed;
    instance.outputs = outputs;
    if execution.is_some() {
        instance.execution = execution;
    }
    instance.completed_at = Some(Utc::now());
    run.touch();
    Ok(())
}

/// Outcome of [`fail_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The block will retry once the delay elapses.
    Retrying { next_retry_at: DateTime<Utc> },
    /// The block failed terminally. `run_failed` is set when every other
    /// block was already terminal, which fails the whole run.
    Failed { run_failed: bool },
}

/// Fail an attempt: schedule a retry while attempts remain, otherwise mark
/// the block failed (and the run, when nothing else can progress).
pub fn fail_block(
    dag: &Dag,
    run: &mut DagRun,
    block_id: &str,
    error: impl Into<String>,
    execution: Option<ExecutionRecord>,
) -> DomainResult<FailOutcome> {
    let error = error.into();
    let Some(def) = dag.block(block_id) else {
        return Err(DomainError::BlockNotFound(block_id.to_string()));
    };
    let instance = instance_mut(run, block_id)?;
    if instance.status.is_terminal() {
        return Err(DomainError::InvalidStateTransition {
            from: instance.status.to_string(),
            to: BlockStatus::Failed.to_string(),
        });
    }

    instance.retry_state.last_error = Some(error);
    if execution.is_some() {
        instance.execution = execution;
    }

    let attempt = instance.retry_state.attempt;
    if attempt < instance.retry_state.max_attempts {
        let delay = def.retry.delay_for(attempt);
        let next_retry_at = Utc::now() + Duration::milliseconds(i64::try_from(delay).unwrap_or(i64::MAX));
        instance.status = BlockStatus::Retrying;
        instance.retry_state.next_retry_at = Some(next_retry_at);
        run.touch();
        return Ok(FailOutcome::Retrying { next_retry_at });
    }

    Ok(mark_failed(run, block_id))
}

/// Fail a block terminally, bypassing the retry policy. Used for failures
/// retries cannot fix: gate failures, contract failures, budget and routing
/// errors.
pub fn fail_block_terminal(
    run: &mut DagRun,
    block_id: &str,
    error: impl Into<String>,
    execution: Option<ExecutionRecord>,
) -> DomainResult<FailOutcome> {
    let instance = instance_mut(run, block_id)?;
    if instance.status.is_terminal() {
        return Err(DomainError::InvalidStateTransition {
            from: instance.status.to_string(),
            to: BlockStatus::Failed.to_string(),
        });
    }
    instance.retry_state.last_error = Some(error.into());
    if execution.is_some() {
        instance.execution = execution;
    }
    Ok(mark_failed(run, block_id))
}

fn mark_failed(run: &mut DagRun, block_id: &str) -> FailOutcome {
    if let Some(instance) = run.blocks.get_mut(block_id) {
        instance.status = BlockStatus::Failed;
        instance.completed_at = Some(Utc::now());
    }
    let run_failed = run
        .blocks
        .iter()
        .filter(|(id, _)| id.as_str() != block_id)
        .all(|(_, other)| other.status.is_terminal());
    if run_failed {
        run.status = RunStatus::Failed;
    }
    run.touch();
    FailOutcome::Failed { run_failed }
}

/// Flip `retrying` instances whose delay has elapsed back to `pending`.
/// Returns the earliest `next_retry_at` still in the future, if any.
pub fn release_due_retries(run: &mut DagRun, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut earliest_pending: Option<DateTime<Utc>> = None;
    for instance in run.blocks.values_mut() {
        if instance.status != BlockStatus::Retrying {
            continue;
        }
        match instance.retry_state.next_retry_at {
            Some(at) if at <= now => {
                instance.status = BlockStatus::Pending;
                instance.retry_state.next_retry_at = None;
            }
            Some(at) => {
                earliest_pending = Some(earliest_pending.map_or(at, |e| e.min(at)));
            }
            None => {
                // Defensive: a retrying instance without a deadline is due now.
                instance.status = BlockStatus::Pending;
            }
        }
    }
    run.touch();
    earliest_pending
}

/// True iff every declared terminal is `completed` or `skipped` (or, with no
/// terminals declared, every block is terminal).
pub fn is_complete(dag: &Dag, run: &DagRun) -> bool {
    if dag.terminals.is_empty() {
        return run.blocks.values().all(|b| b.status.is_terminal());
    }
    dag.terminals.iter().all(|terminal| {
        run.instance(terminal).is_some_and(|instance| {
            matches!(
                instance.status,
                BlockStatus::Completed | BlockStatus::Skipped
            )
        })
    })
}
