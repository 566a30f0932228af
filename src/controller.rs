//! Phase controller: drives one flow through its declared phase order.
//!
//! The controller owns the execution state machine. For each phase it:
//!
//! 1. Checks the cooperative cancellation flag (in-process and persisted).
//! 2. Durably marks the flow `Running` at the phase before executing it.
//! 3. Resolves and invokes the phase executor under its retry policy, with
//!    a wall-clock timeout per attempt (timeouts count as transient).
//! 4. Records the outcome in `phase_state` and advances, pauses, fails, or
//!    completes.
//!
//! Execution always starts at the first phase without a complete record, so
//! re-running a partially-executed flow is idempotent: completed phases are
//! never re-invoked.
//!
//! Parallel phases fan out their declared branches concurrently; every
//! branch carries an explicit snapshot of the ambient request context,
//! since task-locals never cross into spawned work on their own. Branch
//! deltas merge in declared order, later branches winning on key overlap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::join_all;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::context::{ContextError, RequestContext};
use crate::executor::{ExecutorError, ExecutorSet, PhaseExecution, PhaseInput};
use crate::registry::{FlowTypeConfig, PhaseDef};
use crate::state::{ErrorDetail, FlowState, StateError};
use crate::store::{FlowStore, StoreError};
use crate::types::{FlowStatus, PhaseStatus};
use crate::utils::json_ext::deep_merge;

/// Shared cooperative cancellation flag, checked between phases.
///
/// Setting the flag never interrupts a phase mid-execution; the in-flight
/// phase finishes (and its record is kept) before the flow finalizes as
/// `Cancelled`.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal outcome of one controller run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every phase completed.
    Completed,
    /// Flow parked at a pausable phase awaiting user input.
    Paused { phase: String },
    /// Flow failed terminally at the named phase.
    Failed { phase: String, message: String },
    /// Cancellation was honored between phases.
    Cancelled,
}

/// Errors raised by the controller itself (not phase failures, which are
/// recorded in flow state and surface as [`RunOutcome::Failed`]).
#[derive(Debug, Error, Diagnostic)]
pub enum ControllerError {
    /// No executor registered for a phase the flow reached.
    #[error("no executor registered for phase '{phase}'")]
    #[diagnostic(
        code(flowline::controller::no_executor),
        help("Register an executor for every phase (and fan-out branch) of the flow type.")
    )]
    NoExecutor { phase: String },

    /// Resume input is missing required keys for the paused phase.
    #[error("resume input for phase '{phase}' is missing required keys: {missing:?}")]
    #[diagnostic(code(flowline::controller::missing_inputs))]
    MissingInputs { phase: String, missing: Vec<String> },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Context(#[from] ContextError),
}

/// Bounded reload-and-reapply attempts when a save races a flag write.
const SAVE_CONFLICT_RETRIES: usize = 3;

/// Drives flows phase by phase against a store and an executor set.
pub struct PhaseController {
    store: Arc<dyn FlowStore>,
    executors: Arc<ExecutorSet>,
}

impl std::fmt::Debug for PhaseController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseController").finish()
    }
}

impl PhaseController {
    pub fn new(store: Arc<dyn FlowStore>, executors: Arc<ExecutorSet>) -> Self {
        Self { store, executors }
    }

    /// Run the flow from its first incomplete phase to a terminal outcome,
    /// a pause, or cancellation.
    #[instrument(skip(self, state, config, cancel), fields(flow_id = %state.id(), flow_type = %config.flow_type))]
    pub async fn run(
        &self,
        state: &mut FlowState,
        config: &FlowTypeConfig,
        cancel: &CancelFlag,
    ) -> Result<RunOutcome, ControllerError> {
        let mut index = match state.first_incomplete_phase(config) {
            Some(i) => i,
            None => {
                // Nothing left to execute; finalize if the crash happened
                // after the last phase but before completion was recorded.
                if !state.master.status.is_terminal() {
                    if state.master.status != FlowStatus::Running {
                        state.begin_phase(
                            config.phases.last().map(|d| d.name.as_str()).unwrap_or(""),
                        )?;
                    }
                    state.mark_completed()?;
                    self.save_with_retry(state).await?;
                }
                return Ok(RunOutcome::Completed);
            }
        };

        loop {
            if cancel.is_cancelled() || state.master.cancel_requested {
                state.mark_cancelled()?;
                self.save_with_retry(state).await?;
                return Ok(RunOutcome::Cancelled);
            }

            let def = config.phases[index].clone();
            state.begin_phase(&def.name)?;
            self.save_with_retry(state).await?;
            // A racing cancel write may have been folded in by the save.
            if state.master.cancel_requested {
                continue;
            }

            let (execution, attempts) = if def.is_parallel() {
                self.run_parallel(state, &def).await?
            } else {
                self.run_single(state, &def).await?
            };

            match execution.status {
                PhaseStatus::Succeeded => {
                    state.record_phase(&def.name, PhaseStatus::Succeeded, execution.delta);
                    state.set_phase_attempts(&def.name, attempts);
                    index = advance(state, config, index, execution.next_phase.as_deref());
                }
                PhaseStatus::Skipped => {
                    if !def.skippable {
                        let message =
                            format!("phase '{}' reported skip but is not skippable", def.name);
                        return self.fail(state, &def.name, message, attempts).await;
                    }
                    state.record_phase(&def.name, PhaseStatus::Skipped, Value::Null);
                    state.set_phase_attempts(&def.name, attempts);
                    index = advance(state, config, index, execution.next_phase.as_deref());
                }
                PhaseStatus::Paused => {
                    if !def.pausable {
                        let message =
                            format!("phase '{}' requested a pause but is not pausable", def.name);
                        return self.fail(state, &def.name, message, attempts).await;
                    }
                    state.record_phase(&def.name, PhaseStatus::Paused, execution.delta);
                    state.set_phase_attempts(&def.name, attempts);
                    state.mark_paused(&def.name)?;
                    self.save_with_retry(state).await?;
                    debug!(phase = %def.name, "flow paused awaiting user input");
                    return Ok(RunOutcome::Paused { phase: def.name });
                }
                PhaseStatus::Failed => {
                    let message = execution
                        .error
                        .unwrap_or_else(|| format!("phase '{}' failed", def.name));
                    return self.fail(state, &def.name, message, attempts).await;
                }
            }

            if index >= config.phases.len() {
                state.mark_completed()?;
                self.save_with_retry(state).await?;
                return Ok(RunOutcome::Completed);
            }
            self.save_with_retry(state).await?;
        }
    }

    /// Merge user input into the paused phase and continue execution.
    ///
    /// The paused phase re-executes with the merged state; required inputs
    /// declared by the phase must be present after the merge.
    #[instrument(skip(self, state, config, user_input, cancel), fields(flow_id = %state.id()))]
    pub async fn resume(
        &self,
        state: &mut FlowState,
        config: &FlowTypeConfig,
        user_input: Value,
        cancel: &CancelFlag,
    ) -> Result<RunOutcome, ControllerError> {
        let phase = state
            .master
            .current_phase
            .clone()
            .unwrap_or_default();
        state.merge_user_input(&phase, user_input);
        if let Some(def) = config.phase(&phase) {
            let merged = state.merged_state();
            let missing: Vec<String> = def
                .required_inputs
                .iter()
                .filter(|key| merged.get(key.as_str()).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(ControllerError::MissingInputs { phase, missing });
            }
        }
        self.save_with_retry(state).await?;
        self.run(state, config, cancel).await
    }

    async fn fail(
        &self,
        state: &mut FlowState,
        phase: &str,
        message: String,
        attempts: u32,
    ) -> Result<RunOutcome, ControllerError> {
        state.record_phase(phase, PhaseStatus::Failed, Value::Null);
        state.set_phase_attempts(phase, attempts);
        let detail = ErrorDetail::msg(message.clone())
            .in_phase(phase)
            .with_details(serde_json::json!({ "attempts": attempts }));
        state.record_phase_error(phase, detail.clone());
        state.mark_failed(detail)?;
        self.save_with_retry(state).await?;
        warn!(phase, %message, "flow failed terminally");
        Ok(RunOutcome::Failed {
            phase: phase.to_string(),
            message,
        })
    }

    /// Execute one non-parallel phase under its retry policy.
    async fn run_single(
        &self,
        state: &FlowState,
        def: &PhaseDef,
    ) -> Result<(PhaseExecution, u32), ControllerError> {
        let executor = self
            .executors
            .resolve(&def.name)
            .ok_or_else(|| ControllerError::NoExecutor {
                phase: def.name.clone(),
            })?;
        let merged = state.merged_state();
        let prior_attempts = state
            .master
            .phase_state
            .get(&def.name)
            .map(|r| r.attempts)
            .unwrap_or(0);
        Ok(run_with_retry(
            executor,
            state,
            &def.name,
            merged,
            prior_attempts,
            def,
        )
        .await)
    }

    /// Fan out the declared branches concurrently and fan their deltas back
    /// in. Branches may not pause; a failed branch fails the whole phase.
    async fn run_parallel(
        &self,
        state: &FlowState,
        def: &PhaseDef,
    ) -> Result<(PhaseExecution, u32), ControllerError> {
        let ctx = RequestContext::current()?;
        let merged = state.merged_state();
        let mut branches = Vec::with_capacity(def.fan_out.len());
        for branch in &def.fan_out {
            let executor =
                self.executors
                    .resolve(branch)
                    .ok_or_else(|| ControllerError::NoExecutor {
                        phase: branch.clone(),
                    })?;
            branches.push((branch.clone(), executor));
        }

        let futures = branches.into_iter().map(|(branch, executor)| {
            let snapshot = ctx.clone();
            let merged = merged.clone();
            let state_view = state.clone();
            let branch_def = PhaseDef::new(branch.clone()).with_retry(def.retry);
            async move {
                let (execution, _) = snapshot
                    .scope(run_with_retry(
                        executor,
                        &state_view,
                        &branch_def.name,
                        merged,
                        0,
                        &branch_def,
                    ))
                    .await;
                (branch, execution)
            }
        });

        let mut combined = Value::Object(serde_json::Map::new());
        for (branch, execution) in join_all(futures).await {
            match execution.status {
                PhaseStatus::Succeeded => {
                    if execution.delta.is_object() {
                        combined = deep_merge(&combined, &execution.delta);
                    }
                }
                PhaseStatus::Paused => {
                    return Ok((
                        PhaseExecution::failed(format!(
                            "branch '{branch}' attempted to pause inside a parallel phase"
                        )),
                        1,
                    ));
                }
                PhaseStatus::Skipped => {
                    debug!(%branch, "parallel branch skipped");
                }
                PhaseStatus::Failed => {
                    let message = execution
                        .error
                        .unwrap_or_else(|| format!("branch '{branch}' failed"));
                    return Ok((
                        PhaseExecution::failed(format!("branch '{branch}': {message}")),
                        1,
                    ));
                }
            }
        }
        Ok((PhaseExecution::success(combined), 1))
    }

    /// Save, absorbing a bounded number of version conflicts.
    ///
    /// The controller is the only writer for an actively-held flow; a
    /// conflict can only come from a `cancel` flag write, so the resolution
    /// is to fold the fresh flag into our copy and retry.
    async fn save_with_retry(&self, state: &mut FlowState) -> Result<(), ControllerError> {
        for _ in 0..SAVE_CONFLICT_RETRIES {
            match self.store.save(state).await {
                Ok(()) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => {
                    let fresh = self.store.load(state.id()).await?;
                    state.master.cancel_requested |= fresh.master.cancel_requested;
                    state.master.version = fresh.master.version;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.store.save(state).await.map_err(Into::into)
    }
}

/// Advance past the current phase, recording any phases a forward jump
/// bypasses as skipped.
///
/// The skip records keep the incomplete-phase scan consistent: a later
/// rerun, resume, or recovery restarts after the jump target's
/// predecessors, never inside the stretch the jump deliberately bypassed.
fn advance(
    state: &mut FlowState,
    config: &FlowTypeConfig,
    current: usize,
    requested: Option<&str>,
) -> usize {
    let next = next_index(config, current, requested);
    for def in &config.phases[current + 1..next.min(config.phases.len())] {
        debug!(phase = %def.name, "phase bypassed by forward jump");
        state.record_phase(&def.name, PhaseStatus::Skipped, Value::Null);
        // Never executed; a real attempt count would be a lie.
        state.set_phase_attempts(&def.name, 0);
    }
    next
}

/// Resolve the next phase index, honoring a forward jump request.
///
/// Backward or unknown targets are ignored with a warning; jumps only ever
/// skip ahead within the declared order.
fn next_index(config: &FlowTypeConfig, current: usize, requested: Option<&str>) -> usize {
    match requested {
        Some(target) => match config.phase_index(target) {
            Some(i) if i > current => i,
            Some(_) => {
                warn!(requested = target, "ignoring backward phase jump request");
                current + 1
            }
            None => {
                warn!(requested = target, "ignoring jump to unknown phase");
                current + 1
            }
        },
        None => current + 1,
    }
}

/// Run one executor under the phase's retry policy.
///
/// Transient errors (including per-attempt timeouts) are retried with
/// identical input up to `max_attempts`; validation and fatal errors are
/// never retried. Exhausted budgets surface as a failed execution.
async fn run_with_retry(
    executor: Arc<dyn crate::executor::PhaseExecutor>,
    state: &FlowState,
    phase: &str,
    merged: Value,
    prior_attempts: u32,
    def: &PhaseDef,
) -> (PhaseExecution, u32) {
    let max_attempts = def.retry.max_attempts.max(1);
    let mut attempt = prior_attempts;
    loop {
        attempt += 1;
        let input = PhaseInput {
            flow_id: state.id().clone(),
            phase: phase.to_string(),
            attempt,
            state: merged.clone(),
        };
        let outcome = tokio::time::timeout(def.retry.timeout, executor.run(input)).await;
        let error = match outcome {
            Ok(Ok(execution)) => return (execution, attempt),
            Ok(Err(e)) => e,
            Err(_) => ExecutorError::transient(format!(
                "phase '{phase}' timed out after {:?}",
                def.retry.timeout
            )),
        };
        if error.is_transient() && attempt < prior_attempts + max_attempts {
            debug!(phase, attempt, %error, "transient phase failure, retrying");
            continue;
        }
        return (PhaseExecution::failed(error.to_string()), attempt);
    }
}
