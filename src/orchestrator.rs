//! Flow orchestrator: the single entry point hosts call into.
//!
//! Wraps the registry, store, executor set, and phase controller behind a
//! small façade: `create_flow`, `execute`, `resume`, `get_status`,
//! `cancel`, and `recover`. Two guarantees live here rather than in the
//! controller:
//!
//! - **Single active flow** per `(tenant, engagement, flow_type)`: creation
//!   is refused while a non-terminal flow of the same type exists in the
//!   same scope.
//! - **Single in-process run** per flow: a second `execute` (or `resume`)
//!   for a flow already being driven by this process is refused with
//!   [`OrchestratorError::AlreadyRunning`] instead of racing the first.
//!
//! `get_status` is strictly read-only for the caller: when it spots a
//! zombie it schedules recovery on a background task and still returns the
//! unmodified status view immediately.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

use miette::Diagnostic;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::context::{ContextError, RequestContext};
use crate::controller::{CancelFlag, ControllerError, PhaseController, RunOutcome};
use crate::executor::ExecutorSet;
use crate::recovery::{FlowHealth, StallMonitor, StallThresholds};
use crate::registry::{FlowRegistry, RegistryError};
use crate::state::{ErrorDetail, FlowState, FlowStatusView, StateError};
use crate::store::{FlowStore, LinkedWrite, StoreError};
use crate::types::{FlowId, FlowStatus};

/// Result of driving a flow (via `execute` or `resume`).
#[derive(Clone, Debug)]
pub struct FlowOutcome {
    pub flow_id: FlowId,
    /// Persisted status after the run.
    pub status: FlowStatus,
    /// Phase the flow is at (or stopped at).
    pub current_phase: Option<String>,
    /// How the run ended.
    pub outcome: RunOutcome,
}

/// Errors surfaced by the orchestrator façade.
#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    /// This process is already driving the flow.
    #[error("flow {flow_id} is already being executed")]
    #[diagnostic(
        code(flowline::orchestrator::already_running),
        help("Poll get_status instead of calling execute again.")
    )]
    AlreadyRunning { flow_id: FlowId },

    /// A non-terminal flow of this type already exists in scope.
    #[error("an active '{flow_type}' flow already exists in this engagement: {flow_id}")]
    #[diagnostic(
        code(flowline::orchestrator::flow_already_active),
        help("Wait for the active flow to finish, or cancel it first.")
    )]
    FlowAlreadyActive { flow_type: String, flow_id: FlowId },

    /// The operation is not legal for the flow's current status.
    #[error("flow {flow_id} is {status}; expected {expected}")]
    #[diagnostic(code(flowline::orchestrator::invalid_state))]
    InvalidState {
        flow_id: FlowId,
        status: FlowStatus,
        expected: &'static str,
    },

    /// Caller-supplied input is malformed.
    #[error("validation failed: {0}")]
    #[diagnostic(code(flowline::orchestrator::validation))]
    Validation(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Context(#[from] ContextError),
}

/// Orchestration engine façade. Cheap to share behind an `Arc`.
pub struct FlowOrchestrator {
    registry: Arc<FlowRegistry>,
    store: Arc<dyn FlowStore>,
    controller: PhaseController,
    monitor: StallMonitor,
    /// Flow ids currently being driven by this process.
    active: Mutex<FxHashSet<String>>,
    /// In-process cancellation flags for active runs.
    cancels: Mutex<FxHashMap<String, CancelFlag>>,
}

impl std::fmt::Debug for FlowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowOrchestrator")
            .field("active_runs", &self.active.lock().len())
            .finish()
    }
}

/// Builder for [`FlowOrchestrator`].
#[derive(Default)]
pub struct FlowOrchestratorBuilder {
    registry: Option<Arc<FlowRegistry>>,
    store: Option<Arc<dyn FlowStore>>,
    executors: Option<Arc<ExecutorSet>>,
    thresholds: StallThresholds,
}

impl FlowOrchestratorBuilder {
    #[must_use]
    pub fn with_registry(mut self, registry: FlowRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn FlowStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_executors(mut self, executors: ExecutorSet) -> Self {
        self.executors = Some(Arc::new(executors));
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: StallThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Assemble the orchestrator. Missing pieces fall back to the standard
    /// registry, an empty executor set, and default thresholds; the store
    /// is required.
    pub fn build(self) -> Result<FlowOrchestrator, OrchestratorError> {
        let store = self
            .store
            .ok_or_else(|| OrchestratorError::Validation("a store is required".into()))?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(FlowRegistry::standard()));
        let executors = self.executors.unwrap_or_else(|| Arc::new(ExecutorSet::new()));
        Ok(FlowOrchestrator {
            registry,
            controller: PhaseController::new(Arc::clone(&store), executors),
            store,
            monitor: StallMonitor::new(self.thresholds),
            active: Mutex::new(FxHashSet::default()),
            cancels: Mutex::new(FxHashMap::default()),
        })
    }
}

/// RAII marker for an in-process run; releases the slot on drop even when
/// the run errors out.
struct ActiveGuard<'a> {
    orchestrator: &'a FlowOrchestrator,
    key: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.active.lock().remove(&self.key);
        self.orchestrator.cancels.lock().remove(&self.key);
    }
}

impl FlowOrchestrator {
    #[must_use]
    pub fn builder() -> FlowOrchestratorBuilder {
        FlowOrchestratorBuilder::default()
    }

    #[must_use]
    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    fn acquire<'a>(&'a self, flow_id: &FlowId) -> Result<(ActiveGuard<'a>, CancelFlag), OrchestratorError> {
        let key = flow_id.as_str().to_string();
        {
            let mut active = self.active.lock();
            if !active.insert(key.clone()) {
                return Err(OrchestratorError::AlreadyRunning {
                    flow_id: flow_id.clone(),
                });
            }
        }
        let flag = CancelFlag::new();
        self.cancels.lock().insert(key.clone(), flag.clone());
        Ok((
            ActiveGuard {
                orchestrator: self,
                key,
            },
            flag,
        ))
    }

    /// Create a new flow aggregate in the current tenant scope.
    ///
    /// Refused while a non-terminal flow of the same type exists in the
    /// same `(tenant, engagement)` scope. The master, child, and an audit
    /// record are written in one transaction.
    #[instrument(skip(self, initial_state), err)]
    pub async fn create_flow(
        &self,
        flow_type: &str,
        initial_state: Value,
    ) -> Result<FlowId, OrchestratorError> {
        self.create_flow_with(flow_type, initial_state, Vec::new())
            .await
    }

    /// Like [`create_flow`](Self::create_flow), with caller-supplied records
    /// joining the creating transaction.
    ///
    /// The extra records (outbox messages, domain audit rows) are persisted
    /// atomically with the aggregate: they exist only if the flow does.
    #[instrument(skip(self, initial_state, linked), err)]
    pub async fn create_flow_with(
        &self,
        flow_type: &str,
        initial_state: Value,
        linked: Vec<LinkedWrite>,
    ) -> Result<FlowId, OrchestratorError> {
        let ctx = RequestContext::current()?;
        self.registry.resolve(flow_type)?;
        if !initial_state.is_object() {
            return Err(OrchestratorError::Validation(
                "initial_state must be a JSON object".into(),
            ));
        }
        if let Some(existing) = self.store.find_active(flow_type).await? {
            return Err(OrchestratorError::FlowAlreadyActive {
                flow_type: flow_type.to_string(),
                flow_id: existing,
            });
        }
        let state = FlowState::new(flow_type, &ctx, &initial_state);
        let mut writes = vec![LinkedWrite::new(
            "audit",
            "created",
            json!({
                "flow_type": flow_type,
                "user_id": ctx.user_id,
                "request_id": ctx.request_id,
            }),
        )];
        writes.extend(linked);
        let flow_id = self.store.create(&state, &writes).await?;
        info!(%flow_id, flow_type, "flow created");
        Ok(flow_id)
    }

    /// Drive the flow from its first incomplete phase.
    ///
    /// Legal from `NotStarted` and `Running` (the latter covers recovery of
    /// an interrupted run); a paused flow must go through [`resume`](Self::resume).
    #[instrument(skip(self), err)]
    pub async fn execute(&self, flow_id: &FlowId) -> Result<FlowOutcome, OrchestratorError> {
        let (_guard, cancel) = self.acquire(flow_id)?;
        let mut state = self.store.load(flow_id).await?;
        self.check_status(&state, &[FlowStatus::NotStarted, FlowStatus::Running], "not_started or running")?;
        let config = self.registry.resolve(&state.master.flow_type)?.clone();
        let outcome = match self.controller.run(&mut state, &config, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_escaped_run(&mut state, &e).await;
                return Err(e.into());
            }
        };
        Ok(FlowOutcome {
            flow_id: flow_id.clone(),
            status: state.master.status,
            current_phase: state.master.current_phase.clone(),
            outcome,
        })
    }

    /// Resume a paused flow with user input for its paused phase.
    #[instrument(skip(self, user_input), err)]
    pub async fn resume(
        &self,
        flow_id: &FlowId,
        user_input: Value,
    ) -> Result<FlowOutcome, OrchestratorError> {
        if !user_input.is_object() {
            return Err(OrchestratorError::Validation(
                "user_input must be a JSON object".into(),
            ));
        }
        let (_guard, cancel) = self.acquire(flow_id)?;
        let mut state = self.store.load(flow_id).await?;
        self.check_status(&state, &[FlowStatus::Paused], "paused")?;
        let config = self.registry.resolve(&state.master.flow_type)?.clone();
        if !config.resumable {
            return Err(OrchestratorError::Validation(format!(
                "flow type '{}' is not resumable",
                config.flow_type
            )));
        }
        let outcome = match self
            .controller
            .resume(&mut state, &config, user_input, &cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_escaped_run(&mut state, &e).await;
                return Err(e.into());
            }
        };
        Ok(FlowOutcome {
            flow_id: flow_id.clone(),
            status: state.master.status,
            current_phase: state.master.current_phase.clone(),
            outcome,
        })
    }

    /// Read-only status projection for polling clients.
    ///
    /// Classifies the flow on every call; a zombie triggers background
    /// recovery but the returned view is never altered or delayed by it.
    #[instrument(skip(self), err)]
    pub async fn get_status(
        self: &Arc<Self>,
        flow_id: &FlowId,
    ) -> Result<FlowStatusView, OrchestratorError> {
        let state = self.store.load(flow_id).await?;
        let config = self.registry.resolve(&state.master.flow_type)?;
        let view = state.status_view(config);
        if let FlowHealth::Zombie { reason } = self.monitor.classify(&state, config) {
            if self.active.lock().contains(flow_id.as_str()) {
                debug!(%flow_id, "zombie signature but flow is actively running here; skipping recovery");
            } else {
                warn!(%flow_id, %reason, "zombie flow detected; scheduling recovery");
                let this = Arc::clone(self);
                let id = flow_id.clone();
                let snapshot = RequestContext::current()?;
                tokio::spawn(snapshot.scope(async move {
                    if let Err(e) = this.recover(&id).await {
                        warn!(flow_id = %id, error = %e, "background recovery failed");
                    }
                }));
            }
        }
        Ok(view)
    }

    /// Request cancellation.
    ///
    /// A flow that is not currently executing (`NotStarted` or `Paused`)
    /// finalizes as `Cancelled` immediately. A running flow only gets its
    /// cooperative flag set; the in-flight phase finishes first.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, flow_id: &FlowId) -> Result<FlowStatus, OrchestratorError> {
        let mut state = self.store.load(flow_id).await?;
        let config = self.registry.resolve(&state.master.flow_type)?;
        if !config.cancellable {
            return Err(OrchestratorError::Validation(format!(
                "flow type '{}' is not cancellable",
                config.flow_type
            )));
        }
        if state.master.status.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                flow_id: flow_id.clone(),
                status: state.master.status,
                expected: "a non-terminal status",
            });
        }
        match state.master.status {
            FlowStatus::NotStarted | FlowStatus::Paused => {
                state.mark_cancelled()?;
                self.save_flag_write(&mut state).await?;
                info!(%flow_id, "flow cancelled immediately");
            }
            _ => {
                state.master.cancel_requested = true;
                self.save_flag_write(&mut state).await?;
                if let Some(flag) = self.cancels.lock().get(flow_id.as_str()) {
                    flag.cancel();
                }
                info!(%flow_id, "cancellation requested; will take effect between phases");
            }
        }
        Ok(state.master.status)
    }

    /// Recover a stalled flow by re-entering it through the normal
    /// execution path.
    ///
    /// Classification is recomputed from fresh records first, so calling
    /// this on a healthy or already-repaired flow is a no-op. Recovery
    /// trusts the master's phase records: execution restarts at the first
    /// phase without a complete record, never re-running completed work.
    #[instrument(skip(self), err)]
    pub async fn recover(&self, flow_id: &FlowId) -> Result<FlowHealth, OrchestratorError> {
        let state = self.store.load(flow_id).await?;
        let config = self.registry.resolve(&state.master.flow_type)?;
        let health = self.monitor.classify(&state, config);
        if !health.is_zombie() {
            return Ok(health);
        }
        info!(%flow_id, "recovering zombie flow");
        match self.execute(flow_id).await {
            Ok(_) => Ok(health),
            // Someone else picked it up; that is a successful recovery too.
            Err(OrchestratorError::AlreadyRunning { .. }) => Ok(health),
            Err(e) => Err(e),
        }
    }

    /// Persist a terminal failure with structured detail.
    ///
    /// Used by the background scheduler when a spawned run errors out, so
    /// the flow never lingers as `Running`. Already-terminal flows are left
    /// untouched.
    #[instrument(skip(self, detail), err)]
    pub async fn record_terminal_failure(
        &self,
        flow_id: &FlowId,
        detail: ErrorDetail,
    ) -> Result<(), OrchestratorError> {
        let mut state = self.store.load(flow_id).await?;
        if state.master.status.is_terminal() {
            return Ok(());
        }
        state.mark_failed(detail)?;
        self.save_flag_write(&mut state).await?;
        Ok(())
    }

    /// Convert an error that escaped a controller run into persisted state.
    ///
    /// Only applies when the flow was left mid-run (`Running`): pre-run
    /// refusals (missing resume inputs, status checks) leave the persisted
    /// status untouched and must stay retryable.
    async fn fail_escaped_run(&self, state: &mut FlowState, error: &ControllerError) {
        if state.master.status != FlowStatus::Running {
            return;
        }
        let mut detail = ErrorDetail::msg(format!("execution error: {error}"));
        if let Some(phase) = &state.master.current_phase {
            detail = detail.in_phase(phase.clone());
        }
        if state.mark_failed(detail).is_ok() {
            if let Err(save_err) = self.save_flag_write(state).await {
                warn!(flow_id = %state.id(), error = %save_err, "could not persist escaped run failure");
            }
        }
    }

    fn check_status(
        &self,
        state: &FlowState,
        allowed: &[FlowStatus],
        expected: &'static str,
    ) -> Result<(), OrchestratorError> {
        if allowed.contains(&state.master.status) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidState {
                flow_id: state.id().clone(),
                status: state.master.status,
                expected,
            })
        }
    }

    /// Save a small metadata write, absorbing races with an active
    /// controller run by reloading and reapplying.
    async fn save_flag_write(&self, state: &mut FlowState) -> Result<(), OrchestratorError> {
        for _ in 0..3 {
            match self.store.save(state).await {
                Ok(()) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => {
                    let status = state.master.status;
                    let cancel_requested = state.master.cancel_requested;
                    let error = state.master.error.clone();
                    let mut fresh = self.store.load(state.id()).await?;
                    if fresh.master.status.is_terminal() {
                        // The run finished under us; nothing left to write.
                        *state = fresh;
                        return Ok(());
                    }
                    fresh.master.cancel_requested |= cancel_requested;
                    if status.is_terminal() {
                        fresh.master.status = status;
                        fresh.master.error = error;
                    }
                    *state = fresh;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.store.save(state).await.map_err(Into::into)
    }
}
