//! Background execution: run a flow off the request path.
//!
//! [`schedule`] snapshots the ambient request context, spawns a task, and
//! reinstalls the snapshot inside it. The explicit snapshot is the point:
//! task-locals never cross into spawned tasks on their own, so without it
//! every store call in the background run would fail with a missing
//! context.
//!
//! A spawned run that errors out is converted into persisted flow state:
//! the scheduler records a terminal failure so pollers see `Failed` with
//! detail instead of a flow stuck at `Running`. Pre-run refusals are
//! logged and dropped instead: an [`AlreadyRunning`] flow is owned by the
//! earlier run, and an [`InvalidState`] flow never started executing, so
//! its persisted status stands.
//!
//! [`AlreadyRunning`]: crate::orchestrator::OrchestratorError::AlreadyRunning
//! [`InvalidState`]: crate::orchestrator::OrchestratorError::InvalidState

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{ContextError, RequestContext};
use crate::orchestrator::{FlowOrchestrator, OrchestratorError};
use crate::state::ErrorDetail;
use crate::types::FlowId;

/// Handle to a background flow run.
#[derive(Debug)]
pub struct ScheduledRun {
    pub flow_id: FlowId,
    /// Join handle for tests and graceful shutdown; detaching is fine.
    pub handle: JoinHandle<()>,
}

/// Spawn a background task driving the flow to its next stopping point.
///
/// Returns as soon as the task is spawned; callers poll
/// [`FlowOrchestrator::get_status`] for progress.
pub fn schedule(
    orchestrator: Arc<FlowOrchestrator>,
    flow_id: FlowId,
) -> Result<ScheduledRun, ContextError> {
    let snapshot = RequestContext::current()?;
    let id = flow_id.clone();
    let handle = tokio::spawn(snapshot.scope(async move {
        match orchestrator.execute(&id).await {
            Ok(outcome) => {
                info!(flow_id = %id, status = %outcome.status, "background run finished");
            }
            Err(OrchestratorError::AlreadyRunning { .. }) => {
                debug!(flow_id = %id, "flow already being driven; dropping duplicate run");
            }
            Err(OrchestratorError::InvalidState { status, .. }) => {
                debug!(flow_id = %id, %status, "flow is not executable; dropping scheduled run");
            }
            Err(e) => {
                warn!(flow_id = %id, error = %e, "background run failed");
                let detail = ErrorDetail::msg(format!("background execution failed: {e}"));
                // Best effort: the flow may already be terminal.
                if let Err(record_err) = orchestrator.record_terminal_failure(&id, detail).await {
                    warn!(flow_id = %id, error = %record_err, "could not record terminal failure");
                }
            }
        }
    }));
    Ok(ScheduledRun { flow_id, handle })
}
