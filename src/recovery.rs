//! Stall detection and recovery classification.
//!
//! A flow is a *zombie* when its completion signal (the child record's
//! per-phase flags) claims substantial progress that the master record's
//! phase artifacts cannot back up, or when a `Running` flow has gone silent
//! past its staleness window. Classification is recomputed from fresh
//! records on every call; nothing is cached, so a flow that was repaired
//! since the last look immediately classifies healthy again.
//!
//! Recovery itself is handled by the orchestrator: it trusts the master's
//! phase records and re-enters the flow at its first incomplete phase, so
//! recovering an already-healthy flow is a no-op.

use chrono::{Duration, Utc};
use tracing::debug;

use crate::registry::FlowTypeConfig;
use crate::state::FlowState;
use crate::types::FlowStatus;

/// Tunable thresholds for zombie classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StallThresholds {
    /// Completion signal (percent) above which missing artifacts are
    /// suspicious rather than just "young flow".
    pub min_progress_pct: u8,
    /// Number of trailing complete-flagged phases that must lack records
    /// before the mismatch counts.
    pub empty_tail: usize,
    /// A `Running` flow with no durable write for this long is stalled.
    pub stale_after: std::time::Duration,
}

impl Default for StallThresholds {
    fn default() -> Self {
        Self {
            min_progress_pct: 60,
            empty_tail: 2,
            stale_after: std::time::Duration::from_secs(600),
        }
    }
}

/// Classification result for one flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowHealth {
    Healthy,
    /// The flow needs recovery; `reason` is for operators, not branching.
    Zombie { reason: String },
}

impl FlowHealth {
    #[must_use]
    pub fn is_zombie(&self) -> bool {
        matches!(self, FlowHealth::Zombie { .. })
    }
}

/// Stateless classifier applying [`StallThresholds`] to a flow aggregate.
#[derive(Clone, Copy, Debug, Default)]
pub struct StallMonitor {
    thresholds: StallThresholds,
}

impl StallMonitor {
    #[must_use]
    pub fn new(thresholds: StallThresholds) -> Self {
        Self { thresholds }
    }

    /// Classify a flow against its declared phase order.
    ///
    /// Terminal and paused flows are always healthy: a pause is a durable
    /// recorded status, not a stall.
    #[must_use]
    pub fn classify(&self, state: &FlowState, config: &FlowTypeConfig) -> FlowHealth {
        match state.master.status {
            FlowStatus::Paused => return FlowHealth::Healthy,
            s if s.is_terminal() => return FlowHealth::Healthy,
            _ => {}
        }

        let progress = state.progress_pct(config);
        if progress >= self.thresholds.min_progress_pct {
            // Count flagged-complete phases, from the end of the declared
            // order backwards, whose records are missing or artifact-free.
            let empty_tail = config
                .phases
                .iter()
                .rev()
                .filter(|def| {
                    state
                        .child
                        .phase_complete
                        .get(&def.name)
                        .copied()
                        .unwrap_or(false)
                })
                .take_while(|def| {
                    !state
                        .master
                        .phase_state
                        .get(&def.name)
                        .is_some_and(|r| r.is_complete() && r.has_artifacts())
                })
                .count();
            if empty_tail >= self.thresholds.empty_tail {
                debug!(
                    flow_id = %state.id(),
                    progress,
                    empty_tail,
                    "completion signal has no backing artifacts"
                );
                return FlowHealth::Zombie {
                    reason: format!(
                        "completion signal at {progress}% but {empty_tail} flagged phases have no artifacts"
                    ),
                };
            }
        }

        if state.master.status == FlowStatus::Running {
            let stale_after = Duration::from_std(self.thresholds.stale_after)
                .unwrap_or_else(|_| Duration::seconds(600));
            let silent_for = Utc::now() - state.master.updated_at;
            if silent_for > stale_after {
                return FlowHealth::Zombie {
                    reason: format!(
                        "running flow silent for {}s (threshold {}s)",
                        silent_for.num_seconds(),
                        stale_after.num_seconds()
                    ),
                };
            }
        }

        FlowHealth::Healthy
    }
}
