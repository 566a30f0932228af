//! The two-record flow aggregate.
//!
//! One flow instance is persisted as two linked records sharing a single
//! [`FlowId`]: the [`MasterRecord`] (lifecycle, phase state, concurrency
//! token) and the [`ChildRecord`] (flow-type-specific fields and per-phase
//! completion flags). [`FlowState`] is the in-memory aggregate of both; the
//! store writes them atomically so neither can exist without the other.
//!
//! `phase_state` is append-only: a phase's record may be updated in place
//! across retry attempts, but records are never removed, so a resumed flow
//! always sees its full history.
//!
//! Status and `current_phase` mutate only through the checked `mark_*` /
//! `begin_phase` methods, which reject invalid transitions with
//! [`StateError`] — the same guard style a flow instance aggregate uses in
//! any state-machine-driven engine.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::RequestContext;
use crate::registry::FlowTypeConfig;
use crate::types::{FlowId, FlowStatus, PhaseStatus};
use crate::utils::json_ext::deep_merge;

/// Structured error detail persisted with failed phases and failed flows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Human-readable summary.
    pub message: String,
    /// Phase the failure originated in, when attributable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Free-form structured context (attempt counts, upstream codes).
    #[serde(default)]
    pub details: Value,
}

impl ErrorDetail {
    /// Detail with just a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            phase: None,
            details: Value::Null,
        }
    }

    /// Attribute the failure to a phase.
    #[must_use]
    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    /// Attach structured context.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.phase {
            Some(phase) => write!(f, "{} (phase {phase})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// One entry in the append-only `phase_state` map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Latest outcome for this phase.
    pub status: PhaseStatus,
    /// Attempts consumed so far (1-based once executed).
    pub attempts: u32,
    /// Whether the flow paused here awaiting user input.
    pub requires_user_input: bool,
    /// State delta produced by the phase (JSON object, possibly null).
    #[serde(default)]
    pub delta: Value,
    /// User input merged on resume, kept for auditability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input: Option<Value>,
    /// Failure detail when status is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Append order across the whole map; drives merge order.
    pub sequence: u32,
    /// First execution start.
    pub started_at: DateTime<Utc>,
    /// Completion time of the latest attempt, when finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    /// Whether this phase needs no further execution.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status.is_complete()
    }

    /// Whether the recorded delta carries any artifact.
    #[must_use]
    pub fn has_artifacts(&self) -> bool {
        match &self.delta {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }
}

/// Master record: lifecycle, tenant scope, phase state, version token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    /// Shared identifier of the aggregate.
    pub id: FlowId,
    /// Flow type resolved against the registry.
    pub flow_type: String,
    /// Lifecycle status; mutated only via the controller.
    pub status: FlowStatus,
    /// Phase currently (or last) under execution.
    pub current_phase: Option<String>,
    /// Owning client account; mandatory store filter.
    pub tenant_id: String,
    /// Owning engagement; mandatory store filter.
    pub engagement_id: String,
    /// Append-only map of phase name → record.
    pub phase_state: FxHashMap<String, PhaseRecord>,
    /// Terminal failure detail, set when status is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Cooperative cancellation flag checked between phases.
    pub cancel_requested: bool,
    /// Optimistic-concurrency token; bumped by every successful save.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last durable write.
    pub updated_at: DateTime<Utc>,
}

/// Child record: flow-type-specific fields and completion flags.
///
/// Shares its id with the master (the 1:1 invariant); written in the same
/// transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    /// Same identifier as the master record.
    pub id: FlowId,
    /// Redundant with the master; kept for standalone queries on the child.
    pub flow_type: String,
    /// Flow-type-specific fields, seeded from `initial_state`.
    pub fields: FxHashMap<String, Value>,
    /// Per-phase completion flags (the "completion signal" the stall
    /// monitor compares against recorded artifacts).
    pub phase_complete: FxHashMap<String, bool>,
    /// Last durable write.
    pub updated_at: DateTime<Utc>,
}

/// In-memory aggregate of the two records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    /// Lifecycle record.
    pub master: MasterRecord,
    /// Domain-extension record.
    pub child: ChildRecord,
}

/// Invalid lifecycle transitions.
#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    /// The requested transition is not legal from the current status.
    #[error("cannot {action} a flow in status {from}")]
    #[diagnostic(
        code(flowline::state::invalid_transition),
        help("Reload the flow and check its status; terminal flows never transition again.")
    )]
    InvalidTransition {
        from: FlowStatus,
        action: &'static str,
    },
}

impl FlowState {
    /// Build a fresh aggregate under the given context scope.
    ///
    /// `initial_state` must be a JSON object; its entries seed the child
    /// record's flow-type-specific fields.
    pub fn new(flow_type: impl Into<String>, ctx: &RequestContext, initial_state: &Value) -> Self {
        let flow_type = flow_type.into();
        let id = FlowId::generate();
        let now = Utc::now();
        let fields: FxHashMap<String, Value> = initial_state
            .as_object()
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self {
            master: MasterRecord {
                id: id.clone(),
                flow_type: flow_type.clone(),
                status: FlowStatus::NotStarted,
                current_phase: None,
                tenant_id: ctx.tenant_id.clone(),
                engagement_id: ctx.engagement_id.clone(),
                phase_state: FxHashMap::default(),
                error: None,
                cancel_requested: false,
                version: 1,
                created_at: now,
                updated_at: now,
            },
            child: ChildRecord {
                id,
                flow_type,
                fields,
                phase_complete: FxHashMap::default(),
                updated_at: now,
            },
        }
    }

    /// Shared identifier of the aggregate.
    #[must_use]
    pub fn id(&self) -> &FlowId {
        &self.master.id
    }

    fn touch(&mut self) {
        let now = Utc::now();
        self.master.updated_at = now;
        self.child.updated_at = now;
    }

    /* ---------- lifecycle transitions (controller-only) ---------- */

    /// Enter `Running` at the given phase.
    pub fn begin_phase(&mut self, phase: &str) -> Result<(), StateError> {
        if self.master.status.is_terminal() {
            return Err(StateError::InvalidTransition {
                from: self.master.status,
                action: "execute",
            });
        }
        self.master.status = FlowStatus::Running;
        self.master.current_phase = Some(phase.to_string());
        self.touch();
        Ok(())
    }

    /// Park the flow at the given phase awaiting user input.
    pub fn mark_paused(&mut self, phase: &str) -> Result<(), StateError> {
        if self.master.status != FlowStatus::Running {
            return Err(StateError::InvalidTransition {
                from: self.master.status,
                action: "pause",
            });
        }
        self.master.status = FlowStatus::Paused;
        self.master.current_phase = Some(phase.to_string());
        self.touch();
        Ok(())
    }

    /// Complete the flow.
    pub fn mark_completed(&mut self) -> Result<(), StateError> {
        if self.master.status != FlowStatus::Running {
            return Err(StateError::InvalidTransition {
                from: self.master.status,
                action: "complete",
            });
        }
        self.master.status = FlowStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Fail the flow terminally with structured detail.
    pub fn mark_failed(&mut self, detail: ErrorDetail) -> Result<(), StateError> {
        if self.master.status.is_terminal() {
            return Err(StateError::InvalidTransition {
                from: self.master.status,
                action: "fail",
            });
        }
        self.master.status = FlowStatus::Failed;
        self.master.error = Some(detail);
        self.touch();
        Ok(())
    }

    /// Cancel the flow (cooperative; called between phases).
    pub fn mark_cancelled(&mut self) -> Result<(), StateError> {
        if self.master.status.is_terminal() {
            return Err(StateError::InvalidTransition {
                from: self.master.status,
                action: "cancel",
            });
        }
        self.master.status = FlowStatus::Cancelled;
        self.touch();
        Ok(())
    }

    /* ---------- phase_state bookkeeping ---------- */

    /// Upsert the record for `phase`.
    ///
    /// First write appends a record with the next sequence number; later
    /// writes (retries, resume) update the record in place without touching
    /// its position in the append order.
    pub fn record_phase(&mut self, phase: &str, record_status: PhaseStatus, delta: Value) {
        let next_seq = self
            .master
            .phase_state
            .values()
            .map(|r| r.sequence)
            .max()
            .map_or(1, |s| s + 1);
        let now = Utc::now();
        let record = self
            .master
            .phase_state
            .entry(phase.to_string())
            .or_insert_with(|| PhaseRecord {
                status: record_status,
                attempts: 0,
                requires_user_input: false,
                delta: Value::Null,
                user_input: None,
                error: None,
                sequence: next_seq,
                started_at: now,
                finished_at: None,
            });
        record.status = record_status;
        record.attempts += 1;
        record.requires_user_input = record_status == PhaseStatus::Paused;
        record.delta = delta;
        record.finished_at = record_status.is_complete().then_some(now);
        if record_status.is_complete() {
            self.child.phase_complete.insert(phase.to_string(), true);
        }
        self.touch();
    }

    /// Overwrite the attempt counter for a phase record.
    ///
    /// Used when the controller consumed several attempts inside one run
    /// (transient retries) and recorded only the final outcome.
    pub fn set_phase_attempts(&mut self, phase: &str, attempts: u32) {
        if let Some(record) = self.master.phase_state.get_mut(phase) {
            record.attempts = attempts;
        }
    }

    /// Attach a failure detail to an existing phase record.
    pub fn record_phase_error(&mut self, phase: &str, detail: ErrorDetail) {
        if let Some(record) = self.master.phase_state.get_mut(phase) {
            record.error = Some(detail);
        }
        self.touch();
    }

    /// Merge user input into the paused phase record (kept for audit) and
    /// clear its pause marker so the controller can re-enter the phase.
    pub fn merge_user_input(&mut self, phase: &str, user_input: Value) {
        if let Some(record) = self.master.phase_state.get_mut(phase) {
            record.user_input = Some(match record.user_input.take() {
                Some(prior) => deep_merge(&prior, &user_input),
                None => user_input,
            });
            record.requires_user_input = false;
        }
        self.touch();
    }

    /* ---------- derived views ---------- */

    /// Merged executor input: child fields, then every recorded delta in
    /// append order, then any recorded user input (later writes win).
    #[must_use]
    pub fn merged_state(&self) -> Value {
        let mut merged = Value::Object(
            self.child
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        );
        let mut records: Vec<&PhaseRecord> = self.master.phase_state.values().collect();
        records.sort_by_key(|r| r.sequence);
        for record in records {
            if record.delta.is_object() {
                merged = deep_merge(&merged, &record.delta);
            }
            if let Some(user_input) = &record.user_input {
                merged = deep_merge(&merged, user_input);
            }
        }
        merged
    }

    /// Index of the first phase without a complete record, per the declared
    /// order. `None` when every phase is done.
    ///
    /// Completion is judged on the master's phase records, never on the
    /// child completion flags — flags are a signal, records are the truth.
    #[must_use]
    pub fn first_incomplete_phase(&self, config: &FlowTypeConfig) -> Option<usize> {
        config.phases.iter().position(|def| {
            !self
                .master
                .phase_state
                .get(&def.name)
                .is_some_and(PhaseRecord::is_complete)
        })
    }

    /// Completion signal in percent, derived from the child's flags.
    #[must_use]
    pub fn progress_pct(&self, config: &FlowTypeConfig) -> u8 {
        let total = config.phases.len();
        if total == 0 {
            return 100;
        }
        let complete = config
            .phases
            .iter()
            .filter(|def| self.child.phase_complete.get(&def.name).copied().unwrap_or(false))
            .count();
        ((complete * 100) / total) as u8
    }

    /// Read-only projection for polling clients.
    #[must_use]
    pub fn status_view(&self, config: &FlowTypeConfig) -> FlowStatusView {
        let mut phases: Vec<(&String, &PhaseRecord)> = self.master.phase_state.iter().collect();
        phases.sort_by_key(|(_, r)| r.sequence);
        let resume_inputs = match (&self.master.status, &self.master.current_phase) {
            (FlowStatus::Paused, Some(phase)) => config
                .phase(phase)
                .map(|def| def.required_inputs.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        FlowStatusView {
            flow_id: self.master.id.clone(),
            flow_type: self.master.flow_type.clone(),
            status: self.master.status,
            current_phase: self.master.current_phase.clone(),
            requires_user_input: self.master.status == FlowStatus::Paused,
            resume_inputs,
            progress_pct: self.progress_pct(config),
            error: self.master.error.clone(),
            phases: phases
                .into_iter()
                .map(|(name, record)| PhaseSummary {
                    name: name.clone(),
                    status: record.status,
                    attempts: record.attempts,
                    requires_user_input: record.requires_user_input,
                })
                .collect(),
        }
    }
}

/// Read-only status projection returned by `get_status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowStatusView {
    pub flow_id: FlowId,
    pub flow_type: String,
    pub status: FlowStatus,
    pub current_phase: Option<String>,
    /// Set when the flow is paused awaiting input.
    pub requires_user_input: bool,
    /// Minimal schema needed to resume (required inputs of the paused phase).
    pub resume_inputs: Vec<String>,
    pub progress_pct: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Executed phases in append order (a subset of `phase_state`).
    pub phases: Vec<PhaseSummary>,
}

/// Per-phase line of the status projection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub name: String,
    pub status: PhaseStatus,
    pub attempts: u32,
    pub requires_user_input: bool,
}
