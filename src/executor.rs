//! Phase executor contract.
//!
//! The engine treats the work performed inside a phase as opaque: reasoning,
//! agent calls, document parsing all live behind [`PhaseExecutor`]. The only
//! dependency the engine takes is the [`PhaseExecution`] result contract.
//!
//! # Idempotency requirement
//!
//! A phase may be re-invoked after a partial prior attempt (retry after a
//! timeout, stall recovery re-running a phase whose artifacts went missing).
//! Executors must therefore upsert downstream effects keyed by
//! `(flow_id, phase)` — re-running a phase must never duplicate artifacts.
//!
//! # Examples
//!
//! ```rust
//! use async_trait::async_trait;
//! use flowline::executor::{ExecutorError, PhaseExecution, PhaseExecutor, PhaseInput};
//! use serde_json::json;
//!
//! struct Validate;
//!
//! #[async_trait]
//! impl PhaseExecutor for Validate {
//!     async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
//!         if input.state.get("data_ref").is_none() {
//!             return Err(ExecutorError::Validation("data_ref is required".into()));
//!         }
//!         Ok(PhaseExecution::success(json!({"validated": true})))
//!     }
//! }
//! ```

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{FlowId, PhaseStatus};

/// Input handed to a phase executor.
#[derive(Clone, Debug)]
pub struct PhaseInput {
    /// Flow being executed; part of the executor's upsert key.
    pub flow_id: FlowId,
    /// Phase name; the other half of the upsert key.
    pub phase: String,
    /// 1-based attempt counter; identical `state` across attempts.
    pub attempt: u32,
    /// Merged flow state: initial fields plus every recorded delta, in
    /// append order, plus any user input merged on resume.
    pub state: Value,
}

/// Result contract returned by a phase executor.
///
/// Constructed through [`success`](Self::success), [`paused`](Self::paused),
/// [`skipped`](Self::skipped), or [`failed`](Self::failed).
#[derive(Clone, Debug)]
pub struct PhaseExecution {
    /// Outcome of this execution.
    pub status: PhaseStatus,
    /// Optional forward jump target; `None` advances sequentially.
    pub next_phase: Option<String>,
    /// Whether the flow must pause for user input before continuing.
    pub requires_user_input: bool,
    /// State delta appended to `phase_state` (a JSON object).
    pub delta: Value,
    /// Human-readable error detail for failed executions.
    pub error: Option<String>,
}

impl PhaseExecution {
    /// Successful execution with a state delta.
    #[must_use]
    pub fn success(delta: Value) -> Self {
        Self {
            status: PhaseStatus::Succeeded,
            next_phase: None,
            requires_user_input: false,
            delta,
            error: None,
        }
    }

    /// Execution that parks the flow awaiting user input at this phase.
    ///
    /// `delta` typically carries what the user needs to see to answer
    /// (e.g. proposed field mappings awaiting confirmation).
    #[must_use]
    pub fn paused(delta: Value) -> Self {
        Self {
            status: PhaseStatus::Paused,
            next_phase: None,
            requires_user_input: true,
            delta,
            error: None,
        }
    }

    /// Phase skipped on an upstream signal; treated as success.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            status: PhaseStatus::Skipped,
            next_phase: None,
            requires_user_input: false,
            delta: Value::Null,
            error: None,
        }
    }

    /// Failed execution with detail.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::Failed,
            next_phase: None,
            requires_user_input: false,
            delta: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Request a forward jump instead of the sequential next phase.
    #[must_use]
    pub fn with_next_phase(mut self, phase: impl Into<String>) -> Self {
        self.next_phase = Some(phase.into());
        self
    }
}

/// Opaque capability executing one phase.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Execute the phase against the merged flow state.
    ///
    /// Transient conditions (rate limits, flaky upstreams) should surface as
    /// [`ExecutorError::Transient`] so the controller can retry with
    /// identical input; anything unrecoverable as [`ExecutorError::Fatal`].
    async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError>;
}

/// Errors raised by phase executors.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    /// Bad input; never retried.
    #[error("phase input validation failed: {0}")]
    #[diagnostic(
        code(flowline::executor::validation),
        help("Check the required inputs declared on the phase definition.")
    )]
    Validation(String),

    /// Transient failure; retried per the phase retry policy.
    #[error("transient execution failure: {message}")]
    #[diagnostic(code(flowline::executor::transient))]
    Transient { message: String },

    /// Unrecoverable failure; short-circuits remaining retry budget.
    #[error("fatal execution failure: {message}")]
    #[diagnostic(code(flowline::executor::fatal))]
    Fatal { message: String },

    /// JSON (de)serialization failure inside an executor.
    #[error(transparent)]
    #[diagnostic(code(flowline::executor::serde))]
    Serde(#[from] serde_json::Error),
}

impl ExecutorError {
    /// Convenience constructor for transient failures.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Convenience constructor for fatal failures.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the controller may retry after this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Transient { .. })
    }
}

/// Phase-name → executor lookup handed to the controller.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    executors: FxHashMap<String, Arc<dyn PhaseExecutor>>,
}

impl std::fmt::Debug for ExecutorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSet")
            .field("phases", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutorSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a phase name (fan-out branches register
    /// under their branch names).
    #[must_use]
    pub fn register(
        mut self,
        phase: impl Into<String>,
        executor: impl PhaseExecutor + 'static,
    ) -> Self {
        self.executors.insert(phase.into(), Arc::new(executor));
        self
    }

    /// Look up the executor for a phase.
    #[must_use]
    pub fn resolve(&self, phase: &str) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors.get(phase).cloned()
    }
}
