//! # Flowline: Tenant-Isolated Flow Orchestration Engine
//!
//! Flowline drives long-running, multi-phase analysis flows (data
//! discovery, collection, assessment) through declared phase sequences with
//! durable pause/resume, background execution, cooperative cancellation,
//! and stall recovery. Every operation runs inside an ambient tenant scope;
//! storage is tenant-filtered on every access.
//!
//! ## Core Concepts
//!
//! - **Flow**: One aggregate persisted as two linked records (master
//!   lifecycle + child domain fields) sharing a single id
//! - **Phase**: A named step executed by an opaque [`PhaseExecutor`];
//!   phases can pause for user input, be skipped, retried, or fanned out
//! - **Registry**: Static catalog of flow types and their phase order
//! - **Controller**: The state machine advancing a flow phase by phase
//! - **Orchestrator**: The façade hosts call: create, execute, resume,
//!   status, cancel, recover
//!
//! ## Quick Start
//!
//! ### Defining a Phase Executor
//!
//! ```
//! use flowline::executor::{PhaseExecution, PhaseExecutor, PhaseInput, ExecutorError};
//! use async_trait::async_trait;
//! use serde_json::json;
//!
//! struct ValidateData;
//!
//! #[async_trait]
//! impl PhaseExecutor for ValidateData {
//!     async fn run(&self, input: PhaseInput) -> Result<PhaseExecution, ExecutorError> {
//!         let rows = input.state.get("data_ref").is_some();
//!         if !rows {
//!             return Err(ExecutorError::fatal("no data_ref in flow state"));
//!         }
//!         Ok(PhaseExecution::success(json!({"validated": true})))
//!     }
//! }
//! ```
//!
//! ### Running a Flow
//!
//! ```no_run
//! use flowline::context::RequestContext;
//! use flowline::orchestrator::FlowOrchestrator;
//! use flowline::store::memory::InMemoryFlowStore;
//! use flowline::executor::ExecutorSet;
//! use std::sync::Arc;
//! use serde_json::json;
//!
//! # async fn demo() -> miette::Result<()> {
//! let orchestrator = Arc::new(
//!     FlowOrchestrator::builder()
//!         .with_store(Arc::new(InMemoryFlowStore::new()))
//!         .with_executors(ExecutorSet::new())
//!         .build()?,
//! );
//!
//! // Every operation needs an ambient request context.
//! let ctx = RequestContext::new("tenant-a", "engagement-1", "user-1");
//! let orch = Arc::clone(&orchestrator);
//! ctx.scope(async move {
//!     let flow_id = orch
//!         .create_flow("discovery", json!({"data_ref": "upload-42"}))
//!         .await?;
//!     let outcome = orch.execute(&flow_id).await?;
//!     println!("flow ended as {}", outcome.status);
//!     Ok::<_, flowline::orchestrator::OrchestratorError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Background Execution
//!
//! Spawned tasks never inherit the request context; [`scheduler::schedule`]
//! snapshots it explicitly and reinstalls it inside the task:
//!
//! ```ignore
//! let run = flowline::scheduler::schedule(Arc::clone(&orchestrator), flow_id)?;
//! // ...poll orchestrator.get_status(&run.flow_id) from the request path.
//! ```
//!
//! ## Error Handling
//!
//! Every layer exposes a `thiserror` + `miette` enum with diagnostic codes
//! (`flowline::store::version_conflict`, `flowline::context::missing`, ...).
//! Phase failures are *state*, not errors: a failed phase marks the flow
//! `Failed` with structured detail and surfaces through status polling.
//!
//! ## Module Guide
//!
//! - [`types`] - Flow ids and status enums with canonical encodings
//! - [`context`] - Ambient tenant/request context (task-local)
//! - [`registry`] - Flow type catalog, phase definitions, retry policies
//! - [`executor`] - Phase executor contract and result types
//! - [`state`] - The two-record flow aggregate and its transitions
//! - [`store`] - Storage trait plus in-memory and SQLite backends
//! - [`controller`] - Phase-by-phase execution state machine
//! - [`orchestrator`] - The engine façade
//! - [`scheduler`] - Off-request-path background runs
//! - [`recovery`] - Zombie classification and stall thresholds
//! - [`config`] - Backend and threshold configuration
//! - [`telemetry`] - Tracing subscriber setup

pub mod config;
pub mod context;
pub mod controller;
pub mod executor;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use context::RequestContext;
pub use controller::{CancelFlag, RunOutcome};
pub use executor::{ExecutorSet, PhaseExecution, PhaseExecutor, PhaseInput};
pub use orchestrator::{FlowOrchestrator, FlowOutcome, OrchestratorError};
pub use registry::FlowRegistry;
pub use types::{FlowId, FlowStatus, PhaseStatus};
