//! Persistence layer for the two-record flow aggregate.
//!
//! [`FlowStore`] is the seam between the engine and storage. Implementations
//! must uphold three contracts:
//!
//! 1. **Atomic aggregate writes**: `create` persists master, child, and any
//!    linked records in one transaction; on failure nothing is written.
//! 2. **Optimistic concurrency**: `save` succeeds only when the stored
//!    version still equals the version the caller loaded, then bumps it.
//!    A lost race surfaces as [`StoreError::VersionConflict`].
//! 3. **Tenant isolation**: every method resolves the ambient
//!    [`RequestContext`](crate::context::RequestContext) and filters on its
//!    tenant and engagement. A row that exists under another tenant is
//!    reported as [`StoreError::CrossTenant`] and audited, never returned.
//!
//! Two backends ship: [`memory::InMemoryFlowStore`] for tests and embedded
//! use, and [`sqlite::SqliteFlowStore`] (feature `sqlite`) for durability.

pub mod memory;
pub mod models;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::context::ContextError;
use crate::state::FlowState;
use crate::types::FlowId;

/// An extra record persisted in the same transaction as flow creation.
///
/// Lets callers attach bookkeeping rows (audit entries, outbox messages)
/// that must not exist unless the flow does.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkedWrite {
    /// Record category, e.g. `"audit"`.
    pub kind: String,
    /// Caller-chosen key, unique within the kind.
    pub key: String,
    /// Arbitrary payload.
    pub payload: Value,
}

impl LinkedWrite {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            payload,
        }
    }
}

/// Errors surfaced by store implementations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// No flow with this id is visible to the current tenant.
    #[error("flow not found: {flow_id}")]
    #[diagnostic(code(flowline::store::not_found))]
    NotFound { flow_id: FlowId },

    /// The flow exists but belongs to another tenant or engagement.
    #[error("flow {flow_id} is not accessible from the current tenant scope")]
    #[diagnostic(
        code(flowline::store::cross_tenant),
        help("Cross-tenant access attempts are audited; check the ambient request context.")
    )]
    CrossTenant { flow_id: FlowId },

    /// The aggregate changed since it was loaded.
    #[error("flow {flow_id} was modified concurrently (loaded version {expected}, stored {actual})")]
    #[diagnostic(
        code(flowline::store::version_conflict),
        help("Reload the flow and reapply the change.")
    )]
    VersionConflict {
        flow_id: FlowId,
        expected: u64,
        actual: u64,
    },

    /// No ambient request context is installed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    MissingContext(#[from] ContextError),

    /// Backend-specific failure (connection, transaction, constraint).
    #[error("storage backend error: {message}")]
    #[diagnostic(code(flowline::store::backend))]
    Backend { message: String },

    /// Persisted payload could not be (de)serialized.
    #[error("persisted flow payload is invalid: {source}")]
    #[diagnostic(code(flowline::store::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Storage contract for flow aggregates.
///
/// All methods are tenant-scoped through the ambient request context; callers
/// never pass tenant ids explicitly.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Atomically persist a new aggregate plus any linked records.
    ///
    /// Fails if a flow with the same id already exists.
    async fn create(&self, state: &FlowState, linked: &[LinkedWrite]) -> Result<FlowId, StoreError>;

    /// Load an aggregate visible to the current tenant scope.
    async fn load(&self, flow_id: &FlowId) -> Result<FlowState, StoreError>;

    /// Persist both records, enforcing the version token.
    ///
    /// On success the version in `state` is bumped to match storage.
    async fn save(&self, state: &mut FlowState) -> Result<(), StoreError>;

    /// Id of the non-terminal flow of this type in the current scope, if any.
    async fn find_active(&self, flow_type: &str) -> Result<Option<FlowId>, StoreError>;

    /// Ids of every flow in the current scope, oldest first.
    async fn list(&self) -> Result<Vec<FlowId>, StoreError>;

    /// Delete an aggregate and its linked records.
    async fn purge(&self, flow_id: &FlowId) -> Result<(), StoreError>;
}
