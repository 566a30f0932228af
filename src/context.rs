//! Ambient multi-tenant request context.
//!
//! Every operation in Flowline executes on behalf of exactly one
//! (tenant, engagement, user) triple. Rather than threading that triple
//! through every function signature, it is installed as a task-local
//! carrier for the duration of one logical execution unit and read back
//! wherever persistence needs a tenant filter.
//!
//! Two rules are load-bearing:
//!
//! 1. **Absence is fatal.** [`RequestContext::current`] fails with
//!    [`ContextError::Missing`] when no context is installed. Store
//!    implementations call it before every query; there is no code path
//!    that silently runs unscoped.
//! 2. **No implicit crossing.** A task-local does not follow `tokio::spawn`.
//!    Every independently scheduled unit (the background scheduler, fan-out
//!    branches) must capture a snapshot with [`RequestContext::current`] and
//!    re-install it via [`RequestContext::scope`] on the new task.
//!
//! # Examples
//!
//! ```rust
//! use flowline::context::RequestContext;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let ctx = RequestContext::new("tenant-a", "engagement-1", "user-7");
//! let tenant = ctx
//!     .clone()
//!     .scope(async { RequestContext::current().unwrap().tenant_id })
//!     .await;
//! assert_eq!(tenant, "tenant-a");
//!
//! // Outside a scope there is no ambient context.
//! assert!(RequestContext::current().is_err());
//! # }
//! ```

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// The ambient (tenant, engagement, user) triple plus a per-request id.
///
/// Not a persisted entity: the tenant scope is copied onto flow records at
/// creation time and compared against on every later access.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Client-account identifier owning all touched records.
    pub tenant_id: String,
    /// Engagement within the tenant; part of the mandatory store filter.
    pub engagement_id: String,
    /// Acting user, carried for attribution.
    pub user_id: String,
    /// Correlates log lines across the request and any spawned work.
    pub request_id: String,
}

impl RequestContext {
    /// Create a context with a freshly generated request id.
    pub fn new(
        tenant_id: impl Into<String>,
        engagement_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            engagement_id: engagement_id.into(),
            user_id: user_id.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Snapshot the context installed for the current execution unit.
    ///
    /// # Errors
    ///
    /// [`ContextError::Missing`] when called outside a [`scope`](Self::scope).
    /// That is always an integration bug, never a recoverable condition.
    pub fn current() -> Result<RequestContext, ContextError> {
        REQUEST_CONTEXT
            .try_with(|ctx| ctx.clone())
            .map_err(|_| ContextError::Missing)
    }

    /// Like [`current`](Self::current) but for call sites where absence is
    /// an expected possibility (e.g. telemetry enrichment).
    #[must_use]
    pub fn try_current() -> Option<RequestContext> {
        REQUEST_CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }

    /// Install this context for the duration of `fut`.
    ///
    /// Scopes nest; the innermost installation wins, and the previous one is
    /// restored when `fut` completes.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        REQUEST_CONTEXT.scope(self, fut).await
    }

    /// Synchronous variant of [`scope`](Self::scope) for call sites with no
    /// await point of their own.
    pub fn scope_sync<T>(self, f: impl FnOnce() -> T) -> T {
        REQUEST_CONTEXT.sync_scope(self, f)
    }
}

/// Errors raised by the ambient context carrier.
#[derive(Debug, Error, Diagnostic)]
pub enum ContextError {
    /// No context installed for the current execution unit.
    #[error("no request context installed for this execution unit")]
    #[diagnostic(
        code(flowline::context::missing),
        help(
            "Wrap the call in RequestContext::scope(...). Spawned tasks never \
             inherit a context; capture one with RequestContext::current() and \
             re-install it on the new task."
        )
    )]
    Missing,
}
