//! In-memory [`FlowStore`] for tests and embedded use.
//!
//! All mutation happens inside a single `parking_lot::Mutex` critical
//! section, which stands in for a database transaction: `create` inserts
//! master, child, and linked records under one lock hold, so a reader can
//! never observe a half-written aggregate.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::warn;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::state::{ChildRecord, FlowState, MasterRecord};
use crate::store::{FlowStore, LinkedWrite, StoreError};
use crate::types::FlowId;

#[derive(Default)]
struct MemoryInner {
    masters: FxHashMap<String, MasterRecord>,
    children: FxHashMap<String, ChildRecord>,
    linked: Vec<(String, LinkedWrite)>,
    /// Creation order, for stable `list` output.
    order: Vec<String>,
}

/// Non-durable store backed by process memory.
#[derive(Default)]
pub struct InMemoryFlowStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linked records persisted for a flow, for assertions in tests.
    #[must_use]
    pub fn linked_records(&self, flow_id: &FlowId) -> Vec<Value> {
        let inner = self.inner.lock();
        inner
            .linked
            .iter()
            .filter(|(id, _)| id == flow_id.as_str())
            .map(|(_, w)| w.payload.clone())
            .collect()
    }

    fn in_scope(master: &MasterRecord, ctx: &RequestContext) -> bool {
        master.tenant_id == ctx.tenant_id && master.engagement_id == ctx.engagement_id
    }
}

impl std::fmt::Debug for InMemoryFlowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("InMemoryFlowStore")
            .field("flows", &inner.masters.len())
            .finish()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn create(&self, state: &FlowState, linked: &[LinkedWrite]) -> Result<FlowId, StoreError> {
        let ctx = RequestContext::current()?;
        if !Self::in_scope(&state.master, &ctx) {
            return Err(StoreError::CrossTenant {
                flow_id: state.id().clone(),
            });
        }
        let key = state.id().as_str().to_string();
        let mut inner = self.inner.lock();
        if inner.masters.contains_key(&key) {
            return Err(StoreError::backend(format!(
                "flow {key} already exists"
            )));
        }
        // Single critical section: the aggregate appears all at once.
        inner.masters.insert(key.clone(), state.master.clone());
        inner.children.insert(key.clone(), state.child.clone());
        for write in linked {
            inner.linked.push((key.clone(), write.clone()));
        }
        inner.order.push(key);
        Ok(state.id().clone())
    }

    async fn load(&self, flow_id: &FlowId) -> Result<FlowState, StoreError> {
        let ctx = RequestContext::current()?;
        let inner = self.inner.lock();
        let master = inner
            .masters
            .get(flow_id.as_str())
            .ok_or_else(|| StoreError::NotFound {
                flow_id: flow_id.clone(),
            })?;
        if !Self::in_scope(master, &ctx) {
            warn!(
                target: "audit",
                flow_id = %flow_id,
                tenant_id = %ctx.tenant_id,
                owner_tenant = %master.tenant_id,
                "cross-tenant flow access rejected"
            );
            return Err(StoreError::CrossTenant {
                flow_id: flow_id.clone(),
            });
        }
        let child = inner
            .children
            .get(flow_id.as_str())
            .ok_or_else(|| StoreError::backend(format!("child record missing for {flow_id}")))?;
        Ok(FlowState {
            master: master.clone(),
            child: child.clone(),
        })
    }

    async fn save(&self, state: &mut FlowState) -> Result<(), StoreError> {
        let ctx = RequestContext::current()?;
        let key = state.id().as_str().to_string();
        let mut inner = self.inner.lock();
        let stored = inner
            .masters
            .get(&key)
            .ok_or_else(|| StoreError::NotFound {
                flow_id: state.id().clone(),
            })?;
        if !Self::in_scope(stored, &ctx) {
            warn!(
                target: "audit",
                flow_id = %state.id(),
                tenant_id = %ctx.tenant_id,
                owner_tenant = %stored.tenant_id,
                "cross-tenant flow write rejected"
            );
            return Err(StoreError::CrossTenant {
                flow_id: state.id().clone(),
            });
        }
        if stored.version != state.master.version {
            return Err(StoreError::VersionConflict {
                flow_id: state.id().clone(),
                expected: state.master.version,
                actual: stored.version,
            });
        }
        state.master.version += 1;
        inner.masters.insert(key.clone(), state.master.clone());
        inner.children.insert(key, state.child.clone());
        Ok(())
    }

    async fn find_active(&self, flow_type: &str) -> Result<Option<FlowId>, StoreError> {
        let ctx = RequestContext::current()?;
        let inner = self.inner.lock();
        for key in &inner.order {
            if let Some(master) = inner.masters.get(key) {
                if Self::in_scope(master, &ctx)
                    && master.flow_type == flow_type
                    && !master.status.is_terminal()
                {
                    return Ok(Some(master.id.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<FlowId>, StoreError> {
        let ctx = RequestContext::current()?;
        let inner = self.inner.lock();
        Ok(inner
            .order
            .iter()
            .filter_map(|key| inner.masters.get(key))
            .filter(|master| Self::in_scope(master, &ctx))
            .map(|master| master.id.clone())
            .collect())
    }

    async fn purge(&self, flow_id: &FlowId) -> Result<(), StoreError> {
        let ctx = RequestContext::current()?;
        let mut inner = self.inner.lock();
        let stored = inner
            .masters
            .get(flow_id.as_str())
            .ok_or_else(|| StoreError::NotFound {
                flow_id: flow_id.clone(),
            })?;
        if !Self::in_scope(stored, &ctx) {
            return Err(StoreError::CrossTenant {
                flow_id: flow_id.clone(),
            });
        }
        inner.masters.remove(flow_id.as_str());
        inner.children.remove(flow_id.as_str());
        inner.linked.retain(|(id, _)| id != flow_id.as_str());
        inner.order.retain(|id| id != flow_id.as_str());
        Ok(())
    }
}
