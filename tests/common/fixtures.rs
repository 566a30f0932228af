//! Shared construction helpers for the integration suite.

use std::sync::Arc;

use flowline::context::RequestContext;
use flowline::executor::ExecutorSet;
use flowline::orchestrator::FlowOrchestrator;
use flowline::recovery::StallThresholds;
use flowline::store::memory::InMemoryFlowStore;

use super::executors::{EchoExecutor, PausingExecutor};

pub fn test_ctx() -> RequestContext {
    RequestContext::new("tenant-a", "engagement-1", "user-1")
}

pub fn ctx_for(tenant: &str) -> RequestContext {
    RequestContext::new(tenant, "engagement-1", "user-1")
}

/// Executor set covering the standard `discovery` flow: pauses at
/// `map_fields` until `mappings` arrives, echoes everywhere else.
pub fn discovery_executors() -> ExecutorSet {
    ExecutorSet::new()
        .register("validate", EchoExecutor)
        .register("map_fields", PausingExecutor { requires: "mappings" })
        .register("cleanse", EchoExecutor)
        .register("build_inventory", EchoExecutor)
}

/// Orchestrator on a fresh in-memory store, returning the concrete store
/// for white-box assertions.
pub fn orchestrator_with(
    executors: ExecutorSet,
) -> (Arc<FlowOrchestrator>, Arc<InMemoryFlowStore>) {
    let store = Arc::new(InMemoryFlowStore::new());
    let orchestrator = FlowOrchestrator::builder()
        .with_store(store.clone())
        .with_executors(executors)
        .with_thresholds(StallThresholds::default())
        .build()
        .expect("orchestrator builds");
    (Arc::new(orchestrator), store)
}
