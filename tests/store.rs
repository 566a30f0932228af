//! Store contract tests against the in-memory backend: atomic aggregate
//! creation, optimistic concurrency, and tenant isolation.

mod common;

use common::fixtures::{ctx_for, test_ctx};
use flowline::state::FlowState;
use flowline::store::memory::InMemoryFlowStore;
use flowline::store::{FlowStore, LinkedWrite, StoreError};
use flowline::types::FlowStatus;
use serde_json::json;

fn new_state() -> FlowState {
    FlowState::new("discovery", &test_ctx(), &json!({"data_ref": "upload-1"}))
}

#[tokio::test]
async fn create_persists_both_records_and_linked_writes() {
    let store = InMemoryFlowStore::new();
    let state = new_state();
    let linked = [LinkedWrite::new("audit", "created", json!({"by": "user-1"}))];

    let flow_id = test_ctx()
        .scope(async { store.create(&state, &linked).await })
        .await
        .unwrap();

    let loaded = test_ctx()
        .scope(async { store.load(&flow_id).await })
        .await
        .unwrap();
    assert_eq!(loaded.master.id, loaded.child.id);
    assert_eq!(loaded.child.fields["data_ref"], json!("upload-1"));
    assert_eq!(store.linked_records(&flow_id), vec![json!({"by": "user-1"})]);
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let store = InMemoryFlowStore::new();
    let state = new_state();
    test_ctx()
        .scope(async {
            store.create(&state, &[]).await.unwrap();
            let err = store.create(&state, &[]).await.unwrap_err();
            assert!(matches!(err, StoreError::Backend { .. }));
        })
        .await;
}

#[tokio::test]
async fn save_bumps_version_and_detects_conflicts() {
    let store = InMemoryFlowStore::new();
    let state = new_state();
    test_ctx()
        .scope(async {
            let flow_id = store.create(&state, &[]).await.unwrap();

            let mut copy_a = store.load(&flow_id).await.unwrap();
            let mut copy_b = store.load(&flow_id).await.unwrap();
            assert_eq!(copy_a.master.version, 1);

            copy_a.begin_phase("validate").unwrap();
            store.save(&mut copy_a).await.unwrap();
            assert_eq!(copy_a.master.version, 2);

            copy_b.begin_phase("validate").unwrap();
            let err = store.save(&mut copy_b).await.unwrap_err();
            match err {
                StoreError::VersionConflict {
                    expected, actual, ..
                } => {
                    assert_eq!(expected, 1);
                    assert_eq!(actual, 2);
                }
                other => panic!("expected VersionConflict, got {other}"),
            }
        })
        .await;
}

#[tokio::test]
async fn cross_tenant_access_is_rejected_without_leaking_state() {
    let store = InMemoryFlowStore::new();
    let state = new_state();
    let flow_id = test_ctx()
        .scope(async { store.create(&state, &[]).await })
        .await
        .unwrap();

    // Another tenant sees a cross-tenant rejection, not the flow.
    let err = ctx_for("tenant-b")
        .scope(async { store.load(&flow_id).await })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CrossTenant { .. }));

    // Writes are rejected the same way.
    let mut stolen = state.clone();
    let err = ctx_for("tenant-b")
        .scope(async { store.save(&mut stolen).await })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CrossTenant { .. }));

    // The owner still reads it fine.
    let loaded = test_ctx()
        .scope(async { store.load(&flow_id).await })
        .await
        .unwrap();
    assert_eq!(loaded.master.status, FlowStatus::NotStarted);
}

#[tokio::test]
async fn every_method_requires_an_ambient_context() {
    let store = InMemoryFlowStore::new();
    let state = new_state();
    assert!(matches!(
        store.create(&state, &[]).await.unwrap_err(),
        StoreError::MissingContext(_)
    ));
    assert!(matches!(
        store.load(state.id()).await.unwrap_err(),
        StoreError::MissingContext(_)
    ));
    assert!(matches!(
        store.find_active("discovery").await.unwrap_err(),
        StoreError::MissingContext(_)
    ));
}

#[tokio::test]
async fn find_active_is_scoped_by_tenant_and_ignores_terminal_flows() {
    let store = InMemoryFlowStore::new();
    let state = new_state();
    test_ctx()
        .scope(async {
            let flow_id = store.create(&state, &[]).await.unwrap();
            assert_eq!(store.find_active("discovery").await.unwrap(), Some(flow_id.clone()));
            assert_eq!(store.find_active("assessment").await.unwrap(), None);

            let mut loaded = store.load(&flow_id).await.unwrap();
            loaded.begin_phase("validate").unwrap();
            loaded.mark_completed().unwrap();
            store.save(&mut loaded).await.unwrap();
            assert_eq!(store.find_active("discovery").await.unwrap(), None);
        })
        .await;

    // A different tenant never sees it, active or not.
    let seen = ctx_for("tenant-b")
        .scope(async { store.find_active("discovery").await })
        .await
        .unwrap();
    assert_eq!(seen, None);
}
