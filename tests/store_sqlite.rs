//! SQLite store tests: durable round-trips, version-checked saves, and
//! tenant filtering against a real database file.
#![cfg(feature = "sqlite")]

mod common;

use common::fixtures::{ctx_for, test_ctx};
use flowline::state::FlowState;
use flowline::store::sqlite::SqliteFlowStore;
use flowline::store::{FlowStore, LinkedWrite, StoreError};
use flowline::types::PhaseStatus;
use serde_json::json;

async fn temp_store() -> (SqliteFlowStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("flows.db").display());
    let store = SqliteFlowStore::connect(&url).await.expect("connect");
    (store, dir)
}

#[tokio::test]
async fn aggregate_round_trips_through_sqlite() {
    let (store, _dir) = temp_store().await;
    test_ctx()
        .scope(async {
            let mut state = FlowState::new("discovery", &test_ctx(), &json!({"data_ref": "x"}));
            state.begin_phase("validate").unwrap();
            state
                .record_phase("validate", PhaseStatus::Succeeded, json!({"rows": 10}));
            let linked = [LinkedWrite::new("audit", "created", json!({"by": "user-1"}))];
            let flow_id = store.create(&state, &linked).await.unwrap();

            let loaded = store.load(&flow_id).await.unwrap();
            assert_eq!(loaded, state);

            let mut update = loaded;
            update.record_phase("map_fields", PhaseStatus::Paused, json!({"proposal": []}));
            update.mark_paused("map_fields").unwrap();
            store.save(&mut update).await.unwrap();
            assert_eq!(update.master.version, 2);

            let reloaded = store.load(&flow_id).await.unwrap();
            assert_eq!(reloaded, update);
        })
        .await;
}

#[tokio::test]
async fn version_conflicts_are_detected_across_copies() {
    let (store, _dir) = temp_store().await;
    test_ctx()
        .scope(async {
            let state = FlowState::new("discovery", &test_ctx(), &json!({}));
            let flow_id = store.create(&state, &[]).await.unwrap();

            let mut copy_a = store.load(&flow_id).await.unwrap();
            let mut copy_b = store.load(&flow_id).await.unwrap();
            copy_a.begin_phase("validate").unwrap();
            store.save(&mut copy_a).await.unwrap();

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
            // The failed save did not corrupt the caller's token.
            assert_eq!(copy_b.master.version, 1);
        })
        .await;
}

#[tokio::test]
async fn tenant_filter_applies_to_reads_writes_and_queries() {
    let (store, _dir) = temp_store().await;
    let state = FlowState::new("discovery", &test_ctx(), &json!({}));
    let flow_id = test_ctx()
        .scope(async { store.create(&state, &[]).await })
        .await
        .unwrap();

    ctx_for("tenant-b")
        .scope(async {
            assert!(matches!(
                store.load(&flow_id).await.unwrap_err(),
                StoreError::CrossTenant { .. }
            ));
            let mut stolen = state.clone();
            assert!(matches!(
                store.save(&mut stolen).await.unwrap_err(),
                StoreError::CrossTenant { .. }
            ));
            assert_eq!(store.find_active("discovery").await.unwrap(), None);
            assert!(store.list().await.unwrap().is_empty());
        })
        .await;

    test_ctx()
        .scope(async {
            assert_eq!(
                store.find_active("discovery").await.unwrap(),
                Some(flow_id.clone())
            );
            assert_eq!(store.list().await.unwrap(), vec![flow_id.clone()]);
            store.purge(&flow_id).await.unwrap();
            assert!(matches!(
                store.load(&flow_id).await.unwrap_err(),
                StoreError::NotFound { .. }
            ));
        })
        .await;
}
