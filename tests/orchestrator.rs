//! End-to-end orchestrator tests: the discovery pause/resume journey,
//! concurrent-execution guards, the single-active-flow rule, and
//! cancellation semantics.

mod common;

use common::executors::*;
use common::fixtures::*;
use flowline::controller::RunOutcome;
use flowline::executor::ExecutorSet;
use flowline::orchestrator::OrchestratorError;
use flowline::store::FlowStore;
use flowline::types::{FlowStatus, PhaseStatus};
use serde_json::json;

#[tokio::test]
async fn discovery_runs_until_the_pausable_phase_and_parks() {
    let (orchestrator, _store) = orchestrator_with(discovery_executors());
    test_ctx()
        .scope(async {
            let flow_id = orchestrator
                .create_flow("discovery", json!({"data_ref": "upload-42"}))
                .await
                .unwrap();
            let outcome = orchestrator.execute(&flow_id).await.unwrap();
            assert_eq!(outcome.status, FlowStatus::Paused);
            assert_eq!(
                outcome.outcome,
                RunOutcome::Paused {
                    phase: "map_fields".into()
                }
            );

            let view = orchestrator.get_status(&flow_id).await.unwrap();
            assert_eq!(view.status, FlowStatus::Paused);
            assert!(view.requires_user_input);
            assert_eq!(view.resume_inputs, vec!["mappings"]);
            assert_eq!(view.current_phase.as_deref(), Some("map_fields"));
            // validate completed before the pause.
            assert_eq!(view.phases[0].name, "validate");
            assert_eq!(view.phases[0].status, PhaseStatus::Succeeded);
        })
        .await;
}

#[tokio::test]
async fn resume_with_user_input_completes_the_flow() {
    let (orchestrator, store) = orchestrator_with(discovery_executors());
    test_ctx()
        .scope(async {
            let flow_id = orchestrator
                .create_flow("discovery", json!({"data_ref": "upload-42"}))
                .await
                .unwrap();
            orchestrator.execute(&flow_id).await.unwrap();

            let outcome = orchestrator
                .resume(&flow_id, json!({"mappings": [{"from": "colA", "to": "name"}]}))
                .await
                .unwrap();
            assert_eq!(outcome.status, FlowStatus::Completed);
            assert_eq!(outcome.outcome, RunOutcome::Completed);

            let state = store.load(&flow_id).await.unwrap();
            // The pause, the input, and the re-execution are all on record.
            let record = &state.master.phase_state["map_fields"];
            assert_eq!(record.status, PhaseStatus::Succeeded);
            assert!(record.user_input.is_some());
            assert_eq!(state.progress_pct(
                orchestrator.registry().resolve("discovery").unwrap()
            ), 100);
        })
        .await;
}

#[tokio::test]
async fn resume_without_required_inputs_is_refused() {
    let (orchestrator, _store) = orchestrator_with(discovery_executors());
    test_ctx()
        .scope(async {
            let flow_id = orchestrator
                .create_flow("discovery", json!({"data_ref": "upload-42"}))
                .await
                .unwrap();
            orchestrator.execute(&flow_id).await.unwrap();

            let err = orchestrator.resume(&flow_id, json!({})).await.unwrap_err();
            assert!(matches!(
                err,
                OrchestratorError::Controller(
                    flowline::controller::ControllerError::MissingInputs { .. }
                )
            ));
            // Still paused; a later resume with the input succeeds.
            let view = orchestrator.get_status(&flow_id).await.unwrap();
            assert_eq!(view.status, FlowStatus::Paused);
            let outcome = orchestrator
                .resume(&flow_id, json!({"mappings": []}))
                .await
                .unwrap();
            assert_eq!(outcome.status, FlowStatus::Completed);
        })
        .await;
}

#[tokio::test]
async fn concurrent_execute_is_refused_while_a_run_is_in_flight() {
    let (gated, gate) = GatedExecutor::new();
    let executors = ExecutorSet::new()
        .register("validate", gated)
        .register("map_fields", EchoExecutor)
        .register("cleanse", EchoExecutor)
        .register("build_inventory", EchoExecutor);
    let (orchestrator, _store) = orchestrator_with(executors);

    test_ctx()
        .scope(async {
            let flow_id = orchestrator
                .create_flow("discovery", json!({"data_ref": "u"}))
                .await
                .unwrap();

            let snapshot = flowline::context::RequestContext::current().unwrap();
            let background = {
                let orchestrator = orchestrator.clone();
                let flow_id = flow_id.clone();
                tokio::spawn(snapshot.scope(async move { orchestrator.execute(&flow_id).await }))
            };
            // Wait until the first run is inside the gated phase.
            tokio::task::yield_now().await;
            loop {
                let view = orchestrator.get_status(&flow_id).await.unwrap();
                if view.status == FlowStatus::Running {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }

            let err = orchestrator.execute(&flow_id).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));

            gate.add_permits(10);
            let outcome = background.await.unwrap().unwrap();
            assert_eq!(outcome.status, FlowStatus::Completed);
        })
        .await;
}

#[tokio::test]
async fn one_active_flow_per_type_and_scope() {
    let (orchestrator, _store) = orchestrator_with(discovery_executors());
    test_ctx()
        .scope(async {
            let first = orchestrator
                .create_flow("discovery", json!({"data_ref": "a"}))
                .await
                .unwrap();
            let err = orchestrator
                .create_flow("discovery", json!({"data_ref": "b"}))
                .await
                .unwrap_err();
            match err {
                OrchestratorError::FlowAlreadyActive { flow_id, flow_type } => {
                    assert_eq!(flow_id, first);
                    assert_eq!(flow_type, "discovery");
                }
                other => panic!("expected FlowAlreadyActive, got {other}"),
            }

            // A different flow type in the same scope is fine.
            orchestrator
                .create_flow("assessment", json!({}))
                .await
                .unwrap();

            // Completing the first frees the slot.
            orchestrator.execute(&first).await.unwrap();
            orchestrator
                .resume(&first, json!({"mappings": []}))
                .await
                .unwrap();
            orchestrator
                .create_flow("discovery", json!({"data_ref": "c"}))
                .await
                .unwrap();
        })
        .await;

    // Another tenant has its own slot.
    ctx_for("tenant-b")
        .scope(async {
            orchestrator
                .create_flow("discovery", json!({"data_ref": "d"}))
                .await
                .unwrap();
        })
        .await;
}

#[tokio::test]
async fn create_rejects_unknown_types_and_non_object_state() {
    let (orchestrator, _store) = orchestrator_with(ExecutorSet::new());
    test_ctx()
        .scope(async {
            assert!(matches!(
                orchestrator.create_flow("no_such_type", json!({})).await,
                Err(OrchestratorError::Registry(_))
            ));
            assert!(matches!(
                orchestrator.create_flow("discovery", json!([1, 2])).await,
                Err(OrchestratorError::Validation(_))
            ));
        })
        .await;
}

#[tokio::test]
async fn creation_writes_the_audit_record_and_caller_linked_records() {
    let (orchestrator, store) = orchestrator_with(discovery_executors());
    test_ctx()
        .scope(async {
            let flow_id = orchestrator
                .create_flow_with(
                    "discovery",
                    json!({"data_ref": "upload-1"}),
                    vec![flowline::store::LinkedWrite::new(
                        "outbox",
                        "flow-created",
                        json!({"notify": "assessments-team"}),
                    )],
                )
                .await
                .unwrap();

            let records = store.linked_records(&flow_id);
            assert_eq!(records.len(), 2);
            assert_eq!(records[0]["flow_type"], json!("discovery"));
            assert_eq!(records[0]["user_id"], json!("user-1"));
            assert_eq!(records[1], json!({"notify": "assessments-team"}));
        })
        .await;
}

#[tokio::test]
async fn cancel_finalizes_idle_flows_immediately() {
    let (orchestrator, _store) = orchestrator_with(discovery_executors());
    test_ctx()
        .scope(async {
            // NotStarted flow cancels in one step.
            let flow_id = orchestrator
                .create_flow("discovery", json!({"data_ref": "a"}))
                .await
                .unwrap();
            let status = orchestrator.cancel(&flow_id).await.unwrap();
            assert_eq!(status, FlowStatus::Cancelled);

            // Paused flow cancels the same way; its history is preserved.
            let flow_id = orchestrator
                .create_flow("discovery", json!({"data_ref": "b"}))
                .await
                .unwrap();
            orchestrator.execute(&flow_id).await.unwrap();
            let status = orchestrator.cancel(&flow_id).await.unwrap();
            assert_eq!(status, FlowStatus::Cancelled);
            let view = orchestrator.get_status(&flow_id).await.unwrap();
            assert_eq!(view.phases[0].name, "validate");

            // Terminal flows refuse further transitions.
            assert!(matches!(
                orchestrator.cancel(&flow_id).await,
                Err(OrchestratorError::InvalidState { .. })
            ));
            assert!(matches!(
                orchestrator.execute(&flow_id).await,
                Err(OrchestratorError::InvalidState { .. })
            ));
            assert!(matches!(
                orchestrator.resume(&flow_id, json!({"mappings": []})).await,
                Err(OrchestratorError::InvalidState { .. })
            ));
        })
        .await;
}

#[tokio::test]
async fn cancel_during_a_run_takes_effect_between_phases() {
    let (gated, gate) = GatedExecutor::new();
    let executors = ExecutorSet::new()
        .register("validate", gated)
        .register("map_fields", EchoExecutor)
        .register("cleanse", EchoExecutor)
        .register("build_inventory", EchoExecutor);
    let (orchestrator, store) = orchestrator_with(executors);

    test_ctx()
        .scope(async {
            let flow_id = orchestrator
                .create_flow("discovery", json!({"data_ref": "a"}))
                .await
                .unwrap();
            let snapshot = flowline::context::RequestContext::current().unwrap();
            let background = {
                let orchestrator = orchestrator.clone();
                let flow_id = flow_id.clone();
                tokio::spawn(snapshot.scope(async move { orchestrator.execute(&flow_id).await }))
            };
            loop {
                let view = orchestrator.get_status(&flow_id).await.unwrap();
                if view.status == FlowStatus::Running {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }

            // Running flow: cancel only flags; the in-flight phase finishes.
            let status = orchestrator.cancel(&flow_id).await.unwrap();
            assert_eq!(status, FlowStatus::Running);

            gate.add_permits(10);
            let outcome = background.await.unwrap().unwrap();
            assert_eq!(outcome.status, FlowStatus::Cancelled);

            // The gated phase completed before cancellation took effect.
            let state = store.load(&flow_id).await.unwrap();
            assert_eq!(
                state.master.phase_state["validate"].status,
                PhaseStatus::Succeeded
            );
            assert!(!state.master.phase_state.contains_key("map_fields"));
        })
        .await;
}

#[tokio::test]
async fn an_error_escaping_a_run_is_persisted_as_terminal_failure() {
    // Executor registration stops at map_fields; the run dies at cleanse.
    let executors = ExecutorSet::new()
        .register("validate", EchoExecutor)
        .register("map_fields", EchoExecutor);
    let (orchestrator, store) = orchestrator_with(executors);

    test_ctx()
        .scope(async {
            let flow_id = orchestrator
                .create_flow("discovery", json!({"data_ref": "a"}))
                .await
                .unwrap();
            let err = orchestrator.execute(&flow_id).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::Controller(_)));

            // The flow is not left stuck at Running.
            let state = store.load(&flow_id).await.unwrap();
            assert_eq!(state.master.status, FlowStatus::Failed);
            let error = state.master.error.expect("failure detail recorded");
            assert!(error.message.contains("cleanse"));
            assert_eq!(error.phase.as_deref(), Some("cleanse"));
        })
        .await;
}

#[tokio::test]
async fn resume_is_only_legal_from_paused() {
    let (orchestrator, _store) = orchestrator_with(discovery_executors());
    test_ctx()
        .scope(async {
            let flow_id = orchestrator
                .create_flow("discovery", json!({"data_ref": "a"}))
                .await
                .unwrap();
            let err = orchestrator
                .resume(&flow_id, json!({"mappings": []}))
                .await
                .unwrap_err();
            assert!(matches!(err, OrchestratorError::InvalidState { .. }));
        })
        .await;
}
