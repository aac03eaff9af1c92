mod common;

use common::{linear, runtime_with, wait_until, ScriptedExecutor};
use relaycore::{ExecutionStatus, NodeError, RelayError};
use relayruntime::RunOutcome;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn pause_between_nodes_then_resume_runs_only_the_rest() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C"]);
    let wf = workflow.id;
    let gate_b = executor.gate(ids[1]);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let run = runtime.spawn_execute(wf, json!({"prompt": "hello"}));
    gate_b.wait_entered().await;

    assert!(runtime.pause(wf));
    gate_b.release();

    let watcher = runtime.clone();
    wait_until(|| {
        watcher.state(wf).is_some_and(|s| {
            s.status == ExecutionStatus::Paused && s.has_completed(ids[1])
        })
    })
    .await;

    // the loop is parked before C
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.calls(), vec!["A", "B"]);
    assert!(runtime.is_running(wf));
    assert!(runtime.checkpoint(wf, ids[2]).is_none());

    assert!(runtime.resume(wf));
    let outcome = run.await.unwrap().expect("run completes");

    assert!(outcome.is_completed());
    assert_eq!(executor.calls(), vec!["A", "B", "C"]);
    let outputs = outcome.outputs().unwrap();
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[&ids[2]], json!("C-out"));

    let state = runtime.state(wf).unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert!(state.paused_at.is_some());
    assert!(state.resumed_at.is_some());
}

#[tokio::test]
async fn failed_node_halts_run_and_retry_continues() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C"]);
    let wf = workflow.id;
    executor.fail(ids[1], 1);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let err = runtime.execute(wf, json!(null)).await.unwrap_err();
    match &err {
        RelayError::NodeFailed { node_id, source } => {
            assert_eq!(*node_id, ids[1]);
            assert!(matches!(source, NodeError::ExecutionFailed(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.failed_node(), Some(ids[1]));
    assert_eq!(executor.calls(), vec!["A", "B"]);

    let state = runtime.state(wf).unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);
    assert!(state.error_for(ids[1]).is_some());
    assert_eq!(state.completed_node_ids, vec![ids[0]]);
    assert!(runtime.checkpoint(wf, ids[1]).is_none());

    let outcome = runtime
        .restart_failed_node(wf, ids[1])
        .await
        .expect("retry succeeds");

    assert!(outcome.is_completed());
    assert_eq!(executor.calls(), vec!["A", "B", "B", "C"]);
    let state = runtime.state(wf).unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert!(state.error_for(ids[1]).is_none());
    assert_eq!(state.completed_node_ids, ids);
}

#[tokio::test]
async fn repeated_failure_on_retry_is_returned() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B"]);
    let wf = workflow.id;
    executor.fail(ids[1], 2);
    let runtime = runtime_with(executor.clone(), workflow).await;

    assert!(runtime.execute(wf, json!(null)).await.is_err());
    let err = runtime.restart_failed_node(wf, ids[1]).await.unwrap_err();

    assert_eq!(err.failed_node(), Some(ids[1]));
    assert_eq!(runtime.state(wf).unwrap().status, ExecutionStatus::Failed);
    assert!(!runtime.is_running(wf));
}

#[tokio::test]
async fn stop_lets_in_flight_node_finish_and_starts_nothing_new() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C"]);
    let wf = workflow.id;
    let gate_b = executor.gate(ids[1]);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let run = runtime.spawn_execute(wf, json!(null));
    gate_b.wait_entered().await;

    assert!(runtime.stop(wf));
    let first_stop = runtime.state(wf).unwrap().stopped_at;
    gate_b.release();

    let outcome = run.await.unwrap().expect("stop is not an error");
    assert!(matches!(
        outcome,
        RunOutcome::Stopped { completed_nodes: 2, total_nodes: 3, .. }
    ));
    assert_eq!(executor.calls(), vec!["A", "B"]);

    let state = runtime.state(wf).unwrap();
    assert_eq!(state.status, ExecutionStatus::Stopped);
    assert!(state.force_stopped);
    // B's output is kept as a completed node
    assert!(state.has_completed(ids[1]));

    // idempotent
    assert!(runtime.stop(wf));
    assert_eq!(runtime.state(wf).unwrap().stopped_at, first_stop);
}

#[tokio::test]
async fn failure_after_stop_still_reports_stopped() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C"]);
    let wf = workflow.id;
    let gate_b = executor.gate(ids[1]);
    executor.fail(ids[1], 1);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let run = runtime.spawn_execute(wf, json!(null));
    gate_b.wait_entered().await;
    runtime.stop(wf);
    gate_b.release();

    let outcome = run.await.unwrap().expect("stopped, not failed");
    assert_eq!(outcome.status(), ExecutionStatus::Stopped);

    let state = runtime.state(wf).unwrap();
    assert_eq!(state.status, ExecutionStatus::Stopped);
    assert!(state.error_for(ids[1]).is_some());
}

#[tokio::test]
async fn stop_cancels_the_in_flight_call() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B"]);
    let wf = workflow.id;
    let gate_a = executor.gate(ids[0]);
    executor.honour_cancellation(ids[0]);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let run = runtime.spawn_execute(wf, json!(null));
    gate_a.wait_entered().await;
    runtime.stop(wf);

    // never released: only the cancellation token can end the call
    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("stop ends the call")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status(), ExecutionStatus::Stopped);
    assert_eq!(executor.calls(), vec!["A"]);
}

#[tokio::test]
async fn stop_while_paused_ends_the_run() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B"]);
    let wf = workflow.id;
    let gate_a = executor.gate(ids[0]);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let run = runtime.spawn_execute(wf, json!(null));
    gate_a.wait_entered().await;
    runtime.pause(wf);
    gate_a.release();

    let watcher = runtime.clone();
    wait_until(|| watcher.state(wf).is_some_and(|s| s.has_completed(ids[0]))).await;

    assert!(runtime.stop(wf));
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome.status(), ExecutionStatus::Stopped);
    assert_eq!(executor.calls(), vec!["A"]);
    // resume is only valid from paused
    assert!(!runtime.resume(wf));
}

#[tokio::test]
async fn clearing_a_paused_run_ends_it_without_recreating_state() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B"]);
    let wf = workflow.id;
    let gate_a = executor.gate(ids[0]);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let run = runtime.spawn_execute(wf, json!(null));
    gate_a.wait_entered().await;
    runtime.pause(wf);
    gate_a.release();

    let watcher = runtime.clone();
    wait_until(|| watcher.state(wf).is_some_and(|s| s.has_completed(ids[0]))).await;

    assert!(runtime.clear(wf));
    let err = run.await.unwrap().unwrap_err();

    assert!(matches!(err, RelayError::StateNotFound(id) if id == wf));
    assert!(runtime.state(wf).is_none());
    assert!(runtime.checkpoints(wf).is_empty());
    assert_eq!(executor.calls(), vec!["A"]);
}

#[tokio::test]
async fn restart_from_checkpoint_without_checkpoint_reruns_the_node() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C"]);
    let wf = workflow.id;
    let runtime = runtime_with(executor.clone(), workflow).await;

    // never executed: no state, no checkpoint
    let outcome = runtime
        .restart_from_checkpoint(wf, ids[0])
        .await
        .expect("falls back to re-running A");

    assert!(outcome.is_completed());
    assert_eq!(executor.calls(), vec!["A", "B", "C"]);
    let state = runtime.state(wf).unwrap();
    assert_eq!(state.input, json!(null));
    assert_eq!(state.completed_node_ids, ids);
}

#[tokio::test]
async fn restart_from_checkpoint_skips_everything_up_to_the_node() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C", "D"]);
    let wf = workflow.id;
    executor.fail(ids[2], 1);
    let runtime = runtime_with(executor.clone(), workflow).await;

    assert!(runtime.execute(wf, json!({"doc": 1})).await.is_err());
    executor.reset_calls();

    let mut events = runtime.subscribe_events();
    let outcome = runtime.restart_from_checkpoint(wf, ids[1]).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(executor.calls(), vec!["C", "D"]);
    // C saw the restored outputs of A and B
    assert_eq!(executor.seen_outputs(), vec![2, 3]);

    let state = runtime.state(wf).unwrap();
    assert_eq!(state.completed_node_ids, ids);
    assert_eq!(state.resume_point, Some(ids[1]));
    assert_eq!(state.input, json!({"doc": 1}));

    let first = events.recv().await.unwrap();
    assert!(matches!(first, relaycore::ExecutionEvent::WorkflowResumed { .. }));
}

#[tokio::test]
async fn resume_from_node_continues_a_stopped_run() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C"]);
    let wf = workflow.id;
    let gate_b = executor.gate(ids[1]);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let run = runtime.spawn_execute(wf, json!(null));
    gate_b.wait_entered().await;
    runtime.stop(wf);
    gate_b.release();
    run.await.unwrap().unwrap();

    executor.ungate(ids[1]);
    let outcome = runtime.resume_from_node(wf, ids[1]).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(executor.calls(), vec!["A", "B", "C"]);
    let state = runtime.state(wf).unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert!(!state.force_stopped);
    assert!(state.stopped_at.is_none());
}

#[tokio::test]
async fn resume_from_node_requires_existing_state() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B"]);
    let wf = workflow.id;
    let runtime = runtime_with(executor.clone(), workflow).await;

    let err = runtime.resume_from_node(wf, ids[0]).await.unwrap_err();
    assert!(matches!(err, RelayError::StateNotFound(_)));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn continue_execution_with_supplied_outputs() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C"]);
    let wf = workflow.id;
    let runtime = runtime_with(executor.clone(), workflow).await;

    let existing = HashMap::from([(ids[0], json!("a")), (ids[1], json!("b"))]);
    let outcome = runtime
        .continue_execution_from_node(wf, 2, existing)
        .await
        .unwrap();

    assert_eq!(executor.calls(), vec!["C"]);
    assert_eq!(executor.seen_outputs(), vec![2]);
    let outputs = outcome.outputs().unwrap();
    assert_eq!(outputs[&ids[0]], json!("a"));
    assert_eq!(runtime.state(wf).unwrap().completed_node_ids, ids);

    let err = runtime
        .continue_execution_from_node(wf, 4, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Execution(_)));
}

#[tokio::test]
async fn continue_at_end_of_order_completes_immediately() {
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B"]);
    let wf = workflow.id;
    let runtime = runtime_with(executor.clone(), workflow).await;

    runtime.execute(wf, json!(null)).await.unwrap();
    executor.reset_calls();

    let outcome = runtime.resume_from_node(wf, ids[1]).await.unwrap();
    assert!(outcome.is_completed());
    assert!(executor.calls().is_empty());
}
