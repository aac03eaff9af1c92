mod common;

use common::{linear, runtime_with, wait_until, ScriptedExecutor};
use relaycore::ExecutionStatus;
use relayruntime::{persist, StopFileSource, StopPoller, StopRequestSource};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn checkpoints_on_disk_resume_a_fresh_runtime() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C"]);
    let wf = workflow.id;
    executor.fail(ids[2], 1);
    let runtime = runtime_with(executor.clone(), workflow.clone()).await;

    assert!(runtime.execute(wf, json!({"run": 1})).await.is_err());
    for checkpoint in runtime.checkpoints(wf) {
        persist::save_checkpoint(dir.path(), &checkpoint).unwrap();
    }
    persist::save_state(dir.path(), &runtime.state(wf).unwrap()).unwrap();

    // a new process
    let executor = ScriptedExecutor::new();
    let restarted = runtime_with(executor.clone(), workflow).await;
    let checkpoints = persist::load_checkpoints(dir.path()).unwrap();
    assert_eq!(
        checkpoints.iter().map(|cp| cp.node_id).collect::<Vec<_>>(),
        vec![ids[0], ids[1]]
    );
    let state = persist::load_state(dir.path()).unwrap().unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);

    restarted.restore_state(state);
    for checkpoint in checkpoints {
        restarted.import_checkpoint(checkpoint);
    }

    let outcome = restarted.restart_from_checkpoint(wf, ids[1]).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(executor.calls(), vec!["C"]);
    assert_eq!(restarted.state(wf).unwrap().input, json!({"run": 1}));
}

#[tokio::test]
async fn save_run_writes_every_checkpoint_after_the_run_returns() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C", "D", "E"]);
    let wf = workflow.id;
    let runtime = runtime_with(executor.clone(), workflow).await;

    // nobody listens for events during the run
    runtime.execute(wf, json!({"run": 2})).await.unwrap();
    assert_eq!(persist::save_run(dir.path(), &runtime, wf).unwrap(), 5);

    let checkpoints = persist::load_checkpoints(dir.path()).unwrap();
    assert_eq!(
        checkpoints.iter().map(|cp| cp.node_id).collect::<Vec<_>>(),
        ids
    );
    let state = persist::load_state(dir.path()).unwrap().unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.input, json!({"run": 2}));

    // unknown workflows write nothing
    let empty = TempDir::new().unwrap();
    assert_eq!(persist::save_run(empty.path(), &runtime, uuid::Uuid::new_v4()).unwrap(), 0);
    assert!(persist::load_state(empty.path()).unwrap().is_none());
}

#[test]
fn loading_from_missing_directory_finds_nothing() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("never-created");

    assert!(persist::load_checkpoints(&missing).unwrap().is_empty());
    assert!(persist::load_state(&missing).unwrap().is_none());
}

#[tokio::test]
async fn stop_marker_file_stops_an_active_run() {
    let dir = TempDir::new().unwrap();
    let source = StopFileSource::new(dir.path());
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B"]);
    let wf = workflow.id;
    let gate_a = executor.gate(ids[0]);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let run = runtime.spawn_execute(wf, json!(null));
    gate_a.wait_entered().await;

    let poller = StopPoller::new(
        runtime.clone(),
        Arc::new(source.clone()),
        Duration::from_millis(10),
    );
    assert!(poller.poll_once().await.is_empty());

    source.request_stop(wf).await.unwrap();
    assert!(source.stop_requested(wf).await.unwrap());
    assert_eq!(poller.poll_once().await, vec![wf]);
    // applied requests are consumed
    assert!(!source.marker_path(wf).exists());

    gate_a.release();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status(), ExecutionStatus::Stopped);
    assert_eq!(executor.calls(), vec!["A"]);

    // stopped runs are no longer active, so nothing is re-applied
    assert!(poller.poll_once().await.is_empty());

    // clearing an absent marker is fine
    source.clear(wf).await.unwrap();
    assert!(!source.stop_requested(wf).await.unwrap());
}

#[tokio::test]
async fn run_resumed_after_a_file_stop_is_not_stopped_again() {
    let dir = TempDir::new().unwrap();
    let source = StopFileSource::new(dir.path());
    let executor = ScriptedExecutor::new();
    let (workflow, ids) = linear(&["A", "B", "C"]);
    let wf = workflow.id;
    let gate_b = executor.gate(ids[1]);
    let runtime = runtime_with(executor.clone(), workflow).await;

    let shutdown = CancellationToken::new();
    let poller = StopPoller::new(
        runtime.clone(),
        Arc::new(source.clone()),
        Duration::from_millis(10),
    )
    .spawn(shutdown.clone());

    let run = runtime.spawn_execute(wf, json!(null));
    gate_b.wait_entered().await;
    source.request_stop(wf).await.unwrap();
    wait_until(|| runtime.state(wf).map(|s| s.status) == Some(ExecutionStatus::Stopped)).await;
    wait_until(|| !source.marker_path(wf).exists()).await;
    gate_b.release();
    assert_eq!(run.await.unwrap().unwrap().status(), ExecutionStatus::Stopped);
    executor.ungate(ids[1]);

    // hold C long enough for several poll ticks
    let gate_c = executor.gate(ids[2]);
    let retry = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.restart_failed_node(wf, ids[2]).await })
    };
    gate_c.wait_entered().await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(runtime.state(wf).unwrap().status, ExecutionStatus::Executing);
    gate_c.release();

    let outcome = retry.await.unwrap().unwrap();
    assert!(outcome.is_completed());
    assert_eq!(executor.calls(), vec!["A", "B", "C"]);
    assert!(!source.marker_path(wf).exists());

    shutdown.cancel();
    poller.await.unwrap();
}
