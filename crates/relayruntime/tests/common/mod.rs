#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relaycore::{NodeContext, NodeError, NodeExecutor, NodeId, NodeOutput, NodeSpec, Workflow};
use relayruntime::RelayRuntime;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Holds a node in flight until the test releases it
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub async fn wait_entered(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("gated node never started");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Node executor driven by the test: records calls, fails on demand,
/// and can hold nodes in flight behind a [`Gate`].
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<String>>,
    seen_outputs: Mutex<Vec<usize>>,
    failures: Mutex<HashMap<NodeId, usize>>,
    gates: Mutex<HashMap<NodeId, Arc<Gate>>>,
    cancellable: Mutex<HashSet<NodeId>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` calls of `node_id`
    pub fn fail(&self, node_id: NodeId, times: usize) {
        self.failures.lock().insert(node_id, times);
    }

    pub fn gate(&self, node_id: NodeId) -> Arc<Gate> {
        self.gates.lock().entry(node_id).or_default().clone()
    }

    pub fn ungate(&self, node_id: NodeId) {
        self.gates.lock().remove(&node_id);
    }

    /// While gated, give up with `Cancelled` once the run's token fires
    pub fn honour_cancellation(&self, node_id: NodeId) {
        self.cancellable.lock().insert(node_id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
        self.seen_outputs.lock().clear();
    }

    /// How many upstream outputs each call could see, in call order
    pub fn seen_outputs(&self) -> Vec<usize> {
        self.seen_outputs.lock().clone()
    }
}

#[async_trait]
impl NodeExecutor for ScriptedExecutor {
    async fn execute_node(
        &self,
        node: &NodeSpec,
        ctx: NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        self.calls.lock().push(node.display_name().to_string());
        self.seen_outputs.lock().push(ctx.data.node_outputs.len());

        let gate = self.gates.lock().get(&node.id).cloned();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            let cancellable = self.cancellable.lock().contains(&node.id);
            if cancellable {
                tokio::select! {
                    _ = gate.release.notified() => {}
                    _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
                }
            } else {
                gate.release.notified().await;
            }
        }

        let should_fail = {
            let mut failures = self.failures.lock();
            match failures.get_mut(&node.id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            return Err(NodeError::ExecutionFailed(format!(
                "{} provider timeout",
                node.display_name()
            )));
        }

        Ok(NodeOutput::new(json!(format!("{}-out", node.display_name())))
            .with_metadata("model", "scripted"))
    }
}

/// Linear workflow `names[0] -> names[1] -> ...`
pub fn linear(names: &[&str]) -> (Workflow, Vec<NodeId>) {
    let mut workflow = Workflow::new("scripted");
    let ids = workflow.chain(
        names
            .iter()
            .map(|name| NodeSpec::new("test.step").with_name(*name)),
    );
    (workflow, ids)
}

pub async fn runtime_with(
    executor: Arc<ScriptedExecutor>,
    workflow: Workflow,
) -> Arc<RelayRuntime> {
    init_tracing();
    let runtime = Arc::new(RelayRuntime::new(executor));
    runtime
        .register_workflow(workflow)
        .await
        .expect("workflow registers");
    runtime
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
