use crate::{CheckpointStore, ExecutionStateStore, RunLease};
use chrono::Utc;
use relaycore::{
    progress_percent, EventBus, ExecutionEvent, ExecutionStatus, NodeContext, NodeError,
    NodeExecutor, NodeId, NodeSpec, NodeStatus, PipelineData, ProgressEvent, RelayError,
    WorkflowId,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// One workflow's execution order plus per-run limits
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub workflow_id: WorkflowId,
    pub order: Arc<[NodeSpec]>,
    pub node_timeout: Option<Duration>,
}

impl RunPlan {
    pub fn new(workflow_id: WorkflowId, order: impl Into<Arc<[NodeSpec]>>) -> Self {
        Self {
            workflow_id,
            order: order.into(),
            node_timeout: None,
        }
    }

    pub fn with_node_timeout(mut self, node_timeout: Option<Duration>) -> Self {
        self.node_timeout = node_timeout;
        self
    }

    pub fn total_nodes(&self) -> usize {
        self.order.len()
    }
}

/// Walks an execution order one node at a time, honouring pause and stop
/// between nodes and checkpointing after each success.
pub struct WorkflowExecutor {
    states: Arc<ExecutionStateStore>,
    checkpoints: Arc<CheckpointStore>,
    nodes: Arc<dyn NodeExecutor>,
    event_bus: Arc<EventBus>,
}

impl WorkflowExecutor {
    pub fn new(
        states: Arc<ExecutionStateStore>,
        checkpoints: Arc<CheckpointStore>,
        nodes: Arc<dyn NodeExecutor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            states,
            checkpoints,
            nodes,
            event_bus,
        }
    }

    /// Run every node from `start_index` to the end of the order.
    ///
    /// `existing_outputs` seeds the pipeline data (empty for a fresh run, a
    /// checkpoint's outputs for a resume). The state record must exist.
    /// Stopping is `Ok(RunOutcome::Stopped)`; a node failure halts the loop
    /// and is returned as `RelayError::NodeFailed`.
    pub async fn continue_execution_from_node(
        &self,
        lease: &RunLease,
        plan: &RunPlan,
        start_index: usize,
        existing_outputs: HashMap<NodeId, Value>,
    ) -> Result<RunOutcome, RelayError> {
        let workflow_id = plan.workflow_id;
        if lease.workflow_id() != workflow_id {
            return Err(RelayError::Execution(format!(
                "Lease for workflow {} used to run workflow {}",
                lease.workflow_id(),
                workflow_id
            )));
        }

        let started = Instant::now();
        let total_nodes = plan.total_nodes();
        let input = self
            .states
            .get(workflow_id)
            .map(|state| state.input)
            .ok_or(RelayError::StateNotFound(workflow_id))?;
        let last_done = start_index
            .checked_sub(1)
            .and_then(|i| plan.order.get(i))
            .map(|node| node.id);
        let mut data = PipelineData::resume_after(input, existing_outputs, last_done);

        info!(
            "Running workflow {} from node {}/{}",
            workflow_id, start_index, total_nodes
        );
        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            workflow_id,
            start_index,
            total_nodes,
            timestamp: Utc::now(),
        });

        for index in start_index..total_nodes {
            while self.states.is_paused(workflow_id) {
                info!("Workflow {} paused before node {}", workflow_id, index);
                self.states.wait_for_resume(workflow_id).await;
            }

            match self.states.status(workflow_id) {
                None => {
                    warn!("State for workflow {} vanished mid-run", workflow_id);
                    return Err(RelayError::StateNotFound(workflow_id));
                }
                Some(ExecutionStatus::Stopped) => {
                    return Ok(self.finish_stopped(plan, &data, started));
                }
                Some(_) => {}
            }

            if let Err(err) = self.run_node(plan, index, &mut data).await {
                if self.states.is_stopped(workflow_id) {
                    return Ok(self.finish_stopped(plan, &data, started));
                }
                self.emit_finished(workflow_id, ExecutionStatus::Failed, started);
                return Err(err);
            }
        }

        let final_state = self
            .states
            .modify(workflow_id, |state| {
                if state.status != ExecutionStatus::Stopped {
                    state.status = ExecutionStatus::Completed;
                    state.completed_at = Some(Utc::now());
                }
                state.current_node_id = None;
                state.clone()
            })
            .ok_or(RelayError::StateNotFound(workflow_id))?;

        if final_state.status == ExecutionStatus::Stopped {
            return Ok(self.finish_stopped(plan, &data, started));
        }

        let duration_ms = self.emit_finished(workflow_id, ExecutionStatus::Completed, started);
        info!(
            "Workflow {} completed: {}/{} nodes in {}ms",
            workflow_id,
            final_state.completed_node_ids.len(),
            total_nodes,
            duration_ms
        );

        Ok(RunOutcome::Completed(ExecutionResult {
            workflow_id,
            completed_nodes: final_state.completed_node_ids.len(),
            outputs: final_state.node_outputs,
            total_nodes,
            duration_ms,
        }))
    }

    /// Execute the node at `index` once and fold a success into state,
    /// checkpoint and progress. A failure is recorded against the node.
    pub async fn run_node(
        &self,
        plan: &RunPlan,
        index: usize,
        data: &mut PipelineData,
    ) -> Result<(), RelayError> {
        let workflow_id = plan.workflow_id;
        let total_nodes = plan.total_nodes();
        let node = plan.order.get(index).ok_or_else(|| {
            RelayError::Execution(format!(
                "Node index {} out of range for {} nodes",
                index, total_nodes
            ))
        })?;

        self.states
            .modify(workflow_id, |state| {
                if state.status != ExecutionStatus::Stopped {
                    state.current_node_id = Some(node.id);
                }
                state.current_node_index = Some(index);
            })
            .ok_or(RelayError::StateNotFound(workflow_id))?;

        debug!(
            "Starting node {} ({}) [{}/{}]",
            node.display_name(),
            node.id,
            index + 1,
            total_nodes
        );
        self.event_bus.emit(ExecutionEvent::NodeStarted {
            workflow_id,
            node_id: node.id,
            node_type: node.node_type.clone(),
            node_index: index,
            timestamp: Utc::now(),
        });

        let ctx = NodeContext::new(
            workflow_id,
            node,
            data.clone(),
            self.event_bus.create_emitter(workflow_id, node.id),
            self.states.cancellation_token(workflow_id),
        );

        let started = Instant::now();
        let call = self.nodes.execute_node(node, ctx);
        let result = match plan.node_timeout {
            Some(limit) => match timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout {
                    millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }),
            },
            None => call.await,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(mut output) => {
                output.metadata.execution_time_ms = duration_ms;
                data.absorb(node.id, &output);

                let snapshot = self
                    .states
                    .modify(workflow_id, |state| {
                        state.record_output(node.id, output.value.clone());
                        state.clone()
                    })
                    .ok_or(RelayError::StateNotFound(workflow_id))?;
                self.checkpoints
                    .create(workflow_id, node.id, snapshot, output.value.clone());

                info!(
                    "Node {} ({}) completed in {}ms",
                    node.display_name(),
                    node.id,
                    duration_ms
                );
                self.event_bus
                    .emit(ExecutionEvent::NodeCompleted(ProgressEvent {
                        workflow_id,
                        node_id: node.id,
                        node_name: node.display_name().to_string(),
                        progress: progress_percent(index, total_nodes),
                        status: NodeStatus::Completed,
                        output: output.value,
                        node_index: index,
                        total_nodes,
                        is_node_complete: true,
                        checkpoint_created: true,
                        timestamp: Utc::now(),
                    }));
                Ok(())
            }
            Err(source) => {
                let message = source.to_string();
                error!("Node {} ({}) failed: {}", node.display_name(), node.id, message);

                self.states.modify(workflow_id, |state| {
                    state.record_error(node.id, message.clone());
                    if state.status != ExecutionStatus::Stopped {
                        state.status = ExecutionStatus::Failed;
                    }
                });
                self.event_bus.emit(ExecutionEvent::NodeFailed {
                    workflow_id,
                    node_id: node.id,
                    error: message,
                    timestamp: Utc::now(),
                });

                Err(RelayError::NodeFailed {
                    node_id: node.id,
                    source,
                })
            }
        }
    }

    fn finish_stopped(&self, plan: &RunPlan, data: &PipelineData, started: Instant) -> RunOutcome {
        let workflow_id = plan.workflow_id;
        info!(
            "Workflow {} stopped after {} completed nodes",
            workflow_id,
            data.node_outputs.len()
        );
        self.emit_finished(workflow_id, ExecutionStatus::Stopped, started);
        RunOutcome::Stopped {
            workflow_id,
            completed_nodes: data.node_outputs.len(),
            total_nodes: plan.total_nodes(),
        }
    }

    fn emit_finished(&self, workflow_id: WorkflowId, status: ExecutionStatus, started: Instant) -> u64 {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.event_bus.emit(ExecutionEvent::WorkflowCompleted {
            workflow_id,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });
        duration_ms
    }
}

/// How a run segment ended, short of a failure
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(ExecutionResult),
    /// Deliberate cancellation; not an error
    Stopped {
        workflow_id: WorkflowId,
        completed_nodes: usize,
        total_nodes: usize,
    },
}

impl RunOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            RunOutcome::Completed(_) => ExecutionStatus::Completed,
            RunOutcome::Stopped { .. } => ExecutionStatus::Stopped,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn outputs(&self) -> Option<&HashMap<NodeId, Value>> {
        match self {
            RunOutcome::Completed(result) => Some(&result.outputs),
            RunOutcome::Stopped { .. } => None,
        }
    }
}

/// Result of a run that reached the end of its execution order
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub workflow_id: WorkflowId,
    pub outputs: HashMap<NodeId, Value>,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    pub duration_ms: u64,
}

/// `{success, status, results | error}` shape handed to upstream callers
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<HashMap<NodeId, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn from_result(result: &Result<RunOutcome, RelayError>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: outcome.is_completed(),
                status: outcome.status(),
                results: outcome.outputs().cloned(),
                error: None,
            },
            Err(err) => Self {
                success: false,
                status: match err {
                    RelayError::AlreadyRunning(_) => ExecutionStatus::Executing,
                    _ => ExecutionStatus::Failed,
                },
                results: None,
                error: Some(err.to_string()),
            },
        }
    }
}
