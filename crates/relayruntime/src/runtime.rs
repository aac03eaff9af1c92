use crate::order::{build_execution_order, index_of};
use crate::reaper::Reaper;
use crate::registry::{NodeRegistry, RegistryExecutor};
use crate::{
    CheckpointStore, ExecutionStateStore, RunLease, RunLocks, RunOutcome, RunPlan, RuntimeConfig,
    WorkflowExecutor,
};
use chrono::Utc;
use relaycore::{
    Checkpoint, EventBus, ExecutionEvent, NodeExecutor, NodeId, NodeSpec, PipelineData,
    RelayError, Workflow, WorkflowError, WorkflowExecutionState, WorkflowId,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RegisteredWorkflow {
    workflow: Workflow,
    plan: RunPlan,
}

/// Control surface for resumable pipeline runs.
///
/// Owns the state and checkpoint stores and the per-workflow run locks.
/// Every operation that runs nodes takes the workflow's [`RunLease`] first,
/// so two loops can never drive the same workflow at once.
pub struct RelayRuntime {
    config: RuntimeConfig,
    workflows: RwLock<HashMap<WorkflowId, RegisteredWorkflow>>,
    states: Arc<ExecutionStateStore>,
    checkpoints: Arc<CheckpointStore>,
    locks: Arc<RunLocks>,
    executor: WorkflowExecutor,
    event_bus: Arc<EventBus>,
}

impl RelayRuntime {
    /// Create a runtime around an arbitrary node executor with default settings
    pub fn new(nodes: Arc<dyn NodeExecutor>) -> Self {
        Self::with_config(nodes, RuntimeConfig::default())
    }

    pub fn with_config(nodes: Arc<dyn NodeExecutor>, config: RuntimeConfig) -> Self {
        let states = Arc::new(ExecutionStateStore::new());
        let checkpoints = Arc::new(CheckpointStore::new());
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor =
            WorkflowExecutor::new(states.clone(), checkpoints.clone(), nodes, event_bus.clone());

        Self {
            config,
            workflows: RwLock::new(HashMap::new()),
            states,
            checkpoints,
            locks: Arc::new(RunLocks::new()),
            executor,
            event_bus,
        }
    }

    /// Create a runtime that dispatches nodes through a registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        Self::with_config(Arc::new(RegistryExecutor::new(registry)), config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register (or replace) a workflow. Returns its execution order.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<Vec<NodeId>, RelayError> {
        let order = build_execution_order(&workflow.nodes, &workflow.edges)?;
        let node_timeout = workflow
            .settings
            .node_timeout_ms
            .map(Duration::from_millis)
            .or(self.config.node_timeout);
        let plan = RunPlan::new(workflow.id, order).with_node_timeout(node_timeout);
        let ids = plan.order.iter().map(|n| n.id).collect();

        info!(
            "Registered workflow {} ({}) with {} nodes",
            workflow.name,
            workflow.id,
            plan.total_nodes()
        );
        self.workflows
            .write()
            .await
            .insert(workflow.id, RegisteredWorkflow { workflow, plan });
        Ok(ids)
    }

    pub async fn workflow(&self, workflow_id: WorkflowId) -> Option<Workflow> {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .map(|r| r.workflow.clone())
    }

    pub async fn list_workflows(&self) -> Vec<Workflow> {
        self.workflows
            .read()
            .await
            .values()
            .map(|r| r.workflow.clone())
            .collect()
    }

    /// Unregister a workflow and drop its state and checkpoints.
    pub async fn remove_workflow(&self, workflow_id: WorkflowId) -> bool {
        let removed = self.workflows.write().await.remove(&workflow_id).is_some();
        if removed {
            self.clear(workflow_id);
        }
        removed
    }

    pub async fn execution_order(&self, workflow_id: WorkflowId) -> Result<Vec<NodeSpec>, RelayError> {
        Ok(self.plan(workflow_id).await?.order.to_vec())
    }

    async fn plan(&self, workflow_id: WorkflowId) -> Result<RunPlan, RelayError> {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .map(|r| r.plan.clone())
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()).into())
    }

    /// Start a run from scratch. Previous state and checkpoints are discarded.
    pub async fn execute(&self, workflow_id: WorkflowId, input: Value) -> Result<RunOutcome, RelayError> {
        let plan = self.plan(workflow_id).await?;
        let lease = self.locks.try_acquire(workflow_id)?;

        self.checkpoints.clear_workflow(workflow_id);
        self.states.begin_run(workflow_id, |state| {
            *state = WorkflowExecutionState::new(workflow_id);
            state.input = input;
            state.start_time = Some(Utc::now());
        });

        self.executor
            .continue_execution_from_node(&lease, &plan, 0, HashMap::new())
            .await
    }

    /// Run `execute` on a background task.
    pub fn spawn_execute(
        self: &Arc<Self>,
        workflow_id: WorkflowId,
        input: Value,
    ) -> JoinHandle<Result<RunOutcome, RelayError>> {
        let runtime = self.clone();
        tokio::spawn(async move { runtime.execute(workflow_id, input).await })
    }

    /// Request a stop. The loop finishes any in-flight node and starts no new one.
    pub fn stop(&self, workflow_id: WorkflowId) -> bool {
        match self.states.stop(workflow_id) {
            None => {
                debug!("Stop ignored: no state for workflow {}", workflow_id);
                false
            }
            Some(true) => {
                info!("Workflow {} stop requested", workflow_id);
                self.event_bus.emit(ExecutionEvent::WorkflowStopped {
                    workflow_id,
                    timestamp: Utc::now(),
                });
                true
            }
            Some(false) => true,
        }
    }

    /// Pause before the next node. Only valid while executing.
    pub fn pause(&self, workflow_id: WorkflowId) -> bool {
        let paused = self.states.pause(workflow_id);
        if paused {
            info!("Workflow {} paused", workflow_id);
            self.event_bus.emit(ExecutionEvent::WorkflowPaused {
                workflow_id,
                timestamp: Utc::now(),
            });
        }
        paused
    }

    /// Wake a paused run. Only valid while paused.
    pub fn resume(&self, workflow_id: WorkflowId) -> bool {
        let resumed = self.states.resume(workflow_id);
        if resumed {
            info!("Workflow {} resumed", workflow_id);
            self.event_bus.emit(ExecutionEvent::WorkflowResumed {
                workflow_id,
                timestamp: Utc::now(),
            });
        }
        resumed
    }

    /// Whether a continuation loop currently holds this workflow's lease
    pub fn is_running(&self, workflow_id: WorkflowId) -> bool {
        self.locks.is_running(workflow_id)
    }

    pub async fn resume_from_node(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<RunOutcome, RelayError> {
        self.continue_workflow_from_node(workflow_id, node_id).await
    }

    /// Continue with the node after `from_node_id`, using the current outputs.
    pub async fn continue_workflow_from_node(
        &self,
        workflow_id: WorkflowId,
        from_node_id: NodeId,
    ) -> Result<RunOutcome, RelayError> {
        let plan = self.plan(workflow_id).await?;
        let lease = self.locks.try_acquire(workflow_id)?;

        if !self.states.contains(workflow_id) {
            return Err(RelayError::StateNotFound(workflow_id));
        }
        self.states.begin_run(workflow_id, |state| {
            state.resumed_at = Some(Utc::now());
            state.resume_point = Some(from_node_id);
        });

        self.continue_locked(&lease, &plan, from_node_id).await
    }

    async fn continue_locked(
        &self,
        lease: &RunLease,
        plan: &RunPlan,
        from_node_id: NodeId,
    ) -> Result<RunOutcome, RelayError> {
        let workflow_id = plan.workflow_id;
        let index = index_of(&plan.order, from_node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(from_node_id.to_string()))?;
        let outputs = self
            .states
            .get(workflow_id)
            .map(|state| state.node_outputs)
            .ok_or(RelayError::StateNotFound(workflow_id))?;

        self.executor
            .continue_execution_from_node(lease, plan, index + 1, outputs)
            .await
    }

    /// Direct entry into the continuation loop at `start_index`.
    ///
    /// `existing_outputs` are merged into the state record before the loop starts.
    pub async fn continue_execution_from_node(
        &self,
        workflow_id: WorkflowId,
        start_index: usize,
        existing_outputs: HashMap<NodeId, Value>,
    ) -> Result<RunOutcome, RelayError> {
        let plan = self.plan(workflow_id).await?;
        if start_index > plan.total_nodes() {
            return Err(RelayError::Execution(format!(
                "Start index {} out of range for {} nodes",
                start_index,
                plan.total_nodes()
            )));
        }
        let lease = self.locks.try_acquire(workflow_id)?;

        self.states.begin_run(workflow_id, |state| {
            if state.start_time.is_none() {
                state.start_time = Some(Utc::now());
            }
            state.resumed_at = Some(Utc::now());
            for node in plan.order.iter() {
                if let Some(output) = existing_outputs.get(&node.id) {
                    state.record_output(node.id, output.clone());
                }
            }
        });

        self.executor
            .continue_execution_from_node(&lease, &plan, start_index, existing_outputs)
            .await
    }

    /// Restore the snapshot taken after `node_id` and continue with the next node.
    ///
    /// Without a checkpoint the node never completed, so it is re-run via
    /// [`restart_failed_node`](Self::restart_failed_node) instead of skipped.
    pub async fn restart_from_checkpoint(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<RunOutcome, RelayError> {
        let Some(checkpoint) = self.checkpoints.get(workflow_id, node_id) else {
            warn!(
                "No checkpoint for node {} of workflow {}; re-running the node",
                node_id, workflow_id
            );
            return self.restart_failed_node(workflow_id, node_id).await;
        };

        let plan = self.plan(workflow_id).await?;
        let index = index_of(&plan.order, node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?;
        let lease = self.locks.try_acquire(workflow_id)?;

        info!(
            "Restoring workflow {} from checkpoint after node {} ({} nodes done)",
            workflow_id,
            node_id,
            checkpoint.state.completed_node_ids.len()
        );
        self.states.restore(checkpoint.state.clone());
        self.states.begin_run(workflow_id, |state| {
            state.resumed_at = Some(Utc::now());
            state.resume_point = Some(node_id);
        });
        self.event_bus.emit(ExecutionEvent::WorkflowResumed {
            workflow_id,
            timestamp: Utc::now(),
        });

        self.executor
            .continue_execution_from_node(&lease, &plan, index + 1, checkpoint.state.node_outputs)
            .await
    }

    /// Re-execute exactly `node_id` with the current outputs, then continue
    /// with the rest of the order. A repeated failure is returned as-is.
    pub async fn restart_failed_node(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<RunOutcome, RelayError> {
        let plan = self.plan(workflow_id).await?;
        let index = index_of(&plan.order, node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?;
        let lease = self.locks.try_acquire(workflow_id)?;

        if !self.states.contains(workflow_id) {
            warn!(
                "No state for workflow {}; retrying node {} with empty pipeline data",
                workflow_id, node_id
            );
        }
        let state = self.states.begin_run(workflow_id, |state| {
            state.clear_errors_for(node_id);
            if state.start_time.is_none() {
                state.start_time = Some(Utc::now());
            }
            state.resumed_at = Some(Utc::now());
        });

        let previous = index
            .checked_sub(1)
            .and_then(|i| plan.order.get(i))
            .map(|n| n.id);
        let mut data = PipelineData::resume_after(state.input, state.node_outputs, previous);

        info!("Retrying node {} of workflow {}", node_id, workflow_id);
        if let Err(err) = self.executor.run_node(&plan, index, &mut data).await {
            if self.states.is_stopped(workflow_id) {
                return Ok(RunOutcome::Stopped {
                    workflow_id,
                    completed_nodes: data.node_outputs.len(),
                    total_nodes: plan.total_nodes(),
                });
            }
            return Err(err);
        }

        self.continue_locked(&lease, &plan, node_id).await
    }

    pub fn state(&self, workflow_id: WorkflowId) -> Option<WorkflowExecutionState> {
        self.states.get(workflow_id)
    }

    /// Replace the state record, e.g. with a snapshot loaded from disk.
    pub fn restore_state(&self, state: WorkflowExecutionState) {
        self.states.restore(state);
    }

    pub fn checkpoint(&self, workflow_id: WorkflowId, node_id: NodeId) -> Option<Checkpoint> {
        self.checkpoints.get(workflow_id, node_id)
    }

    pub fn checkpoints(&self, workflow_id: WorkflowId) -> Vec<Checkpoint> {
        self.checkpoints.list(workflow_id)
    }

    pub fn import_checkpoint(&self, checkpoint: Checkpoint) {
        self.checkpoints.insert(checkpoint);
    }

    /// Drop state and checkpoints for a workflow. A paused loop is woken and exits.
    pub fn clear(&self, workflow_id: WorkflowId) -> bool {
        let cleared = self.states.clear(workflow_id);
        self.checkpoints.clear_workflow(workflow_id);
        cleared
    }

    /// Ids of runs that are executing or paused
    pub fn active_workflows(&self) -> Vec<WorkflowId> {
        self.states.active_ids()
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.states.clone(),
            self.checkpoints.clone(),
            self.locks.clone(),
            &self.config,
        )
    }

    /// Start the periodic staleness sweep; stops when `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.reaper().spawn(shutdown)
    }
}
