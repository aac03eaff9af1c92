use crate::{ExecutionStatus, NodeId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    WorkflowStarted {
        workflow_id: WorkflowId,
        start_index: usize,
        total_nodes: usize,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        workflow_id: WorkflowId,
        node_id: NodeId,
        node_type: String,
        node_index: usize,
        timestamp: DateTime<Utc>,
    },
    /// Emitted once per successful node, after its checkpoint is written
    NodeCompleted(ProgressEvent),
    NodeFailed {
        workflow_id: WorkflowId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowPaused {
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    WorkflowResumed {
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    WorkflowStopped {
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        status: ExecutionStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        workflow_id: WorkflowId,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn workflow_id(&self) -> WorkflowId {
        match self {
            ExecutionEvent::WorkflowStarted { workflow_id, .. }
            | ExecutionEvent::NodeStarted { workflow_id, .. }
            | ExecutionEvent::NodeFailed { workflow_id, .. }
            | ExecutionEvent::WorkflowPaused { workflow_id, .. }
            | ExecutionEvent::WorkflowResumed { workflow_id, .. }
            | ExecutionEvent::WorkflowStopped { workflow_id, .. }
            | ExecutionEvent::WorkflowCompleted { workflow_id, .. }
            | ExecutionEvent::NodeEvent { workflow_id, .. } => *workflow_id,
            ExecutionEvent::NodeCompleted(progress) => progress.workflow_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Completed,
    Failed,
}

/// Per-node progress. Consumers should treat these as at-least-once and
/// monotonically non-decreasing in `progress` within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub node_name: String,
    /// 0–100
    pub progress: f64,
    pub status: NodeStatus,
    pub output: Value,
    pub node_index: usize,
    pub total_nodes: usize,
    pub is_node_complete: bool,
    pub checkpoint_created: bool,
    pub timestamp: DateTime<Utc>,
}

/// Percentage of the execution order finished once `node_index` completes.
pub fn progress_percent(node_index: usize, total_nodes: usize) -> f64 {
    if total_nodes == 0 {
        return 100.0;
    }
    (node_index + 1) as f64 / total_nodes as f64 * 100.0
}

/// Events specific to node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Partial { value: Value },
}

/// Event emitter for nodes to send real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    workflow_id: WorkflowId,
    node_id: NodeId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        workflow_id: WorkflowId,
        node_id: NodeId,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            workflow_id,
            node_id,
            sender,
        }
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            workflow_id: self.workflow_id,
            node_id: self.node_id,
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(NodeEvent::Progress { percent, message });
    }

    /// Emit a partial result (e.g. streamed tokens)
    pub fn partial(&self, value: Value) {
        self.emit(NodeEvent::Partial { value });
    }
}

/// Process-wide event bus. Sends never block and never fail the caller;
/// with no subscribers the event is dropped.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, workflow_id: WorkflowId, node_id: NodeId) -> EventEmitter {
        EventEmitter::new(workflow_id, node_id, self.sender.clone())
    }
}
