use crate::{events::EventEmitter, NodeError, NodeId, NodeSpec, PipelineData, WorkflowId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Runs one node's work against the current pipeline data.
///
/// The seam to AI-provider and node-type logic. Implementations need not be
/// idempotent; completed nodes are never re-invoked on resume.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute_node(&self, node: &NodeSpec, ctx: NodeContext)
        -> Result<NodeOutput, NodeError>;
}

/// Handler for a single node type, looked up by `node_type`
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "time.delay", "transform.json_parse")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: Validate configuration at workflow load time
    fn validate_config(&self, _config: &HashMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub workflow_id: WorkflowId,

    pub node_id: NodeId,

    /// Static configuration for this node
    pub config: HashMap<String, Value>,

    /// Snapshot of the pipeline data at dispatch time
    pub data: PipelineData,

    /// Progress callback for intra-node updates
    pub events: EventEmitter,

    /// Cancelled when the workflow is stopped. Honouring it is up to the node.
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(
        workflow_id: WorkflowId,
        node: &NodeSpec,
        data: PipelineData,
        events: EventEmitter,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            workflow_id,
            node_id: node.id,
            config: node.config.clone(),
            data,
            events,
            cancellation,
        }
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    /// Output of the previous node, falling back to the run input for the first node.
    pub fn upstream(&self) -> &Value {
        self.data.last_output.as_ref().unwrap_or(&self.data.input)
    }

    /// Output of the previous node, or an error naming `field` if there is none.
    pub fn require_upstream(&self, field: &str) -> Result<&Value, NodeError> {
        self.data
            .last_output
            .as_ref()
            .ok_or_else(|| NodeError::MissingInput(field.to_string()))
    }
}

/// Output from node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub value: Value,

    /// Pass-through metadata, visible to the next node
    pub metadata: NodeMetadata,
}

impl NodeOutput {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            metadata: NodeMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.custom.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub execution_time_ms: u64,
    #[serde(default)]
    pub custom: HashMap<String, Value>,
}
