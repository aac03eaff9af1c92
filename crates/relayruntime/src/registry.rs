use async_trait::async_trait;
use relaycore::{
    Node, NodeContext, NodeError, NodeExecutor, NodeOutput, NodeSpec, Workflow, WorkflowError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Optional: Get node metadata (description, category)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Registry of available node types
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    /// Create a node instance from a node type and config
    pub fn create_node(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Box<dyn Node>, WorkflowError> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| WorkflowError::UnknownNodeType(node_type.to_string()))?;

        factory
            .create(config)
            .map_err(|e| WorkflowError::Invalid(format!("Failed to create node: {}", e)))
    }

    /// Check that every node in `workflow` has a registered type and a valid config.
    pub fn validate(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        for spec in &workflow.nodes {
            let node = self.create_node(&spec.node_type, &spec.config)?;
            node.validate_config(&spec.config).map_err(|e| {
                WorkflowError::Invalid(format!("Node {} ({}): {}", spec.display_name(), spec.id, e))
            })?;
        }
        Ok(())
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

/// [`NodeExecutor`] that dispatches on `node_type` through a [`NodeRegistry`].
pub struct RegistryExecutor {
    registry: Arc<NodeRegistry>,
}

impl RegistryExecutor {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }
}

#[async_trait]
impl NodeExecutor for RegistryExecutor {
    async fn execute_node(
        &self,
        node: &NodeSpec,
        ctx: NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let handler = self
            .registry
            .create_node(&node.node_type, &node.config)
            .map_err(|e| NodeError::Configuration(e.to_string()))?;
        handler.execute(ctx).await
    }
}
