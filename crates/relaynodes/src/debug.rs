use async_trait::async_trait;
use relaycore::{Node, NodeContext, NodeError, NodeOutput};
use relayruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::collections::HashMap;

/// Logs the upstream value and passes it through unchanged
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let label = ctx
            .config
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        let upstream = ctx.upstream().clone();

        ctx.events.info(format!("DEBUG: {}", label));
        ctx.events.info(format!("  upstream: {}", upstream));
        tracing::debug!(node_id = %ctx.node_id, "{}: {}", label, upstream);

        Ok(NodeOutput::new(upstream).with_metadata("label", label))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs the upstream value for debugging".to_string(),
            category: "debug".to_string(),
        }
    }
}
