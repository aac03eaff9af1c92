use async_trait::async_trait;
use relaycore::{Node, NodeContext, NodeError, NodeOutput};
use relayruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Waits for `delay_ms`, then passes the upstream value through.
///
/// Gives up early with [`NodeError::Cancelled`] when the run is stopped.
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .config
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_DELAY_MS);

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => {
                ctx.events.warn("Delay interrupted by stop");
                return Err(NodeError::Cancelled);
            }
        }

        Ok(NodeOutput::new(ctx.upstream().clone()).with_metadata("delayed_ms", delay_ms))
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("delay_ms") {
            None => Ok(()),
            Some(v) if v.is_u64() => Ok(()),
            Some(other) => Err(NodeError::InvalidInputType {
                field: "delay_ms".to_string(),
                expected: "non-negative integer".to_string(),
                actual: other.to_string(),
            }),
        }
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
        }
    }
}
