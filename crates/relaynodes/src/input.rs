use async_trait::async_trait;
use relaycore::{Node, NodeContext, NodeError, NodeOutput};
use relayruntime::{NodeFactory, NodeMetadata};
use serde_json::Value;
use std::collections::HashMap;

/// Pick a field out of the run input, with an optional configured fallback
pub struct InputFieldNode;

#[async_trait]
impl Node for InputFieldNode {
    fn node_type(&self) -> &str {
        "input.field"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let key = ctx
            .require_config("key")?
            .as_str()
            .ok_or_else(|| NodeError::Configuration("key must be a string".to_string()))?;

        let value = match ctx.data.input.get(key) {
            Some(value) => value.clone(),
            None => ctx
                .config
                .get("default")
                .cloned()
                .ok_or_else(|| NodeError::MissingInput(key.to_string()))?,
        };

        Ok(NodeOutput::new(value).with_metadata("key", key))
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("key") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(NodeError::Configuration(
                "input.field needs a string `key`".to_string(),
            )),
        }
    }
}

pub struct InputFieldNodeFactory;

impl NodeFactory for InputFieldNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(InputFieldNode))
    }

    fn node_type(&self) -> &str {
        "input.field"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Read one field of the run input".to_string(),
            category: "input".to_string(),
        }
    }
}
