use crate::{NodeId, NodeMetadata, NodeOutput};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Per-run context threaded through node execution.
///
/// Never persisted on its own: a resumed run rebuilds it from the
/// `node_outputs` recorded in a checkpoint or in the execution state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineData {
    /// Input the run was started with
    pub input: Value,

    /// Output of every node completed so far, keyed by node id
    pub node_outputs: HashMap<NodeId, Value>,

    /// Output of the most recently completed node
    pub last_output: Option<Value>,

    /// Metadata the previous node passed through
    pub previous_metadata: Option<NodeMetadata>,
}

impl PipelineData {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    /// Rebuild pipeline data for a run that continues after `last_node`.
    ///
    /// Pass-through metadata is not part of any snapshot, so it starts empty.
    pub fn resume_after(
        input: Value,
        node_outputs: HashMap<NodeId, Value>,
        last_node: Option<NodeId>,
    ) -> Self {
        let last_output = last_node.and_then(|id| node_outputs.get(&id).cloned());
        Self {
            input,
            node_outputs,
            last_output,
            previous_metadata: None,
        }
    }

    /// Fold a node's output into the accumulated data.
    pub fn absorb(&mut self, node_id: NodeId, output: &NodeOutput) {
        self.node_outputs.insert(node_id, output.value.clone());
        self.last_output = Some(output.value.clone());
        self.previous_metadata = Some(output.metadata.clone());
    }

    pub fn output_of(&self, node_id: NodeId) -> Option<&Value> {
        self.node_outputs.get(&node_id)
    }
}
