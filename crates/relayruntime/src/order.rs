use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use relaycore::{Edge, NodeId, NodeSpec, WorkflowError};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Turn a node/edge graph into the linear order the continuation loop walks.
///
/// Kahn's algorithm with ties broken by declaration order, so the same graph
/// always yields the same sequence. Every node is visited exactly once.
pub fn build_execution_order(
    nodes: &[NodeSpec],
    edges: &[Edge],
) -> Result<Vec<NodeSpec>, WorkflowError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut node_to_index: HashMap<NodeId, NodeIndex> = HashMap::new();

    for (position, node) in nodes.iter().enumerate() {
        if node_to_index.contains_key(&node.id) {
            return Err(WorkflowError::Invalid(format!("Duplicate node id: {}", node.id)));
        }
        let idx = graph.add_node(position);
        node_to_index.insert(node.id, idx);
    }

    for edge in edges {
        let from_idx = node_to_index
            .get(&edge.source)
            .ok_or_else(|| WorkflowError::NodeNotFound(edge.source.to_string()))?;
        let to_idx = node_to_index
            .get(&edge.target)
            .ok_or_else(|| WorkflowError::NodeNotFound(edge.target.to_string()))?;
        if from_idx == to_idx {
            return Err(WorkflowError::InvalidEdge(format!(
                "Node {} depends on itself",
                edge.source
            )));
        }
        graph.update_edge(*from_idx, *to_idx, ());
    }

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .map(|idx| Reverse((graph[idx], idx)))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse((position, idx))) = ready.pop() {
        order.push(nodes[position].clone());
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse((graph[next], next)));
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(WorkflowError::CyclicDependency);
    }

    Ok(order)
}

/// Position of `node_id` in an execution order
pub fn index_of(order: &[NodeSpec], node_id: NodeId) -> Option<usize> {
    order.iter().position(|n| n.id == node_id)
}
