use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relaycore::{Checkpoint, NodeId, WorkflowExecutionState, WorkflowId};
use serde_json::Value;
use std::collections::HashMap;

/// Post-node snapshots keyed by (workflow, node).
///
/// Written once per successful node, right after the state store records
/// that node's output. Re-writing a key replaces it.
#[derive(Default)]
pub struct CheckpointStore {
    checkpoints: Mutex<HashMap<(WorkflowId, NodeId), Checkpoint>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
        snapshot: WorkflowExecutionState,
        output: Value,
    ) -> Checkpoint {
        let checkpoint = Checkpoint::new(workflow_id, node_id, snapshot, output);
        self.insert(checkpoint.clone());
        checkpoint
    }

    /// Store an existing checkpoint, e.g. one loaded from disk.
    pub fn insert(&self, checkpoint: Checkpoint) {
        self.checkpoints
            .lock()
            .insert((checkpoint.workflow_id, checkpoint.node_id), checkpoint);
    }

    pub fn get(&self, workflow_id: WorkflowId, node_id: NodeId) -> Option<Checkpoint> {
        self.checkpoints.lock().get(&(workflow_id, node_id)).cloned()
    }

    /// All checkpoints of one workflow, oldest first.
    pub fn list(&self, workflow_id: WorkflowId) -> Vec<Checkpoint> {
        let mut found: Vec<Checkpoint> = self
            .checkpoints
            .lock()
            .values()
            .filter(|cp| cp.workflow_id == workflow_id)
            .cloned()
            .collect();
        found.sort_by_key(|cp| (cp.timestamp, cp.state.completed_node_ids.len()));
        found
    }

    pub fn clear_workflow(&self, workflow_id: WorkflowId) -> usize {
        let mut checkpoints = self.checkpoints.lock();
        let before = checkpoints.len();
        checkpoints.retain(|(wf, _), _| *wf != workflow_id);
        before - checkpoints.len()
    }

    /// Drop checkpoints written before `cutoff` unless `keep` claims their workflow.
    pub fn evict_older_than<F>(&self, cutoff: DateTime<Utc>, keep: F) -> usize
    where
        F: Fn(WorkflowId) -> bool,
    {
        let mut checkpoints = self.checkpoints.lock();
        let before = checkpoints.len();
        checkpoints.retain(|(wf, _), cp| cp.timestamp >= cutoff || keep(*wf));
        before - checkpoints.len()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn snapshot(workflow_id: WorkflowId, node_id: NodeId, output: Value) -> WorkflowExecutionState {
        let mut state = WorkflowExecutionState::new(workflow_id);
        state.record_output(node_id, output);
        state
    }

    #[test]
    fn create_then_get() {
        let store = CheckpointStore::new();
        let (wf, node) = (Uuid::new_v4(), Uuid::new_v4());

        store.create(wf, node, snapshot(wf, node, json!("outline")), json!("outline"));

        let cp = store.get(wf, node).expect("checkpoint");
        assert_eq!(cp.output, json!("outline"));
        assert_eq!(cp.state.node_outputs[&node], json!("outline"));
        assert!(store.get(wf, Uuid::new_v4()).is_none());
        assert!(store.get(Uuid::new_v4(), node).is_none());
    }

    #[test]
    fn rewrite_is_last_write_wins() {
        let store = CheckpointStore::new();
        let (wf, node) = (Uuid::new_v4(), Uuid::new_v4());

        store.create(wf, node, snapshot(wf, node, json!(1)), json!(1));
        store.create(wf, node, snapshot(wf, node, json!(2)), json!(2));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(wf, node).unwrap().output, json!(2));
    }

    #[test]
    fn clear_workflow_leaves_other_workflows() {
        let store = CheckpointStore::new();
        let (wf1, wf2, node) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.create(wf1, node, snapshot(wf1, node, json!(1)), json!(1));
        store.create(wf2, node, snapshot(wf2, node, json!(1)), json!(1));

        assert_eq!(store.clear_workflow(wf1), 1);
        assert!(store.get(wf2, node).is_some());
    }

    #[test]
    fn eviction_respects_keep() {
        let store = CheckpointStore::new();
        let (kept, dropped, node) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.create(kept, node, snapshot(kept, node, json!(1)), json!(1));
        store.create(dropped, node, snapshot(dropped, node, json!(1)), json!(1));

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let evicted = store.evict_older_than(cutoff, |wf| wf == kept);

        assert_eq!(evicted, 1);
        assert!(store.get(kept, node).is_some());
        assert!(store.get(dropped, node).is_none());
    }
}
