use parking_lot::Mutex;
use relaycore::{RelayError, WorkflowId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Proof that the holder is the only continuation loop for its workflow.
///
/// Released on drop.
pub struct RunLease {
    workflow_id: WorkflowId,
    _guard: OwnedMutexGuard<()>,
}

impl RunLease {
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }
}

impl std::fmt::Debug for RunLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLease")
            .field("workflow_id", &self.workflow_id)
            .finish()
    }
}

/// Per-workflow run locks
#[derive(Default)]
pub struct RunLocks {
    locks: Mutex<HashMap<WorkflowId, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `workflow_id` without waiting.
    pub fn try_acquire(&self, workflow_id: WorkflowId) -> Result<RunLease, RelayError> {
        let lock = self.locks.lock().entry(workflow_id).or_default().clone();
        lock.try_lock_owned()
            .map(|guard| RunLease {
                workflow_id,
                _guard: guard,
            })
            .map_err(|_| RelayError::AlreadyRunning(workflow_id))
    }

    pub fn is_running(&self, workflow_id: WorkflowId) -> bool {
        self.locks
            .lock()
            .get(&workflow_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Forget locks nobody holds or is about to take. Returns how many were dropped.
    pub fn release_idle(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        // a lease or an in-progress `try_acquire` holds a second reference
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn second_lease_for_same_workflow_is_refused() {
        let locks = RunLocks::new();
        let id = Uuid::new_v4();

        let lease = locks.try_acquire(id).expect("first lease");
        assert!(matches!(
            locks.try_acquire(id),
            Err(RelayError::AlreadyRunning(wf)) if wf == id
        ));
        assert!(locks.is_running(id));

        // other workflows are independent
        assert!(locks.try_acquire(Uuid::new_v4()).is_ok());

        drop(lease);
        assert!(!locks.is_running(id));
        assert!(locks.try_acquire(id).is_ok());
    }

    #[test]
    fn release_idle_keeps_held_locks() {
        let locks = RunLocks::new();
        let held = locks.try_acquire(Uuid::new_v4()).unwrap();
        drop(locks.try_acquire(Uuid::new_v4()).unwrap());

        assert_eq!(locks.release_idle(), 1);
        assert!(locks.is_running(held.workflow_id()));
    }
}
