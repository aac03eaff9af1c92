use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relaycore::{ExecutionStatus, WorkflowExecutionState, WorkflowId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One state record plus the synchronization handles that never leave the store
struct StateEntry {
    state: WorkflowExecutionState,
    /// Registered while a loop is blocked in `wait_for_resume`
    resume_signal: Option<Arc<Notify>>,
    cancellation: CancellationToken,
}

impl StateEntry {
    fn new(workflow_id: WorkflowId) -> Self {
        Self {
            state: WorkflowExecutionState::new(workflow_id),
            resume_signal: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Wake a loop blocked on pause. A permit is stored if the waiter has
    /// registered but not yet started waiting, so the wake-up is never lost.
    fn trigger_resume_signal(&mut self) {
        if let Some(signal) = self.resume_signal.take() {
            signal.notify_one();
        }
    }

    fn touch(&mut self) {
        self.state.updated_at = Utc::now();
    }
}

/// Single source of truth for every in-flight or recent run, keyed by workflow id.
///
/// Operations on unknown ids degrade to `false` / `None`: control commands
/// routinely race against a run finishing or being cleared. The store does
/// not validate transitions made through `update`; single-writer discipline
/// per id comes from [`RunLocks`](crate::RunLocks).
#[derive(Default)]
pub struct ExecutionStateStore {
    entries: Mutex<HashMap<WorkflowId, StateEntry>>,
}

impl ExecutionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge changes into the record for `workflow_id`, creating it if absent.
    /// Returns a snapshot taken after the change.
    pub fn update<F>(&self, workflow_id: WorkflowId, f: F) -> WorkflowExecutionState
    where
        F: FnOnce(&mut WorkflowExecutionState),
    {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(workflow_id)
            .or_insert_with(|| StateEntry::new(workflow_id));
        f(&mut entry.state);
        entry.touch();
        entry.state.clone()
    }

    /// Like [`update`](Self::update) but never creates a record.
    pub fn modify<F, R>(&self, workflow_id: WorkflowId, f: F) -> Option<R>
    where
        F: FnOnce(&mut WorkflowExecutionState) -> R,
    {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&workflow_id)?;
        let result = f(&mut entry.state);
        entry.touch();
        Some(result)
    }

    /// Reset the record for a new run segment: status `executing`, fresh
    /// cancellation token, stop flag cleared. `f` applies run-specific fields.
    pub fn begin_run<F>(&self, workflow_id: WorkflowId, f: F) -> WorkflowExecutionState
    where
        F: FnOnce(&mut WorkflowExecutionState),
    {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(workflow_id)
            .or_insert_with(|| StateEntry::new(workflow_id));
        f(&mut entry.state);
        entry.state.status = ExecutionStatus::Executing;
        entry.state.force_stopped = false;
        entry.state.stopped_at = None;
        entry.state.completed_at = None;
        if entry.cancellation.is_cancelled() {
            entry.cancellation = CancellationToken::new();
        }
        entry.touch();
        entry.state.clone()
    }

    /// Replace the whole record, e.g. with a checkpoint snapshot or one loaded
    /// from disk. Handles are kept if the record already existed.
    pub fn restore(&self, state: WorkflowExecutionState) {
        let mut entries = self.entries.lock();
        let workflow_id = state.workflow_id;
        let entry = entries
            .entry(workflow_id)
            .or_insert_with(|| StateEntry::new(workflow_id));
        entry.state = state;
        entry.touch();
    }

    pub fn get(&self, workflow_id: WorkflowId) -> Option<WorkflowExecutionState> {
        self.entries
            .lock()
            .get(&workflow_id)
            .map(|entry| entry.state.clone())
    }

    pub fn contains(&self, workflow_id: WorkflowId) -> bool {
        self.entries.lock().contains_key(&workflow_id)
    }

    pub fn status(&self, workflow_id: WorkflowId) -> Option<ExecutionStatus> {
        self.entries
            .lock()
            .get(&workflow_id)
            .map(|entry| entry.state.status)
    }

    /// Delete the record. A loop blocked on pause is woken and will find the
    /// record gone.
    pub fn clear(&self, workflow_id: WorkflowId) -> bool {
        match self.entries.lock().remove(&workflow_id) {
            Some(mut entry) => {
                entry.cancellation.cancel();
                entry.trigger_resume_signal();
                true
            }
            None => false,
        }
    }

    /// Mark the run stopped and wake a loop blocked on pause.
    ///
    /// `None` for an unknown id, otherwise `Some(true)` only for the call that
    /// made the transition. A second call leaves the first `stopped_at` in place.
    pub fn stop(&self, workflow_id: WorkflowId) -> Option<bool> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&workflow_id)?;

        let transitioned = entry.state.status != ExecutionStatus::Stopped;
        if transitioned {
            entry.state.status = ExecutionStatus::Stopped;
            entry.state.current_node_id = None;
            entry.state.force_stopped = true;
            entry.state.stopped_at = Some(Utc::now());
            entry.touch();
        }
        entry.cancellation.cancel();
        entry.trigger_resume_signal();
        Some(transitioned)
    }

    /// Only valid from `executing`.
    pub fn pause(&self, workflow_id: WorkflowId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&workflow_id) {
            Some(entry) if entry.state.status == ExecutionStatus::Executing => {
                entry.state.status = ExecutionStatus::Paused;
                entry.state.paused_at = Some(Utc::now());
                entry.touch();
                true
            }
            _ => false,
        }
    }

    /// Only valid from `paused`.
    pub fn resume(&self, workflow_id: WorkflowId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&workflow_id) {
            Some(entry) if entry.state.status == ExecutionStatus::Paused => {
                entry.state.status = ExecutionStatus::Executing;
                entry.state.resumed_at = Some(Utc::now());
                entry.touch();
                entry.trigger_resume_signal();
                true
            }
            _ => false,
        }
    }

    pub fn is_stopped(&self, workflow_id: WorkflowId) -> bool {
        self.status(workflow_id) == Some(ExecutionStatus::Stopped)
    }

    pub fn is_paused(&self, workflow_id: WorkflowId) -> bool {
        self.status(workflow_id) == Some(ExecutionStatus::Paused)
    }

    /// Block until `resume`, `stop` or `clear` fires the signal registered here.
    ///
    /// Returns immediately if there is no record (so a cleared workflow never
    /// deadlocks its loop) or if the run is no longer paused.
    pub async fn wait_for_resume(&self, workflow_id: WorkflowId) {
        let signal = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&workflow_id) else {
                tracing::warn!("No state for workflow {} while waiting to resume", workflow_id);
                return;
            };
            if entry.state.status != ExecutionStatus::Paused {
                return;
            }
            entry
                .resume_signal
                .get_or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        };

        signal.notified().await;
    }

    /// Token handed to node calls; cancelled by `stop` and `clear`.
    pub fn cancellation_token(&self, workflow_id: WorkflowId) -> CancellationToken {
        self.entries
            .lock()
            .get(&workflow_id)
            .map(|entry| entry.cancellation.clone())
            .unwrap_or_default()
    }

    /// Ids whose run is executing or paused
    pub fn active_ids(&self) -> Vec<WorkflowId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state.status.is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn workflow_ids(&self) -> Vec<WorkflowId> {
        self.entries.lock().keys().copied().collect()
    }

    /// Remove every record not updated since `cutoff`, waking any loop that
    /// was paused on one. Lossy by design of the caller: the owning loop sees
    /// its record vanish.
    pub fn reap_stale(&self, cutoff: DateTime<Utc>) -> Vec<WorkflowId> {
        let mut entries = self.entries.lock();
        let stale: Vec<WorkflowId> = entries
            .iter()
            .filter(|(_, entry)| entry.state.updated_at < cutoff)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(mut entry) = entries.remove(id) {
                entry.cancellation.cancel();
                entry.trigger_resume_signal();
            }
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
