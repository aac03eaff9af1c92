use crate::{CheckpointStore, ExecutionStateStore, RunLocks, RuntimeConfig};
use chrono::{DateTime, Utc};
use relaycore::WorkflowId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReapReport {
    pub reaped: Vec<WorkflowId>,
    pub evicted_checkpoints: usize,
    pub released_locks: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty() && self.evicted_checkpoints == 0 && self.released_locks == 0
    }
}

/// Periodic sweep over the state and checkpoint stores.
///
/// Clearing a record under a live loop is abrupt: the loop finds its state
/// gone and ends with `StateNotFound`.
pub struct Reaper {
    states: Arc<ExecutionStateStore>,
    checkpoints: Arc<CheckpointStore>,
    locks: Arc<RunLocks>,
    stale_after: Duration,
    checkpoint_ttl: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        states: Arc<ExecutionStateStore>,
        checkpoints: Arc<CheckpointStore>,
        locks: Arc<RunLocks>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            states,
            checkpoints,
            locks,
            stale_after: config.stale_after,
            checkpoint_ttl: config.checkpoint_ttl,
            interval: config.reaper_interval,
        }
    }

    pub fn sweep(&self) -> ReapReport {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();

        report.reaped = self.states.reap_stale(cutoff(now, self.stale_after));
        for workflow_id in &report.reaped {
            warn!("Reaped stale execution state for workflow {}", workflow_id);
            report.evicted_checkpoints += self.checkpoints.clear_workflow(*workflow_id);
        }

        let active: HashSet<WorkflowId> = self.states.active_ids().into_iter().collect();
        report.evicted_checkpoints += self
            .checkpoints
            .evict_older_than(cutoff(now, self.checkpoint_ttl), |wf| active.contains(&wf));

        report.released_locks = self.locks.release_idle();
        report
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep();
                        if !report.is_empty() {
                            info!(
                                "Reaper: {} states reaped, {} checkpoints evicted",
                                report.reaped.len(),
                                report.evicted_checkpoints
                            );
                        }
                    }
                }
            }
            debug!("Reaper stopped");
        })
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
