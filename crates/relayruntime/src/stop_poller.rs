//! Bridge from a durable "stop requested" flag to the in-memory stop signal.
//!
//! The in-memory signal is lost on a process restart; an upstream store can
//! still record that a user asked for a stop. The poller re-applies it to
//! every active run.

use crate::RelayRuntime;
use async_trait::async_trait;
use relaycore::{RelayError, WorkflowId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait StopRequestSource: Send + Sync {
    async fn stop_requested(&self, workflow_id: WorkflowId) -> Result<bool, RelayError>;

    /// Called once the request has been applied. A source that keeps
    /// reporting `true` afterwards would stop every later resume of the run.
    async fn acknowledge(&self, workflow_id: WorkflowId) -> Result<(), RelayError>;
}

/// Stop requests as marker files: `<dir>/<workflow_id>.stop`
#[derive(Debug, Clone)]
pub struct StopFileSource {
    dir: PathBuf,
}

impl StopFileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self, workflow_id: WorkflowId) -> PathBuf {
        self.dir.join(format!("{}.stop", workflow_id))
    }

    pub async fn request_stop(&self, workflow_id: WorkflowId) -> Result<(), RelayError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.marker_path(workflow_id), b"").await?;
        Ok(())
    }

    /// Remove the marker. Missing markers are fine.
    pub async fn clear(&self, workflow_id: WorkflowId) -> Result<(), RelayError> {
        match tokio::fs::remove_file(self.marker_path(workflow_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StopRequestSource for StopFileSource {
    async fn stop_requested(&self, workflow_id: WorkflowId) -> Result<bool, RelayError> {
        Ok(tokio::fs::try_exists(self.marker_path(workflow_id)).await?)
    }

    async fn acknowledge(&self, workflow_id: WorkflowId) -> Result<(), RelayError> {
        self.clear(workflow_id).await
    }
}

pub struct StopPoller {
    runtime: Arc<RelayRuntime>,
    source: Arc<dyn StopRequestSource>,
    interval: Duration,
}

impl StopPoller {
    pub fn new(
        runtime: Arc<RelayRuntime>,
        source: Arc<dyn StopRequestSource>,
        interval: Duration,
    ) -> Self {
        Self {
            runtime,
            source,
            interval,
        }
    }

    /// Check every active run once. Returns the ids that were stopped.
    pub async fn poll_once(&self) -> Vec<WorkflowId> {
        let checks = self.runtime.active_workflows().into_iter().map(|workflow_id| {
            let source = self.source.clone();
            async move { (workflow_id, source.stop_requested(workflow_id).await) }
        });

        let mut stopped = Vec::new();
        for (workflow_id, requested) in futures::future::join_all(checks).await {
            match requested {
                Ok(true) => {
                    if self.runtime.stop(workflow_id) {
                        info!("Applied durable stop request for workflow {}", workflow_id);
                        if let Err(e) = self.source.acknowledge(workflow_id).await {
                            warn!("Failed to acknowledge stop for workflow {}: {}", workflow_id, e);
                        }
                        stopped.push(workflow_id);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Stop request check failed for workflow {}: {}", workflow_id, e),
            }
        }
        stopped
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }
            debug!("Stop poller stopped");
        })
    }
}
