//! Checkpoint and state save/load to a run directory (JSON).

use crate::RelayRuntime;
use relaycore::{Checkpoint, NodeId, RelayError, WorkflowExecutionState, WorkflowId};
use std::path::{Path, PathBuf};
use tracing::instrument;

pub const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";
pub const STATE_FILENAME: &str = "state.json";

pub fn checkpoint_path(dir: &Path, node_id: NodeId) -> PathBuf {
    dir.join(format!("{}{}", node_id, CHECKPOINT_SUFFIX))
}

/// Write via a temp file and rename so a crash never leaves half a checkpoint.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RelayError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[instrument(level = "trace", skip(dir, checkpoint), fields(node_id = %checkpoint.node_id))]
pub fn save_checkpoint(dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf, RelayError> {
    let path = checkpoint_path(dir, checkpoint.node_id);
    let json = serde_json::to_vec_pretty(checkpoint)?;
    write_atomic(&path, &json)?;
    Ok(path)
}

/// All checkpoints in `dir`, oldest first. A missing directory yields none.
#[instrument(level = "trace", skip(dir))]
pub fn load_checkpoints(dir: &Path) -> Result<Vec<Checkpoint>, RelayError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut checkpoints = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_checkpoint = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(CHECKPOINT_SUFFIX));
        if !is_checkpoint {
            continue;
        }
        let bytes = std::fs::read(&path)?;
        checkpoints.push(serde_json::from_slice::<Checkpoint>(&bytes)?);
    }

    checkpoints.sort_by_key(|cp| (cp.timestamp, cp.state.completed_node_ids.len()));
    Ok(checkpoints)
}

#[instrument(level = "trace", skip(dir, state))]
pub fn save_state(dir: &Path, state: &WorkflowExecutionState) -> Result<PathBuf, RelayError> {
    let path = dir.join(STATE_FILENAME);
    let json = serde_json::to_vec_pretty(state)?;
    write_atomic(&path, &json)?;
    Ok(path)
}

#[instrument(level = "trace", skip(dir))]
pub fn load_state(dir: &Path) -> Result<Option<WorkflowExecutionState>, RelayError> {
    match std::fs::read(dir.join(STATE_FILENAME)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write every checkpoint the runtime holds for the workflow, then its state.
///
/// Returns how many checkpoints were written. A workflow without state writes
/// its checkpoints only.
#[instrument(level = "debug", skip(dir, runtime))]
pub fn save_run(
    dir: &Path,
    runtime: &RelayRuntime,
    workflow_id: WorkflowId,
) -> Result<usize, RelayError> {
    let checkpoints = runtime.checkpoints(workflow_id);
    for checkpoint in &checkpoints {
        save_checkpoint(dir, checkpoint)?;
    }
    if let Some(state) = runtime.state(workflow_id) {
        save_state(dir, &state)?;
    }
    Ok(checkpoints.len())
}
