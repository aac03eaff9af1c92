mod base;

pub use base::{
    progress_percent, EventBus, EventEmitter, ExecutionEvent, NodeEvent, NodeStatus,
    ProgressEvent,
};
