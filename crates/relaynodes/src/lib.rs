//! Standard node library
//!
//! Built-in node types for small pipelines and for exercising the runtime
//! without an AI provider.

mod debug;
mod input;
mod time;
mod transform;

pub use debug::DebugNode;
pub use input::InputFieldNode;
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode, TemplateNode};
use relayruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(input::InputFieldNodeFactory));
    registry.register(Arc::new(transform::JsonParseNodeFactory));
    registry.register(Arc::new(transform::JsonStringifyNodeFactory));
    registry.register(Arc::new(transform::TemplateNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
}

/// A registry with every standard node already registered
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
