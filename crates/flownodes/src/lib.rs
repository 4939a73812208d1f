//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod debug;
mod http;
mod time;
mod transform;

pub use debug::{DebugNode, DebugNodeFactory};
pub use http::{HttpRequestNode, HttpRequestNodeFactory};
pub use time::{DelayNode, DelayNodeFactory};
pub use transform::{
    JsonParseNode, JsonParseNodeFactory, JsonStringifyNode, JsonStringifyNodeFactory, PickNode,
    PickNodeFactory,
};

use flowruntime::NodeRegistry;
use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(DebugNodeFactory));
    registry.register(Arc::new(HttpRequestNodeFactory));
    registry.register(Arc::new(JsonParseNodeFactory));
    registry.register(Arc::new(JsonStringifyNodeFactory));
    registry.register(Arc::new(PickNodeFactory));
    registry.register(Arc::new(DelayNodeFactory));
}
