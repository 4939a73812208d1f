//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types that all other components
//! depend on: the graph model, the layered value context, reference
//! resolution and coercion, node contracts, errors and events. It has no
//! dependency on the execution runtime.

pub mod coerce;
mod context;
mod error;
pub mod events;
mod node;
pub mod reference;
mod value;
mod workflow;

pub use context::{CallEntry, CallLog, SharedContext};
pub use error::{
    BatchItemError, FlowError, NodeError, ReferenceError, ValidationError, WorkflowError,
};
pub use events::*;
pub use node::{Node, NodeContext, NodeOutput, DEFAULT_ACTION};
pub use reference::{PathSegment, Reference, ReferenceResolver, ValueLookup};
pub use value::{stringify, Map, Value, ValueKind};
pub use workflow::{
    BatchConfig, Edge, ErrorHandling, NodeId, NodeSpec, Workflow, WorkflowId,
    DEFAULT_ITEM_ALIAS, DEFAULT_MAX_CONCURRENT, MAX_CONCURRENT_CAP,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
