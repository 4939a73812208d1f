use crate::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Reference error: {0}")]
    Reference(#[from] ReferenceError),

    #[error("Batch aborted after {succeeded}/{total} items succeeded: {error}")]
    BatchAborted {
        error: BatchItemError,
        succeeded: usize,
        total: usize,
    },

    #[error("Node '{node_id}' failed: {source}")]
    StepFailed {
        node_id: String,
        source: Box<FlowError>,
    },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// The innermost error, skipping `StepFailed` wrappers.
    pub fn root_cause(&self) -> &FlowError {
        match self {
            FlowError::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required param: {0}")]
    MissingParam(String),

    #[error("Invalid type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Node initialization failed: {0}")]
    InitializationFailed(String),
}

impl NodeError {
    pub fn invalid_type(field: impl Into<String>, expected: ValueKind, actual: &Value) -> Self {
        NodeError::InvalidInputType {
            field: field.into(),
            expected: expected.to_string(),
            actual: ValueKind::of(actual).to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Workflow failed validation with {} error(s): {}", .0.len(), join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure to bind a reference expression against a value context.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReferenceError {
    #[error("Malformed reference '{expression}': {reason}")]
    Syntax { expression: String, reason: String },

    #[error("Undefined reference '{name}'")]
    Undefined { name: String },

    #[error("Reference '{path}': segment '{segment}' not found in {kind}")]
    MissingSegment {
        path: String,
        segment: String,
        kind: ValueKind,
    },

    #[error("Reference '{path}': cannot traverse segment '{segment}' through {kind}")]
    NotTraversable {
        path: String,
        segment: String,
        kind: ValueKind,
    },
}

/// A problem found by the pre-flight graph validator.
///
/// Every variant carries enough context (node ids, reference text) for the
/// graph to be corrected without running it.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Workflow has no nodes")]
    EmptyWorkflow,

    #[error("Node at position {index} has an empty id")]
    EmptyNodeId { index: usize },

    #[error("Duplicate node id '{node_id}'")]
    DuplicateNode { node_id: String },

    #[error("Node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("Edge {from} -> {to} references missing node '{missing}'")]
    MissingEdgeEndpoint {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Node '{node_id}' is missing required param '{param}'")]
    MissingRequiredParam { node_id: String, param: String },

    #[error("Node '{node_id}' has an invalid batch config: {reason}")]
    InvalidBatchConfig { node_id: String, reason: String },

    #[error("Cycle detected between nodes: {}", .nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("Node '{node_id}' references '{reference}' produced by '{producer}', which has not run yet")]
    ForwardReference {
        node_id: String,
        reference: String,
        producer: String,
    },

    #[error("Node '{node_id}' references undefined name '{reference}'")]
    UndefinedReference { node_id: String, reference: String },

    #[error("Node '{node_id}' references '{reference}', which is written by several nodes: {}", .producers.join(", "))]
    AmbiguousOutput {
        node_id: String,
        reference: String,
        producers: Vec<String>,
    },

    #[error("Node '{node_id}' has a malformed reference '{reference}': {reason}")]
    MalformedReference {
        node_id: String,
        reference: String,
        reason: String,
    },
}

impl ValidationError {
    /// Coarse category of the error.
    pub fn category(&self) -> &'static str {
        match self {
            ValidationError::Cycle { .. } => "cycle",
            ValidationError::ForwardReference { .. } => "forward_reference",
            ValidationError::UndefinedReference { .. }
            | ValidationError::AmbiguousOutput { .. }
            | ValidationError::MalformedReference { .. } => "undefined_reference",
            _ => "structural",
        }
    }

    /// Node the error is attributed to, when there is one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ValidationError::DuplicateNode { node_id }
            | ValidationError::UnknownNodeType { node_id, .. }
            | ValidationError::MissingRequiredParam { node_id, .. }
            | ValidationError::InvalidBatchConfig { node_id, .. }
            | ValidationError::ForwardReference { node_id, .. }
            | ValidationError::UndefinedReference { node_id, .. }
            | ValidationError::AmbiguousOutput { node_id, .. }
            | ValidationError::MalformedReference { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// One failed item of a batch node.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("item {index} failed: {message}")]
pub struct BatchItemError {
    pub index: usize,
    pub item: Value,
    pub message: String,
}
