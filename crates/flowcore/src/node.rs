use crate::{events::EventEmitter, CallLog, Map, NodeError, Value, ValueKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Signal returned by a node that has nothing special to report.
pub const DEFAULT_ACTION: &str = "default";

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "http.request", "transform.json_parse")
    fn node_type(&self) -> &str;

    /// Execute the node with its resolved params
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,

    /// Effective params for this call, references already resolved
    pub params: Map<String, Value>,

    /// Position of the current item when running inside a batch
    pub item_index: Option<usize>,

    /// 1-based attempt number
    pub attempt: u32,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Run-wide call log
    pub call_log: CallLog,
}

impl NodeContext {
    pub fn new(node_id: impl Into<String>, events: EventEmitter) -> Self {
        Self {
            node_id: node_id.into(),
            params: Map::new(),
            item_index: None,
            attempt: 1,
            events,
            call_log: CallLog::new(),
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Get required param or return error
    pub fn require_param(&self, name: &str) -> Result<&Value, NodeError> {
        self.params
            .get(name)
            .ok_or_else(|| NodeError::MissingParam(name.to_string()))
    }

    /// Get a required string param
    pub fn require_str(&self, name: &str) -> Result<&str, NodeError> {
        let value = self.require_param(name)?;
        value
            .as_str()
            .ok_or_else(|| NodeError::invalid_type(name, ValueKind::String, value))
    }

    /// Get param with default
    pub fn param_or(&self, name: &str, default: Value) -> Value {
        self.params.get(name).cloned().unwrap_or(default)
    }
}

/// Output from node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Values written to the node's namespace
    pub outputs: Map<String, Value>,

    /// Continuation signal
    pub action: String,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self {
            outputs: Map::new(),
            action: DEFAULT_ACTION.to_string(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new()
    }
}
