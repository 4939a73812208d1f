use crate::{Map, Value};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = String;

/// Default binding name for the current batch item.
pub const DEFAULT_ITEM_ALIAS: &str = "item";
/// Default worker pool size for parallel batches.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;
/// Hard upper bound on the worker pool size.
pub const MAX_CONCURRENT_CAP: usize = 100;

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Add an unconditional edge
    pub fn connect(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.edges.push(Edge::new(from, to));
    }

    /// Add an edge labelled with an action
    pub fn connect_on(
        &mut self,
        from: impl Into<String>,
        action: impl Into<String>,
        to: impl Into<String>,
    ) {
        self.edges.push(Edge::new(from, to).with_action(action));
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchConfig>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            params: Map::new(),
            batch: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = Some(batch);
        self
    }
}

/// Data-dependency edge between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Label of this edge, `"default"` when none was given
    pub fn action(&self) -> &str {
        self.action.as_deref().unwrap_or(crate::DEFAULT_ACTION)
    }

    /// Unconditional edges are the ones that constrain execution order
    pub fn is_unconditional(&self) -> bool {
        self.action() == crate::DEFAULT_ACTION
    }
}

/// Batch iteration settings attached to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items source, normally a `${...}` reference to an array
    pub items: Value,
    #[serde(default = "default_item_alias", alias = "as")]
    pub item_alias: String,
    #[serde(default)]
    pub parallel: bool,
    /// Worker pool size; the runtime default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    /// Attempts per item; 1 means no retry
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds to sleep between attempts
    #[serde(default)]
    pub retry_wait: f64,
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

fn default_item_alias() -> String {
    DEFAULT_ITEM_ALIAS.to_string()
}

fn default_max_retries() -> u32 {
    1
}

impl BatchConfig {
    pub fn new(items: impl Into<Value>) -> Self {
        Self {
            items: items.into(),
            item_alias: default_item_alias(),
            parallel: false,
            max_concurrent: None,
            max_retries: 1,
            retry_wait: 0.0,
            error_handling: ErrorHandling::FailFast,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.item_alias = alias.into();
        self
    }

    pub fn parallel(mut self, max_concurrent: usize) -> Self {
        self.parallel = true;
        self.max_concurrent = Some(max_concurrent);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_wait: f64) -> Self {
        self.max_retries = max_retries;
        self.retry_wait = retry_wait;
        self
    }

    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = error_handling;
        self
    }

    /// Worker pool size, falling back to `default`, clamped to `[1, cap]`
    pub fn effective_concurrency(&self, default: usize, cap: usize) -> usize {
        self.max_concurrent.unwrap_or(default).clamp(1, cap.max(1))
    }

    /// Attempts per item, never less than one
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        (self.retry_wait.is_finite() && self.retry_wait > 0.0)
            .then(|| Duration::from_secs_f64(self.retry_wait))
    }
}

/// Batch failure policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Abort the whole batch on the first failed item
    #[default]
    FailFast,
    /// Record the failure, leave a null placeholder and keep going
    Continue,
}
