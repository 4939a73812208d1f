//! Executable units and the wrapper chain built around each node.
//!
//! Every node compiles to the same fixed stack, outermost first:
//! [`InstrumentedUnit`], [`BatchUnit`] (batch nodes only), [`NamespacedUnit`],
//! [`ReferenceAwareUnit`], then the [`NodeUnit`] leaf that calls the node
//! implementation. Units hold no per-call state: effective params, the write
//! scope and retry bookkeeping all live in the [`ExecutionContext`] or on the
//! stack of the call that needs them.

mod batch;
mod instrumented;
mod namespace;
mod reference_aware;

pub use batch::BatchUnit;
pub use instrumented::InstrumentedUnit;
pub use namespace::NamespacedUnit;
pub use reference_aware::ReferenceAwareUnit;

use crate::record::{BatchSummary, ExecutionRecord};
use crate::registry::ResolvedNodeType;
use async_trait::async_trait;
use chrono::Utc;
use flowcore::coerce::DEFAULT_COERCION_LIMIT;
use flowcore::{
    CallEntry, Edge, EventBus, ExecutionId, FlowError, Map, Node, NodeContext, NodeSpec,
    SharedContext, Value, DEFAULT_MAX_CONCURRENT, MAX_CONCURRENT_CAP,
};
use std::sync::Arc;
use std::time::Instant;

/// Limits shared by every unit in a run.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub default_max_concurrent: usize,
    pub max_concurrent_cap: usize,
    pub coercion_limit: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_concurrent_cap: MAX_CONCURRENT_CAP,
            coercion_limit: DEFAULT_COERCION_LIMIT,
        }
    }
}

/// Mutable state threaded through one unit chain invocation.
pub struct ExecutionContext {
    pub shared: SharedContext,
    /// Effective params for the call in progress, set by the reference-aware layer
    pub params: Option<Map<String, Value>>,
    /// Write scope for the node in progress, installed by the namespace layer
    pub scope: Option<Map<String, Value>>,
    pub item_index: Option<usize>,
    pub attempt: u32,
    pub bus: Arc<EventBus>,
    pub execution_id: ExecutionId,
    pub settings: ExecutionSettings,
    pub records: Vec<ExecutionRecord>,
    /// Left by the batch layer for the instrumented layer to pick up
    pub batch_summary: Option<BatchSummary>,
}

impl ExecutionContext {
    pub fn new(
        shared: SharedContext,
        bus: Arc<EventBus>,
        execution_id: ExecutionId,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            shared,
            params: None,
            scope: None,
            item_index: None,
            attempt: 1,
            bus,
            execution_id,
            settings,
            records: Vec::new(),
            batch_summary: None,
        }
    }

    /// Context for one attempt of one batch item.
    pub fn for_item(mut self, index: usize, attempt: u32) -> Self {
        self.item_index = Some(index);
        self.attempt = attempt;
        self
    }
}

/// Common contract of the inner node unit and every wrapper.
///
/// Wrappers report the identity of the unit they wrap, so the outermost
/// layer can be inspected as if it were the node itself.
#[async_trait]
pub trait ExecutableUnit: Send + Sync {
    fn node_id(&self) -> &str;

    fn node_type(&self) -> &str;

    /// Static params as written in the graph, references unresolved
    fn declared_params(&self) -> &Map<String, Value>;

    /// Outgoing edges of the node
    fn successors(&self) -> &[Edge];

    /// Run the unit and return its signal.
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<String, FlowError>;
}

/// Immutable template a node's unit chain is built from.
///
/// Parallel batch workers build their own chain from it for every item, so
/// no two workers ever share a node instance.
pub struct UnitBlueprint {
    pub spec: NodeSpec,
    pub node_type: ResolvedNodeType,
    pub successors: Vec<Edge>,
}

impl UnitBlueprint {
    pub fn new(spec: NodeSpec, node_type: ResolvedNodeType, successors: Vec<Edge>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            node_type,
            successors,
        })
    }

    /// The complete chain for a top-level step.
    pub fn build(self: &Arc<Self>) -> Result<Box<dyn ExecutableUnit>, FlowError> {
        let inner: Box<dyn ExecutableUnit> = if self.spec.batch.is_some() {
            Box::new(BatchUnit::new(Arc::clone(self)))
        } else {
            self.build_inner()?
        };
        Ok(Box::new(InstrumentedUnit::new(inner)))
    }

    /// Namespace isolation, reference resolution and a fresh node instance.
    pub fn build_inner(self: &Arc<Self>) -> Result<Box<dyn ExecutableUnit>, FlowError> {
        let node = self.node_type.factory.create(&self.spec.params)?;
        let leaf = NodeUnit::new(Arc::clone(self), node);
        let aware = ReferenceAwareUnit::new(Box::new(leaf), self.node_type.info.clone());
        let declared = self.node_type.info.output_names().map(str::to_string).collect();
        Ok(Box::new(NamespacedUnit::new(Box::new(aware), declared)))
    }
}

/// Leaf unit: calls the node implementation with the effective params.
pub struct NodeUnit {
    blueprint: Arc<UnitBlueprint>,
    node: Box<dyn Node>,
}

impl NodeUnit {
    pub fn new(blueprint: Arc<UnitBlueprint>, node: Box<dyn Node>) -> Self {
        Self { blueprint, node }
    }
}

#[async_trait]
impl ExecutableUnit for NodeUnit {
    fn node_id(&self) -> &str {
        &self.blueprint.spec.id
    }

    fn node_type(&self) -> &str {
        self.node.node_type()
    }

    fn declared_params(&self) -> &Map<String, Value> {
        &self.blueprint.spec.params
    }

    fn successors(&self) -> &[Edge] {
        &self.blueprint.successors
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> Result<String, FlowError> {
        let node_id = self.node_id();
        let params = ctx
            .params
            .clone()
            .unwrap_or_else(|| self.declared_params().clone());

        let mut node_ctx = NodeContext::new(node_id, ctx.bus.create_emitter(ctx.execution_id, node_id))
            .with_params(params);
        node_ctx.item_index = ctx.item_index;
        node_ctx.attempt = ctx.attempt;
        node_ctx.call_log = ctx.shared.call_log().clone();

        let started = Instant::now();
        let result = self.node.execute(node_ctx).await;
        ctx.shared.call_log().append(CallEntry {
            node_id: node_id.to_string(),
            item_index: ctx.item_index,
            attempt: ctx.attempt,
            duration_ms: started.elapsed().as_millis() as u64,
            ok: result.is_ok(),
            timestamp: Utc::now(),
        });

        let output = result?;
        let scope = ctx.scope.as_mut().ok_or_else(|| {
            FlowError::Execution(format!("No output scope installed for node '{}'", node_id))
        })?;
        scope.extend(output.outputs);
        Ok(output.action)
    }
}
