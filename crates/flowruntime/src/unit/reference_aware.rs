use super::{ExecutableUnit, ExecutionContext};
use crate::registry::NodeTypeInfo;
use async_trait::async_trait;
use flowcore::coerce::coerce_with_limit;
use flowcore::reference::has_references;
use flowcore::{Edge, FlowError, Map, ReferenceResolver, Value, ValueKind};
use tracing::debug;

/// Resolves `${...}` references in the wrapped unit's params against the
/// live context and hands the result down as this call's effective params.
pub struct ReferenceAwareUnit {
    inner: Box<dyn ExecutableUnit>,
    info: NodeTypeInfo,
}

impl ReferenceAwareUnit {
    pub fn new(inner: Box<dyn ExecutableUnit>, info: NodeTypeInfo) -> Self {
        Self { inner, info }
    }

    fn resolve_params(&self, ctx: &ExecutionContext) -> Result<Map<String, Value>, FlowError> {
        let limit = ctx.settings.coercion_limit;
        let resolver = ReferenceResolver::new(&ctx.shared).with_coercion_limit(limit);

        let mut effective = Map::new();
        for (name, template) in self.inner.declared_params() {
            let mut value = resolver.resolve_value(template)?;
            // declared slot kinds only apply to values that came from a reference
            if has_references(template) {
                let kind = self.info.input(name).map(|p| p.kind).unwrap_or_default();
                if kind != ValueKind::Any {
                    value = coerce_with_limit(value, kind, limit);
                }
            }
            effective.insert(name.clone(), value);
        }
        Ok(effective)
    }
}

#[async_trait]
impl ExecutableUnit for ReferenceAwareUnit {
    fn node_id(&self) -> &str {
        self.inner.node_id()
    }

    fn node_type(&self) -> &str {
        self.inner.node_type()
    }

    fn declared_params(&self) -> &Map<String, Value> {
        self.inner.declared_params()
    }

    fn successors(&self) -> &[Edge] {
        self.inner.successors()
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> Result<String, FlowError> {
        let effective = self.resolve_params(ctx)?;
        debug!(node_id = %self.node_id(), params = effective.len(), "Resolved params");

        let previous = ctx.params.replace(effective);
        let result = self.inner.run(ctx).await;
        ctx.params = previous;
        result
    }
}
