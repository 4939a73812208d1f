use super::{ExecutableUnit, ExecutionContext};
use async_trait::async_trait;
use flowcore::{Edge, FlowError, Map, Value};

/// Gives the wrapped unit a private write scope and commits it as the
/// node's output mapping once the unit succeeds.
///
/// Reads are unaffected: the unit keeps seeing initial params and every
/// earlier node's outputs through the shared context. Only the outputs the
/// node type declares become readable by bare name.
pub struct NamespacedUnit {
    inner: Box<dyn ExecutableUnit>,
    declared_outputs: Vec<String>,
}

impl NamespacedUnit {
    pub fn new(inner: Box<dyn ExecutableUnit>, declared_outputs: Vec<String>) -> Self {
        Self {
            inner,
            declared_outputs,
        }
    }
}

#[async_trait]
impl ExecutableUnit for NamespacedUnit {
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
        let outer = ctx.scope.replace(Map::new());
        let result = self.inner.run(ctx).await;
        let written = std::mem::replace(&mut ctx.scope, outer).unwrap_or_default();

        let action = result?;
        ctx.shared.commit_declared(
            self.node_id(),
            written,
            self.declared_outputs.iter().map(String::as_str),
        )?;
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use crate::unit::test_support::registry;
    use crate::unit::{ExecutionContext, ExecutionSettings, UnitBlueprint};
    use flowcore::{
        EventBus, ExecutionId, Map, NodeSpec, ReferenceError, ReferenceResolver, SharedContext,
        DEFAULT_ACTION,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn chain(id: &str, params: serde_json::Value) -> Box<dyn crate::unit::ExecutableUnit> {
        let mut spec = NodeSpec::new(id, "test.echo");
        spec.params = params.as_object().cloned().unwrap();
        let resolved = registry().resolve("test.echo").unwrap();
        UnitBlueprint::new(spec, resolved, vec![]).build_inner().unwrap()
    }

    fn context() -> ExecutionContext {
        let mut initial = Map::new();
        initial.insert("value".into(), json!("initial"));
        ExecutionContext::new(
            SharedContext::new(initial),
            Arc::new(EventBus::default()),
            ExecutionId::nil(),
            ExecutionSettings::default(),
        )
    }

    #[tokio::test]
    async fn outputs_land_in_the_node_namespace_only() {
        let mut ctx = context();
        let action = chain("first", json!({"value": 1})).run(&mut ctx).await.unwrap();

        assert_eq!(action, DEFAULT_ACTION);
        assert_eq!(ctx.shared.namespace("first").unwrap()["value"], json!(1));
        // initial params still win for bare names
        assert_eq!(ctx.shared.initial()["value"], json!("initial"));
        assert!(ctx.scope.is_none());
    }

    #[tokio::test]
    async fn later_nodes_read_earlier_namespaces() {
        let mut ctx = context();
        chain("first", json!({"value": [1, 2]})).run(&mut ctx).await.unwrap();
        chain("second", json!({"value": "${first.value[1]}"}))
            .run(&mut ctx)
            .await
            .unwrap();

        assert_eq!(ctx.shared.namespace("second").unwrap()["value"], json!(2));
        assert_eq!(ctx.shared.executed_nodes(), &["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn undeclared_outputs_are_not_bare_names() {
        let mut ctx = context();
        chain("first", json!({"value": 1, "extra": "x"})).run(&mut ctx).await.unwrap();

        // echo declares `value` only; `params` is reachable through the node id
        let resolver = ReferenceResolver::new(&ctx.shared);
        assert!(matches!(
            resolver.resolve("params"),
            Err(ReferenceError::Undefined { .. })
        ));
        assert_eq!(resolver.resolve("first.params.extra").unwrap(), json!("x"));
    }

    #[tokio::test]
    async fn failed_node_commits_nothing() {
        let mut ctx = context();
        let result = chain("broken", json!({"fail": true})).run(&mut ctx).await;

        assert!(result.is_err());
        assert!(ctx.shared.namespace("broken").is_none());
        assert_eq!(ctx.shared.call_log().len(), 1);
    }

    #[tokio::test]
    async fn namespace_is_written_once() {
        let mut ctx = context();
        let unit = chain("once", json!({}));
        unit.run(&mut ctx).await.unwrap();
        assert!(unit.run(&mut ctx).await.is_err());
    }
}
