use super::{ExecutableUnit, ExecutionContext, UnitBlueprint};
use crate::batch_executor::{BatchExecutor, ItemCall, ItemFn};
use crate::record::BatchSummary;
use async_trait::async_trait;
use flowcore::coerce::coerce_with_limit;
use flowcore::{
    Edge, FlowError, Map, NodeError, ReferenceResolver, Value, ValueKind, DEFAULT_ACTION,
};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs the node once per item of its batch source.
///
/// Each item gets a shallow copy of the shared context with the item bound
/// at the top level, and a freshly built inner chain. The aggregate is
/// committed to the node's namespace once every item has finished.
pub struct BatchUnit {
    blueprint: Arc<UnitBlueprint>,
}

impl BatchUnit {
    pub fn new(blueprint: Arc<UnitBlueprint>) -> Self {
        Self { blueprint }
    }

    fn resolve_items(&self, ctx: &ExecutionContext, source: &Value) -> Result<Vec<Value>, FlowError> {
        let limit = ctx.settings.coercion_limit;
        let resolved = ReferenceResolver::new(&ctx.shared)
            .with_coercion_limit(limit)
            .resolve_value(source)?;

        match coerce_with_limit(resolved, ValueKind::Array, limit) {
            Value::Array(items) => Ok(items),
            other => Err(NodeError::invalid_type("batch.items", ValueKind::Array, &other).into()),
        }
    }

    fn item_fn(&self, ctx: &ExecutionContext, alias: String) -> ItemFn {
        let blueprint = Arc::clone(&self.blueprint);
        let base = ctx.shared.clone();
        let bus = Arc::clone(&ctx.bus);
        let execution_id = ctx.execution_id;
        let settings = ctx.settings.clone();

        Arc::new(move |call: ItemCall| {
            let blueprint = Arc::clone(&blueprint);
            let mut shared = base.clone();
            shared.bind_local(alias.clone(), call.item);
            let mut item_ctx =
                ExecutionContext::new(shared, Arc::clone(&bus), execution_id, settings.clone())
                    .for_item(call.index, call.attempt);

            async move {
                let unit = blueprint.build_inner()?;
                unit.run(&mut item_ctx).await?;
                Ok::<_, FlowError>(
                    item_ctx
                        .shared
                        .namespace(unit.node_id())
                        .map(|outputs| Value::Object(outputs.clone()))
                        .unwrap_or(Value::Null),
                )
            }
            .boxed()
        })
    }
}

#[async_trait]
impl ExecutableUnit for BatchUnit {
    fn node_id(&self) -> &str {
        &self.blueprint.spec.id
    }

    fn node_type(&self) -> &str {
        &self.blueprint.spec.node_type
    }

    fn declared_params(&self) -> &Map<String, Value> {
        &self.blueprint.spec.params
    }

    fn successors(&self) -> &[Edge] {
        &self.blueprint.successors
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> Result<String, FlowError> {
        let node_id = self.node_id();
        let config = self.blueprint.spec.batch.clone().ok_or_else(|| {
            FlowError::Execution(format!("Node '{}' has no batch config", node_id))
        })?;

        let items = self.resolve_items(ctx, &config.items)?;
        debug!(node_id = %node_id, items = items.len(), parallel = config.parallel, "Resolved batch items");

        let per_item = self.item_fn(ctx, config.item_alias.clone());
        let executor = BatchExecutor::new(
            config,
            ctx.settings.default_max_concurrent,
            ctx.settings.max_concurrent_cap,
        )
        .with_events(Arc::clone(&ctx.bus), ctx.execution_id, node_id);

        let outcome = executor.run(items, per_item).await?;
        info!(
            node_id = %node_id,
            count = outcome.count(),
            success_count = outcome.success_count(),
            error_count = outcome.error_count(),
            "Batch finished"
        );

        ctx.batch_summary = Some(BatchSummary::from_outcome(&outcome));
        ctx.shared.commit(node_id, outcome.into_output())?;
        Ok(DEFAULT_ACTION.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::test_support::registry;
    use crate::unit::ExecutionSettings;
    use flowcore::{BatchConfig, ErrorHandling, EventBus, ExecutionId, NodeSpec, SharedContext};
    use serde_json::json;

    fn batch_unit(params: Value, config: BatchConfig) -> BatchUnit {
        let mut spec = NodeSpec::new("each", "test.echo").with_batch(config);
        spec.params = params.as_object().cloned().unwrap();
        let resolved = registry().resolve("test.echo").unwrap();
        BatchUnit::new(UnitBlueprint::new(spec, resolved, vec![]))
    }

    fn context(initial: Value) -> ExecutionContext {
        ExecutionContext::new(
            SharedContext::new(initial.as_object().cloned().unwrap()),
            Arc::new(EventBus::default()),
            ExecutionId::nil(),
            ExecutionSettings::default(),
        )
    }

    #[tokio::test]
    async fn item_alias_is_a_top_level_name() {
        let unit = batch_unit(
            json!({"value": "${row.name}-${prefix}"}),
            BatchConfig::new("${rows}").with_alias("row"),
        );
        let mut ctx = context(json!({
            "prefix": "p",
            "rows": [{"name": "a"}, {"name": "b"}]
        }));

        unit.run(&mut ctx).await.unwrap();

        let output = ctx.shared.namespace("each").unwrap();
        assert_eq!(output["count"], json!(2));
        assert_eq!(output["results"][0]["value"], json!("a-p"));
        assert_eq!(output["results"][1]["value"], json!("b-p"));
        assert_eq!(output["errors"], Value::Null);
        // the binding never leaks into the parent context
        assert!(ctx.shared.local("row").is_none());
        assert_eq!(ctx.batch_summary.as_ref().unwrap().success_count, 2);
    }

    #[tokio::test]
    async fn items_given_as_json_string_are_parsed() {
        let unit = batch_unit(json!({"value": "${item}"}), BatchConfig::new("${raw}"));
        let mut ctx = context(json!({"raw": "[1, 2, 3]"}));

        unit.run(&mut ctx).await.unwrap();
        let output = ctx.shared.namespace("each").unwrap();
        let values: Vec<&Value> = output["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| &r["value"])
            .collect();
        assert_eq!(values, vec![&json!(1), &json!(2), &json!(3)]);
    }

    #[tokio::test]
    async fn non_array_source_fails() {
        let unit = batch_unit(json!({}), BatchConfig::new("${scalar}"));
        let mut ctx = context(json!({"scalar": 42}));

        let err = unit.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, FlowError::Node(NodeError::InvalidInputType { .. })));
        assert!(ctx.shared.namespace("each").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_continue_collects_item_errors() {
        let unit = batch_unit(
            json!({"value": "${item.v}", "fail": "${item.bad}"}),
            BatchConfig::new("${rows}")
                .parallel(3)
                .with_error_handling(ErrorHandling::Continue),
        );
        let mut ctx = context(json!({
            "rows": [
                {"v": 0, "bad": false},
                {"v": 1, "bad": true},
                {"v": 2, "bad": false}
            ]
        }));

        unit.run(&mut ctx).await.unwrap();

        let output = ctx.shared.namespace("each").unwrap();
        assert_eq!(output["success_count"], json!(2));
        assert_eq!(output["error_count"], json!(1));
        assert_eq!(output["results"][0]["value"], json!(0));
        assert_eq!(output["results"][1], Value::Null);
        assert_eq!(output["errors"][0]["index"], json!(1));
        assert_eq!(output["errors"][0]["item"], json!({"v": 1, "bad": true}));
        assert_eq!(ctx.shared.call_log().len(), 3);
    }
}
