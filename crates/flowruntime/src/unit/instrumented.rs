use super::{ExecutableUnit, ExecutionContext};
use crate::record::{BatchSummary, ExecutionRecord, RecordStatus};
use async_trait::async_trait;
use chrono::Utc;
use flowcore::{Edge, ExecutionEvent, FlowError, Map, Value};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{error, info};

/// Outermost layer: times the node, diffs the context keys it wrote, emits
/// node events and appends an [`ExecutionRecord`]. Errors are returned
/// unchanged after being recorded.
pub struct InstrumentedUnit {
    inner: Box<dyn ExecutableUnit>,
}

impl InstrumentedUnit {
    pub fn new(inner: Box<dyn ExecutableUnit>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ExecutableUnit for InstrumentedUnit {
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
        let node_id = self.node_id().to_string();
        let node_type = self.node_type().to_string();

        info!(node_id = %node_id, node_type = %node_type, "Starting node");
        ctx.bus.emit(ExecutionEvent::NodeStarted {
            execution_id: ctx.execution_id,
            node_id: node_id.clone(),
            node_type: node_type.clone(),
            timestamp: Utc::now(),
        });

        let before: HashSet<String> = ctx.shared.output_keys().into_iter().collect();
        let started = Instant::now();
        ctx.batch_summary = None;

        let result = self.inner.run(ctx).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let keys_written: Vec<String> = ctx
            .shared
            .output_keys()
            .into_iter()
            .filter(|key| !before.contains(key))
            .collect();

        let record = match &result {
            Ok(action) => {
                info!(node_id = %node_id, action = %action, duration_ms, "Node completed");
                ctx.bus.emit(ExecutionEvent::NodeCompleted {
                    execution_id: ctx.execution_id,
                    node_id: node_id.clone(),
                    action: action.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                ExecutionRecord {
                    node_id,
                    node_type,
                    status: RecordStatus::Success,
                    action: Some(action.clone()),
                    duration_ms,
                    keys_written,
                    error: None,
                    batch: ctx.batch_summary.take(),
                }
            }
            Err(e) => {
                error!(node_id = %node_id, error = %e, duration_ms, "Node failed");
                ctx.bus.emit(ExecutionEvent::NodeFailed {
                    execution_id: ctx.execution_id,
                    node_id: node_id.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                ExecutionRecord {
                    node_id,
                    node_type,
                    status: RecordStatus::Failed,
                    action: None,
                    duration_ms,
                    keys_written,
                    error: Some(e.to_string()),
                    batch: ctx.batch_summary.take().or_else(|| BatchSummary::from_abort(e)),
                }
            }
        };
        ctx.records.push(record);

        result
    }
}

#[cfg(test)]
mod tests {
    use crate::record::RecordStatus;
    use crate::unit::test_support::registry;
    use crate::unit::{ExecutableUnit, ExecutionContext, ExecutionSettings, UnitBlueprint};
    use flowcore::{
        BatchConfig, EventBus, ExecutionEvent, ExecutionId, FlowError, NodeSpec, SharedContext,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn step(spec: NodeSpec) -> Box<dyn ExecutableUnit> {
        let resolved = registry().resolve(&spec.node_type).unwrap();
        UnitBlueprint::new(spec, resolved, vec![]).build().unwrap()
    }

    fn context(bus: Arc<EventBus>, initial: serde_json::Value) -> ExecutionContext {
        ExecutionContext::new(
            SharedContext::new(initial.as_object().cloned().unwrap()),
            bus,
            ExecutionId::nil(),
            ExecutionSettings::default(),
        )
    }

    #[tokio::test]
    async fn records_success_and_written_keys() {
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let mut ctx = context(Arc::clone(&bus), json!({}));

        let unit = step(NodeSpec::new("n1", "test.echo").with_param("value", 5));
        assert_eq!(unit.node_id(), "n1");
        assert_eq!(unit.declared_params()["value"], json!(5));

        unit.run(&mut ctx).await.unwrap();

        let record = &ctx.records[0];
        assert!(record.is_success());
        assert_eq!(record.action.as_deref(), Some("default"));
        let mut keys = record.keys_written.clone();
        keys.sort();
        assert_eq!(keys, vec!["n1.params".to_string(), "n1.value".to_string()]);
        assert!(record.batch.is_none());

        assert!(matches!(events.recv().await.unwrap(), ExecutionEvent::NodeStarted { .. }));
        assert!(matches!(events.recv().await.unwrap(), ExecutionEvent::NodeCompleted { .. }));
    }

    #[tokio::test]
    async fn records_then_reraises_failures() {
        let bus = Arc::new(EventBus::default());
        let mut ctx = context(bus, json!({}));

        let unit = step(NodeSpec::new("bad", "test.echo").with_param("fail", true));
        let err = unit.run(&mut ctx).await.unwrap_err();

        assert!(matches!(err, FlowError::Node(_)));
        assert_eq!(ctx.records[0].status, RecordStatus::Failed);
        assert!(ctx.records[0].error.as_deref().unwrap().contains("asked to fail"));
    }

    #[tokio::test]
    async fn failed_batch_record_carries_counts() {
        let bus = Arc::new(EventBus::default());
        let mut ctx = context(bus, json!({"rows": [false, true, false]}));

        let spec = NodeSpec::new("each", "test.echo")
            .with_param("fail", "${item}")
            .with_batch(BatchConfig::new("${rows}"));
        let unit = step(spec);
        let err = unit.run(&mut ctx).await.unwrap_err();

        assert!(matches!(err, FlowError::BatchAborted { succeeded: 1, total: 3, .. }));
        let batch = ctx.records[0].batch.as_ref().unwrap();
        assert_eq!((batch.count, batch.error_count), (3, 1));
    }
}
