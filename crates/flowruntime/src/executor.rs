use crate::compiler::{CompiledWorkflow, Compiler};
use crate::record::ExecutionRecord;
use crate::registry::NodeRegistry;
use crate::unit::{ExecutionContext, ExecutionSettings};
use chrono::Utc;
use flowcore::{
    CallEntry, EventBus, ExecutionEvent, ExecutionId, FlowError, Map, SharedContext, Value,
    Workflow,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Walks a compiled workflow one node at a time, in validated order
pub struct WorkflowExecutor {
    settings: ExecutionSettings,
}

impl WorkflowExecutor {
    pub fn new(settings: ExecutionSettings) -> Self {
        Self { settings }
    }

    /// Validate, compile and execute a workflow and return results
    pub async fn execute(
        &self,
        workflow: &Workflow,
        registry: &NodeRegistry,
        event_bus: &Arc<EventBus>,
        initial: Map<String, Value>,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        // validation errors surface before anything runs
        let compiled = Compiler::new(registry).compile(workflow, &initial)?;

        let execution_id = ExecutionId::new_v4();
        let start_time = Instant::now();

        event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow_id: workflow.id,
            timestamp: Utc::now(),
        });

        tracing::info!(
            workflow = %compiled.name,
            execution_id = %execution_id,
            nodes = compiled.steps.len(),
            "Starting workflow execution"
        );

        let result = self
            .run_steps(compiled, event_bus, execution_id, initial)
            .await;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let success = result.is_ok();

        event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            success,
            duration_ms,
            timestamp: Utc::now(),
        });

        match &result {
            Ok(_) => tracing::info!(execution_id = %execution_id, duration_ms, "Workflow completed"),
            Err(failure) => tracing::error!(
                execution_id = %execution_id,
                error = %failure.error,
                records = failure.records.len(),
                "Workflow failed"
            ),
        }

        result
    }

    async fn run_steps(
        &self,
        compiled: CompiledWorkflow,
        event_bus: &Arc<EventBus>,
        execution_id: ExecutionId,
        initial: Map<String, Value>,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let mut ctx = ExecutionContext::new(
            SharedContext::new(initial),
            Arc::clone(event_bus),
            execution_id,
            self.settings.clone(),
        );

        for step in &compiled.steps {
            let action = match step.run(&mut ctx).await {
                Ok(action) => action,
                Err(e) => {
                    return Err(ExecutionFailure {
                        error: FlowError::StepFailed {
                            node_id: step.node_id().to_string(),
                            source: Box::new(e),
                        },
                        execution_id: Some(execution_id),
                        outputs: ctx.shared.outputs(),
                        records: ctx.records,
                    });
                }
            };

            // conditional edges are recorded, not followed
            let labelled: Vec<&str> = step
                .successors()
                .iter()
                .filter(|edge| !edge.is_unconditional() && edge.action() == action)
                .map(|edge| edge.to.as_str())
                .collect();
            if !labelled.is_empty() {
                tracing::debug!(
                    node_id = %step.node_id(),
                    action = %action,
                    targets = ?labelled,
                    "Signal matches conditional edges"
                );
            }
        }

        Ok(ExecutionResult {
            execution_id,
            execution_order: compiled.execution_order,
            outputs: ctx.shared.outputs(),
            calls: ctx.shared.call_log().entries(),
            records: ctx.records,
        })
    }
}

impl Default for WorkflowExecutor {
    fn default() -> Self {
        Self::new(ExecutionSettings::default())
    }
}

/// Result of workflow execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub execution_order: Vec<String>,
    /// Output mapping of every executed node, by node id
    pub outputs: HashMap<String, Map<String, Value>>,
    pub records: Vec<ExecutionRecord>,
    /// Every inner node invocation, retries and batch items included
    pub calls: Vec<CallEntry>,
}

impl ExecutionResult {
    pub fn output(&self, node_id: &str, key: &str) -> Option<&Value> {
        self.outputs.get(node_id).and_then(|outputs| outputs.get(key))
    }

    pub fn record(&self, node_id: &str) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| r.node_id == node_id)
    }
}

/// A run that did not complete.
///
/// Carries the records of every node that ran, the failed one included,
/// so a caller can still report what happened before the halt.
#[derive(Debug, thiserror::Error)]
#[error("workflow execution failed")]
pub struct ExecutionFailure {
    #[source]
    pub error: FlowError,
    /// `None` when the workflow was rejected before it started
    pub execution_id: Option<ExecutionId>,
    pub outputs: HashMap<String, Map<String, Value>>,
    pub records: Vec<ExecutionRecord>,
}

impl ExecutionFailure {
    pub fn record(&self, node_id: &str) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| r.node_id == node_id)
    }
}

impl From<FlowError> for ExecutionFailure {
    fn from(error: FlowError) -> Self {
        Self {
            error,
            execution_id: None,
            outputs: HashMap::new(),
            records: Vec::new(),
        }
    }
}
