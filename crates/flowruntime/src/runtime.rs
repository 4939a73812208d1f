use crate::registry::NodeRegistry;
use crate::unit::ExecutionSettings;
use crate::validator::{GraphValidator, ValidationResult};
use crate::{ExecutionFailure, ExecutionResult, WorkflowExecutor};
use flowcore::coerce::DEFAULT_COERCION_LIMIT;
use flowcore::{
    EventBus, ExecutionEvent, FlowError, Map, Value, Workflow, WorkflowError, WorkflowId,
    DEFAULT_MAX_CONCURRENT, MAX_CONCURRENT_CAP,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Workflow>>>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let executor = Arc::new(WorkflowExecutor::new(config.execution_settings()));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            registry,
            executor,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run the full validator without executing anything
    pub fn validate(&self, workflow: &Workflow, initial: &Map<String, Value>) -> ValidationResult {
        GraphValidator::new(&self.registry).validate(workflow, initial.keys().map(String::as_str))
    }

    /// Register a workflow
    pub async fn register_workflow(&self, workflow: Workflow) -> WorkflowId {
        let id = workflow.id;
        let mut workflows = self.workflows.write().await;
        workflows.insert(id, workflow);
        id
    }

    /// Execute a workflow by ID
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        initial: Map<String, Value>,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let workflows = self.workflows.read().await;
        let workflow = workflows
            .get(&workflow_id)
            .ok_or_else(|| FlowError::from(WorkflowError::NotFound(workflow_id.to_string())))?;

        self.executor
            .execute(workflow, &self.registry, &self.event_bus, initial)
            .await
    }

    /// Execute a workflow directly (without registration)
    pub async fn execute(
        &self,
        workflow: &Workflow,
        initial: Map<String, Value>,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        self.executor
            .execute(workflow, &self.registry, &self.event_bus, initial)
            .await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    /// Worker pool size for parallel batches that do not set one
    pub default_max_concurrent: usize,
    pub max_concurrent_cap: usize,
    /// How many batch item errors front ends show per node
    pub error_sample_limit: usize,
    pub coercion_limit_bytes: usize,
}

impl RuntimeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            default_max_concurrent: self.default_max_concurrent,
            max_concurrent_cap: self.max_concurrent_cap,
            coercion_limit: self.coercion_limit_bytes,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            default_max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_concurrent_cap: MAX_CONCURRENT_CAP,
            error_sample_limit: 5,
            coercion_limit_bytes: DEFAULT_COERCION_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: RuntimeConfig =
            serde_json::from_value(json!({"max_concurrent_cap": 8, "error_sample_limit": 2})).unwrap();
        assert_eq!(config.max_concurrent_cap, 8);
        assert_eq!(config.error_sample_limit, 2);
        assert_eq!(config.event_buffer_size, 1000);
        assert_eq!(config.coercion_limit_bytes, 1024 * 1024);
    }

    #[tokio::test]
    async fn unknown_workflow_id_is_not_found() {
        let runtime = FlowRuntime::new();
        let err = runtime
            .execute_workflow(WorkflowId::new_v4(), Map::new())
            .await
            .unwrap_err();
        assert!(err.execution_id.is_none());
        assert!(matches!(err.error, FlowError::Workflow(WorkflowError::NotFound(_))));
    }
}
