use crate::registry::NodeRegistry;
use crate::unit::{ExecutableUnit, UnitBlueprint};
use crate::validator::GraphValidator;
use flowcore::{FlowError, Map, Value, Workflow, WorkflowError, WorkflowId};

/// A validated workflow, one unit chain per node in execution order.
pub struct CompiledWorkflow {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub execution_order: Vec<String>,
    pub steps: Vec<Box<dyn ExecutableUnit>>,
}

/// Turns a workflow into executable steps.
pub struct Compiler<'a> {
    registry: &'a NodeRegistry,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a NodeRegistry) -> Self {
        Self { registry }
    }

    /// Validate the graph against the given initial params and build each
    /// node's unit chain. Fails with every validation error at once.
    pub fn compile(
        &self,
        workflow: &Workflow,
        initial: &Map<String, Value>,
    ) -> Result<CompiledWorkflow, FlowError> {
        let execution_order = GraphValidator::new(self.registry)
            .validate(workflow, initial.keys().map(String::as_str))
            .into_result()?;

        let mut steps = Vec::with_capacity(execution_order.len());
        for node_id in &execution_order {
            let spec = workflow
                .find_node(node_id)
                .ok_or_else(|| WorkflowError::NodeNotFound(node_id.clone()))?;
            let node_type = self.registry.resolve(&spec.node_type)?;
            let successors = workflow
                .edges
                .iter()
                .filter(|edge| &edge.from == node_id)
                .cloned()
                .collect();

            let blueprint = UnitBlueprint::new(spec.clone(), node_type, successors);
            steps.push(blueprint.build()?);
        }

        tracing::debug!(workflow = %workflow.name, steps = steps.len(), "Compiled workflow");

        Ok(CompiledWorkflow {
            workflow_id: workflow.id,
            name: workflow.name.clone(),
            execution_order,
            steps,
        })
    }
}
