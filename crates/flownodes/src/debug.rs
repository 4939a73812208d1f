use async_trait::async_trait;
use flowcore::{stringify, Map, Node, NodeContext, NodeError, NodeOutput, Value, ValueKind};
use flowruntime::{NodeFactory, NodeTypeInfo, PortDefinition};

/// Simple debug node that logs its params
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = match ctx.params.get("message") {
            Some(value) => stringify(value),
            None => "(no message)".to_string(),
        };

        tracing::info!(node_id = %ctx.node_id, item = ?ctx.item_index, "{}", message);
        ctx.events.info(format!("DEBUG: {}", message));

        // Also log all params for visibility
        for (key, value) in &ctx.params {
            ctx.events.info(format!("  {}: {}", key, stringify(value)));
        }

        Ok(NodeOutput::new().with_output("message", message))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _params: &Map<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo::new("Logs params for debugging", "debug")
            .with_input(PortDefinition::optional("message", ValueKind::String).describe("Text to log"))
            .with_output(PortDefinition::optional("message", ValueKind::String).describe("The logged text"))
    }
}
