use async_trait::async_trait;
use flowcore::{Map, Node, NodeContext, NodeError, NodeOutput, Value, ValueKind};
use flowruntime::{NodeFactory, NodeTypeInfo, PortDefinition};
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Delay execution for a specified duration
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = match ctx.params.get("delay_ms") {
            None => DEFAULT_DELAY_MS,
            Some(value) => value
                .as_u64()
                .or_else(|| value.as_f64().filter(|ms| *ms >= 0.0).map(|ms| ms as u64))
                .ok_or_else(|| NodeError::invalid_type("delay_ms", ValueKind::Number, value))?,
        };

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        sleep(Duration::from_millis(delay_ms)).await;

        // Pass through every other param
        let mut outputs = ctx.params.clone();
        outputs.remove("delay_ms");

        Ok(NodeOutput {
            outputs,
            ..NodeOutput::new()
        })
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _params: &Map<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo::new("Delay execution for specified milliseconds", "time").with_input(
            PortDefinition::optional("delay_ms", ValueKind::Number).describe("Defaults to 1000"),
        )
    }
}
