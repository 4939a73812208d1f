use async_trait::async_trait;
use flowcore::reference::parse_path;
use flowcore::{Map, Node, NodeContext, NodeError, NodeOutput, PathSegment, Value, ValueKind};
use flowruntime::{NodeFactory, NodeTypeInfo, PortDefinition};

/// Parse JSON string to Value
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_str("json")?;

        let parsed: Value = serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::new().with_output("parsed", parsed))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _params: &Map<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonParseNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo::new("Parse JSON string", "transform")
            .with_input(PortDefinition::required("json", ValueKind::String))
            .with_output(PortDefinition::optional("parsed", ValueKind::Any))
    }
}

/// Stringify Value to JSON
pub struct JsonStringifyNode;

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_param("value")?;
        let pretty = ctx.param_or("pretty", Value::Bool(false)).as_bool().unwrap_or(false);

        let json_str = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new().with_output("json", json_str))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, _params: &Map<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonStringifyNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo::new("Convert value to JSON string", "transform")
            .with_input(PortDefinition::required("value", ValueKind::Any))
            .with_input(PortDefinition::optional("pretty", ValueKind::Bool))
            .with_output(PortDefinition::optional("json", ValueKind::String))
    }
}

/// Extract one value from an object by path, e.g. `user.emails[0]`
pub struct PickNode;

#[async_trait]
impl Node for PickNode {
    fn node_type(&self) -> &str {
        "transform.pick"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let source = ctx.require_param("source")?;
        if !source.is_object() {
            return Err(NodeError::invalid_type("source", ValueKind::Object, source));
        }
        let path = ctx.require_str("path")?;
        let (root, segments) =
            parse_path(path).map_err(|e| NodeError::Configuration(e.to_string()))?;

        let mut current = source
            .get(&root)
            .ok_or_else(|| NodeError::ExecutionFailed(format!("Key '{}' not found", root)))?;
        for segment in &segments {
            let next = match segment {
                PathSegment::Key(key) => current.get(key),
                PathSegment::Index(index) => current.get(*index),
            };
            current = next.ok_or_else(|| {
                NodeError::ExecutionFailed(format!("Path '{}' has no segment '{}'", path, segment))
            })?;
        }

        Ok(NodeOutput::new().with_output("value", current.clone()))
    }
}

pub struct PickNodeFactory;

impl NodeFactory for PickNodeFactory {
    fn create(&self, _params: &Map<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(PickNode))
    }

    fn node_type(&self) -> &str {
        "transform.pick"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo::new("Pick a value out of an object", "transform")
            .with_input(PortDefinition::required("source", ValueKind::Object))
            .with_input(PortDefinition::required("path", ValueKind::String))
            .with_output(PortDefinition::optional("value", ValueKind::Any))
    }
}
