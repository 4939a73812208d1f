use async_trait::async_trait;
use flowcore::{Map, Node, NodeContext, NodeError, NodeOutput, Value, ValueKind};
use flowruntime::{NodeFactory, NodeTypeInfo, PortDefinition};

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> &str {
        "http.request"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url = ctx.require_str("url")?;
        let method_value = ctx.param_or("method", Value::String("GET".to_string()));
        let method = method_value.as_str().unwrap_or("GET").to_uppercase();

        ctx.events.info(format!("{} {}", method, url));

        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "DELETE" => self.client.delete(url),
            "POST" | "PUT" | "PATCH" => {
                let req = match method.as_str() {
                    "POST" => self.client.post(url),
                    "PUT" => self.client.put(url),
                    _ => self.client.patch(url),
                };
                match ctx.params.get("body") {
                    Some(Value::String(text)) => req.body(text.clone()),
                    Some(Value::Null) | None => req,
                    Some(json) => req.json(json),
                }
            }
            _ => return Err(NodeError::Configuration(format!("Unsupported method: {}", method))),
        };

        // Add headers if provided
        let request = match ctx.params.get("headers") {
            Some(Value::Object(headers)) => {
                let mut req = request;
                for (key, value) in headers {
                    if let Some(val_str) = value.as_str() {
                        req = req.header(key, val_str);
                    }
                }
                req
            }
            Some(other) if !other.is_null() => {
                return Err(NodeError::invalid_type("headers", ValueKind::Object, other));
            }
            _ => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let headers_map: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status));
        tracing::debug!(node_id = %ctx.node_id, status, bytes = body_text.len(), "HTTP response");

        Ok(NodeOutput::new()
            .with_output("status", status)
            .with_output("body", body_text)
            .with_output("headers", Value::Object(headers_map)))
    }
}

pub struct HttpRequestNodeFactory;

impl NodeFactory for HttpRequestNodeFactory {
    fn create(&self, _params: &Map<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(HttpRequestNode::new()))
    }

    fn node_type(&self) -> &str {
        "http.request"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo::new("Make HTTP requests", "http")
            .with_input(PortDefinition::required("url", ValueKind::String))
            .with_input(PortDefinition::optional("method", ValueKind::String).describe("GET, POST, PUT, PATCH or DELETE"))
            .with_input(PortDefinition::optional("body", ValueKind::Any))
            .with_input(PortDefinition::optional("headers", ValueKind::Object))
            .with_output(PortDefinition::optional("status", ValueKind::Number))
            .with_output(PortDefinition::optional("body", ValueKind::String).describe("Raw response text"))
            .with_output(PortDefinition::optional("headers", ValueKind::Object))
    }
}
