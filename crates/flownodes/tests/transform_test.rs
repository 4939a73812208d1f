use flowcore::{
    BatchConfig, ErrorHandling, EventEmitter, FlowError, Map, Node, NodeContext, NodeError,
    NodeSpec, Value, Workflow,
};
use flownodes::{register_all, JsonParseNode, JsonStringifyNode, PickNode};
use flowruntime::{FlowRuntime, NodeRegistry, RuntimeConfig};
use serde_json::json;
use std::sync::Arc;

fn runtime() -> FlowRuntime {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default())
}

fn params(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn node_ctx(params_json: Value) -> NodeContext {
    NodeContext::new("n", EventEmitter::detached("n")).with_params(params(params_json))
}

#[tokio::test]
async fn json_parse_parses_strings() {
    let output = JsonParseNode
        .execute(node_ctx(json!({"json": "{\"a\": [1, 2]}"})))
        .await
        .unwrap();
    assert_eq!(output.outputs["parsed"], json!({"a": [1, 2]}));
}

#[tokio::test]
async fn json_parse_rejects_non_strings() {
    let err = JsonParseNode
        .execute(node_ctx(json!({"json": 5})))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::InvalidInputType { ref field, .. } if field == "json"));
}

#[tokio::test]
async fn json_stringify_is_compact_by_default() {
    let output = JsonStringifyNode
        .execute(node_ctx(json!({"value": {"k": [true, null]}})))
        .await
        .unwrap();
    assert_eq!(output.outputs["json"], json!("{\"k\":[true,null]}"));
}

#[tokio::test]
async fn pick_follows_paths() {
    let output = PickNode
        .execute(node_ctx(json!({
            "source": {"user": {"emails": ["a@x", "b@x"]}},
            "path": "user.emails[1]"
        })))
        .await
        .unwrap();
    assert_eq!(output.outputs["value"], json!("b@x"));

    let err = PickNode
        .execute(node_ctx(json!({"source": {"user": {}}, "path": "user.name"})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("name"));
}

#[tokio::test]
async fn object_slot_accepts_json_text_from_a_reference() {
    let mut workflow = Workflow::new("pick from text");
    workflow.add_node(
        NodeSpec::new("pick", "transform.pick")
            .with_param("source", "${raw}")
            .with_param("path", "id"),
    );

    let result = runtime()
        .execute(&workflow, params(json!({"raw": "{\"id\": \"007\"}"})))
        .await
        .unwrap();

    // the slot was coerced to an object, the numeric-looking id was not touched
    assert_eq!(result.output("pick", "value"), Some(&json!("007")));
}

#[tokio::test]
async fn batch_parse_then_pick() {
    let mut workflow = Workflow::new("parse each");
    workflow.add_node(
        NodeSpec::new("parse", "transform.json_parse")
            .with_param("json", "${doc}")
            .with_batch(BatchConfig::new("${docs}").with_alias("doc").parallel(2)),
    );
    workflow.add_node(
        NodeSpec::new("second", "transform.pick")
            .with_param("source", "${parse.results[1].parsed}")
            .with_param("path", "name"),
    );
    workflow.add_node(
        NodeSpec::new("report", "transform.json_stringify")
            .with_param("value", "${second.value} of ${parse.count}"),
    );
    workflow.connect("parse", "second");
    workflow.connect("second", "report");

    let initial = params(json!({
        "docs": ["{\"name\": \"first\"}", "{\"name\": \"second\"}", "{\"name\": \"third\"}"]
    }));
    let result = runtime().execute(&workflow, initial).await.unwrap();

    assert_eq!(result.execution_order, vec!["parse", "second", "report"]);
    assert_eq!(result.output("parse", "success_count"), Some(&json!(3)));
    assert_eq!(result.output("second", "value"), Some(&json!("second")));
    assert_eq!(result.output("report", "json"), Some(&json!("\"second of 3\"")));
    // one call per item plus one per plain node
    assert_eq!(result.calls.len(), 5);
}

#[tokio::test]
async fn tolerated_parse_failures_are_summarised() {
    let mut workflow = Workflow::new("bad docs");
    workflow.add_node(
        NodeSpec::new("parse", "transform.json_parse")
            .with_param("json", "${item}")
            .with_batch(BatchConfig::new("${docs}").with_error_handling(ErrorHandling::Continue)),
    );

    let initial = params(json!({"docs": ["[1]", "not json", "{}"]}));
    let result = runtime().execute(&workflow, initial).await.unwrap();

    let summary = result.record("parse").unwrap().batch.clone().unwrap();
    assert_eq!((summary.count, summary.success_count, summary.error_count), (3, 2, 1));
    assert_eq!(summary.errors[0].index, 1);
    assert_eq!(summary.errors[0].item, json!("not json"));
    assert_eq!(result.output("parse", "results").unwrap()[1], Value::Null);
}

#[tokio::test]
async fn fail_fast_batch_stops_the_workflow() {
    let mut workflow = Workflow::new("strict");
    workflow.add_node(
        NodeSpec::new("parse", "transform.json_parse")
            .with_param("json", "${item}")
            .with_batch(BatchConfig::new("${docs}")),
    );
    workflow.add_node(NodeSpec::new("after", "debug.log").with_param("message", "${parse.count}"));
    workflow.connect("parse", "after");

    let initial = params(json!({"docs": ["1", "{broken"]}));
    let failure = runtime().execute(&workflow, initial).await.unwrap_err();
    let parse = failure.record("parse").unwrap();
    assert_eq!(parse.batch.as_ref().map(|b| b.success_count), Some(1));

    match failure.error {
        FlowError::StepFailed { node_id, source } => {
            assert_eq!(node_id, "parse");
            assert!(matches!(
                *source,
                FlowError::BatchAborted { succeeded: 1, total: 2, .. }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}
