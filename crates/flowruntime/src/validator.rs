//! Pre-flight validation of a workflow graph.
//!
//! Three passes run over the graph and every problem found is collected:
//! a structural pass (ids, types, edges, batch settings), an ordering pass
//! (Kahn's algorithm over unconditional edges) and a data-flow pass that
//! checks each reference against the names available at that point of the
//! computed execution order.

use crate::registry::NodeRegistry;
use flowcore::reference::extract_references;
use flowcore::{NodeSpec, Reference, ReferenceError, ValidationError, Value, Workflow, WorkflowError};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Output keys written by any node that runs in batch mode.
pub const BATCH_OUTPUTS: [&str; 5] = ["results", "count", "success_count", "error_count", "errors"];

/// Outcome of validating a graph.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    /// Node ids in execution order. Nodes caught in a cycle are left out.
    pub execution_order: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<Vec<String>, WorkflowError> {
        if self.errors.is_empty() {
            Ok(self.execution_order)
        } else {
            Err(WorkflowError::Validation(self.errors))
        }
    }
}

pub struct GraphValidator<'a> {
    registry: &'a NodeRegistry,
}

impl<'a> GraphValidator<'a> {
    pub fn new(registry: &'a NodeRegistry) -> Self {
        Self { registry }
    }

    /// Validate `workflow` given the names of the caller's initial params.
    pub fn validate<'p, I>(&self, workflow: &Workflow, initial_params: I) -> ValidationResult
    where
        I: IntoIterator<Item = &'p str>,
    {
        let initial: HashSet<&str> = initial_params.into_iter().collect();
        let mut errors = Vec::new();

        let nodes = self.structural_pass(workflow, &mut errors);
        let (execution_order, cyclic) = ordering_pass(workflow, &nodes, &mut errors);

        let mut positions: HashMap<&str, usize> = HashMap::new();
        for id in execution_order.iter().chain(cyclic.iter()) {
            let next = positions.len();
            positions.insert(id.as_str(), next);
        }
        self.data_flow_pass(&nodes, &positions, &initial, &mut errors);

        tracing::debug!(
            workflow = %workflow.name,
            errors = errors.len(),
            order = ?execution_order,
            "Validated workflow"
        );

        ValidationResult {
            errors,
            execution_order,
        }
    }

    /// Returns the first spec for every distinct, non-empty node id.
    fn structural_pass<'w>(
        &self,
        workflow: &'w Workflow,
        errors: &mut Vec<ValidationError>,
    ) -> Vec<&'w NodeSpec> {
        if workflow.nodes.is_empty() {
            errors.push(ValidationError::EmptyWorkflow);
        }

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(workflow.nodes.len());
        for (index, node) in workflow.nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                errors.push(ValidationError::EmptyNodeId { index });
                continue;
            }
            if !seen.insert(node.id.as_str()) {
                errors.push(ValidationError::DuplicateNode {
                    node_id: node.id.clone(),
                });
                continue;
            }
            nodes.push(node);

            match self.registry.get_metadata(&node.node_type) {
                Some(info) => {
                    for port in info.inputs.iter().filter(|p| p.required) {
                        if !node.params.contains_key(&port.name) {
                            errors.push(ValidationError::MissingRequiredParam {
                                node_id: node.id.clone(),
                                param: port.name.clone(),
                            });
                        }
                    }
                }
                None => errors.push(ValidationError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                }),
            }

            if let Some(reason) = batch_config_problem(node) {
                errors.push(ValidationError::InvalidBatchConfig {
                    node_id: node.id.clone(),
                    reason,
                });
            }
        }

        for edge in &workflow.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !seen.contains(endpoint.as_str()) {
                    errors.push(ValidationError::MissingEdgeEndpoint {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }

        nodes
    }

    fn data_flow_pass(
        &self,
        nodes: &[&NodeSpec],
        positions: &HashMap<&str, usize>,
        initial: &HashSet<&str>,
        errors: &mut Vec<ValidationError>,
    ) {
        let mut producers: HashMap<String, Vec<&str>> = HashMap::new();
        for node in nodes {
            let outputs: Vec<String> = if node.batch.is_some() {
                BATCH_OUTPUTS.iter().map(|s| s.to_string()).collect()
            } else {
                self.registry
                    .get_metadata(&node.node_type)
                    .map(|info| info.output_names().map(str::to_string).collect())
                    .unwrap_or_default()
            };
            for name in outputs {
                producers.entry(name).or_default().push(node.id.as_str());
            }
        }

        let mut ordered: Vec<&NodeSpec> = nodes.to_vec();
        ordered.sort_by_key(|n| positions.get(n.id.as_str()).copied().unwrap_or(usize::MAX));

        let scope = DataFlowScope {
            positions,
            initial,
            producers: &producers,
        };
        for node in ordered {
            let position = positions.get(node.id.as_str()).copied().unwrap_or(usize::MAX);

            let mut found: Vec<(Result<Reference, ReferenceError>, Option<&str>)> = Vec::new();
            if let Some(batch) = &node.batch {
                // the item alias is only bound while the node body runs
                found.extend(extract_references(&batch.items).into_iter().map(|r| (r, None)));
                let alias = Some(batch.item_alias.as_str());
                found.extend(
                    extract_references(&Value::Object(node.params.clone()))
                        .into_iter()
                        .map(|r| (r, alias)),
                );
            } else {
                found.extend(
                    extract_references(&Value::Object(node.params.clone()))
                        .into_iter()
                        .map(|r| (r, None)),
                );
            }

            for (reference, alias) in found {
                match reference {
                    Ok(reference) => {
                        if let Some(error) = scope.check(&node.id, position, &reference, alias) {
                            errors.push(error);
                        }
                    }
                    Err(e) => errors.push(ValidationError::MalformedReference {
                        node_id: node.id.clone(),
                        reference: match &e {
                            ReferenceError::Syntax { expression, .. } => expression.clone(),
                            other => other.to_string(),
                        },
                        reason: e.to_string(),
                    }),
                }
            }
        }
    }
}

/// Names visible to references during the data-flow pass.
struct DataFlowScope<'s> {
    positions: &'s HashMap<&'s str, usize>,
    initial: &'s HashSet<&'s str>,
    producers: &'s HashMap<String, Vec<&'s str>>,
}

impl DataFlowScope<'_> {
    fn position(&self, node_id: &str) -> usize {
        self.positions.get(node_id).copied().unwrap_or(usize::MAX)
    }

    fn check(
        &self,
        node_id: &str,
        position: usize,
        reference: &Reference,
        alias: Option<&str>,
    ) -> Option<ValidationError> {
        let root = reference.root();
        if alias == Some(root) || self.initial.contains(root) {
            return None;
        }

        if self.positions.contains_key(root) {
            return (self.position(root) >= position).then(|| ValidationError::ForwardReference {
                node_id: node_id.to_string(),
                reference: reference.to_string(),
                producer: root.to_string(),
            });
        }

        let Some(producers) = self.producers.get(root) else {
            return Some(ValidationError::UndefinedReference {
                node_id: node_id.to_string(),
                reference: reference.to_string(),
            });
        };

        let earlier: Vec<&str> = producers
            .iter()
            .copied()
            .filter(|p| self.position(p) < position)
            .collect();
        match earlier.as_slice() {
            [_] => None,
            [] => Some(ValidationError::ForwardReference {
                node_id: node_id.to_string(),
                reference: reference.to_string(),
                producer: producers[0].to_string(),
            }),
            _ => Some(ValidationError::AmbiguousOutput {
                node_id: node_id.to_string(),
                reference: reference.to_string(),
                producers: earlier.iter().map(|p| p.to_string()).collect(),
            }),
        }
    }
}

/// Kahn's algorithm over unconditional edges.
///
/// Among nodes whose dependencies are met, the earliest declared runs
/// first. Returns the execution order and the nodes left over because of
/// cycles (in declaration order).
fn ordering_pass(
    workflow: &Workflow,
    nodes: &[&NodeSpec],
    errors: &mut Vec<ValidationError>,
) -> (Vec<String>, Vec<String>) {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
    for node in nodes {
        index_of.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }
    for edge in workflow.edges.iter().filter(|e| e.is_unconditional()) {
        if let (Some(&from), Some(&to)) = (index_of.get(edge.from.as_str()), index_of.get(edge.to.as_str())) {
            graph.add_edge(from, to, ());
        }
    }

    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut removed = vec![false; graph.node_count()];
    let mut order = Vec::with_capacity(graph.node_count());

    while let Some(next) = (0..graph.node_count()).find(|&i| !removed[i] && indegree[i] == 0) {
        removed[next] = true;
        let idx = NodeIndex::new(next);
        order.push(graph[idx].to_string());
        for succ in graph.neighbors_directed(idx, Direction::Outgoing) {
            indegree[succ.index()] -= 1;
        }
    }

    let remaining: Vec<String> = graph
        .node_indices()
        .filter(|i| !removed[i.index()])
        .map(|i| graph[i].to_string())
        .collect();

    if !remaining.is_empty() {
        let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .collect();
        for scc in &mut cycles {
            scc.sort();
        }
        cycles.sort();

        if cycles.is_empty() {
            errors.push(ValidationError::Cycle {
                nodes: remaining.clone(),
            });
        }
        for scc in cycles {
            errors.push(ValidationError::Cycle {
                nodes: scc.into_iter().map(|i| graph[i].to_string()).collect(),
            });
        }
    }

    (order, remaining)
}

fn batch_config_problem(node: &NodeSpec) -> Option<String> {
    let batch = node.batch.as_ref()?;
    let alias = batch.item_alias.as_str();

    if alias.is_empty() || !alias.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Some(format!("item alias '{}' is not a valid name", alias));
    }
    if batch.max_concurrent == Some(0) {
        return Some("max_concurrent must be at least 1".to_string());
    }
    if batch.max_retries == 0 {
        return Some("max_retries must be at least 1".to_string());
    }
    if !batch.retry_wait.is_finite() || batch.retry_wait < 0.0 {
        return Some(format!("retry_wait must be a non-negative number, got {}", batch.retry_wait));
    }
    match &batch.items {
        Value::Array(_) => None,
        Value::String(s) if s.contains("${") => None,
        _ => Some("items must be a reference or an array".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeFactory, NodeTypeInfo, PortDefinition};
    use async_trait::async_trait;
    use flowcore::{BatchConfig, Edge, Map, Node, NodeContext, NodeError, NodeOutput, ValueKind};
    use serde_json::json;
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl Node for Echo {
        fn node_type(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            Ok(NodeOutput::new())
        }
    }

    struct EchoFactory {
        node_type: &'static str,
        outputs: Vec<&'static str>,
        required: Vec<&'static str>,
    }

    impl NodeFactory for EchoFactory {
        fn create(&self, _params: &Map<String, Value>) -> Result<Box<dyn Node>, NodeError> {
            Ok(Box::new(Echo))
        }

        fn node_type(&self) -> &str {
            self.node_type
        }

        fn metadata(&self) -> NodeTypeInfo {
            let mut info = NodeTypeInfo::new("test node", "test");
            for name in &self.required {
                info = info.with_input(PortDefinition::required(*name, ValueKind::Any));
            }
            for name in &self.outputs {
                info = info.with_output(PortDefinition::optional(*name, ValueKind::Any));
            }
            info
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(EchoFactory {
            node_type: "fetch",
            outputs: vec!["body"],
            required: vec![],
        }));
        registry.register(Arc::new(EchoFactory {
            node_type: "summarize",
            outputs: vec!["summary"],
            required: vec![],
        }));
        registry.register(Arc::new(EchoFactory {
            node_type: "write",
            outputs: vec![],
            required: vec!["path"],
        }));
        registry
    }

    fn node(id: &str, node_type: &str, params: Value) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            node_type: node_type.to_string(),
            params: params.as_object().cloned().unwrap_or_default(),
            batch: None,
        }
    }

    fn workflow(nodes: Vec<NodeSpec>, edges: &[(&str, &str)]) -> Workflow {
        let mut wf = Workflow::new("test");
        wf.nodes = nodes;
        wf.edges = edges.iter().map(|(a, b)| Edge::new(*a, *b)).collect();
        wf
    }

    fn assert_topological(wf: &Workflow, order: &[String]) {
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        for edge in wf.edges.iter().filter(|e| e.is_unconditional()) {
            assert!(pos(&edge.from) < pos(&edge.to), "{} must precede {}", edge.from, edge.to);
        }
    }

    #[test]
    fn orders_by_edges_not_declaration() {
        let registry = registry();
        let wf = workflow(
            vec![
                node("x", "summarize", json!({"text": "${y.body}"})),
                node("y", "fetch", json!({})),
            ],
            &[("y", "x")],
        );
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert!(result.is_valid(), "{:?}", result.errors);
        assert_eq!(result.execution_order, vec!["y", "x"]);
    }

    #[test]
    fn reports_two_node_cycle() {
        let registry = registry();
        let wf = workflow(
            vec![node("a", "fetch", json!({})), node("b", "fetch", json!({}))],
            &[("a", "b"), ("b", "a")],
        );
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert!(result.errors.contains(&ValidationError::Cycle {
            nodes: vec!["a".into(), "b".into()]
        }));
        assert!(result.execution_order.is_empty());
    }

    #[test]
    fn cycle_report_excludes_downstream_nodes() {
        let registry = registry();
        let wf = workflow(
            vec![
                node("a", "fetch", json!({})),
                node("b", "fetch", json!({})),
                node("c", "fetch", json!({})),
                node("d", "fetch", json!({})),
            ],
            &[("a", "b"), ("b", "c"), ("c", "b"), ("c", "d")],
        );
        let result = GraphValidator::new(&registry).validate(&wf, []);
        let cycles: Vec<_> = result
            .errors
            .iter()
            .filter(|e| e.category() == "cycle")
            .collect();
        assert_eq!(cycles.len(), 1);
        assert_eq!(
            cycles[0],
            &ValidationError::Cycle {
                nodes: vec!["b".into(), "c".into()]
            }
        );
        assert_eq!(result.execution_order, vec!["a"]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let registry = registry();
        let wf = workflow(vec![node("a", "fetch", json!({}))], &[("a", "a")]);
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert_eq!(
            result.errors,
            vec![ValidationError::Cycle {
                nodes: vec!["a".into()]
            }]
        );
    }

    #[test]
    fn conditional_edges_do_not_order() {
        let registry = registry();
        let mut wf = workflow(
            vec![node("a", "fetch", json!({})), node("b", "fetch", json!({}))],
            &[("a", "b")],
        );
        wf.edges.push(Edge::new("b", "a").with_action("retry"));
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert!(result.is_valid(), "{:?}", result.errors);
        assert_eq!(result.execution_order, vec!["a", "b"]);
    }

    #[test]
    fn disconnected_nodes_keep_declaration_order() {
        let registry = registry();
        let wf = workflow(
            vec![
                node("a", "fetch", json!({})),
                node("lonely", "fetch", json!({})),
                node("b", "fetch", json!({})),
                node("c", "fetch", json!({})),
            ],
            &[("c", "b"), ("a", "c")],
        );
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert_eq!(result.execution_order, vec!["a", "lonely", "c", "b"]);
        assert_topological(&wf, &result.execution_order);
    }

    #[test]
    fn every_order_is_topological() {
        let registry = registry();
        let ids = ["n0", "n1", "n2", "n3", "n4", "n5"];
        let edge_sets: [&[(&str, &str)]; 4] = [
            &[("n5", "n0"), ("n4", "n0"), ("n0", "n1")],
            &[("n1", "n2"), ("n2", "n3"), ("n3", "n4"), ("n4", "n5")],
            &[("n5", "n4"), ("n4", "n3"), ("n3", "n2"), ("n2", "n1"), ("n1", "n0")],
            &[("n0", "n5"), ("n3", "n1"), ("n2", "n1"), ("n5", "n3")],
        ];
        for edges in edge_sets {
            let wf = workflow(
                ids.iter().map(|id| node(id, "fetch", json!({}))).collect(),
                edges,
            );
            let result = GraphValidator::new(&registry).validate(&wf, []);
            assert!(result.is_valid());
            assert_eq!(result.execution_order.len(), ids.len());
            assert_topological(&wf, &result.execution_order);
        }
    }

    #[test]
    fn forward_reference_names_both_nodes() {
        let registry = registry();
        let wf = workflow(
            vec![
                node("a", "summarize", json!({"text": "${b.body}"})),
                node("b", "fetch", json!({})),
            ],
            &[],
        );
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert_eq!(
            result.errors,
            vec![ValidationError::ForwardReference {
                node_id: "a".into(),
                reference: "b.body".into(),
                producer: "b".into(),
            }]
        );
    }

    #[test]
    fn bare_output_name_before_producer_is_forward() {
        let registry = registry();
        let wf = workflow(
            vec![
                node("a", "summarize", json!({"text": "${body}"})),
                node("b", "fetch", json!({})),
            ],
            &[],
        );
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert!(matches!(
            &result.errors[..],
            [ValidationError::ForwardReference { producer, .. }] if producer == "b"
        ));
    }

    #[test]
    fn self_reference_is_forward() {
        let registry = registry();
        let wf = workflow(vec![node("a", "summarize", json!({"text": "${summary}"}))], &[]);
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert!(matches!(
            &result.errors[..],
            [ValidationError::ForwardReference { node_id, producer, .. }] if node_id == "a" && producer == "a"
        ));
    }

    #[test]
    fn undefined_and_initial_references() {
        let registry = registry();
        let wf = workflow(
            vec![node("a", "summarize", json!({"text": "${topic} ${nowhere.x}"}))],
            &[],
        );
        let result = GraphValidator::new(&registry).validate(&wf, ["topic"]);
        assert_eq!(
            result.errors,
            vec![ValidationError::UndefinedReference {
                node_id: "a".into(),
                reference: "nowhere.x".into(),
            }]
        );
    }

    #[test]
    fn ambiguous_bare_output_is_rejected() {
        let registry = registry();
        let wf = workflow(
            vec![
                node("f1", "fetch", json!({})),
                node("f2", "fetch", json!({})),
                node("s", "summarize", json!({"a": "${body}", "b": "${f1.body}"})),
            ],
            &[("f1", "s"), ("f2", "s")],
        );
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert_eq!(
            result.errors,
            vec![ValidationError::AmbiguousOutput {
                node_id: "s".into(),
                reference: "body".into(),
                producers: vec!["f1".into(), "f2".into()],
            }]
        );
    }

    #[test]
    fn collects_every_structural_error() {
        let registry = registry();
        let wf = workflow(
            vec![
                node("a", "fetch", json!({})),
                node("a", "fetch", json!({})),
                node("", "fetch", json!({})),
                node("w", "write", json!({})),
                node("m", "mystery", json!({})),
            ],
            &[("a", "ghost")],
        );
        let result = GraphValidator::new(&registry).validate(&wf, []);
        let expected = [
            ValidationError::DuplicateNode { node_id: "a".into() },
            ValidationError::EmptyNodeId { index: 2 },
            ValidationError::MissingRequiredParam {
                node_id: "w".into(),
                param: "path".into(),
            },
            ValidationError::UnknownNodeType {
                node_id: "m".into(),
                node_type: "mystery".into(),
            },
            ValidationError::MissingEdgeEndpoint {
                from: "a".into(),
                to: "ghost".into(),
                missing: "ghost".into(),
            },
        ];
        for error in &expected {
            assert!(result.errors.contains(error), "missing {:?} in {:?}", error, result.errors);
        }
    }

    #[test]
    fn empty_workflow_is_invalid() {
        let registry = registry();
        let result = GraphValidator::new(&registry).validate(&Workflow::new("empty"), []);
        assert_eq!(result.errors, vec![ValidationError::EmptyWorkflow]);
    }

    #[test]
    fn batch_alias_and_outputs_are_visible() {
        let registry = registry();
        let batch = node("each", "summarize", json!({"text": "${row.title} ${f.body}"}))
            .with_batch(BatchConfig::new("${f.body}").with_alias("row"));
        let wf = workflow(
            vec![
                node("f", "fetch", json!({})),
                batch,
                node("w", "write", json!({"path": "${each.results}", "n": "${success_count}"})),
            ],
            &[("f", "each"), ("each", "w")],
        );
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn batch_alias_is_not_visible_to_items_source() {
        let registry = registry();
        let batch = node("each", "summarize", json!({}))
            .with_batch(BatchConfig::new("${item}"));
        let wf = workflow(vec![batch], &[]);
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert!(matches!(
            &result.errors[..],
            [ValidationError::UndefinedReference { reference, .. }] if reference == "item"
        ));
    }

    #[test]
    fn rejects_bad_batch_settings() {
        let registry = registry();
        let mut config = BatchConfig::new(json!(42));
        config.max_retries = 0;
        let wf = workflow(vec![node("b", "fetch", json!({})).with_batch(config)], &[]);
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert!(matches!(
            &result.errors[..],
            [ValidationError::InvalidBatchConfig { reason, .. }] if reason.contains("max_retries")
        ));
    }

    #[test]
    fn malformed_reference_is_reported() {
        let registry = registry();
        let wf = workflow(vec![node("a", "summarize", json!({"t": "${a..b}"}))], &[]);
        let result = GraphValidator::new(&registry).validate(&wf, []);
        assert!(matches!(
            &result.errors[..],
            [ValidationError::MalformedReference { reference, .. }] if reference == "a..b"
        ));
    }
}
