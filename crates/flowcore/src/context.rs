use crate::reference::ValueLookup;
use crate::{FlowError, Map, Value};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Layered value context for one workflow run.
///
/// Layer 1 is the caller's initial params, fixed for the run. Layer 2 holds
/// one output mapping per executed node, keyed by node id, each written
/// exactly once. Top-level locals carry batch item bindings.
///
/// Cloning is shallow: both layers sit behind `Arc`s, each node's mapping
/// has its own `Arc`, and the call log is a shared handle. A clone handed to
/// a batch worker can commit its own node without copying any earlier
/// node's outputs.
#[derive(Clone, Default)]
pub struct SharedContext {
    initial: Arc<Map<String, Value>>,
    locals: Map<String, Value>,
    namespaces: Arc<HashMap<String, Arc<Namespace>>>,
    order: Arc<Vec<String>>,
    call_log: CallLog,
}

/// One node's committed outputs.
struct Namespace {
    outputs: Map<String, Value>,
    /// Keys readable by bare name. `None` exports every key.
    exported: Option<HashSet<String>>,
}

impl Namespace {
    fn exports(&self, key: &str) -> bool {
        self.exported.as_ref().map_or(true, |keys| keys.contains(key))
    }
}

impl SharedContext {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            initial: Arc::new(initial),
            ..Default::default()
        }
    }

    pub fn initial(&self) -> &Map<String, Value> {
        &self.initial
    }

    /// Bind a top-level name visible to reference resolution, shadowing
    /// initial params and node outputs of the same name.
    pub fn bind_local(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    /// Output mapping of an executed node.
    pub fn namespace(&self, node_id: &str) -> Option<&Map<String, Value>> {
        self.namespaces.get(node_id).map(|ns| &ns.outputs)
    }

    /// Store a node's outputs, every key readable by bare name.
    /// Each node's mapping can be written once.
    pub fn commit(&mut self, node_id: &str, outputs: Map<String, Value>) -> Result<(), FlowError> {
        self.insert(node_id, outputs, None)
    }

    /// Store a node's outputs. Only the `declared` keys are readable by bare
    /// name; the rest stay reachable as `node.key`.
    pub fn commit_declared<'k>(
        &mut self,
        node_id: &str,
        outputs: Map<String, Value>,
        declared: impl IntoIterator<Item = &'k str>,
    ) -> Result<(), FlowError> {
        let exported = declared.into_iter().map(str::to_string).collect();
        self.insert(node_id, outputs, Some(exported))
    }

    fn insert(
        &mut self,
        node_id: &str,
        outputs: Map<String, Value>,
        exported: Option<HashSet<String>>,
    ) -> Result<(), FlowError> {
        if self.namespaces.contains_key(node_id) {
            return Err(FlowError::Execution(format!(
                "Outputs for node '{}' were already committed",
                node_id
            )));
        }
        let namespace = Arc::new(Namespace { outputs, exported });
        Arc::make_mut(&mut self.namespaces).insert(node_id.to_string(), namespace);
        Arc::make_mut(&mut self.order).push(node_id.to_string());
        Ok(())
    }

    /// Node ids in the order their outputs were committed.
    pub fn executed_nodes(&self) -> &[String] {
        &self.order
    }

    pub fn call_log(&self) -> &CallLog {
        &self.call_log
    }

    /// `node.key` names of every committed output, for before/after diffs.
    pub fn output_keys(&self) -> Vec<String> {
        self.order
            .iter()
            .flat_map(|id| {
                self.namespace(id)
                    .into_iter()
                    .flat_map(move |map| map.keys().map(move |k| format!("{}.{}", id, k)))
            })
            .collect()
    }

    /// All node output mappings, keyed by node id.
    pub fn outputs(&self) -> HashMap<String, Map<String, Value>> {
        self.namespaces
            .iter()
            .map(|(id, ns)| (id.clone(), ns.outputs.clone()))
            .collect()
    }

    fn shadowed(&self, name: &str) -> Option<&Value> {
        self.locals.get(name).or_else(|| self.initial.get(name))
    }
}

impl ValueLookup for SharedContext {
    /// Locals, then initial params, then node ids, then the most recently
    /// committed node that exports that key.
    fn lookup(&self, name: &str) -> Option<Cow<'_, Value>> {
        if let Some(value) = self.shadowed(name) {
            return Some(Cow::Borrowed(value));
        }
        if let Some(map) = self.namespace(name) {
            return Some(Cow::Owned(Value::Object(map.clone())));
        }
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.namespaces.get(id))
            .find_map(|ns| ns.outputs.get(name).filter(|_| ns.exports(name)))
            .map(Cow::Borrowed)
    }

    fn lookup_mapping(&self, name: &str) -> Option<&Map<String, Value>> {
        if self.shadowed(name).is_some() {
            return None;
        }
        self.namespace(name)
    }
}

/// One invocation of a node's inner operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEntry {
    pub node_id: String,
    pub item_index: Option<usize>,
    pub attempt: u32,
    pub duration_ms: u64,
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log shared by every clone of a context.
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<CallEntry>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: CallEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<CallEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
