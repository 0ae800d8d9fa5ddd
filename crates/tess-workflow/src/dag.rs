use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tess_types::{DagError, TessError};

use crate::operation::Operation;

/// Rewrites a parent's output before it reaches a child.
pub type ForwarderFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Splits a for-each node's input into keyed items, one sub-dag run each.
pub type ForEachFn = Arc<dyn Fn(&[u8]) -> Result<Vec<(String, Vec<u8>)>, TessError> + Send + Sync>;

/// Picks the branch label of a conditional node from its input.
pub type ConditionFn = Arc<dyn Fn(&[u8]) -> String + Send + Sync>;

/// Combines several outputs into one: parent outputs keyed by parent vertex
/// id, or branch outputs keyed by item key or branch label.
pub type AggregatorFn =
    Arc<dyn Fn(&BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, TessError> + Send + Sync>;

pub enum NodeKind {
    Task(Vec<Operation>),
    SubDag(Box<Dag>),
    ForEach {
        dag: Box<Dag>,
        foreach: ForEachFn,
        aggregator: AggregatorFn,
    },
    Conditional {
        dags: BTreeMap<String, Dag>,
        condition: ConditionFn,
        aggregator: Option<AggregatorFn>,
    },
}

impl NodeKind {
    fn name(&self) -> &'static str {
        match self {
            NodeKind::Task(_) => "task",
            NodeKind::SubDag(_) => "sub_dag",
            NodeKind::ForEach { .. } => "foreach",
            NodeKind::Conditional { .. } => "conditional",
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct Node {
    id: String,
    index: usize,
    unique_id: String,
    kind: NodeKind,
    children: Vec<usize>,
    depends_on: Vec<usize>,
    /// `None` marks an execution-only edge.
    forwarders: HashMap<usize, Option<ForwarderFn>>,
    /// Joins the outputs of several forwarding parents.
    aggregator: Option<AggregatorFn>,
    /// Transitive successors and predecessors.
    next: HashSet<usize>,
    prev: HashSet<usize>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("unique_id", &self.unique_id)
            .field("kind", &self.kind.name())
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl Node {
    fn new(id: String, index: usize, kind: NodeKind) -> Self {
        Node {
            id,
            index,
            unique_id: String::new(),
            kind,
            children: Vec::new(),
            depends_on: Vec::new(),
            forwarders: HashMap::new(),
            aggregator: None,
            next: HashSet::new(),
            prev: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// `<dag id>_<index>_<node id>`, assigned by `Dag::validate`.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn aggregator(&self) -> Option<&AggregatorFn> {
        self.aggregator.as_ref()
    }

    pub fn in_degree(&self) -> usize {
        self.depends_on.len()
    }

    pub fn out_degree(&self) -> usize {
        self.children.len()
    }

    /// For-each and conditional nodes pick their sub-dag at run time.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, NodeKind::ForEach { .. } | NodeKind::Conditional { .. })
    }

    /// The nested dag entered for `option` (item key or branch label).
    pub fn sub_dag(&self, option: Option<&str>) -> Option<&Dag> {
        match &self.kind {
            NodeKind::Task(_) => None,
            NodeKind::SubDag(dag) | NodeKind::ForEach { dag, .. } => Some(dag),
            NodeKind::Conditional { dags, .. } => option.and_then(|o| dags.get(o)),
        }
    }
}

// ---------------------------------------------------------------------------
// Dag
// ---------------------------------------------------------------------------

/// Arena of nodes addressed by index. Nested dags are owned by the node that
/// embeds them; the link back to that node is kept as its unique id.
pub struct Dag {
    id: String,
    parent: Option<String>,
    nodes: Vec<Node>,
    by_id: HashMap<String, usize>,
    start: Option<usize>,
    end: Option<usize>,
    synthesized_end: bool,
    end_aggregator: Option<AggregatorFn>,
    order: Vec<usize>,
    validated: bool,
    has_branch: bool,
    has_edge: bool,
    execution_flow_only: bool,
}

impl fmt::Debug for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .field("validated", &self.validated)
            .finish_non_exhaustive()
    }
}

impl Dag {
    pub fn new(id: impl Into<String>) -> Self {
        Dag {
            id: id.into(),
            parent: None,
            nodes: Vec::new(),
            by_id: HashMap::new(),
            start: None,
            end: None,
            synthesized_end: false,
            end_aggregator: None,
            order: Vec::new(),
            validated: false,
            has_branch: false,
            has_edge: false,
            execution_flow_only: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unique id of the node embedding this dag.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn ensure_mutable(&self) -> Result<(), DagError> {
        if self.validated {
            return Err(DagError::Frozen(self.id.clone()));
        }
        Ok(())
    }

    fn insert(&mut self, id: String, kind: NodeKind) -> Result<usize, DagError> {
        if self.by_id.contains_key(&id) {
            return Err(DagError::DuplicateVertex(id));
        }
        let index = self.nodes.len();
        self.by_id.insert(id.clone(), index);
        self.nodes.push(Node::new(id, index, kind));
        Ok(index)
    }

    fn index_or_insert(&mut self, id: &str) -> usize {
        match self.by_id.get(id) {
            Some(i) => *i,
            None => {
                let index = self.nodes.len();
                self.by_id.insert(id.to_string(), index);
                self.nodes.push(Node::new(id.to_string(), index, NodeKind::Task(Vec::new())));
                index
            }
        }
    }

    pub fn add_vertex(
        &mut self,
        id: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Result<(), DagError> {
        self.ensure_mutable()?;
        self.insert(id.into(), NodeKind::Task(operations)).map(|_| ())
    }

    pub fn add_sub_dag(&mut self, id: impl Into<String>, dag: Dag) -> Result<(), DagError> {
        self.ensure_mutable()?;
        self.insert(id.into(), NodeKind::SubDag(Box::new(dag))).map(|_| ())
    }

    pub fn add_foreach_dag<F, A>(
        &mut self,
        id: impl Into<String>,
        dag: Dag,
        foreach: F,
        aggregator: A,
    ) -> Result<(), DagError>
    where
        F: Fn(&[u8]) -> Result<Vec<(String, Vec<u8>)>, TessError> + Send + Sync + 'static,
        A: Fn(&BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, TessError> + Send + Sync + 'static,
    {
        self.ensure_mutable()?;
        let kind = NodeKind::ForEach {
            dag: Box::new(dag),
            foreach: Arc::new(foreach),
            aggregator: Arc::new(aggregator),
        };
        self.insert(id.into(), kind).map(|_| ())
    }

    pub fn add_conditional_dags<C>(
        &mut self,
        id: impl Into<String>,
        condition: C,
        dags: BTreeMap<String, Dag>,
        aggregator: Option<AggregatorFn>,
    ) -> Result<(), DagError>
    where
        C: Fn(&[u8]) -> String + Send + Sync + 'static,
    {
        self.ensure_mutable()?;
        let id = id.into();
        if dags.is_empty() {
            return Err(DagError::Empty(id));
        }
        let kind = NodeKind::Conditional { dags, condition: Arc::new(condition), aggregator };
        self.insert(id, kind).map(|_| ())
    }

    /// Joins the inputs of a vertex with more than one forwarding parent.
    pub fn add_aggregator<A>(&mut self, id: &str, aggregator: A) -> Result<(), DagError>
    where
        A: Fn(&BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, TessError> + Send + Sync + 'static,
    {
        self.ensure_mutable()?;
        let index = *self.by_id.get(id).ok_or_else(|| DagError::NoVertex(id.to_string()))?;
        self.nodes[index].aggregator = Some(Arc::new(aggregator));
        Ok(())
    }

    /// Aggregator for the end vertex synthesized when the dag has several
    /// sinks. Without one the sink outputs are joined by `join_sinks`.
    pub fn add_end_aggregator<A>(&mut self, aggregator: A) -> Result<(), DagError>
    where
        A: Fn(&BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, TessError> + Send + Sync + 'static,
    {
        self.ensure_mutable()?;
        self.end_aggregator = Some(Arc::new(aggregator));
        Ok(())
    }

    /// Edge that forwards `from`'s output to `to`. Missing endpoints are
    /// created as empty task vertices.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        self.connect(from, to, Some(Arc::new(|data: &[u8]| data.to_vec())))
    }

    pub fn add_forwarding_edge<F>(&mut self, from: &str, to: &str, forwarder: F) -> Result<(), DagError>
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.connect(from, to, Some(Arc::new(forwarder)))
    }

    /// Ordering-only edge; no data flows along it.
    pub fn add_execution_edge(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        self.connect(from, to, None)
    }

    fn connect(&mut self, from: &str, to: &str, forwarder: Option<ForwarderFn>) -> Result<(), DagError> {
        self.ensure_mutable()?;
        let cyclic = || DagError::Cyclic { from: from.to_string(), to: to.to_string() };
        if from == to {
            return Err(cyclic());
        }
        let f = self.index_or_insert(from);
        let t = self.index_or_insert(to);
        if self.nodes[f].children.contains(&t) {
            return Err(DagError::DuplicateEdge { from: from.to_string(), to: to.to_string() });
        }
        if self.nodes[f].prev.contains(&t) {
            return Err(cyclic());
        }
        self.link(f, t, forwarder);
        Ok(())
    }

    fn link(&mut self, f: usize, t: usize, forwarder: Option<ForwarderFn>) {
        self.nodes[f].children.push(t);
        self.nodes[f].forwarders.insert(t, forwarder);
        self.nodes[t].depends_on.push(f);

        let mut ancestors: Vec<usize> = self.nodes[f].prev.iter().copied().collect();
        ancestors.push(f);
        let mut descendants: Vec<usize> = self.nodes[t].next.iter().copied().collect();
        descendants.push(t);
        for &a in &ancestors {
            self.nodes[a].next.extend(descendants.iter().copied());
        }
        for &d in &descendants {
            self.nodes[d].prev.extend(ancestors.iter().copied());
        }
    }

    /// Resolves the start and end vertices, joins multiple sinks into a
    /// synthesized `end_<dag id>` vertex and validates every nested dag.
    /// Further mutation fails with `DagError::Frozen`.
    pub fn validate(&mut self) -> Result<(), DagError> {
        let id = self.id.clone();
        self.finalize(id, None)
    }

    fn finalize(&mut self, id: String, parent: Option<String>) -> Result<(), DagError> {
        self.rename(id);
        self.parent = parent;
        if !self.validated {
            self.resolve_structure()?;
        }

        let own_id = self.id.clone();
        let mut has_branch = false;
        let mut has_edge = self.nodes.iter().any(|n| !n.children.is_empty());
        let mut flow_only = true;
        for node in &mut self.nodes {
            let parent = Some(node.unique_id.clone());
            match &mut node.kind {
                NodeKind::Task(_) => {}
                NodeKind::SubDag(dag) => {
                    dag.finalize(format!("{own_id}_{}", node.index), parent)?;
                    has_branch |= dag.has_branch;
                    has_edge |= dag.has_edge;
                    flow_only &= dag.execution_flow_only;
                }
                NodeKind::ForEach { dag, .. } => {
                    dag.finalize(format!("{own_id}_{}", node.index), parent)?;
                    has_branch = true;
                    has_edge |= dag.has_edge;
                    // each item is forwarded into the sub-dag
                    flow_only = false;
                }
                NodeKind::Conditional { dags, .. } => {
                    for (label, dag) in dags.iter_mut() {
                        dag.finalize(format!("{own_id}_{}_{label}", node.index), parent.clone())?;
                        has_edge |= dag.has_edge;
                    }
                    has_branch = true;
                    // the node's input is forwarded into the chosen branch
                    flow_only = false;
                }
            }
            has_branch |= node.children.len() > 1;
            flow_only &= node.forwarders.values().all(Option::is_none);
        }
        self.has_branch = has_branch;
        self.has_edge = has_edge;
        self.execution_flow_only = flow_only;
        self.validated = true;
        Ok(())
    }

    fn rename(&mut self, id: String) {
        self.id = id;
        if let (true, Some(end)) = (self.synthesized_end, self.end) {
            let old = self.nodes[end].id.clone();
            self.by_id.remove(&old);
            let new = self.free_end_id();
            self.nodes[end].id = new.clone();
            self.by_id.insert(new, end);
        }
        for node in &mut self.nodes {
            node.unique_id = format!("{}_{}_{}", self.id, node.index, node.id);
        }
    }

    fn resolve_structure(&mut self) -> Result<(), DagError> {
        if self.nodes.is_empty() {
            return Err(DagError::Empty(self.id.clone()));
        }
        let starts: Vec<usize> =
            self.nodes.iter().filter(|n| n.depends_on.is_empty()).map(|n| n.index).collect();
        match starts.as_slice() {
            [start] => self.start = Some(*start),
            [] => return Err(DagError::Empty(self.id.clone())),
            _ => return Err(DagError::MultipleStart(self.id.clone())),
        }

        let sinks: Vec<usize> =
            self.nodes.iter().filter(|n| n.children.is_empty()).map(|n| n.index).collect();
        if let [end] = sinks.as_slice() {
            self.end = Some(*end);
        } else {
            let end_id = self.free_end_id();
            let end = self.insert(end_id, NodeKind::Task(vec![Operation::noop("end")]))?;
            for sink in sinks {
                self.link(sink, end, None);
            }
            let default: AggregatorFn = Arc::new(join_sinks);
            let aggregator = self.end_aggregator.take().unwrap_or(default);
            self.nodes[end].aggregator = Some(aggregator);
            self.end = Some(end);
            self.synthesized_end = true;
        }

        for node in &self.nodes {
            let forwarding = node
                .depends_on
                .iter()
                .filter(|p| matches!(self.nodes[**p].forwarders.get(&node.index), Some(Some(_))))
                .count();
            if forwarding > 1 && node.aggregator.is_none() {
                return Err(DagError::MissingAggregator(node.id.clone()));
            }
        }

        // Kahn's algorithm, ties broken by insertion order
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.depends_on.len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> =
            in_degree.iter().enumerate().filter(|(_, d)| **d == 0).map(|(i, _)| Reverse(i)).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &c in &self.nodes[i].children {
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    ready.push(Reverse(c));
                }
            }
        }
        self.order = order;
        for node in &mut self.nodes {
            node.unique_id = format!("{}_{}_{}", self.id, node.index, node.id);
        }
        Ok(())
    }

    /// `end_<dag id>`, suffixed with a counter while a user vertex holds it.
    fn free_end_id(&self) -> String {
        let base = format!("end_{}", self.id);
        if !self.by_id.contains_key(&base) {
            return base;
        }
        let mut n = 1;
        loop {
            let id = format!("{base}_{n}");
            if !self.by_id.contains_key(&id) {
                return id;
            }
            n += 1;
        }
    }

    /// True when validation had to join several sinks into `end_<dag id>`.
    pub fn has_synthesized_end(&self) -> bool {
        self.synthesized_end
    }

    pub fn is_synthesized_end(&self, node: &Node) -> bool {
        self.synthesized_end && self.end == Some(node.index)
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn has_branch(&self) -> bool {
        self.has_branch
    }

    pub fn has_edge(&self) -> bool {
        self.has_edge
    }

    /// True when no edge anywhere in the graph forwards data.
    pub fn is_execution_flow_only(&self) -> bool {
        self.execution_flow_only
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.by_id.get(id).map(|i| &self.nodes[*i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.start.map(|i| &self.nodes[i])
    }

    pub fn end_node(&self) -> Option<&Node> {
        self.end.map(|i| &self.nodes[i])
    }

    pub fn topological_order(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().map(|i| &self.nodes[*i])
    }

    /// The vertex executed after `id`, `None` once `id` is the last one.
    pub fn next_node(&self, id: &str) -> Option<&Node> {
        let index = *self.by_id.get(id)?;
        let pos = self.order.iter().position(|i| *i == index)?;
        self.order.get(pos + 1).map(|i| &self.nodes[*i])
    }

    /// Parents of `node` in topological order, with the forwarder of the
    /// connecting edge.
    pub fn parents<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = (&'a Node, Option<&'a ForwarderFn>)> + 'a {
        self.order.iter().filter(move |i| node.depends_on.contains(i)).map(move |i| {
            let parent = &self.nodes[*i];
            let forwarder = parent.forwarders.get(&node.index).and_then(Option::as_ref);
            (parent, forwarder)
        })
    }

    pub fn children<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Node> + 'a {
        node.children.iter().map(|i| &self.nodes[*i])
    }

    pub fn definition(&self) -> DagDefinition {
        DagDefinition {
            id: self.id.clone(),
            start: self.start_node().map(|n| n.id.clone()).unwrap_or_default(),
            end: self.end_node().map(|n| n.id.clone()).unwrap_or_default(),
            has_branch: self.has_branch,
            execution_flow_only: self.execution_flow_only,
            nodes: self.topological_order().map(|n| self.node_definition(n)).collect(),
        }
    }

    fn node_definition(&self, node: &Node) -> NodeDefinition {
        let (operations, sub_dag, conditional_dags) = match &node.kind {
            NodeKind::Task(ops) => (ops.iter().map(|o| o.id().to_string()).collect(), None, BTreeMap::new()),
            NodeKind::SubDag(dag) | NodeKind::ForEach { dag, .. } => {
                (Vec::new(), Some(Box::new(dag.definition())), BTreeMap::new())
            }
            NodeKind::Conditional { dags, .. } => (
                Vec::new(),
                None,
                dags.iter().map(|(label, dag)| (label.clone(), dag.definition())).collect(),
            ),
        };
        NodeDefinition {
            id: node.id.clone(),
            unique_id: node.unique_id.clone(),
            kind: node.kind.name().to_string(),
            operations,
            edges: node
                .children
                .iter()
                .map(|c| EdgeDefinition {
                    to: self.nodes[*c].id.clone(),
                    forwards: matches!(node.forwarders.get(c), Some(Some(_))),
                })
                .collect(),
            sub_dag,
            conditional_dags,
        }
    }
}

/// Default join of a synthesized end: a JSON object keyed by sink vertex id.
/// UTF-8 outputs become strings, anything else an array of bytes.
pub fn join_sinks(outputs: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, TessError> {
    let doc: serde_json::Map<String, serde_json::Value> = outputs
        .iter()
        .map(|(id, out)| {
            let value = match std::str::from_utf8(out) {
                Ok(text) => serde_json::Value::String(text.to_string()),
                Err(_) => serde_json::Value::from(out.clone()),
            };
            (id.clone(), value)
        })
        .collect();
    serde_json::to_vec(&doc).map_err(|e| TessError::Codec(e.to_string()))
}

// ---------------------------------------------------------------------------
// Exported definition
// ---------------------------------------------------------------------------

/// Serializable shape of a validated dag, published with flow registrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagDefinition {
    pub id: String,
    pub start: String,
    pub end: String,
    pub has_branch: bool,
    pub execution_flow_only: bool,
    pub nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    pub unique_id: String,
    pub kind: String,
    pub operations: Vec<String>,
    pub edges: Vec<EdgeDefinition>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sub_dag: Option<Box<DagDefinition>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub conditional_dags: BTreeMap<String, DagDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub to: String,
    pub forwards: bool,
}
