use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tess_types::{DagError, TessError};

use crate::dag::{Dag, Node};

/// Fallback node id when a dag has no resolvable start vertex.
const DEFAULT_INITIAL_NODE: &str = "0";

/// Where a request currently is inside its (possibly nested) dag.
///
/// `execution_position` maps each depth to the vertex id active at that
/// level; `dynamic_option` records, per dynamic vertex unique id, which item
/// or branch is being executed below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    #[serde(rename = "pipeline-execution-position")]
    pub execution_position: BTreeMap<usize, String>,
    #[serde(rename = "pipeline-execution-depth")]
    pub execution_depth: usize,
    #[serde(rename = "pipeline-dynamic-option")]
    pub dynamic_option: BTreeMap<String, String>,
}

/// How a request ended, reported to the `finally` handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(Vec<u8>),
    Failed(String),
    Stopped,
}

pub type PipelineFailureHandler =
    Arc<dyn Fn(&TessError) -> Result<Vec<u8>, TessError> + Send + Sync>;

pub type FinallyHandler = Arc<dyn Fn(&str, &Outcome) + Send + Sync>;

/// A validated dag plus the mutable continuation of one request.
#[derive(Clone)]
pub struct Pipeline {
    dag: Arc<Dag>,
    continuation: Continuation,
    failure_handler: Option<PipelineFailureHandler>,
    finally: Option<FinallyHandler>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("dag", &self.dag.id())
            .field("continuation", &self.continuation)
            .finish_non_exhaustive()
    }
}

fn missing(what: String) -> TessError {
    TessError::Dag(DagError::NoVertex(what))
}

impl Pipeline {
    /// Positions the pipeline on the dag's start vertex.
    pub fn new(dag: Arc<Dag>) -> Self {
        let mut pipeline =
            Pipeline { dag, continuation: Continuation::default(), failure_handler: None, finally: None };
        let initial = pipeline.get_initial_node_id();
        pipeline.continuation.execution_position.insert(0, initial);
        pipeline
    }

    pub fn with_failure_handler(mut self, handler: Option<PipelineFailureHandler>) -> Self {
        self.failure_handler = handler;
        self
    }

    pub fn with_finally(mut self, handler: Option<FinallyHandler>) -> Self {
        self.finally = handler;
        self
    }

    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    pub fn continuation(&self) -> &Continuation {
        &self.continuation
    }

    pub fn restore(&mut self, continuation: Continuation) {
        self.continuation = continuation;
    }

    pub fn encode_continuation(&self) -> Result<String, TessError> {
        serde_json::to_string(&self.continuation).map_err(|e| TessError::Codec(e.to_string()))
    }

    pub fn decode_continuation(&mut self, json: &str) -> Result<(), TessError> {
        self.continuation = serde_json::from_str(json).map_err(|e| TessError::Codec(e.to_string()))?;
        Ok(())
    }

    pub fn get_initial_node_id(&self) -> String {
        self.dag
            .start_node()
            .map(|n| n.id().to_string())
            .unwrap_or_else(|| DEFAULT_INITIAL_NODE.to_string())
    }

    /// Vertex and enclosing dag at every depth down to the current one.
    fn path(&self) -> Result<Vec<(&Node, &Dag)>, TessError> {
        let mut dag: &Dag = &self.dag;
        let mut path = Vec::with_capacity(self.continuation.execution_depth + 1);
        for depth in 0..=self.continuation.execution_depth {
            let node_id = self
                .continuation
                .execution_position
                .get(&depth)
                .ok_or_else(|| missing(format!("no position at depth {depth}")))?;
            let node = dag.node(node_id).ok_or_else(|| missing(format!("{node_id} in {}", dag.id())))?;
            path.push((node, dag));
            if depth == self.continuation.execution_depth {
                break;
            }
            let option = self.continuation.dynamic_option.get(node.unique_id()).map(String::as_str);
            dag = node
                .sub_dag(option)
                .ok_or_else(|| missing(format!("sub-dag of {} for {option:?}", node.unique_id())))?;
        }
        Ok(path)
    }

    /// Re-derives the executing vertex from the continuation alone.
    pub fn get_current_node_dag(&self) -> Result<(&Node, &Dag), TessError> {
        let path = self.path()?;
        path.last().copied().ok_or_else(|| missing("empty execution path".into()))
    }

    /// Distinguishes repeated executions of one static vertex, e.g. the same
    /// for-each sub-dag run for different items.
    pub fn get_node_execution_unique_id(&self, node: &Node) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Ok(path) = self.path() {
            for (ancestor, _) in &path[..path.len().saturating_sub(1)] {
                if let Some(option) = self.continuation.dynamic_option.get(ancestor.unique_id()) {
                    parts.push(option);
                }
            }
        }
        parts.push(node.unique_id());
        parts.join("--")
    }

    pub fn update_pipeline_execution_position(&mut self, node_id: &str) {
        let depth = self.continuation.execution_depth;
        self.continuation.execution_position.insert(depth, node_id.to_string());
    }

    /// Descends into the current vertex's sub-dag; `option` selects the
    /// item or branch for dynamic vertices.
    pub fn enter_sub_dag(&mut self, option: Option<&str>) -> Result<(), TessError> {
        let (key, start) = {
            let (node, _) = self.get_current_node_dag()?;
            let sub = node
                .sub_dag(option)
                .ok_or_else(|| missing(format!("sub-dag of {} for {option:?}", node.unique_id())))?;
            let start = sub
                .start_node()
                .map(|n| n.id().to_string())
                .ok_or_else(|| TessError::Dag(DagError::Empty(sub.id().to_string())))?;
            (node.unique_id().to_string(), start)
        };
        if let Some(option) = option {
            self.continuation.dynamic_option.insert(key, option.to_string());
        }
        self.continuation.execution_depth += 1;
        let depth = self.continuation.execution_depth;
        self.continuation.execution_position.insert(depth, start);
        Ok(())
    }

    /// Returns to the vertex that embeds the current dag.
    pub fn exit_sub_dag(&mut self) -> Result<(), TessError> {
        let depth = self.continuation.execution_depth;
        if depth == 0 {
            return Err(TessError::InvalidArgument("already at the top-level dag".into()));
        }
        self.continuation.execution_position.remove(&depth);
        self.continuation.execution_depth -= 1;
        Ok(())
    }

    pub fn dynamic_option(&self, node: &Node) -> Option<&str> {
        self.continuation.dynamic_option.get(node.unique_id()).map(String::as_str)
    }

    pub fn clear_dynamic_option(&mut self, unique_id: &str) {
        self.continuation.dynamic_option.remove(unique_id);
    }

    /// Last chance to turn a failed request into a result.
    pub fn handle_failure(&self, err: TessError) -> Result<Vec<u8>, TessError> {
        match &self.failure_handler {
            Some(handler) => handler(&err),
            None => Err(err),
        }
    }

    pub fn finish(&self, request_id: &str, outcome: &Outcome) {
        if let Some(finally) = &self.finally {
            finally(request_id, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    fn nested() -> Arc<Dag> {
        let mut inner = Dag::new("inner");
        inner.add_edge("i1", "i2").unwrap();

        let mut branch_a = Dag::new("a");
        branch_a.add_vertex("a1", vec![Operation::noop("a1")]).unwrap();
        let mut branch_b = Dag::new("b");
        branch_b.add_vertex("b1", vec![Operation::noop("b1")]).unwrap();

        let mut dag = Dag::new("flow");
        dag.add_vertex("first", vec![Operation::noop("first")]).unwrap();
        dag.add_sub_dag("sub", inner).unwrap();
        dag.add_conditional_dags(
            "choose",
            |_| "b".to_string(),
            BTreeMap::from([("a".to_string(), branch_a), ("b".to_string(), branch_b)]),
            None,
        )
        .unwrap();
        dag.add_edge("first", "sub").unwrap();
        dag.add_edge("sub", "choose").unwrap();
        dag.validate().unwrap();
        Arc::new(dag)
    }

    #[test]
    fn starts_at_initial_node() {
        let pipeline = Pipeline::new(nested());
        let (node, dag) = pipeline.get_current_node_dag().unwrap();
        assert_eq!(node.id(), "first");
        assert_eq!(dag.id(), "flow");
        assert_eq!(pipeline.get_initial_node_id(), "first");
    }

    #[test]
    fn resumes_inside_sub_dag_from_serialized_state() {
        let dag = nested();
        let mut pipeline = Pipeline::new(dag.clone());
        pipeline.update_pipeline_execution_position("sub");
        pipeline.enter_sub_dag(None).unwrap();
        pipeline.update_pipeline_execution_position("i2");

        let (node, level) = pipeline.get_current_node_dag().unwrap();
        let before = (node.unique_id().to_string(), level.id().to_string());
        assert_eq!(before, ("flow_1_1_i2".to_string(), "flow_1".to_string()));

        let json = pipeline.encode_continuation().unwrap();
        assert!(json.contains("pipeline-execution-position"));
        assert!(json.contains("\"pipeline-execution-depth\":1"));

        let mut fresh = Pipeline::new(dag);
        fresh.decode_continuation(&json).unwrap();
        let (node, level) = fresh.get_current_node_dag().unwrap();
        assert_eq!((node.unique_id().to_string(), level.id().to_string()), before);
        assert_eq!(fresh.continuation(), pipeline.continuation());
    }

    #[test]
    fn dynamic_option_selects_branch() {
        let mut pipeline = Pipeline::new(nested());
        pipeline.update_pipeline_execution_position("choose");
        assert!(pipeline.enter_sub_dag(Some("missing")).is_err());
        assert_eq!(pipeline.continuation().execution_depth, 0);

        pipeline.enter_sub_dag(Some("b")).unwrap();
        let (node, level) = pipeline.get_current_node_dag().unwrap();
        assert_eq!(node.id(), "b1");
        assert_eq!(level.id(), "flow_2_b");
        assert_eq!(pipeline.get_node_execution_unique_id(node), "b--flow_2_b_0_b1");

        pipeline.exit_sub_dag().unwrap();
        let (node, _) = pipeline.get_current_node_dag().unwrap();
        assert_eq!(node.id(), "choose");
        assert_eq!(pipeline.dynamic_option(node), Some("b"));
        assert_eq!(pipeline.get_node_execution_unique_id(node), "flow_2_choose");
        assert!(pipeline.exit_sub_dag().is_err());
    }

    #[test]
    fn corrupt_position_is_an_error() {
        let mut pipeline = Pipeline::new(nested());
        pipeline.update_pipeline_execution_position("nowhere");
        assert!(matches!(
            pipeline.get_current_node_dag(),
            Err(TessError::Dag(DagError::NoVertex(_)))
        ));
    }

    #[test]
    fn handlers_run() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pipeline = Pipeline::new(nested())
            .with_failure_handler(Some(Arc::new(|_| Ok(b"recovered".to_vec()))))
            .with_finally(Some(Arc::new(move |id, outcome| sink.lock().push((id.to_string(), outcome.clone())))));

        assert_eq!(pipeline.handle_failure(TessError::Timeout).unwrap(), b"recovered");
        pipeline.finish("r-1", &Outcome::Stopped);
        assert_eq!(*seen.lock(), vec![("r-1".to_string(), Outcome::Stopped)]);
    }
}
