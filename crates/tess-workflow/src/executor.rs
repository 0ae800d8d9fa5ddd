use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use tess_types::{DagError, TessError};

use crate::dag::{Dag, Node, NodeKind};
use crate::operation::Options;
use crate::pipeline::{Continuation, FinallyHandler, Outcome, Pipeline, PipelineFailureHandler};
use crate::queue::Queue;
use crate::state::StateStore;
use crate::task::{RequestType, Task};

/// A validated dag with its request-level handlers.
#[derive(Clone)]
pub struct Flow {
    dag: Arc<Dag>,
    failure_handler: Option<PipelineFailureHandler>,
    finally: Option<FinallyHandler>,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow").field("dag", &self.dag.id()).finish_non_exhaustive()
    }
}

impl Flow {
    pub fn new(mut dag: Dag) -> Result<Self, TessError> {
        dag.validate()?;
        Ok(Flow { dag: Arc::new(dag), failure_handler: None, finally: None })
    }

    /// Runs when a node fails; an `Ok` payload completes the request instead.
    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TessError) -> Result<Vec<u8>, TessError> + Send + Sync + 'static,
    {
        self.failure_handler = Some(Arc::new(handler));
        self
    }

    /// Runs once per request when it completes, fails or is stopped.
    pub fn finally<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Outcome) + Send + Sync + 'static,
    {
        self.finally = Some(Arc::new(handler));
        self
    }

    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    fn pipeline(&self, continuation: Option<Continuation>) -> Pipeline {
        let mut pipeline = Pipeline::new(self.dag.clone())
            .with_failure_handler(self.failure_handler.clone())
            .with_finally(self.finally.clone());
        if let Some(continuation) = continuation {
            pipeline.restore(continuation);
        }
        pipeline
    }
}

// ---------------------------------------------------------------------------
// Request state
// ---------------------------------------------------------------------------

/// Cursor a request starts with.
pub const ROOT_CURSOR: &str = "";

/// Everything besides the static dag needed to resume a request.
///
/// Each cursor is one line of execution with its own continuation. A
/// for-each replaces its cursor with one cursor per item, and the item that
/// finishes last carries on past the for-each node. Node data is keyed by
/// execution unique id, so runs of one sub-dag for different items never
/// collide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestState {
    pub flow: String,
    pub request_id: String,
    pub cursors: BTreeMap<String, Continuation>,
    pub options: Options,
    pub inputs: BTreeMap<String, Vec<u8>>,
    pub outputs: BTreeMap<String, Vec<u8>>,
    /// Item keys per for-each execution id.
    pub items: BTreeMap<String, Vec<String>>,
    /// Finished item outputs per for-each execution id.
    pub branch_outputs: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    pub paused: bool,
    /// PARTIAL tasks received while paused.
    pub held: Vec<Task>,
}

pub fn request_key(flow: &str, request_id: &str) -> String {
    format!("request:{flow}:{request_id}")
}

pub fn stream_name(prefix: &str, flow: &str) -> String {
    format!("{prefix}.{flow}")
}

fn partial(state: &RequestState, cursor: String) -> Task {
    Task::new(state.flow.clone(), state.request_id.clone(), RequestType::Partial).with_cursor(cursor)
}

enum Step {
    /// The cursor moved on to its next node.
    Advance,
    /// The cursor was replaced by one cursor per for-each item.
    Fork(Vec<(String, Continuation)>),
    /// The cursor finished its item while other items are still running.
    Joined,
    Done(Vec<u8>),
}

enum Plan {
    /// Run the operations of the current task node.
    Operations { exec_id: String, input: Vec<u8> },
    Structural(Action),
}

enum Action {
    Complete { exec_id: String, output: Vec<u8> },
    Enter { option: Option<String>, input: Vec<u8> },
    Fork { exec_id: String, items: Vec<(String, Vec<u8>)> },
}

enum Resolution {
    Joined,
    Done(Vec<u8>),
}

fn missing(what: String) -> TessError {
    TessError::Dag(DagError::NoVertex(what))
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Handles the tasks of every registered flow: one node per task, with the
/// continuation persisted in between.
pub struct Executor<Q: Queue> {
    flows: Arc<HashMap<String, Arc<Flow>>>,
    queue: Arc<Q>,
    state: StateStore,
    stream_prefix: String,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<Q: Queue> Clone for Executor<Q> {
    fn clone(&self) -> Self {
        Executor {
            flows: self.flows.clone(),
            queue: self.queue.clone(),
            state: self.state.clone(),
            stream_prefix: self.stream_prefix.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<Q: Queue> Executor<Q> {
    pub fn new(
        flows: Arc<HashMap<String, Arc<Flow>>>,
        queue: Arc<Q>,
        state: StateStore,
        stream_prefix: impl Into<String>,
    ) -> Self {
        Executor {
            flows,
            queue,
            state,
            stream_prefix: stream_prefix.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Processes one dequeued task. `Err` means the delivery must be nak'd.
    pub async fn handle(&self, payload: &[u8]) -> Result<(), TessError> {
        let task = Task::decode(payload)?;
        let flow = self
            .flows
            .get(&task.flow_name)
            .cloned()
            .ok_or_else(|| TessError::FlowNotFound(task.flow_name.clone()))?;
        let key = request_key(&task.flow_name, &task.request_id);
        tracing::debug!(
            flow = %task.flow_name,
            request_id = %task.request_id,
            request_type = ?task.request_type,
            cursor = %task.cursor,
            "handling task"
        );

        let request_type = task.request_type;
        match request_type {
            RequestType::New => self.start_request(&flow, &key, task).await,
            RequestType::Partial => self.execute(&flow, &key, task.cursor).await,
            RequestType::Pause => {
                let _guard = self.lock(&key).await;
                self.pause_request(&key).await
            }
            RequestType::Resume => {
                let _guard = self.lock(&key).await;
                self.resume_request(&key).await
            }
            RequestType::Stop => {
                let _guard = self.lock(&key).await;
                self.stop_request(&flow, &key, &task.request_id).await
            }
        }
    }

    pub async fn publish(&self, task: &Task) -> Result<(), TessError> {
        let stream = stream_name(&self.stream_prefix, &task.flow_name);
        self.queue.publish(&stream, task.encode()?).await
    }

    /// Serialises reads and writes of one request's state.
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    fn release(&self, key: &str) {
        self.locks.lock().remove(key);
    }

    async fn load(&self, key: &str) -> Result<RequestState, TessError> {
        self.state
            .get_json(key)
            .await?
            .ok_or_else(|| TessError::InvalidArgument(format!("no state for {key}")))
    }

    async fn start_request(&self, flow: &Flow, key: &str, task: Task) -> Result<(), TessError> {
        {
            let _guard = self.lock(key).await;
            if self.state.get(key).await?.is_some() {
                tracing::warn!(request_id = %task.request_id, "request already started, ignoring duplicate");
                return Ok(());
            }
            let pipeline = flow.pipeline(None);
            let (start, _) = pipeline.get_current_node_dag()?;
            let start_exec = pipeline.get_node_execution_unique_id(start);
            let mut options = task.header;
            options.extend(task.query);
            let state = RequestState {
                flow: task.flow_name,
                request_id: task.request_id,
                cursors: BTreeMap::from([(ROOT_CURSOR.to_string(), pipeline.continuation().clone())]),
                options,
                inputs: BTreeMap::from([(start_exec, task.body.into_bytes())]),
                ..Default::default()
            };
            self.state.put_json(key, &state).await?;
        }
        self.execute(flow, key, ROOT_CURSOR.to_string()).await
    }

    /// Runs the current node of one cursor. State is read and written under
    /// the request lock; task operations run without it, so the cursors of a
    /// fanned-out request make progress side by side.
    async fn execute(&self, flow: &Flow, key: &str, cursor: String) -> Result<(), TessError> {
        let (mut pipeline, exec_id, input, options) = {
            let _guard = self.lock(key).await;
            let mut state = self.load(key).await?;
            if state.paused {
                tracing::debug!(request_id = %state.request_id, cursor = %cursor, "request paused, holding task");
                let held = partial(&state, cursor);
                state.held.push(held);
                return self.state.put_json(key, &state).await;
            }
            let continuation = state
                .cursors
                .get(&cursor)
                .cloned()
                .ok_or_else(|| TessError::InvalidArgument(format!("no cursor {cursor:?} for {key}")))?;
            let mut pipeline = flow.pipeline(Some(continuation));
            match plan(&pipeline, &state) {
                Ok(Plan::Operations { exec_id, input }) => {
                    (pipeline, exec_id, input, state.options.clone())
                }
                Ok(Plan::Structural(action)) => {
                    let step = apply(&mut pipeline, &mut state, action);
                    return self.settle(pipeline, key, state, cursor, step).await;
                }
                Err(err) => return self.settle(pipeline, key, state, cursor, Err(err)).await,
            }
        };

        let output = run_operations(&pipeline, input, &options);

        let _guard = self.lock(key).await;
        let Some(mut state) = self.state.get_json::<RequestState>(key).await? else {
            tracing::debug!(cursor = %cursor, "request finished while its node ran");
            return Ok(());
        };
        if state.cursors.get(&cursor) != Some(pipeline.continuation()) {
            tracing::warn!(request_id = %state.request_id, cursor = %cursor, "cursor moved while its node ran, dropping result");
            return Ok(());
        }
        let step = output.and_then(|output| complete_node(&mut pipeline, &mut state, exec_id, output));
        self.settle(pipeline, key, state, cursor, step).await
    }

    /// Persists the outcome of one step and publishes follow-up tasks.
    async fn settle(
        &self,
        pipeline: Pipeline,
        key: &str,
        mut state: RequestState,
        cursor: String,
        step: Result<Step, TessError>,
    ) -> Result<(), TessError> {
        let request_id = state.request_id.clone();
        match step {
            Ok(Step::Advance) => {
                state.cursors.insert(cursor.clone(), pipeline.continuation().clone());
                self.state.put_json(key, &state).await?;
                self.publish(&partial(&state, cursor)).await
            }
            Ok(Step::Fork(branches)) => {
                state.cursors.remove(&cursor);
                let tasks: Vec<Task> = branches.iter().map(|(id, _)| partial(&state, id.clone())).collect();
                state.cursors.extend(branches);
                self.state.put_json(key, &state).await?;
                tracing::debug!(request_id = %request_id, branches = tasks.len(), "request fanned out");
                for task in &tasks {
                    self.publish(task).await?;
                }
                Ok(())
            }
            Ok(Step::Joined) => {
                state.cursors.remove(&cursor);
                self.state.put_json(key, &state).await
            }
            Ok(Step::Done(output)) => {
                self.finish(&pipeline, key, &request_id, Outcome::Completed(output)).await
            }
            Err(err) => match pipeline.handle_failure(err) {
                Ok(output) => {
                    self.finish(&pipeline, key, &request_id, Outcome::Completed(output)).await
                }
                Err(err) => {
                    tracing::error!(request_id = %request_id, error = %err, "request failed");
                    self.finish(&pipeline, key, &request_id, Outcome::Failed(err.to_string())).await?;
                    Err(err)
                }
            },
        }
    }

    async fn pause_request(&self, key: &str) -> Result<(), TessError> {
        let mut state = self.load(key).await?;
        state.paused = true;
        self.state.put_json(key, &state).await?;
        tracing::info!(request_id = %state.request_id, "request paused");
        Ok(())
    }

    async fn resume_request(&self, key: &str) -> Result<(), TessError> {
        let mut state = self.load(key).await?;
        if !state.paused {
            tracing::debug!(request_id = %state.request_id, "request not paused");
            return Ok(());
        }
        let held = std::mem::take(&mut state.held);
        state.paused = false;
        self.state.put_json(key, &state).await?;
        for task in &held {
            self.publish(task).await?;
        }
        tracing::info!(request_id = %state.request_id, held = held.len(), "request resumed");
        Ok(())
    }

    async fn stop_request(&self, flow: &Flow, key: &str, request_id: &str) -> Result<(), TessError> {
        self.load(key).await?;
        let pipeline = flow.pipeline(None);
        self.finish(&pipeline, key, request_id, Outcome::Stopped).await
    }

    async fn finish(
        &self,
        pipeline: &Pipeline,
        key: &str,
        request_id: &str,
        outcome: Outcome,
    ) -> Result<(), TessError> {
        self.state.delete(key).await?;
        self.release(key);
        pipeline.finish(request_id, &outcome);
        tracing::info!(request_id, outcome = outcome_name(&outcome), "request finished");
        Ok(())
    }
}

fn outcome_name(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Completed(_) => "completed",
        Outcome::Failed(_) => "failed",
        Outcome::Stopped => "stopped",
    }
}

// ---------------------------------------------------------------------------
// Step machine
// ---------------------------------------------------------------------------

/// Works out what the node at the current position needs. Task nodes are
/// handed back so their operations can run; other kinds become an action on
/// the continuation.
fn plan(pipeline: &Pipeline, state: &RequestState) -> Result<Plan, TessError> {
    let (node, level) = pipeline.get_current_node_dag()?;
    let exec_id = pipeline.get_node_execution_unique_id(node);
    let input = node_input(pipeline, node, level, state, &exec_id)?;
    let action = match node.kind() {
        NodeKind::Task(_) => return Ok(Plan::Operations { exec_id, input }),
        NodeKind::SubDag(_) => Action::Enter { option: None, input },
        NodeKind::Conditional { dags, condition, .. } => {
            let label = condition(&input);
            if !dags.contains_key(&label) {
                return Err(missing(format!("branch {label} of {}", node.unique_id())));
            }
            Action::Enter { option: Some(label), input }
        }
        NodeKind::ForEach { foreach, aggregator, .. } => {
            let items = foreach(&input)?;
            let mut keys = HashSet::with_capacity(items.len());
            if let Some((key, _)) = items.iter().find(|(key, _)| !keys.insert(key.as_str())) {
                return Err(TessError::InvalidArgument(format!(
                    "duplicate item key {key:?} from {}",
                    node.unique_id()
                )));
            }
            if items.is_empty() {
                Action::Complete { exec_id, output: aggregator(&BTreeMap::new())? }
            } else {
                Action::Fork { exec_id, items }
            }
        }
    };
    Ok(Plan::Structural(action))
}

fn run_operations(pipeline: &Pipeline, input: Vec<u8>, options: &Options) -> Result<Vec<u8>, TessError> {
    let (node, _) = pipeline.get_current_node_dag()?;
    let NodeKind::Task(operations) = node.kind() else {
        return Err(missing(format!("operations of {}", node.unique_id())));
    };
    operations.iter().try_fold(input, |data, op| op.execute(&data, options))
}

fn apply(pipeline: &mut Pipeline, state: &mut RequestState, action: Action) -> Result<Step, TessError> {
    match action {
        Action::Complete { exec_id, output } => complete_node(pipeline, state, exec_id, output),
        Action::Enter { option, input } => {
            enter(pipeline, state, option.as_deref(), input)?;
            Ok(Step::Advance)
        }
        Action::Fork { exec_id, items } => {
            state.items.insert(exec_id, items.iter().map(|(key, _)| key.clone()).collect());
            let mut branches = Vec::with_capacity(items.len());
            for (key, item) in items {
                let mut branch = pipeline.clone();
                let cursor = enter(&mut branch, state, Some(&key), item)?;
                branches.push((cursor, branch.continuation().clone()));
            }
            Ok(Step::Fork(branches))
        }
    }
}

/// Descends into the current node's sub-dag and seeds its start vertex with
/// `input`. Returns the start vertex's execution id.
fn enter(
    pipeline: &mut Pipeline,
    state: &mut RequestState,
    option: Option<&str>,
    input: Vec<u8>,
) -> Result<String, TessError> {
    pipeline.enter_sub_dag(option)?;
    let (start, _) = pipeline.get_current_node_dag()?;
    let exec_id = pipeline.get_node_execution_unique_id(start);
    state.inputs.insert(exec_id.clone(), input);
    Ok(exec_id)
}

/// Records a node's output and moves to the next node, unwinding finished
/// sub-dags into their embedding node.
fn complete_node(
    pipeline: &mut Pipeline,
    state: &mut RequestState,
    mut exec_id: String,
    mut output: Vec<u8>,
) -> Result<Step, TessError> {
    loop {
        let next = {
            let (node, level) = pipeline.get_current_node_dag()?;
            if output_is_read(level, node) {
                state.outputs.insert(exec_id.clone(), output.clone());
            }
            level.next_node(node.id()).map(|n| n.id().to_string())
        };
        if let Some(next) = next {
            pipeline.update_pipeline_execution_position(&next);
            return Ok(Step::Advance);
        }
        if pipeline.continuation().execution_depth == 0 {
            return Ok(Step::Done(output));
        }

        pipeline.exit_sub_dag()?;
        let (unique_id, parent_exec, resolution) = {
            let (node, _) = pipeline.get_current_node_dag()?;
            let parent_exec = pipeline.get_node_execution_unique_id(node);
            let option = pipeline.dynamic_option(node).map(str::to_string);
            let resolution = match node.kind() {
                NodeKind::Task(_) => {
                    return Err(missing(format!("sub-dag of task node {}", node.unique_id())));
                }
                NodeKind::SubDag(_) | NodeKind::Conditional { aggregator: None, .. } => {
                    Resolution::Done(output)
                }
                NodeKind::Conditional { aggregator: Some(aggregator), .. } => {
                    let label = option.unwrap_or_default();
                    Resolution::Done(aggregator(&BTreeMap::from([(label, output)]))?)
                }
                NodeKind::ForEach { aggregator, .. } => {
                    let option =
                        option.ok_or_else(|| missing(format!("item of {}", node.unique_id())))?;
                    let expected = state.items.get(&parent_exec).map_or(0, Vec::len);
                    let finished = state.branch_outputs.entry(parent_exec.clone()).or_default();
                    finished.insert(option, output);
                    if finished.len() < expected {
                        Resolution::Joined
                    } else {
                        state.items.remove(&parent_exec);
                        let branches = state.branch_outputs.remove(&parent_exec).unwrap_or_default();
                        Resolution::Done(aggregator(&branches)?)
                    }
                }
            };
            (node.unique_id().to_string(), parent_exec, resolution)
        };

        match resolution {
            Resolution::Joined => return Ok(Step::Joined),
            Resolution::Done(aggregated) => {
                pipeline.clear_dynamic_option(&unique_id);
                exec_id = parent_exec;
                output = aggregated;
            }
        }
    }
}

/// Whether a later step reads this output back from the request state. When
/// no edge of the level forwards data, only a synthesized end reads outputs.
fn output_is_read(level: &Dag, node: &Node) -> bool {
    !level.is_execution_flow_only() || level.children(node).all(|c| level.is_synthesized_end(c))
}

/// Stored input for this execution, else what the forwarding parents
/// produced, each passed through its forwarder. Several inputs are joined by
/// the node's aggregator keyed by parent vertex id; a synthesized end joins
/// the outputs of every sink.
fn node_input(
    pipeline: &Pipeline,
    node: &Node,
    level: &Dag,
    state: &RequestState,
    exec_id: &str,
) -> Result<Vec<u8>, TessError> {
    if let Some(input) = state.inputs.get(exec_id) {
        return Ok(input.clone());
    }
    let joins_sinks = level.is_synthesized_end(node);
    if level.is_execution_flow_only() && !joins_sinks && node.aggregator().is_none() {
        return Ok(Vec::new());
    }
    let mut inputs = BTreeMap::new();
    for (parent, forwarder) in level.parents(node) {
        if forwarder.is_none() && !joins_sinks {
            continue;
        }
        let parent_exec = pipeline.get_node_execution_unique_id(parent);
        let output = state
            .outputs
            .get(&parent_exec)
            .ok_or_else(|| missing(format!("output of {parent_exec}")))?;
        let data = match forwarder {
            Some(forward) => forward(output),
            None => output.clone(),
        };
        inputs.insert(parent.id().to_string(), data);
    }
    match (node.aggregator(), inputs.len()) {
        (Some(aggregator), _) => aggregator(&inputs),
        (None, 0) => Ok(Vec::new()),
        (None, 1) => Ok(inputs.into_values().next().unwrap_or_default()),
        (None, _) => Err(TessError::Dag(DagError::MissingAggregator(node.id().to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::queue::MemQueue;
    use tess_storage::mem::MemBucketStore;

    const PREFIX: &str = "test.workflows";

    type Outcomes = Arc<Mutex<Vec<(String, Outcome)>>>;

    fn append(id: &str, suffix: &'static str) -> Operation {
        Operation::new(id, move |data, _| {
            let mut out = data.to_vec();
            out.extend_from_slice(suffix.as_bytes());
            Ok(out)
        })
    }

    fn linear() -> Dag {
        let mut dag = Dag::new("linear");
        dag.add_vertex("a", vec![append("a", "-a")]).unwrap();
        dag.add_vertex("b", vec![append("b", "-b")]).unwrap();
        dag.add_vertex("c", vec![append("c", "-c")]).unwrap();
        dag.add_edge("a", "b").unwrap();
        dag.add_edge("b", "c").unwrap();
        dag
    }

    fn nested() -> Dag {
        let mut upper = Dag::new("upper");
        upper
            .add_vertex("up", vec![Operation::new("up", |d, _| Ok(d.to_ascii_uppercase()))])
            .unwrap();

        let mut big = Dag::new("big");
        big.add_vertex("shout", vec![append("shout", "!")]).unwrap();
        let mut small = Dag::new("small");
        small.add_vertex("ask", vec![append("ask", "?")]).unwrap();

        let mut wrap = Dag::new("wrap");
        wrap.add_vertex(
            "w1",
            vec![Operation::new("w1", |d, _| Ok([&b"<"[..], d, &b">"[..]].concat()))],
        )
        .unwrap();
        wrap.add_vertex("w2", vec![append("w2", ".")]).unwrap();
        wrap.add_edge("w1", "w2").unwrap();

        let mut dag = Dag::new("nested");
        dag.add_vertex("split", vec![Operation::noop("split")]).unwrap();
        dag.add_foreach_dag(
            "each",
            upper,
            |d| {
                let text = String::from_utf8_lossy(d);
                Ok(text
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .enumerate()
                    .map(|(i, s)| (i.to_string(), s.as_bytes().to_vec()))
                    .collect())
            },
            |outputs| {
                let parts: Vec<&[u8]> = outputs.values().map(Vec::as_slice).collect();
                Ok(parts.join(&b","[..]))
            },
        )
        .unwrap();
        dag.add_conditional_dags(
            "route",
            |d| if d.contains(&b'A') { "big".to_string() } else { "small".to_string() },
            BTreeMap::from([("big".to_string(), big), ("small".to_string(), small)]),
            None,
        )
        .unwrap();
        dag.add_sub_dag("wrap", wrap).unwrap();
        dag.add_edge("split", "each").unwrap();
        dag.add_edge("each", "route").unwrap();
        dag.add_edge("route", "wrap").unwrap();
        dag
    }

    struct Harness {
        executor: Executor<MemQueue>,
        queue: Arc<MemQueue>,
        outcomes: Outcomes,
    }

    async fn harness(flows: Vec<(&str, Flow)>) -> Harness {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(MemQueue::new(2));
        let mut map = HashMap::new();
        for (name, flow) in flows {
            let sink = outcomes.clone();
            let flow = flow.finally(move |id, outcome| sink.lock().push((id.to_string(), outcome.clone())));
            let stream = stream_name(PREFIX, name);
            queue.add_stream(&stream).await.unwrap();
            queue.add_consumer(&stream, "c").await.unwrap();
            map.insert(name.to_string(), Arc::new(flow));
        }
        let state = StateStore::new(Arc::new(MemBucketStore::new()));
        let executor = Executor::new(Arc::new(map), queue.clone(), state, PREFIX);
        Harness { executor, queue, outcomes }
    }

    impl Harness {
        async fn submit(&self, flow: &str, id: &str, body: &str) {
            let mut task = Task::new(flow, id, RequestType::New);
            task.body = body.to_string();
            self.executor.publish(&task).await.unwrap();
        }

        /// Processes queued tasks until the stream is empty.
        async fn drain(&self, flow: &str) -> Vec<Result<(), TessError>> {
            let stream = stream_name(PREFIX, flow);
            let mut results = Vec::new();
            while self.queue.stats(&stream).unwrap().pending > 0 {
                results.push(self.process_one(flow).await);
            }
            results
        }

        async fn process_one(&self, flow: &str) -> Result<(), TessError> {
            let stream = stream_name(PREFIX, flow);
            let delivery = self.queue.next(&stream, "c").await.unwrap().unwrap();
            let result = self.executor.handle(&delivery.payload).await;
            match &result {
                Ok(()) => self.queue.ack(&delivery).await.unwrap(),
                Err(_) => self.queue.nak(&delivery).await.unwrap(),
            }
            result
        }

        async fn control(&self, flow: &str, id: &str, request_type: RequestType) -> Result<(), TessError> {
            let task = Task::new(flow, id, request_type);
            self.executor.handle(&task.encode().unwrap()).await
        }

        async fn state(&self, flow: &str, id: &str) -> Option<RequestState> {
            self.executor.state.get_json(&request_key(flow, id)).await.unwrap()
        }
    }

    #[tokio::test]
    async fn linear_flow_runs_one_node_per_task() {
        let h = harness(vec![("linear", Flow::new(linear()).unwrap())]).await;
        h.submit("linear", "r1", "x").await;

        let results = h.drain("linear").await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(*h.outcomes.lock(), vec![("r1".to_string(), Outcome::Completed(b"x-a-b-c".to_vec()))]);
        assert!(h.state("linear", "r1").await.is_none());
        assert_eq!(h.queue.stats(&stream_name(PREFIX, "linear")).unwrap().acked, 3);
    }

    #[tokio::test]
    async fn nested_foreach_conditional_and_sub_dag() {
        let h = harness(vec![("nested", Flow::new(nested()).unwrap())]).await;
        h.submit("nested", "r1", "a,b,c").await;
        h.submit("nested", "r2", "").await;

        let results = h.drain("nested").await;
        assert!(results.iter().all(Result::is_ok));
        let outcomes = h.outcomes.lock().clone();
        assert!(outcomes.contains(&("r1".to_string(), Outcome::Completed(b"<A,B,C!>.".to_vec()))));
        assert!(outcomes.contains(&("r2".to_string(), Outcome::Completed(b"<?>.".to_vec()))));
    }

    #[tokio::test]
    async fn synthesized_end_joins_sink_outputs() {
        let mut dag = Dag::new("fork");
        dag.add_vertex("root", vec![Operation::noop("root")]).unwrap();
        dag.add_vertex("left", vec![append("left", "-l")]).unwrap();
        dag.add_vertex("right", vec![append("right", "-r")]).unwrap();
        dag.add_edge("root", "left").unwrap();
        dag.add_edge("root", "right").unwrap();

        let h = harness(vec![("fork", Flow::new(dag).unwrap())]).await;
        h.submit("fork", "r1", "in").await;
        h.drain("fork").await;
        let outcomes = h.outcomes.lock().clone();
        let Outcome::Completed(out) = &outcomes[0].1 else { panic!("unexpected outcome {outcomes:?}") };
        let joined: serde_json::Value = serde_json::from_slice(out).unwrap();
        assert_eq!(joined, serde_json::json!({"left": "in-l", "right": "in-r"}));
    }

    #[tokio::test]
    async fn diamond_join_sees_both_parents() {
        let mut dag = Dag::new("diamond");
        dag.add_vertex("a", vec![Operation::noop("a")]).unwrap();
        dag.add_vertex("b", vec![append("b", "-b")]).unwrap();
        dag.add_vertex("c", vec![append("c", "-c")]).unwrap();
        dag.add_vertex("d", vec![Operation::noop("d")]).unwrap();
        dag.add_edge("a", "b").unwrap();
        dag.add_edge("a", "c").unwrap();
        dag.add_edge("b", "d").unwrap();
        dag.add_edge("c", "d").unwrap();
        dag.add_aggregator("d", |inputs| {
            let parts: Vec<String> =
                inputs.iter().map(|(k, v)| format!("{k}={}", String::from_utf8_lossy(v))).collect();
            Ok(parts.join("|").into_bytes())
        })
        .unwrap();

        let h = harness(vec![("diamond", Flow::new(dag).unwrap())]).await;
        h.submit("diamond", "r1", "x").await;
        assert!(h.drain("diamond").await.iter().all(Result::is_ok));
        assert_eq!(
            *h.outcomes.lock(),
            vec![("r1".to_string(), Outcome::Completed(b"b=x-b|c=x-c".to_vec()))]
        );
    }

    #[tokio::test]
    async fn execution_edges_forward_nothing() {
        let mut dag = Dag::new("ordered");
        dag.add_vertex("a", vec![append("a", "-a")]).unwrap();
        dag.add_vertex("b", vec![append("b", "-b")]).unwrap();
        dag.add_vertex("c", vec![append("c", "-c")]).unwrap();
        dag.add_execution_edge("a", "b").unwrap();
        dag.add_execution_edge("b", "c").unwrap();

        let h = harness(vec![("ordered", Flow::new(dag).unwrap())]).await;
        h.submit("ordered", "r1", "x").await;
        h.process_one("ordered").await.unwrap();
        let state = h.state("ordered", "r1").await.unwrap();
        assert!(state.outputs.is_empty());

        h.drain("ordered").await;
        assert_eq!(*h.outcomes.lock(), vec![("r1".to_string(), Outcome::Completed(b"-c".to_vec()))]);
    }

    #[tokio::test]
    async fn foreach_items_run_as_separate_tasks() {
        let h = harness(vec![("nested", Flow::new(nested()).unwrap())]).await;
        let stream = stream_name(PREFIX, "nested");
        h.submit("nested", "r1", "a,b,c").await;
        h.process_one("nested").await.unwrap();
        h.process_one("nested").await.unwrap();

        let state = h.state("nested", "r1").await.unwrap();
        assert_eq!(state.cursors.len(), 3);
        assert!(!state.cursors.contains_key(ROOT_CURSOR));
        assert_eq!(state.items.values().next().map(Vec::len), Some(3));
        assert_eq!(h.queue.stats(&stream).unwrap().pending, 3);

        let mut deliveries = Vec::new();
        for _ in 0..3 {
            deliveries.push(h.queue.next(&stream, "c").await.unwrap().unwrap());
        }
        let cursors: Vec<String> =
            deliveries.iter().map(|d| Task::decode(&d.payload).unwrap().cursor).collect();
        assert!(cursors.iter().all(|c| state.cursors.contains_key(c)));

        let (r3, r1, r2) = tokio::join!(
            h.executor.handle(&deliveries[2].payload),
            h.executor.handle(&deliveries[0].payload),
            h.executor.handle(&deliveries[1].payload),
        );
        assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());
        for delivery in &deliveries {
            h.queue.ack(delivery).await.unwrap();
        }

        let state = h.state("nested", "r1").await.unwrap();
        assert_eq!(state.cursors.len(), 1);
        assert!(state.items.is_empty() && state.branch_outputs.is_empty());
        assert_eq!(h.queue.stats(&stream).unwrap().pending, 1);

        assert!(h.drain("nested").await.iter().all(Result::is_ok));
        assert_eq!(
            *h.outcomes.lock(),
            vec![("r1".to_string(), Outcome::Completed(b"<A,B,C!>.".to_vec()))]
        );
    }

    #[tokio::test]
    async fn duplicate_item_keys_fail_the_request() {
        let mut echo = Dag::new("echo");
        echo.add_vertex("e", vec![Operation::noop("e")]).unwrap();
        let mut dag = Dag::new("dupes");
        dag.add_vertex("split", vec![Operation::noop("split")]).unwrap();
        dag.add_foreach_dag(
            "each",
            echo,
            |d| Ok(vec![("k".to_string(), d.to_vec()), ("k".to_string(), d.to_vec())]),
            |outputs| Ok(outputs.values().flatten().copied().collect()),
        )
        .unwrap();
        dag.add_edge("split", "each").unwrap();

        let h = harness(vec![("dupes", Flow::new(dag).unwrap())]).await;
        h.submit("dupes", "r1", "x").await;
        let results = h.drain("dupes").await;
        assert!(matches!(results[1], Err(TessError::InvalidArgument(_))));

        let outcomes = h.outcomes.lock().clone();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0].1, Outcome::Failed(msg) if msg.contains("duplicate item key")));
        assert!(h.state("dupes", "r1").await.is_none());
        assert_eq!(h.queue.stats(&stream_name(PREFIX, "dupes")).unwrap().pending, 0);
    }

    #[tokio::test]
    async fn failing_node_is_nakd_and_reported() {
        let mut dag = Dag::new("broken");
        dag.add_vertex("ok", vec![Operation::noop("ok")]).unwrap();
        dag.add_vertex(
            "bad",
            vec![Operation::new("bad", |_, _| Err(TessError::InvalidArgument("no".into())))],
        )
        .unwrap();
        dag.add_edge("ok", "bad").unwrap();

        let h = harness(vec![("broken", Flow::new(dag).unwrap())]).await;
        h.submit("broken", "r1", "x").await;

        assert!(h.process_one("broken").await.is_ok());
        assert!(matches!(h.process_one("broken").await, Err(TessError::Operation(_))));
        let stats = h.queue.stats(&stream_name(PREFIX, "broken")).unwrap();
        assert_eq!((stats.acked, stats.naked), (1, 1));

        let outcomes = h.outcomes.lock().clone();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0].1, Outcome::Failed(msg) if msg.contains("function(bad)")));
        assert!(h.state("broken", "r1").await.is_none());

        // redelivery finds no state and is nak'd again until dropped
        assert!(h.process_one("broken").await.is_err());
        assert_eq!(h.queue.stats(&stream_name(PREFIX, "broken")).unwrap().dropped, 1);
    }

    #[tokio::test]
    async fn failure_handler_recovers_request() {
        let mut dag = Dag::new("recover");
        dag.add_vertex(
            "bad",
            vec![Operation::new("bad", |_, _| Err(TessError::InvalidArgument("no".into())))],
        )
        .unwrap();
        let flow = Flow::new(dag).unwrap().on_failure(|_| Ok(b"fallback".to_vec()));

        let h = harness(vec![("recover", flow)]).await;
        h.submit("recover", "r1", "x").await;
        assert!(h.drain("recover").await.iter().all(Result::is_ok));
        assert_eq!(*h.outcomes.lock(), vec![("r1".to_string(), Outcome::Completed(b"fallback".to_vec()))]);
    }

    #[tokio::test]
    async fn pause_holds_and_resume_continues() {
        let h = harness(vec![("linear", Flow::new(linear()).unwrap())]).await;
        h.submit("linear", "r1", "x").await;
        h.process_one("linear").await.unwrap();

        h.control("linear", "r1", RequestType::Pause).await.unwrap();
        assert!(h.drain("linear").await.iter().all(Result::is_ok));
        let state = h.state("linear", "r1").await.unwrap();
        assert!(state.paused);
        let held: Vec<RequestType> = state.held.iter().map(|t| t.request_type).collect();
        assert_eq!(held, vec![RequestType::Partial]);
        assert!(h.outcomes.lock().is_empty());

        h.control("linear", "r1", RequestType::Resume).await.unwrap();
        h.drain("linear").await;
        assert_eq!(*h.outcomes.lock(), vec![("r1".to_string(), Outcome::Completed(b"x-a-b-c".to_vec()))]);
    }

    #[tokio::test]
    async fn stop_finishes_request() {
        let h = harness(vec![("linear", Flow::new(linear()).unwrap())]).await;
        h.submit("linear", "r1", "x").await;
        h.process_one("linear").await.unwrap();

        h.control("linear", "r1", RequestType::Stop).await.unwrap();
        assert_eq!(*h.outcomes.lock(), vec![("r1".to_string(), Outcome::Stopped)]);
        assert!(h.state("linear", "r1").await.is_none());
        assert!(h.control("linear", "r1", RequestType::Stop).await.is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_flow_and_garbage() {
        let h = harness(vec![("linear", Flow::new(linear()).unwrap())]).await;
        assert!(matches!(
            h.control("missing", "r1", RequestType::New).await,
            Err(TessError::FlowNotFound(_))
        ));
        assert!(matches!(h.executor.handle(b"not json").await, Err(TessError::Codec(_))));
        assert!(h.control("linear", "r9", RequestType::Partial).await.is_err());
    }

    /// Runs the current node of `pipeline` in place.
    fn step(pipeline: &mut Pipeline, state: &mut RequestState) -> Result<Step, TessError> {
        match plan(pipeline, state)? {
            Plan::Operations { exec_id, input } => {
                let output = run_operations(pipeline, input, &state.options)?;
                complete_node(pipeline, state, exec_id, output)
            }
            Plan::Structural(action) => apply(pipeline, state, action),
        }
    }

    #[test]
    fn options_reach_operations() {
        let mut dag = Dag::new("opts");
        dag.add_vertex(
            "echo",
            vec![Operation::new("echo", |_, options| {
                Ok(options.get("x-user").map(|v| v.join(",")).unwrap_or_default().into_bytes())
            })],
        )
        .unwrap();
        let flow = Flow::new(dag).unwrap();
        let mut pipeline = flow.pipeline(None);
        let mut state = RequestState {
            options: BTreeMap::from([("x-user".to_string(), vec!["ann".to_string()])]),
            ..Default::default()
        };
        match step(&mut pipeline, &mut state).unwrap() {
            Step::Done(out) => assert_eq!(out, b"ann"),
            _ => panic!("single node flow should finish"),
        }
    }
}
