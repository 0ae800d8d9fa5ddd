use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use tess_types::TessError;

use crate::dag::DagDefinition;
use crate::executor::{stream_name, Executor, Flow};
use crate::operation::Options;
use crate::queue::{queue_subscribe, Queue};
use crate::state::StateStore;
use crate::task::{RequestType, Task};

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub worker_id: String,
    /// Consumers per flow stream.
    pub concurrency: usize,
    pub register_interval: Duration,
    pub stream_prefix: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        WorkflowConfig {
            worker_id: uuid::Uuid::new_v4().to_string(),
            concurrency: 2,
            register_interval: Duration::from_secs(4),
            stream_prefix: "system.workflows".to_string(),
        }
    }
}

/// Registration record announcing which flows a worker serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub flows: Vec<String>,
    pub concurrency: usize,
}

pub fn worker_key(id: &str) -> String {
    format!("worker:{id}")
}

pub fn flow_key(flow: &str) -> String {
    format!("flow:{flow}")
}

/// Owns the registered flows, their queue consumers and the periodic
/// registration task.
pub struct WorkflowRuntime<Q: Queue> {
    config: WorkflowConfig,
    queue: Arc<Q>,
    state: StateStore,
    flows: HashMap<String, Arc<Flow>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: bool,
}

impl<Q: Queue> WorkflowRuntime<Q> {
    pub fn new(config: WorkflowConfig, queue: Arc<Q>, state: StateStore) -> Self {
        WorkflowRuntime {
            config,
            queue,
            state,
            flows: HashMap::new(),
            tasks: Mutex::new(Vec::new()),
            started: false,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn register(&mut self, name: impl Into<String>, flow: Flow) -> Result<(), TessError> {
        let name = name.into();
        if self.started {
            return Err(TessError::InvalidArgument(format!(
                "can't register {name}, runtime already started"
            )));
        }
        if self.flows.contains_key(&name) {
            return Err(TessError::InvalidArgument(format!("flow {name} already registered")));
        }
        self.flows.insert(name, Arc::new(flow));
        Ok(())
    }

    /// Creates the flow streams, spawns `concurrency` consumers per flow and
    /// starts publishing registration records.
    pub async fn start(&mut self) -> Result<(), TessError> {
        if self.started {
            return Ok(());
        }
        let flows = Arc::new(self.flows.clone());
        let executor = Executor::new(
            flows,
            self.queue.clone(),
            self.state.clone(),
            self.config.stream_prefix.clone(),
        );

        let mut handles = Vec::new();
        for name in self.flows.keys() {
            let stream = stream_name(&self.config.stream_prefix, name);
            self.queue.add_stream(&stream).await?;
            for i in 0..self.config.concurrency.max(1) {
                let consumer = format!("{name}-consumer-{i}");
                self.queue.add_consumer(&stream, &consumer).await?;
                let executor = executor.clone();
                handles.push(queue_subscribe(
                    self.queue.clone(),
                    stream.clone(),
                    consumer,
                    move |payload: Vec<u8>| {
                        let executor = executor.clone();
                        async move { executor.handle(&payload).await }
                    },
                ));
            }
        }

        let registration = Registration {
            state: self.state.clone(),
            worker: Worker {
                id: self.config.worker_id.clone(),
                flows: {
                    let mut names: Vec<String> = self.flows.keys().cloned().collect();
                    names.sort();
                    names
                },
                concurrency: self.config.concurrency,
            },
            definitions: self
                .flows
                .iter()
                .map(|(name, flow)| (name.clone(), flow.dag().definition()))
                .collect(),
        };
        registration.publish().await?;

        let interval = self.config.register_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = registration.publish().await {
                    tracing::warn!(error = %e, "worker registration failed");
                }
            }
        }));

        self.tasks.lock().extend(handles);
        self.started = true;
        tracing::info!(worker_id = %self.config.worker_id, flows = self.flows.len(), concurrency = self.config.concurrency, "workflow runtime started");
        Ok(())
    }

    /// Stops consumers and registration, then withdraws the worker record.
    pub async fn shutdown(&self) -> Result<(), TessError> {
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        self.state.delete(&worker_key(&self.config.worker_id)).await?;
        tracing::info!(worker_id = %self.config.worker_id, "workflow runtime stopped");
        Ok(())
    }

    /// Queues a NEW request and returns its id.
    pub async fn execute(
        &self,
        flow: &str,
        body: impl Into<String>,
        header: Options,
        query: Options,
    ) -> Result<String, TessError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut task = Task::new(flow, request_id.clone(), RequestType::New);
        task.body = body.into();
        task.header = header;
        task.raw_query = raw_query(&query);
        task.query = query;
        self.publish(task).await?;
        tracing::debug!(flow, request_id = %request_id, "request queued");
        Ok(request_id)
    }

    pub async fn pause(&self, flow: &str, request_id: &str) -> Result<(), TessError> {
        self.publish(Task::new(flow, request_id, RequestType::Pause)).await
    }

    pub async fn resume(&self, flow: &str, request_id: &str) -> Result<(), TessError> {
        self.publish(Task::new(flow, request_id, RequestType::Resume)).await
    }

    pub async fn stop(&self, flow: &str, request_id: &str) -> Result<(), TessError> {
        self.publish(Task::new(flow, request_id, RequestType::Stop)).await
    }

    async fn publish(&self, task: Task) -> Result<(), TessError> {
        if !self.flows.contains_key(&task.flow_name) {
            return Err(TessError::FlowNotFound(task.flow_name));
        }
        let stream = stream_name(&self.config.stream_prefix, &task.flow_name);
        self.queue.publish(&stream, task.encode()?).await
    }
}

fn raw_query(query: &BTreeMap<String, Vec<String>>) -> String {
    query
        .iter()
        .flat_map(|(k, values)| values.iter().map(move |v| format!("{k}={v}")))
        .collect::<Vec<_>>()
        .join("&")
}

struct Registration {
    state: StateStore,
    worker: Worker,
    definitions: Vec<(String, DagDefinition)>,
}

impl Registration {
    async fn publish(&self) -> Result<(), TessError> {
        self.state.put_json(&worker_key(&self.worker.id), &self.worker).await?;
        for (name, definition) in &self.definitions {
            self.state.put_json(&flow_key(name), definition).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Dag;
    use crate::operation::Operation;
    use crate::pipeline::Outcome;
    use crate::queue::MemQueue;
    use tess_storage::mem::MemBucketStore;

    type Outcomes = Arc<Mutex<Vec<(String, Outcome)>>>;

    fn greeting(outcomes: &Outcomes) -> Flow {
        let mut dag = Dag::new("greet");
        dag.add_vertex(
            "hello",
            vec![Operation::new("hello", |d, options| {
                let name = options.get("name").and_then(|v| v.first()).cloned().unwrap_or_default();
                Ok([d, &b" "[..], name.as_bytes()].concat())
            })],
        )
        .unwrap();
        dag.add_vertex("bang", vec![Operation::new("bang", |d, _| Ok([d, &b"!"[..]].concat()))])
            .unwrap();
        dag.add_edge("hello", "bang").unwrap();
        let sink = outcomes.clone();
        Flow::new(dag)
            .unwrap()
            .finally(move |id, outcome| sink.lock().push((id.to_string(), outcome.clone())))
    }

    fn runtime(queue: Arc<MemQueue>) -> WorkflowRuntime<MemQueue> {
        let config = WorkflowConfig {
            worker_id: "w-1".into(),
            register_interval: Duration::from_millis(50),
            stream_prefix: "test.workflows".into(),
            ..Default::default()
        };
        WorkflowRuntime::new(config, queue, StateStore::new(Arc::new(MemBucketStore::new())))
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn executes_registered_flow() {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(MemQueue::default());
        let mut rt = runtime(queue.clone());
        rt.register("greet", greeting(&outcomes)).unwrap();
        rt.start().await.unwrap();

        let id = rt
            .execute("greet", "hi", Options::new(), BTreeMap::from([("name".into(), vec!["bo".into()])]))
            .await
            .unwrap();
        eventually(|| !outcomes.lock().is_empty()).await;
        assert_eq!(*outcomes.lock(), vec![(id, Outcome::Completed(b"hi bo!".to_vec()))]);

        let stats = queue.stats("test.workflows.greet").unwrap();
        assert_eq!((stats.acked, stats.naked), (2, 0));
        rt.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registers_worker_and_flow_definitions() {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut rt = runtime(Arc::new(MemQueue::default()));
        rt.register("greet", greeting(&outcomes)).unwrap();
        assert!(rt.register("greet", greeting(&outcomes)).is_err());
        rt.start().await.unwrap();
        assert!(rt.register("late", greeting(&outcomes)).is_err());

        let worker: Worker = rt.state.get_json(&worker_key("w-1")).await.unwrap().unwrap();
        assert_eq!(worker, Worker { id: "w-1".into(), flows: vec!["greet".into()], concurrency: 2 });
        let definition: DagDefinition = rt.state.get_json(&flow_key("greet")).await.unwrap().unwrap();
        assert_eq!((definition.start.as_str(), definition.end.as_str()), ("hello", "bang"));

        // the interval task rewrites a withdrawn record
        rt.state.delete(&worker_key("w-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rt.state.get(&worker_key("w-1")).await.unwrap().is_some());

        rt.shutdown().await.unwrap();
        assert!(rt.state.get(&worker_key("w-1")).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn control_tasks_for_unknown_requests_are_nakd() {
        let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(MemQueue::new(1));
        let mut rt = runtime(queue.clone());
        rt.register("greet", greeting(&outcomes)).unwrap();
        rt.start().await.unwrap();

        rt.pause("greet", "nope").await.unwrap();
        rt.stop("greet", "nope").await.unwrap();
        eventually(|| queue.stats("test.workflows.greet").unwrap().dropped == 2).await;
        assert_eq!(queue.stats("test.workflows.greet").unwrap().acked, 0);
        assert!(outcomes.lock().is_empty());
        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_flow_is_rejected() {
        let rt = runtime(Arc::new(MemQueue::default()));
        assert!(matches!(
            rt.execute("missing", "", Options::new(), Options::new()).await,
            Err(TessError::FlowNotFound(_))
        ));
        assert!(matches!(rt.resume("missing", "r").await, Err(TessError::FlowNotFound(_))));
    }

    #[test]
    fn raw_query_joins_pairs() {
        let query = BTreeMap::from([
            ("a".to_string(), vec!["1".to_string(), "2".to_string()]),
            ("b".to_string(), vec!["3".to_string()]),
        ]);
        assert_eq!(raw_query(&query), "a=1&a=2&b=3");
    }
}
