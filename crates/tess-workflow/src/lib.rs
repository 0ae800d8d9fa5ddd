//! Workflow DAG engine and its durable-queue runtime.
//!
//! A [`Dag`] is a static graph of operations. A [`Pipeline`] pairs a shared
//! Dag with a serializable continuation, which is all the executor needs to
//! resume a request after any node.

pub mod dag;
pub mod executor;
pub mod operation;
pub mod pipeline;
pub mod queue;
pub mod runtime;
pub mod state;
pub mod task;

pub use dag::{Dag, DagDefinition, Node, NodeKind};
pub use executor::{Executor, Flow, RequestState};
pub use operation::{Operation, Options};
pub use pipeline::{Continuation, Outcome, Pipeline};
pub use queue::{queue_subscribe, Delivery, MemQueue, Queue};
pub use runtime::{Worker, WorkflowConfig, WorkflowRuntime};
pub use state::StateStore;
pub use task::{RequestType, Task};
