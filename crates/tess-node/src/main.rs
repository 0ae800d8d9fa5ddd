use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use tess_consensus::{LocalHost, StateMachineFactory};
use tess_kv::KvStore;
use tess_shard::{HostManager, MembershipListener, RaftSettings, ShardManager, ShardRouter, TransactionManager};
use tess_storage::fjall::FjallBucketStore;
use tess_storage::{KvStateMachine, ShardConfigStore, StateMachine};
use tess_types::{ShardId, StateMachineType};
use tess_workflow::{Dag, Flow, MemQueue, Operation, StateStore, WorkflowConfig, WorkflowRuntime};

#[derive(clap::Parser, Debug)]
#[command(name = "tess-node", about = "Tessera sharded KV node")]
struct Cli {
    #[arg(long)]
    node_id: u64,
    #[arg(long)]
    raft_address: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Shard to bootstrap on this node: "<id>" or "<id>:test", repeatable
    #[arg(long = "shard")]
    shards: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HostConfig {
    data_dir: PathBuf,
    raft_address: String,
}

#[derive(Debug, Deserialize)]
struct RaftConfig {
    election_rtt: u64,
    heartbeat_rtt: u64,
    snapshot_entries: u64,
    compaction_overhead: u64,
    check_quorum: bool,
    ordered_config_change: bool,
}

#[derive(Debug, Deserialize)]
struct TimeoutConfig {
    default_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct WorkflowSection {
    concurrency: usize,
    register_interval_secs: u64,
    stream_prefix: String,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    host: HostConfig,
    raft: RaftConfig,
    shard: TimeoutConfig,
    kv: TimeoutConfig,
    workflow: WorkflowSection,
    observability: ObservabilityConfig,
}

impl RaftConfig {
    fn settings(&self) -> RaftSettings {
        RaftSettings {
            election_rtt: self.election_rtt,
            heartbeat_rtt: self.heartbeat_rtt,
            check_quorum: self.check_quorum,
            snapshot_entries: self.snapshot_entries,
            compaction_overhead: self.compaction_overhead,
            ordered_config_change: self.ordered_config_change,
        }
    }
}

fn parse_shard(spec: &str) -> anyhow::Result<(ShardId, StateMachineType)> {
    let (id, kind) = spec.split_once(':').unwrap_or((spec, "kv"));
    let shard_id: ShardId = id.parse().with_context(|| format!("invalid shard id: {spec}"))?;
    let sm_type = match kind {
        "kv" => StateMachineType::Kv,
        "test" => StateMachineType::Test,
        other => anyhow::bail!("unknown state machine type {other:?} in --shard {spec}"),
    };
    Ok((shard_id, sm_type))
}

/// Passes its body through; lets operators check the workflow queue end to end.
fn echo_flow() -> anyhow::Result<Flow> {
    let mut dag = Dag::new("echo");
    dag.add_vertex("echo", vec![Operation::noop("echo")])?;
    let flow = Flow::new(dag)?.finally(|request_id, outcome| {
        tracing::info!(request_id, ?outcome, "echo finished");
    });
    Ok(flow)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("TESSERA_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    if let Some(dir) = cli.data_dir.clone() {
        config.host.data_dir = dir;
    }
    if let Some(addr) = cli.raft_address.clone() {
        config.host.raft_address = addr;
    }

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let shards = cli
        .shards
        .iter()
        .map(|s| parse_shard(s))
        .collect::<anyhow::Result<Vec<_>>>()?;

    tracing::info!(
        node_id = cli.node_id,
        raft_address = %config.host.raft_address,
        data_dir = %config.host.data_dir.display(),
        "node starting"
    );

    let data_dir = config.host.data_dir.clone();
    let system = FjallBucketStore::open(&data_dir.join("system"))
        .with_context(|| format!("failed to open system store in {}", data_dir.display()))?;
    let shard_store = ShardConfigStore::new(system.clone());

    let shard_dir = data_dir.join("shards");
    let kv_factory: StateMachineFactory = Arc::new(move |shard_id, replica_id| {
        let store = FjallBucketStore::open(&shard_dir.join(format!("{shard_id}-{replica_id}")))?;
        Ok(Box::new(KvStateMachine::new(store)) as Box<dyn StateMachine>)
    });

    let shard_timeout = Duration::from_millis(config.shard.default_timeout_ms);
    let kv_timeout = Duration::from_millis(config.kv.default_timeout_ms);

    let host = Arc::new(LocalHost::new(config.host.raft_address.clone()));
    let router = Arc::new(ShardRouter::default());
    let listener = MembershipListener::new(host.clone(), router.clone(), shard_store.clone()).spawn();

    let host_manager = HostManager::new(host.clone(), shard_timeout);
    let shard_manager = ShardManager::new(
        host.clone(),
        shard_store,
        kv_factory,
        config.raft.settings(),
        shard_timeout,
    );
    let transactions = Arc::new(TransactionManager::new(host.clone(), kv_timeout));

    let restored = shard_manager.restore().await.context("failed to restore shards")?;
    tracing::info!(restored, "persisted replicas restored");

    for (shard_id, sm_type) in shards {
        if host_manager.has_node_info(shard_id, cli.node_id) {
            continue;
        }
        shard_manager
            .new_shard(shard_id, cli.node_id, sm_type, Duration::ZERO)
            .await
            .with_context(|| format!("failed to bootstrap shard {shard_id}"))?;
    }

    let _kv = KvStore::new(host.clone(), router.clone(), transactions.clone(), kv_timeout);
    let info = host_manager.get_host_info();
    tracing::info!(host_id = %info.host_id, shards = info.shards.len(), replicas = router.replica_count(), "kv store ready");

    let workflow_config = WorkflowConfig {
        worker_id: format!("{}-{}", cli.node_id, host_manager.id()),
        concurrency: config.workflow.concurrency,
        register_interval: Duration::from_secs(config.workflow.register_interval_secs),
        stream_prefix: config.workflow.stream_prefix.clone(),
    };
    let mut workflows = WorkflowRuntime::new(workflow_config, Arc::new(MemQueue::default()), StateStore::new(system));
    workflows.register("echo", echo_flow()?)?;
    workflows.start().await.context("failed to start workflow runtime")?;

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    if let Err(e) = workflows.shutdown().await {
        tracing::warn!(error = %e, "workflow runtime shutdown failed");
    }
    host_manager.stop();
    listener.abort();
    Ok(())
}
