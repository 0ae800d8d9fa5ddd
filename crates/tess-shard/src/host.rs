use std::sync::Arc;
use std::time::Duration;

use tess_consensus::ConsensusHost;
use tess_types::{HostInfo, ReplicaId, ShardId, SnapshotOption, TessError};

use crate::effective_timeout;

/// Host-level maintenance: compaction, snapshots and introspection.
pub struct HostManager<H> {
    host: Arc<H>,
    default_timeout: Duration,
}

impl<H: ConsensusHost> HostManager<H> {
    pub fn new(host: Arc<H>, default_timeout: Duration) -> Self {
        HostManager { host, default_timeout }
    }

    pub fn id(&self) -> String {
        self.host.id()
    }

    pub fn raft_address(&self) -> String {
        self.host.raft_address()
    }

    pub async fn compact(&self, shard_id: ShardId, replica_id: ReplicaId) -> Result<(), TessError> {
        self.host.request_compaction(shard_id, replica_id).await
    }

    /// Returns the log index the snapshot covers.
    pub async fn snapshot(
        &self,
        shard_id: ShardId,
        option: SnapshotOption,
        timeout: Duration,
    ) -> Result<u64, TessError> {
        let timeout = effective_timeout(timeout, self.default_timeout);
        let index = self.host.sync_request_snapshot(shard_id, option, timeout).await?;
        tracing::info!(shard_id, index, "snapshot requested");
        Ok(index)
    }

    pub fn get_host_info(&self) -> HostInfo {
        self.host.host_info()
    }

    pub fn has_node_info(&self, shard_id: ShardId, replica_id: ReplicaId) -> bool {
        self.host.has_node_info(shard_id, replica_id)
    }

    pub fn stop(&self) {
        self.host.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RaftSettings, ShardManager};
    use tess_consensus::{LocalHost, StateMachineFactory};
    use tess_storage::mem::MemBucketStore;
    use tess_storage::ShardConfigStore;
    use tess_types::StateMachineType;

    #[tokio::test]
    async fn snapshot_compact_and_info() {
        let host = Arc::new(LocalHost::new("127.0.0.1:63001"));
        let unused: StateMachineFactory =
            Arc::new(|_, _| Err(TessError::UnsupportedStateMachine("kv".into())));
        let shards = ShardManager::new(
            host.clone(),
            ShardConfigStore::new(Arc::new(MemBucketStore::new())),
            unused,
            RaftSettings::default(),
            Duration::from_secs(1),
        );
        shards.new_shard(1, 1, StateMachineType::Test, Duration::ZERO).await.unwrap();
        shards.new_shard(2, 1, StateMachineType::Test, Duration::ZERO).await.unwrap();

        let manager = HostManager::new(host.clone(), Duration::from_secs(1));
        assert_eq!(manager.raft_address(), "127.0.0.1:63001");
        assert!(!manager.id().is_empty());

        let info = manager.get_host_info();
        assert_eq!(info.shards.len(), 2);
        assert!(info.shards.iter().all(|s| s.is_leader && s.replicas.len() == 1));
        assert!(manager.has_node_info(2, 1));
        assert!(!manager.has_node_info(2, 9));

        for _ in 0..600 {
            host.sync_propose(&host.get_noop_session(1), b"x".to_vec(), Duration::from_secs(1))
                .await
                .unwrap();
        }
        // nothing below the default overhead yet
        assert!(manager.compact(1, 1).await.is_err());
        let index = manager.snapshot(1, SnapshotOption::default(), Duration::ZERO).await.unwrap();
        assert_eq!(index, 600);

        manager.stop();
        assert!(manager.get_host_info().shards.is_empty());
    }
}
