use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tess_consensus::{ConsensusHost, StateMachineFactory};
use tess_storage::{CounterStateMachine, ShardConfigStore, StateMachine};
use tess_types::{
    MembershipEntry, OperationResult, ReplicaConfig, ReplicaId, ResultCode, ShardId, ShardState,
    StateMachineType, TessError,
};

use crate::effective_timeout;

pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Replica tuning applied to every replica this host starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftSettings {
    pub election_rtt: u64,
    pub heartbeat_rtt: u64,
    pub check_quorum: bool,
    pub snapshot_entries: u64,
    pub compaction_overhead: u64,
    pub ordered_config_change: bool,
}

impl Default for RaftSettings {
    fn default() -> Self {
        RaftSettings {
            election_rtt: 100,
            heartbeat_rtt: 10,
            check_quorum: true,
            snapshot_entries: 1000,
            compaction_overhead: 500,
            ordered_config_change: true,
        }
    }
}

impl RaftSettings {
    pub fn replica_config(&self, shard_id: ShardId, replica_id: ReplicaId) -> ReplicaConfig {
        ReplicaConfig {
            shard_id,
            replica_id,
            is_observer: false,
            is_witness: false,
            election_rtt: self.election_rtt,
            heartbeat_rtt: self.heartbeat_rtt,
            check_quorum: self.check_quorum,
            snapshot_entries: self.snapshot_entries,
            compaction_overhead: self.compaction_overhead,
            ordered_config_change: self.ordered_config_change,
        }
    }
}

/// Creates, grows, shrinks and stops the shard replicas hosted here.
///
/// Consensus errors are returned untouched and nothing is retried: a blind
/// retry of a config change could put two changes in flight.
pub struct ShardManager<H> {
    host: Arc<H>,
    store: ShardConfigStore,
    kv_factory: StateMachineFactory,
    raft: RaftSettings,
    default_timeout: Duration,
}

impl<H: ConsensusHost> ShardManager<H> {
    pub fn new(
        host: Arc<H>,
        store: ShardConfigStore,
        kv_factory: StateMachineFactory,
        raft: RaftSettings,
        default_timeout: Duration,
    ) -> Self {
        ShardManager { host, store, kv_factory, raft, default_timeout }
    }

    fn factory(&self, sm_type: StateMachineType) -> Result<StateMachineFactory, TessError> {
        match sm_type {
            StateMachineType::Test => Ok(Arc::new(|shard_id, replica_id| {
                Ok(Box::new(CounterStateMachine::new(shard_id, replica_id)) as Box<dyn StateMachine>)
            })),
            StateMachineType::Kv => Ok(self.kv_factory.clone()),
            StateMachineType::Unspecified => {
                Err(TessError::UnsupportedStateMachine(format!("{sm_type:?}")))
            }
        }
    }

    async fn launch(
        &self,
        members: BTreeMap<ReplicaId, String>,
        join: bool,
        sm_type: StateMachineType,
        config: ReplicaConfig,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let factory = self.factory(sm_type)?;
        let timeout = effective_timeout(timeout, self.default_timeout);
        tokio::time::timeout(timeout, self.host.start_replica(members, join, sm_type, factory, config))
            .await
            .map_err(|_| TessError::Timeout)?
    }

    /// Starts a new shard with this host as its only member.
    pub async fn new_shard(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        sm_type: StateMachineType,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let members = BTreeMap::from([(replica_id, self.host.raft_address())]);
        let config = self.raft.replica_config(shard_id, replica_id);
        self.launch(members.clone(), false, sm_type, config, timeout).await?;

        let membership = MembershipEntry { replicas: members, ..Default::default() };
        self.store
            .put(ShardState {
                shard_id,
                replica_id,
                state_machine_type: sm_type,
                membership,
                last_updated_ns: now_ns(),
            })
            .await?;
        tracing::info!(shard_id, replica_id, ?sm_type, "shard created");
        Ok(())
    }

    async fn start(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        sm_type: StateMachineType,
        restart: bool,
        is_observer: bool,
    ) -> Result<(), TessError> {
        let mut config = self.raft.replica_config(shard_id, replica_id);
        config.is_observer = is_observer;
        // an initial join expects no log on disk, a restart recovers it
        let join = !restart;
        self.launch(BTreeMap::new(), join, sm_type, config, Duration::ZERO).await?;

        if join {
            let mut membership = MembershipEntry::default();
            let address = self.host.raft_address();
            if is_observer {
                membership.observers.insert(replica_id, address);
            } else {
                membership.replicas.insert(replica_id, address);
            }
            self.store
                .put(ShardState {
                    shard_id,
                    replica_id,
                    state_machine_type: sm_type,
                    membership,
                    last_updated_ns: now_ns(),
                })
                .await?;
        }
        tracing::info!(shard_id, replica_id, restart, is_observer, "replica started");
        Ok(())
    }

    pub async fn start_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        sm_type: StateMachineType,
        restart: bool,
    ) -> Result<(), TessError> {
        self.start(shard_id, replica_id, sm_type, restart, false).await
    }

    pub async fn start_replica_observer(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        sm_type: StateMachineType,
        restart: bool,
    ) -> Result<(), TessError> {
        self.start(shard_id, replica_id, sm_type, restart, true).await
    }

    pub async fn add_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        address: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let timeout = effective_timeout(timeout, self.default_timeout);
        let m = self.host.sync_get_cluster_membership(shard_id, timeout).await?;
        self.host
            .sync_request_add_node(shard_id, replica_id, address.into(), m.config_change_id, timeout)
            .await?;
        tracing::info!(shard_id, replica_id, "replica added");
        Ok(())
    }

    pub async fn add_replica_observer(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        address: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let timeout = effective_timeout(timeout, self.default_timeout);
        let m = self.host.sync_get_cluster_membership(shard_id, timeout).await?;
        self.host
            .sync_request_add_observer(shard_id, replica_id, address.into(), m.config_change_id, timeout)
            .await?;
        tracing::info!(shard_id, replica_id, "observer added");
        Ok(())
    }

    pub async fn add_replica_witness(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        address: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let timeout = effective_timeout(timeout, self.default_timeout);
        let m = self.host.sync_get_cluster_membership(shard_id, timeout).await?;
        self.host
            .sync_request_add_witness(shard_id, replica_id, address.into(), m.config_change_id, timeout)
            .await?;
        tracing::info!(shard_id, replica_id, "witness added");
        Ok(())
    }

    /// Drops `replica_id` from the shard's configuration. Its data stays on
    /// disk until `remove_data`.
    pub async fn remove_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let timeout = effective_timeout(timeout, self.default_timeout);
        let m = self.host.sync_get_cluster_membership(shard_id, timeout).await?;
        if m.config_change_id == 0 {
            return Err(TessError::NoConfigChangeId);
        }
        self.host
            .sync_request_delete_node(shard_id, replica_id, m.config_change_id, timeout)
            .await?;
        tracing::info!(shard_id, replica_id, "replica removed");
        Ok(())
    }

    pub fn get_leader_id(&self, shard_id: ShardId) -> Result<(ReplicaId, bool), TessError> {
        self.host.get_leader_id(shard_id)
    }

    pub async fn get_shard_members(
        &self,
        shard_id: ShardId,
        timeout: Duration,
    ) -> Result<MembershipEntry, TessError> {
        let timeout = effective_timeout(timeout, self.default_timeout);
        self.host.sync_get_cluster_membership(shard_id, timeout).await
    }

    pub async fn stop_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
    ) -> Result<OperationResult, TessError> {
        self.host.stop_replica(shard_id, replica_id).await?;
        Ok(OperationResult { shard_id, replica_id, code: ResultCode::Completed })
    }

    pub async fn remove_data(&self, shard_id: ShardId, replica_id: ReplicaId) -> Result<(), TessError> {
        self.host.remove_data(shard_id, replica_id).await?;
        self.store.delete(shard_id).await?;
        tracing::info!(shard_id, replica_id, "replica data removed");
        Ok(())
    }

    /// Restarts every persisted replica this host does not already run.
    /// Returns how many came back; failures are logged and skipped.
    pub async fn restore(&self) -> Result<usize, TessError> {
        let mut restored = 0;
        for state in self.store.list().await? {
            let (shard_id, replica_id) = (state.shard_id, state.replica_id);
            if self.host.has_node_info(shard_id, replica_id) {
                continue;
            }
            let mut config = self.raft.replica_config(shard_id, replica_id);
            config.is_observer = state.membership.observers.contains_key(&replica_id);
            config.is_witness = state.membership.witnesses.contains_key(&replica_id);
            let members = state.membership.replicas.clone();
            match self
                .launch(members, false, state.state_machine_type, config, Duration::ZERO)
                .await
            {
                Ok(()) => {
                    restored += 1;
                    tracing::info!(shard_id, replica_id, "replica restored");
                }
                Err(e) => tracing::warn!(shard_id, replica_id, error = %e, "replica restore failed"),
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tess_consensus::LocalHost;
    use tess_storage::mem::MemBucketStore;
    use tess_storage::KvStateMachine;

    struct Fixture {
        host: Arc<LocalHost>,
        store: ShardConfigStore,
        manager: ShardManager<LocalHost>,
    }

    fn fixture_with(host: Arc<LocalHost>, store: ShardConfigStore) -> Fixture {
        let data = Arc::new(MemBucketStore::new());
        let kv_factory: StateMachineFactory = Arc::new(move |_, _| {
            Ok(Box::new(KvStateMachine::new(data.clone())) as Box<dyn StateMachine>)
        });
        let manager = ShardManager::new(
            host.clone(),
            store.clone(),
            kv_factory,
            RaftSettings::default(),
            Duration::from_secs(1),
        );
        Fixture { host, store, manager }
    }

    fn fixture() -> Fixture {
        let host = Arc::new(LocalHost::new("127.0.0.1:63001"));
        let store = ShardConfigStore::new(Arc::new(MemBucketStore::new()));
        fixture_with(host, store)
    }

    #[tokio::test]
    async fn new_shard_add_and_remove_replica() {
        let f = fixture();
        f.manager.new_shard(1, 1, StateMachineType::Kv, Duration::ZERO).await.unwrap();
        assert_eq!(f.manager.get_leader_id(1).unwrap(), (1, true));

        f.manager.add_replica(1, 2, "10.0.0.2:63001", Duration::ZERO).await.unwrap();
        let m = f.manager.get_shard_members(1, Duration::ZERO).await.unwrap();
        assert_eq!(m.replicas.len(), 2);

        f.manager.remove_replica(1, 2, Duration::ZERO).await.unwrap();
        let m = f.manager.get_shard_members(1, Duration::ZERO).await.unwrap();
        assert_eq!(m.replicas.len(), 1);
        assert!(m.removed.contains(&2));

        // removed ids are never re-admitted
        assert!(matches!(
            f.manager.add_replica(1, 2, "10.0.0.2:63001", Duration::ZERO).await,
            Err(TessError::ReplicaRemoved { .. })
        ));
    }

    #[tokio::test]
    async fn unsupported_state_machine() {
        let f = fixture();
        let err = f
            .manager
            .new_shard(1, 1, StateMachineType::Unspecified, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, TessError::UnsupportedStateMachine(_)));
        assert!(f.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_needs_a_config_change_id() {
        let f = fixture();
        f.manager.new_shard(1, 1, StateMachineType::Test, Duration::ZERO).await.unwrap();
        assert!(matches!(
            f.manager.remove_replica(1, 1, Duration::ZERO).await,
            Err(TessError::NoConfigChangeId)
        ));
    }

    #[tokio::test]
    async fn observers_and_witnesses() {
        let f = fixture();
        f.manager.new_shard(3, 1, StateMachineType::Test, Duration::ZERO).await.unwrap();
        f.manager.add_replica_observer(3, 2, "10.0.0.2:63001", Duration::ZERO).await.unwrap();
        f.manager.add_replica_witness(3, 3, "10.0.0.3:63001", Duration::ZERO).await.unwrap();

        let m = f.manager.get_shard_members(3, Duration::ZERO).await.unwrap();
        assert_eq!(m.replicas.len(), 1);
        assert!(m.observers.contains_key(&2));
        assert!(m.witnesses.contains_key(&3));
    }

    #[tokio::test]
    async fn joining_observer_waits_for_leader() {
        let f = fixture();
        f.manager.start_replica_observer(5, 4, StateMachineType::Test, false).await.unwrap();
        assert_eq!(f.manager.get_leader_id(5).unwrap(), (0, false));
        let state = f.store.get(5).await.unwrap();
        assert!(state.membership.observers.contains_key(&4));
    }

    #[tokio::test]
    async fn stop_restart_and_remove_data() {
        let f = fixture();
        f.manager.new_shard(1, 1, StateMachineType::Test, Duration::ZERO).await.unwrap();

        let result = f.manager.stop_replica(1, 1).await.unwrap();
        assert_eq!(result.code, ResultCode::Completed);
        assert_eq!(f.manager.get_leader_id(1).unwrap(), (0, false));

        f.manager.start_replica(1, 1, StateMachineType::Test, true).await.unwrap();
        assert_eq!(f.manager.get_leader_id(1).unwrap(), (1, true));

        // still a voter, so the data must stay
        f.manager.stop_replica(1, 1).await.unwrap();
        assert!(matches!(f.manager.remove_data(1, 1).await, Err(TessError::Rejected(_))));
        assert!(f.host.has_node_info(1, 1));

        f.manager.start_replica(1, 1, StateMachineType::Test, true).await.unwrap();
        f.manager.add_replica(1, 2, "10.0.0.2:63001", Duration::ZERO).await.unwrap();
        f.manager.remove_replica(1, 1, Duration::ZERO).await.unwrap();
        f.manager.stop_replica(1, 1).await.unwrap();
        f.manager.remove_data(1, 1).await.unwrap();
        assert!(!f.host.has_node_info(1, 1));
        assert!(matches!(f.store.get(1).await, Err(TessError::ShardNotFound(1))));
    }

    #[tokio::test]
    async fn restore_restarts_persisted_shards() {
        let f = fixture();
        f.manager.new_shard(1, 1, StateMachineType::Test, Duration::ZERO).await.unwrap();
        f.manager.new_shard(2, 1, StateMachineType::Kv, Duration::ZERO).await.unwrap();
        f.host.stop();

        let restarted = fixture_with(Arc::new(LocalHost::new("127.0.0.1:63001")), f.store.clone());
        assert_eq!(restarted.manager.restore().await.unwrap(), 2);
        assert_eq!(restarted.manager.get_leader_id(2).unwrap(), (1, true));
        // already running
        assert_eq!(restarted.manager.restore().await.unwrap(), 0);
    }
}
