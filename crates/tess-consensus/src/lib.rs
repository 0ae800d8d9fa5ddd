use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use tess_storage::StateMachine;
use tess_types::{
    ClientId, HostInfo, MembershipEntry, ReplicaConfig, ReplicaId, ShardId, SnapshotOption,
    StateMachineType, TessError, Transaction, NO_OP_SERIES_ID,
};

mod local;

pub use local::LocalHost;

/// Builds the state machine for one replica when it starts.
pub type StateMachineFactory =
    Arc<dyn Fn(ShardId, ReplicaId) -> Result<Box<dyn StateMachine>, TessError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Client sequencing state for one shard.
///
/// A session with `series_id == NO_OP_SERIES_ID` skips replay protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub shard_id: ShardId,
    pub client_id: ClientId,
    pub series_id: u64,
    pub responded_to: u64,
}

impl Session {
    pub fn noop(shard_id: ShardId, client_id: ClientId) -> Self {
        Session { shard_id, client_id, series_id: NO_OP_SERIES_ID, responded_to: 0 }
    }

    pub fn is_noop(&self) -> bool {
        self.series_id == NO_OP_SERIES_ID
    }

    /// Marks the in-flight proposal as answered so the next one is treated
    /// as new rather than a retry. No-op sessions are left untouched.
    pub fn proposal_completed(&mut self) {
        if self.is_noop() {
            return;
        }
        self.responded_to = self.series_id;
        self.series_id += 1;
    }

    pub fn descriptor(&self) -> Transaction {
        Transaction {
            shard_id: self.shard_id,
            client_id: self.client_id,
            transaction_id: self.series_id,
            responded_to: self.responded_to,
        }
    }
}

// ---------------------------------------------------------------------------
// Membership events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    ReplicaStarted { shard_id: ShardId, replica_id: ReplicaId },
    ReplicaStopped { shard_id: ShardId, replica_id: ReplicaId },
    ReplicaDataRemoved { shard_id: ShardId, replica_id: ReplicaId },
    MembershipChanged { shard_id: ShardId, replica_id: ReplicaId },
    LeaderUpdated { shard_id: ShardId, replica_id: ReplicaId, leader_id: ReplicaId },
}

impl MembershipEvent {
    pub fn shard_id(&self) -> ShardId {
        match self {
            MembershipEvent::ReplicaStarted { shard_id, .. }
            | MembershipEvent::ReplicaStopped { shard_id, .. }
            | MembershipEvent::ReplicaDataRemoved { shard_id, .. }
            | MembershipEvent::MembershipChanged { shard_id, .. }
            | MembershipEvent::LeaderUpdated { shard_id, .. } => *shard_id,
        }
    }
}

// ---------------------------------------------------------------------------
// ConsensusHost trait
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75).
// The explicit `+ Send` bound on each future lets generic managers `.await`
// across thread boundaries.
// ---------------------------------------------------------------------------

/// Process-wide entry point into every shard replica hosted locally.
///
/// Safe for concurrent use by any number of managers. Every `sync_*` call is
/// bounded by its `timeout` and fails with `TessError::Timeout` on expiry;
/// nothing is retried.
pub trait ConsensusHost: Send + Sync + 'static {
    fn id(&self) -> String;

    fn raft_address(&self) -> String;

    fn sync_propose(
        &self,
        session: &Session,
        cmd: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, TessError>> + Send;

    /// Linearizable read against the shard's state machine.
    fn sync_read(
        &self,
        shard_id: ShardId,
        query: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, TessError>> + Send;

    fn sync_get_session(
        &self,
        shard_id: ShardId,
        timeout: Duration,
    ) -> impl Future<Output = Result<Session, TessError>> + Send;

    /// Never touches the network.
    fn get_noop_session(&self, shard_id: ShardId) -> Session;

    fn sync_close_session(
        &self,
        session: &Session,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    fn sync_request_add_node(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        address: String,
        config_change_id: u64,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    fn sync_request_add_observer(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        address: String,
        config_change_id: u64,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    fn sync_request_add_witness(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        address: String,
        config_change_id: u64,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    fn sync_request_delete_node(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        config_change_id: u64,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    fn sync_get_cluster_membership(
        &self,
        shard_id: ShardId,
        timeout: Duration,
    ) -> impl Future<Output = Result<MembershipEntry, TessError>> + Send;

    /// `(leader, available)`; `available == false` means no leader is known.
    fn get_leader_id(&self, shard_id: ShardId) -> Result<(ReplicaId, bool), TessError>;

    /// `join == true` joins an existing shard and requires empty `members`;
    /// `join == false` either bootstraps with `members` or, with no members,
    /// restarts a replica from its retained state.
    fn start_replica(
        &self,
        members: BTreeMap<ReplicaId, String>,
        join: bool,
        sm_type: StateMachineType,
        factory: StateMachineFactory,
        config: ReplicaConfig,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    fn stop_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    /// Purges a stopped replica's retained state.
    fn remove_data(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    fn request_compaction(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    /// Returns the log index captured by the snapshot.
    fn sync_request_snapshot(
        &self,
        shard_id: ShardId,
        option: SnapshotOption,
        timeout: Duration,
    ) -> impl Future<Output = Result<u64, TessError>> + Send;

    fn host_info(&self) -> HostInfo;

    fn has_node_info(&self, shard_id: ShardId, replica_id: ReplicaId) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;

    fn stop(&self);
}
