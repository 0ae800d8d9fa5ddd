use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

pub mod command;
mod error;

pub use error::{DagError, TessError};

pub type ShardId = u64;
pub type ReplicaId = u64;
pub type ClientId = u64;
pub type AccountId = u64;

/// Series id carried by sessions that skip replay protection.
pub const NO_OP_SERIES_ID: u64 = 0;

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Opaque descriptor handed to callers for a sequencing session.
///
/// The all-zero value is the empty descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub shard_id: ShardId,
    pub client_id: ClientId,
    pub transaction_id: u64,
    pub responded_to: u64,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        *self == Transaction::default()
    }

    pub fn is_noop(&self) -> bool {
        self.transaction_id == NO_OP_SERIES_ID
    }
}

// ---------------------------------------------------------------------------
// Shards and membership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StateMachineType {
    #[default]
    Unspecified,
    Test,
    Kv,
}

impl FromStr for StateMachineType {
    type Err = TessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "test" => Ok(StateMachineType::Test),
            "kv" => Ok(StateMachineType::Kv),
            other => Err(TessError::UnsupportedStateMachine(other.to_string())),
        }
    }
}

/// Point-in-time membership of a shard.
///
/// `removed` is never pruned: a removed replica id can't rejoin the shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MembershipEntry {
    pub config_change_id: u64,
    pub replicas: BTreeMap<ReplicaId, String>,
    pub observers: BTreeMap<ReplicaId, String>,
    pub witnesses: BTreeMap<ReplicaId, String>,
    pub removed: BTreeSet<ReplicaId>,
}

impl MembershipEntry {
    pub fn contains(&self, replica_id: ReplicaId) -> bool {
        self.replicas.contains_key(&replica_id)
            || self.observers.contains_key(&replica_id)
            || self.witnesses.contains_key(&replica_id)
    }
}

/// Per-replica consensus settings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReplicaConfig {
    pub shard_id: ShardId,
    pub replica_id: ReplicaId,
    pub is_observer: bool,
    pub is_witness: bool,
    pub election_rtt: u64,
    pub heartbeat_rtt: u64,
    pub check_quorum: bool,
    pub snapshot_entries: u64,
    pub compaction_overhead: u64,
    pub ordered_config_change: bool,
}

impl ReplicaConfig {
    pub fn new(shard_id: ShardId, replica_id: ReplicaId) -> Self {
        ReplicaConfig {
            shard_id,
            replica_id,
            is_observer: false,
            is_witness: false,
            election_rtt: 100,
            heartbeat_rtt: 10,
            check_quorum: true,
            snapshot_entries: 1000,
            compaction_overhead: 500,
            ordered_config_change: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ResultCode {
    Completed,
    Timeout,
    Terminated,
    Rejected,
    Dropped,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OperationResult {
    pub shard_id: ShardId,
    pub replica_id: ReplicaId,
    pub code: ResultCode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotOption {
    pub compaction_overhead: u64,
    pub export_path: String,
    pub exported: bool,
    pub override_compaction_overhead: bool,
}

/// What the local host knows about one of its replicas.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub replica_id: ReplicaId,
    pub replicas: BTreeMap<ReplicaId, String>,
    pub config_change_index: u64,
    pub state_machine_type: StateMachineType,
    pub is_leader: bool,
    pub is_observer: bool,
    pub is_witness: bool,
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HostInfo {
    pub host_id: String,
    pub raft_address: String,
    pub shards: Vec<ShardInfo>,
}

/// Persisted record of a shard this host participates in.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ShardState {
    pub shard_id: ShardId,
    pub replica_id: ReplicaId,
    pub state_machine_type: StateMachineType,
    pub membership: MembershipEntry,
    pub last_updated_ns: i64,
}

// ---------------------------------------------------------------------------
// KV domain objects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: u64,
    pub mod_revision: u64,
    pub version: u64,
    pub lease: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccountDescriptor {
    pub account_id: AccountId,
    pub owner: String,
    pub created_ns: i64,
    pub last_updated_ns: i64,
    pub bucket_count: u64,
    pub buckets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BucketDescriptor {
    pub owner: String,
    pub size: u64,
    pub key_count: u64,
    pub created_ns: i64,
    pub last_updated_ns: i64,
}

// ---------------------------------------------------------------------------
// bincode helpers
// ---------------------------------------------------------------------------

pub fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, TessError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| TessError::Codec(e.to_string()))
}

pub fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, TessError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| TessError::Codec(e.to_string()))
}
