use crate::ShardId;

/// Structural errors raised while building or validating a workflow graph.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("vertex not found: {0}")]
    NoVertex(String),
    #[error("edge {from} -> {to} would create a cycle")]
    Cyclic { from: String, to: String },
    #[error("edge {from} -> {to} already exists")]
    DuplicateEdge { from: String, to: String },
    #[error("vertex {0} already exists")]
    DuplicateVertex(String),
    #[error("dag {0} has more than one start vertex")]
    MultipleStart(String),
    #[error("dag {0} is already validated and can't be modified")]
    Frozen(String),
    #[error("dag {0} has no vertices")]
    Empty(String),
    #[error("vertex {0} joins several inputs but has no aggregator")]
    MissingAggregator(String),
}

#[derive(thiserror::Error, Debug)]
pub enum TessError {
    #[error("invalid account id")]
    InvalidAccount,
    #[error("invalid owner")]
    InvalidOwner,
    #[error("invalid bucket name")]
    InvalidBucketName,
    #[error("invalid key")]
    InvalidKey,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("account not found")]
    AccountNotFound,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("key not found")]
    KeyNotFound,
    #[error("no keys in bucket")]
    NoKeys,
    #[error("shard {0} not found")]
    ShardNotFound(ShardId),
    #[error("transaction not found")]
    TransactionNotFound,

    #[error("operation timed out")]
    Timeout,
    #[error("shard {0} is not ready")]
    ShardNotReady(ShardId),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("shard {0} already has a local replica")]
    ShardAlreadyExists(ShardId),
    #[error("replica {replica_id} was removed from shard {shard_id}")]
    ReplicaRemoved { shard_id: ShardId, replica_id: u64 },
    #[error("no config change id")]
    NoConfigChangeId,
    #[error("unsupported state machine: {0}")]
    UnsupportedStateMachine(String),
    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("{0}")]
    Recoverable(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Dag(#[from] DagError),
    #[error("{0}")]
    Operation(String),
    #[error("flow not found: {0}")]
    FlowNotFound(String),
    #[error("queue error: {0}")]
    Queue(String),
}

impl TessError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TessError::AccountNotFound
                | TessError::BucketNotFound
                | TessError::KeyNotFound
                | TessError::NoKeys
                | TessError::ShardNotFound(_)
                | TessError::TransactionNotFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        assert!(TessError::KeyNotFound.is_not_found());
        assert!(TessError::ShardNotFound(3).is_not_found());
        assert!(!TessError::Timeout.is_not_found());
        assert!(!TessError::Recoverable("account exists".into()).is_not_found());
    }

    #[test]
    fn dag_errors_convert() {
        let err: TessError = DagError::MultipleStart("0".into()).into();
        assert_eq!(err.to_string(), "dag 0 has more than one start vertex");
    }
}
