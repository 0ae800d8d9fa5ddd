use tess_types::TessError;

use crate::keys::{validate_bucket, validate_key};

/// One mutation inside an atomic `BucketStore::apply_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    CreateBucket { bucket: String },
    Put { bucket: String, key: Vec<u8>, value: Vec<u8> },
    Delete { bucket: String, key: Vec<u8> },
    /// Removes the bucket and all of its keys.
    DeleteBucket { bucket: String },
}

impl BatchOp {
    pub fn put(bucket: &str, key: &[u8], value: Vec<u8>) -> Self {
        BatchOp::Put { bucket: bucket.to_string(), key: key.to_vec(), value }
    }

    pub fn delete(bucket: &str, key: &[u8]) -> Self {
        BatchOp::Delete { bucket: bucket.to_string(), key: key.to_vec() }
    }

    pub(crate) fn validate(&self) -> Result<(), TessError> {
        match self {
            BatchOp::CreateBucket { bucket } | BatchOp::DeleteBucket { bucket } => {
                validate_bucket(bucket)
            }
            BatchOp::Put { bucket, key, .. } | BatchOp::Delete { bucket, key } => {
                validate_bucket(bucket)?;
                validate_key(key)
            }
        }
    }
}

/// Every bucket with its key/value pairs, in key order.
pub type BucketDump = Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)>;

/// Single-node, bucket-scoped byte store.
///
/// Synchronous and object-safe: callers on the async side wrap calls in
/// `tokio::task::spawn_blocking`. Buckets are created lazily on first write;
/// reads and deletes against a missing bucket are not errors.
pub trait BucketStore: Send + Sync + 'static {
    /// Apply all ops atomically.
    fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), TessError>;

    fn bucket_exists(&self, bucket: &str) -> Result<bool, TessError>;

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, TessError>;

    /// All pairs of `bucket` in key order. `NoKeys` when there are none.
    fn get_all(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TessError>;

    fn export(&self) -> Result<BucketDump, TessError>;

    /// Replace the entire contents of the store with `dump`.
    fn import(&self, dump: BucketDump) -> Result<(), TessError>;

    fn create_bucket(&self, bucket: &str) -> Result<(), TessError> {
        self.apply_batch(vec![BatchOp::CreateBucket { bucket: bucket.to_string() }])
    }

    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), TessError> {
        self.apply_batch(vec![BatchOp::put(bucket, key, value.to_vec())])
    }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<(), TessError> {
        self.apply_batch(vec![BatchOp::delete(bucket, key)])
    }

    fn delete_bucket(&self, bucket: &str) -> Result<(), TessError> {
        self.apply_batch(vec![BatchOp::DeleteBucket { bucket: bucket.to_string() }])
    }
}

/// Replicated state machine driven by a consensus group.
///
/// `update` receives committed entries in log order. Application-level
/// failures belong in the returned bytes; `Err` is reserved for faults that
/// make the entry impossible to apply at all.
pub trait StateMachine: Send + 'static {
    fn update(&mut self, index: u64, cmd: &[u8]) -> Result<Vec<u8>, TessError>;

    fn lookup(&self, query: &[u8]) -> Result<Vec<u8>, TessError>;

    /// Index of the last applied entry, 0 for a fresh state machine.
    fn last_applied(&self) -> Result<u64, TessError>;

    fn save_snapshot(&self) -> Result<Vec<u8>, TessError>;

    fn recover_from_snapshot(&mut self, snapshot: &[u8]) -> Result<(), TessError>;

    fn close(&mut self) -> Result<(), TessError> {
        Ok(())
    }
}
