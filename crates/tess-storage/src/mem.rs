use std::collections::BTreeMap;

use parking_lot::RwLock;

use tess_types::TessError;

use crate::keys::validate_bucket;
use crate::traits::{BatchOp, BucketDump, BucketStore};

type Buckets = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-memory `BucketStore`.
///
/// Intended for unit tests; not persisted across restarts.
#[derive(Default)]
pub struct MemBucketStore {
    inner: RwLock<Buckets>,
}

impl MemBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BucketStore for MemBucketStore {
    fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), TessError> {
        for op in &ops {
            op.validate()?;
        }
        let mut g = self.inner.write();
        for op in ops {
            match op {
                BatchOp::CreateBucket { bucket } => {
                    g.entry(bucket).or_default();
                }
                BatchOp::Put { bucket, key, value } => {
                    g.entry(bucket).or_default().insert(key, value);
                }
                BatchOp::Delete { bucket, key } => {
                    if let Some(b) = g.get_mut(&bucket) {
                        b.remove(&key);
                    }
                }
                BatchOp::DeleteBucket { bucket } => {
                    g.remove(&bucket);
                }
            }
        }
        Ok(())
    }

    fn bucket_exists(&self, bucket: &str) -> Result<bool, TessError> {
        validate_bucket(bucket)?;
        Ok(self.inner.read().contains_key(bucket))
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, TessError> {
        validate_bucket(bucket)?;
        Ok(self.inner.read().get(bucket).and_then(|b| b.get(key)).cloned())
    }

    fn get_all(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TessError> {
        validate_bucket(bucket)?;
        let g = self.inner.read();
        match g.get(bucket) {
            Some(b) if !b.is_empty() => {
                Ok(b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            _ => Err(TessError::NoKeys),
        }
    }

    fn export(&self) -> Result<BucketDump, TessError> {
        Ok(self
            .inner
            .read()
            .iter()
            .map(|(name, b)| {
                (name.clone(), b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            })
            .collect())
    }

    fn import(&self, dump: BucketDump) -> Result<(), TessError> {
        let mut fresh = Buckets::new();
        for (bucket, pairs) in dump {
            validate_bucket(&bucket)?;
            fresh.insert(bucket, pairs.into_iter().collect());
        }
        *self.inner.write() = fresh;
        Ok(())
    }
}
