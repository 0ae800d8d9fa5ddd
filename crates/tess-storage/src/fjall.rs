use std::path::Path;
use std::sync::Arc;

use tess_types::TessError;

use crate::keys::{bucket_key, bucket_prefix, user_key, validate_bucket};
use crate::traits::{BatchOp, BucketDump, BucketStore};

fn fjall_err(e: fjall::Error) -> TessError {
    TessError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallBucketStore
// ---------------------------------------------------------------------------

/// `BucketStore` backed by a fjall database.
///
/// Both keyspaces live in one `Database` so write batches spanning bucket
/// markers and data are atomic.
pub struct FjallBucketStore {
    pub db: fjall::Database,
    /// Bucket markers: `bucket_utf8` → b""
    pub buckets: fjall::Keyspace,
    /// Bucket contents: `bucket_utf8 ++ \x00 ++ key` → value
    pub data: fjall::Keyspace,
}

impl FjallBucketStore {
    /// Open (or create) a store at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, TessError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let buckets =
            db.keyspace("buckets", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let data = db.keyspace("data", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallBucketStore { db, buckets, data }))
    }

    fn bucket_keys(&self, bucket: &str) -> Result<Vec<Vec<u8>>, TessError> {
        self.data
            .prefix(bucket_prefix(bucket))
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }

    fn bucket_names(&self) -> Result<Vec<String>, TessError> {
        self.buckets
            .prefix(b"")
            .map(|g| {
                let (k, _) = g.into_inner().map_err(fjall_err)?;
                String::from_utf8(k.to_vec()).map_err(|e| TessError::Storage(e.to_string()))
            })
            .collect()
    }
}

impl BucketStore for FjallBucketStore {
    fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), TessError> {
        for op in &ops {
            op.validate()?;
        }
        let mut batch = self.db.batch();
        for op in ops {
            match op {
                BatchOp::CreateBucket { bucket } => {
                    batch.insert(&self.buckets, bucket.as_bytes(), b"");
                }
                BatchOp::Put { bucket, key, value } => {
                    batch.insert(&self.buckets, bucket.as_bytes(), b"");
                    batch.insert(&self.data, bucket_key(&bucket, &key), value);
                }
                BatchOp::Delete { bucket, key } => {
                    batch.remove(&self.data, bucket_key(&bucket, &key));
                }
                BatchOp::DeleteBucket { bucket } => {
                    for k in self.bucket_keys(&bucket)? {
                        batch.remove(&self.data, k);
                    }
                    batch.remove(&self.buckets, bucket.as_bytes());
                }
            }
        }
        batch.commit().map_err(fjall_err)
    }

    fn bucket_exists(&self, bucket: &str) -> Result<bool, TessError> {
        validate_bucket(bucket)?;
        Ok(self.buckets.get(bucket.as_bytes()).map_err(fjall_err)?.is_some())
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, TessError> {
        validate_bucket(bucket)?;
        Ok(self.data.get(bucket_key(bucket, key)).map_err(fjall_err)?.map(|v| v.to_vec()))
    }

    fn get_all(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TessError> {
        validate_bucket(bucket)?;
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .prefix(bucket_prefix(bucket))
            .map(|g| {
                g.into_inner()
                    .map(|(k, v)| (user_key(bucket, &k).to_vec(), v.to_vec()))
                    .map_err(fjall_err)
            })
            .collect::<Result<_, _>>()?;
        if pairs.is_empty() {
            return Err(TessError::NoKeys);
        }
        Ok(pairs)
    }

    fn export(&self) -> Result<BucketDump, TessError> {
        let mut dump = Vec::new();
        for bucket in self.bucket_names()? {
            let pairs = match self.get_all(&bucket) {
                Ok(pairs) => pairs,
                Err(TessError::NoKeys) => Vec::new(),
                Err(e) => return Err(e),
            };
            dump.push((bucket, pairs));
        }
        Ok(dump)
    }

    fn import(&self, dump: BucketDump) -> Result<(), TessError> {
        let mut batch = self.db.batch();
        for bucket in self.bucket_names()? {
            for k in self.bucket_keys(&bucket)? {
                batch.remove(&self.data, k);
            }
            batch.remove(&self.buckets, bucket.as_bytes());
        }
        batch.commit().map_err(fjall_err)?;

        let mut batch = self.db.batch();
        for (bucket, pairs) in dump {
            validate_bucket(&bucket)?;
            batch.insert(&self.buckets, bucket.as_bytes(), b"");
            for (k, v) in pairs {
                batch.insert(&self.data, bucket_key(&bucket, &k), v);
            }
        }
        batch.commit().map_err(fjall_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_creates_bucket_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallBucketStore::open(dir.path()).unwrap();

        assert!(!store.bucket_exists("jobs").unwrap());
        store.put("jobs", b"a", b"1").unwrap();
        assert!(store.bucket_exists("jobs").unwrap());
        assert_eq!(store.get("jobs", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("missing", b"a").unwrap(), None);
    }

    #[test]
    fn get_all_and_delete_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallBucketStore::open(dir.path()).unwrap();

        store.put("jobs", b"b", b"2").unwrap();
        store.put("jobs", b"a", b"1").unwrap();
        store.put("jobsx", b"c", b"3").unwrap();

        let all = store.get_all("jobs").unwrap();
        assert_eq!(all, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);

        store.delete_bucket("jobs").unwrap();
        assert!(!store.bucket_exists("jobs").unwrap());
        assert!(matches!(store.get_all("jobs"), Err(TessError::NoKeys)));
        assert_eq!(store.get("jobsx", b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn rejects_empty_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallBucketStore::open(dir.path()).unwrap();
        assert!(matches!(store.put("jobs", b"", b"1"), Err(TessError::InvalidArgument(_))));
        assert!(matches!(store.put("", b"k", b"1"), Err(TessError::InvalidArgument(_))));
    }

    #[test]
    fn batch_is_atomic_on_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallBucketStore::open(dir.path()).unwrap();
        let res = store.apply_batch(vec![
            BatchOp::put("jobs", b"a", b"1".to_vec()),
            BatchOp::put("jobs", b"", b"2".to_vec()),
        ]);
        assert!(res.is_err());
        assert!(!store.bucket_exists("jobs").unwrap());
    }

    #[test]
    fn export_import_replaces_contents() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = FjallBucketStore::open(src_dir.path()).unwrap();
        src.put("a", b"k1", b"v1").unwrap();
        src.create_bucket("empty").unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dst = FjallBucketStore::open(dst_dir.path()).unwrap();
        dst.put("stale", b"x", b"y").unwrap();

        dst.import(src.export().unwrap()).unwrap();
        assert!(!dst.bucket_exists("stale").unwrap());
        assert!(dst.bucket_exists("empty").unwrap());
        assert_eq!(dst.get("a", b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FjallBucketStore::open(dir.path()).unwrap();
            store.put("jobs", b"a", b"1").unwrap();
        }
        let store = FjallBucketStore::open(dir.path()).unwrap();
        assert_eq!(store.get("jobs", b"a").unwrap(), Some(b"1".to_vec()));
    }
}
