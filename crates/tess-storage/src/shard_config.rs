use std::sync::Arc;

use tess_types::{decode, encode, ShardId, ShardState, TessError};

use crate::traits::BucketStore;

const SHARD_CONFIG_BUCKET: &str = "shard-config";

fn shard_key(shard_id: ShardId) -> [u8; 8] {
    shard_id.to_le_bytes()
}

/// Durable record of the shards this host participates in.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct ShardConfigStore {
    store: Arc<dyn BucketStore>,
}

impl ShardConfigStore {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        ShardConfigStore { store }
    }

    pub async fn get(&self, shard_id: ShardId) -> Result<ShardState, TessError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<ShardState, TessError> {
            match store.get(SHARD_CONFIG_BUCKET, &shard_key(shard_id))? {
                Some(b) => decode::<ShardState>(&b),
                None => Err(TessError::ShardNotFound(shard_id)),
            }
        })
        .await
        .map_err(|e| TessError::Storage(e.to_string()))?
    }

    pub async fn put(&self, state: ShardState) -> Result<(), TessError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TessError> {
            store.put(SHARD_CONFIG_BUCKET, &shard_key(state.shard_id), &encode(&state)?)
        })
        .await
        .map_err(|e| TessError::Storage(e.to_string()))?
    }

    pub async fn delete(&self, shard_id: ShardId) -> Result<(), TessError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.delete(SHARD_CONFIG_BUCKET, &shard_key(shard_id)))
            .await
            .map_err(|e| TessError::Storage(e.to_string()))?
    }

    pub async fn list(&self) -> Result<Vec<ShardState>, TessError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ShardState>, TessError> {
            match store.get_all(SHARD_CONFIG_BUCKET) {
                Ok(pairs) => pairs.iter().map(|(_, v)| decode::<ShardState>(v)).collect(),
                Err(TessError::NoKeys) => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| TessError::Storage(e.to_string()))?
    }
}
