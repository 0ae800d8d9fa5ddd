use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tess_storage::BucketStore;
use tess_types::TessError;

/// Bucket holding request state, flow definitions and worker records.
pub const WORKFLOW_STATE_BUCKET: &str = "workflow-state";

/// JSON documents keyed by string, persisted in a `BucketStore`.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn BucketStore>,
}

impl StateStore {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        StateStore { store }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TessError> {
        let store = self.store.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.get(WORKFLOW_STATE_BUCKET, key.as_bytes()))
            .await
            .map_err(|e| TessError::Storage(e.to_string()))?
    }

    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), TessError> {
        let store = self.store.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.put(WORKFLOW_STATE_BUCKET, key.as_bytes(), &value))
            .await
            .map_err(|e| TessError::Storage(e.to_string()))?
    }

    pub async fn delete(&self, key: &str) -> Result<(), TessError> {
        let store = self.store.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.delete(WORKFLOW_STATE_BUCKET, key.as_bytes()))
            .await
            .map_err(|e| TessError::Storage(e.to_string()))?
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, TessError> {
        match self.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| TessError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), TessError> {
        let bytes = serde_json::to_vec(value).map_err(|e| TessError::Codec(e.to_string()))?;
        self.put(key, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tess_storage::mem::MemBucketStore;

    #[tokio::test]
    async fn json_documents() {
        let state = StateStore::new(Arc::new(MemBucketStore::new()));
        assert_eq!(state.get_json::<BTreeMap<String, u32>>("doc").await.unwrap(), None);

        let doc = BTreeMap::from([("a".to_string(), 1u32)]);
        state.put_json("doc", &doc).await.unwrap();
        assert_eq!(state.get_json("doc").await.unwrap(), Some(doc));

        state.delete("doc").await.unwrap();
        state.delete("doc").await.unwrap();
        assert_eq!(state.get("doc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_document_is_a_codec_error() {
        let state = StateStore::new(Arc::new(MemBucketStore::new()));
        state.put("doc", b"{not json".to_vec()).await.unwrap();
        assert!(matches!(state.get_json::<Vec<u8>>("doc").await, Err(TessError::Codec(_))));
    }
}
