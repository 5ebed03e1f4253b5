use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use super::{compress_payload, ObjectStore, ObjectStoreError};

/// In-memory object store for tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
    denied: RwLock<HashSet<(String, String)>>,
    unavailable: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes as-is.
    pub fn put(&self, bucket: &str, object_id: &str, bytes: Vec<u8>) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert((bucket.to_string(), object_id.to_string()), bytes);
        }
    }

    /// Compress and store a decoded payload.
    pub fn put_payload(&self, bucket: &str, object_id: &str, raw: &[u8]) -> Result<(), ObjectStoreError> {
        self.put(bucket, object_id, compress_payload(raw)?);
        Ok(())
    }

    /// Answer fetches of this object with `403 Forbidden`.
    pub fn deny(&self, bucket: &str, object_id: &str) {
        if let Ok(mut denied) = self.denied.write() {
            denied.insert((bucket.to_string(), object_id.to_string()));
        }
    }

    /// Make every fetch fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object(&self, bucket: &str, object_id: &str) -> Result<Vec<u8>, ObjectStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Unavailable("memory object store marked unavailable".into()));
        }
        let key = (bucket.to_string(), object_id.to_string());
        let denied = self
            .denied
            .read()
            .map_err(|e| ObjectStoreError::Unavailable(e.to_string()))?;
        if denied.contains(&key) {
            return Err(ObjectStoreError::Status(reqwest::StatusCode::FORBIDDEN));
        }
        let objects = self
            .objects
            .read()
            .map_err(|e| ObjectStoreError::Unavailable(e.to_string()))?;
        objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                object_id: object_id.to_string(),
            })
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}
