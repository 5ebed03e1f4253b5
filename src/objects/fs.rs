use async_trait::async_trait;
use std::path::PathBuf;

use super::{validate_key, ObjectStore, ObjectStoreError};

/// Objects stored as files under `{root}/{bucket}/{object_id}`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, bucket: &str, object_id: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_key(bucket, object_id)?;
        Ok(self.root.join(bucket).join(object_id))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get_object(&self, bucket: &str, object_id: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for(bucket, object_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                object_id: object_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "Filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let path = store.path_for("raw-data", "obj-1").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"blob").unwrap();

        assert_eq!(store.get_object("raw-data", "obj-1").await.unwrap(), b"blob");
        assert!(matches!(
            store.get_object("raw-data", "obj-2").await,
            Err(ObjectStoreError::NotFound { .. })
        ));
    }
}
