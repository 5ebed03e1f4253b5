//! Object store access for compressed raw payloads
//!
//! Read-only: the correction job fetches `(bucket, object_id)` and
//! decompresses the zstd blob before handing it to the trigger extractor.
//!
//! Backends:
//! - [`HttpObjectStore`]: S3-compatible gateway over plain HTTP GET
//! - [`FsObjectStore`]: `{root}/{bucket}/{object_id}` on local disk
//! - [`MemoryObjectStore`]: in-process map for tests

mod fs;
mod http;
mod memory;

pub use fs::FsObjectStore;
pub use http::HttpObjectStore;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;

/// Object store errors
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object {bucket}/{object_id} not found")]
    NotFound { bucket: String, object_id: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("object store returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

impl ObjectStoreError {
    /// True for transport-level failures that should requeue the job.
    pub fn is_transient(&self) -> bool {
        match self {
            ObjectStoreError::Http(_) | ObjectStoreError::Unavailable(_) => true,
            ObjectStoreError::Status(status) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            ObjectStoreError::Io(e) => e.kind() != std::io::ErrorKind::NotFound,
            ObjectStoreError::NotFound { .. }
            | ObjectStoreError::InvalidKey(_)
            | ObjectStoreError::Decompress(_) => false,
        }
    }
}

/// Read-only object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the raw (still compressed) bytes of an object.
    async fn get_object(&self, bucket: &str, object_id: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Decompress a zstd payload blob.
pub fn decompress_payload(compressed: &[u8]) -> Result<Vec<u8>, ObjectStoreError> {
    zstd::decode_all(compressed).map_err(|e| ObjectStoreError::Decompress(e.to_string()))
}

/// Compress a payload the way the collector stores it.
pub fn compress_payload(raw: &[u8]) -> Result<Vec<u8>, ObjectStoreError> {
    Ok(zstd::encode_all(raw, 3)?)
}

/// Reject keys that could escape the bucket when mapped onto a path.
fn validate_key(bucket: &str, object_id: &str) -> Result<(), ObjectStoreError> {
    for part in [bucket, object_id] {
        if part.is_empty()
            || part.starts_with('/')
            || part.contains('\\')
            || part.split('/').any(|seg| seg == ".." || seg == ".")
        {
            return Err(ObjectStoreError::InvalidKey(format!("{bucket}/{object_id}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompress_round_trip() {
        let raw = vec![4u8, 1, 0, 0, 1, 2, 3];
        let compressed = compress_payload(&raw).unwrap();
        assert_eq!(decompress_payload(&compressed).unwrap(), raw);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let err = decompress_payload(b"definitely not zstd").unwrap_err();
        assert!(matches!(err, ObjectStoreError::Decompress(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("raw-data", "user/obj-1").is_ok());
        assert!(validate_key("raw-data", "../etc/passwd").is_err());
        assert!(validate_key("raw-data", "/abs").is_err());
        assert!(validate_key("", "obj").is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ObjectStoreError::Status(reqwest::StatusCode::BAD_GATEWAY).is_transient());
        assert!(ObjectStoreError::Status(reqwest::StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!ObjectStoreError::Status(reqwest::StatusCode::FORBIDDEN).is_transient());
        let missing = ObjectStoreError::NotFound {
            bucket: "b".into(),
            object_id: "o".into(),
        };
        assert!(!missing.is_transient());
    }
}
