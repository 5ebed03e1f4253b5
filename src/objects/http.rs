//! HTTP object store client (MinIO / S3-compatible gateway)

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{validate_key, ObjectStore, ObjectStoreError};
use crate::backoff::{Backoff, ConnectionState};
use crate::config::ObjectStoreConfig;

/// Long-lived HTTP client for `GET {endpoint}/{bucket}/{object_id}`.
///
/// Transport failures and 5xx/429 responses are retried with exponential
/// backoff up to `max_attempts`; the client reports `reconnecting` meanwhile.
pub struct HttpObjectStore {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    max_attempts: u32,
    backoff: Mutex<Backoff>,
    state: Mutex<ConnectionState>,
}

impl HttpObjectStore {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self, ObjectStoreError> {
        Self::with_backoff(config, Backoff::default())
    }

    pub fn with_backoff(config: &ObjectStoreConfig, backoff: Backoff) -> Result<Self, ObjectStoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            max_attempts: config.max_attempts.max(1),
            backoff: Mutex::new(backoff),
            state: Mutex::new(ConnectionState::Connected),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().map(|s| *s).unwrap_or(ConnectionState::Reconnecting)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                info!(endpoint = %self.endpoint, state = next.as_str(), "Object store state changed");
                *state = next;
            }
        }
    }

    fn next_delay(&self) -> Duration {
        self.backoff
            .lock()
            .map(|mut b| b.next_delay())
            .unwrap_or(Duration::from_secs(1))
    }

    fn reset_backoff(&self) {
        if let Ok(mut b) = self.backoff.lock() {
            b.reset();
        }
    }

    async fn fetch_once(&self, url: &str, bucket: &str, object_id: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let mut req = self.http.get(url);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let resp = req.send().await?;

        match resp.status() {
            status if status.is_success() => Ok(resp.bytes().await?.to_vec()),
            reqwest::StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                object_id: object_id.to_string(),
            }),
            status => Err(ObjectStoreError::Status(status)),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get_object(&self, bucket: &str, object_id: &str) -> Result<Vec<u8>, ObjectStoreError> {
        validate_key(bucket, object_id)?;
        let url = format!("{}/{}/{}", self.endpoint, bucket, object_id);

        let mut attempt = 1;
        loop {
            match self.fetch_once(&url, bucket, object_id).await {
                Ok(bytes) => {
                    self.reset_backoff();
                    self.set_state(ConnectionState::Connected);
                    debug!(object_id, bytes = bytes.len(), "Fetched object");
                    return Ok(bytes);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    self.set_state(ConnectionState::Reconnecting);
                    let delay = self.next_delay();
                    warn!(
                        object_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Object store request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if !e.is_transient() {
                        // The gateway answered; the link itself is fine.
                        self.reset_backoff();
                        self.set_state(ConnectionState::Connected);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "HTTP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let config = ObjectStoreConfig {
            // Port 9 (discard) on localhost: connection refused.
            endpoint: "http://127.0.0.1:9".to_string(),
            max_attempts: 2,
            timeout_secs: 2,
            ..Default::default()
        };
        let store = HttpObjectStore::with_backoff(
            &config,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
        )
        .unwrap();

        let err = store.get_object("raw-data", "obj-1").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_rejects_traversal_without_request() {
        let store = HttpObjectStore::new(&ObjectStoreConfig::default()).unwrap();
        let err = store.get_object("raw-data", "../secret").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::InvalidKey(_)));
    }
}
