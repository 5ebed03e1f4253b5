//! Worker wiring: builds link and correction workers from configuration and
//! runs them as tokio tasks.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alignment::Aligner;
use crate::config::{ObjectStoreBackend, ObjectStoreConfig, TimesyncConfig};
use crate::jobs::{CorrectionJob, LinkJob};
use crate::objects::{FsObjectStore, HttpObjectStore, ObjectStore, ObjectStoreError};
use crate::queue::{BrokerClient, QueueError};
use crate::store::SessionStore;
use crate::types::{JobKind, SessionJobMessage};
use crate::worker::Worker;

/// Which stages this process consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Link,
    Correct,
    #[default]
    All,
}

impl Role {
    pub fn runs(&self, kind: JobKind) -> bool {
        matches!(
            (self, kind),
            (Role::All, _) | (Role::Link, JobKind::Link) | (Role::Correct, JobKind::Correction)
        )
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "link" => Ok(Role::Link),
            "correct" | "correction" => Ok(Role::Correct),
            "all" => Ok(Role::All),
            other => Err(format!("unknown role '{other}' (expected link|correct|all)")),
        }
    }
}

/// Build the configured object store backend.
pub fn object_store_from_config(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    Ok(match config.backend {
        ObjectStoreBackend::Http => Arc::new(HttpObjectStore::new(config)?),
        ObjectStoreBackend::Filesystem => Arc::new(FsObjectStore::new(config.root.clone())),
    })
}

/// Shared clients plus the configuration needed to build workers.
#[derive(Clone)]
pub struct Pipeline {
    config: TimesyncConfig,
    store: Arc<dyn SessionStore>,
    broker: Arc<BrokerClient>,
    objects: Arc<dyn ObjectStore>,
}

impl Pipeline {
    pub fn new(
        config: TimesyncConfig,
        store: Arc<dyn SessionStore>,
        broker: Arc<BrokerClient>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            objects,
        }
    }

    pub fn config(&self) -> &TimesyncConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    fn queue_for(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Link => &self.config.queue.link_queue,
            JobKind::Correction => &self.config.queue.correction_queue,
        }
    }

    /// Link worker; its commits publish correction jobs.
    pub fn link_worker(&self, index: usize) -> Worker {
        Worker::new(
            self.queue_for(JobKind::Link),
            self.broker.clone(),
            self.store.clone(),
            Arc::new(LinkJob::new(self.config.linking.clone())),
        )
        .with_name(format!("link-{index}"))
        .with_followup(self.queue_for(JobKind::Correction))
        .with_max_redeliveries(self.config.queue.max_redeliveries)
        .with_poll_interval(self.config.queue.poll_interval())
    }

    pub fn correction_worker(&self, index: usize) -> Worker {
        let job = CorrectionJob::new(
            self.objects.clone(),
            self.config.object_store.bucket.clone(),
            Aligner::new(self.config.correction.match_tolerance_us),
        );
        Worker::new(
            self.queue_for(JobKind::Correction),
            self.broker.clone(),
            self.store.clone(),
            Arc::new(job),
        )
        .with_name(format!("correct-{index}"))
        .with_max_redeliveries(self.config.queue.max_redeliveries)
        .with_poll_interval(self.config.queue.poll_interval())
    }

    /// Spawn `concurrency` workers per selected stage.
    pub fn spawn(&self, role: Role, concurrency: usize, cancel: &CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        let concurrency = concurrency.max(1);
        for index in 0..concurrency {
            if role.runs(JobKind::Link) {
                tasks.spawn(self.link_worker(index).run(cancel.clone()));
            }
            if role.runs(JobKind::Correction) {
                tasks.spawn(self.correction_worker(index).run(cancel.clone()));
            }
        }
        info!(
            role = ?role,
            concurrency,
            store = self.store.backend_name(),
            objects = self.objects.backend_name(),
            broker = self.broker.backend().backend_name(),
            "Workers spawned"
        );
        tasks
    }

    /// Publish a job for `session_id` onto the stage's queue.
    pub async fn enqueue(&self, kind: JobKind, session_id: &str) -> Result<i64, QueueError> {
        let message = SessionJobMessage::new(session_id);
        self.broker.publish(self.queue_for(kind), &message.encode()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_selection() {
        assert!(Role::All.runs(JobKind::Link));
        assert!(Role::All.runs(JobKind::Correction));
        assert!(Role::Link.runs(JobKind::Link));
        assert!(!Role::Link.runs(JobKind::Correction));
        assert_eq!("correct".parse::<Role>().unwrap(), Role::Correct);
        assert!("export".parse::<Role>().is_err());
    }

    #[test]
    fn test_filesystem_backend_from_config() {
        let config = ObjectStoreConfig {
            backend: ObjectStoreBackend::Filesystem,
            ..Default::default()
        };
        let store = object_store_from_config(&config).unwrap();
        assert_eq!(store.backend_name(), "Filesystem");
    }
}
