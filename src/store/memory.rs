//! In-memory store for tests and dry runs
//!
//! Transactions are serialized: `begin` takes an owned lock on the tables and
//! works on a copy, which replaces the tables on commit. Not durable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{SessionStore, StoreError, StoreTx};
use crate::types::{ProcessingStatus, RawSensorObject, Session, SessionEvent};

/// Media tables that receive the session's experiment id during linking
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MediaKind {
    Image,
    AudioClip,
}

#[derive(Debug, Clone)]
struct MediaRow {
    session_id: String,
    experiment_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    sessions: BTreeMap<String, Session>,
    objects: BTreeMap<String, RawSensorObject>,
    links: BTreeSet<(String, String)>,
    events: BTreeMap<i64, SessionEvent>,
    media: BTreeMap<(MediaKind, String), MediaRow>,
}

impl Tables {
    fn set_status(&mut self, session_id: &str, link: bool, status: ProcessingStatus) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            if link {
                session.link_status = status;
            } else {
                session.event_correction_status = status;
            }
        }
    }
}

/// In-memory [`SessionStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a lost database: every call fails with a connection error
    /// until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    pub async fn insert_session(&self, session: Session) {
        self.tables
            .lock()
            .await
            .sessions
            .insert(session.session_id.clone(), session);
    }

    pub async fn insert_object(&self, object: RawSensorObject) {
        self.tables
            .lock()
            .await
            .objects
            .insert(object.object_id.clone(), object);
    }

    pub async fn insert_event(&self, event: SessionEvent) {
        self.tables.lock().await.events.insert(event.event_id, event);
    }

    pub async fn insert_link(&self, session_id: &str, object_id: &str) {
        self.tables
            .lock()
            .await
            .links
            .insert((session_id.to_string(), object_id.to_string()));
    }

    pub async fn insert_media(&self, kind: MediaKind, media_id: &str, session_id: &str) {
        self.tables.lock().await.media.insert(
            (kind, media_id.to_string()),
            MediaRow {
                session_id: session_id.to_string(),
                experiment_id: None,
            },
        );
    }

    pub async fn object(&self, object_id: &str) -> Option<RawSensorObject> {
        self.tables.lock().await.objects.get(object_id).cloned()
    }

    /// Object ids linked to the session, sorted.
    pub async fn links(&self, session_id: &str) -> Vec<String> {
        self.tables
            .lock()
            .await
            .links
            .iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Events of the session in onset order.
    pub async fn events(&self, session_id: &str) -> Vec<SessionEvent> {
        let tables = self.tables.lock().await;
        let mut events: Vec<SessionEvent> = tables
            .events
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        sort_events(&mut events);
        events
    }

    pub async fn media_experiment(&self, kind: MediaKind, media_id: &str) -> Option<String> {
        self.tables
            .lock()
            .await
            .media
            .get(&(kind, media_id.to_string()))
            .and_then(|m| m.experiment_id.clone())
    }
}

fn sort_events(events: &mut [SessionEvent]) {
    events.sort_by(|a, b| a.onset.total_cmp(&b.onset).then(a.event_id.cmp(&b.event_id)));
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        self.check_available()?;
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            unavailable: self.unavailable.clone(),
        }))
    }

    async fn mark_link_status(
        &self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.tables.lock().await.set_status(session_id, true, status);
        Ok(())
    }

    async fn mark_correction_status(
        &self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.tables.lock().await.set_status(session_id, false, status);
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.check_available()?;
        Ok(self.tables.lock().await.sessions.get(session_id).cloned())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    unavailable: Arc<AtomicBool>,
}

impl MemoryTx {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn session_for_update(&mut self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.check_available()?;
        Ok(self.working.sessions.get(session_id).cloned())
    }

    async fn set_link_status(
        &mut self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.working.set_status(session_id, true, status);
        Ok(())
    }

    async fn set_correction_status(
        &mut self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.working.set_status(session_id, false, status);
        Ok(())
    }

    async fn normalization_candidates(
        &mut self,
        user_id: &str,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    ) -> Result<Vec<RawSensorObject>, StoreError> {
        self.check_available()?;
        let mut candidates: Vec<RawSensorObject> = self
            .working
            .objects
            .values()
            .filter(|o| o.user_id == user_id)
            .filter(|o| o.start_time_device.is_some() && o.end_time_device.is_some())
            .filter(|o| match o.start_time {
                None => true,
                Some(t) => t < lower || t > upper,
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.start_time_device
                .cmp(&b.start_time_device)
                .then_with(|| a.object_id.cmp(&b.object_id))
        });
        Ok(candidates)
    }

    async fn update_object_times(
        &mut self,
        object_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(object) = self.working.objects.get_mut(object_id) {
            object.start_time = Some(start_time);
            object.end_time = Some(end_time);
        }
        Ok(())
    }

    async fn link_overlapping_objects(
        &mut self,
        session_id: &str,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let overlapping: Vec<String> = self
            .working
            .objects
            .values()
            .filter(|o| o.user_id == user_id && o.overlaps(start, end))
            .map(|o| o.object_id.clone())
            .collect();
        let mut inserted = 0;
        for object_id in overlapping {
            if self.working.links.insert((session_id.to_string(), object_id)) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn propagate_experiment_id(
        &mut self,
        session_id: &str,
        experiment_id: &str,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut updated = 0;
        for row in self.working.media.values_mut() {
            if row.session_id == session_id && row.experiment_id.is_none() {
                row.experiment_id = Some(experiment_id.to_string());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn session_events(&mut self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        self.check_available()?;
        let mut events: Vec<SessionEvent> = self
            .working
            .events
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        sort_events(&mut events);
        Ok(events)
    }

    async fn linked_objects(&mut self, session_id: &str) -> Result<Vec<RawSensorObject>, StoreError> {
        self.check_available()?;
        let mut objects: Vec<RawSensorObject> = self
            .working
            .links
            .iter()
            .filter(|(s, _)| s == session_id)
            .filter_map(|(_, o)| self.working.objects.get(o).cloned())
            .collect();
        // NULL start times sort last
        objects.sort_by(|a, b| {
            match (a.start_time, b.start_time) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then_with(|| a.object_id.cmp(&b.object_id))
        });
        Ok(objects)
    }

    async fn set_event_onset_corrected(
        &mut self,
        event_id: i64,
        onset_corrected_us: i64,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(event) = self.working.events.get_mut(&event_id) {
            event.onset_corrected_us = Some(onset_corrected_us);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.check_available()?;
        let MemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
