//! Link job: clock normalization and session/object linking
//!
//! 1. Lock the session row and validate its declared window.
//! 2. With a usable clock offset, recompute absolute bounds for every object
//!    of the user whose start time is missing or outside the window.
//! 3. Link every object of the user whose range intersects the session.
//! 4. Copy the session's experiment id onto its media rows.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{JobError, JobHandler, JobSummary};
use crate::clock::{device_base_us, normalize_object, Normalization, SessionWindow};
use crate::config::LinkingConfig;
use crate::store::StoreTx;
use crate::types::JobKind;

/// Counters reported by a link run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSummary {
    pub candidates: usize,
    pub normalized: usize,
    pub outside_window: usize,
    pub invalid: usize,
    /// Normalization skipped for lack of a clock offset
    pub normalization_skipped: bool,
    pub links_created: u64,
    pub media_updated: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LinkJob {
    config: LinkingConfig,
}

impl LinkJob {
    pub fn new(config: LinkingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl JobHandler for LinkJob {
    fn kind(&self) -> JobKind {
        JobKind::Link
    }

    async fn run(&self, tx: &mut dyn StoreTx, session_id: &str) -> Result<JobSummary, JobError> {
        let session = tx
            .session_for_update(session_id)
            .await?
            .ok_or_else(|| JobError::Business(format!("session {session_id} not found")))?;

        let (Some(start), Some(end)) = (session.start_time, session.end_time) else {
            return Err(JobError::Business(format!(
                "session {session_id} is missing start_time or end_time"
            )));
        };
        if end < start {
            return Err(JobError::Business(format!(
                "session {session_id} ends before it starts"
            )));
        }

        let window = SessionWindow::new(start, end)
            .with_tolerance_ms(self.config.tolerance_ms)
            .with_min_duration_ms(self.config.min_session_duration_ms);
        let mut summary = LinkSummary::default();

        match session.offset_ms() {
            Some(offset_ms) => {
                let base = device_base_us(start.timestamp_millis(), offset_ms);
                let candidates = tx
                    .normalization_candidates(&session.user_id, window.lower_bound(), window.upper_bound())
                    .await?;
                summary.candidates = candidates.len();
                debug!(session_id, candidates = candidates.len(), device_base = base, "Normalizing objects");

                for object in &candidates {
                    match normalize_object(object, &window, base) {
                        Normalization::Repaired { start_time, end_time } => {
                            tx.update_object_times(&object.object_id, start_time, end_time)
                                .await?;
                            summary.normalized += 1;
                        }
                        Normalization::OutsideWindow { start_delta_us } => {
                            // Recorded during another session of the same user.
                            debug!(object_id = %object.object_id, start_delta_us, "Object outside session window");
                            summary.outside_window += 1;
                        }
                        Normalization::InvalidDeviceTime => {
                            warn!(
                                object_id = %object.object_id,
                                start_time_device = ?object.start_time_device,
                                end_time_device = ?object.end_time_device,
                                "Device times outside 32-bit counter range, skipping"
                            );
                            summary.invalid += 1;
                        }
                        Normalization::InvertedRange { start_delta_us, end_delta_us } => {
                            warn!(
                                object_id = %object.object_id,
                                start_delta_us,
                                end_delta_us,
                                "Normalized end precedes start, skipping"
                            );
                            summary.invalid += 1;
                        }
                    }
                }
            }
            None => {
                warn!(session_id, "Session has no usable clock offset, skipping normalization");
                summary.normalization_skipped = true;
            }
        }

        summary.links_created = tx
            .link_overlapping_objects(session_id, &session.user_id, start, end)
            .await?;

        if let Some(experiment_id) = session.experiment_id.as_deref() {
            summary.media_updated = tx.propagate_experiment_id(session_id, experiment_id).await?;
        }

        info!(
            session_id,
            candidates = summary.candidates,
            normalized = summary.normalized,
            outside_window = summary.outside_window,
            invalid = summary.invalid,
            links_created = summary.links_created,
            media_updated = summary.media_updated,
            "Link job finished"
        );
        Ok(JobSummary::Link(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, MediaKind, SessionStore};
    use crate::types::{ClockOffsetInfo, ProcessingStatus, RawSensorObject, Session};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    /// µs value is a multiple of 2^32, so offset 0 puts the device base at 0.
    const ALIGNED_START_MS: i64 = (1 << 29) * 3200;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ALIGNED_START_MS).unwrap()
    }

    fn session(offset: Option<f64>) -> Session {
        Session {
            session_id: "s1".into(),
            user_id: "u1".into(),
            experiment_id: Some("exp-1".into()),
            start_time: Some(t0()),
            end_time: Some(t0() + Duration::seconds(60)),
            clock_offset_info: offset.map(|o| ClockOffsetInfo {
                offset_ms_avg: o,
                rtt_ms_avg: Some(12.0),
            }),
            link_status: ProcessingStatus::Pending,
            event_correction_status: ProcessingStatus::Pending,
        }
    }

    fn device_object(id: &str, user: &str, start_dev: i64, end_dev: i64) -> RawSensorObject {
        RawSensorObject {
            object_id: id.into(),
            user_id: user.into(),
            session_id: None,
            device_id: "dev".into(),
            sampling_rate: 256.0,
            start_time_device: Some(start_dev),
            end_time_device: Some(end_dev),
            start_time: None,
            end_time: None,
        }
    }

    async fn run(store: &InMemoryStore) -> Result<LinkSummary, JobError> {
        let mut tx = store.begin().await.unwrap();
        let result = LinkJob::default().run(tx.as_mut(), "s1").await;
        tx.commit().await.unwrap();
        match result? {
            JobSummary::Link(s) => Ok(s),
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_normalizes_and_links() {
        let store = InMemoryStore::new();
        store.insert_session(session(Some(0.0))).await;
        store.insert_object(device_object("o1", "u1", 0, 1_000_000)).await;
        // 5 minutes in: outside the 60 s + 10 s window
        store.insert_object(device_object("o2", "u1", 300_000_000, 301_000_000)).await;
        // other user
        store.insert_object(device_object("o3", "u2", 0, 1_000_000)).await;

        let summary = run(&store).await.unwrap();
        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.normalized, 1);
        assert_eq!(summary.outside_window, 1);
        assert_eq!(summary.links_created, 1);

        let o1 = store.object("o1").await.unwrap();
        assert_eq!(o1.start_time, Some(t0()));
        assert_eq!(o1.end_time, Some(t0() + Duration::seconds(1)));
        assert_eq!(store.links("s1").await, vec!["o1".to_string()]);
        assert!(store.object("o2").await.unwrap().start_time.is_none());
    }

    #[tokio::test]
    async fn test_link_completeness_over_known_ranges() {
        let store = InMemoryStore::new();
        store.insert_session(session(Some(0.0))).await;
        let mut inside = device_object("in", "u1", 0, 0);
        inside.start_time_device = None;
        inside.start_time = Some(t0() + Duration::seconds(59));
        inside.end_time = Some(t0() + Duration::seconds(70));
        let mut touching = inside.clone();
        touching.object_id = "edge".into();
        touching.start_time = Some(t0() - Duration::seconds(5));
        touching.end_time = Some(t0());
        let mut before = inside.clone();
        before.object_id = "before".into();
        before.start_time = Some(t0() - Duration::seconds(5));
        before.end_time = Some(t0() - Duration::milliseconds(1));
        for o in [inside, touching, before] {
            store.insert_object(o).await;
        }

        let summary = run(&store).await.unwrap();
        assert_eq!(summary.links_created, 2);
        assert_eq!(store.links("s1").await, vec!["edge".to_string(), "in".to_string()]);

        // Re-running creates nothing new.
        let again = run(&store).await.unwrap();
        assert_eq!(again.links_created, 0);
    }

    #[tokio::test]
    async fn test_missing_offset_still_links() {
        let store = InMemoryStore::new();
        store.insert_session(session(None)).await;
        store.insert_object(device_object("o1", "u1", 0, 1_000_000)).await;

        let summary = run(&store).await.unwrap();
        assert!(summary.normalization_skipped);
        assert_eq!(summary.normalized, 0);
        assert_eq!(summary.links_created, 0);
    }

    #[tokio::test]
    async fn test_business_errors() {
        let store = InMemoryStore::new();
        assert!(matches!(run(&store).await, Err(JobError::Business(_))));

        let mut s = session(Some(0.0));
        s.end_time = None;
        store.insert_session(s).await;
        assert!(matches!(run(&store).await, Err(JobError::Business(_))));
    }

    #[tokio::test]
    async fn test_propagates_experiment_to_media() {
        let store = InMemoryStore::new();
        store.insert_session(session(Some(0.0))).await;
        store.insert_media(MediaKind::Image, "img-1", "s1").await;
        store.insert_media(MediaKind::AudioClip, "clip-1", "s1").await;
        store.insert_media(MediaKind::Image, "img-2", "other").await;

        let summary = run(&store).await.unwrap();
        assert_eq!(summary.media_updated, 2);
        assert_eq!(
            store.media_experiment(MediaKind::Image, "img-1").await.as_deref(),
            Some("exp-1")
        );
        assert_eq!(store.media_experiment(MediaKind::Image, "img-2").await, None);
    }
}
