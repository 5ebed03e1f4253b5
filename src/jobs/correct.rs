//! Correction job: rewrite event onsets to observed trigger times
//!
//! Downloads every payload linked to the session, extracts the global trigger
//! list and aligns the session's events to it. Sessions with no events, no
//! linked objects or no triggers complete without writing anything.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{JobError, JobHandler, JobSummary};
use crate::alignment::{expected_onset_us, Aligner};
use crate::objects::{decompress_payload, ObjectStore, ObjectStoreError};
use crate::payload::{extract_triggers, PayloadChunk};
use crate::store::StoreTx;
use crate::types::{JobKind, RawSensorObject};

/// Counters reported by a correction run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrectionSummary {
    pub events: usize,
    pub objects: usize,
    pub objects_skipped: usize,
    pub payloads_skipped: usize,
    pub triggers: usize,
    pub events_updated: usize,
    pub matched: usize,
    pub fallbacks: usize,
    pub bumped: usize,
    pub far_matches: usize,
}

pub struct CorrectionJob {
    objects: Arc<dyn ObjectStore>,
    bucket: String,
    aligner: Aligner,
}

impl CorrectionJob {
    pub fn new(objects: Arc<dyn ObjectStore>, bucket: impl Into<String>, aligner: Aligner) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
            aligner,
        }
    }

    /// Fetch and decompress one linked object.
    ///
    /// `Ok(None)` means the object is unusable and is skipped; `Err` aborts
    /// the job for a retry.
    async fn load_payload(&self, object: &RawSensorObject) -> Result<Option<Vec<u8>>, JobError> {
        let compressed = match self.objects.get_object(&self.bucket, &object.object_id).await {
            Ok(bytes) => bytes,
            Err(e @ (ObjectStoreError::NotFound { .. } | ObjectStoreError::InvalidKey(_))) => {
                warn!(object_id = %object.object_id, error = %e, "Payload unavailable, skipping object");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        match decompress_payload(&compressed) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) => {
                warn!(object_id = %object.object_id, error = %e, "Payload failed to decompress, skipping object");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobHandler for CorrectionJob {
    fn kind(&self) -> JobKind {
        JobKind::Correction
    }

    async fn run(&self, tx: &mut dyn StoreTx, session_id: &str) -> Result<JobSummary, JobError> {
        let session = tx
            .session_for_update(session_id)
            .await?
            .ok_or_else(|| JobError::Business(format!("session {session_id} not found")))?;

        let events = tx.session_events(session_id).await?;
        let mut summary = CorrectionSummary {
            events: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            info!(session_id, "No events to correct");
            return Ok(JobSummary::Correction(summary));
        }

        let objects = tx.linked_objects(session_id).await?;
        summary.objects = objects.len();
        if objects.is_empty() {
            info!(session_id, events = events.len(), "No linked objects, nothing to correct");
            return Ok(JobSummary::Correction(summary));
        }

        let mut loaded: Vec<(&RawSensorObject, i64, Vec<u8>)> = Vec::with_capacity(objects.len());
        for object in &objects {
            let Some(start) = object.start_time else {
                warn!(object_id = %object.object_id, "Linked object has no normalized start time, skipping");
                summary.objects_skipped += 1;
                continue;
            };
            match self.load_payload(object).await? {
                Some(raw) => loaded.push((object, start.timestamp_micros(), raw)),
                None => summary.objects_skipped += 1,
            }
        }

        let chunks: Vec<PayloadChunk<'_>> = loaded
            .iter()
            .map(|(object, start_us, raw)| PayloadChunk {
                label: &object.object_id,
                data: raw,
                start_us: *start_us,
                sampling_rate_hz: object.sampling_rate,
            })
            .collect();
        let extraction = extract_triggers(&chunks);
        summary.payloads_skipped = extraction.payloads_skipped;
        summary.triggers = extraction.timestamps.len();
        debug!(
            session_id,
            payloads_used = extraction.payloads_used,
            payloads_skipped = extraction.payloads_skipped,
            payloads_without_trigger = extraction.payloads_without_trigger,
            duplicates_removed = extraction.duplicates_removed,
            "Trigger extraction finished"
        );

        if extraction.timestamps.is_empty() {
            info!(session_id, events = events.len(), "No triggers found, nothing to correct");
            return Ok(JobSummary::Correction(summary));
        }

        let session_start_us = session.start_us();
        if session_start_us.is_none() {
            warn!(session_id, "Session has no start time, aligning events sequentially");
        }
        let expected: Vec<Option<i64>> = events
            .iter()
            .map(|e| session_start_us.and_then(|start| expected_onset_us(start, e.onset)))
            .collect();

        let report = self.aligner.align(&extraction.timestamps, &expected);
        for (event, aligned) in events.iter().zip(&report.events) {
            if let Some(corrected) = aligned.corrected_us {
                tx.set_event_onset_corrected(event.event_id, corrected).await?;
                summary.events_updated += 1;
            }
        }

        summary.matched = report.matched_nearest + report.matched_sequential;
        summary.fallbacks = report.fallbacks;
        summary.bumped = report.bumped;
        summary.far_matches = report.far_matches;

        info!(
            session_id,
            events = summary.events,
            triggers = summary.triggers,
            matched = summary.matched,
            fallbacks = summary.fallbacks,
            bumped = summary.bumped,
            far_matches = summary.far_matches,
            updated = summary.events_updated,
            "Correction job finished"
        );
        Ok(JobSummary::Correction(summary))
    }
}
