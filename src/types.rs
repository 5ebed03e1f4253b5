//! Shared data structures for the temporal-correction pipeline
//!
//! This module defines the rows the workers read and write:
//! - Raw sensor objects (compressed payload metadata, device + absolute time bounds)
//! - Sessions (declared UTC window, clock offset estimate, two status machines)
//! - Session events (logged onsets and their trigger-corrected replacement)
//! - Queue messages exchanged between the link and correction stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Processing Status
// ============================================================================

/// Per-session state machine shared by `link_status` and
/// `event_correction_status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    /// Column value as stored in the relational store
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    /// Parse a stored column value. Unknown values map to `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job Kinds & Queue Messages
// ============================================================================

/// The two pipeline stages, each with its own durable queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Clock normalization + session/object linking
    Link,
    /// Event onset correction against detected triggers
    Correction,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Link => "link",
            JobKind::Correction => "correction",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "link" | "linking" => Ok(JobKind::Link),
            "correction" | "correct" | "event_correction" => Ok(JobKind::Correction),
            other => Err(format!("unknown job kind '{other}' (expected link|correction)")),
        }
    }
}

/// Body of every link / correction message: `{"session_id": "..."}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionJobMessage {
    pub session_id: String,
}

impl SessionJobMessage {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    /// Decode and validate a raw queue body.
    ///
    /// A body that is not JSON, lacks `session_id`, or carries an empty id
    /// can never succeed and is reported as an error for the harness to discard.
    pub fn decode(body: &[u8]) -> Result<Self, String> {
        let message: Self =
            serde_json::from_slice(body).map_err(|e| format!("invalid job message: {e}"))?;
        let trimmed = message.session_id.trim();
        if trimmed.is_empty() {
            return Err("invalid job message: empty session_id".to_string());
        }
        Ok(Self::new(trimmed))
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing a single string field cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Estimate of (server_time − device_time), produced by the sync exchange
/// that runs while a session is recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClockOffsetInfo {
    pub offset_ms_avg: f64,
    #[serde(default)]
    pub rtt_ms_avg: Option<f64>,
}

/// A recording session as read by the workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub experiment_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub clock_offset_info: Option<ClockOffsetInfo>,
    pub link_status: ProcessingStatus,
    pub event_correction_status: ProcessingStatus,
}

impl Session {
    /// Usable clock offset in milliseconds. Non-finite estimates are ignored.
    pub fn offset_ms(&self) -> Option<f64> {
        self.clock_offset_info
            .map(|info| info.offset_ms_avg)
            .filter(|v| v.is_finite())
    }

    /// Session start as integer microseconds since the Unix epoch
    pub fn start_us(&self) -> Option<i64> {
        self.start_time.map(|t| t.timestamp_micros())
    }
}

// ============================================================================
// Raw Sensor Objects
// ============================================================================

/// Metadata row for one compressed payload stored in the object store.
///
/// `start_time_device` / `end_time_device` are raw device counter readings
/// (microseconds, wrapping at 2^32). They are kept as `i64` because that is
/// how the relational store holds them; [`crate::clock`] validates the range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSensorObject {
    pub object_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub device_id: String,
    pub sampling_rate: f64,
    pub start_time_device: Option<i64>,
    pub end_time_device: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RawSensorObject {
    /// True when the object's absolute range intersects `[start, end]`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => s <= end && e >= start,
            _ => false,
        }
    }
}

// ============================================================================
// Session Events
// ============================================================================

/// A logged stimulus/event row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEvent {
    pub event_id: i64,
    pub session_id: String,
    /// Seconds relative to the session start, as logged by the client
    pub onset: f64,
    pub duration: Option<f64>,
    pub trial_type: Option<String>,
    /// Absolute trigger-verified onset, written only by the aligner
    pub onset_corrected_us: Option<i64>,
}
