//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Clock Normalization
// ============================================================================

/// Slack around the declared session window when deciding whether an
/// object's absolute start time is trustworthy (ms).
pub const NORMALIZATION_TOLERANCE_MS: i64 = 10_000;

/// Floor applied to the session duration before computing the acceptance
/// window (ms).
pub const MIN_SESSION_DURATION_MS: i64 = 1_000;

// ============================================================================
// Event Correction
// ============================================================================

/// Distance between a matched trigger and the expected onset beyond which
/// the match is logged as suspicious (µs). 0.5 s.
pub const TRIGGER_MATCH_TOLERANCE_US: i64 = 500_000;

/// Bucket holding compressed raw sensor payloads.
pub const RAW_DATA_BUCKET: &str = "raw-data";

// ============================================================================
// Queues
// ============================================================================

pub const LINK_QUEUE: &str = "session_link_jobs";

pub const CORRECTION_QUEUE: &str = "event_correction_jobs";

/// Sleep between polls when a queue is empty (ms).
pub const QUEUE_POLL_INTERVAL_MS: u64 = 1_000;

/// A claimed message that is neither acked nor nacked within this window is
/// handed out again (s). Covers workers that die mid-job.
pub const QUEUE_VISIBILITY_TIMEOUT_SECS: u64 = 900;

/// First reconnect delay after a broker connection loss (ms).
pub const RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;

/// Reconnect delay cap (ms).
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

// ============================================================================
// Relational Store
// ============================================================================

pub const DB_POOL_SIZE: u32 = 10;

pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Object Store
// ============================================================================

/// HTTP timeout for a single payload download (s).
pub const OBJECT_STORE_TIMEOUT_SECS: u64 = 30;

/// Download attempts before a transport failure is surfaced to the job.
pub const OBJECT_STORE_MAX_ATTEMPTS: u32 = 5;
