//! erp-timesync: temporal correction for wearable biosignal recordings
//!
//! Reconstructs an accurate, strictly increasing timeline of stimulus onsets
//! from three imprecise clocks (device counter, client wall clock, server
//! wall clock).
//!
//! ## Pipeline
//!
//! - **Payload decoding** ([`payload`]): version 4 sample buffers, trigger
//!   edge extraction across consecutive payloads
//! - **Clock normalization** ([`clock`]): wraparound-safe mapping of 32-bit
//!   device counters onto absolute UTC
//! - **Alignment** ([`alignment`]): greedy nearest-trigger matching of logged
//!   event onsets
//! - **Jobs** ([`jobs`], [`worker`]): link and correction stages run as
//!   retry-safe, per-session transactional jobs drawn from durable queues

pub mod alignment;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod jobs;
pub mod objects;
pub mod payload;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod types;
pub mod worker;

// Re-export configuration
pub use config::TimesyncConfig;

// Re-export commonly used types
pub use types::{
    ClockOffsetInfo, JobKind, ProcessingStatus, RawSensorObject, Session, SessionEvent,
    SessionJobMessage,
};

// Re-export pipeline components
pub use alignment::{Aligner, AlignmentReport};
pub use jobs::{CorrectionJob, JobError, JobHandler, JobSummary, LinkJob};
pub use payload::{extract_triggers, PayloadChunk, PayloadError, TriggerExtraction};
pub use runtime::{Pipeline, Role};
pub use worker::{Outcome, Worker};
