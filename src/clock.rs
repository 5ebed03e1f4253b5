//! Device Clock Normalization
//!
//! Devices stamp payloads with a free-running 32-bit microsecond counter that
//! wraps roughly every 71.6 minutes. Given the session's declared UTC start and
//! the estimated offset between server and device clocks, this module maps
//! counter readings back onto absolute time.
//!
//! All counter differences use unsigned wrapping arithmetic. A signed
//! subtraction across a wrap would yield a huge negative delta.

use chrono::{DateTime, Duration, Utc};

use crate::config::defaults::{MIN_SESSION_DURATION_MS, NORMALIZATION_TOLERANCE_MS};
use crate::types::RawSensorObject;

/// Size of the device counter space (2^32 µs).
pub const DEVICE_COUNTER_SPAN: i64 = 1 << 32;

/// Elapsed device ticks from `base` to `reading`, modulo 2^32.
pub fn wrapping_delta_us(reading: u32, base: u32) -> u32 {
    reading.wrapping_sub(base)
}

/// Device counter value expected at the session start.
///
/// `round(session_start_ms - offset_ms) * 1000 mod 2^32`
pub fn device_base_us(session_start_ms: i64, offset_ms: f64) -> u32 {
    let base_ms = (session_start_ms as f64 - offset_ms).round() as i64;
    base_ms
        .wrapping_mul(1000)
        .rem_euclid(DEVICE_COUNTER_SPAN) as u32
}

/// Convert a stored device reading to the counter domain.
pub fn device_reading(value: i64) -> Option<u32> {
    u32::try_from(value).ok()
}

/// Window within which a session's objects are normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tolerance: Duration,
    pub min_duration: Duration,
}

impl SessionWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            tolerance: Duration::milliseconds(NORMALIZATION_TOLERANCE_MS),
            min_duration: Duration::milliseconds(MIN_SESSION_DURATION_MS),
        }
    }

    pub fn with_tolerance_ms(mut self, tolerance_ms: i64) -> Self {
        self.tolerance = Duration::milliseconds(tolerance_ms);
        self
    }

    pub fn with_min_duration_ms(mut self, min_duration_ms: i64) -> Self {
        self.min_duration = Duration::milliseconds(min_duration_ms);
        self
    }

    /// `max(end - start, min_duration)`
    pub fn duration(&self) -> Duration {
        (self.end - self.start).max(self.min_duration)
    }

    /// Start of the acceptance band for already-known absolute times
    pub fn lower_bound(&self) -> DateTime<Utc> {
        self.start - self.tolerance
    }

    pub fn upper_bound(&self) -> DateTime<Utc> {
        self.end + self.tolerance
    }

    /// True when `start_time` must be recomputed from device time.
    pub fn needs_repair(&self, start_time: Option<DateTime<Utc>>) -> bool {
        match start_time {
            None => true,
            Some(t) => t < self.lower_bound() || t > self.upper_bound(),
        }
    }

    /// Largest start delta (µs) still attributed to this session.
    pub fn max_start_delta_us(&self) -> i64 {
        (self.duration() + self.tolerance).num_milliseconds() * 1000
    }
}

/// Outcome of normalizing one raw object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalization {
    Repaired {
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
    /// Start delta beyond the session window: object belongs to another session
    OutsideWindow { start_delta_us: u32 },
    /// Device readings missing or outside the 32-bit counter range
    InvalidDeviceTime,
    /// End counter resolves before the start counter
    InvertedRange { start_delta_us: u32, end_delta_us: u32 },
}

/// Recompute absolute bounds for `object` from its device counter readings.
pub fn normalize_object(
    object: &RawSensorObject,
    window: &SessionWindow,
    device_base: u32,
) -> Normalization {
    let (Some(start_dev), Some(end_dev)) = (
        object.start_time_device.and_then(device_reading),
        object.end_time_device.and_then(device_reading),
    ) else {
        return Normalization::InvalidDeviceTime;
    };

    let start_delta_us = wrapping_delta_us(start_dev, device_base);
    let end_delta_us = wrapping_delta_us(end_dev, device_base);

    if i64::from(start_delta_us) > window.max_start_delta_us() {
        return Normalization::OutsideWindow { start_delta_us };
    }
    if end_delta_us < start_delta_us {
        return Normalization::InvertedRange {
            start_delta_us,
            end_delta_us,
        };
    }

    Normalization::Repaired {
        start_time: window.start + Duration::microseconds(i64::from(start_delta_us)),
        end_time: window.start + Duration::microseconds(i64::from(end_delta_us)),
    }
}
