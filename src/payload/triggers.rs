//! Trigger edge extraction across consecutive payloads
//!
//! Walks the trigger channel of every payload in recording order and emits an
//! absolute microsecond timestamp for each 0 -> non-zero transition. The last
//! trigger level seen is carried from one payload into the next, so an edge
//! that lands on a payload boundary is reported once.

use super::{PayloadError, SampleView};
use tracing::{debug, warn};

/// One decompressed payload positioned on the absolute timeline.
#[derive(Debug, Clone)]
pub struct PayloadChunk<'a> {
    /// Identifier used only for log context
    pub label: &'a str,
    pub data: &'a [u8],
    /// Absolute start of sample 0, microseconds since the Unix epoch
    pub start_us: i64,
    pub sampling_rate_hz: f64,
}

/// Result of a trigger extraction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerExtraction {
    /// Ascending, deduplicated absolute trigger instants (µs)
    pub timestamps: Vec<i64>,
    pub payloads_used: usize,
    pub payloads_skipped: usize,
    /// Payloads that decoded but carry no stim channel
    pub payloads_without_trigger: usize,
    /// Edges dropped as exact duplicates of another payload's edge
    pub duplicates_removed: usize,
}

/// Microsecond offset of sample `index` from the payload start.
pub fn sample_offset_us(index: usize, sampling_rate_hz: f64) -> i64 {
    (index as f64 * (1_000_000.0 / sampling_rate_hz)).round() as i64
}

/// Extract trigger timestamps from payloads ordered by start time.
///
/// Malformed payloads are skipped with a warning and never abort the pass.
/// The function is pure: the same input always yields the same output.
pub fn extract_triggers(chunks: &[PayloadChunk<'_>]) -> TriggerExtraction {
    let mut result = TriggerExtraction::default();
    let mut edges: Vec<i64> = Vec::new();
    // Last trigger level observed; None when continuity is unknown.
    let mut carried: Option<i16> = None;

    for chunk in chunks {
        if !(chunk.sampling_rate_hz.is_finite() && chunk.sampling_rate_hz > 0.0) {
            warn!(
                payload = chunk.label,
                sampling_rate = chunk.sampling_rate_hz,
                "Skipping payload with invalid sampling rate"
            );
            result.payloads_skipped += 1;
            carried = None;
            continue;
        }

        let view = match SampleView::parse(chunk.data) {
            Ok(view) => view,
            Err(e) => {
                log_skip(chunk.label, &e);
                result.payloads_skipped += 1;
                carried = None;
                continue;
            }
        };

        if view.header().trigger_channel.is_none() {
            debug!(payload = chunk.label, "Payload has no trigger channel");
            result.payloads_without_trigger += 1;
            carried = None;
            continue;
        }

        result.payloads_used += 1;
        let mut first = true;
        for (i, value) in view.trigger_values().enumerate() {
            if first {
                first = false;
                if let Some(prev) = carried {
                    if prev != value {
                        debug!(
                            payload = chunk.label,
                            carried = prev,
                            observed = value,
                            "Trigger level changed across payload boundary"
                        );
                    }
                }
            }
            if carried == Some(0) && value != 0 {
                edges.push(chunk.start_us + sample_offset_us(i, chunk.sampling_rate_hz));
            }
            carried = Some(value);
        }
    }

    edges.sort_unstable();
    let before = edges.len();
    edges.dedup();
    result.duplicates_removed = before - edges.len();
    result.timestamps = edges;
    result
}

fn log_skip(label: &str, error: &PayloadError) {
    warn!(payload = label, error = %error, "Skipping undecodable payload");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::encode_payload;

    const CHANNELS: &[(&str, u8)] = &[("Cz", 0), ("TRIG", 3)];

    fn trig_payload(levels: &[i16]) -> Vec<u8> {
        let samples: Vec<Vec<i16>> = levels.iter().map(|&t| vec![100, t]).collect();
        encode_payload(CHANNELS, &samples)
    }

    fn chunk<'a>(data: &'a [u8], start_us: i64, rate: f64) -> PayloadChunk<'a> {
        PayloadChunk {
            label: "test",
            data,
            start_us,
            sampling_rate_hz: rate,
        }
    }

    #[test]
    fn test_boundary_edge_reported_once() {
        // 256 Hz, 4 samples each: edge at sample 3 of A, held high at sample 0 of B
        let a = trig_payload(&[0, 0, 0, 7]);
        let b = trig_payload(&[7, 0, 0, 0]);
        let chunk_us = sample_offset_us(4, 256.0); // 15_625
        let result = extract_triggers(&[chunk(&a, 0, 256.0), chunk(&b, chunk_us, 256.0)]);
        assert_eq!(result.timestamps, vec![11_719]);
        assert_eq!(result.payloads_used, 2);
    }

    #[test]
    fn test_edge_on_first_sample_of_next_payload() {
        let a = trig_payload(&[0, 0, 0, 0]);
        let b = trig_payload(&[5, 5, 0, 0]);
        let result = extract_triggers(&[chunk(&a, 1_000, 250.0), chunk(&b, 17_000, 250.0)]);
        assert_eq!(result.timestamps, vec![17_000]);
    }

    #[test]
    fn test_first_sample_has_no_predecessor() {
        let a = trig_payload(&[3, 0, 9, 9]);
        let result = extract_triggers(&[chunk(&a, 0, 1000.0)]);
        // only the 0 -> 9 transition at sample 2 counts
        assert_eq!(result.timestamps, vec![2_000]);
    }

    #[test]
    fn test_negative_levels_count_as_active() {
        let a = trig_payload(&[0, -1, 0, 2]);
        let result = extract_triggers(&[chunk(&a, 0, 1000.0)]);
        assert_eq!(result.timestamps, vec![1_000, 3_000]);
    }

    #[test]
    fn test_overlapping_objects_are_deduplicated() {
        let a = trig_payload(&[0, 1, 0, 0]);
        let result = extract_triggers(&[chunk(&a, 0, 1000.0), chunk(&a, 0, 1000.0)]);
        assert_eq!(result.timestamps, vec![1_000]);
        assert_eq!(result.duplicates_removed, 1);
    }

    #[test]
    fn test_bad_payloads_do_not_abort_siblings() {
        let good = trig_payload(&[0, 4, 0, 0]);
        let mut wrong_version = good.clone();
        wrong_version[0] = 3;
        let tiny = vec![4u8, 1];

        let result = extract_triggers(&[
            chunk(&tiny, 0, 1000.0),
            chunk(&wrong_version, 0, 1000.0),
            chunk(&good, 10_000, 0.0),
            chunk(&good, 20_000, f64::NAN),
            chunk(&good, 30_000, 1000.0),
        ]);
        assert_eq!(result.timestamps, vec![31_000]);
        assert_eq!(result.payloads_skipped, 4);
        assert_eq!(result.payloads_used, 1);
    }

    #[test]
    fn test_skipped_payload_breaks_continuity() {
        let low = trig_payload(&[0, 0]);
        let high = trig_payload(&[6, 6]);
        let broken = vec![4u8, 9, 0, 0];
        let result = extract_triggers(&[
            chunk(&low, 0, 1000.0),
            chunk(&broken, 2_000, 1000.0),
            chunk(&high, 4_000, 1000.0),
        ]);
        assert!(result.timestamps.is_empty());
    }

    #[test]
    fn test_payload_without_trigger_channel() {
        let plain = encode_payload(&[("Cz", 0)], &[vec![0], vec![1]]);
        let result = extract_triggers(&[chunk(&plain, 0, 500.0)]);
        assert!(result.timestamps.is_empty());
        assert_eq!(result.payloads_without_trigger, 1);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let a = trig_payload(&[0, 1, 0, 1, 0, 0, 2, 2]);
        let b = trig_payload(&[0, 0, 3, 0]);
        let chunks = [chunk(&a, 500, 512.0), chunk(&b, 16_125, 512.0)];
        let first = extract_triggers(&chunks);
        let second = extract_triggers(&chunks);
        assert_eq!(first, second);
        assert!(first.timestamps.windows(2).all(|w| w[0] < w[1]));
    }
}
