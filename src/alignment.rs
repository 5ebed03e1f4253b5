//! Event-Trigger Alignment
//!
//! Matches logged event onsets to trigger edges observed in the signal.
//!
//! ## Algorithm
//!
//! A cursor into the ascending trigger list only moves forward. For each
//! event (in onset order):
//!
//! 1. With an expected absolute time, scan `[cursor, len - events_after)` for
//!    the trigger nearest to it, stopping as soon as the distance grows. Ties
//!    keep the earliest candidate. Later events are never starved because the
//!    window stops short of the triggers they still need.
//! 2. Without an expected time, take the trigger at the cursor.
//! 3. The cursor moves past the chosen trigger.
//!
//! This is a bounded greedy local search, not an optimal assignment, and must
//! stay that way: exported datasets are reproduced from its exact choices.
//!
//! Written values are forced strictly increasing by bumping any value that
//! does not exceed its predecessor to `previous + 1µs`.

use tracing::warn;

use crate::config::defaults::TRIGGER_MATCH_TOLERANCE_US;

/// Expected absolute onset for an event: `session_start + round(onset * 1e6)`.
///
/// Returns `None` when the onset is NaN, infinite, or lands outside the
/// `i64` microsecond range.
pub fn expected_onset_us(session_start_us: i64, onset_seconds: f64) -> Option<i64> {
    let offset_us = (onset_seconds * 1_000_000.0).round();
    // `as` saturates at the bounds, so reject before converting.
    if !offset_us.is_finite() || offset_us.abs() >= i64::MAX as f64 {
        return None;
    }
    session_start_us.checked_add(offset_us as i64)
}

/// How an event's corrected timestamp was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    /// Nearest trigger to the expected time
    Nearest { trigger_index: usize, distance_us: i64 },
    /// Next unused trigger (no expected time available)
    Sequential { trigger_index: usize },
    /// Triggers exhausted; the expected time was used instead
    ExpectedFallback,
    /// Nothing to assign
    Unassigned,
}

/// Per-event alignment result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedEvent {
    pub corrected_us: Option<i64>,
    pub source: MatchSource,
    /// Set when the monotonic guard changed the value
    pub bumped: bool,
}

/// Alignment output and counters for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlignmentReport {
    pub events: Vec<AlignedEvent>,
    pub matched_nearest: usize,
    pub matched_sequential: usize,
    pub fallbacks: usize,
    pub unassigned: usize,
    pub bumped: usize,
    /// Matches farther than the tolerance from the expected time
    pub far_matches: usize,
}

impl AlignmentReport {
    /// Values that will be written, in event order.
    pub fn corrected(&self) -> impl Iterator<Item = Option<i64>> + '_ {
        self.events.iter().map(|e| e.corrected_us)
    }
}

/// Aligner settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aligner {
    /// Distance beyond which a match is reported as suspicious
    pub tolerance_us: i64,
}

impl Default for Aligner {
    fn default() -> Self {
        Self {
            tolerance_us: TRIGGER_MATCH_TOLERANCE_US,
        }
    }
}

impl Aligner {
    pub fn new(tolerance_us: i64) -> Self {
        Self { tolerance_us }
    }

    /// Align events to `triggers` (ascending, deduplicated).
    ///
    /// `expected` holds one entry per event in onset order; `None` switches
    /// that event to sequential assignment.
    pub fn align(&self, triggers: &[i64], expected: &[Option<i64>]) -> AlignmentReport {
        let mut report = AlignmentReport {
            events: Vec::with_capacity(expected.len()),
            ..Default::default()
        };
        let mut cursor = 0usize;
        let mut previous: Option<i64> = None;
        let total = expected.len();

        for (i, expected_us) in expected.iter().copied().enumerate() {
            let events_after = total - i - 1;
            let (candidate, source) = if cursor < triggers.len() {
                match expected_us {
                    Some(target) => {
                        let idx = nearest_in_window(triggers, cursor, events_after, target);
                        let distance_us =
                            i64::try_from(triggers[idx].abs_diff(target)).unwrap_or(i64::MAX);
                        if distance_us > self.tolerance_us {
                            report.far_matches += 1;
                            warn!(
                                event_index = i,
                                expected_us = target,
                                trigger_us = triggers[idx],
                                distance_us,
                                "Trigger far from expected onset, possible device/trigger misalignment"
                            );
                        }
                        report.matched_nearest += 1;
                        cursor = idx + 1;
                        (
                            Some(triggers[idx]),
                            MatchSource::Nearest {
                                trigger_index: idx,
                                distance_us,
                            },
                        )
                    }
                    None => {
                        let idx = cursor;
                        report.matched_sequential += 1;
                        cursor += 1;
                        (Some(triggers[idx]), MatchSource::Sequential { trigger_index: idx })
                    }
                }
            } else if let Some(target) = expected_us {
                report.fallbacks += 1;
                warn!(
                    event_index = i,
                    expected_us = target,
                    "No trigger left for event, keeping expected onset"
                );
                (Some(target), MatchSource::ExpectedFallback)
            } else {
                report.unassigned += 1;
                warn!(event_index = i, "No trigger and no expected onset, event left uncorrected");
                (None, MatchSource::Unassigned)
            };

            let mut bumped = false;
            let corrected_us = candidate.map(|value| match previous {
                Some(prev) if value <= prev => {
                    bumped = true;
                    warn!(
                        event_index = i,
                        computed_us = value,
                        previous_us = prev,
                        "Corrected onset not increasing, bumping to previous + 1us"
                    );
                    prev.saturating_add(1)
                }
                _ => value,
            });
            if bumped {
                report.bumped += 1;
            }
            if corrected_us.is_some() {
                previous = corrected_us;
            }
            report.events.push(AlignedEvent {
                corrected_us,
                source,
                bumped,
            });
        }

        report
    }
}

/// Index of the trigger nearest `target` within the search window.
///
/// Caller guarantees `cursor < triggers.len()`.
fn nearest_in_window(triggers: &[i64], cursor: usize, events_after: usize, target: i64) -> usize {
    let upper = triggers
        .len()
        .saturating_sub(events_after)
        .max(cursor + 1)
        .min(triggers.len());

    let mut best = cursor;
    let mut best_distance = triggers[cursor].abs_diff(target);
    for (idx, &trigger) in triggers.iter().enumerate().take(upper).skip(cursor + 1) {
        let distance = trigger.abs_diff(target);
        if distance < best_distance {
            best = idx;
            best_distance = distance;
        } else if distance > best_distance {
            break;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(report: &AlignmentReport) -> Vec<Option<i64>> {
        report.corrected().collect()
    }

    #[test]
    fn test_expected_onset_rounding() {
        assert_eq!(expected_onset_us(1_000_000, 1.5), Some(2_500_000));
        assert_eq!(expected_onset_us(0, 0.000_000_6), Some(1));
        assert_eq!(expected_onset_us(0, f64::NAN), None);
        assert_eq!(expected_onset_us(0, f64::INFINITY), None);
    }

    #[test]
    fn test_expected_onset_out_of_range() {
        let start = 1_717_236_000_000_000;
        assert_eq!(expected_onset_us(start, 1e13), None);
        assert_eq!(expected_onset_us(start, -1e13), None);
        assert_eq!(expected_onset_us(i64::MAX - 10, 1.0), None);
        // large but representable
        assert_eq!(
            expected_onset_us(start, 1e9),
            Some(start + 1_000_000_000_000_000)
        );
    }

    #[test]
    fn test_extreme_expected_times_do_not_overflow() {
        let start = 1_717_236_000_000_000;
        let far_past = expected_onset_us(start, -9e12);
        assert!(far_past.is_some());

        let triggers = [start + 1_000, start + 2_000];
        let report = Aligner::default().align(&triggers, &[far_past, Some(i64::MAX), Some(i64::MIN)]);
        assert_eq!(values(&report), vec![Some(start + 1_000), Some(start + 2_000), Some(start + 2_001)]);
        assert_eq!(report.far_matches, 2);
        assert_eq!(report.bumped, 1);
        assert_eq!(
            report.events[1].source,
            MatchSource::Nearest {
                trigger_index: 1,
                distance_us: i64::MAX - (start + 2_000)
            }
        );
    }

    #[test]
    fn test_out_of_range_onset_aligns_sequentially() {
        let start = 1_717_236_000_000_000;
        let expected: Vec<Option<i64>> = [0.5, 1e13, -1e13]
            .iter()
            .map(|&onset| expected_onset_us(start, onset))
            .collect();
        let triggers = [start + 400_000, start + 900_000, start + 1_400_000];
        let report = Aligner::default().align(&triggers, &expected);
        assert_eq!(
            values(&report),
            vec![Some(start + 400_000), Some(start + 900_000), Some(start + 1_400_000)]
        );
        assert_eq!(report.matched_sequential, 2);
    }

    #[test]
    fn test_nearest_trigger_per_event() {
        let triggers = [1_000, 2_050, 2_900, 4_100];
        let expected = [Some(2_000), Some(4_000)];
        let report = Aligner::default().align(&triggers, &expected);
        assert_eq!(values(&report), vec![Some(2_050), Some(4_100)]);
        assert_eq!(report.matched_nearest, 2);
    }

    #[test]
    fn test_window_reserves_triggers_for_later_events() {
        // Both events expect ~10_000 but only the first may claim the last trigger's neighbours.
        let triggers = [1_000, 2_000, 10_000];
        let expected = [Some(10_000), Some(10_000)];
        let report = Aligner::default().align(&triggers, &expected);
        // first event is confined to [0, 2): picks 2_000; second gets 10_000
        assert_eq!(values(&report), vec![Some(2_000), Some(10_000)]);
    }

    #[test]
    fn test_stops_at_first_distance_increase() {
        let triggers = [1_000, 2_000, 2_950, 3_100, 9_000];
        let report = Aligner::default().align(&triggers, &[Some(3_000)]);
        assert_eq!(values(&report), vec![Some(2_950)]);
        assert_eq!(
            report.events[0].source,
            MatchSource::Nearest {
                trigger_index: 2,
                distance_us: 50
            }
        );
    }

    #[test]
    fn test_tie_prefers_earliest() {
        let triggers = [900, 1_100];
        let report = Aligner::default().align(&triggers, &[Some(1_000)]);
        assert_eq!(values(&report), vec![Some(900)]);
    }

    #[test]
    fn test_sequential_mode_without_expected_times() {
        let triggers = [10, 20, 30];
        let report = Aligner::default().align(&triggers, &[None, None]);
        assert_eq!(values(&report), vec![Some(10), Some(20)]);
        assert_eq!(report.matched_sequential, 2);
    }

    #[test]
    fn test_mixed_modes_share_cursor() {
        let triggers = [100, 200, 300, 400];
        let report = Aligner::default().align(&triggers, &[Some(210), None, Some(390)]);
        assert_eq!(values(&report), vec![Some(200), Some(300), Some(400)]);
    }

    #[test]
    fn test_exhausted_triggers_fall_back() {
        let triggers = [1_000];
        let report = Aligner::default().align(&triggers, &[Some(1_000), Some(5_000), None]);
        assert_eq!(values(&report), vec![Some(1_000), Some(5_000), None]);
        assert_eq!(report.fallbacks, 1);
        assert_eq!(report.unassigned, 1);
    }

    #[test]
    fn test_monotonic_bump() {
        let triggers = [5_000];
        // fallback value lands before the matched trigger
        let report = Aligner::default().align(&triggers, &[Some(5_000), Some(4_000)]);
        assert_eq!(values(&report), vec![Some(5_000), Some(5_001)]);
        assert_eq!(report.bumped, 1);
        assert!(report.events[1].bumped);
    }

    #[test]
    fn test_far_match_is_counted_not_rejected() {
        let triggers = [2_000_000];
        let report = Aligner::new(500_000).align(&triggers, &[Some(0)]);
        assert_eq!(values(&report), vec![Some(2_000_000)]);
        assert_eq!(report.far_matches, 1);
    }

    #[test]
    fn test_output_strictly_increasing() {
        let triggers: Vec<i64> = (0..50).map(|i| i * 1_000 + (i % 7) * 13).collect();
        let expected: Vec<Option<i64>> = (0..40)
            .map(|i| if i % 5 == 0 { None } else { Some(i * 1_100) })
            .collect();
        let report = Aligner::default().align(&triggers, &expected);
        let written: Vec<i64> = report.corrected().flatten().collect();
        assert_eq!(written.len(), 40);
        assert!(written.windows(2).all(|w| w[0] < w[1]));
    }
}
