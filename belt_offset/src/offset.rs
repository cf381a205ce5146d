//! Time-offset reconstruction across the segment chain.
//!
//! The resolver and composer are pure over their inputs: given the same
//! positions, chain, and sample sequences they return the same offset. All
//! failures are typed; nothing is logged here.

use chrono::Duration;

use crate::chain::Chain;
use crate::{BeltError, SpeedHistory, SpeedSample};

/// Walk one segment's history backward until `distance` meters are covered.
///
/// `history` must be newest-first. Each consecutive pair contributes
/// `newer.speed * dt`; the walk stops as soon as the remaining distance drops
/// to zero or below, returning the elapsed time up to the older timestamp of
/// the final pair. Precision is bounded by sample spacing, not interpolated.
///
/// A distance of zero or less is already covered and yields a zero offset.
pub fn resolve_single_segment(
    distance: f64,
    history: &[SpeedSample],
) -> Result<Duration, BeltError> {
    if distance <= 0.0 {
        return Ok(Duration::zero());
    }
    let mut remaining = distance;
    let mut elapsed = Duration::zero();
    for pair in history.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        let dt = newer.timestamp - older.timestamp;
        remaining -= newer.speed * (dt.num_milliseconds() as f64 / 1000.0);
        elapsed = elapsed + dt;
        if remaining <= 0.0 {
            return Ok(elapsed);
        }
    }
    Err(BeltError::InsufficientHistory { remaining })
}

/// Elapsed time since the material now at `current_position` passed
/// `sensor_position`, reconstructed from per-segment speed histories.
///
/// `histories` is index-aligned with the chain's segments. Spans that run
/// against the flow direction fail with [`BeltError::InvalidSpan`]; a history
/// too short to cover its share of the span fails with
/// [`BeltError::InsufficientHistory`], which callers recover from by fetching
/// a wider sample window and retrying the whole composition.
pub fn compose_offset(
    sensor_position: f64,
    current_position: f64,
    chain: &Chain,
    histories: &[SpeedHistory],
) -> Result<Duration, BeltError> {
    if histories.len() != chain.len() {
        return Err(BeltError::HistoryMismatch {
            segments: chain.len(),
            histories: histories.len(),
        });
    }
    let sensor = chain.locate(sensor_position)?;
    let current = chain.locate(current_position)?;

    // The chain only moves forward; material cannot sit behind the sensor.
    if current.index < sensor.index || current_position < sensor_position {
        return Err(BeltError::InvalidSpan {
            sensor: sensor_position,
            current: current_position,
        });
    }

    if sensor.index == current.index {
        return resolve_single_segment(
            current_position - sensor_position,
            histories[current.index].samples(),
        );
    }

    let segments = chain.segments();
    let sensor_residual = segments[sensor.index].length - sensor.local;
    let current_residual = current.local;

    // Walk against the flow, from the current segment back to the sensor
    // segment. Each earlier segment only sees samples at least as old as the
    // offset accumulated from the later ones.
    let mut total = Duration::zero();
    for index in (sensor.index..=current.index).rev() {
        let distance = if index == sensor.index {
            sensor_residual
        } else if index == current.index {
            current_residual
        } else {
            segments[index].length
        };
        let window = histories[index].window_older_than(total);
        total = total + resolve_single_segment(distance, window)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Segment;
    use chrono::{TimeZone, Utc};

    fn chain(lengths: &[f64]) -> Chain {
        let segments = lengths
            .iter()
            .enumerate()
            .map(|(i, &length)| Segment {
                name: format!("seg{}", i),
                length,
                speed_factor: 1.0,
            })
            .collect();
        Chain::new(segments).unwrap()
    }

    /// Newest-first history with one sample per second at the given speeds.
    fn history(speeds: &[f64]) -> SpeedHistory {
        let t0 = Utc.with_ymd_and_hms(2018, 5, 24, 14, 15, 36).unwrap();
        SpeedHistory::new(
            speeds
                .iter()
                .enumerate()
                .map(|(i, &speed)| SpeedSample {
                    timestamp: t0 - Duration::seconds(i as i64),
                    speed,
                })
                .collect(),
        )
    }

    #[test]
    fn test_resolver_exact_prefix_sum() {
        // 0.5 m per one-second pair; 1.0 m is exactly two pairs.
        let h = history(&[0.5, 0.5, 0.5]);
        let offset = resolve_single_segment(1.0, h.samples()).unwrap();
        assert_eq!(offset, Duration::seconds(2));
    }

    #[test]
    fn test_resolver_zero_and_negative_distance() {
        let h = history(&[0.5, 0.5]);
        assert_eq!(
            resolve_single_segment(0.0, h.samples()).unwrap(),
            Duration::zero()
        );
        assert_eq!(
            resolve_single_segment(-1.0, h.samples()).unwrap(),
            Duration::zero()
        );
    }

    #[test]
    fn test_resolver_step_granularity_no_interpolation() {
        // 0.25 m falls inside the first one-second pair; the full pair is charged.
        let h = history(&[1.0, 1.0]);
        let offset = resolve_single_segment(0.25, h.samples()).unwrap();
        assert_eq!(offset, Duration::seconds(1));
    }

    #[test]
    fn test_resolver_exhaustion_is_an_error() {
        let h = history(&[1.0, 1.0]);
        match resolve_single_segment(3.0, h.samples()) {
            Err(BeltError::InsufficientHistory { remaining }) => {
                assert!((remaining - 2.0).abs() < 1e-12);
            }
            other => panic!("expected InsufficientHistory, got {:?}", other),
        }
    }

    #[test]
    fn test_resolver_needs_two_samples() {
        let h = history(&[1.0]);
        assert!(matches!(
            resolve_single_segment(0.5, h.samples()),
            Err(BeltError::InsufficientHistory { .. })
        ));
        assert!(matches!(
            resolve_single_segment(0.5, &[]),
            Err(BeltError::InsufficientHistory { .. })
        ));
    }

    #[test]
    fn test_compose_same_segment() {
        let c = chain(&[4.2, 6.8]);
        let histories = vec![history(&[1.0, 1.0, 1.0]), history(&[1.0, 1.0])];
        let offset = compose_offset(1.0, 3.0, &c, &histories).unwrap();
        assert_eq!(offset, Duration::seconds(2));
    }

    #[test]
    fn test_compose_zero_distance_is_zero_offset() {
        let c = chain(&[4.2, 6.8]);
        let histories = vec![history(&[1.0, 1.0]), history(&[1.0, 1.0])];
        assert_eq!(
            compose_offset(2.0, 2.0, &c, &histories).unwrap(),
            Duration::zero()
        );
    }

    #[test]
    fn test_compose_rejects_reversed_span() {
        let c = chain(&[4.2, 6.8]);
        let histories = vec![history(&[1.0, 1.0]), history(&[1.0, 1.0])];
        // Same segment, current behind sensor.
        assert!(matches!(
            compose_offset(3.0, 1.0, &c, &histories),
            Err(BeltError::InvalidSpan { .. })
        ));
        // Current segment upstream of the sensor segment.
        assert!(matches!(
            compose_offset(5.0, 1.0, &c, &histories),
            Err(BeltError::InvalidSpan { .. })
        ));
    }

    #[test]
    fn test_compose_rejects_history_mismatch() {
        let c = chain(&[4.2, 6.8]);
        let histories = vec![history(&[1.0, 1.0])];
        assert!(matches!(
            compose_offset(0.6, 8.0, &c, &histories),
            Err(BeltError::HistoryMismatch { .. })
        ));
    }

    #[test]
    fn test_compose_two_segments_reference_table() {
        // Sensor at 0.6 m on a 4.2 m segment, material at 8.0 m on the 6.8 m
        // segment behind it. Residuals: 3.6 m to the first boundary, 3.8 m
        // into the second segment.
        //
        // Second segment, 3.8 m at one-second spacing:
        //   0.9 1.7 2.45 3.05 3.55 4.10  -> 6 pairs, 6 s
        // First segment, 3.6 m against samples at least 6 s old:
        //   0.8 1.7 2.70 3.40 4.00       -> 5 pairs, 5 s
        let c = chain(&[4.2, 6.8]);
        let first = history(&[
            1.0, 0.9, 0.8, 0.7, 0.6, 0.5, 0.8, 0.9, 1.0, 0.7, 0.6, 0.9, 1.0, 0.8, 0.5,
        ]);
        let second = history(&[0.9, 0.8, 0.75, 0.6, 0.5, 0.55, 0.7, 0.8, 0.9, 1.0, 0.95]);
        let offset = compose_offset(0.6, 8.0, &c, &[first, second]).unwrap();
        assert_eq!(offset, Duration::seconds(11));
    }

    #[test]
    fn test_compose_subwindow_excludes_newer_samples() {
        // Without the sub-window the first segment would be resolved against
        // its newest (fast) sample and finish in one pair.
        let c = chain(&[1.0, 1.0]);
        let first = history(&[0.5, 0.25, 0.25, 0.25, 0.25]);
        let second = history(&[0.5, 0.5, 0.5]);
        let offset = compose_offset(0.5, 1.5, &c, &[first, second]).unwrap();
        // Second segment: 0.5 m in one pair (1 s). First segment: 0.5 m from
        // 0.25 m/s samples older than 1 s, two pairs (2 s).
        assert_eq!(offset, Duration::seconds(3));
    }

    #[test]
    fn test_compose_boundary_position_needs_no_distance_in_its_segment() {
        // Current position exactly on the boundary: zero residual in the
        // later segment, the whole span resolves in the earlier one.
        let c = chain(&[1.0, 1.0]);
        let first = history(&[0.5, 0.5, 0.5]);
        let second = history(&[0.5, 0.5]);
        let offset = compose_offset(0.5, 1.0, &c, &[first, second]).unwrap();
        assert_eq!(offset, Duration::seconds(1));
    }

    #[test]
    fn test_compose_is_idempotent() {
        let c = chain(&[4.2, 6.8]);
        let histories = vec![
            history(&[
                1.0, 0.9, 0.8, 0.7, 0.6, 0.5, 0.8, 0.9, 1.0, 0.7, 0.6, 0.9, 1.0, 0.8, 0.5,
            ]),
            history(&[0.9, 0.8, 0.75, 0.6, 0.5, 0.55, 0.7, 0.8, 0.9, 1.0, 0.95]),
        ];
        let a = compose_offset(0.6, 8.0, &c, &histories).unwrap();
        let b = compose_offset(0.6, 8.0, &c, &histories).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_widening_history_recovers_from_exhaustion() {
        let c = chain(&[10.0]);
        let short = vec![history(&[1.0, 1.0, 1.0])];
        assert!(matches!(
            compose_offset(0.0, 9.0, &c, &short),
            Err(BeltError::InsufficientHistory { .. })
        ));

        // Same request with consistent older samples appended now succeeds,
        // and covers at least the span the short history could not.
        let wide = vec![history(&[1.0; 10])];
        let offset = compose_offset(0.0, 9.0, &c, &wide).unwrap();
        assert_eq!(offset, Duration::seconds(9));
        assert!(offset > Duration::seconds(2));
    }
}
