//! Fetch-and-retry correlation against a speed store.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::chain::Chain;
use crate::offset::compose_offset;
use crate::{BeltError, SpeedHistory};

/// Source of raw (uncalibrated) speed histories, one per chain segment,
/// newest-first, at most `limit` samples each.
pub trait SpeedProvider {
    fn fetch(&mut self, limit: usize) -> Result<Vec<SpeedHistory>, BeltError>;
}

/// Fetch-window sizing for the widening retry loop.
#[derive(Clone, Copy, Debug)]
pub struct SyncParams {
    /// Samples per segment fetched on the first attempt.
    pub fetch_limit: usize,
    /// Widening step applied after an insufficient-history failure.
    pub fetch_increase: usize,
    /// Hard ceiling; reaching it without coverage is fatal.
    pub max_fetch_limit: usize,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            fetch_limit: 500,
            fetch_increase: 500,
            max_fetch_limit: 5000,
        }
    }
}

/// Outcome of one correlation request.
#[derive(Clone, Copy, Debug)]
pub struct Correlation {
    /// How long ago the material now at the current position passed the sensor.
    pub offset: Duration,
    /// Absolute instant of that passage, anchored to the newest sample of the
    /// current position's segment.
    pub instant: DateTime<Utc>,
}

/// Correlate a sensor position with the material now at `current_position`.
///
/// Fetches speed histories, calibrates them with each segment's speed factor,
/// and composes the offset. Too-short histories widen the fetch window by
/// `fetch_increase` and retry the whole composition; partial results are never
/// reused. Reaching `max_fetch_limit` without coverage fails with
/// [`BeltError::FetchLimitExhausted`].
pub fn correlate<P: SpeedProvider>(
    provider: &mut P,
    chain: &Chain,
    sensor_position: f64,
    current_position: f64,
    params: &SyncParams,
) -> Result<Correlation, BeltError> {
    let current = chain.locate(current_position)?;
    let mut limit = params.fetch_limit.min(params.max_fetch_limit);
    loop {
        let histories = fetch_calibrated(provider, chain, limit)?;
        match compose_offset(sensor_position, current_position, chain, &histories) {
            Ok(offset) => {
                let newest = histories[current.index]
                    .newest()
                    .ok_or(BeltError::InsufficientHistory { remaining: 0.0 })?;
                let instant = newest.timestamp - offset;
                info!(
                    "correlated position {} m with sensor at {} m: {:.3} s ago ({})",
                    current_position,
                    sensor_position,
                    offset.num_milliseconds() as f64 / 1000.0,
                    instant
                );
                return Ok(Correlation { offset, instant });
            }
            Err(BeltError::InsufficientHistory { remaining }) => {
                if limit >= params.max_fetch_limit {
                    warn!(
                        "max fetch limit {} reached with {:.3} m uncovered",
                        params.max_fetch_limit, remaining
                    );
                    return Err(BeltError::FetchLimitExhausted {
                        max: params.max_fetch_limit,
                    });
                }
                debug!(
                    "not enough speed data in {} samples, widening fetch window",
                    limit
                );
                limit = (limit + params.fetch_increase).min(params.max_fetch_limit);
            }
            Err(err) => return Err(err),
        }
    }
}

fn fetch_calibrated<P: SpeedProvider>(
    provider: &mut P,
    chain: &Chain,
    limit: usize,
) -> Result<Vec<SpeedHistory>, BeltError> {
    let raw = provider.fetch(limit)?;
    if raw.len() != chain.len() {
        return Err(BeltError::HistoryMismatch {
            segments: chain.len(),
            histories: raw.len(),
        });
    }
    Ok(raw
        .iter()
        .zip(chain.segments())
        .map(|(history, segment)| history.calibrated(segment.speed_factor))
        .collect())
}
