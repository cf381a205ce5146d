//! Core conveyor chain time-offset reconstruction library implemented in Rust.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod capture;
pub mod chain;
pub mod offset;
pub mod sync;

pub use chain::{Chain, ChainConfig, Segment, SegmentPosition};
pub use offset::{compose_offset, resolve_single_segment};
pub use sync::{correlate, Correlation, SpeedProvider, SyncParams};

/// Timestamp format used in speed tables and analyser capture rows.
pub const TABLE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Error, Debug)]
pub enum BeltError {
    #[error("position {position} m outside chain of length {chain_len} m")]
    PositionOutOfRange { position: f64, chain_len: f64 },
    #[error("current position {current} m lies behind sensor position {sensor} m")]
    InvalidSpan { sensor: f64, current: f64 },
    #[error("speed history exhausted with {remaining:.3} m left to cover")]
    InsufficientHistory { remaining: f64 },
    #[error("chain has {segments} segments but {histories} speed histories were supplied")]
    HistoryMismatch { segments: usize, histories: usize },
    #[error("fetch ceiling of {max} samples reached without covering the span")]
    FetchLimitExhausted { max: usize },
    #[error("failed to parse speed table: {0}")]
    SpeedTable(String),
    #[error("invalid chain configuration: {0}")]
    ChainConfig(String),
    #[error("invalid sensor configuration: {0}")]
    SensorConfig(String),
    #[error("no capture files matching prefix '{0}'")]
    NoCapture(String),
    #[error("capture scan failed: {0}")]
    CaptureScan(String),
}

/// One historical reading of a segment's speed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    pub timestamp: DateTime<Utc>,
    /// Speed in m/s, already calibrated for the segment it belongs to.
    pub speed: f64,
}

/// Speed readings for exactly one segment, newest-first.
///
/// Any interval needs a pair of consecutive timestamps, so a history shorter
/// than two samples cannot cover any distance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpeedHistory {
    samples: Vec<SpeedSample>,
}

impl SpeedHistory {
    /// Build a history from samples in any order; stored newest-first.
    pub fn new(mut samples: Vec<SpeedSample>) -> Self {
        samples.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Self { samples }
    }

    pub fn samples(&self) -> &[SpeedSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn newest(&self) -> Option<&SpeedSample> {
        self.samples.first()
    }

    /// Keep at most the `limit` most recent samples.
    pub fn truncated(mut self, limit: usize) -> Self {
        self.samples.truncate(limit);
        self
    }

    /// Multiply every reading by a segment calibration factor.
    pub fn calibrated(&self, factor: f64) -> Self {
        Self {
            samples: self
                .samples
                .iter()
                .map(|s| SpeedSample {
                    timestamp: s.timestamp,
                    speed: s.speed * factor,
                })
                .collect(),
        }
    }

    /// Samples at least `age` older than the newest sample of this history.
    pub fn window_older_than(&self, age: chrono::Duration) -> &[SpeedSample] {
        let newest = match self.samples.first() {
            Some(sample) => sample.timestamp,
            None => return &[],
        };
        match self
            .samples
            .iter()
            .position(|s| newest - s.timestamp >= age)
        {
            Some(start) => &self.samples[start..],
            None => &[],
        }
    }
}

/// Parse a `;`-delimited `timestamp;raw_speed` table into raw speed samples.
///
/// A leading header row is tolerated; readings are returned in file order and
/// are not calibrated.
pub fn parse_speed_table(input: &[u8]) -> Result<Vec<SpeedSample>, BeltError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let mut out = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| BeltError::SpeedTable(e.to_string()))?;
        let time_field = record
            .get(0)
            .ok_or_else(|| BeltError::SpeedTable(format!("row {}: missing timestamp", row + 1)))?;
        let timestamp = match NaiveDateTime::parse_from_str(time_field.trim(), TABLE_TIME_FORMAT) {
            Ok(naive) => Utc.from_utc_datetime(&naive),
            Err(_) if row == 0 => continue,
            Err(e) => {
                return Err(BeltError::SpeedTable(format!(
                    "row {}: bad timestamp '{}': {}",
                    row + 1,
                    time_field,
                    e
                )))
            }
        };
        let speed_field = record
            .get(1)
            .ok_or_else(|| BeltError::SpeedTable(format!("row {}: missing speed", row + 1)))?;
        let speed: f64 = speed_field.trim().parse().map_err(|_| {
            BeltError::SpeedTable(format!("row {}: bad speed '{}'", row + 1, speed_field))
        })?;
        out.push(SpeedSample { timestamp, speed });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(offset_s: i64, speed: f64) -> SpeedSample {
        let t0 = Utc.with_ymd_and_hms(2018, 5, 24, 14, 0, 0).unwrap();
        SpeedSample {
            timestamp: t0 - Duration::seconds(offset_s),
            speed,
        }
    }

    #[test]
    fn test_history_sorts_newest_first() {
        let history = SpeedHistory::new(vec![sample(2, 0.5), sample(0, 1.0), sample(1, 0.7)]);
        let speeds: Vec<f64> = history.samples().iter().map(|s| s.speed).collect();
        assert_eq!(speeds, vec![1.0, 0.7, 0.5]);
    }

    #[test]
    fn test_window_older_than() {
        let history = SpeedHistory::new(vec![
            sample(0, 1.0),
            sample(1, 0.9),
            sample(2, 0.8),
            sample(3, 0.7),
        ]);
        let window = history.window_older_than(Duration::seconds(2));
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].speed, 0.8);

        assert!(history.window_older_than(Duration::seconds(10)).is_empty());
        assert_eq!(history.window_older_than(Duration::zero()).len(), 4);
    }

    #[test]
    fn test_calibration_scales_readings() {
        // 1900 rpm at a 1/3800 factor is 0.5 m/s belt speed.
        let history = SpeedHistory::new(vec![sample(0, 1900.0), sample(1, 3800.0)]);
        let calibrated = history.calibrated(1.0 / 3800.0);
        assert!((calibrated.samples()[0].speed - 0.5).abs() < 1e-12);
        assert!((calibrated.samples()[1].speed - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_speed_table() {
        let input = b"time;value\n2018-05-24 13:53:13.601;1900\n2018-05-24 13:53:12.601;3800\n";
        let samples = parse_speed_table(input).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].speed, 1900.0);
        assert_eq!(
            samples[0].timestamp - samples[1].timestamp,
            Duration::seconds(1)
        );
    }

    #[test]
    fn test_parse_speed_table_rejects_bad_rows() {
        let input = b"2018-05-24 13:53:13.601;1900\nnot-a-time;42\n";
        assert!(matches!(
            parse_speed_table(input),
            Err(BeltError::SpeedTable(_))
        ));
    }
}
