//! Chain registry: ordered conveyor segments with lengths and calibration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::BeltError;

/// One physical conveyor section.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    /// Section length in meters.
    pub length: f64,
    /// Multiplier turning raw drive readings into m/s.
    pub speed_factor: f64,
}

/// The full conveyor: a single directed chain of segments, position 0 at the
/// start of the first segment.
#[derive(Clone, Debug)]
pub struct Chain {
    segments: Vec<Segment>,
}

/// A chain position resolved to one segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentPosition {
    pub index: usize,
    /// Residual distance in meters from the segment start.
    pub local: f64,
}

impl Chain {
    pub fn new(segments: Vec<Segment>) -> Result<Self, BeltError> {
        if segments.is_empty() {
            return Err(BeltError::ChainConfig("chain has no segments".into()));
        }
        for segment in &segments {
            if !(segment.length > 0.0) {
                return Err(BeltError::ChainConfig(format!(
                    "segment '{}' has non-positive length {}",
                    segment.name, segment.length
                )));
            }
            if !segment.speed_factor.is_finite() || segment.speed_factor <= 0.0 {
                return Err(BeltError::ChainConfig(format!(
                    "segment '{}' has invalid speed factor {}",
                    segment.name, segment.speed_factor
                )));
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_length(&self) -> f64 {
        self.segments.iter().map(|s| s.length).sum()
    }

    /// Map an absolute chain position to (segment index, local offset).
    ///
    /// A position exactly on a cumulative boundary belongs to the segment that
    /// starts there, so `local == 0.0` is valid and assigned to the later
    /// segment. Valid positions span `[0, total_length)`.
    pub fn locate(&self, position: f64) -> Result<SegmentPosition, BeltError> {
        if position < 0.0 {
            return Err(BeltError::PositionOutOfRange {
                position,
                chain_len: self.total_length(),
            });
        }
        let mut start = 0.0;
        for (index, segment) in self.segments.iter().enumerate() {
            let end = start + segment.length;
            if position < end {
                return Ok(SegmentPosition {
                    index,
                    local: position - start,
                });
            }
            start = end;
        }
        Err(BeltError::PositionOutOfRange {
            position,
            chain_len: start,
        })
    }
}

/// On-disk chain registry, one entry per segment in flow order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
    pub segments: Vec<Segment>,
}

impl ChainConfig {
    pub fn load(path: &Path) -> Result<Self, BeltError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BeltError::ChainConfig(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| BeltError::ChainConfig(e.to_string()))
    }

    pub fn into_chain(self) -> Result<Chain, BeltError> {
        Chain::new(self.segments)
    }
}
