//! Sensor capture files: locating, renaming, and splitting.

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{BeltError, TABLE_TIME_FORMAT};

/// Timestamp embedded in normalized capture filenames.
pub const CAPTURE_NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S%.3f";

/// How a sensor persists its captures.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureSource {
    /// Image dumps matched by filename prefix; the capture nearest to the
    /// requested instant by modification time wins.
    Image {
        directory: PathBuf,
        prefixes: Vec<String>,
    },
    /// Timestamped CSV captures; the latest file starting at or before the
    /// requested instant wins.
    Csv { directory: PathBuf, prefix: String },
}

/// A measurement device mounted at a fixed chain position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sensor {
    pub name: String,
    /// Mounting position in meters from the chain start.
    pub position: f64,
    pub source: CaptureSource,
}

/// On-disk sensor registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sensors: Vec<Sensor>,
}

impl SensorConfig {
    pub fn load(path: &Path) -> Result<Self, BeltError> {
        let text = fs::read_to_string(path)
            .map_err(|e| BeltError::SensorConfig(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| BeltError::SensorConfig(e.to_string()))
    }
}

/// Capture file(s) taken by `sensor` closest to `instant`.
pub fn resolve_capture(sensor: &Sensor, instant: DateTime<Utc>) -> Result<Vec<PathBuf>, BeltError> {
    match &sensor.source {
        CaptureSource::Csv { directory, prefix } => {
            Ok(vec![find_csv_capture(directory, prefix, instant)?])
        }
        CaptureSource::Image {
            directory,
            prefixes,
        } => find_image_captures(directory, prefixes, instant),
    }
}

/// Latest CSV capture whose filename timestamp is at or before `instant`.
pub fn find_csv_capture(
    directory: &Path,
    prefix: &str,
    instant: DateTime<Utc>,
) -> Result<PathBuf, BeltError> {
    let mut candidates: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
    for path in read_dir(directory)? {
        let Some(started) = capture_name_timestamp(&path, prefix) else {
            continue;
        };
        candidates.push((started, path));
    }
    candidates.sort_by_key(|(time, _)| *time);
    candidates
        .into_iter()
        .rev()
        .find(|(time, _)| *time <= instant)
        .map(|(_, path)| path)
        .ok_or_else(|| BeltError::NoCapture(prefix.to_string()))
}

/// One image per prefix, nearest to `instant` by modification time.
pub fn find_image_captures(
    directory: &Path,
    prefixes: &[String],
    instant: DateTime<Utc>,
) -> Result<Vec<PathBuf>, BeltError> {
    let entries = read_dir(directory)?;
    let mut out = Vec::with_capacity(prefixes.len());
    for prefix in prefixes {
        let nearest = entries
            .iter()
            .filter(|path| file_name_starts_with(path, prefix))
            .filter_map(|path| {
                let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
                let modified: DateTime<Utc> = modified.into();
                Some(((modified - instant).num_milliseconds().abs(), path.clone()))
            })
            .min_by_key(|(distance, _)| *distance);
        match nearest {
            Some((_, path)) => out.push(path),
            None => return Err(BeltError::NoCapture(prefix.clone())),
        }
    }
    Ok(out)
}

/// Rewrite analyser CSV filenames to the timestamp of their first row.
///
/// Files with no rows are removed. Returns the number of files renamed.
pub fn normalize_csv_names(directory: &Path, prefix: &str) -> Result<usize, BeltError> {
    let mut renamed = 0usize;
    for path in read_dir(directory)? {
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Some(started) = first_row_timestamp(&path)? else {
            warn!("capture file {} is empty, removing", path.display());
            fs::remove_file(&path).map_err(|e| BeltError::CaptureScan(e.to_string()))?;
            continue;
        };
        let new_name = format!("{}{}.csv", prefix, started.format(CAPTURE_NAME_FORMAT));
        let new_path = directory.join(&new_name);
        if new_path == path {
            continue;
        }
        debug!("renaming {} -> {}", path.display(), new_name);
        fs::rename(&path, &new_path).map_err(|e| BeltError::CaptureScan(e.to_string()))?;
        renamed += 1;
    }
    Ok(renamed)
}

/// Split an oversized capture file into numbered parts on line boundaries.
///
/// `pattern` must contain `{}`, replaced with the zero-padded part number. A
/// part is closed once it holds at least `max_bytes` bytes.
pub fn split_csv_file(
    path: &Path,
    pattern: &str,
    max_bytes: u64,
) -> Result<Vec<PathBuf>, BeltError> {
    if !pattern.contains("{}") {
        return Err(BeltError::CaptureScan(format!(
            "split pattern '{}' has no {{}} placeholder",
            pattern
        )));
    }
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let file = fs::File::open(path).map_err(|e| BeltError::CaptureScan(e.to_string()))?;
    let mut reader = BufReader::new(file);

    let mut parts = Vec::new();
    let mut writer: Option<BufWriter<fs::File>> = None;
    let mut written = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| BeltError::CaptureScan(e.to_string()))?;
        if n == 0 {
            break;
        }
        if writer.is_none() {
            let name = pattern.replace("{}", &format!("{:03}", parts.len() + 1));
            let part_path = directory.join(name);
            let part_file =
                fs::File::create(&part_path).map_err(|e| BeltError::CaptureScan(e.to_string()))?;
            parts.push(part_path);
            writer = Some(BufWriter::new(part_file));
            written = 0;
        }
        let out = writer.as_mut().unwrap();
        out.write_all(line.as_bytes())
            .map_err(|e| BeltError::CaptureScan(e.to_string()))?;
        written += n as u64;
        if written >= max_bytes {
            out.flush().map_err(|e| BeltError::CaptureScan(e.to_string()))?;
            writer = None;
        }
    }
    if let Some(mut out) = writer {
        out.flush().map_err(|e| BeltError::CaptureScan(e.to_string()))?;
    }
    Ok(parts)
}

fn read_dir(directory: &Path) -> Result<Vec<PathBuf>, BeltError> {
    let entries = fs::read_dir(directory)
        .map_err(|e| BeltError::CaptureScan(format!("{}: {}", directory.display(), e)))?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BeltError::CaptureScan(e.to_string()))?;
        let path = entry.path();
        if path.is_file() {
            out.push(path);
        }
    }
    Ok(out)
}

fn file_name_starts_with(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(prefix))
        .unwrap_or(false)
}

fn capture_name_timestamp(path: &Path, prefix: &str) -> Option<DateTime<Utc>> {
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix(prefix)?;
    let naive = NaiveDateTime::parse_from_str(rest, CAPTURE_NAME_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Timestamp of the first data row, read from field 1 of a `;`-delimited file.
fn first_row_timestamp(path: &Path) -> Result<Option<DateTime<Utc>>, BeltError> {
    let file = fs::File::open(path).map_err(|e| BeltError::CaptureScan(e.to_string()))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(file);
    let mut record = csv::StringRecord::new();
    let has_row = reader
        .read_record(&mut record)
        .map_err(|e| BeltError::CaptureScan(e.to_string()))?;
    if !has_row {
        return Ok(None);
    }
    let field = record.get(1).ok_or_else(|| {
        BeltError::CaptureScan(format!("{}: first row has no timestamp field", path.display()))
    })?;
    let naive = NaiveDateTime::parse_from_str(field.trim(), TABLE_TIME_FORMAT).map_err(|e| {
        BeltError::CaptureScan(format!("{}: bad first-row timestamp: {}", path.display(), e))
    })?;
    Ok(Some(Utc.from_utc_datetime(&naive)))
}
