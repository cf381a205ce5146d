use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use belt_offset::capture::{normalize_csv_names, resolve_capture, split_csv_file, SensorConfig};
use belt_offset::{
    correlate, parse_speed_table, BeltError, Chain, ChainConfig, SpeedHistory, SpeedProvider,
    SyncParams,
};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Conveyor chain sensor correlation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Correlate sensor captures with the material at a chain position
    Sync(SyncArgs),
    /// Normalize analyser capture filenames to their first-row timestamps
    Rename(RenameArgs),
    /// Split an oversized capture CSV into numbered parts
    Split(SplitArgs),
}

#[derive(Parser, Debug)]
struct SyncArgs {
    /// Chain registry JSON (ordered segments with lengths and speed factors)
    #[arg(long, default_value = "chain.json", value_hint = ValueHint::FilePath)]
    chain: PathBuf,

    /// Sensor registry JSON (positions and capture sources)
    #[arg(long, default_value = "sensors.json", value_hint = ValueHint::FilePath)]
    sensors: PathBuf,

    /// Directory holding one `<segment>.csv` speed table per segment
    #[arg(long, default_value = "speeds", value_hint = ValueHint::DirPath)]
    speeds: PathBuf,

    /// Chain position whose current occupant is being traced (meters)
    #[arg(long)]
    current_position: f64,

    /// Output CSV report path (`-` for stdout)
    #[arg(short, long, default_value = "sync.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Samples per segment on the first fetch
    #[arg(long, default_value_t = 500)]
    fetch_limit: usize,

    /// Widening step after an insufficient-history failure
    #[arg(long, default_value_t = 500)]
    fetch_increase: usize,

    /// Hard ceiling on the fetch window
    #[arg(long, default_value_t = 5000)]
    max_fetch_limit: usize,

    /// Report offsets only, skip capture file resolution
    #[arg(long, action = ArgAction::SetTrue)]
    no_files: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct RenameArgs {
    /// Directory holding the raw analyser CSV dumps
    #[arg(value_hint = ValueHint::DirPath)]
    directory: PathBuf,

    /// Filename prefix for normalized captures
    #[arg(long, default_value = "analyser-data_")]
    prefix: String,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct SplitArgs {
    /// Capture CSV to split
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Part filename pattern; `{}` becomes the part number
    #[arg(long, default_value = "part_{}.csv")]
    pattern: String,

    /// Close a part once it holds this many bytes
    #[arg(long, default_value_t = 52_428_800)]
    max_bytes: u64,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

/// Reads one `;`-delimited speed table per segment, newest samples first.
#[derive(Clone)]
struct CsvSpeedProvider {
    paths: Vec<PathBuf>,
}

impl CsvSpeedProvider {
    fn for_chain(chain: &Chain, directory: &Path) -> Result<Self> {
        let mut paths = Vec::with_capacity(chain.len());
        for segment in chain.segments() {
            let path = directory.join(format!("{}.csv", segment.name));
            if !path.is_file() {
                return Err(anyhow!(
                    "missing speed table {} for segment '{}'",
                    path.display(),
                    segment.name
                ));
            }
            paths.push(path);
        }
        Ok(Self { paths })
    }
}

impl SpeedProvider for CsvSpeedProvider {
    fn fetch(&mut self, limit: usize) -> Result<Vec<SpeedHistory>, BeltError> {
        self.paths
            .iter()
            .map(|path| {
                let data = fs::read(path)
                    .map_err(|e| BeltError::SpeedTable(format!("{}: {}", path.display(), e)))?;
                Ok(SpeedHistory::new(parse_speed_table(&data)?).truncated(limit))
            })
            .collect()
    }
}

struct ReportRow {
    sensor: String,
    position: f64,
    offset_s: f64,
    instant: DateTime<Utc>,
    files: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match &cli.command {
        Command::Sync(args) if args.verbose => "debug",
        Command::Rename(args) if args.verbose => "debug",
        Command::Split(args) if args.verbose => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Sync(args) => handle_sync(args),
        Command::Rename(args) => handle_rename(args),
        Command::Split(args) => handle_split(args),
    }
}

fn handle_sync(args: SyncArgs) -> Result<()> {
    let chain = ChainConfig::load(&args.chain)
        .with_context(|| format!("failed to load chain registry {}", args.chain.display()))?
        .into_chain()?;
    let registry = SensorConfig::load(&args.sensors)
        .with_context(|| format!("failed to load sensor registry {}", args.sensors.display()))?;
    if registry.sensors.is_empty() {
        return Err(anyhow!("sensor registry {} is empty", args.sensors.display()));
    }

    let provider = CsvSpeedProvider::for_chain(&chain, &args.speeds)?;
    let params = SyncParams {
        fetch_limit: args.fetch_limit.max(1),
        fetch_increase: args.fetch_increase.max(1),
        max_fetch_limit: args.max_fetch_limit.max(args.fetch_limit.max(1)),
    };

    info!(
        "correlating {} sensors against position {} m on a {:.1} m chain",
        registry.sensors.len(),
        args.current_position,
        chain.total_length()
    );

    let rows: Vec<ReportRow> = registry
        .sensors
        .par_iter()
        .map(|sensor| -> Result<ReportRow> {
            let mut provider = provider.clone();
            let correlation = correlate(
                &mut provider,
                &chain,
                sensor.position,
                args.current_position,
                &params,
            )
            .with_context(|| format!("correlation failed for sensor '{}'", sensor.name))?;

            let files = if args.no_files {
                Vec::new()
            } else {
                match resolve_capture(sensor, correlation.instant) {
                    Ok(files) => files,
                    Err(BeltError::NoCapture(prefix)) => {
                        warn!(
                            "sensor '{}': no capture matching '{}' at {}",
                            sensor.name, prefix, correlation.instant
                        );
                        Vec::new()
                    }
                    Err(err) => {
                        return Err(err).with_context(|| {
                            format!("capture lookup failed for sensor '{}'", sensor.name)
                        })
                    }
                }
            };

            Ok(ReportRow {
                sensor: sensor.name.clone(),
                position: sensor.position,
                offset_s: correlation.offset.num_milliseconds() as f64 / 1000.0,
                instant: correlation.instant,
                files,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    for row in &rows {
        info!(
            "sensor '{}' at {} m: capture {:.3} s ago ({})",
            row.sensor, row.position, row.offset_s, row.instant
        );
    }

    if args.output.as_os_str() == "-" {
        write_report_stdout(&rows)?;
    } else {
        write_report_csv(&rows, &args.output)?;
        info!("Wrote sync report: {}", args.output.display());
    }
    Ok(())
}

fn handle_rename(args: RenameArgs) -> Result<()> {
    let renamed = normalize_csv_names(&args.directory, &args.prefix)
        .with_context(|| format!("failed to rename captures in {}", args.directory.display()))?;
    info!(
        "Renamed {} capture files in {}",
        renamed,
        args.directory.display()
    );
    Ok(())
}

fn handle_split(args: SplitArgs) -> Result<()> {
    let parts = split_csv_file(&args.input, &args.pattern, args.max_bytes)
        .with_context(|| format!("failed to split {}", args.input.display()))?;
    info!("Split {} into {} parts", args.input.display(), parts.len());
    Ok(())
}

fn write_report_stdout(rows: &[ReportRow]) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_report_rows(rows, &mut writer)
}

fn write_report_csv(rows: &[ReportRow], path: &Path) -> Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_report_rows(rows, &mut writer)
}

fn write_report_rows<W: io::Write>(rows: &[ReportRow], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record(["sensor", "position_m", "offset_s", "instant", "files"])?;
    for row in rows {
        let files = row
            .files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("|");
        writer.write_record([
            row.sensor.clone(),
            format!("{:.3}", row.position),
            format!("{:.3}", row.offset_s),
            row.instant.to_rfc3339(),
            files,
        ])?;
    }
    writer.flush()?;
    Ok(())
}
