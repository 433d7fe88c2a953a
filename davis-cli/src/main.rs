//! Replays recorded DAVIS USB streams.
//!
//! A capture file holds the concatenated payloads of the data endpoint's bulk
//! transfers. It is fed through a full device session, exactly like a live
//! camera, and the resulting events are written to files.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use davis_core::config::{data_exchange, MemoryRegisters, SessionConfig};
use davis_core::output::{
    write_pgm_file, BinaryWriter, ImuCsvWriter, PolarityCsvWriter, SpecialCsvWriter,
};
use davis_core::transport::ReaderTransport;
use davis_core::{ChipVariant, DataCallbacks, DeviceInfo, DeviceSession, EventPacketContainer, FieldOrder};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

/// Sensor the capture was recorded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Chip {
    Davis240a,
    Davis240b,
    Davis240c,
    Davis128,
    Davis346,
    Davis640,
    Davis640h,
    Davis208,
    Dvxplorer,
}

impl From<Chip> for ChipVariant {
    fn from(chip: Chip) -> Self {
        match chip {
            Chip::Davis240a => ChipVariant::Davis240A,
            Chip::Davis240b => ChipVariant::Davis240B,
            Chip::Davis240c => ChipVariant::Davis240C,
            Chip::Davis128 => ChipVariant::Davis128,
            Chip::Davis346 => ChipVariant::Davis346,
            Chip::Davis640 => ChipVariant::Davis640,
            Chip::Davis640h => ChipVariant::Davis640H,
            Chip::Davis208 => ChipVariant::Davis208,
            Chip::Dvxplorer => ChipVariant::MipiCx3,
        }
    }
}

/// Replay a recorded DAVIS / DVXplorer USB stream.
///
/// Polarity events go to OUTPUT; the format is chosen by its extension:
/// - .csv: comma-separated values
/// - .bin: compact binary (16 bytes per event)
#[derive(Parser, Debug)]
#[command(name = "davis-replay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capture file of concatenated transfer payloads
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Polarity output (.csv or .bin)
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Sensor that produced the capture
    #[arg(short, long, value_enum, default_value_t = Chip::Davis346)]
    chip: Chip,

    /// Column order of the polarity CSV (x, y, p, t)
    #[arg(short, long, default_value = "t,x,y,p")]
    format: String,

    /// Session configuration (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write special events to this CSV
    #[arg(long, value_name = "PATH")]
    specials: Option<PathBuf>,

    /// Write IMU6 samples to this CSV
    #[arg(long, value_name = "PATH")]
    imu: Option<PathBuf>,

    /// Write each frame as a PGM image into this directory
    #[arg(long, value_name = "DIR")]
    frames: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) -> LevelFilter {
    use env_logger::Builder;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "[{} {}] {}", record.level(), record.target(), record.args()))
        .init();

    level
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
    toml::from_str(&text).with_context(|| format!("Invalid config {:?}", path))
}

enum PolaritySink {
    Csv(PolarityCsvWriter<File>),
    Binary(BinaryWriter<File>),
}

impl PolaritySink {
    fn create(path: &Path, field_order: FieldOrder, geometry: (u16, u16)) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("csv")
            .to_lowercase();
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;

        match ext.as_str() {
            "csv" => {
                let mut writer = PolarityCsvWriter::new(file, field_order);
                writer.write_header(Some(geometry))?;
                Ok(Self::Csv(writer))
            }
            "bin" => {
                let mut writer = BinaryWriter::new(file);
                writer.write_header(geometry.0, geometry.1)?;
                Ok(Self::Binary(writer))
            }
            other => anyhow::bail!("Unsupported output format: .{}. Use .csv or .bin", other),
        }
    }
}

/// Every configured output.
struct Sinks {
    polarity: PolaritySink,
    specials: Option<SpecialCsvWriter<File>>,
    imu: Option<ImuCsvWriter<File>>,
    frames: Option<PathBuf>,
    frame_count: usize,
    event_count: usize,
}

impl Sinks {
    fn write(&mut self, container: &EventPacketContainer) -> Result<()> {
        if let Some(packet) = &container.polarity {
            match &mut self.polarity {
                PolaritySink::Csv(writer) => writer.write_packet(packet)?,
                PolaritySink::Binary(writer) => writer.write_packet(packet)?,
            }
            self.event_count += packet.len();
        }

        if let (Some(writer), Some(packet)) = (self.specials.as_mut(), &container.special) {
            writer.write_packet(packet)?;
        }

        if let (Some(writer), Some(packet)) = (self.imu.as_mut(), &container.imu6) {
            writer.write_packet(packet)?;
        }

        if let (Some(dir), Some(packet)) = (&self.frames, &container.frame) {
            for frame in packet {
                let path = dir.join(format!("frame_{:06}.pgm", self.frame_count));
                write_pgm_file(&path, frame).with_context(|| format!("Failed to write {:?}", path))?;
                self.frame_count += 1;
            }
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        match &mut self.polarity {
            PolaritySink::Csv(writer) => writer.flush()?,
            PolaritySink::Binary(writer) => writer.flush()?,
        }
        if let Some(writer) = self.specials.as_mut() {
            writer.flush()?;
        }
        if let Some(writer) = self.imu.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

fn csv_writer<T>(path: Option<&Path>, make: impl FnOnce(File) -> T) -> Result<Option<T>> {
    path.map(|path| {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        Ok(make(file))
    })
    .transpose()
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = init_logging(args.verbose, args.quiet);

    let field_order =
        FieldOrder::from_str(&args.format).context("Invalid field format. Use comma-separated: t,x,y,p")?;

    let mut config = load_config(args.config.as_deref())?;
    if args.verbose > 0 {
        config.log_level = level.to_string();
    }

    let info = DeviceInfo::for_chip(args.chip.into(), 1);
    let bus = MemoryRegisters::for_device(&info);
    let input = File::open(&args.input).with_context(|| format!("Failed to open {:?}", args.input))?;
    let transport = ReaderTransport::new(input, config.usb.buffer_size as usize);

    let mut session = DeviceSession::open(Box::new(bus), Some(Box::new(transport)), &config, info.device_id)
        .context("Failed to open replay session")?;
    session.config_set(data_exchange::MODULE, data_exchange::BLOCKING, 1)?;

    if let Some(dir) = &args.frames {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }

    let mut specials = csv_writer(args.specials.as_deref(), SpecialCsvWriter::new)?;
    if let Some(writer) = specials.as_mut() {
        writer.write_header()?;
    }
    let mut imu = csv_writer(args.imu.as_deref(), ImuCsvWriter::new)?;
    if let Some(writer) = imu.as_mut() {
        writer.write_header()?;
    }

    let mut sinks = Sinks {
        polarity: PolaritySink::create(&args.output, field_order, info.dvs_output_size())?,
        specials,
        imu,
        frames: args.frames.clone(),
        frame_count: 0,
        event_count: 0,
    };

    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .context("Invalid progress template")?,
        );
        pb
    };

    let start_time = Instant::now();
    progress.set_message(format!(
        "Replaying {:?}...",
        args.input.file_name().unwrap_or_default()
    ));

    session.data_start(DataCallbacks::default())?;

    let mut containers = 0usize;
    let result = (|| -> Result<()> {
        // Blocking get returns None once the stream is exhausted.
        while let Some(container) = session.data_get() {
            sinks.write(&container)?;
            containers += 1;
            if containers % 64 == 0 {
                progress.set_message(format!("{} polarity events", sinks.event_count));
                progress.tick();
            }
        }
        Ok(())
    })();

    session.data_stop()?;
    result?;
    sinks.flush()?;

    let total_duration = start_time.elapsed();
    progress.finish_with_message(format!(
        "Done! {} containers, {} polarity events in {:.2}s",
        containers,
        sinks.event_count,
        total_duration.as_secs_f64()
    ));

    if !args.quiet {
        let (width, height) = info.dvs_output_size();
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Output:       {:?}", args.output);
        eprintln!("  Device:       {}", info.device_string);
        eprintln!("  Sensor:       {}x{}", width, height);
        eprintln!("  Containers:   {}", containers);
        eprintln!("  Polarity:     {}", sinks.event_count);
        eprintln!("  Frames:       {}", sinks.frame_count);
        eprintln!("  Dropped:      {}", session.dropped());
        eprintln!("  Duration:     {:.3}s", total_duration.as_secs_f64());
    }

    Ok(())
}
