//! Writers for translated events.
//!
//! Polarity events go to CSV with a configurable column order or to a
//! compact binary file; special and IMU6 events go to CSV; frames are
//! written as 16-bit binary PGM images.

use crate::packet::{EventPacket, EventPacketContainer};
use crate::types::{FrameEvent, Imu6Event, PolarityEvent, SpecialEvent};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during output writing.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Column order of the polarity CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldOrder {
    /// t, x, y, p
    #[default]
    TXYP,
    /// x, y, p, t
    XYPT,
    /// Any other permutation, as indices into (x, y, p, t)
    Custom([usize; 4]),
}

const FIELD_NAMES: [&str; 4] = ["x", "y", "polarity", "timestamp"];

impl std::str::FromStr for FieldOrder {
    type Err = OutputError;

    /// Parses a field order such as "t,x,y,p".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<String> = s.split(',').map(|p| p.trim().to_lowercase()).collect();

        if parts.len() != 4 {
            return Err(OutputError::InvalidFormat(
                "Format must have exactly 4 fields: x, y, p, t".to_string(),
            ));
        }

        let mut indices = [0usize; 4];
        let mut used = [false; 4];

        for (i, part) in parts.iter().enumerate() {
            let field_idx = match part.as_str() {
                "x" => 0,
                "y" => 1,
                "p" | "pol" | "polarity" => 2,
                "t" | "ts" | "timestamp" => 3,
                _ => {
                    return Err(OutputError::InvalidFormat(format!(
                        "Unknown field: {}. Use x, y, p, t",
                        part
                    )))
                }
            };

            if used[field_idx] {
                return Err(OutputError::InvalidFormat(format!("Duplicate field: {}", part)));
            }

            indices[i] = field_idx;
            used[field_idx] = true;
        }

        Ok(match indices {
            [3, 0, 1, 2] => Self::TXYP,
            [0, 1, 2, 3] => Self::XYPT,
            other => Self::Custom(other),
        })
    }
}

impl FieldOrder {
    fn indices(&self) -> [usize; 4] {
        match self {
            Self::TXYP => [3, 0, 1, 2],
            Self::XYPT => [0, 1, 2, 3],
            Self::Custom(indices) => *indices,
        }
    }

    /// CSV header line for this order.
    pub fn header(&self) -> String {
        self.indices().map(|i| FIELD_NAMES[i]).join(",")
    }
}

/// CSV writer for polarity events. Timestamps are written as full 64-bit
/// values.
pub struct PolarityCsvWriter<W: Write> {
    writer: BufWriter<W>,
    field_order: FieldOrder,
}

impl<W: Write> PolarityCsvWriter<W> {
    pub fn new(writer: W, field_order: FieldOrder) -> Self {
        Self {
            writer: BufWriter::new(writer),
            field_order,
        }
    }

    /// Writes the array geometry line and the column header.
    pub fn write_header(&mut self, geometry: Option<(u16, u16)>) -> Result<(), OutputError> {
        if let Some((width, height)) = geometry {
            writeln!(self.writer, "%geometry:{},{}", width, height)?;
        }
        writeln!(self.writer, "{}", self.field_order.header())?;
        Ok(())
    }

    pub fn write_packet(&mut self, packet: &EventPacket<PolarityEvent>) -> Result<(), OutputError> {
        for event in packet {
            self.write_event(event, packet.full_timestamp(event))?;
        }
        Ok(())
    }

    #[inline]
    fn write_event(&mut self, event: &PolarityEvent, timestamp: i64) -> Result<(), OutputError> {
        match self.field_order {
            FieldOrder::TXYP => writeln!(
                self.writer,
                "{},{},{},{}",
                timestamp, event.x, event.y, event.polarity as u8
            )?,
            FieldOrder::XYPT => writeln!(
                self.writer,
                "{},{},{},{}",
                event.x, event.y, event.polarity as u8, timestamp
            )?,
            FieldOrder::Custom(indices) => {
                let values = [event.x as i64, event.y as i64, event.polarity as i64, timestamp];
                writeln!(
                    self.writer,
                    "{},{},{},{}",
                    values[indices[0]], values[indices[1]], values[indices[2]], values[indices[3]]
                )?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// CSV writer for special events: `timestamp,type,data`.
pub struct SpecialCsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> SpecialCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(self.writer, "timestamp,type,data")?;
        Ok(())
    }

    pub fn write_packet(&mut self, packet: &EventPacket<SpecialEvent>) -> Result<(), OutputError> {
        for event in packet {
            // Epoch markers carry i32::MAX and no meaningful time.
            let timestamp = if event.timestamp == i32::MAX {
                i64::from(i32::MAX)
            } else {
                packet.full_timestamp(event)
            };
            writeln!(self.writer, "{},{},{}", timestamp, event.kind.name(), event.data)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// CSV writer for IMU6 samples.
pub struct ImuCsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> ImuCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(
            self.writer,
            "timestamp,accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z,temperature"
        )?;
        Ok(())
    }

    pub fn write_packet(&mut self, packet: &EventPacket<Imu6Event>) -> Result<(), OutputError> {
        for event in packet {
            writeln!(
                self.writer,
                "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.3}",
                packet.full_timestamp(event),
                event.accel_x,
                event.accel_y,
                event.accel_z,
                event.gyro_x,
                event.gyro_y,
                event.gyro_z,
                event.temperature
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Binary polarity output.
///
/// Header: magic `DAVISBIN`, version (u32), width (u32), height (u32).
/// Each event is 16 bytes, little-endian:
/// - x: u16
/// - y: u16
/// - polarity: u8, followed by 3 padding bytes
/// - timestamp: i64 (full 64-bit)
///
/// The event count is not stored; readers stop at end of file.
pub struct BinaryWriter<W: Write> {
    writer: BufWriter<W>,
    written: u64,
}

pub const BINARY_MAGIC: &[u8; 8] = b"DAVISBIN";
pub const BINARY_VERSION: u32 = 1;

impl<W: Write> BinaryWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            written: 0,
        }
    }

    pub fn write_header(&mut self, width: u16, height: u16) -> Result<(), OutputError> {
        self.writer.write_all(BINARY_MAGIC)?;
        self.writer.write_u32::<LittleEndian>(BINARY_VERSION)?;
        self.writer.write_u32::<LittleEndian>(width as u32)?;
        self.writer.write_u32::<LittleEndian>(height as u32)?;
        Ok(())
    }

    pub fn write_packet(&mut self, packet: &EventPacket<PolarityEvent>) -> Result<(), OutputError> {
        for event in packet {
            self.writer.write_u16::<LittleEndian>(event.x)?;
            self.writer.write_u16::<LittleEndian>(event.y)?;
            self.writer.write_all(&[event.polarity as u8, 0, 0, 0])?;
            self.writer.write_i64::<LittleEndian>(packet.full_timestamp(event))?;
        }
        self.written += packet.len() as u64;
        Ok(())
    }

    /// Events written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes one frame as a binary PGM (P5, maxval 65535, big-endian
/// samples). Multi-channel frames are written as their first channel.
pub fn write_pgm<W: Write>(writer: W, frame: &FrameEvent) -> Result<(), OutputError> {
    if frame.channels == 0 {
        return Err(OutputError::InvalidFormat("frame without channels".to_string()));
    }
    let expected = frame.width as usize * frame.height as usize * frame.channels as usize;
    if frame.pixels.len() != expected {
        return Err(OutputError::InvalidFormat(format!(
            "frame has {} samples, expected {}",
            frame.pixels.len(),
            expected
        )));
    }

    let mut writer = BufWriter::new(writer);
    write!(writer, "P5\n{} {}\n65535\n", frame.width, frame.height)?;
    for sample in frame.pixels.iter().step_by(frame.channels as usize) {
        writer.write_u16::<BigEndian>(*sample)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes a frame to `path` as PGM.
pub fn write_pgm_file<P: AsRef<Path>>(path: P, frame: &FrameEvent) -> Result<(), OutputError> {
    let file = File::create(path)?;
    write_pgm(file, frame)
}

/// Writes every polarity event of `containers` to a CSV file.
pub fn write_polarity_csv<P: AsRef<Path>>(
    path: P,
    containers: &[EventPacketContainer],
    geometry: Option<(u16, u16)>,
    field_order: FieldOrder,
) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = PolarityCsvWriter::new(file, field_order);
    writer.write_header(geometry)?;
    for packet in containers.iter().filter_map(|c| c.polarity.as_ref()) {
        writer.write_packet(packet)?;
    }
    writer.flush()?;
    Ok(())
}
