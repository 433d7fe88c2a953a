//! Device configuration façade.
//!
//! Parameters are addressed by `(module, parameter)`. Negative module
//! addresses are host-side settings held in atomics and read by the I/O
//! thread without locking; non-negative addresses are device registers
//! reached through a [`RegisterBus`] after range and capability checks.

use crate::chip::DeviceInfo;
use crate::container::{PacketLimits, DEFAULT_MAX_INTERVAL, DEFAULT_MAX_PACKET_SIZE};
use crate::exchange::{ExchangeSettings, DEFAULT_BUFFER_SIZE};
use crate::logging::{level_filter_from_usize, DeviceLog};
use crossbeam_queue::SegQueue;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors returned by configuration requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown configuration module {0}")]
    UnknownModule(i8),

    #[error("unknown parameter {param} in module {module}")]
    UnknownParameter { module: i8, param: u8 },

    #[error("{0} is not available on this device")]
    NotSupported(Capability),

    #[error("value {value} out of range for parameter {param} in module {module} (max {max})")]
    ValueOutOfRange { module: i8, param: u8, value: u32, max: u32 },

    #[error("parameter {param} in module {module} is read-only")]
    ReadOnly { module: i8, param: u8 },

    #[error("unknown chip identifier {0}")]
    UnknownChip(u16),

    #[error("unknown chip name {0:?}")]
    UnknownChipName(String),

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("register bus error: {0}")]
    Bus(String),
}

// ============================================================================
// Host modules (negative addresses)
// ============================================================================

pub mod usb {
    pub const MODULE: i8 = -1;
    /// Number of in-flight transfers
    pub const BUFFER_NUMBER: u8 = 0;
    /// Bytes per transfer
    pub const BUFFER_SIZE: u8 = 1;
}

pub mod data_exchange {
    pub const MODULE: i8 = -2;
    pub const BUFFER_SIZE: u8 = 0;
    pub const BLOCKING: u8 = 1;
    pub const START_PRODUCERS: u8 = 2;
    pub const STOP_PRODUCERS: u8 = 3;
}

pub mod packets {
    pub const MODULE: i8 = -3;
    pub const MAX_CONTAINER_PACKET_SIZE: u8 = 0;
    pub const MAX_CONTAINER_INTERVAL: u8 = 1;
}

pub mod host_log {
    pub const MODULE: i8 = -4;
    pub const LEVEL: u8 = 0;
}

// ============================================================================
// Device modules
// ============================================================================

pub mod mux {
    pub const MODULE: i8 = 0;
    pub const RUN: u8 = 0;
    pub const TIMESTAMP_RUN: u8 = 1;
    pub const TIMESTAMP_RESET: u8 = 2;
    pub const RUN_CHIP: u8 = 3;
    pub const DROP_EXTINPUT_ON_TRANSFER_STALL: u8 = 4;
    pub const DROP_DVS_ON_TRANSFER_STALL: u8 = 5;
    pub const HAS_STATISTICS: u8 = 80;
}

pub mod dvs {
    pub const MODULE: i8 = 1;
    pub const SIZE_COLUMNS: u8 = 0;
    pub const SIZE_ROWS: u8 = 1;
    pub const ORIENTATION_INFO: u8 = 2;
    pub const RUN: u8 = 3;
    pub const WAIT_ON_TRANSFER_STALL: u8 = 4;
    pub const EXTERNAL_AER_CONTROL: u8 = 5;
    pub const HAS_PIXEL_FILTER: u8 = 10;
    /// Eight row/column pairs follow, rows on odd addresses.
    pub const FILTER_PIXEL_0_ROW: u8 = 11;
    pub const FILTER_PIXEL_7_COLUMN: u8 = 26;
    pub const HAS_BACKGROUND_ACTIVITY_FILTER: u8 = 30;
    pub const FILTER_BACKGROUND_ACTIVITY: u8 = 31;
    pub const FILTER_BACKGROUND_ACTIVITY_TIME: u8 = 32;
    pub const FILTER_REFRACTORY_PERIOD: u8 = 33;
    pub const FILTER_REFRACTORY_PERIOD_TIME: u8 = 34;
    pub const HAS_ROI_FILTER: u8 = 40;
    pub const FILTER_ROI_START_COLUMN: u8 = 41;
    pub const FILTER_ROI_START_ROW: u8 = 42;
    pub const FILTER_ROI_END_COLUMN: u8 = 43;
    pub const FILTER_ROI_END_ROW: u8 = 44;
    pub const HAS_SKIP_FILTER: u8 = 50;
    pub const FILTER_SKIP_EVENTS: u8 = 51;
    pub const FILTER_SKIP_EVENTS_EVERY: u8 = 52;
    pub const HAS_POLARITY_FILTER: u8 = 60;
    pub const FILTER_POLARITY_FLATTEN: u8 = 61;
    pub const FILTER_POLARITY_SUPPRESS: u8 = 62;
    pub const FILTER_POLARITY_SUPPRESS_TYPE: u8 = 63;
    pub const HAS_STATISTICS: u8 = 80;
}

pub mod aps {
    pub const MODULE: i8 = 2;
    pub const SIZE_COLUMNS: u8 = 0;
    pub const SIZE_ROWS: u8 = 1;
    pub const ORIENTATION_INFO: u8 = 2;
    pub const COLOR_FILTER: u8 = 3;
    pub const RUN: u8 = 4;
    pub const HAS_GLOBAL_SHUTTER: u8 = 5;
    pub const GLOBAL_SHUTTER: u8 = 6;
    pub const START_COLUMN_0: u8 = 7;
    pub const START_ROW_0: u8 = 8;
    pub const END_COLUMN_0: u8 = 9;
    pub const END_ROW_0: u8 = 10;
    /// Microseconds on the façade, ADC clock cycles on the device
    pub const EXPOSURE: u8 = 11;
    /// Microseconds on the façade, ADC clock cycles on the device
    pub const FRAME_INTERVAL: u8 = 12;
    pub const RESET_READ: u8 = 13;
    /// Host side
    pub const AUTOEXPOSURE: u8 = 101;
}

pub mod imu {
    pub const MODULE: i8 = 3;
    pub const TYPE: u8 = 0;
    pub const ORIENTATION_INFO: u8 = 1;
    pub const RUN_ACCELEROMETER: u8 = 2;
    pub const RUN_GYROSCOPE: u8 = 3;
    pub const RUN_TEMPERATURE: u8 = 4;
    pub const SAMPLE_RATE_DIVIDER: u8 = 5;
    pub const ACCEL_DLPF: u8 = 6;
    pub const ACCEL_FULL_SCALE: u8 = 7;
    pub const GYRO_DLPF: u8 = 8;
    pub const GYRO_FULL_SCALE: u8 = 9;
}

pub mod extinput {
    pub const MODULE: i8 = 4;
    pub const RUN_DETECTOR: u8 = 0;
    pub const DETECT_RISING_EDGES: u8 = 1;
    pub const DETECT_FALLING_EDGES: u8 = 2;
    pub const DETECT_PULSES: u8 = 3;
    pub const DETECT_PULSE_POLARITY: u8 = 4;
    pub const DETECT_PULSE_LENGTH: u8 = 5;
    pub const HAS_GENERATOR: u8 = 6;
    pub const RUN_GENERATOR: u8 = 7;
    pub const GENERATE_PULSE_POLARITY: u8 = 8;
    pub const GENERATE_PULSE_INTERVAL: u8 = 9;
    pub const GENERATE_PULSE_LENGTH: u8 = 10;
    pub const GENERATE_INJECT_ON_RISING_EDGE: u8 = 11;
    pub const GENERATE_INJECT_ON_FALLING_EDGE: u8 = 12;
}

pub mod sysinfo {
    pub const MODULE: i8 = 6;
    pub const LOGIC_VERSION: u8 = 0;
    pub const CHIP_IDENTIFIER: u8 = 1;
    pub const DEVICE_IS_MASTER: u8 = 2;
    pub const LOGIC_CLOCK: u8 = 3;
    pub const ADC_CLOCK: u8 = 4;
    pub const USB_CLOCK: u8 = 5;
    /// Clock correction factor, in thousandths
    pub const CLOCK_DEVIATION: u8 = 6;
}

// ============================================================================
// Capability gating and validation
// ============================================================================

/// Optional features a parameter can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    PixelFilter,
    BackgroundActivityFilter,
    RoiFilter,
    SkipFilter,
    PolarityFilter,
    Statistics,
    GlobalShutter,
    ExternalGenerator,
    Aps,
    Imu,
    ExternalInput,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PixelFilter => "pixel filter",
            Self::BackgroundActivityFilter => "background-activity filter",
            Self::RoiFilter => "ROI filter",
            Self::SkipFilter => "skip filter",
            Self::PolarityFilter => "polarity filter",
            Self::Statistics => "statistics",
            Self::GlobalShutter => "global shutter",
            Self::ExternalGenerator => "external input generator",
            Self::Aps => "APS",
            Self::Imu => "IMU",
            Self::ExternalInput => "external input",
        };
        f.write_str(name)
    }
}

impl DeviceInfo {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::PixelFilter => self.has_pixel_filter(),
            Capability::BackgroundActivityFilter => self.has_background_activity_filter(),
            Capability::RoiFilter => self.has_roi_filter(),
            Capability::SkipFilter => self.has_skip_filter(),
            Capability::PolarityFilter => self.has_polarity_filter(),
            Capability::Statistics => self.has_statistics(),
            Capability::GlobalShutter => self.has_global_shutter(),
            Capability::ExternalGenerator => self.has_external_generator(),
            Capability::Aps => self.has_aps(),
            Capability::Imu => self.has_imu(),
            Capability::ExternalInput => self.has_external_input(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueRange {
    Bool,
    Max(u32),
    DvsColumn,
    DvsRow,
    ApsColumn,
    ApsRow,
    Any,
}

#[derive(Debug, Clone, Copy)]
struct ParamSpec {
    access: Access,
    range: ValueRange,
    requires: Option<Capability>,
}

impl ParamSpec {
    const fn ro(requires: Option<Capability>) -> Self {
        Self {
            access: Access::ReadOnly,
            range: ValueRange::Any,
            requires,
        }
    }

    const fn rw(range: ValueRange, requires: Option<Capability>) -> Self {
        Self {
            access: Access::ReadWrite,
            range,
            requires,
        }
    }
}

fn module_capability(module: i8) -> Option<Capability> {
    match module {
        aps::MODULE => Some(Capability::Aps),
        imu::MODULE => Some(Capability::Imu),
        extinput::MODULE => Some(Capability::ExternalInput),
        _ => None,
    }
}

fn param_spec(module: i8, param: u8) -> Option<ParamSpec> {
    use Capability::*;
    use ValueRange::*;

    let spec = match module {
        mux::MODULE => match param {
            mux::RUN..=mux::DROP_DVS_ON_TRANSFER_STALL => ParamSpec::rw(Bool, None),
            mux::HAS_STATISTICS => ParamSpec::ro(None),
            _ => return None,
        },
        dvs::MODULE => match param {
            dvs::SIZE_COLUMNS | dvs::SIZE_ROWS | dvs::ORIENTATION_INFO => ParamSpec::ro(None),
            dvs::RUN | dvs::WAIT_ON_TRANSFER_STALL | dvs::EXTERNAL_AER_CONTROL => ParamSpec::rw(Bool, None),
            dvs::HAS_PIXEL_FILTER
            | dvs::HAS_BACKGROUND_ACTIVITY_FILTER
            | dvs::HAS_ROI_FILTER
            | dvs::HAS_SKIP_FILTER
            | dvs::HAS_POLARITY_FILTER
            | dvs::HAS_STATISTICS => ParamSpec::ro(None),
            dvs::FILTER_PIXEL_0_ROW..=dvs::FILTER_PIXEL_7_COLUMN => {
                // Coordinates up to the array size; the size itself disables
                // the filter slot.
                let range = if (param - dvs::FILTER_PIXEL_0_ROW) % 2 == 0 {
                    DvsRow
                } else {
                    DvsColumn
                };
                ParamSpec::rw(range, Some(PixelFilter))
            }
            dvs::FILTER_BACKGROUND_ACTIVITY | dvs::FILTER_REFRACTORY_PERIOD => {
                ParamSpec::rw(Bool, Some(BackgroundActivityFilter))
            }
            dvs::FILTER_BACKGROUND_ACTIVITY_TIME | dvs::FILTER_REFRACTORY_PERIOD_TIME => {
                ParamSpec::rw(Max(0x0FFF), Some(BackgroundActivityFilter))
            }
            dvs::FILTER_ROI_START_COLUMN | dvs::FILTER_ROI_END_COLUMN => ParamSpec::rw(DvsColumn, Some(RoiFilter)),
            dvs::FILTER_ROI_START_ROW | dvs::FILTER_ROI_END_ROW => ParamSpec::rw(DvsRow, Some(RoiFilter)),
            dvs::FILTER_SKIP_EVENTS => ParamSpec::rw(Bool, Some(SkipFilter)),
            dvs::FILTER_SKIP_EVENTS_EVERY => ParamSpec::rw(Max(0xFF), Some(SkipFilter)),
            dvs::FILTER_POLARITY_FLATTEN | dvs::FILTER_POLARITY_SUPPRESS | dvs::FILTER_POLARITY_SUPPRESS_TYPE => {
                ParamSpec::rw(Bool, Some(PolarityFilter))
            }
            _ => return None,
        },
        aps::MODULE => match param {
            aps::SIZE_COLUMNS | aps::SIZE_ROWS | aps::ORIENTATION_INFO | aps::COLOR_FILTER => ParamSpec::ro(None),
            aps::HAS_GLOBAL_SHUTTER => ParamSpec::ro(None),
            aps::RUN | aps::RESET_READ => ParamSpec::rw(Bool, None),
            aps::GLOBAL_SHUTTER => ParamSpec::rw(Bool, Some(GlobalShutter)),
            aps::START_COLUMN_0 | aps::END_COLUMN_0 => ParamSpec::rw(ApsColumn, None),
            aps::START_ROW_0 | aps::END_ROW_0 => ParamSpec::rw(ApsRow, None),
            aps::EXPOSURE | aps::FRAME_INTERVAL => ParamSpec::rw(Max(0x00FF_FFFF), None),
            _ => return None,
        },
        imu::MODULE => match param {
            imu::TYPE | imu::ORIENTATION_INFO => ParamSpec::ro(None),
            imu::RUN_ACCELEROMETER | imu::RUN_GYROSCOPE | imu::RUN_TEMPERATURE => ParamSpec::rw(Bool, None),
            imu::SAMPLE_RATE_DIVIDER => ParamSpec::rw(Max(0xFF), None),
            imu::ACCEL_DLPF | imu::GYRO_DLPF => ParamSpec::rw(Max(7), None),
            imu::ACCEL_FULL_SCALE | imu::GYRO_FULL_SCALE => ParamSpec::rw(Max(3), None),
            _ => return None,
        },
        extinput::MODULE => match param {
            extinput::RUN_DETECTOR..=extinput::DETECT_PULSE_POLARITY => ParamSpec::rw(Bool, None),
            extinput::DETECT_PULSE_LENGTH => ParamSpec::rw(Any, None),
            extinput::HAS_GENERATOR => ParamSpec::ro(None),
            extinput::RUN_GENERATOR | extinput::GENERATE_PULSE_POLARITY => {
                ParamSpec::rw(Bool, Some(ExternalGenerator))
            }
            extinput::GENERATE_PULSE_INTERVAL | extinput::GENERATE_PULSE_LENGTH => {
                ParamSpec::rw(Any, Some(ExternalGenerator))
            }
            extinput::GENERATE_INJECT_ON_RISING_EDGE | extinput::GENERATE_INJECT_ON_FALLING_EDGE => {
                ParamSpec::rw(Bool, Some(ExternalGenerator))
            }
            _ => return None,
        },
        sysinfo::MODULE => match param {
            sysinfo::LOGIC_VERSION..=sysinfo::CLOCK_DEVIATION => ParamSpec::ro(None),
            _ => return None,
        },
        _ => return None,
    };

    Some(spec)
}

fn lookup(info: &DeviceInfo, module: i8, param: u8) -> Result<ParamSpec, ConfigError> {
    if !matches!(module, 0..=4 | 6) {
        return Err(ConfigError::UnknownModule(module));
    }
    if let Some(capability) = module_capability(module) {
        if !info.supports(capability) {
            return Err(ConfigError::NotSupported(capability));
        }
    }

    let spec = param_spec(module, param).ok_or(ConfigError::UnknownParameter { module, param })?;
    if let Some(capability) = spec.requires {
        if !info.supports(capability) {
            return Err(ConfigError::NotSupported(capability));
        }
    }
    Ok(spec)
}

/// Checks a device register write against the device capabilities.
pub fn validate_device_write(info: &DeviceInfo, module: i8, param: u8, value: u32) -> Result<(), ConfigError> {
    let spec = lookup(info, module, param)?;
    if spec.access == Access::ReadOnly {
        return Err(ConfigError::ReadOnly { module, param });
    }

    let (dvs_x, dvs_y) = info.dvs_output_size();
    let (aps_x, aps_y) = info.aps_output_size().unwrap_or((0, 0));
    let max = match spec.range {
        ValueRange::Bool => 1,
        ValueRange::Max(max) => max,
        ValueRange::DvsColumn => dvs_x as u32,
        ValueRange::DvsRow => dvs_y as u32,
        ValueRange::ApsColumn => (aps_x as u32).saturating_sub(1),
        ValueRange::ApsRow => (aps_y as u32).saturating_sub(1),
        ValueRange::Any => u32::MAX,
    };

    if value > max {
        return Err(ConfigError::ValueOutOfRange {
            module,
            param,
            value,
            max,
        });
    }
    Ok(())
}

/// Checks a device register read against the device capabilities.
pub fn validate_device_read(info: &DeviceInfo, module: i8, param: u8) -> Result<(), ConfigError> {
    lookup(info, module, param).map(|_| ())
}

/// Microseconds to ADC clock cycles.
#[inline]
pub fn micros_to_cycles(micros: u32, adc_clock: f32) -> u32 {
    (micros as f32 * adc_clock).round() as u32
}

/// ADC clock cycles to microseconds.
#[inline]
pub fn cycles_to_micros(cycles: u32, adc_clock: f32) -> u32 {
    if adc_clock <= 0.0 {
        return 0;
    }
    (cycles as f32 / adc_clock).round() as u32
}

// ============================================================================
// Register bus
// ============================================================================

/// Transport for device register access (SPI over vendor requests on real
/// hardware).
pub trait RegisterBus: Send {
    fn write(&mut self, module: u8, param: u8, value: u32) -> Result<(), ConfigError>;
    fn read(&mut self, module: u8, param: u8) -> Result<u32, ConfigError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    registers: HashMap<(u8, u8), u32>,
    writes: Vec<(u8, u8, u32)>,
}

/// Register bus backed by memory. Clones share the same registers, so a
/// handle kept outside a session can observe its writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegisters {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-loads the identification and capability registers of `info`.
    pub fn for_device(info: &DeviceInfo) -> Self {
        let registers = Self::new();
        let sensor_bits = |o: &crate::chip::Orientation| {
            (o.invert_xy as u32) << 2 | (o.flip_x as u32) << 1 | o.flip_y as u32
        };
        let caps = &info.capabilities;
        let sys = sysinfo::MODULE as u8;
        let dvs_m = dvs::MODULE as u8;

        registers.set(sys, sysinfo::CHIP_IDENTIFIER, info.chip.id() as u32);
        registers.set(sys, sysinfo::DEVICE_IS_MASTER, info.is_master as u32);
        registers.set(sys, sysinfo::LOGIC_VERSION, info.logic_version);
        registers.set(sys, sysinfo::ADC_CLOCK, info.adc_clock.round() as u32);
        registers.set(sys, sysinfo::CLOCK_DEVIATION, 1000);

        registers.set(dvs_m, dvs::SIZE_COLUMNS, info.dvs_size.0 as u32);
        registers.set(dvs_m, dvs::SIZE_ROWS, info.dvs_size.1 as u32);
        registers.set(dvs_m, dvs::ORIENTATION_INFO, sensor_bits(&info.dvs_orientation));
        registers.set(dvs_m, dvs::HAS_PIXEL_FILTER, caps.pixel_filter as u32);
        registers.set(dvs_m, dvs::HAS_BACKGROUND_ACTIVITY_FILTER, caps.background_activity_filter as u32);
        registers.set(dvs_m, dvs::HAS_ROI_FILTER, caps.roi_filter as u32);
        registers.set(dvs_m, dvs::HAS_SKIP_FILTER, caps.skip_filter as u32);
        registers.set(dvs_m, dvs::HAS_POLARITY_FILTER, caps.polarity_filter as u32);
        registers.set(dvs_m, dvs::HAS_STATISTICS, caps.statistics as u32);

        if let Some((x, y)) = info.aps_size {
            let aps_m = aps::MODULE as u8;
            registers.set(aps_m, aps::SIZE_COLUMNS, x as u32);
            registers.set(aps_m, aps::SIZE_ROWS, y as u32);
            registers.set(aps_m, aps::ORIENTATION_INFO, sensor_bits(&info.aps_orientation));
            registers.set(aps_m, aps::COLOR_FILTER, info.chip.color_filter() as u32);
            registers.set(aps_m, aps::HAS_GLOBAL_SHUTTER, caps.global_shutter as u32);
            registers.set(aps_m, aps::RESET_READ, 1);
        }

        if info.has_imu() {
            let o = &info.imu_orientation;
            registers.set(
                imu::MODULE as u8,
                imu::ORIENTATION_INFO,
                (o.flip_x as u32) << 2 | (o.flip_y as u32) << 1 | o.flip_z as u32,
            );
        }

        if info.has_external_input() {
            registers.set(
                extinput::MODULE as u8,
                extinput::HAS_GENERATOR,
                caps.external_generator as u32,
            );
        }

        registers
    }

    /// Sets a register without recording a write.
    pub fn set(&self, module: u8, param: u8, value: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.registers.insert((module, param), value);
        }
    }

    pub fn get(&self, module: u8, param: u8) -> Option<u32> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.registers.get(&(module, param)).copied())
    }

    /// All writes issued through the bus, in order.
    pub fn writes(&self) -> Vec<(u8, u8, u32)> {
        self.state.lock().map(|state| state.writes.clone()).unwrap_or_default()
    }
}

impl RegisterBus for MemoryRegisters {
    fn write(&mut self, module: u8, param: u8, value: u32) -> Result<(), ConfigError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ConfigError::Bus("register state poisoned".into()))?;
        state.registers.insert((module, param), value);
        state.writes.push((module, param, value));
        Ok(())
    }

    fn read(&mut self, module: u8, param: u8) -> Result<u32, ConfigError> {
        let state = self
            .state
            .lock()
            .map_err(|_| ConfigError::Bus("register state poisoned".into()))?;
        Ok(state.registers.get(&(module, param)).copied().unwrap_or(0))
    }
}

// ============================================================================
// Host-side runtime state
// ============================================================================

pub const DEFAULT_USB_BUFFER_NUMBER: u32 = 8;
pub const DEFAULT_USB_BUFFER_SIZE: u32 = 8192;

/// A register write issued from the I/O thread, applied at the next safe
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub module: i8,
    pub param: u8,
    pub value: u32,
}

/// Work deferred to the safe point between transfers.
#[derive(Debug, Default)]
pub struct PendingUpdates {
    /// Transfer count or size changed
    pub usb_buffers: AtomicBool,
    /// Master/slave status must be re-read
    pub master_status: AtomicBool,
    pub writes: SegQueue<RegisterWrite>,
}

impl PendingUpdates {
    pub fn push_write(&self, module: i8, param: u8, value: u32) {
        self.writes.push(RegisterWrite { module, param, value });
    }
}

/// Host settings shared between the application and the I/O thread.
#[derive(Debug)]
pub struct HostConfig {
    pub usb_buffer_number: AtomicU32,
    pub usb_buffer_size: AtomicU32,
    pub exchange: Arc<ExchangeSettings>,
    pub packets: Arc<PacketLimits>,
    pub autoexposure: Arc<AtomicBool>,
    pub pending: Arc<PendingUpdates>,
    pub log: DeviceLog,
}

fn bool_value(module: i8, param: u8, value: u32) -> Result<bool, ConfigError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ConfigError::ValueOutOfRange {
            module,
            param,
            value,
            max: 1,
        }),
    }
}

fn non_zero(module: i8, param: u8, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        // Zero transfers or a zero-sized queue cannot work.
        return Err(ConfigError::ValueOutOfRange {
            module,
            param,
            value,
            max: u32::MAX,
        });
    }
    Ok(value)
}

impl HostConfig {
    pub fn new(config: &SessionConfig, log: DeviceLog) -> Self {
        let exchange = ExchangeSettings::default();
        exchange
            .buffer_size
            .store(config.data_exchange.buffer_size.max(1), Ordering::Relaxed);
        exchange.blocking.store(config.data_exchange.blocking, Ordering::Relaxed);
        exchange
            .start_producers
            .store(config.data_exchange.start_producers, Ordering::Relaxed);
        exchange
            .stop_producers
            .store(config.data_exchange.stop_producers, Ordering::Relaxed);

        let packets = PacketLimits::default();
        packets
            .max_packet_size
            .store(config.packets.max_packet_size, Ordering::Relaxed);
        packets.max_interval.store(config.packets.max_interval, Ordering::Relaxed);

        Self {
            usb_buffer_number: AtomicU32::new(config.usb.buffer_number.max(1)),
            usb_buffer_size: AtomicU32::new(config.usb.buffer_size.max(1)),
            exchange: Arc::new(exchange),
            packets: Arc::new(packets),
            autoexposure: Arc::new(AtomicBool::new(config.aps.autoexposure)),
            pending: Arc::new(PendingUpdates::default()),
            log,
        }
    }

    /// True for parameters held on the host, including APS AUTOEXPOSURE.
    pub fn is_host_param(module: i8, param: u8) -> bool {
        module < 0 || (module == aps::MODULE && param == aps::AUTOEXPOSURE)
    }

    pub fn set(&self, module: i8, param: u8, value: u32) -> Result<(), ConfigError> {
        match (module, param) {
            (usb::MODULE, usb::BUFFER_NUMBER) => {
                self.usb_buffer_number
                    .store(non_zero(module, param, value)?, Ordering::Relaxed);
                self.pending.usb_buffers.store(true, Ordering::Release);
            }
            (usb::MODULE, usb::BUFFER_SIZE) => {
                self.usb_buffer_size
                    .store(non_zero(module, param, value)?, Ordering::Relaxed);
                self.pending.usb_buffers.store(true, Ordering::Release);
            }
            (data_exchange::MODULE, data_exchange::BUFFER_SIZE) => {
                self.exchange
                    .buffer_size
                    .store(non_zero(module, param, value)?, Ordering::Relaxed);
            }
            (data_exchange::MODULE, data_exchange::BLOCKING) => {
                self.exchange
                    .blocking
                    .store(bool_value(module, param, value)?, Ordering::Relaxed);
            }
            (data_exchange::MODULE, data_exchange::START_PRODUCERS) => {
                self.exchange
                    .start_producers
                    .store(bool_value(module, param, value)?, Ordering::Relaxed);
            }
            (data_exchange::MODULE, data_exchange::STOP_PRODUCERS) => {
                self.exchange
                    .stop_producers
                    .store(bool_value(module, param, value)?, Ordering::Relaxed);
            }
            (packets::MODULE, packets::MAX_CONTAINER_PACKET_SIZE) => {
                self.packets.max_packet_size.store(value, Ordering::Relaxed);
            }
            (packets::MODULE, packets::MAX_CONTAINER_INTERVAL) => {
                self.packets.max_interval.store(value, Ordering::Relaxed);
            }
            (host_log::MODULE, host_log::LEVEL) => {
                if value > LevelFilter::Trace as u32 {
                    return Err(ConfigError::ValueOutOfRange {
                        module,
                        param,
                        value,
                        max: LevelFilter::Trace as u32,
                    });
                }
                self.log.set_level(level_filter_from_usize(value as usize));
            }
            (aps::MODULE, aps::AUTOEXPOSURE) => {
                self.autoexposure
                    .store(bool_value(module, param, value)?, Ordering::Relaxed);
            }
            _ if matches!(module, -4..=-1) => return Err(ConfigError::UnknownParameter { module, param }),
            _ => return Err(ConfigError::UnknownModule(module)),
        }
        Ok(())
    }

    pub fn get(&self, module: i8, param: u8) -> Result<u32, ConfigError> {
        let value = match (module, param) {
            (usb::MODULE, usb::BUFFER_NUMBER) => self.usb_buffer_number.load(Ordering::Relaxed),
            (usb::MODULE, usb::BUFFER_SIZE) => self.usb_buffer_size.load(Ordering::Relaxed),
            (data_exchange::MODULE, data_exchange::BUFFER_SIZE) => {
                self.exchange.buffer_size.load(Ordering::Relaxed)
            }
            (data_exchange::MODULE, data_exchange::BLOCKING) => self.exchange.blocking.load(Ordering::Relaxed) as u32,
            (data_exchange::MODULE, data_exchange::START_PRODUCERS) => {
                self.exchange.start_producers.load(Ordering::Relaxed) as u32
            }
            (data_exchange::MODULE, data_exchange::STOP_PRODUCERS) => {
                self.exchange.stop_producers.load(Ordering::Relaxed) as u32
            }
            (packets::MODULE, packets::MAX_CONTAINER_PACKET_SIZE) => {
                self.packets.max_packet_size.load(Ordering::Relaxed)
            }
            (packets::MODULE, packets::MAX_CONTAINER_INTERVAL) => self.packets.max_interval.load(Ordering::Relaxed),
            (host_log::MODULE, host_log::LEVEL) => self.log.level() as u32,
            (aps::MODULE, aps::AUTOEXPOSURE) => self.autoexposure.load(Ordering::Relaxed) as u32,
            _ if matches!(module, -4..=-1) => return Err(ConfigError::UnknownParameter { module, param }),
            _ => return Err(ConfigError::UnknownModule(module)),
        };
        Ok(value)
    }
}

// ============================================================================
// Session configuration (serde)
// ============================================================================

/// Initial settings of a session, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub usb: UsbConfig,
    pub data_exchange: DataExchangeConfig,
    pub packets: PacketsConfig,
    pub aps: ApsConfig,
    pub imu: ImuConfig,
    /// One of off, error, warn, info, debug, trace
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            usb: UsbConfig::default(),
            data_exchange: DataExchangeConfig::default(),
            packets: PacketsConfig::default(),
            aps: ApsConfig::default(),
            imu: ImuConfig::default(),
            log_level: "warn".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn log_level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub buffer_number: u32,
    pub buffer_size: u32,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            buffer_number: DEFAULT_USB_BUFFER_NUMBER,
            buffer_size: DEFAULT_USB_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataExchangeConfig {
    pub buffer_size: u32,
    pub blocking: bool,
    pub start_producers: bool,
    pub stop_producers: bool,
}

impl Default for DataExchangeConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            blocking: false,
            start_producers: true,
            stop_producers: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketsConfig {
    pub max_packet_size: u32,
    /// Microseconds
    pub max_interval: u32,
}

impl Default for PacketsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApsConfig {
    pub autoexposure: bool,
    pub reset_read: bool,
    pub global_shutter: bool,
    /// Microseconds
    pub exposure: u32,
    /// Microseconds
    pub frame_interval: u32,
}

impl Default for ApsConfig {
    fn default() -> Self {
        Self {
            autoexposure: false,
            reset_read: true,
            global_shutter: true,
            exposure: 4000,
            frame_interval: 40000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// 0: ±2g .. 3: ±16g
    pub accel_full_scale: u8,
    /// 0: ±250°/s .. 3: ±2000°/s
    pub gyro_full_scale: u8,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            accel_full_scale: 1,
            gyro_full_scale: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::ChipVariant;

    fn host() -> HostConfig {
        HostConfig::new(&SessionConfig::default(), DeviceLog::new("test", LevelFilter::Warn))
    }

    #[test]
    fn test_capability_gating() {
        let mut info = DeviceInfo::for_chip(ChipVariant::Davis346, 1);
        assert_eq!(
            validate_device_write(&info, dvs::MODULE, dvs::FILTER_ROI_START_COLUMN, 10),
            Err(ConfigError::NotSupported(Capability::RoiFilter))
        );

        info.capabilities.roi_filter = true;
        assert!(validate_device_write(&info, dvs::MODULE, dvs::FILTER_ROI_START_COLUMN, 10).is_ok());
        assert!(matches!(
            validate_device_write(&info, dvs::MODULE, dvs::FILTER_ROI_END_ROW, 261),
            Err(ConfigError::ValueOutOfRange { max: 260, .. })
        ));
    }

    #[test]
    fn test_missing_module_is_not_supported() {
        let info = DeviceInfo::for_chip(ChipVariant::MipiCx3, 1);
        assert_eq!(
            validate_device_write(&info, aps::MODULE, aps::RUN, 1),
            Err(ConfigError::NotSupported(Capability::Aps))
        );
        assert_eq!(
            validate_device_read(&info, imu::MODULE, imu::TYPE),
            Err(ConfigError::NotSupported(Capability::Imu))
        );
    }

    #[test]
    fn test_read_only_and_unknown() {
        let info = DeviceInfo::for_chip(ChipVariant::Davis240C, 1);
        assert_eq!(
            validate_device_write(&info, sysinfo::MODULE, sysinfo::CHIP_IDENTIFIER, 3),
            Err(ConfigError::ReadOnly {
                module: sysinfo::MODULE,
                param: sysinfo::CHIP_IDENTIFIER
            })
        );
        assert!(validate_device_read(&info, sysinfo::MODULE, sysinfo::CHIP_IDENTIFIER).is_ok());
        assert_eq!(
            validate_device_write(&info, mux::MODULE, 42, 1),
            Err(ConfigError::UnknownParameter {
                module: mux::MODULE,
                param: 42
            })
        );
        assert_eq!(validate_device_write(&info, 5, 0, 1), Err(ConfigError::UnknownModule(5)));
        assert!(matches!(
            validate_device_write(&info, mux::MODULE, mux::RUN, 2),
            Err(ConfigError::ValueOutOfRange { max: 1, .. })
        ));
    }

    #[test]
    fn test_global_shutter_gate() {
        let info = DeviceInfo::for_chip(ChipVariant::Davis240A, 1);
        assert_eq!(
            validate_device_write(&info, aps::MODULE, aps::GLOBAL_SHUTTER, 1),
            Err(ConfigError::NotSupported(Capability::GlobalShutter))
        );
        let info = DeviceInfo::for_chip(ChipVariant::Davis346, 1);
        assert!(validate_device_write(&info, aps::MODULE, aps::GLOBAL_SHUTTER, 1).is_ok());
    }

    #[test]
    fn test_host_params() {
        let host = host();
        assert_eq!(host.get(packets::MODULE, packets::MAX_CONTAINER_INTERVAL), Ok(10000));

        host.set(packets::MODULE, packets::MAX_CONTAINER_PACKET_SIZE, 128).unwrap();
        assert_eq!(host.packets.max_packet_size.load(Ordering::Relaxed), 128);

        assert!(!host.pending.usb_buffers.load(Ordering::Relaxed));
        host.set(usb::MODULE, usb::BUFFER_SIZE, 4096).unwrap();
        assert!(host.pending.usb_buffers.load(Ordering::Relaxed));

        host.set(data_exchange::MODULE, data_exchange::BLOCKING, 1).unwrap();
        assert_eq!(host.get(data_exchange::MODULE, data_exchange::BLOCKING), Ok(1));

        host.set(host_log::MODULE, host_log::LEVEL, LevelFilter::Debug as u32).unwrap();
        assert_eq!(host.log.level(), LevelFilter::Debug);

        assert!(host.set(usb::MODULE, usb::BUFFER_NUMBER, 0).is_err());
        assert!(host.set(data_exchange::MODULE, data_exchange::BLOCKING, 3).is_err());
        assert_eq!(
            host.set(packets::MODULE, 9, 1),
            Err(ConfigError::UnknownParameter {
                module: packets::MODULE,
                param: 9
            })
        );
    }

    #[test]
    fn test_autoexposure_is_host_side() {
        assert!(HostConfig::is_host_param(aps::MODULE, aps::AUTOEXPOSURE));
        assert!(!HostConfig::is_host_param(aps::MODULE, aps::EXPOSURE));

        let host = host();
        host.set(aps::MODULE, aps::AUTOEXPOSURE, 1).unwrap();
        assert!(host.autoexposure.load(Ordering::Relaxed));
    }

    #[test]
    fn test_cycle_conversion() {
        assert_eq!(micros_to_cycles(4000, 30.0), 120_000);
        assert_eq!(cycles_to_micros(120_000, 30.0), 4000);
        assert_eq!(cycles_to_micros(10, 0.0), 0);
    }

    #[test]
    fn test_memory_registers_shared_between_clones() {
        let info = DeviceInfo::for_chip(ChipVariant::Davis346, 3);
        let registers = MemoryRegisters::for_device(&info);
        let mut bus: Box<dyn RegisterBus> = Box::new(registers.clone());

        assert_eq!(
            bus.read(sysinfo::MODULE as u8, sysinfo::CHIP_IDENTIFIER).unwrap(),
            ChipVariant::Davis346.id() as u32
        );
        bus.write(mux::MODULE as u8, mux::RUN, 1).unwrap();
        assert_eq!(registers.writes(), vec![(0, mux::RUN, 1)]);
        assert_eq!(registers.get(dvs::MODULE as u8, dvs::SIZE_COLUMNS), Some(346));
    }

    #[test]
    fn test_session_config_from_toml() {
        let config: SessionConfig = toml::from_str(
            r#"
            log_level = "debug"

            [packets]
            max_interval = 500

            [data_exchange]
            blocking = true
            "#,
        )
        .unwrap();

        assert_eq!(config.packets.max_interval, 500);
        assert_eq!(config.packets.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
        assert!(config.data_exchange.blocking);
        assert_eq!(config.data_exchange.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.usb, UsbConfig::default());
        assert_eq!(config.log_level_filter(), Ok(LevelFilter::Debug));
    }

    #[test]
    fn test_invalid_log_level() {
        let config = SessionConfig {
            log_level: "loud".into(),
            ..SessionConfig::default()
        };
        assert_eq!(
            config.log_level_filter(),
            Err(ConfigError::InvalidLogLevel("loud".into()))
        );
    }
}
