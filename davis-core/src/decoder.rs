//! Stateful translation of the device byte stream into packet containers.
//!
//! A translator is fed one USB transfer at a time. It tracks timestamps,
//! reassembles frames and IMU samples from their fragments, appends events to
//! the in-progress packets and commits containers to the data exchange when a
//! size or time threshold is reached. Malformed input is logged and skipped;
//! nothing in here returns an error to the caller.

use crate::chip::{DeviceInfo, WireProtocol};
use crate::config::{aps, cycles_to_micros, ConfigError, PendingUpdates, SessionConfig};
use crate::container::{CommitReason, ContainerGenerator, CurrentPackets, PacketLimits};
use crate::device_log;
use crate::exchange::{DataExchange, ExchangeSettings};
use crate::frame::{ApsSettings, ExposureControl, FrameAssembler, FrameEnd};
use crate::imu::{ImuAssembler, ImuSettings};
use crate::logging::DeviceLog;
use crate::mipi::MipiTranslator;
use crate::packet::{EventPacketContainer, PacketError};
use crate::parser;
use crate::timestamp::{TimestampTracker, WrapOutcome};
use crate::types::{
    FrameEvent, Imu6Event, Misc8Code, PolarityEvent, RawEventType, SpecialCode, SpecialEvent, SpecialEventType,
};
use log::Level;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors of offline (file or buffer) decoding.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid device configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Decodes a device byte stream into packet containers.
pub trait EventTranslator: Send {
    /// Consumes one transfer. Containers are committed to the exchange as
    /// thresholds are reached.
    fn translate(&mut self, bytes: &[u8]);

    /// Commits whatever is still in progress, regardless of thresholds.
    fn flush(&mut self);
}

/// Shared handles a translator works with.
#[derive(Debug, Clone)]
pub struct TranslatorContext {
    pub limits: Arc<PacketLimits>,
    pub exchange: Arc<DataExchange>,
    /// Acquisition flag, bounds forced retries
    pub running: Arc<AtomicBool>,
    pub pending: Arc<PendingUpdates>,
    pub autoexposure: Arc<AtomicBool>,
    pub log: DeviceLog,
}

/// Per-acquisition decoding options read from the device at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatorOptions {
    pub reset_read: bool,
    pub accel_range: u8,
    pub gyro_range: u8,
    /// Exposure last written to the device, in microseconds
    pub exposure_us: u32,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for TranslatorOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            reset_read: config.aps.reset_read,
            accel_range: config.imu.accel_full_scale,
            gyro_range: config.imu.gyro_full_scale,
            exposure_us: config.aps.exposure,
        }
    }
}

/// Builds the translator matching the wire protocol of `info.chip`.
pub fn new_translator(
    ctx: TranslatorContext,
    info: &DeviceInfo,
    options: TranslatorOptions,
    exposure_control: Option<Box<dyn ExposureControl>>,
) -> Box<dyn EventTranslator> {
    match info.chip.protocol() {
        WireProtocol::Davis16 => {
            let aps = aps_settings(info, options.reset_read);
            let imu = imu_settings(info, options.accel_range, options.gyro_range);
            let mut translator = DavisTranslator::new(ctx, info, aps, imu, exposure_control);
            translator.set_last_exposure(options.exposure_us);
            Box::new(translator)
        }
        WireProtocol::Mipi32 => Box::new(MipiTranslator::new(ctx, info)),
    }
}

/// APS readout settings of a device, `None` if it has no frame sensor.
pub fn aps_settings(info: &DeviceInfo, reset_read: bool) -> Option<ApsSettings> {
    let (size_x, size_y) = info.aps_size?;
    let mut settings = ApsSettings::new(size_x, size_y);
    settings.flip_x = info.aps_orientation.flip_x;
    settings.flip_y = info.aps_orientation.flip_y;
    settings.invert_xy = info.aps_orientation.invert_xy;
    settings.reset_read = reset_read;
    settings.double_samples = info.chip.doubles_adc_samples();
    settings.cdavis_readout = info.chip.cdavis_readout();
    settings.color_filter = info.chip.color_filter();
    Some(settings)
}

pub fn imu_settings(info: &DeviceInfo, accel_range: u8, gyro_range: u8) -> ImuSettings {
    ImuSettings {
        accel_range,
        gyro_range,
        flip_x: info.imu_orientation.flip_x,
        flip_y: info.imu_orientation.flip_y,
        flip_z: info.imu_orientation.flip_z,
    }
}

/// Cuts a transfer down to whole wire units, alerting about the remainder.
pub(crate) fn whole_units<'a>(bytes: &'a [u8], unit: usize, log: &DeviceLog) -> &'a [u8] {
    let remainder = bytes.len() % unit;
    if remainder != 0 {
        device_log!(
            log,
            Level::Error,
            "ALERT: {} bytes received via USB, which is not a multiple of {}.",
            bytes.len(),
            unit
        );
    }
    &bytes[..bytes.len() - remainder]
}

/// State common to all wire protocols: timestamps, in-progress packets and
/// the container generator.
#[derive(Debug)]
pub(crate) struct EventStream {
    pub(crate) timestamps: TimestampTracker,
    pub(crate) packets: CurrentPackets,
    pub(crate) generator: ContainerGenerator,
    pub(crate) log: DeviceLog,
    running: Arc<AtomicBool>,
}

impl EventStream {
    pub(crate) fn new(ctx: &TranslatorContext, source_id: i16) -> Self {
        Self {
            timestamps: TimestampTracker::new(),
            packets: CurrentPackets::new(source_id),
            generator: ContainerGenerator::new(
                ctx.limits.clone(),
                ctx.exchange.clone(),
                ctx.running.clone(),
                source_id,
                ctx.log.clone(),
            ),
            log: ctx.log.clone(),
            running: ctx.running.clone(),
        }
    }

    /// Transfers still queued after a stop are not decoded.
    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn special(&mut self, kind: SpecialEventType) -> Result<(), PacketError> {
        let event = SpecialEvent::new(self.timestamps.current(), kind);
        self.packets.push_special(event, self.timestamps.wrap_overflow())
    }

    #[inline]
    pub(crate) fn polarity(&mut self, x: u16, y: u16, polarity: bool) -> Result<(), PacketError> {
        let event = PolarityEvent::new(self.timestamps.current(), x, y, polarity);
        self.packets.push_polarity(event, self.timestamps.wrap_overflow())
    }

    #[inline]
    pub(crate) fn frame(&mut self, event: FrameEvent) -> Result<(), PacketError> {
        self.packets.push_frame(event, self.timestamps.wrap_overflow())
    }

    #[inline]
    pub(crate) fn imu6(&mut self, event: Imu6Event) -> Result<(), PacketError> {
        self.packets.push_imu6(event, self.timestamps.wrap_overflow())
    }

    /// Opens the container time window once the first timestamp is known.
    #[inline]
    pub(crate) fn timestamp_known(&mut self) {
        self.generator.init_commit_timestamp(self.timestamps.full());
    }

    /// Runs the commit check that follows every wire unit.
    pub(crate) fn after_unit(&mut self, forced: Option<CommitReason>) {
        let full = self.timestamps.full();
        match forced {
            Some(reason) => {
                self.generator.execute(&mut self.packets, reason, full);
                if reason == CommitReason::TimestampReset {
                    self.generator.init_commit_timestamp(full);
                }
            }
            None => {
                if self.generator.should_commit(&self.packets, full) {
                    self.generator.execute(&mut self.packets, CommitReason::Threshold, full);
                }
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        let full = self.timestamps.full();
        self.generator.execute(&mut self.packets, CommitReason::Threshold, full);
    }

    pub(crate) fn allocation_failed(&self, err: &PacketError) {
        device_log!(
            self.log,
            Level::Error,
            "CRITICAL: {}, abandoning rest of transfer.",
            err
        );
    }
}

/// Translator for the legacy 16-bit DAVIS protocol.
pub struct DavisTranslator {
    stream: EventStream,
    pending: Arc<PendingUpdates>,
    autoexposure: Arc<AtomicBool>,
    dvs_size_x: u16,
    dvs_size_y: u16,
    dvs_invert_xy: bool,
    last_y: u16,
    aps: Option<FrameAssembler>,
    imu: ImuAssembler,
    exposure_control: Option<Box<dyn ExposureControl>>,
    last_set_exposure: u32,
    adc_clock: f32,
}

impl std::fmt::Debug for DavisTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavisTranslator")
            .field("stream", &self.stream)
            .field("dvs_size", &(self.dvs_size_x, self.dvs_size_y))
            .field("last_y", &self.last_y)
            .field("last_set_exposure", &self.last_set_exposure)
            .finish_non_exhaustive()
    }
}

impl DavisTranslator {
    pub fn new(
        ctx: TranslatorContext,
        info: &DeviceInfo,
        aps: Option<ApsSettings>,
        imu: ImuSettings,
        exposure_control: Option<Box<dyn ExposureControl>>,
    ) -> Self {
        let (dvs_size_x, dvs_size_y) = info.dvs_size;
        Self {
            stream: EventStream::new(&ctx, info.device_id),
            pending: ctx.pending,
            autoexposure: ctx.autoexposure,
            dvs_size_x,
            dvs_size_y,
            dvs_invert_xy: info.dvs_orientation.invert_xy,
            last_y: 0,
            aps: aps.map(FrameAssembler::new),
            imu: ImuAssembler::new(imu),
            exposure_control,
            last_set_exposure: 0,
            adc_clock: info.adc_clock,
        }
    }

    /// Exposure the device currently runs with, in microseconds.
    pub fn set_last_exposure(&mut self, exposure_us: u32) {
        self.last_set_exposure = exposure_us;
    }

    pub fn timestamps(&self) -> &TimestampTracker {
        &self.stream.timestamps
    }

    fn handle_word(&mut self, word: u16) -> Result<Option<CommitReason>, PacketError> {
        if parser::is_timestamp(word) {
            self.stream
                .timestamps
                .update_from_fragment(parser::timestamp_get_value(word), &self.stream.log);
            self.stream.timestamp_known();
            return Ok(None);
        }

        let data = parser::get_data(word);

        match parser::parse_event_type(word) {
            Some(RawEventType::Special) => return self.handle_special(data),
            Some(RawEventType::AddrY) => {
                if data >= self.dvs_size_y {
                    device_log!(
                        self.stream.log,
                        Level::Error,
                        "ALERT: DVS: Y address out of range (0-{}): {}.",
                        self.dvs_size_y.saturating_sub(1),
                        data
                    );
                } else {
                    self.last_y = data;
                }
            }
            Some(kind @ (RawEventType::AddrXOff | RawEventType::AddrXOn)) => {
                if data >= self.dvs_size_x {
                    device_log!(
                        self.stream.log,
                        Level::Error,
                        "ALERT: DVS: X address out of range (0-{}): {}.",
                        self.dvs_size_x.saturating_sub(1),
                        data
                    );
                } else {
                    let polarity = kind == RawEventType::AddrXOn;
                    let (x, y) = if self.dvs_invert_xy {
                        (self.last_y, data)
                    } else {
                        (data, self.last_y)
                    };
                    self.stream.polarity(x, y, polarity)?;
                }
            }
            Some(RawEventType::AdcSample) => {
                if let Some(aps) = self.aps.as_mut() {
                    aps.sample(data, &self.stream.log);
                }
            }
            Some(RawEventType::Misc8) => self.handle_misc8(data),
            Some(RawEventType::Misc10) => {
                if parser::misc10_get_code(data) == 0 {
                    if let Some(aps) = self.aps.as_mut() {
                        aps.exposure_info(parser::misc10_get_data(data));
                    }
                } else {
                    device_log!(self.stream.log, Level::Error, "Caught Misc10 event that can't be handled.");
                }
            }
            Some(RawEventType::TimestampWrap) => {
                let epoch = self.stream.timestamps.wrap_overflow();
                match self.stream.timestamps.wrap(data, &self.stream.log) {
                    WrapOutcome::BigWrap => {
                        // Closes the old epoch; the packet keeps its overflow.
                        let marker = SpecialEvent::new(i32::MAX, SpecialEventType::TimestampWrap);
                        self.stream.packets.push_special(marker, epoch)?;
                        return Ok(Some(CommitReason::BigWrap));
                    }
                    WrapOutcome::Advanced => self.stream.timestamp_known(),
                }
            }
            None => device_log!(self.stream.log, Level::Error, "Caught event that can't be handled."),
        }

        Ok(None)
    }

    fn handle_special(&mut self, data: u16) -> Result<Option<CommitReason>, PacketError> {
        let log = &self.stream.log;
        let Some(code) = parser::parse_special_code(data) else {
            device_log!(log, Level::Error, "Caught special event that can't be handled: {}.", data);
            return Ok(None);
        };

        match code {
            SpecialCode::Reserved => {
                device_log!(log, Level::Error, "Caught special reserved event!");
            }
            SpecialCode::TimestampReset => {
                self.stream.timestamps.reset(log);
                self.stream.generator.reset_commit_timestamp();
                // Re-read at the next safe point, never from here.
                self.pending.master_status.store(true, Ordering::Release);
                return Ok(Some(CommitReason::TimestampReset));
            }
            SpecialCode::ExternalInputFalling => {
                device_log!(log, Level::Debug, "External input (falling edge) event received.");
                self.stream.special(SpecialEventType::ExternalInputFallingEdge)?;
            }
            SpecialCode::ExternalInputRising => {
                device_log!(log, Level::Debug, "External input (rising edge) event received.");
                self.stream.special(SpecialEventType::ExternalInputRisingEdge)?;
            }
            SpecialCode::ExternalInputPulse => {
                device_log!(log, Level::Debug, "External input (pulse) event received.");
                self.stream.special(SpecialEventType::ExternalInputPulse)?;
            }
            SpecialCode::ExternalGeneratorFalling => {
                device_log!(log, Level::Debug, "External generator (falling edge) event received.");
                self.stream.special(SpecialEventType::ExternalGeneratorFallingEdge)?;
            }
            SpecialCode::ExternalGeneratorRising => {
                device_log!(log, Level::Debug, "External generator (rising edge) event received.");
                self.stream.special(SpecialEventType::ExternalGeneratorRisingEdge)?;
            }
            SpecialCode::ImuStart => self.imu.start(log),
            SpecialCode::ImuEnd => {
                let timestamp = self.stream.timestamps.current();
                if let Some(event) = self.imu.end(timestamp, log) {
                    self.stream.imu6(event)?;
                }
            }
            SpecialCode::ApsGlobalShutterFrameStart | SpecialCode::ApsRollingShutterFrameStart => {
                if let Some(aps) = self.aps.as_mut() {
                    let global_shutter = code == SpecialCode::ApsGlobalShutterFrameStart;
                    aps.start_frame(global_shutter, self.stream.timestamps.current(), log);
                    self.stream.special(SpecialEventType::ApsFrameStart)?;
                }
            }
            SpecialCode::ApsFrameEnd => return self.end_frame().map(|()| None),
            SpecialCode::ApsResetColumnStart => {
                if let Some(aps) = self.aps.as_mut() {
                    aps.reset_column_start();
                }
            }
            SpecialCode::ApsSignalColumnStart => {
                if let Some(aps) = self.aps.as_mut() {
                    aps.signal_column_start();
                }
            }
            SpecialCode::ApsColumnEnd => {
                if let Some(aps) = self.aps.as_mut() {
                    aps.column_end(log);
                }
            }
            SpecialCode::ApsExposureStart => {
                let timestamp = self.stream.timestamps.current();
                if self.aps.as_mut().is_some_and(|aps| aps.exposure_start(timestamp)) {
                    device_log!(log, Level::Debug, "APS Exposure Start event received.");
                    self.stream.special(SpecialEventType::ApsExposureStart)?;
                }
            }
            SpecialCode::ApsExposureEnd => {
                let timestamp = self.stream.timestamps.current();
                if self.aps.as_mut().is_some_and(|aps| aps.exposure_end(timestamp)) {
                    device_log!(log, Level::Debug, "APS Exposure End event received.");
                    self.stream.special(SpecialEventType::ApsExposureEnd)?;
                }
            }
        }

        Ok(None)
    }

    fn end_frame(&mut self) -> Result<(), PacketError> {
        let Some(aps) = self.aps.as_mut() else {
            return Ok(());
        };
        let timestamp = self.stream.timestamps.current();
        let device_exposure = aps.device_exposure();

        match aps.end_frame(timestamp, &self.stream.log) {
            FrameEnd::Ignored => {}
            FrameEnd::Invalid => self.stream.special(SpecialEventType::ApsFrameEnd)?,
            FrameEnd::Complete(frame) => {
                self.stream.special(SpecialEventType::ApsFrameEnd)?;
                self.run_autoexposure(&frame, device_exposure);
                self.stream.frame(frame)?;
            }
        }
        Ok(())
    }

    fn run_autoexposure(&mut self, frame: &FrameEvent, device_exposure: u32) {
        if !self.autoexposure.load(Ordering::Relaxed) {
            return;
        }
        let Some(control) = self.exposure_control.as_mut() else {
            return;
        };

        let exposure_us = cycles_to_micros(device_exposure, self.adc_clock);
        if let Some(new_exposure) = control.next_exposure(frame, exposure_us, self.last_set_exposure) {
            self.last_set_exposure = new_exposure;
            self.pending.push_write(aps::MODULE, aps::EXPOSURE, new_exposure);

            device_log!(
                self.stream.log,
                Level::Debug,
                "Autoexposure: frame exposure {} us, new exposure {} us.",
                exposure_us,
                new_exposure
            );
        }
    }

    fn handle_misc8(&mut self, data: u16) {
        let log = &self.stream.log;
        let byte = parser::misc8_get_data(data);

        match parser::parse_misc8_code(data) {
            Some(Misc8Code::ImuData) => self.imu.data(byte, log),
            Some(Misc8Code::RoiHigh) => {
                if let Some(aps) = self.aps.as_mut() {
                    aps.roi_high(byte);
                }
            }
            Some(Misc8Code::RoiLow) => {
                if let Some(aps) = self.aps.as_mut() {
                    aps.roi_low(byte, log);
                }
            }
            Some(Misc8Code::ImuScaleConfig) => self.imu.scale_config(
                parser::imu_scale_get_accel_range(byte),
                parser::imu_scale_get_gyro_range(byte),
                parser::imu_scale_get_type(byte),
                log,
            ),
            None => device_log!(log, Level::Error, "Caught Misc8 event that can't be handled."),
        }
    }
}

impl EventTranslator for DavisTranslator {
    fn translate(&mut self, bytes: &[u8]) {
        if !self.stream.is_running() {
            return;
        }
        let bytes = whole_units(bytes, 2, &self.stream.log);

        for word in parser::words_le16(bytes) {
            let forced = match self.handle_word(word) {
                Ok(forced) => forced,
                Err(err) => {
                    self.stream.allocation_failed(&err);
                    return;
                }
            };

            if forced.is_some() {
                // Partial frames and IMU samples cannot cross an epoch.
                if let Some(aps) = self.aps.as_mut() {
                    aps.ignore_until_start();
                }
                self.imu.ignore_until_start();
            }

            self.stream.after_unit(forced);
        }
    }

    fn flush(&mut self) {
        self.stream.flush();
    }
}

/// Size of the slices fed to the translator when decoding offline.
const OFFLINE_CHUNK_SIZE: usize = 512;
/// Common multiple of the 16-bit and 32-bit unit sizes.
const UNIT_ALIGN: usize = 4;

/// Decodes recorded transfers without a device, collecting every container.
pub struct OfflineDecoder {
    translator: Box<dyn EventTranslator>,
    exchange: Arc<DataExchange>,
    running: Arc<AtomicBool>,
}

impl OfflineDecoder {
    pub fn new(info: &DeviceInfo, config: &SessionConfig) -> Result<Self, DecodeError> {
        let level = config.log_level_filter()?;
        let log = DeviceLog::new(info.device_string.as_str(), level);

        let limits = PacketLimits::default();
        limits
            .max_packet_size
            .store(config.packets.max_packet_size, Ordering::Relaxed);
        limits.max_interval.store(config.packets.max_interval, Ordering::Relaxed);

        // Each 16-bit word commits at most two containers.
        let settings = ExchangeSettings::default();
        settings
            .buffer_size
            .store(OFFLINE_CHUNK_SIZE as u32, Ordering::Relaxed);
        let exchange = Arc::new(DataExchange::new(Arc::new(settings), None, None));
        let running = Arc::new(AtomicBool::new(true));

        let ctx = TranslatorContext {
            limits: Arc::new(limits),
            exchange: exchange.clone(),
            running: running.clone(),
            pending: Arc::new(PendingUpdates::default()),
            autoexposure: Arc::new(AtomicBool::new(false)),
            log,
        };
        let translator = new_translator(ctx, info, TranslatorOptions::from(config), None);

        Ok(Self {
            translator,
            exchange,
            running,
        })
    }

    /// Decodes `bytes`, appending the committed containers to `out`.
    pub fn decode_buffer(&mut self, bytes: &[u8], out: &mut Vec<EventPacketContainer>) {
        for chunk in bytes.chunks(OFFLINE_CHUNK_SIZE) {
            self.translator.translate(chunk);
            self.collect(out);
        }
    }

    /// Commits the remaining partial packets.
    pub fn finish(&mut self, out: &mut Vec<EventPacketContainer>) {
        self.translator.flush();
        self.collect(out);
    }

    /// Decodes a raw capture file of concatenated transfer payloads.
    pub fn decode_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Vec<EventPacketContainer>, DecodeError> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        let mut containers = Vec::new();
        let mut buffer = vec![0u8; OFFLINE_CHUNK_SIZE * 64];
        let mut carry = 0;

        loop {
            let bytes_read = reader.read(&mut buffer[carry..])?;
            if bytes_read == 0 {
                // A dangling partial unit is reported by the translator.
                self.decode_buffer(&buffer[..carry], &mut containers);
                break;
            }

            // Short reads must not split a wire unit.
            let filled = carry + bytes_read;
            let whole = filled - filled % UNIT_ALIGN;
            self.decode_buffer(&buffer[..whole], &mut containers);
            buffer.copy_within(whole..filled, 0);
            carry = filled - whole;
        }

        self.finish(&mut containers);
        Ok(containers)
    }

    fn collect(&self, out: &mut Vec<EventPacketContainer>) {
        while let Some(container) = self.exchange.get(&self.running) {
            out.push(container);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::ChipVariant;
    use crate::types::EventKind;
    use log::LevelFilter;

    struct Harness {
        translator: DavisTranslator,
        exchange: Arc<DataExchange>,
        running: Arc<AtomicBool>,
        limits: Arc<PacketLimits>,
        pending: Arc<PendingUpdates>,
        autoexposure: Arc<AtomicBool>,
    }

    impl Harness {
        fn new(info: &DeviceInfo, control: Option<Box<dyn ExposureControl>>) -> Self {
            let limits = Arc::new(PacketLimits::default());
            let settings = ExchangeSettings::default();
            settings.buffer_size.store(64, Ordering::Relaxed);
            let exchange = Arc::new(DataExchange::new(Arc::new(settings), None, None));
            let running = Arc::new(AtomicBool::new(true));
            let pending = Arc::new(PendingUpdates::default());
            let autoexposure = Arc::new(AtomicBool::new(false));

            let ctx = TranslatorContext {
                limits: limits.clone(),
                exchange: exchange.clone(),
                running: running.clone(),
                pending: pending.clone(),
                autoexposure: autoexposure.clone(),
                log: DeviceLog::new("test", LevelFilter::Off),
            };
            let translator = DavisTranslator::new(
                ctx,
                info,
                aps_settings(info, true),
                imu_settings(info, 0, 0),
                control,
            );

            Self {
                translator,
                exchange,
                running,
                limits,
                pending,
                autoexposure,
            }
        }

        fn feed(&mut self, words: &[u16]) {
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
            self.translator.translate(&bytes);
        }

        fn drain(&mut self) -> Vec<EventPacketContainer> {
            self.translator.flush();
            let mut out = Vec::new();
            while let Some(container) = self.exchange.get(&self.running) {
                out.push(container);
            }
            out
        }
    }

    fn device(dvs: (u16, u16), aps: (u16, u16)) -> DeviceInfo {
        let mut info = DeviceInfo::for_chip(ChipVariant::Davis346, 1);
        info.dvs_size = dvs;
        info.aps_size = Some(aps);
        info
    }

    fn polarity_events(containers: &[EventPacketContainer]) -> Vec<PolarityEvent> {
        containers
            .iter()
            .filter_map(|c| c.polarity.as_ref())
            .flat_map(|p| p.iter().copied())
            .collect()
    }

    fn special_kinds(containers: &[EventPacketContainer]) -> Vec<SpecialEventType> {
        containers
            .iter()
            .filter_map(|c| c.special.as_ref())
            .flat_map(|p| p.iter().map(|e| e.kind))
            .collect()
    }

    const TS: u16 = 0x8000;
    const Y: u16 = 0x1000;
    const X_OFF: u16 = 0x2000;
    const X_ON: u16 = 0x3000;
    const ADC: u16 = 0x4000;
    const MISC8: u16 = 0x5000;
    const MISC10: u16 = 0x6000;
    const WRAP: u16 = 0x7000;

    #[test]
    fn test_single_polarity_event() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.feed(&[0x1005, 0x2007]);

        let events = polarity_events(&h.drain());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].x, 7);
        assert_eq!(events[0].y, 5);
        assert!(!events[0].polarity);
    }

    #[test]
    fn test_polarity_uses_current_timestamp() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.feed(&[TS | 100, Y | 3, X_ON | 9, TS | 150, X_OFF | 10]);

        let events = polarity_events(&h.drain());
        assert_eq!(events, vec![PolarityEvent::new(100, 9, 3, true), PolarityEvent::new(150, 10, 3, false)]);
    }

    #[test]
    fn test_out_of_range_addresses_are_dropped() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        // Y=70 is ignored, so the last valid Y (2) is kept.
        h.feed(&[Y | 2, Y | 70, X_ON | 5, X_ON | 64]);

        let events = polarity_events(&h.drain());
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].x, events[0].y), (5, 2));
    }

    #[test]
    fn test_inverted_xy() {
        let mut info = device((64, 32), (4, 3));
        info.dvs_orientation.invert_xy = true;
        let mut h = Harness::new(&info, None);
        h.feed(&[Y | 20, X_ON | 40]);

        let events = polarity_events(&h.drain());
        assert_eq!((events[0].x, events[0].y), (20, 40));
    }

    #[test]
    fn test_odd_transfer_is_truncated() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.translator.translate(&[0x05, 0x10, 0x07, 0x20, 0xAA]);
        assert_eq!(polarity_events(&h.drain()).len(), 1);
    }

    #[test]
    fn test_stopped_translator_ignores_transfers() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.running.store(false, Ordering::Release);
        h.feed(&[0x1005, 0x2007]);
        h.running.store(true, Ordering::Release);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_timestamp_wrap_extends_time() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.feed(&[TS | 0x7FF0, WRAP | 1, TS | 5, Y | 1, X_ON | 1]);

        let events = polarity_events(&h.drain());
        assert_eq!(events[0].timestamp, 0x8000 + 5);
    }

    #[test]
    fn test_external_input_specials() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.feed(&[TS | 10, 0x0003, TS | 20, 0x0002, 0x0004, 0x0011]);

        let kinds = special_kinds(&h.drain());
        assert_eq!(
            kinds,
            vec![
                SpecialEventType::ExternalInputRisingEdge,
                SpecialEventType::ExternalInputFallingEdge,
                SpecialEventType::ExternalInputPulse,
                SpecialEventType::ExternalGeneratorRisingEdge,
            ]
        );
    }

    #[test]
    fn test_timestamp_reset_commits_separately() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.feed(&[TS | 500, Y | 1, X_ON | 1, 0x0001, TS | 3, Y | 1, X_OFF | 2]);

        let containers = h.drain();
        assert_eq!(containers.len(), 3);
        assert_eq!(containers[0].event_count(EventKind::Polarity), 1);

        let marker = containers[1].special.as_ref().unwrap();
        assert_eq!(marker.len(), 1);
        assert_eq!(marker.events()[0].kind, SpecialEventType::TimestampReset);
        assert_eq!(marker.events()[0].timestamp, i32::MAX);
        assert_eq!(containers[1].packet_count(), 1);

        let after = polarity_events(&containers[2..]);
        assert_eq!(after[0].timestamp, 3);
        assert!(h.pending.master_status.load(Ordering::Acquire));
    }

    #[test]
    fn test_big_wrap_forces_commit() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.feed(&[TS | 1, Y | 1, X_ON | 1]);
        // 0xFFF * 0x8000 per wrap; the seventeenth wrap exhausts 31 bits.
        for _ in 0..17 {
            h.feed(&[WRAP | 0x0FFF]);
        }
        h.feed(&[TS | 7, Y | 1, X_ON | 2]);

        let containers = h.drain();
        let wraps: Vec<_> = containers
            .iter()
            .filter_map(|c| c.special.as_ref())
            .filter(|s| s.iter().any(|e| e.kind == SpecialEventType::TimestampWrap))
            .collect();
        assert_eq!(wraps.len(), 1);

        let wrap = wraps[0];
        let count = wrap.iter().filter(|e| e.kind == SpecialEventType::TimestampWrap).count();
        assert_eq!(count, 1);
        assert_eq!(wrap.ts_overflow(), 0);
        // Nothing from the new epoch shares the marker's container.
        let marker = wrap.events().last().unwrap();
        assert_eq!(marker.kind, SpecialEventType::TimestampWrap);
        assert_eq!(marker.timestamp, i32::MAX);

        let last = containers.last().unwrap().polarity.as_ref().unwrap();
        assert_eq!(last.ts_overflow(), 1);
        assert_eq!(last.events()[0].x, 2);
        assert_eq!(h.translator.timestamps().wrap_overflow(), 1);
    }

    #[test]
    fn test_size_threshold_commit() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.limits.max_packet_size.store(2, Ordering::Relaxed);
        h.feed(&[TS | 1, Y | 1, X_ON | 1, X_ON | 2, X_ON | 3]);

        assert_eq!(h.exchange.len(), 1);
        let containers = h.drain();
        assert_eq!(containers[0].event_count(EventKind::Polarity), 2);
        assert_eq!(containers[1].event_count(EventKind::Polarity), 1);
    }

    #[test]
    fn test_time_threshold_commit() {
        let mut h = Harness::new(&device((64, 64), (4, 3)), None);
        h.limits.max_interval.store(100, Ordering::Relaxed);
        h.feed(&[TS | 10, Y | 1, X_ON | 1, TS | 50, X_ON | 2, TS | 120, X_ON | 3]);

        // The window [10, 109] closes on the first word past it.
        assert_eq!(h.exchange.len(), 1);
        let containers = h.drain();
        assert_eq!(containers[0].event_count(EventKind::Polarity), 2);
        assert_eq!(polarity_events(&containers[1..])[0].timestamp, 120);
    }

    /// Emits a 2x2 frame with reset value 600 and signal value 600 - (i + 1).
    fn frame_words() -> Vec<u16> {
        let mut words = vec![TS | 100, 0x0009, 0x000E];
        for _ in 0..2 {
            words.push(0x000B);
            words.push(ADC | 600);
            words.push(ADC | 600);
            words.push(0x000D);
        }
        words.push(TS | 140);
        words.push(0x000F);
        let mut value = 1;
        for _ in 0..2 {
            words.push(0x000C);
            for _ in 0..2 {
                words.push(ADC | (600 - value));
                value += 1;
            }
            words.push(0x000D);
        }
        // 3000 clock cycles of reported exposure.
        words.push(MISC10 | (3000 & 0x3FF));
        words.push(MISC10 | (3000 >> 10));
        words.push(TS | 160);
        words.push(0x000A);
        words
    }

    #[test]
    fn test_frame_assembly() {
        let mut h = Harness::new(&device((64, 64), (2, 2)), None);
        h.feed(&frame_words());

        let containers = h.drain();
        let frames: Vec<&FrameEvent> = containers
            .iter()
            .filter_map(|c| c.frame.as_ref())
            .flat_map(|p| p.iter())
            .collect();
        assert_eq!(frames.len(), 1);

        let frame = frames[0];
        assert_eq!(frame.ts_start_frame, 100);
        assert_eq!(frame.ts_start_exposure, 100);
        assert_eq!(frame.ts_end_exposure, 140);
        assert_eq!(frame.ts_end_frame, 160);
        assert_eq!((frame.width, frame.height), (2, 2));
        // CDS values 1..=4 scaled to 16 bits, column-major readout.
        assert_eq!(frame.pixel(0, 0), Some(1 << 6));
        assert_eq!(frame.pixel(0, 1), Some(2 << 6));
        assert_eq!(frame.pixel(1, 0), Some(3 << 6));
        assert_eq!(frame.pixel(1, 1), Some(4 << 6));

        assert_eq!(
            special_kinds(&containers),
            vec![
                SpecialEventType::ApsFrameStart,
                SpecialEventType::ApsExposureStart,
                SpecialEventType::ApsExposureEnd,
                SpecialEventType::ApsFrameEnd,
            ]
        );
    }

    #[test]
    fn test_invalid_frame_still_ends() {
        let mut h = Harness::new(&device((64, 64), (2, 2)), None);
        // One reset column missing.
        h.feed(&[TS | 1, 0x0009, 0x000B, ADC | 5, ADC | 5, 0x000D, TS | 2, 0x000A]);

        let containers = h.drain();
        assert!(containers.iter().all(|c| c.frame.is_none()));
        assert_eq!(
            special_kinds(&containers),
            vec![SpecialEventType::ApsFrameStart, SpecialEventType::ApsFrameEnd]
        );
    }

    #[test]
    fn test_frame_end_without_start_is_silent() {
        let mut h = Harness::new(&device((64, 64), (2, 2)), None);
        h.feed(&[TS | 1, 0x000A]);
        assert!(special_kinds(&h.drain()).is_empty());
    }

    struct HalfExposure(Arc<std::sync::Mutex<Vec<(u32, u32)>>>);

    impl ExposureControl for HalfExposure {
        fn next_exposure(&mut self, _frame: &FrameEvent, exposure_us: u32, last_set_us: u32) -> Option<u32> {
            self.0.lock().unwrap().push((exposure_us, last_set_us));
            Some(exposure_us / 2)
        }
    }

    #[test]
    fn test_autoexposure_schedules_write() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let info = device((64, 64), (2, 2));
        let mut h = Harness::new(&info, Some(Box::new(HalfExposure(seen.clone()))));
        h.translator.set_last_exposure(4000);

        // Disabled: the controller is not consulted.
        h.feed(&frame_words());
        assert!(seen.lock().unwrap().is_empty());

        h.autoexposure.store(true, Ordering::Relaxed);
        h.feed(&frame_words());

        // 3000 cycles at 30 MHz.
        assert_eq!(seen.lock().unwrap().as_slice(), &[(100, 4000)]);
        let write = h.pending.writes.pop().unwrap();
        assert_eq!((write.module, write.param, write.value), (aps::MODULE, aps::EXPOSURE, 50));
        assert!(h.pending.writes.pop().is_none());

        h.feed(&frame_words());
        assert_eq!(seen.lock().unwrap()[1], (100, 50));
    }

    #[test]
    fn test_imu_sample() {
        let mut h = Harness::new(&device((64, 64), (2, 2)), None);
        let mut words = vec![TS | 10, 0x0005];
        // accel X = 16384 (1 g at range 0), all other values zero.
        let bytes: [u8; 14] = [0x40, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        words.extend(bytes.iter().map(|&b| MISC8 | b as u16));
        words.push(TS | 30);
        words.push(0x0007);
        h.feed(&words);

        let containers = h.drain();
        let imu = containers.iter().find_map(|c| c.imu6.as_ref()).unwrap();
        assert_eq!(imu.len(), 1);
        let event = imu.events()[0];
        assert_eq!(event.timestamp, 30);
        assert_eq!(event.accel_x, 1.0);
        assert_eq!(event.temperature, 36.53);
    }

    #[test]
    fn test_reset_drops_partial_imu_sample() {
        let mut h = Harness::new(&device((64, 64), (2, 2)), None);
        let mut words = vec![TS | 10, 0x0005, MISC8, MISC8];
        words.push(0x0001);
        words.extend([MISC8; 12]);
        words.push(0x0007);
        h.feed(&words);

        assert!(h.drain().iter().all(|c| c.imu6.is_none()));
    }

    #[test]
    fn test_offline_decoder_collects_containers() {
        let info = device((64, 64), (2, 2));
        let mut config = SessionConfig::default();
        config.packets.max_packet_size = 1;
        let mut decoder = OfflineDecoder::new(&info, &config).unwrap();

        let words = [TS | 1, Y | 1, X_ON | 1, X_ON | 2, X_ON | 3];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut out = Vec::new();
        decoder.decode_buffer(&bytes, &mut out);
        decoder.finish(&mut out);

        assert_eq!(out.len(), 3);
        assert_eq!(polarity_events(&out).len(), 3);
    }

    #[test]
    fn test_offline_decoder_reads_file() {
        use std::io::Write;

        let info = device((64, 64), (2, 2));
        let mut decoder = OfflineDecoder::new(&info, &SessionConfig::default()).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        let words = [TS | 1, Y | 4, X_OFF | 8];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();

        let containers = decoder.decode_file(file.path()).unwrap();
        let events = polarity_events(&containers);
        assert_eq!(events, vec![PolarityEvent::new(1, 8, 4, false)]);
    }
}
