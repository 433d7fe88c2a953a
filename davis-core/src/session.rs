//! An opened device: configuration, acquisition start/stop and the I/O
//! thread that turns transfers into packet containers.

use crate::chip::{DeviceInfo, WireProtocol};
use crate::config::{
    aps, cycles_to_micros, dvs, extinput, imu, micros_to_cycles, mux, sysinfo, validate_device_read,
    validate_device_write, ConfigError, HostConfig, RegisterBus, SessionConfig,
};
use crate::decoder::{new_translator, EventTranslator, TranslatorContext, TranslatorOptions};
use crate::device_log;
use crate::exchange::{DataExchange, Notify};
use crate::frame::ExposureControl;
use crate::logging::DeviceLog;
use crate::packet::EventPacketContainer;
use crate::transport::Transport;
use crate::types::FrameEvent;
use log::Level;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Errors of session lifecycle operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("acquisition is already running")]
    AlreadyRunning,

    #[error("acquisition is not running")]
    NotRunning,

    #[error("no transport attached")]
    NoTransport,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn I/O thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("I/O thread panicked")]
    ThreadPanicked,
}

/// Application notifications for one acquisition.
#[derive(Default)]
pub struct DataCallbacks {
    /// A container was added to the exchange
    pub on_increase: Option<Notify>,
    /// A container was taken from the exchange
    pub on_decrease: Option<Notify>,
    /// The I/O thread ended on its own (stream end or transfer failure)
    pub on_shutdown: Option<Box<dyn FnOnce() + Send>>,
}

type SharedBus = Arc<Mutex<Box<dyn RegisterBus>>>;
type SharedControl = Arc<Mutex<Box<dyn ExposureControl>>>;

fn lock_bus(bus: &SharedBus) -> Result<std::sync::MutexGuard<'_, Box<dyn RegisterBus>>, ConfigError> {
    bus.lock().map_err(|_| ConfigError::Bus("register bus lock poisoned".into()))
}

/// Exposure values are microseconds on the façade and clock cycles on the
/// device.
fn is_timing_param(module: i8, param: u8) -> bool {
    module == aps::MODULE && matches!(param, aps::EXPOSURE | aps::FRAME_INTERVAL)
}

fn device_write(bus: &SharedBus, info: &DeviceInfo, module: i8, param: u8, value: u32) -> Result<(), ConfigError> {
    let value = if is_timing_param(module, param) {
        micros_to_cycles(value, info.adc_clock)
    } else {
        value
    };
    validate_device_write(info, module, param, value)?;
    lock_bus(bus)?.write(module as u8, param, value)
}

fn device_read(bus: &SharedBus, info: &DeviceInfo, module: i8, param: u8) -> Result<u32, ConfigError> {
    validate_device_read(info, module, param)?;
    let value = lock_bus(bus)?.read(module as u8, param)?;
    Ok(if is_timing_param(module, param) {
        cycles_to_micros(value, info.adc_clock)
    } else {
        value
    })
}

/// Lets the translator of every acquisition use the same controller.
struct SessionExposure(SharedControl);

impl ExposureControl for SessionExposure {
    fn next_exposure(&mut self, frame: &FrameEvent, exposure_us: u32, last_set_us: u32) -> Option<u32> {
        let mut control = self.0.lock().ok()?;
        control.next_exposure(frame, exposure_us, last_set_us)
    }
}

/// An opened device.
pub struct DeviceSession {
    info: DeviceInfo,
    is_master: Arc<AtomicBool>,
    bus: SharedBus,
    transport: Option<Box<dyn Transport>>,
    host: Arc<HostConfig>,
    exposure_control: Option<SharedControl>,
    running: Arc<AtomicBool>,
    exchange: Option<Arc<DataExchange>>,
    io_thread: Option<JoinHandle<Box<dyn Transport>>>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("info", &self.info)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("exchange", &self.exchange)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Identifies the device behind `bus` and sends the initial
    /// configuration.
    pub fn open(
        mut bus: Box<dyn RegisterBus>,
        transport: Option<Box<dyn Transport>>,
        config: &SessionConfig,
        device_id: i16,
    ) -> Result<Self, SessionError> {
        let info = DeviceInfo::probe(bus.as_mut(), device_id)?;
        let log = DeviceLog::new(info.device_string.as_str(), config.log_level_filter()?);

        let session = Self {
            is_master: Arc::new(AtomicBool::new(info.is_master)),
            bus: Arc::new(Mutex::new(bus)),
            transport,
            host: Arc::new(HostConfig::new(config, log)),
            exposure_control: None,
            running: Arc::new(AtomicBool::new(false)),
            exchange: None,
            io_thread: None,
            info,
        };
        session.send_default_config(config)?;

        device_log!(
            session.host.log,
            Level::Debug,
            "Initialized device successfully (logic version {}, master {}).",
            session.info.logic_version,
            session.info.is_master
        );

        Ok(session)
    }

    /// Installs the controller consulted on every completed frame while
    /// autoexposure is enabled.
    pub fn with_exposure_control(mut self, control: Box<dyn ExposureControl>) -> Self {
        self.exposure_control = Some(Arc::new(Mutex::new(control)));
        self
    }

    fn send_default_config(&self, config: &SessionConfig) -> Result<(), ConfigError> {
        if self.info.has_aps() {
            let aps_config = &config.aps;
            device_write(&self.bus, &self.info, aps::MODULE, aps::RESET_READ, aps_config.reset_read as u32)?;
            if self.info.has_global_shutter() {
                device_write(
                    &self.bus,
                    &self.info,
                    aps::MODULE,
                    aps::GLOBAL_SHUTTER,
                    aps_config.global_shutter as u32,
                )?;
            }
            device_write(&self.bus, &self.info, aps::MODULE, aps::EXPOSURE, aps_config.exposure)?;
            device_write(&self.bus, &self.info, aps::MODULE, aps::FRAME_INTERVAL, aps_config.frame_interval)?;
        }

        if self.info.has_imu() {
            device_write(
                &self.bus,
                &self.info,
                imu::MODULE,
                imu::ACCEL_FULL_SCALE,
                config.imu.accel_full_scale as u32,
            )?;
            device_write(
                &self.bus,
                &self.info,
                imu::MODULE,
                imu::GYRO_FULL_SCALE,
                config.imu.gyro_full_scale as u32,
            )?;
        }

        Ok(())
    }

    /// Device information, with the master flag as last read.
    pub fn info(&self) -> DeviceInfo {
        let mut info = self.info.clone();
        info.is_master = self.is_master.load(Ordering::Acquire);
        info
    }

    pub fn protocol(&self) -> WireProtocol {
        self.info.chip.protocol()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Containers dropped because the exchange was full, for the current or
    /// last acquisition.
    pub fn dropped(&self) -> u64 {
        self.exchange.as_ref().map_or(0, |exchange| exchange.dropped())
    }

    /// Attaches the data source used by the next `data_start`.
    pub fn set_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn config_set(&self, module: i8, param: u8, value: u32) -> Result<(), ConfigError> {
        if HostConfig::is_host_param(module, param) {
            self.host.set(module, param, value)
        } else {
            device_write(&self.bus, &self.info, module, param, value)
        }
    }

    pub fn config_get(&self, module: i8, param: u8) -> Result<u32, ConfigError> {
        if HostConfig::is_host_param(module, param) {
            self.host.get(module, param)
        } else {
            device_read(&self.bus, &self.info, module, param)
        }
    }

    /// Register writes that switch the data producers on, in start order.
    fn producer_registers(&self) -> Vec<(i8, u8)> {
        let mut registers = vec![
            (mux::MODULE, mux::RUN_CHIP),
            (mux::MODULE, mux::TIMESTAMP_RUN),
            (mux::MODULE, mux::RUN),
            (dvs::MODULE, dvs::RUN),
        ];
        if self.info.has_aps() {
            registers.push((aps::MODULE, aps::RUN));
        }
        if self.info.has_imu() {
            registers.push((imu::MODULE, imu::RUN_ACCELEROMETER));
            registers.push((imu::MODULE, imu::RUN_GYROSCOPE));
            registers.push((imu::MODULE, imu::RUN_TEMPERATURE));
        }
        if self.info.has_external_input() {
            registers.push((extinput::MODULE, extinput::RUN_DETECTOR));
        }
        registers
    }

    fn set_producers(&self, enable: bool) -> Result<(), ConfigError> {
        let mut registers = self.producer_registers();
        if !enable {
            registers.reverse();
        }
        for (module, param) in registers {
            device_write(&self.bus, &self.info, module, param, enable as u32)?;
        }
        Ok(())
    }

    fn translator_options(&self) -> Result<TranslatorOptions, ConfigError> {
        let mut options = TranslatorOptions {
            reset_read: true,
            accel_range: 0,
            gyro_range: 0,
            exposure_us: 0,
        };
        if self.info.has_aps() {
            options.reset_read = device_read(&self.bus, &self.info, aps::MODULE, aps::RESET_READ)? != 0;
            options.exposure_us = device_read(&self.bus, &self.info, aps::MODULE, aps::EXPOSURE)?;
        }
        if self.info.has_imu() {
            options.accel_range = device_read(&self.bus, &self.info, imu::MODULE, imu::ACCEL_FULL_SCALE)? as u8;
            options.gyro_range = device_read(&self.bus, &self.info, imu::MODULE, imu::GYRO_FULL_SCALE)? as u8;
        }
        Ok(options)
    }

    /// Starts acquisition: enables the data producers and spawns the I/O
    /// thread.
    pub fn data_start(&mut self, callbacks: DataCallbacks) -> Result<(), SessionError> {
        if self.io_thread.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        let mut transport = self.transport.take().ok_or(SessionError::NoTransport)?;

        let options = match self.translator_options() {
            Ok(options) => options,
            Err(err) => {
                self.transport = Some(transport);
                return Err(err.into());
            }
        };

        let host = &self.host;
        if let Err(err) = transport.reconfigure(
            host.usb_buffer_number.load(Ordering::Relaxed),
            host.usb_buffer_size.load(Ordering::Relaxed),
        ) {
            device_log!(host.log, Level::Error, "Failed to set up transfers: {}.", err);
        }
        host.pending.usb_buffers.store(false, Ordering::Release);

        let exchange = Arc::new(DataExchange::new(
            host.exchange.clone(),
            callbacks.on_increase,
            callbacks.on_decrease,
        ));
        self.exchange = Some(exchange.clone());

        let ctx = TranslatorContext {
            limits: host.packets.clone(),
            exchange,
            running: self.running.clone(),
            pending: host.pending.clone(),
            autoexposure: host.autoexposure.clone(),
            log: host.log.clone(),
        };
        let control = self
            .exposure_control
            .clone()
            .map(|shared| Box::new(SessionExposure(shared)) as Box<dyn ExposureControl>);
        let translator = new_translator(ctx, &self.info, options, control);

        self.running.store(true, Ordering::Release);

        if host.exchange.start_producers.load(Ordering::Relaxed) {
            if let Err(err) = self.set_producers(true) {
                self.running.store(false, Ordering::Release);
                self.transport = Some(transport);
                return Err(err.into());
            }
        }

        let worker = IoWorker {
            transport,
            translator,
            bus: self.bus.clone(),
            info: self.info.clone(),
            is_master: self.is_master.clone(),
            host: self.host.clone(),
            running: self.running.clone(),
            on_shutdown: callbacks.on_shutdown,
        };

        let name = format!("{} I/O", self.info.chip.name());
        match thread::Builder::new().name(name).spawn(move || worker.run()) {
            Ok(handle) => {
                self.io_thread = Some(handle);
                device_log!(self.host.log, Level::Debug, "Acquisition started.");
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(SessionError::ThreadSpawn(err))
            }
        }
    }

    /// Takes one container from the exchange. Waits for data in blocking
    /// mode while acquisition runs.
    pub fn data_get(&self) -> Option<EventPacketContainer> {
        self.exchange.as_ref()?.get(&self.running)
    }

    /// Stops acquisition, joins the I/O thread, disables the producers and
    /// discards undelivered containers.
    pub fn data_stop(&mut self) -> Result<(), SessionError> {
        let handle = self.io_thread.take().ok_or(SessionError::NotRunning)?;

        self.running.store(false, Ordering::Release);
        let transport = handle.join().map_err(|_| SessionError::ThreadPanicked)?;
        self.transport = Some(transport);

        if self.host.exchange.stop_producers.load(Ordering::Relaxed) {
            self.set_producers(false)?;
        }

        if let Some(exchange) = &self.exchange {
            let drained = exchange.drain();
            device_log!(self.host.log, Level::Debug, "Acquisition stopped, {} containers discarded.", drained);
        }
        Ok(())
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.io_thread.is_some() {
            if let Err(err) = self.data_stop() {
                device_log!(self.host.log, Level::Error, "Failed to stop acquisition on close: {}.", err);
            }
        }
    }
}

/// Everything the I/O thread owns.
struct IoWorker {
    transport: Box<dyn Transport>,
    translator: Box<dyn EventTranslator>,
    bus: SharedBus,
    info: DeviceInfo,
    is_master: Arc<AtomicBool>,
    host: Arc<HostConfig>,
    running: Arc<AtomicBool>,
    on_shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl IoWorker {
    fn run(mut self) -> Box<dyn Transport> {
        let log = self.host.log.clone();
        let mut buffer = vec![0u8; self.transfer_size()];

        while self.running.load(Ordering::Acquire) {
            self.apply_pending(&mut buffer);

            match self.transport.next_transfer(&mut buffer) {
                Ok(Some(len)) => self.translator.translate(&buffer[..len]),
                Ok(None) => {
                    device_log!(log, Level::Info, "Data stream ended.");
                    self.translator.flush();
                    break;
                }
                Err(err) => {
                    device_log!(log, Level::Error, "Data transfer failed: {}.", err);
                    break;
                }
            }
        }

        self.transport.cancel();

        // Still set means nobody asked us to stop.
        if self.running.swap(false, Ordering::AcqRel) {
            device_log!(log, Level::Info, "Shutting down data acquisition.");
            if let Some(on_shutdown) = self.on_shutdown.take() {
                on_shutdown();
            }
        }

        self.transport
    }

    fn transfer_size(&self) -> usize {
        self.host.usb_buffer_size.load(Ordering::Relaxed).max(1) as usize
    }

    /// Work that must not run inside a transfer: transfer reconfiguration,
    /// master status re-read and register writes requested by the
    /// translator.
    fn apply_pending(&mut self, buffer: &mut Vec<u8>) {
        let pending = self.host.pending.clone();
        let log = &self.host.log;

        if pending.usb_buffers.swap(false, Ordering::AcqRel) {
            let transfers = self.host.usb_buffer_number.load(Ordering::Relaxed);
            let size = self.transfer_size();
            match self.transport.reconfigure(transfers, size as u32) {
                Ok(()) => buffer.resize(size, 0),
                Err(err) => device_log!(log, Level::Error, "Failed to reconfigure transfers: {}.", err),
            }
        }

        if pending.master_status.swap(false, Ordering::AcqRel) {
            match device_read(&self.bus, &self.info, sysinfo::MODULE, sysinfo::DEVICE_IS_MASTER) {
                Ok(value) => {
                    let is_master = value != 0;
                    self.is_master.store(is_master, Ordering::Release);
                    device_log!(log, Level::Info, "Timestamp master status: {}.", is_master);
                }
                Err(err) => device_log!(log, Level::Error, "Failed to read master status: {}.", err),
            }
        }

        while let Some(write) = pending.writes.pop() {
            if let Err(err) = device_write(&self.bus, &self.info, write.module, write.param, write.value) {
                device_log!(
                    log,
                    Level::Error,
                    "Deferred write to module {} parameter {} failed: {}.",
                    write.module,
                    write.param,
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::ChipVariant;
    use crate::config::{data_exchange, packets, usb, MemoryRegisters};
    use crate::transport::MemoryTransport;
    use crate::types::EventKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn words(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn open(chip: ChipVariant, transfers: Vec<Vec<u8>>) -> (DeviceSession, MemoryRegisters) {
        let info = DeviceInfo::for_chip(chip, 1);
        let registers = MemoryRegisters::for_device(&info);
        let session = DeviceSession::open(
            Box::new(registers.clone()),
            Some(Box::new(MemoryTransport::new(transfers))),
            &SessionConfig::default(),
            1,
        )
        .unwrap();
        (session, registers)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_open_sends_default_config() {
        let (session, registers) = open(ChipVariant::Davis346, Vec::new());
        assert_eq!(session.info().device_string, "DAVIS346 ID-1");

        // 4000 us and 40000 us at 30 MHz.
        assert_eq!(registers.get(aps::MODULE as u8, aps::EXPOSURE), Some(120_000));
        assert_eq!(registers.get(aps::MODULE as u8, aps::FRAME_INTERVAL), Some(1_200_000));
        assert_eq!(session.config_get(aps::MODULE, aps::EXPOSURE), Ok(4000));
        assert_eq!(registers.get(imu::MODULE as u8, imu::ACCEL_FULL_SCALE), Some(1));
    }

    #[test]
    fn test_config_routing() {
        let (session, registers) = open(ChipVariant::Davis346, Vec::new());

        session.config_set(packets::MODULE, packets::MAX_CONTAINER_INTERVAL, 500).unwrap();
        assert_eq!(session.config_get(packets::MODULE, packets::MAX_CONTAINER_INTERVAL), Ok(500));

        session.config_set(dvs::MODULE, dvs::RUN, 1).unwrap();
        assert_eq!(registers.get(dvs::MODULE as u8, dvs::RUN), Some(1));

        assert_eq!(
            session.config_set(sysinfo::MODULE, sysinfo::LOGIC_VERSION, 1),
            Err(ConfigError::ReadOnly {
                module: sysinfo::MODULE,
                param: sysinfo::LOGIC_VERSION
            })
        );
        assert_eq!(session.config_set(9, 0, 0), Err(ConfigError::UnknownModule(9)));
    }

    #[test]
    fn test_start_enables_producers_in_order() {
        let (mut session, registers) = open(ChipVariant::Davis346, Vec::new());
        let before = registers.writes().len();

        session.data_start(DataCallbacks::default()).unwrap();
        session.data_stop().unwrap();

        let writes: Vec<(u8, u8, u32)> = registers.writes()[before..].to_vec();
        let enabled: Vec<(u8, u8)> = writes.iter().filter(|w| w.2 == 1).map(|w| (w.0, w.1)).collect();
        assert_eq!(
            enabled,
            vec![
                (0, mux::RUN_CHIP),
                (0, mux::TIMESTAMP_RUN),
                (0, mux::RUN),
                (1, dvs::RUN),
                (2, aps::RUN),
                (3, imu::RUN_ACCELEROMETER),
                (3, imu::RUN_GYROSCOPE),
                (3, imu::RUN_TEMPERATURE),
                (4, extinput::RUN_DETECTOR),
            ]
        );

        let disabled: Vec<(u8, u8)> = writes.iter().filter(|w| w.2 == 0).map(|w| (w.0, w.1)).collect();
        let mut expected = enabled.clone();
        expected.reverse();
        assert_eq!(disabled, expected);
    }

    #[test]
    fn test_producers_left_alone_when_disabled() {
        let (mut session, registers) = open(ChipVariant::Davis346, Vec::new());
        session
            .config_set(data_exchange::MODULE, data_exchange::START_PRODUCERS, 0)
            .unwrap();
        session
            .config_set(data_exchange::MODULE, data_exchange::STOP_PRODUCERS, 0)
            .unwrap();
        let before = registers.writes().len();

        session.data_start(DataCallbacks::default()).unwrap();
        session.data_stop().unwrap();
        assert_eq!(registers.writes().len(), before);
    }

    #[test]
    fn test_start_twice_and_stop_twice() {
        let (mut session, _) = open(ChipVariant::Davis346, Vec::new());
        session.data_start(DataCallbacks::default()).unwrap();
        assert!(matches!(
            session.data_start(DataCallbacks::default()),
            Err(SessionError::AlreadyRunning)
        ));
        session.data_stop().unwrap();
        assert!(matches!(session.data_stop(), Err(SessionError::NotRunning)));

        // The transport is handed back for the next start.
        session.data_start(DataCallbacks::default()).unwrap();
        session.data_stop().unwrap();
    }

    #[test]
    fn test_no_transport() {
        let info = DeviceInfo::for_chip(ChipVariant::Davis240C, 1);
        let mut session = DeviceSession::open(
            Box::new(MemoryRegisters::for_device(&info)),
            None,
            &SessionConfig::default(),
            1,
        )
        .unwrap();
        assert!(matches!(
            session.data_start(DataCallbacks::default()),
            Err(SessionError::NoTransport)
        ));
    }

    #[test]
    fn test_stream_end_delivers_data_and_notifies() {
        let transfers = vec![words(&[0x8000 | 10, 0x1005]), words(&[0x2007, 0x3008])];
        let (mut session, _) = open(ChipVariant::Davis346, transfers);

        let increases = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let callbacks = DataCallbacks {
            on_increase: Some({
                let increases = increases.clone();
                Box::new(move || {
                    increases.fetch_add(1, Ordering::Relaxed);
                })
            }),
            on_decrease: None,
            on_shutdown: Some({
                let shutdown = shutdown.clone();
                Box::new(move || shutdown.store(true, Ordering::Release))
            }),
        };

        session.data_start(callbacks).unwrap();
        wait_until(|| shutdown.load(Ordering::Acquire));
        assert!(!session.is_running());

        let container = session.data_get().unwrap();
        assert_eq!(container.event_count(EventKind::Polarity), 2);
        assert_eq!(increases.load(Ordering::Relaxed), 1);

        session.data_stop().unwrap();
        assert!(session.data_get().is_none());
    }

    #[test]
    fn test_timestamp_reset_rereads_master_status() {
        let transfers = vec![words(&[0x8000 | 10, 0x0001])];
        let (mut session, registers) = open(ChipVariant::Davis346, transfers);
        assert!(session.info().is_master);

        registers.set(sysinfo::MODULE as u8, sysinfo::DEVICE_IS_MASTER, 0);
        session.data_start(DataCallbacks::default()).unwrap();
        wait_until(|| !session.is_running());
        session.data_stop().unwrap();

        // Read back before the end of stream was seen.
        assert!(!session.host.pending.master_status.load(Ordering::Acquire));
        assert!(!session.info().is_master);
    }

    #[test]
    fn test_usb_reconfiguration_is_deferred() {
        let (mut session, _) = open(ChipVariant::Davis346, Vec::new());
        session.config_set(usb::MODULE, usb::BUFFER_SIZE, 1024).unwrap();
        assert!(session.host.pending.usb_buffers.load(Ordering::Acquire));

        // Applied as part of the start.
        session.data_start(DataCallbacks::default()).unwrap();
        assert!(!session.host.pending.usb_buffers.load(Ordering::Acquire));
        session.data_stop().unwrap();
    }

    #[test]
    fn test_deferred_write_uses_device_path() {
        let (session, registers) = open(ChipVariant::Davis346, Vec::new());
        session.host.pending.push_write(aps::MODULE, aps::EXPOSURE, 100);

        let mut worker = IoWorker {
            transport: Box::new(MemoryTransport::default()),
            translator: Box::new(crate::mipi::MipiTranslator::new(
                TranslatorContext {
                    limits: session.host.packets.clone(),
                    exchange: Arc::new(DataExchange::new(session.host.exchange.clone(), None, None)),
                    running: session.running.clone(),
                    pending: session.host.pending.clone(),
                    autoexposure: session.host.autoexposure.clone(),
                    log: session.host.log.clone(),
                },
                &session.info,
            )),
            bus: session.bus.clone(),
            info: session.info.clone(),
            is_master: session.is_master.clone(),
            host: session.host.clone(),
            running: session.running.clone(),
            on_shutdown: None,
        };
        session.host.pending.master_status.store(true, Ordering::Release);
        registers.set(sysinfo::MODULE as u8, sysinfo::DEVICE_IS_MASTER, 0);

        let mut buffer = Vec::new();
        worker.apply_pending(&mut buffer);

        assert_eq!(registers.get(aps::MODULE as u8, aps::EXPOSURE), Some(3000));
        assert!(!session.info().is_master);
    }

    #[test]
    fn test_mipi_session_skips_missing_modules() {
        let (mut session, registers) = open(ChipVariant::MipiCx3, Vec::new());
        assert_eq!(session.protocol(), WireProtocol::Mipi32);
        let before = registers.writes().len();

        session.data_start(DataCallbacks::default()).unwrap();
        session.data_stop().unwrap();

        let enabled: Vec<(u8, u8)> = registers.writes()[before..]
            .iter()
            .filter(|w| w.2 == 1)
            .map(|w| (w.0, w.1))
            .collect();
        assert_eq!(
            enabled,
            vec![(0, mux::RUN_CHIP), (0, mux::TIMESTAMP_RUN), (0, mux::RUN), (1, dvs::RUN)]
        );
    }
}
