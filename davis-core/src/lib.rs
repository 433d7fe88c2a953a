//! Host-side event translation for DAVIS and MIPI event cameras.
//!
//! A device delivers a stream of USB bulk transfers. This crate turns that
//! stream into typed event packets (polarity, special, frame, IMU6), groups
//! them into containers by size and time, and hands the containers to the
//! application through a bounded queue.
//!
//! # Example
//!
//! ```no_run
//! use davis_core::config::{MemoryRegisters, SessionConfig};
//! use davis_core::session::{DataCallbacks, DeviceSession};
//! use davis_core::transport::ReaderTransport;
//! use davis_core::{ChipVariant, DeviceInfo};
//! use std::fs::File;
//!
//! // Registers of a simulated DAVIS346; real hardware provides its own bus.
//! let bus = Box::new(MemoryRegisters::for_device(&DeviceInfo::for_chip(ChipVariant::Davis346, 1)));
//! let transport = ReaderTransport::new(File::open("capture.bin").unwrap(), 8192);
//! let mut session =
//!     DeviceSession::open(bus, Some(Box::new(transport)), &SessionConfig::default(), 1).unwrap();
//!
//! session.data_start(DataCallbacks::default()).unwrap();
//! while let Some(container) = session.data_get() {
//!     println!("{} events", container.total_events());
//! }
//! session.data_stop().unwrap();
//! ```
//!
//! For recordings that do not need a session, [`OfflineDecoder`] decodes a
//! byte buffer or file directly.
//!
//! # Features
//!
//! - Legacy 16-bit DAVIS protocol: polarity, special markers, APS frames with
//!   correlated double sampling, IMU6 samples
//! - 32-bit MIPI CX3 protocol with reference-clock reconstruction
//! - 64-bit timestamps from 31-bit device time and wrap-overflow epochs
//! - Size- and time-bounded container commits, forced on epoch changes
//! - Lock-free runtime configuration between application and I/O thread

pub mod chip;
pub mod config;
pub mod container;
pub mod decoder;
pub mod exchange;
pub mod frame;
pub mod imu;
pub mod logging;
pub mod mipi;
pub mod output;
pub mod packet;
pub mod parser;
pub mod session;
pub mod timestamp;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use chip::{ChipVariant, DeviceInfo};
pub use config::{ConfigError, SessionConfig};
pub use decoder::{DecodeError, EventTranslator, OfflineDecoder};
pub use output::{FieldOrder, OutputError};
pub use packet::{EventPacket, EventPacketContainer};
pub use session::{DataCallbacks, DeviceSession, SessionError};
pub use transport::{Transport, TransportError};
pub use types::{EventKind, FrameEvent, Imu6Event, PolarityEvent, SpecialEvent, SpecialEventType};
