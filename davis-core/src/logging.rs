//! Per-device log filtering on top of the `log` facade.
//!
//! Every open device has its own level, changeable at runtime through the
//! host LOG configuration module while the I/O thread is logging. Messages
//! are prefixed with the device string so output from several devices can be
//! told apart.

use log::{Level, LevelFilter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared handle to a device's name and log level.
#[derive(Debug, Clone)]
pub struct DeviceLog {
    name: Arc<str>,
    level: Arc<AtomicUsize>,
}

impl DeviceLog {
    /// Creates a logger for `name` with the given initial level.
    pub fn new(name: impl Into<Arc<str>>, level: LevelFilter) -> Self {
        Self {
            name: name.into(),
            level: Arc::new(AtomicUsize::new(level as usize)),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level as usize <= self.level.load(Ordering::Relaxed)
    }

    pub fn level(&self) -> LevelFilter {
        level_filter_from_usize(self.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }
}

/// Maps the numeric form used on the config façade back to a filter.
pub fn level_filter_from_usize(value: usize) -> LevelFilter {
    match value {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Logs through the `log` facade if the device level allows it.
///
/// ```ignore
/// device_log!(self.log, Level::Error, "X address out of range: {}", x);
/// ```
#[macro_export]
macro_rules! device_log {
    ($log:expr, $level:expr, $($arg:tt)+) => {{
        let level: ::log::Level = $level;
        if $log.enabled(level) {
            ::log::log!(level, "{}: {}", $log.name(), format_args!($($arg)+));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filtering() {
        let log = DeviceLog::new("DAVIS346 ID-1", LevelFilter::Warn);
        assert!(log.enabled(Level::Error));
        assert!(log.enabled(Level::Warn));
        assert!(!log.enabled(Level::Info));

        let shared = log.clone();
        shared.set_level(LevelFilter::Debug);
        assert!(log.enabled(Level::Debug));
        assert_eq!(log.level(), LevelFilter::Debug);
        assert_eq!(log.name(), "DAVIS346 ID-1");
    }

    #[test]
    fn test_level_from_usize() {
        assert_eq!(level_filter_from_usize(0), LevelFilter::Off);
        assert_eq!(level_filter_from_usize(LevelFilter::Info as usize), LevelFilter::Info);
        assert_eq!(level_filter_from_usize(42), LevelFilter::Trace);
    }
}
