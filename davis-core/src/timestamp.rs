//! Reconstruction of a wide timestamp from narrow wire fragments.
//!
//! The device only sends the low 15 bits of its microsecond counter plus
//! explicit wrap markers. The tracker accumulates wraps into a 31-bit epoch
//! timestamp and counts how often that range was exhausted ("big wraps"), so
//! that `(wrap_overflow << 31) | current` is a monotonic 64-bit timestamp.

use crate::device_log;
use crate::logging::DeviceLog;
use log::Level;

/// Amount added to the base per unit of wrap multiplier.
pub const TS_WRAP_ADD: i32 = 0x8000;

/// Combines a wrap-overflow epoch with an epoch-relative timestamp.
#[inline]
pub fn full_timestamp(wrap_overflow: u32, timestamp: i32) -> i64 {
    ((wrap_overflow as i64) << 31) | (timestamp as i64 & 0x7FFF_FFFF)
}

/// Result of processing a wrap marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapOutcome {
    /// The base advanced inside the current epoch.
    Advanced,
    /// The 31-bit range was exceeded; a new epoch started.
    BigWrap,
}

/// Timestamp state for one device.
#[derive(Debug, Clone, Default)]
pub struct TimestampTracker {
    current: i32,
    last: i32,
    wrap_overflow: u32,
    wrap_add: i32,
    anomalies: u64,
}

impl TimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current epoch-relative timestamp.
    #[inline]
    pub fn current(&self) -> i32 {
        self.current
    }

    #[inline]
    pub fn last(&self) -> i32 {
        self.last
    }

    /// Number of big wraps seen since the last reset.
    #[inline]
    pub fn wrap_overflow(&self) -> u32 {
        self.wrap_overflow
    }

    #[inline]
    pub fn wrap_add(&self) -> i32 {
        self.wrap_add
    }

    /// 64-bit timestamp combining the epoch and the current value.
    #[inline]
    pub fn full(&self) -> i64 {
        full_timestamp(self.wrap_overflow, self.current)
    }

    /// Number of non-monotonic updates observed.
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Applies a 15-bit fragment on top of the accumulated wrap base.
    pub fn update_from_fragment(&mut self, fragment: u16, log: &DeviceLog) -> i32 {
        let value = self.wrap_add + (fragment & 0x7FFF) as i32;
        self.advance_to(value, log)
    }

    /// Moves the current timestamp to an externally computed value, checking
    /// monotonicity.
    pub fn advance_to(&mut self, timestamp: i32, log: &DeviceLog) -> i32 {
        self.last = self.current;
        self.current = timestamp;
        self.check_monotonic(log);
        self.current
    }

    /// Processes a wrap marker with the given multiplier.
    pub fn wrap(&mut self, multiplier: u16, log: &DeviceLog) -> WrapOutcome {
        let wrap_sum = self.wrap_add as i64 + TS_WRAP_ADD as i64 * multiplier as i64;

        if wrap_sum > i32::MAX as i64 {
            // Continue from the remainder in a fresh epoch.
            self.wrap_add = (wrap_sum - i32::MAX as i64 - 1) as i32;
            self.last = 0;
            self.current = self.wrap_add;
            self.wrap_overflow = self.wrap_overflow.wrapping_add(1);

            device_log!(
                log,
                Level::Info,
                "Timestamp big wrap detected, overflow counter is now {}.",
                self.wrap_overflow
            );

            WrapOutcome::BigWrap
        } else {
            self.wrap_add = wrap_sum as i32;
            self.last = self.current;
            self.current = self.wrap_add;
            self.check_monotonic(log);

            device_log!(
                log,
                Level::Debug,
                "Timestamp wrap event received with multiplier of {}.",
                multiplier
            );

            WrapOutcome::Advanced
        }
    }

    /// Zeroes all timestamp state, including the overflow counter.
    pub fn reset(&mut self, log: &DeviceLog) {
        self.wrap_overflow = 0;
        self.wrap_add = 0;
        self.last = 0;
        self.current = 0;

        device_log!(log, Level::Info, "Timestamp reset event received.");
    }

    #[inline]
    fn check_monotonic(&mut self, log: &DeviceLog) {
        if self.current <= self.last {
            self.anomalies += 1;
            device_log!(
                log,
                Level::Error,
                "ALERT: non-monotonic timestamp detected: last={}, current={}, difference={}.",
                self.last,
                self.current,
                self.last as i64 - self.current as i64
            );
        }
    }
}
