//! IMU6 sample assembly.
//!
//! A sample arrives as an IMU start marker, a run of single-byte fragments
//! and an IMU end marker. Fragments are collected into a private event that
//! is only released once the end marker confirms the full sequence.

use crate::device_log;
use crate::logging::DeviceLog;
use crate::types::Imu6Event;
use log::Level;

/// Number of fragments in a complete sample (7 values, 2 bytes each).
pub const IMU_TOTAL_COUNT: u8 = 14;

pub const IMU_TYPE_TEMP: u8 = 0x01;
pub const IMU_TYPE_GYRO: u8 = 0x02;
pub const IMU_TYPE_ACCEL: u8 = 0x04;
pub const IMU_TYPE_ALL: u8 = IMU_TYPE_TEMP | IMU_TYPE_GYRO | IMU_TYPE_ACCEL;

/// LSB per g for an accelerometer range setting (0: ±2g .. 3: ±16g).
#[inline]
pub fn accel_scale(range: u8) -> f32 {
    65536.0 / (4u32 << (range & 0x03)) as f32
}

/// LSB per °/s for a gyroscope range setting (0: ±250 .. 3: ±2000).
#[inline]
pub fn gyro_scale(range: u8) -> f32 {
    65536.0 / (500u32 << (range & 0x03)) as f32
}

/// Mounting orientation and initial full-scale ranges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImuSettings {
    pub accel_range: u8,
    pub gyro_range: u8,
    pub flip_x: bool,
    pub flip_y: bool,
    pub flip_z: bool,
}

/// State machine for one IMU.
#[derive(Debug, Clone)]
pub struct ImuAssembler {
    ignore_events: bool,
    count: u8,
    tmp_data: u8,
    sensor_type: u8,
    accel_scale: f32,
    gyro_scale: f32,
    settings: ImuSettings,
    current: Imu6Event,
}

impl ImuAssembler {
    /// Creates an assembler that ignores fragments until the first start.
    pub fn new(settings: ImuSettings) -> Self {
        Self {
            ignore_events: true,
            count: 0,
            tmp_data: 0,
            sensor_type: IMU_TYPE_ALL,
            accel_scale: accel_scale(settings.accel_range),
            gyro_scale: gyro_scale(settings.gyro_range),
            settings,
            current: Imu6Event::default(),
        }
    }

    #[inline]
    pub fn is_ignoring(&self) -> bool {
        self.ignore_events
    }

    /// Drops any partial sample until the next start marker.
    #[inline]
    pub fn ignore_until_start(&mut self) {
        self.ignore_events = true;
    }

    pub fn start(&mut self, log: &DeviceLog) {
        device_log!(log, Level::Debug, "IMU6 Start event received.");

        self.ignore_events = false;
        self.count = 0;
        self.sensor_type = IMU_TYPE_ALL;
        self.current = Imu6Event::default();
    }

    /// Applies an IMU scale configuration byte.
    pub fn scale_config(&mut self, accel_range: u8, gyro_range: u8, sensor_type: u8, log: &DeviceLog) {
        if self.ignore_events {
            return;
        }
        device_log!(
            log,
            Level::Debug,
            "IMU Scale Config event received: accel={}, gyro={}, type={:#x}.",
            accel_range,
            gyro_range,
            sensor_type
        );

        self.accel_scale = accel_scale(accel_range);
        self.gyro_scale = gyro_scale(gyro_range);
        self.sensor_type = sensor_type & IMU_TYPE_ALL;

        // Start at the first enabled sensor.
        self.count = if self.sensor_type & IMU_TYPE_ACCEL != 0 {
            0
        } else if self.sensor_type & IMU_TYPE_TEMP != 0 {
            6
        } else if self.sensor_type & IMU_TYPE_GYRO != 0 {
            8
        } else {
            device_log!(log, Level::Error, "IMU Scale Config: no IMU sensors enabled.");
            IMU_TOTAL_COUNT
        };
    }

    /// Consumes one byte of sample data.
    pub fn data(&mut self, byte: u8, log: &DeviceLog) {
        if self.ignore_events {
            return;
        }

        match self.count {
            0 | 2 | 4 | 6 | 8 | 10 | 12 => self.tmp_data = byte,
            1 => self.current.accel_x = self.axis(byte, self.settings.flip_x) / self.accel_scale,
            3 => self.current.accel_y = self.axis(byte, self.settings.flip_y) / self.accel_scale,
            5 => {
                self.current.accel_z = self.axis(byte, self.settings.flip_z) / self.accel_scale;

                // Skip over disabled sensors.
                if self.sensor_type & IMU_TYPE_TEMP == 0 {
                    if self.sensor_type & IMU_TYPE_GYRO != 0 {
                        self.count += 2;
                    } else {
                        self.count += 8;
                    }
                }
            }
            7 => {
                let raw = self.raw_value(byte);
                self.current.temperature = (raw as f32 / 340.0) + 36.53;

                if self.sensor_type & IMU_TYPE_GYRO == 0 {
                    self.count += 6;
                }
            }
            9 => self.current.gyro_x = self.axis(byte, self.settings.flip_x) / self.gyro_scale,
            11 => self.current.gyro_y = self.axis(byte, self.settings.flip_y) / self.gyro_scale,
            13 => self.current.gyro_z = self.axis(byte, self.settings.flip_z) / self.gyro_scale,
            _ => device_log!(log, Level::Error, "Got invalid IMU update sequence."),
        }

        self.count = self.count.saturating_add(1);
    }

    /// Closes the sample. Returns it only if every expected fragment arrived.
    pub fn end(&mut self, timestamp: i32, log: &DeviceLog) -> Option<Imu6Event> {
        if self.ignore_events {
            return None;
        }
        device_log!(log, Level::Debug, "IMU End event received.");

        if self.count != IMU_TOTAL_COUNT {
            device_log!(
                log,
                Level::Warn,
                "IMU End: failed to validate IMU sample count ({}), discarding samples.",
                self.count
            );
            return None;
        }

        let mut event = self.current;
        event.timestamp = timestamp;
        Some(event)
    }

    #[inline]
    fn raw_value(&self, low: u8) -> i16 {
        i16::from_be_bytes([self.tmp_data, low])
    }

    #[inline]
    fn axis(&self, low: u8, flip: bool) -> f32 {
        let raw = self.raw_value(low);
        let value = if flip { raw.wrapping_neg() } else { raw };
        value as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::LevelFilter;

    fn quiet() -> DeviceLog {
        DeviceLog::new("test", LevelFilter::Off)
    }

    fn feed_value(imu: &mut ImuAssembler, value: i16, log: &DeviceLog) {
        let [high, low] = value.to_be_bytes();
        imu.data(high, log);
        imu.data(low, log);
    }

    #[test]
    fn test_scales() {
        assert_eq!(accel_scale(0), 16384.0);
        assert_eq!(accel_scale(3), 2048.0);
        assert_eq!(gyro_scale(0), 131.072);
        assert_eq!(gyro_scale(1), 65.536);
    }

    #[test]
    fn test_full_sample() {
        let log = quiet();
        let mut imu = ImuAssembler::new(ImuSettings::default());

        imu.start(&log);
        feed_value(&mut imu, 16384, &log); // 1 g
        feed_value(&mut imu, -8192, &log); // -0.5 g
        feed_value(&mut imu, 0, &log);
        feed_value(&mut imu, 340, &log); // 37.53 °C
        feed_value(&mut imu, 131, &log);
        feed_value(&mut imu, 0, &log);
        feed_value(&mut imu, -262, &log);

        let event = imu.end(1234, &log).expect("complete sample");
        assert_eq!(event.timestamp, 1234);
        assert_eq!(event.accel_x, 1.0);
        assert_eq!(event.accel_y, -0.5);
        assert_eq!(event.accel_z, 0.0);
        assert!((event.temperature - 37.53).abs() < 1e-4);
        assert!((event.gyro_x - 131.0 / 131.072).abs() < 1e-6);
        assert!((event.gyro_z - -262.0 / 131.072).abs() < 1e-6);
    }

    #[test]
    fn test_short_sample_discarded() {
        let log = quiet();
        let mut imu = ImuAssembler::new(ImuSettings::default());

        imu.start(&log);
        for _ in 0..9 {
            imu.data(0x01, &log);
        }
        assert_eq!(imu.end(10, &log), None);
    }

    #[test]
    fn test_ignored_until_start() {
        let log = quiet();
        let mut imu = ImuAssembler::new(ImuSettings::default());
        for _ in 0..IMU_TOTAL_COUNT {
            imu.data(0, &log);
        }
        assert_eq!(imu.end(5, &log), None);
        assert!(imu.is_ignoring());
    }

    #[test]
    fn test_forced_ignore_mid_sample() {
        let log = quiet();
        let mut imu = ImuAssembler::new(ImuSettings::default());
        imu.start(&log);
        for _ in 0..6 {
            imu.data(0, &log);
        }
        imu.ignore_until_start();
        for _ in 0..8 {
            imu.data(0, &log);
        }
        assert_eq!(imu.end(5, &log), None);
    }

    #[test]
    fn test_scale_config_with_accel_only() {
        let log = quiet();
        let mut imu = ImuAssembler::new(ImuSettings::default());

        imu.start(&log);
        imu.scale_config(1, 0, IMU_TYPE_ACCEL, &log);
        feed_value(&mut imu, 8192, &log); // 1 g at ±4g
        feed_value(&mut imu, 0, &log);
        feed_value(&mut imu, -8192, &log);

        let event = imu.end(77, &log).expect("accel-only sample");
        assert_eq!(event.accel_x, 1.0);
        assert_eq!(event.accel_z, -1.0);
        assert_eq!(event.gyro_x, 0.0);
    }

    #[test]
    fn test_scale_config_with_gyro_only() {
        let log = quiet();
        let mut imu = ImuAssembler::new(ImuSettings::default());

        imu.start(&log);
        imu.scale_config(0, 3, IMU_TYPE_GYRO, &log);
        feed_value(&mut imu, 164, &log);
        feed_value(&mut imu, 0, &log);
        feed_value(&mut imu, 0, &log);

        let event = imu.end(1, &log).expect("gyro-only sample");
        assert!((event.gyro_x - 164.0 / gyro_scale(3)).abs() < 1e-6);
    }

    #[test]
    fn test_flip_axes() {
        let log = quiet();
        let mut imu = ImuAssembler::new(ImuSettings {
            flip_x: true,
            ..ImuSettings::default()
        });

        imu.start(&log);
        feed_value(&mut imu, 16384, &log);
        for _ in 0..6 {
            feed_value(&mut imu, 0, &log);
        }
        let event = imu.end(1, &log).expect("complete sample");
        assert_eq!(event.accel_x, -1.0);
    }
}
