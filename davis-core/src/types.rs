//! Core event types produced by the translators.
//!
//! This module defines the decoded event structures and the raw wire codes
//! of the legacy 16-bit DAVIS protocol.
//!
//! Every event carries a 32-bit microsecond timestamp relative to the
//! wrap-overflow epoch of the packet it lives in (see
//! [`EventPacket::full_timestamp`](crate::packet::EventPacket::full_timestamp)).

/// A decoded DVS pixel-change (polarity) event.
///
/// Polarity events represent a brightness change at one pixel. `polarity` is
/// `true` for an increase (ON) and `false` for a decrease (OFF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PolarityEvent {
    /// Timestamp in microseconds
    pub timestamp: i32,
    /// X coordinate of the pixel
    pub x: u16,
    /// Y coordinate of the pixel
    pub y: u16,
    /// Event polarity: false = OFF, true = ON
    pub polarity: bool,
}

impl PolarityEvent {
    /// Creates a new polarity event.
    #[inline]
    pub fn new(timestamp: i32, x: u16, y: u16, polarity: bool) -> Self {
        Self {
            timestamp,
            x,
            y,
            polarity,
        }
    }
}

/// Kinds of special (control/marker) events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpecialEventType {
    /// 32-bit timestamp range exceeded, `ts_overflow` advanced.
    TimestampWrap = 0,
    /// Device timestamps were reset to zero.
    TimestampReset = 1,
    ExternalInputRisingEdge = 2,
    ExternalInputFallingEdge = 3,
    ExternalInputPulse = 4,
    ExternalGeneratorRisingEdge = 5,
    ExternalGeneratorFallingEdge = 6,
    ApsFrameStart = 7,
    ApsFrameEnd = 8,
    ApsExposureStart = 9,
    ApsExposureEnd = 10,
    /// Start of a MIPI sensor event readout.
    EventReadoutStart = 11,
}

impl SpecialEventType {
    /// Short upper-case name used by the writers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TimestampWrap => "TIMESTAMP_WRAP",
            Self::TimestampReset => "TIMESTAMP_RESET",
            Self::ExternalInputRisingEdge => "EXTERNAL_INPUT_RISING_EDGE",
            Self::ExternalInputFallingEdge => "EXTERNAL_INPUT_FALLING_EDGE",
            Self::ExternalInputPulse => "EXTERNAL_INPUT_PULSE",
            Self::ExternalGeneratorRisingEdge => "EXTERNAL_GENERATOR_RISING_EDGE",
            Self::ExternalGeneratorFallingEdge => "EXTERNAL_GENERATOR_FALLING_EDGE",
            Self::ApsFrameStart => "APS_FRAME_START",
            Self::ApsFrameEnd => "APS_FRAME_END",
            Self::ApsExposureStart => "APS_EXPOSURE_START",
            Self::ApsExposureEnd => "APS_EXPOSURE_END",
            Self::EventReadoutStart => "EVENT_READOUT_START",
        }
    }
}

/// A special event: timestamp markers, external inputs, readout brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialEvent {
    /// Timestamp in microseconds (`i32::MAX` for epoch markers)
    pub timestamp: i32,
    /// Marker kind
    pub kind: SpecialEventType,
    /// Optional payload, zero when unused
    pub data: u32,
}

impl SpecialEvent {
    /// Creates a new special event without payload.
    #[inline]
    pub fn new(timestamp: i32, kind: SpecialEventType) -> Self {
        Self {
            timestamp,
            kind,
            data: 0,
        }
    }
}

/// Color filter arrangement of the APS pixel array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFilter {
    #[default]
    Mono,
    /// 2x2 RGBG Bayer pattern
    Rgbg,
    /// RGBW pattern used by the cDAVIS sensors
    Rgbw,
}

/// A complete APS frame.
///
/// Pixels are row-major, `width * height * channels` samples, normalized to
/// 16-bit depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEvent {
    pub ts_start_frame: i32,
    pub ts_start_exposure: i32,
    pub ts_end_exposure: i32,
    pub ts_end_frame: i32,
    /// Window position on the pixel array
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub channels: u8,
    pub color_filter: ColorFilter,
    pub roi_id: u8,
    pub pixels: Vec<u16>,
}

impl FrameEvent {
    /// Timestamp at which the frame is placed in the event stream.
    #[inline]
    pub fn timestamp(&self) -> i32 {
        self.ts_start_exposure
    }

    /// Exposure duration in microseconds.
    pub fn exposure_length(&self) -> i32 {
        self.ts_end_exposure - self.ts_start_exposure
    }

    /// Returns the sample at (x, y) for single channel frames.
    pub fn pixel(&self, x: u16, y: u16) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * self.channels as usize;
        self.pixels.get(idx).copied()
    }
}

/// A 6-axis inertial measurement sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Imu6Event {
    /// Timestamp in microseconds
    pub timestamp: i32,
    /// Acceleration in g
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,
    /// Angular velocity in degrees per second
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    /// Temperature in degrees Celsius
    pub temperature: f32,
}

/// Event kinds, one container slot each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Special,
    Polarity,
    Frame,
    Imu6,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [Self::Special, Self::Polarity, Self::Frame, Self::Imu6];
}

/// Legacy 16-bit wire codes.
///
/// A data word (bit 15 clear) carries a 3-bit code in bits 14..12 that
/// selects how the 12-bit payload is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RawEventType {
    /// Special/control marker, payload is a [`SpecialCode`] (0x0)
    Special = 0x0,
    /// DVS Y address (0x1)
    AddrY = 0x1,
    /// DVS X address, polarity OFF (0x2)
    AddrXOff = 0x2,
    /// DVS X address, polarity ON (0x3)
    AddrXOn = 0x3,
    /// APS ADC sample (0x4)
    AdcSample = 0x4,
    /// 8-bit miscellaneous data (IMU samples, APS ROI, IMU scale) (0x5)
    Misc8 = 0x5,
    /// 10-bit miscellaneous data (APS exposure info) (0x6)
    Misc10 = 0x6,
    /// Timestamp wrap with 12-bit multiplier (0x7)
    TimestampWrap = 0x7,
}

impl RawEventType {
    /// Parses the 3-bit code of a data word.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Special),
            0x1 => Some(Self::AddrY),
            0x2 => Some(Self::AddrXOff),
            0x3 => Some(Self::AddrXOn),
            0x4 => Some(Self::AdcSample),
            0x5 => Some(Self::Misc8),
            0x6 => Some(Self::Misc10),
            0x7 => Some(Self::TimestampWrap),
            _ => None,
        }
    }
}

/// Payload values of a [`RawEventType::Special`] word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SpecialCode {
    Reserved = 0,
    TimestampReset = 1,
    ExternalInputFalling = 2,
    ExternalInputRising = 3,
    ExternalInputPulse = 4,
    ImuStart = 5,
    ImuEnd = 7,
    ApsGlobalShutterFrameStart = 8,
    ApsRollingShutterFrameStart = 9,
    ApsFrameEnd = 10,
    ApsResetColumnStart = 11,
    ApsSignalColumnStart = 12,
    ApsColumnEnd = 13,
    ApsExposureStart = 14,
    ApsExposureEnd = 15,
    ExternalGeneratorFalling = 16,
    ExternalGeneratorRising = 17,
}

impl SpecialCode {
    #[inline]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Reserved),
            1 => Some(Self::TimestampReset),
            2 => Some(Self::ExternalInputFalling),
            3 => Some(Self::ExternalInputRising),
            4 => Some(Self::ExternalInputPulse),
            5 => Some(Self::ImuStart),
            7 => Some(Self::ImuEnd),
            8 => Some(Self::ApsGlobalShutterFrameStart),
            9 => Some(Self::ApsRollingShutterFrameStart),
            10 => Some(Self::ApsFrameEnd),
            11 => Some(Self::ApsResetColumnStart),
            12 => Some(Self::ApsSignalColumnStart),
            13 => Some(Self::ApsColumnEnd),
            14 => Some(Self::ApsExposureStart),
            15 => Some(Self::ApsExposureEnd),
            16 => Some(Self::ExternalGeneratorFalling),
            17 => Some(Self::ExternalGeneratorRising),
            _ => None,
        }
    }
}

/// Sub-codes of a [`RawEventType::Misc8`] word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Misc8Code {
    /// One byte of an IMU sample
    ImuData = 0,
    /// APS ROI boundary, high byte
    RoiHigh = 1,
    /// APS ROI boundary, low byte
    RoiLow = 2,
    /// IMU full-scale ranges and enabled sensors
    ImuScaleConfig = 3,
}

impl Misc8Code {
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ImuData),
            1 => Some(Self::RoiHigh),
            2 => Some(Self::RoiLow),
            3 => Some(Self::ImuScaleConfig),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_type_parsing() {
        assert_eq!(RawEventType::from_u8(0x1), Some(RawEventType::AddrY));
        assert_eq!(RawEventType::from_u8(0x3), Some(RawEventType::AddrXOn));
        assert_eq!(RawEventType::from_u8(0x7), Some(RawEventType::TimestampWrap));
        assert_eq!(RawEventType::from_u8(0x8), None);
    }

    #[test]
    fn test_special_code_parsing() {
        assert_eq!(SpecialCode::from_u16(1), Some(SpecialCode::TimestampReset));
        assert_eq!(SpecialCode::from_u16(13), Some(SpecialCode::ApsColumnEnd));
        assert_eq!(SpecialCode::from_u16(6), None); // Unused
        assert_eq!(SpecialCode::from_u16(18), None);
    }

    #[test]
    fn test_polarity_event_creation() {
        let event = PolarityEvent::new(12345, 100, 200, true);
        assert_eq!(event.x, 100);
        assert_eq!(event.y, 200);
        assert!(event.polarity);
        assert_eq!(event.timestamp, 12345);
    }

    #[test]
    fn test_frame_pixel_lookup() {
        let frame = FrameEvent {
            ts_start_frame: 0,
            ts_start_exposure: 10,
            ts_end_exposure: 30,
            ts_end_frame: 40,
            x: 0,
            y: 0,
            width: 2,
            height: 2,
            channels: 1,
            color_filter: ColorFilter::Mono,
            roi_id: 0,
            pixels: vec![1, 2, 3, 4],
        };
        assert_eq!(frame.pixel(1, 0), Some(2));
        assert_eq!(frame.pixel(0, 1), Some(3));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(frame.exposure_length(), 20);
        assert_eq!(frame.timestamp(), 10);
    }

    #[test]
    fn test_special_event_names() {
        assert_eq!(SpecialEventType::TimestampWrap.name(), "TIMESTAMP_WRAP");
        assert_eq!(SpecialEventType::ApsFrameEnd.name(), "APS_FRAME_END");
    }
}
