#![allow(clippy::unusual_byte_groupings)]
//! Low-level parsing of raw wire units.
//!
//! The legacy DAVIS protocol sends little-endian 16-bit words, the MIPI
//! bridge sends big-endian 32-bit words. The functions here only extract
//! fields; all state lives in the translators.

use crate::types::{Misc8Code, RawEventType, SpecialCode};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Splits a transfer into little-endian 16-bit words, ignoring a trailing
/// odd byte.
#[inline]
pub fn words_le16(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes.chunks_exact(2).map(LittleEndian::read_u16)
}

/// Splits a transfer into big-endian 32-bit words, ignoring trailing bytes.
#[inline]
pub fn words_be32(bytes: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bytes.chunks_exact(4).map(BigEndian::read_u32)
}

// ============================================================================
// Legacy 16-bit words
// Bits: [15] is_timestamp | [14:12] code | [11:0] data
// Timestamp words: [15] = 1 | [14:0] timestamp fragment
// ============================================================================

/// Returns true if the word is a timestamp fragment.
#[inline]
pub fn is_timestamp(word: u16) -> bool {
    word & 0x8000 != 0
}

/// Extracts the 15-bit timestamp fragment.
#[inline]
pub fn timestamp_get_value(word: u16) -> u16 {
    word & 0x7FFF // bits 14:0
}

/// Extracts the 3-bit code of a data word.
#[inline]
pub fn get_code(word: u16) -> u8 {
    ((word >> 12) & 0x7) as u8
}

/// Extracts the 12-bit payload of a data word.
#[inline]
pub fn get_data(word: u16) -> u16 {
    word & 0x0FFF
}

// ============================================================================
// MISC8 (code = 5)
// Data: [11:8] misc8 code | [7:0] misc8 data
// ============================================================================

#[inline]
pub fn misc8_get_code(data: u16) -> u8 {
    ((data >> 8) & 0x0F) as u8
}

#[inline]
pub fn misc8_get_data(data: u16) -> u8 {
    (data & 0x00FF) as u8
}

// IMU scale config: [7:5] enabled sensors | [4] unused | [3:2] accel | [1:0] gyro

/// Extracts the accelerometer full-scale range (0..=3) from an IMU scale
/// config payload.
#[inline]
pub fn imu_scale_get_accel_range(data: u8) -> u8 {
    (data >> 2) & 0x03
}

/// Extracts the gyroscope full-scale range (0..=3).
#[inline]
pub fn imu_scale_get_gyro_range(data: u8) -> u8 {
    data & 0x03
}

/// Extracts the enabled-sensor bits (temp = 1, gyro = 2, accel = 4).
#[inline]
pub fn imu_scale_get_type(data: u8) -> u8 {
    (data >> 5) & 0x07
}

// ============================================================================
// MISC10 (code = 6)
// Data: [11:10] misc10 code | [9:0] misc10 data
// ============================================================================

#[inline]
pub fn misc10_get_code(data: u16) -> u8 {
    ((data >> 10) & 0x03) as u8
}

#[inline]
pub fn misc10_get_data(data: u16) -> u16 {
    data & 0x03FF
}

/// Parses the code of a data word.
#[inline]
pub fn parse_event_type(word: u16) -> Option<RawEventType> {
    RawEventType::from_u8(get_code(word))
}

/// Parses the payload of a special word.
#[inline]
pub fn parse_special_code(data: u16) -> Option<SpecialCode> {
    SpecialCode::from_u16(data)
}

/// Parses the sub-code of a misc8 payload.
#[inline]
pub fn parse_misc8_code(data: u16) -> Option<Misc8Code> {
    Misc8Code::from_u8(misc8_get_code(data))
}

// ============================================================================
// MIPI group events
// Bits: [31] group | [30:26] kind (non-zero = MGROUP) | [23:18] group address
//       | [15:8] ON mask | [7:0] OFF mask
// ============================================================================

/// Returns true for pixel group events.
#[inline]
pub fn mipi_is_group(word: u32) -> bool {
    word & 0x8000_0000 != 0
}

/// Returns true for multi-group events, which carry a different layout.
#[inline]
pub fn mipi_is_mgroup(word: u32) -> bool {
    word & 0x7600_0000 != 0
}

/// Extracts the 6-bit SGROUP address; each group covers 8 rows.
#[inline]
pub fn sgroup_get_address(word: u32) -> u16 {
    ((word >> 18) & 0x3F) as u16
}

/// Extracts the 16-bit event mask of an SGROUP word.
#[inline]
pub fn sgroup_get_mask(word: u32) -> u16 {
    (word & 0xFFFF) as u16
}

// ============================================================================
// MIPI column events
// Bits: [26] = 1 | [21] start of frame | [20:11] timestamp sub | [9:0] column
// ============================================================================

#[inline]
pub fn mipi_is_column(word: u32) -> bool {
    word & 0x0400_0000 != 0
}

#[inline]
pub fn column_get_address(word: u32) -> u16 {
    (word & 0x03FF) as u16
}

/// Extracts the 10-bit sub-millisecond timestamp in microseconds.
#[inline]
pub fn column_get_timestamp_sub(word: u32) -> u16 {
    ((word >> 11) & 0x03FF) as u16
}

#[inline]
pub fn column_is_start_of_frame(word: u32) -> bool {
    (word >> 21) & 0x01 != 0
}

// ============================================================================
// MIPI timestamp reference
// Bits: [27] = 1 | [21:0] reference in milliseconds
// ============================================================================

#[inline]
pub fn mipi_is_timestamp_reference(word: u32) -> bool {
    word & 0x0800_0000 != 0
}

#[inline]
pub fn timestamp_reference_get_ms(word: u32) -> u32 {
    word & 0x003F_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_word_parsing() {
        let word: u16 = 0b1_000000001100100;
        assert!(is_timestamp(word));
        assert_eq!(timestamp_get_value(word), 100);
        assert!(!is_timestamp(0x1005));
    }

    #[test]
    fn test_data_word_parsing() {
        // code=1 (Y address), data=5
        assert_eq!(parse_event_type(0x1005), Some(RawEventType::AddrY));
        assert_eq!(get_data(0x1005), 5);

        // code=3 (X address ON), data=0x123
        let word: u16 = 0b0_011_000100100011;
        assert_eq!(get_code(word), 3);
        assert_eq!(get_data(word), 0x123);
    }

    #[test]
    fn test_misc8_parsing() {
        // misc8 code=2 (ROI low), data=0xAB
        let data: u16 = 0x2AB;
        assert_eq!(parse_misc8_code(data), Some(Misc8Code::RoiLow));
        assert_eq!(misc8_get_data(data), 0xAB);
    }

    #[test]
    fn test_imu_scale_parsing() {
        // type=accel|gyro|temp, accel range=2, gyro range=1
        let data: u8 = 0b111_0_10_01;
        assert_eq!(imu_scale_get_type(data), 0b111);
        assert_eq!(imu_scale_get_accel_range(data), 2);
        assert_eq!(imu_scale_get_gyro_range(data), 1);
    }

    #[test]
    fn test_misc10_parsing() {
        let data: u16 = 0b01_1111111111;
        assert_eq!(misc10_get_code(data), 1);
        assert_eq!(misc10_get_data(data), 0x3FF);
    }

    #[test]
    fn test_mipi_column_parsing() {
        // column=300, sub=512, start of frame
        let word: u32 = 0x0400_0000 | (1 << 21) | (512 << 11) | 300;
        assert!(!mipi_is_group(word));
        assert!(mipi_is_column(word));
        assert!(!mipi_is_timestamp_reference(word));
        assert_eq!(column_get_address(word), 300);
        assert_eq!(column_get_timestamp_sub(word), 512);
        assert!(column_is_start_of_frame(word));
    }

    #[test]
    fn test_mipi_group_parsing() {
        let word: u32 = 0x8000_0000 | (5 << 18) | 0x8001;
        assert!(mipi_is_group(word));
        assert!(!mipi_is_mgroup(word));
        assert_eq!(sgroup_get_address(word), 5);
        assert_eq!(sgroup_get_mask(word), 0x8001);
        assert!(mipi_is_mgroup(0x8000_0000 | 0x0200_0000));
    }

    #[test]
    fn test_word_splitting() {
        let bytes = [0x05, 0x10, 0x07, 0x20, 0xFF];
        let words: Vec<u16> = words_le16(&bytes).collect();
        assert_eq!(words, vec![0x1005, 0x2007]);

        let bytes = [0x08, 0x00, 0x00, 0x2A, 0x01];
        let words: Vec<u32> = words_be32(&bytes).collect();
        assert_eq!(words, vec![0x0800_002A]);
    }
}
