//! Translator for the 32-bit word stream of the MIPI CX3 bridge.
//!
//! The bridge forwards a DVXplorer-class sensor readout: column markers carry
//! the column address and a sub-millisecond timestamp, group events carry up
//! to 16 pixel events of one column, and reference words carry the
//! millisecond time base. Only polarity and special packets are produced.

use crate::chip::DeviceInfo;
use crate::decoder::{whole_units, EventStream, EventTranslator, TranslatorContext};
use crate::device_log;
use crate::packet::PacketError;
use crate::parser;
use crate::types::SpecialEventType;
use log::Level;

/// Microseconds per reference tick.
const REFERENCE_STEP: u32 = 1000;

/// Reference and sub-timestamp bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
struct ReferenceClock {
    last_reference: u32,
    current_reference: u32,
    last_sub: u16,
}

impl ReferenceClock {
    /// Returns the absolute timestamp of a column with sub-timestamp `sub`.
    fn column(&mut self, sub: u16) -> u32 {
        if sub != self.last_sub {
            // A sub-timestamp wrap without a new reference means a reference
            // word was lost.
            if self.current_reference == self.last_reference && sub < self.last_sub {
                self.last_reference = self.last_reference.wrapping_add(REFERENCE_STEP);
            }
            self.current_reference = self.last_reference;
        }
        self.last_sub = sub;
        self.current_reference.wrapping_add(sub as u32)
    }

    fn reference(&mut self, milliseconds: u32) {
        self.last_reference = milliseconds.wrapping_mul(REFERENCE_STEP);
    }
}

#[derive(Debug)]
pub struct MipiTranslator {
    stream: EventStream,
    clock: ReferenceClock,
    size_x: u16,
    size_y: u16,
    last_x: u16,
}

impl MipiTranslator {
    pub fn new(ctx: TranslatorContext, info: &DeviceInfo) -> Self {
        let (size_x, size_y) = info.dvs_size;
        Self {
            stream: EventStream::new(&ctx, info.device_id),
            clock: ReferenceClock::default(),
            size_x,
            size_y,
            last_x: 0,
        }
    }

    fn handle_word(&mut self, word: u32) -> Result<(), PacketError> {
        if parser::mipi_is_group(word) {
            if !self.stream.generator.has_commit_timestamp() {
                return Ok(());
            }
            if parser::mipi_is_mgroup(word) {
                device_log!(self.stream.log, Level::Error, "CRITICAL: MGROUP not handled.");
                return Ok(());
            }
            return self.single_group(word);
        }

        if parser::mipi_is_column(word) {
            self.column(word)?;
        }

        if parser::mipi_is_timestamp_reference(word) {
            self.clock.reference(parser::timestamp_reference_get_ms(word));
        }

        Ok(())
    }

    fn single_group(&mut self, word: u32) -> Result<(), PacketError> {
        let base_y = parser::sgroup_get_address(word) * 8;
        let mask = parser::sgroup_get_mask(word);
        let x = self.last_x;

        if x >= self.size_x {
            device_log!(
                self.stream.log,
                Level::Error,
                "ALERT: DVS: X address out of range (0-{}): {}.",
                self.size_x.saturating_sub(1),
                x
            );
            return Ok(());
        }

        for i in 0..16u16 {
            if mask & (0x8000 >> i) == 0 {
                continue;
            }

            let y = base_y + 7 - (i & 0x07);
            if y >= self.size_y {
                device_log!(
                    self.stream.log,
                    Level::Error,
                    "ALERT: DVS: Y address out of range (0-{}): {}.",
                    self.size_y.saturating_sub(1),
                    y
                );
                continue;
            }

            self.stream.polarity(x, y, i >= 8)?;
        }

        Ok(())
    }

    fn column(&mut self, word: u32) -> Result<(), PacketError> {
        self.last_x = parser::column_get_address(word);

        let timestamp = self.clock.column(parser::column_get_timestamp_sub(word));
        self.stream
            .timestamps
            .advance_to(timestamp as i32, &self.stream.log);
        self.stream.timestamp_known();

        if parser::column_is_start_of_frame(word) {
            device_log!(self.stream.log, Level::Debug, "Start of Frame column marker detected.");
            self.stream.special(SpecialEventType::EventReadoutStart)?;
        }

        Ok(())
    }
}

impl EventTranslator for MipiTranslator {
    fn translate(&mut self, bytes: &[u8]) {
        if !self.stream.is_running() {
            return;
        }
        let bytes = whole_units(bytes, 4, &self.stream.log);

        for word in parser::words_be32(bytes) {
            if let Err(err) = self.handle_word(word) {
                self.stream.allocation_failed(&err);
                return;
            }
            self.stream.after_unit(None);
        }
    }

    fn flush(&mut self) {
        self.stream.flush();
    }
}
