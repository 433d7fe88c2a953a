//! APS frame assembly.
//!
//! A frame is read out column by column, first the reset samples and then
//! the signal samples (or interleaved, depending on the shutter mode), and
//! bracketed by frame start/end markers. Samples are accumulated in private
//! buffers; a [`FrameEvent`] is only produced when the end marker arrives
//! and every column count matches the configured window.

use crate::device_log;
use crate::logging::DeviceLog;
use crate::types::{ColorFilter, FrameEvent};
use log::Level;

/// Bits per ADC sample.
pub const APS_ADC_DEPTH: u32 = 10;
/// Largest legal ADC sample.
pub const APS_ADC_MAX: i32 = (1 << APS_ADC_DEPTH) - 1;
pub const APS_ADC_CHANNELS: u8 = 1;

/// Correlated double sampling: clamps `reset - signal` to the ADC range and
/// scales it to 16-bit depth.
#[inline]
pub fn correlated_double_sample(reset: u16, signal: u16) -> u16 {
    let value = (reset as i32 - signal as i32).clamp(0, APS_ADC_MAX);
    (value << (16 - APS_ADC_DEPTH)) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readout {
    Reset = 0,
    Signal = 1,
}

/// Static APS readout parameters for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApsSettings {
    /// Pixel array size
    pub size_x: u16,
    pub size_y: u16,
    pub flip_x: bool,
    pub flip_y: bool,
    pub invert_xy: bool,
    /// Whether reset samples are read for every frame
    pub reset_read: bool,
    /// Samples need doubling to reach the full ADC range
    pub double_samples: bool,
    /// cDAVIS readout: interleaved RGB rows and inverted global shutter order
    pub cdavis_readout: bool,
    pub color_filter: ColorFilter,
}

impl ApsSettings {
    /// Full-array, mono, reset-read settings for a `size_x` x `size_y` array.
    pub fn new(size_x: u16, size_y: u16) -> Self {
        Self {
            size_x,
            size_y,
            flip_x: false,
            flip_y: false,
            invert_xy: false,
            reset_read: true,
            double_samples: false,
            cdavis_readout: false,
            color_filter: ColorFilter::Mono,
        }
    }
}

/// Readout window of the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApsWindow {
    pub position_x: u16,
    pub position_y: u16,
    pub size_x: u16,
    pub size_y: u16,
}

/// Window boundaries as sent by the device, one byte pair at a time.
#[derive(Debug, Clone, Copy, Default)]
struct RoiUpdate {
    tmp_data: u16,
    step: u8,
    start_column: u16,
    start_row: u16,
    end_column: u16,
}

/// Hands completed frames to an application-supplied exposure controller.
pub trait ExposureControl: Send {
    /// Returns a new exposure time in microseconds, or `None` to keep the
    /// current one. `exposure_us` is what the device reported for `frame`.
    fn next_exposure(&mut self, frame: &FrameEvent, exposure_us: u32, last_set_us: u32) -> Option<u32>;
}

/// Result of a frame end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEnd {
    /// Assembly was suspended; nothing to report.
    Ignored,
    /// The column counts did not match; the frame is dropped.
    Invalid,
    Complete(FrameEvent),
}

/// State machine for the APS readout.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    settings: ApsSettings,
    ignore_events: bool,
    global_shutter: bool,
    readout: Readout,
    count_x: [u16; 2],
    count_y: [u16; 2],
    expected_count_x: u16,
    expected_count_y: u16,
    window: ApsWindow,
    roi: RoiUpdate,
    // First sample of each pixel (reset, or signal on cDAVIS global shutter).
    held_samples: Vec<u16>,
    pixels: Vec<u16>,
    ts_start_frame: i32,
    ts_start_exposure: i32,
    ts_end_exposure: i32,
    exposure_tmp: u8,
    device_exposure: u32,
    cdavis_offset: i32,
    cdavis_decreasing: bool,
}

impl FrameAssembler {
    /// Creates an assembler for the full array, ignoring samples until the
    /// first frame start.
    pub fn new(settings: ApsSettings) -> Self {
        let area = settings.size_x as usize * settings.size_y as usize * APS_ADC_CHANNELS as usize;
        let window = ApsWindow {
            position_x: 0,
            position_y: 0,
            size_x: settings.size_x,
            size_y: settings.size_y,
        };
        let mut assembler = Self {
            settings,
            ignore_events: true,
            global_shutter: false,
            readout: Readout::Reset,
            count_x: [0; 2],
            count_y: [0; 2],
            expected_count_x: 0,
            expected_count_y: 0,
            window,
            roi: RoiUpdate::default(),
            held_samples: vec![0; area],
            pixels: vec![0; area],
            ts_start_frame: 0,
            ts_start_exposure: 0,
            ts_end_exposure: 0,
            exposure_tmp: 0,
            device_exposure: 0,
            cdavis_offset: 0,
            cdavis_decreasing: false,
        };
        assembler.update_expected_counts();
        assembler
    }

    #[inline]
    pub fn is_ignoring(&self) -> bool {
        self.ignore_events
    }

    /// Drops the partial frame until the next start marker.
    #[inline]
    pub fn ignore_until_start(&mut self) {
        self.ignore_events = true;
    }

    pub fn window(&self) -> ApsWindow {
        self.window
    }

    pub fn expected_counts(&self) -> (u16, u16) {
        (self.expected_count_x, self.expected_count_y)
    }

    /// Exposure of the frame in progress, in ADC clock cycles, as reported
    /// by the device.
    pub fn device_exposure(&self) -> u32 {
        self.device_exposure
    }

    /// Frame start marker (global or rolling shutter).
    pub fn start_frame(&mut self, global_shutter: bool, timestamp: i32, log: &DeviceLog) {
        device_log!(
            log,
            Level::Debug,
            "APS {} Frame Start event received.",
            if global_shutter { "GS" } else { "RS" }
        );

        self.global_shutter = global_shutter;
        self.ignore_events = false;
        self.exposure_tmp = 0;
        self.device_exposure = 0;
        self.roi = RoiUpdate::default();
        self.readout = Readout::Reset;
        self.count_x = [0; 2];
        self.count_y = [0; 2];
        self.ts_start_frame = timestamp;
    }

    /// Reset column start marker.
    pub fn reset_column_start(&mut self) {
        self.column_start(Readout::Reset);
    }

    /// Signal column start marker.
    pub fn signal_column_start(&mut self) {
        self.column_start(Readout::Signal);
    }

    fn column_start(&mut self, readout: Readout) {
        if self.ignore_events {
            return;
        }
        self.readout = readout;
        self.count_y[readout as usize] = 0;

        // First pixel of a row is always even.
        self.cdavis_decreasing = false;
        self.cdavis_offset = 1;
    }

    /// Column end marker. Row count mismatches are logged, the column still
    /// counts.
    pub fn column_end(&mut self, log: &DeviceLog) {
        if self.ignore_events {
            return;
        }
        let idx = self.readout as usize;

        if self.count_y[idx] != self.expected_count_y {
            device_log!(
                log,
                Level::Error,
                "APS Column End - {} - {}: wrong row count {} detected, expected {}.",
                idx,
                self.count_x[idx],
                self.count_y[idx],
                self.expected_count_y
            );
        }

        self.count_x[idx] = self.count_x[idx].saturating_add(1);
    }

    /// Exposure start marker. Returns false while ignoring.
    pub fn exposure_start(&mut self, timestamp: i32) -> bool {
        if self.ignore_events {
            return false;
        }
        self.ts_start_exposure = timestamp;
        true
    }

    /// Exposure end marker. Returns false while ignoring.
    pub fn exposure_end(&mut self, timestamp: i32) -> bool {
        if self.ignore_events {
            return false;
        }
        self.ts_end_exposure = timestamp;
        true
    }

    /// One ADC sample for the next row of the current column.
    pub fn sample(&mut self, data: u16, log: &DeviceLog) {
        if self.ignore_events {
            return;
        }
        let idx = self.readout as usize;

        // Lost column markers can overrun the window.
        if self.count_x[idx] >= self.expected_count_x || self.count_y[idx] >= self.expected_count_y {
            return;
        }

        let data = if self.settings.double_samples {
            data << 1
        } else {
            data
        };

        self.store_sample(data, log);

        self.count_y[idx] += 1;
    }

    fn store_sample(&mut self, data: u16, log: &DeviceLog) {
        let idx = self.readout as usize;

        let mut x_pos = if self.settings.flip_x {
            (self.expected_count_x - 1 - self.count_x[idx]) as i32
        } else {
            self.count_x[idx] as i32
        };
        let mut y_pos = if self.settings.flip_y {
            (self.expected_count_y - 1 - self.count_y[idx]) as i32
        } else {
            self.count_y[idx] as i32
        };

        if self.settings.cdavis_readout {
            y_pos += self.cdavis_offset;
        }

        if self.settings.invert_xy {
            std::mem::swap(&mut x_pos, &mut y_pos);
        }

        let position = y_pos as i64 * self.window.size_x as i64 + x_pos as i64;
        if position < 0 || position as usize >= self.pixels.len() {
            device_log!(
                log,
                Level::Error,
                "APS ADC sample position {} outside of pixel array, skipped.",
                position
            );
            self.advance_cdavis_offset();
            return;
        }
        let position = position as usize;

        // cDAVIS global shutter reads the signal before the reset.
        let inverted = self.settings.cdavis_readout && self.global_shutter;
        let first_sample = match self.readout {
            Readout::Reset => !inverted,
            Readout::Signal => inverted,
        };

        if first_sample {
            self.held_samples[position] = data;
        } else {
            let (reset, signal) = if inverted {
                (data, self.held_samples[position])
            } else {
                (self.held_samples[position], data)
            };
            self.pixels[position] = correlated_double_sample(reset, signal);
        }

        self.advance_cdavis_offset();
    }

    // RGB rows: even pixels first, then odd pixels backwards.
    fn advance_cdavis_offset(&mut self) {
        if !self.settings.cdavis_readout {
            return;
        }
        if !self.cdavis_decreasing {
            self.cdavis_offset += 1;
            if self.cdavis_offset == 321 {
                self.cdavis_decreasing = true;
                self.cdavis_offset = 318;
            }
        } else {
            self.cdavis_offset -= 3;
        }
    }

    /// Frame end marker: validates the column counts and releases a copy of
    /// the frame.
    pub fn end_frame(&mut self, timestamp: i32, log: &DeviceLog) -> FrameEnd {
        if self.ignore_events {
            return FrameEnd::Ignored;
        }
        device_log!(log, Level::Debug, "APS Frame End event received.");

        let mut valid = true;
        for (idx, &count) in self.count_x.iter().enumerate() {
            let expected = if idx == Readout::Reset as usize && !self.settings.reset_read {
                0
            } else {
                self.expected_count_x
            };

            if count != expected {
                device_log!(
                    log,
                    Level::Error,
                    "APS Frame End - {}: wrong column count {} detected, expected {}.",
                    idx,
                    count,
                    expected
                );
                valid = false;
            }
        }

        if !valid {
            return FrameEnd::Invalid;
        }

        // The window never exceeds the array, so the buffer always covers it.
        let area = self.window.size_x as usize * self.window.size_y as usize * APS_ADC_CHANNELS as usize;

        FrameEnd::Complete(FrameEvent {
            ts_start_frame: self.ts_start_frame,
            ts_start_exposure: self.ts_start_exposure,
            ts_end_exposure: self.ts_end_exposure,
            ts_end_frame: timestamp,
            x: self.window.position_x,
            y: self.window.position_y,
            width: self.window.size_x,
            height: self.window.size_y,
            channels: APS_ADC_CHANNELS,
            color_filter: self.settings.color_filter,
            roi_id: 0,
            pixels: self.pixels[..area].to_vec(),
        })
    }

    /// Upper byte of the next window boundary.
    pub fn roi_high(&mut self, byte: u8) {
        self.roi.tmp_data = (byte as u16) << 8;
    }

    /// Lower byte of the next window boundary. Boundaries arrive as start
    /// column, start row, end column, end row.
    pub fn roi_low(&mut self, byte: u8, log: &DeviceLog) {
        let value = self.roi.tmp_data | byte as u16;

        match self.roi.step & 0x03 {
            0 => self.roi.start_column = value,
            1 => self.roi.start_row = value,
            2 => self.roi.end_column = value,
            _ => self.apply_window(value, log),
        }

        self.roi.step = self.roi.step.wrapping_add(1);
    }

    fn apply_window(&mut self, end_row: u16, log: &DeviceLog) {
        let roi = self.roi;

        if roi.end_column < roi.start_column
            || end_row < roi.start_row
            || roi.end_column >= self.settings.size_x
            || end_row >= self.settings.size_y
        {
            device_log!(
                log,
                Level::Error,
                "Got invalid ROI update: columns {}-{}, rows {}-{}.",
                roi.start_column,
                roi.end_column,
                roi.start_row,
                end_row
            );
            return;
        }

        self.window = ApsWindow {
            position_x: roi.start_column,
            position_y: roi.start_row,
            size_x: roi.end_column - roi.start_column + 1,
            size_y: end_row - roi.start_row + 1,
        };
        self.update_expected_counts();

        device_log!(
            log,
            Level::Debug,
            "APS ROI updated: position {}x{}, size {}x{}.",
            self.window.position_x,
            self.window.position_y,
            self.window.size_x,
            self.window.size_y
        );
    }

    fn update_expected_counts(&mut self) {
        if self.settings.invert_xy {
            self.expected_count_x = self.window.size_y;
            self.expected_count_y = self.window.size_x;
        } else {
            self.expected_count_x = self.window.size_x;
            self.expected_count_y = self.window.size_y;
        }
    }

    /// Accumulates a 10-bit slice of the device exposure value.
    pub fn exposure_info(&mut self, data: u16) {
        let shift = 10 * self.exposure_tmp as u32;
        self.device_exposure |= (data as u32).checked_shl(shift).unwrap_or(0);
        self.exposure_tmp = self.exposure_tmp.saturating_add(1);
    }
}
