//! Supported sensor variants and their capabilities.
//!
//! The chip identifier read from the device selects one variant. Static
//! properties (wire protocol, array sizes, readout quirks) come from the
//! variant; optional logic blocks (filters, generator) are reported by the
//! device itself and recorded in [`DeviceInfo`].

use crate::config::{aps, dvs, extinput, imu, sysinfo, ConfigError, RegisterBus};
use crate::types::ColorFilter;

/// Wire format of the data endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// Little-endian 16-bit words
    Davis16,
    /// Big-endian 32-bit words from the MIPI bridge
    Mipi32,
}

/// Known sensor chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipVariant {
    Davis240A,
    Davis240B,
    Davis240C,
    Davis128,
    Davis346,
    Davis640,
    /// cDAVIS with RGBW color array
    Davis640H,
    Davis208,
    /// DVXplorer-class sensor behind a MIPI CX3 bridge
    MipiCx3,
}

impl ChipVariant {
    pub const ALL: [ChipVariant; 9] = [
        Self::Davis240A,
        Self::Davis240B,
        Self::Davis240C,
        Self::Davis128,
        Self::Davis346,
        Self::Davis640,
        Self::Davis640H,
        Self::Davis208,
        Self::MipiCx3,
    ];

    /// Maps a SYSINFO chip identifier to a variant.
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Self::Davis240A),
            2 => Some(Self::Davis240B),
            3 => Some(Self::Davis240C),
            4 => Some(Self::Davis128),
            5 | 6 | 10 => Some(Self::Davis346),
            7 => Some(Self::Davis640),
            8 => Some(Self::Davis640H),
            9 => Some(Self::Davis208),
            20 => Some(Self::MipiCx3),
            _ => None,
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            Self::Davis240A => 1,
            Self::Davis240B => 2,
            Self::Davis240C => 3,
            Self::Davis128 => 4,
            Self::Davis346 => 5,
            Self::Davis640 => 7,
            Self::Davis640H => 8,
            Self::Davis208 => 9,
            Self::MipiCx3 => 20,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Davis240A => "DAVIS240A",
            Self::Davis240B => "DAVIS240B",
            Self::Davis240C => "DAVIS240C",
            Self::Davis128 => "DAVIS128",
            Self::Davis346 => "DAVIS346",
            Self::Davis640 => "DAVIS640",
            Self::Davis640H => "DAVIS640H",
            Self::Davis208 => "DAVIS208",
            Self::MipiCx3 => "DVXPLORER",
        }
    }

    pub fn protocol(&self) -> WireProtocol {
        match self {
            Self::MipiCx3 => WireProtocol::Mipi32,
            _ => WireProtocol::Davis16,
        }
    }

    #[inline]
    pub fn is_davis240(&self) -> bool {
        matches!(self, Self::Davis240A | Self::Davis240B | Self::Davis240C)
    }

    /// DVS array size as reported in SIZE_COLUMNS / SIZE_ROWS.
    pub fn dvs_size(&self) -> (u16, u16) {
        match self {
            Self::Davis240A | Self::Davis240B | Self::Davis240C => (240, 180),
            Self::Davis128 => (128, 128),
            Self::Davis346 => (346, 260),
            Self::Davis640 | Self::MipiCx3 => (640, 480),
            Self::Davis640H => (320, 240),
            Self::Davis208 => (208, 192),
        }
    }

    /// APS array size, `None` for chips without frame readout.
    pub fn aps_size(&self) -> Option<(u16, u16)> {
        match self {
            Self::MipiCx3 => None,
            Self::Davis640H => Some((640, 480)),
            other => Some(other.dvs_size()),
        }
    }

    #[inline]
    pub fn has_aps(&self) -> bool {
        self.aps_size().is_some()
    }

    #[inline]
    pub fn has_imu(&self) -> bool {
        self.protocol() == WireProtocol::Davis16
    }

    #[inline]
    pub fn has_external_input(&self) -> bool {
        self.protocol() == WireProtocol::Davis16
    }

    /// Whether the APS supports a global shutter at all.
    pub fn has_global_shutter(&self) -> bool {
        !matches!(self, Self::Davis240A | Self::Davis240B | Self::MipiCx3)
    }

    pub fn color_filter(&self) -> ColorFilter {
        match self {
            Self::Davis640H => ColorFilter::Rgbw,
            _ => ColorFilter::Mono,
        }
    }

    /// The DAVIS240 ADC delivers half-range samples.
    #[inline]
    pub fn doubles_adc_samples(&self) -> bool {
        self.is_davis240()
    }

    /// cDAVIS interleaved readout.
    #[inline]
    pub fn cdavis_readout(&self) -> bool {
        matches!(self, Self::Davis640H)
    }
}

impl std::str::FromStr for ChipVariant {
    type Err = ConfigError;

    /// Parses a chip name as printed by [`ChipVariant::name`], ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|chip| chip.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownChipName(s.to_string()))
    }
}

/// Optional logic blocks present in the device firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub pixel_filter: bool,
    pub background_activity_filter: bool,
    pub roi_filter: bool,
    pub skip_filter: bool,
    pub polarity_filter: bool,
    pub statistics: bool,
    pub global_shutter: bool,
    pub external_generator: bool,
}

/// Device orientation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Orientation {
    pub invert_xy: bool,
    pub flip_x: bool,
    pub flip_y: bool,
    pub flip_z: bool,
}

impl Orientation {
    /// DVS / APS ORIENTATION_INFO: bit 2 invert XY, bit 1 flip X, bit 0 flip Y.
    pub fn from_sensor_bits(bits: u32) -> Self {
        Self {
            invert_xy: bits & 0x04 != 0,
            flip_x: bits & 0x02 != 0,
            flip_y: bits & 0x01 != 0,
            flip_z: false,
        }
    }

    /// IMU ORIENTATION_INFO: bit 2 flip X, bit 1 flip Y, bit 0 flip Z.
    pub fn from_imu_bits(bits: u32) -> Self {
        Self {
            invert_xy: false,
            flip_x: bits & 0x04 != 0,
            flip_y: bits & 0x02 != 0,
            flip_z: bits & 0x01 != 0,
        }
    }
}

fn read_size(
    bus: &mut dyn RegisterBus,
    module: u8,
    columns: u8,
    rows: u8,
    default: (u16, u16),
) -> Result<(u16, u16), ConfigError> {
    let x = bus.read(module, columns)? as u16;
    let y = bus.read(module, rows)? as u16;
    Ok(if x == 0 || y == 0 { default } else { (x, y) })
}

/// Everything known about an opened device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub device_id: i16,
    /// Prefix for all log output of this device
    pub device_string: String,
    pub chip: ChipVariant,
    pub is_master: bool,
    pub logic_version: u32,
    /// Array sizes as delivered on the wire, before inversion
    pub dvs_size: (u16, u16),
    pub aps_size: Option<(u16, u16)>,
    pub dvs_orientation: Orientation,
    pub aps_orientation: Orientation,
    pub imu_orientation: Orientation,
    /// ADC clock in MHz, deviation-corrected
    pub adc_clock: f32,
    pub capabilities: Capabilities,
}

impl DeviceInfo {
    /// Builds the info of a variant with its factory defaults.
    pub fn for_chip(chip: ChipVariant, device_id: i16) -> Self {
        Self {
            device_id,
            device_string: format!("{} ID-{}", chip.name(), device_id),
            chip,
            is_master: true,
            logic_version: 0,
            dvs_size: chip.dvs_size(),
            aps_size: chip.aps_size(),
            dvs_orientation: Orientation::default(),
            aps_orientation: Orientation::default(),
            imu_orientation: Orientation::default(),
            adc_clock: 30.0,
            capabilities: Capabilities {
                global_shutter: chip.has_global_shutter(),
                ..Capabilities::default()
            },
        }
    }

    /// Reads identification, sizes, orientation and capabilities from the
    /// device registers.
    pub fn probe(bus: &mut dyn RegisterBus, device_id: i16) -> Result<Self, ConfigError> {
        let sys = sysinfo::MODULE as u8;
        let chip_id = bus.read(sys, sysinfo::CHIP_IDENTIFIER)? as u16;
        let chip = ChipVariant::from_id(chip_id).ok_or(ConfigError::UnknownChip(chip_id))?;

        let mut info = Self::for_chip(chip, device_id);
        info.is_master = bus.read(sys, sysinfo::DEVICE_IS_MASTER)? != 0;
        info.logic_version = bus.read(sys, sysinfo::LOGIC_VERSION)?;

        let adc_clock = bus.read(sys, sysinfo::ADC_CLOCK)?;
        let deviation = bus.read(sys, sysinfo::CLOCK_DEVIATION)?;
        if adc_clock > 0 && deviation > 0 {
            info.adc_clock = adc_clock as f32 * (deviation as f32 / 1000.0);
        }

        let dvs_m = dvs::MODULE as u8;
        info.dvs_size = read_size(bus, dvs_m, dvs::SIZE_COLUMNS, dvs::SIZE_ROWS, chip.dvs_size())?;
        info.dvs_orientation = Orientation::from_sensor_bits(bus.read(dvs_m, dvs::ORIENTATION_INFO)?);
        info.capabilities.pixel_filter = bus.read(dvs_m, dvs::HAS_PIXEL_FILTER)? != 0;
        info.capabilities.background_activity_filter = bus.read(dvs_m, dvs::HAS_BACKGROUND_ACTIVITY_FILTER)? != 0;
        info.capabilities.roi_filter = bus.read(dvs_m, dvs::HAS_ROI_FILTER)? != 0;
        info.capabilities.skip_filter = bus.read(dvs_m, dvs::HAS_SKIP_FILTER)? != 0;
        info.capabilities.polarity_filter = bus.read(dvs_m, dvs::HAS_POLARITY_FILTER)? != 0;
        info.capabilities.statistics = bus.read(dvs_m, dvs::HAS_STATISTICS)? != 0;

        if let Some(default) = chip.aps_size() {
            let aps_m = aps::MODULE as u8;
            info.aps_size = Some(read_size(bus, aps_m, aps::SIZE_COLUMNS, aps::SIZE_ROWS, default)?);
            info.aps_orientation = Orientation::from_sensor_bits(bus.read(aps_m, aps::ORIENTATION_INFO)?);
            info.capabilities.global_shutter = bus.read(aps_m, aps::HAS_GLOBAL_SHUTTER)? != 0;
        } else {
            info.capabilities.global_shutter = false;
        }

        if chip.has_imu() {
            info.imu_orientation = Orientation::from_imu_bits(bus.read(imu::MODULE as u8, imu::ORIENTATION_INFO)?);
        }

        if chip.has_external_input() {
            info.capabilities.external_generator = bus.read(extinput::MODULE as u8, extinput::HAS_GENERATOR)? != 0;
        }

        Ok(info)
    }

    /// DVS size seen by the application, after X/Y inversion.
    pub fn dvs_output_size(&self) -> (u16, u16) {
        let (x, y) = self.dvs_size;
        if self.dvs_orientation.invert_xy {
            (y, x)
        } else {
            (x, y)
        }
    }

    pub fn aps_output_size(&self) -> Option<(u16, u16)> {
        self.aps_size.map(|(x, y)| if self.aps_orientation.invert_xy { (y, x) } else { (x, y) })
    }

    #[inline]
    pub fn has_pixel_filter(&self) -> bool {
        self.capabilities.pixel_filter
    }

    #[inline]
    pub fn has_background_activity_filter(&self) -> bool {
        self.capabilities.background_activity_filter
    }

    #[inline]
    pub fn has_roi_filter(&self) -> bool {
        self.capabilities.roi_filter
    }

    #[inline]
    pub fn has_skip_filter(&self) -> bool {
        self.capabilities.skip_filter
    }

    #[inline]
    pub fn has_polarity_filter(&self) -> bool {
        self.capabilities.polarity_filter
    }

    #[inline]
    pub fn has_statistics(&self) -> bool {
        self.capabilities.statistics
    }

    #[inline]
    pub fn has_global_shutter(&self) -> bool {
        self.capabilities.global_shutter
    }

    #[inline]
    pub fn has_external_generator(&self) -> bool {
        self.capabilities.external_generator
    }

    #[inline]
    pub fn has_aps(&self) -> bool {
        self.aps_size.is_some()
    }

    #[inline]
    pub fn has_imu(&self) -> bool {
        self.chip.has_imu()
    }

    #[inline]
    pub fn has_external_input(&self) -> bool {
        self.chip.has_external_input()
    }
}
