//! Per-model capability descriptors.
//!
//! The acquisition core never branches on model strings. It looks the variant up once at open
//! time and reads everything it needs from the returned [`ModelCapabilities`].

use std::fmt;

use crate::channels::Coupling;
use crate::driver::{PowerSource, Resolution};

/// Input range, ordered from the smallest full-scale value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Range {
    R10mV,
    R20mV,
    R50mV,
    R100mV,
    R200mV,
    R500mV,
    R1V,
    R2V,
    R5V,
    R10V,
    R20V,
    R50V,
}

/// Full-scale millivolts, indexed by [`Range::index`].
pub const RANGE_TABLE_MV: [i32; 12] = [
    10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000,
];

impl Range {
    pub const ALL: [Self; 12] = [
        Self::R10mV,
        Self::R20mV,
        Self::R50mV,
        Self::R100mV,
        Self::R200mV,
        Self::R500mV,
        Self::R1V,
        Self::R2V,
        Self::R5V,
        Self::R10V,
        Self::R20V,
        Self::R50V,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn full_scale_mv(self) -> i32 {
        RANGE_TABLE_MV[self.index()]
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mv = self.full_scale_mv();
        if mv >= 1_000 {
            write!(f, "±{}V", mv / 1_000)
        } else {
            write!(f, "±{mv}mV")
        }
    }
}

/// How many channels may be enabled at one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionQuota {
    pub resolution: Resolution,
    pub max_channels: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub variant: &'static str,
    pub channel_count: usize,
    pub first_range: Range,
    pub last_range: Range,
    pub couplings: &'static [Coupling],
    /// Supported resolutions in ascending order; the first is the power-on default.
    pub resolutions: &'static [ResolutionQuota],
    /// Channel limit while running from USB power only, if the model has one.
    pub usb_only_channel_limit: Option<usize>,
    pub differential_pairs: bool,
    pub digital_ports: usize,
    pub has_signal_generator: bool,
    pub has_ets: bool,
    pub has_flexible_resolution: bool,
    pub max_timebase: u32,
    pub awg_buffer_size: u32,
    pub memory_samples: u32,
    pub max_segments: u32,
}

impl ModelCapabilities {
    pub fn default_resolution(&self) -> Resolution {
        self.resolutions
            .first()
            .map_or(Resolution::Bits8, |quota| quota.resolution)
    }

    pub fn supports_resolution(&self, resolution: Resolution) -> bool {
        self.resolutions.iter().any(|q| q.resolution == resolution)
    }

    pub fn range_allowed(&self, range: Range) -> bool {
        (self.first_range..=self.last_range).contains(&range)
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range> + '_ {
        Range::ALL
            .into_iter()
            .filter(move |range| self.range_allowed(*range))
    }

    /// Largest number of channels that may be enabled together under `resolution` and `power`.
    pub fn channel_quota(&self, resolution: Resolution, power: PowerSource) -> usize {
        let by_resolution = self
            .resolutions
            .iter()
            .find(|q| q.resolution == resolution)
            .map_or(0, |q| q.max_channels.min(self.channel_count));
        match (power, self.usb_only_channel_limit) {
            (PowerSource::UsbOnly, Some(limit)) => by_resolution.min(limit),
            _ => by_resolution,
        }
    }

    /// Full-scale ADC count at `resolution`.
    pub fn max_adc_value(&self, resolution: Resolution) -> i16 {
        match resolution {
            Resolution::Bits8 => 32_512,
            _ => 32_767,
        }
    }

    /// The interval of `timebase` in nanoseconds, assuming the 8-bit timing table.
    pub fn timebase_interval_ns(&self, timebase: u32) -> f64 {
        if timebase < 3 {
            f64::from(1u32 << timebase)
        } else {
            f64::from(timebase - 2) * 8.0
        }
    }

    /// Smallest usable timebase with `enabled` channels active.
    pub fn min_timebase(&self, enabled: usize) -> u32 {
        match enabled {
            0 | 1 => 0,
            2 => 1,
            _ => 2,
        }
    }
}

const COUPLING_FULL: &[Coupling] = &[Coupling::Ac, Coupling::Dc, Coupling::Dc50Ohm];
const COUPLING_AC_DC: &[Coupling] = &[Coupling::Ac, Coupling::Dc];

const FIXED_8_BIT: &[ResolutionQuota] = &[ResolutionQuota {
    resolution: Resolution::Bits8,
    max_channels: 8,
}];

const FIXED_12_BIT: &[ResolutionQuota] = &[ResolutionQuota {
    resolution: Resolution::Bits12,
    max_channels: 8,
}];

const FLEX_4_CHANNEL: &[ResolutionQuota] = &[
    ResolutionQuota { resolution: Resolution::Bits8, max_channels: 4 },
    ResolutionQuota { resolution: Resolution::Bits12, max_channels: 4 },
    ResolutionQuota { resolution: Resolution::Bits14, max_channels: 4 },
    ResolutionQuota { resolution: Resolution::Bits15, max_channels: 2 },
    ResolutionQuota { resolution: Resolution::Bits16, max_channels: 1 },
];

const FLEX_8_CHANNEL: &[ResolutionQuota] = &[
    ResolutionQuota { resolution: Resolution::Bits8, max_channels: 8 },
    ResolutionQuota { resolution: Resolution::Bits10, max_channels: 4 },
    ResolutionQuota { resolution: Resolution::Bits12, max_channels: 2 },
];

static MODELS: &[ModelCapabilities] = &[
    ModelCapabilities {
        variant: "2204A",
        channel_count: 2,
        first_range: Range::R50mV,
        last_range: Range::R20V,
        couplings: COUPLING_AC_DC,
        resolutions: FIXED_8_BIT,
        usb_only_channel_limit: None,
        differential_pairs: false,
        digital_ports: 0,
        has_signal_generator: true,
        has_ets: false,
        has_flexible_resolution: false,
        max_timebase: (1 << 30) - 1,
        awg_buffer_size: 8_192,
        memory_samples: 8_000,
        max_segments: 32,
    },
    ModelCapabilities {
        variant: "2206BMSO",
        channel_count: 2,
        first_range: Range::R20mV,
        last_range: Range::R20V,
        couplings: COUPLING_AC_DC,
        resolutions: FIXED_8_BIT,
        usb_only_channel_limit: None,
        differential_pairs: false,
        digital_ports: 2,
        has_signal_generator: true,
        has_ets: true,
        has_flexible_resolution: false,
        max_timebase: (1 << 30) - 1,
        awg_buffer_size: 32_768,
        memory_samples: 32_000_000,
        max_segments: 10_000,
    },
    ModelCapabilities {
        variant: "3406D",
        channel_count: 4,
        first_range: Range::R20mV,
        last_range: Range::R20V,
        couplings: COUPLING_AC_DC,
        resolutions: FIXED_8_BIT,
        usb_only_channel_limit: Some(2),
        differential_pairs: false,
        digital_ports: 0,
        has_signal_generator: true,
        has_ets: true,
        has_flexible_resolution: false,
        max_timebase: u32::MAX,
        awg_buffer_size: 32_768,
        memory_samples: 128_000_000,
        max_segments: 250_000,
    },
    ModelCapabilities {
        variant: "4444",
        channel_count: 4,
        first_range: Range::R10mV,
        last_range: Range::R50V,
        couplings: COUPLING_AC_DC,
        resolutions: &[
            ResolutionQuota { resolution: Resolution::Bits12, max_channels: 4 },
            ResolutionQuota { resolution: Resolution::Bits14, max_channels: 4 },
        ],
        usb_only_channel_limit: None,
        differential_pairs: true,
        digital_ports: 0,
        has_signal_generator: false,
        has_ets: false,
        has_flexible_resolution: true,
        max_timebase: u32::MAX,
        awg_buffer_size: 0,
        memory_samples: 256_000_000,
        max_segments: 1_000_000,
    },
    ModelCapabilities {
        variant: "4824",
        channel_count: 8,
        first_range: Range::R10mV,
        last_range: Range::R50V,
        couplings: COUPLING_AC_DC,
        resolutions: FIXED_12_BIT,
        usb_only_channel_limit: None,
        differential_pairs: false,
        digital_ports: 0,
        has_signal_generator: true,
        has_ets: false,
        has_flexible_resolution: false,
        max_timebase: u32::MAX,
        awg_buffer_size: 16_384,
        memory_samples: 256_000_000,
        max_segments: 1_000_000,
    },
    ModelCapabilities {
        variant: "5444D",
        channel_count: 4,
        first_range: Range::R10mV,
        last_range: Range::R20V,
        couplings: COUPLING_AC_DC,
        resolutions: FLEX_4_CHANNEL,
        usb_only_channel_limit: Some(2),
        differential_pairs: false,
        digital_ports: 0,
        has_signal_generator: true,
        has_ets: true,
        has_flexible_resolution: true,
        max_timebase: u32::MAX,
        awg_buffer_size: 32_768,
        memory_samples: 512_000_000,
        max_segments: 1_000_000,
    },
    ModelCapabilities {
        variant: "6824E",
        channel_count: 8,
        first_range: Range::R10mV,
        last_range: Range::R20V,
        couplings: COUPLING_FULL,
        resolutions: FLEX_8_CHANNEL,
        usb_only_channel_limit: None,
        differential_pairs: false,
        digital_ports: 2,
        has_signal_generator: true,
        has_ets: false,
        has_flexible_resolution: true,
        max_timebase: u32::MAX,
        awg_buffer_size: 40_960,
        memory_samples: 4_000_000_000,
        max_segments: 2_000_000,
    },
];

/// Capability descriptor for a variant id as reported by `getUnitInfo(VariantInfo)`.
pub fn capabilities_for(variant: &str) -> Option<&'static ModelCapabilities> {
    MODELS.iter().find(|model| model.variant == variant.trim())
}

pub fn known_variants() -> impl Iterator<Item = &'static str> {
    MODELS.iter().map(|model| model.variant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_table_is_ordered() {
        for pair in RANGE_TABLE_MV.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(Range::R10mV.index(), 0);
        assert_eq!(Range::from_index(8), Some(Range::R5V));
        assert_eq!(Range::R2V.to_string(), "±2V");
        assert_eq!(Range::R50mV.to_string(), "±50mV");
    }

    #[test]
    fn test_lookup_trims_variant() {
        let caps = capabilities_for("5444D\0".trim_end_matches('\0')).unwrap();
        assert_eq!(caps.channel_count, 4);
        assert!(capabilities_for("9999").is_none());
        assert!(known_variants().any(|v| v == "4824"));
    }

    #[test]
    fn test_channel_quota_respects_power_and_resolution() {
        let caps = capabilities_for("5444D").unwrap();
        assert_eq!(caps.channel_quota(Resolution::Bits8, PowerSource::MainsConnected), 4);
        assert_eq!(caps.channel_quota(Resolution::Bits8, PowerSource::UsbOnly), 2);
        assert_eq!(caps.channel_quota(Resolution::Bits16, PowerSource::MainsConnected), 1);
        assert_eq!(caps.channel_quota(Resolution::Bits10, PowerSource::MainsConnected), 0);

        let caps = capabilities_for("6824E").unwrap();
        assert_eq!(caps.channel_quota(Resolution::Bits10, PowerSource::UsbOnly), 4);
        assert_eq!(caps.channel_quota(Resolution::Bits12, PowerSource::UsbOnly), 2);
    }

    #[test]
    fn test_ranges_follow_model_bounds() {
        let caps = capabilities_for("2204A").unwrap();
        let ranges: Vec<_> = caps.ranges().collect();
        assert_eq!(ranges.first(), Some(&Range::R50mV));
        assert_eq!(ranges.last(), Some(&Range::R20V));
        assert!(!caps.range_allowed(Range::R10mV));
    }

    #[test]
    fn test_timebase_table() {
        let caps = capabilities_for("3406D").unwrap();
        assert!((caps.timebase_interval_ns(0) - 1.0).abs() < f64::EPSILON);
        assert!((caps.timebase_interval_ns(2) - 4.0).abs() < f64::EPSILON);
        assert!((caps.timebase_interval_ns(7) - 40.0).abs() < f64::EPSILON);
        assert_eq!(caps.min_timebase(2), 1);
    }
}
