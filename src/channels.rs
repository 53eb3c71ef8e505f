//! Channel configuration store.
//!
//! Holds the per-channel enable/coupling/range/offset settings of one device and validates every
//! change against the model's capabilities before it reaches the driver.

use crate::capabilities::{ModelCapabilities, Range};
use crate::driver::{Channel, DigitalPort, PowerSource, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Coupling {
    Ac,
    #[default]
    Dc,
    Dc50Ohm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InputMode {
    #[default]
    SingleEnded,
    /// Only valid on primary channels of a differential-pair model; consumes the secondary.
    Differential,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSetting {
    pub enabled: bool,
    pub coupling: Coupling,
    pub range: Range,
    /// Analogue offset in volts.
    pub analogue_offset: f32,
    pub input_mode: InputMode,
}

impl ChannelSetting {
    pub fn enabled(range: Range) -> Self {
        Self {
            enabled: true,
            range,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_coupling(mut self, coupling: Coupling) -> Self {
        self.coupling = coupling;
        self
    }

    pub fn with_offset(mut self, volts: f32) -> Self {
        self.analogue_offset = volts;
        self
    }

    pub fn differential(mut self) -> Self {
        self.input_mode = InputMode::Differential;
        self
    }
}

impl Default for ChannelSetting {
    fn default() -> Self {
        Self {
            enabled: false,
            coupling: Coupling::Dc,
            range: Range::R5V,
            analogue_offset: 0.0,
            input_mode: InputMode::SingleEnded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigitalPortSetting {
    pub enabled: bool,
    pub logic_threshold: i16,
}

/// Which rule capped the number of enabled channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLimit {
    Resolution(Resolution),
    UsbPower,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is not available on this model")]
    ChannelUnavailable(Channel),

    #[error("range {range} is outside {first}..={last}")]
    RangeOutOfBounds { range: Range, first: Range, last: Range },

    #[error("coupling {0:?} is not supported by this model")]
    InvalidCoupling(Coupling),

    #[error("at most {quota} channels may be enabled ({limit:?})")]
    TooManyChannels { quota: usize, limit: ChannelLimit },

    #[error("resolution {0} is not compatible with the current channel set")]
    ResolutionIncompatible(Resolution),

    #[error("channel {secondary} is the secondary of differential channel {primary}")]
    DifferentialConflict { primary: Channel, secondary: Channel },

    #[error("channel {0} cannot be used as a differential primary")]
    NotDifferentialPrimary(Channel),

    #[error("digital port {0:?} is not available on this model")]
    PortUnavailable(DigitalPort),

    #[error("logic threshold {0} is outside the ADC range")]
    ThresholdOutOfRange(i16),
}

/// Device-wide facts the store validates against.
#[derive(Debug, Clone, Copy)]
pub struct ChannelContext<'a> {
    pub caps: &'a ModelCapabilities,
    pub resolution: Resolution,
    pub power: PowerSource,
}

impl ChannelContext<'_> {
    pub fn quota(&self) -> usize {
        self.caps.channel_quota(self.resolution, self.power)
    }

    fn limit(&self) -> ChannelLimit {
        let by_resolution = self.caps.channel_quota(self.resolution, PowerSource::MainsConnected);
        if self.quota() < by_resolution {
            ChannelLimit::UsbPower
        } else {
            ChannelLimit::Resolution(self.resolution)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelStore {
    settings: Vec<ChannelSetting>,
    digital_ports: Vec<DigitalPortSetting>,
}

impl ChannelStore {
    pub fn new(caps: &ModelCapabilities) -> Self {
        Self {
            settings: vec![ChannelSetting::default(); caps.channel_count],
            digital_ports: vec![DigitalPortSetting::default(); caps.digital_ports],
        }
    }

    pub fn get(&self, channel: Channel) -> Option<&ChannelSetting> {
        self.settings.get(channel.index())
    }

    pub fn is_enabled(&self, channel: Channel) -> bool {
        self.get(channel).is_some_and(|s| s.enabled)
    }

    /// Enabled channels in ascending order.
    pub fn enabled(&self) -> Vec<Channel> {
        self.settings
            .iter()
            .enumerate()
            .filter(|(_, s)| s.enabled)
            .filter_map(|(i, _)| Channel::from_index(i))
            .collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.settings.iter().filter(|s| s.enabled).count()
    }

    pub fn digital_port(&self, port: DigitalPort) -> Option<&DigitalPortSetting> {
        self.digital_ports.get(port.index())
    }

    /// Checks `setting` for `channel` without applying it.
    pub fn validate(
        &self,
        channel: Channel,
        setting: &ChannelSetting,
        ctx: &ChannelContext<'_>,
    ) -> Result<(), ChannelError> {
        if channel.index() >= self.settings.len() {
            return Err(ChannelError::ChannelUnavailable(channel));
        }
        if !ctx.caps.couplings.contains(&setting.coupling) {
            return Err(ChannelError::InvalidCoupling(setting.coupling));
        }
        if !ctx.caps.range_allowed(setting.range) {
            return Err(ChannelError::RangeOutOfBounds {
                range: setting.range,
                first: ctx.caps.first_range,
                last: ctx.caps.last_range,
            });
        }
        if !setting.enabled {
            return Ok(());
        }

        let others = self
            .settings
            .iter()
            .enumerate()
            .filter(|(i, s)| *i != channel.index() && s.enabled)
            .count();
        let quota = ctx.quota();
        if others + 1 > quota {
            return Err(ChannelError::TooManyChannels {
                quota,
                limit: ctx.limit(),
            });
        }

        if ctx.caps.differential_pairs {
            self.validate_differential(channel, setting)?;
        } else if setting.input_mode == InputMode::Differential {
            return Err(ChannelError::NotDifferentialPrimary(channel));
        }
        Ok(())
    }

    // Primaries are A, C, E, G; each pairs with the next channel up.
    fn validate_differential(
        &self,
        channel: Channel,
        setting: &ChannelSetting,
    ) -> Result<(), ChannelError> {
        let is_primary = channel.index() % 2 == 0;
        if is_primary {
            if setting.input_mode != InputMode::Differential {
                return Ok(());
            }
            let Some(secondary) = Channel::from_index(channel.index() + 1)
                .filter(|c| c.index() < self.settings.len())
            else {
                return Err(ChannelError::NotDifferentialPrimary(channel));
            };
            if self.is_enabled(secondary) {
                return Err(ChannelError::DifferentialConflict {
                    primary: channel,
                    secondary,
                });
            }
            return Ok(());
        }

        if setting.input_mode == InputMode::Differential {
            return Err(ChannelError::NotDifferentialPrimary(channel));
        }
        let primary = Channel::from_index(channel.index() - 1)
            .ok_or(ChannelError::ChannelUnavailable(channel))?;
        match self.get(primary) {
            Some(p) if p.enabled && p.input_mode == InputMode::Differential => {
                Err(ChannelError::DifferentialConflict {
                    primary,
                    secondary: channel,
                })
            }
            _ => Ok(()),
        }
    }

    /// Validates and records `setting`. Applying the same setting twice is a no-op.
    pub fn set(
        &mut self,
        channel: Channel,
        setting: ChannelSetting,
        ctx: &ChannelContext<'_>,
    ) -> Result<(), ChannelError> {
        self.validate(channel, &setting, ctx)?;
        self.settings[channel.index()] = setting;
        Ok(())
    }

    pub fn set_digital_port(
        &mut self,
        port: DigitalPort,
        enabled: bool,
        logic_threshold: i16,
    ) -> Result<(), ChannelError> {
        let slot = self
            .digital_ports
            .get_mut(port.index())
            .ok_or(ChannelError::PortUnavailable(port))?;
        if logic_threshold == i16::MIN {
            return Err(ChannelError::ThresholdOutOfRange(logic_threshold));
        }
        *slot = DigitalPortSetting {
            enabled,
            logic_threshold,
        };
        Ok(())
    }

    /// Fails when the currently enabled set would not fit `ctx`'s quota.
    pub fn check_quota(&self, ctx: &ChannelContext<'_>) -> Result<(), ChannelError> {
        let quota = ctx.quota();
        if self.enabled_count() > quota {
            return Err(ChannelError::TooManyChannels {
                quota,
                limit: ctx.limit(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::capabilities_for;

    fn ctx(variant: &str, resolution: Resolution, power: PowerSource) -> ChannelContext<'static> {
        ChannelContext {
            caps: capabilities_for(variant).unwrap(),
            resolution,
            power,
        }
    }

    #[test]
    fn test_range_bounds() {
        let ctx = ctx("2204A", Resolution::Bits8, PowerSource::MainsConnected);
        let mut store = ChannelStore::new(ctx.caps);
        assert!(store.set(Channel::A, ChannelSetting::enabled(Range::R50mV), &ctx).is_ok());
        assert!(matches!(
            store.set(Channel::A, ChannelSetting::enabled(Range::R10mV), &ctx),
            Err(ChannelError::RangeOutOfBounds { .. })
        ));
        assert!(matches!(
            store.set(Channel::C, ChannelSetting::enabled(Range::R1V), &ctx),
            Err(ChannelError::ChannelUnavailable(Channel::C))
        ));
    }

    #[test]
    fn test_coupling_rejected() {
        let ctx = ctx("2204A", Resolution::Bits8, PowerSource::MainsConnected);
        let mut store = ChannelStore::new(ctx.caps);
        let setting = ChannelSetting::enabled(Range::R1V).with_coupling(Coupling::Dc50Ohm);
        assert_eq!(
            store.set(Channel::A, setting, &ctx),
            Err(ChannelError::InvalidCoupling(Coupling::Dc50Ohm))
        );
    }

    #[test]
    fn test_set_is_idempotent() {
        let ctx = ctx("3406D", Resolution::Bits8, PowerSource::UsbOnly);
        let mut store = ChannelStore::new(ctx.caps);
        let setting = ChannelSetting::enabled(Range::R2V);
        for _ in 0..3 {
            assert!(store.set(Channel::A, setting, &ctx).is_ok());
            assert!(store.set(Channel::B, setting, &ctx).is_ok());
        }
        assert_eq!(store.enabled(), vec![Channel::A, Channel::B]);
    }

    #[test]
    fn test_usb_power_quota() {
        let ctx_usb = ctx("5444D", Resolution::Bits8, PowerSource::UsbOnly);
        let mut store = ChannelStore::new(ctx_usb.caps);
        let setting = ChannelSetting::enabled(Range::R1V);
        store.set(Channel::A, setting, &ctx_usb).unwrap();
        store.set(Channel::B, setting, &ctx_usb).unwrap();
        assert_eq!(
            store.set(Channel::C, setting, &ctx_usb),
            Err(ChannelError::TooManyChannels {
                quota: 2,
                limit: ChannelLimit::UsbPower
            })
        );
        // disabling is always allowed
        assert!(store.set(Channel::C, ChannelSetting::disabled(), &ctx_usb).is_ok());
    }

    #[test]
    fn test_resolution_quota() {
        let ctx = ctx("6824E", Resolution::Bits12, PowerSource::MainsConnected);
        let mut store = ChannelStore::new(ctx.caps);
        let setting = ChannelSetting::enabled(Range::R1V);
        store.set(Channel::A, setting, &ctx).unwrap();
        store.set(Channel::E, setting, &ctx).unwrap();
        assert!(matches!(
            store.set(Channel::H, setting, &ctx),
            Err(ChannelError::TooManyChannels {
                quota: 2,
                limit: ChannelLimit::Resolution(Resolution::Bits12)
            })
        ));
        let ctx10 = ChannelContext {
            resolution: Resolution::Bits10,
            ..ctx
        };
        assert!(store.check_quota(&ctx10).is_ok());
    }

    #[test]
    fn test_differential_pairs() {
        let ctx = ctx("4444", Resolution::Bits12, PowerSource::MainsConnected);
        let mut store = ChannelStore::new(ctx.caps);
        let diff = ChannelSetting::enabled(Range::R1V).differential();
        let single = ChannelSetting::enabled(Range::R1V);

        store.set(Channel::A, diff, &ctx).unwrap();
        assert_eq!(
            store.set(Channel::B, single, &ctx),
            Err(ChannelError::DifferentialConflict {
                primary: Channel::A,
                secondary: Channel::B
            })
        );
        assert_eq!(
            store.set(Channel::B, diff, &ctx),
            Err(ChannelError::NotDifferentialPrimary(Channel::B))
        );

        store.set(Channel::D, single, &ctx).unwrap();
        assert_eq!(
            store.set(Channel::C, diff, &ctx),
            Err(ChannelError::DifferentialConflict {
                primary: Channel::C,
                secondary: Channel::D
            })
        );
        assert!(store.set(Channel::C, single, &ctx).is_ok());
    }

    #[test]
    fn test_differential_rejected_on_single_ended_model() {
        let ctx = ctx("3406D", Resolution::Bits8, PowerSource::MainsConnected);
        let mut store = ChannelStore::new(ctx.caps);
        assert_eq!(
            store.set(Channel::A, ChannelSetting::enabled(Range::R1V).differential(), &ctx),
            Err(ChannelError::NotDifferentialPrimary(Channel::A))
        );
    }

    #[test]
    fn test_digital_ports() {
        let caps = capabilities_for("2206BMSO").unwrap();
        let mut store = ChannelStore::new(caps);
        assert!(store.set_digital_port(DigitalPort::Port1, true, 1_000).is_ok());
        assert_eq!(
            store.digital_port(DigitalPort::Port1),
            Some(&DigitalPortSetting {
                enabled: true,
                logic_threshold: 1_000
            })
        );

        let caps = capabilities_for("2204A").unwrap();
        let mut store = ChannelStore::new(caps);
        assert_eq!(
            store.set_digital_port(DigitalPort::Port0, true, 0),
            Err(ChannelError::PortUnavailable(DigitalPort::Port0))
        );
    }
}
