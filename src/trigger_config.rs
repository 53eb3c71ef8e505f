use std::collections::BTreeMap;

use crate::capabilities::Range;
use crate::channels::ChannelStore;
use crate::driver::Channel;
use crate::units::mv_to_adc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("trigger source {0} is not enabled")]
    SourceDisabled(Channel),

    #[error("threshold {threshold_mv} mV is outside the {range} range of channel {channel}")]
    ThresholdOutOfRange {
        channel: Channel,
        threshold_mv: i32,
        range: Range,
    },

    #[error("pulse width bounds {lower}..{upper} are inverted")]
    InvalidPulseWidth { lower: u32, upper: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThresholdDirection {
    Above,
    Below,
    #[default]
    Rising,
    Falling,
    RisingOrFalling,
    Inside,
    Outside,
    Enter,
    Exit,
    None,
}

impl ThresholdDirection {
    /// Whether an upward crossing of the threshold fires this direction.
    pub fn fires_on_rise(self) -> bool {
        matches!(self, Self::Above | Self::Rising | Self::RisingOrFalling | Self::Enter)
    }

    pub fn fires_on_fall(self) -> bool {
        matches!(self, Self::Below | Self::Falling | Self::RisingOrFalling | Self::Exit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThresholdMode {
    #[default]
    Level,
    Window,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TriggerSource {
    Channel(Channel),
    External,
    Aux,
}

/// Required state of one source within a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionState {
    #[default]
    DontCare,
    True,
    False,
}

/// Simple edge trigger in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleTrigger {
    pub source: Channel,
    pub threshold_mv: i32,
    pub direction: ThresholdDirection,
    /// Samples between the trigger event and the trigger point.
    pub delay: u32,
    /// Fire anyway after this many milliseconds; 0 waits forever.
    pub auto_trigger_ms: i16,
}

impl SimpleTrigger {
    pub fn start_capturing_when(source: Channel) -> SimpleTriggerBuilder {
        SimpleTriggerBuilder { source }
    }

    pub fn with_delay(mut self, delay: u32) -> Self {
        self.delay = delay;
        self
    }

    /// Also fires when the condition was not met within `ms` milliseconds.
    pub fn auto(mut self, ms: i16) -> Self {
        self.auto_trigger_ms = ms;
        self
    }

    /// Converts the threshold to ADC counts for the source channel's current range.
    pub fn to_adc(&self, range: Range, max_adc: i16) -> Result<SimpleTriggerAdc, TriggerError> {
        if self.threshold_mv.abs() > range.full_scale_mv() {
            return Err(TriggerError::ThresholdOutOfRange {
                channel: self.source,
                threshold_mv: self.threshold_mv,
                range,
            });
        }
        Ok(SimpleTriggerAdc {
            source: self.source,
            threshold: mv_to_adc(self.threshold_mv, range, max_adc),
            direction: self.direction,
            delay: self.delay,
            auto_trigger_ms: self.auto_trigger_ms,
        })
    }
}

#[derive(Debug)]
pub struct SimpleTriggerBuilder {
    source: Channel,
}

impl SimpleTriggerBuilder {
    fn build(self, threshold_mv: i32, direction: ThresholdDirection) -> SimpleTrigger {
        SimpleTrigger {
            source: self.source,
            threshold_mv,
            direction,
            delay: 0,
            auto_trigger_ms: 0,
        }
    }

    pub fn rising_edge(self, threshold_mv: i32) -> SimpleTrigger {
        self.build(threshold_mv, ThresholdDirection::Rising)
    }

    pub fn falling_edge(self, threshold_mv: i32) -> SimpleTrigger {
        self.build(threshold_mv, ThresholdDirection::Falling)
    }

    pub fn either_edge(self, threshold_mv: i32) -> SimpleTrigger {
        self.build(threshold_mv, ThresholdDirection::RisingOrFalling)
    }

    pub fn above(self, threshold_mv: i32) -> SimpleTrigger {
        self.build(threshold_mv, ThresholdDirection::Above)
    }

    pub fn below(self, threshold_mv: i32) -> SimpleTrigger {
        self.build(threshold_mv, ThresholdDirection::Below)
    }
}

/// Simple trigger as the driver receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleTriggerAdc {
    pub source: Channel,
    pub threshold: i16,
    pub direction: ThresholdDirection,
    pub delay: u32,
    pub auto_trigger_ms: i16,
}

/// Upper threshold, upper hysteresis, lower threshold, lower hysteresis, source and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerChannelProperties {
    pub upper_threshold: i16,
    pub upper_hysteresis: u16,
    pub lower_threshold: i16,
    pub lower_hysteresis: u16,
    pub source: TriggerSource,
    pub mode: ThresholdMode,
}

impl TriggerChannelProperties {
    pub fn level(source: TriggerSource, threshold: i16, hysteresis: u16) -> Self {
        Self {
            upper_threshold: threshold,
            upper_hysteresis: hysteresis,
            lower_threshold: threshold,
            lower_hysteresis: hysteresis,
            source,
            mode: ThresholdMode::Level,
        }
    }

    pub fn window(source: TriggerSource, lower: i16, upper: i16, hysteresis: u16) -> Self {
        Self {
            upper_threshold: upper,
            upper_hysteresis: hysteresis,
            lower_threshold: lower,
            lower_hysteresis: hysteresis,
            source,
            mode: ThresholdMode::Window,
        }
    }
}

/// One AND-term of the trigger logic; a list of these is OR-ed together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriggerConditions {
    pub states: BTreeMap<TriggerSource, ConditionState>,
    pub pulse_width_qualifier: ConditionState,
}

#[derive(Debug)]
pub struct ConditionBuilder {
    conditions: TriggerConditions,
}

impl ConditionBuilder {
    pub fn new() -> Self {
        Self {
            conditions: TriggerConditions::default(),
        }
    }

    pub fn set(mut self, source: TriggerSource, state: ConditionState) -> Self {
        self.conditions.states.insert(source, state);
        self
    }

    pub fn channel(self, channel: Channel, state: ConditionState) -> Self {
        self.set(TriggerSource::Channel(channel), state)
    }

    pub fn pulse_width(mut self, state: ConditionState) -> Self {
        self.conditions.pulse_width_qualifier = state;
        self
    }

    pub fn build(self) -> TriggerConditions {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerConditions {
    pub fn when() -> ConditionBuilder {
        ConditionBuilder::new()
    }

    /// Channel sources that must be true for this term to fire.
    pub fn required_channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.states.iter().filter_map(|(source, state)| match (source, state) {
            (TriggerSource::Channel(channel), ConditionState::True | ConditionState::False) => {
                Some(*channel)
            }
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriggerDirections {
    pub directions: BTreeMap<TriggerSource, ThresholdDirection>,
}

impl TriggerDirections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: TriggerSource, direction: ThresholdDirection) -> Self {
        self.directions.insert(source, direction);
        self
    }

    pub fn get(&self, source: TriggerSource) -> ThresholdDirection {
        self.directions
            .get(&source)
            .copied()
            .unwrap_or(ThresholdDirection::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PulseWidthType {
    #[default]
    None,
    LessThan,
    GreaterThan,
    InRange,
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseWidthQualifier {
    pub conditions: Vec<TriggerConditions>,
    pub direction: ThresholdDirection,
    /// Lower bound in samples.
    pub lower: u32,
    /// Upper bound in samples, used by the range types.
    pub upper: u32,
    pub kind: PulseWidthType,
}

impl PulseWidthQualifier {
    pub fn validate(&self) -> Result<(), TriggerError> {
        let ranged = matches!(self.kind, PulseWidthType::InRange | PulseWidthType::OutOfRange);
        if ranged && self.lower > self.upper {
            return Err(TriggerError::InvalidPulseWidth {
                lower: self.lower,
                upper: self.upper,
            });
        }
        Ok(())
    }
}

/// Properties/conditions/directions triplet plus the optional qualifier and delay.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvancedTrigger {
    pub properties: Vec<TriggerChannelProperties>,
    pub conditions: Vec<TriggerConditions>,
    pub directions: TriggerDirections,
    pub pulse_width: Option<PulseWidthQualifier>,
    pub delay: u32,
    pub auto_trigger_ms: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TriggerSpec {
    /// Capture starts immediately.
    #[default]
    None,
    Simple(SimpleTrigger),
    Advanced(AdvancedTrigger),
}

impl From<SimpleTrigger> for TriggerSpec {
    fn from(trigger: SimpleTrigger) -> Self {
        Self::Simple(trigger)
    }
}

impl From<AdvancedTrigger> for TriggerSpec {
    fn from(trigger: AdvancedTrigger) -> Self {
        Self::Advanced(trigger)
    }
}

impl TriggerSpec {
    /// Every channel this trigger reads from.
    pub fn source_channels(&self) -> Vec<Channel> {
        let mut channels = match self {
            Self::None => Vec::new(),
            Self::Simple(simple) => vec![simple.source],
            Self::Advanced(advanced) => {
                let from_properties = advanced.properties.iter().filter_map(|p| match p.source {
                    TriggerSource::Channel(channel) => Some(channel),
                    _ => None,
                });
                let from_conditions = advanced
                    .conditions
                    .iter()
                    .chain(advanced.pulse_width.iter().flat_map(|pwq| pwq.conditions.iter()))
                    .flat_map(TriggerConditions::required_channels);
                from_properties.chain(from_conditions).collect()
            }
        };
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    /// Every condition source channel must be enabled.
    pub fn validate(&self, channels: &ChannelStore) -> Result<(), TriggerError> {
        if let Some(disabled) = self
            .source_channels()
            .into_iter()
            .find(|c| !channels.is_enabled(*c))
        {
            return Err(TriggerError::SourceDisabled(disabled));
        }
        if let Self::Advanced(AdvancedTrigger {
            pulse_width: Some(pwq),
            ..
        }) = self
        {
            pwq.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::capabilities_for;
    use crate::channels::{ChannelContext, ChannelSetting};
    use crate::driver::{PowerSource, Resolution};

    fn store_with_a() -> ChannelStore {
        let caps = capabilities_for("3406D").unwrap();
        let ctx = ChannelContext {
            caps,
            resolution: Resolution::Bits8,
            power: PowerSource::MainsConnected,
        };
        let mut store = ChannelStore::new(caps);
        store.set(Channel::A, ChannelSetting::enabled(Range::R5V), &ctx).unwrap();
        store
    }

    #[test]
    fn test_simple_builder() {
        let trigger = SimpleTrigger::start_capturing_when(Channel::A)
            .rising_edge(1_000)
            .with_delay(10)
            .auto(100);
        assert_eq!(trigger.direction, ThresholdDirection::Rising);
        assert_eq!(trigger.delay, 10);
        assert_eq!(trigger.auto_trigger_ms, 100);

        let adc = trigger.to_adc(Range::R5V, 32_512).unwrap();
        assert_eq!(adc.threshold, 6_502);
        assert!(trigger.to_adc(Range::R500mV, 32_512).is_err());
    }

    #[test]
    fn test_source_must_be_enabled() {
        let store = store_with_a();
        let on_a: TriggerSpec = SimpleTrigger::start_capturing_when(Channel::A)
            .falling_edge(0)
            .into();
        assert!(on_a.validate(&store).is_ok());

        let on_b: TriggerSpec = SimpleTrigger::start_capturing_when(Channel::B)
            .above(0)
            .into();
        assert_eq!(on_b.validate(&store), Err(TriggerError::SourceDisabled(Channel::B)));
        assert!(TriggerSpec::None.validate(&store).is_ok());
    }

    #[test]
    fn test_advanced_sources() {
        let store = store_with_a();
        let advanced = AdvancedTrigger {
            properties: vec![TriggerChannelProperties::level(
                TriggerSource::Channel(Channel::A),
                1_000,
                256,
            )],
            conditions: vec![TriggerConditions::when()
                .channel(Channel::A, ConditionState::True)
                .set(TriggerSource::External, ConditionState::True)
                .channel(Channel::C, ConditionState::DontCare)
                .build()],
            directions: TriggerDirections::new()
                .with(TriggerSource::Channel(Channel::A), ThresholdDirection::Rising),
            ..AdvancedTrigger::default()
        };
        let spec = TriggerSpec::from(advanced.clone());
        assert_eq!(spec.source_channels(), vec![Channel::A]);
        assert!(spec.validate(&store).is_ok());

        let with_pwq = AdvancedTrigger {
            pulse_width: Some(PulseWidthQualifier {
                conditions: vec![TriggerConditions::when()
                    .channel(Channel::D, ConditionState::True)
                    .build()],
                direction: ThresholdDirection::Rising,
                lower: 100,
                upper: 50,
                kind: PulseWidthType::InRange,
            }),
            ..advanced
        };
        assert_eq!(
            TriggerSpec::from(with_pwq).validate(&store),
            Err(TriggerError::SourceDisabled(Channel::D))
        );
    }

    #[test]
    fn test_pulse_width_bounds() {
        let pwq = PulseWidthQualifier {
            conditions: Vec::new(),
            direction: ThresholdDirection::Falling,
            lower: 100,
            upper: 50,
            kind: PulseWidthType::InRange,
        };
        assert!(pwq.validate().is_err());
        let less_than = PulseWidthQualifier {
            kind: PulseWidthType::LessThan,
            ..pwq
        };
        assert!(less_than.validate().is_ok());
    }

    #[test]
    fn test_direction_edges() {
        assert!(ThresholdDirection::Rising.fires_on_rise());
        assert!(!ThresholdDirection::Rising.fires_on_fall());
        assert!(ThresholdDirection::RisingOrFalling.fires_on_fall());
        assert_eq!(
            TriggerDirections::new().get(TriggerSource::Aux),
            ThresholdDirection::None
        );
    }
}
