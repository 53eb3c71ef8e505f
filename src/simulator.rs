//! In-process stand-in for the vendor driver.
//!
//! [`SimulatedDriver`] implements [`ScopeDriver`] for a set of attached virtual units. Each
//! channel samples a deterministic [`Signal`], so captured values can be checked against
//! [`Signal::adc_at`]. Streaming runs on a driver-owned producer thread that answers poll
//! requests one at a time, which gives the same single-callback-in-flight guarantee as the
//! real driver. Block captures complete on a separate thread that `stop` can cancel.

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::buffers::SampleBuffer;
use crate::capabilities::{capabilities_for, ModelCapabilities, Range};
use crate::channels::ChannelSetting;
use crate::driver::{
    BlockReadyCallback, BufferBinding, Channel, DigitalPort, DriverError, DriverResult, Handle,
    InfoLine, LatestValues, OpenedUnit, PowerNotice, PowerSource, RatioMode, Resolution,
    ScopeDriver, StreamingCallback, StreamingRequest, TimebaseInfo, TriggerInfo,
};
use crate::trigger_config::{
    ConditionState, PulseWidthQualifier, SimpleTriggerAdc, ThresholdDirection,
    TriggerChannelProperties, TriggerConditions, TriggerDirections, TriggerSource,
};
use crate::units::mv_to_adc;

/// Waveform applied to a simulated input, as a function of the raw sample index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signal {
    #[default]
    Ground,
    Dc { mv: i32 },
    Sine { amplitude_mv: i32, period_samples: u32 },
    /// Sawtooth from `low_mv` up to just below `high_mv`.
    Ramp {
        low_mv: i32,
        high_mv: i32,
        period_samples: u32,
    },
    /// `low_mv` before `at_sample`, `high_mv` from then on.
    Step {
        low_mv: i32,
        high_mv: i32,
        at_sample: u64,
    },
}

impl Signal {
    pub fn mv_at(&self, index: u64) -> i32 {
        match *self {
            Self::Ground => 0,
            Self::Dc { mv } => mv,
            Self::Sine {
                amplitude_mv,
                period_samples,
            } => {
                let period = u64::from(period_samples.max(1));
                let phase = (index % period) as f64 / period as f64;
                (f64::from(amplitude_mv) * (TAU * phase).sin()).round() as i32
            }
            Self::Ramp {
                low_mv,
                high_mv,
                period_samples,
            } => {
                let period = i64::from(period_samples.max(1));
                let step = (index % period as u64) as i64;
                let span = i64::from(high_mv) - i64::from(low_mv);
                (i64::from(low_mv) + span * step / period) as i32
            }
            Self::Step {
                low_mv,
                high_mv,
                at_sample,
            } => {
                if index >= at_sample {
                    high_mv
                } else {
                    low_mv
                }
            }
        }
    }

    /// The ADC count a channel set to `range` reads at `index`.
    pub fn adc_at(&self, index: u64, range: Range, max_adc: i16) -> i16 {
        mv_to_adc(self.mv_at(index), range, max_adc)
    }

    fn over_range(&self, index: u64, range: Range) -> bool {
        self.mv_at(index).abs() > range.full_scale_mv()
    }
}

/// How fast streamed samples become available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Every poll yields up to `chunk` samples regardless of wall-clock time.
    Immediate { chunk: u32 },
    /// Samples accrue at the negotiated sample interval.
    RealTime,
}

impl Default for Pacing {
    fn default() -> Self {
        Self::Immediate { chunk: 4_096 }
    }
}

/// One attached virtual unit.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub variant: String,
    pub serial: String,
    pub start_on_usb_power: bool,
    pub mains_available: bool,
    pub signals: BTreeMap<Channel, Signal>,
    pub pacing: Pacing,
    /// Fastest sample interval the streaming engine accepts.
    pub min_streaming_interval_ns: f64,
    /// How far ahead the trigger search looks before giving up.
    pub trigger_search_limit: u64,
}

impl SimulatorConfig {
    pub fn new(variant: &str) -> Self {
        Self {
            variant: variant.to_string(),
            serial: "SIM00001".to_string(),
            start_on_usb_power: false,
            mains_available: true,
            signals: BTreeMap::new(),
            pacing: Pacing::default(),
            min_streaming_interval_ns: 100.0,
            trigger_search_limit: 10_000_000,
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.serial = serial.to_string();
        self
    }

    /// Opens on USB power with no supply attached until [`SimulatedDriver::set_mains_available`].
    pub fn on_usb_power(mut self) -> Self {
        self.start_on_usb_power = true;
        self.mains_available = false;
        self
    }

    pub fn with_signal(mut self, channel: Channel, signal: Signal) -> Self {
        self.signals.insert(channel, signal);
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_min_streaming_interval_ns(mut self, ns: f64) -> Self {
        self.min_streaming_interval_ns = ns;
        self
    }
}

#[derive(Debug)]
struct Attached {
    config: SimulatorConfig,
    caps: &'static ModelCapabilities,
    mains_available: Arc<AtomicBool>,
    handle: Option<Handle>,
}

/// Trigger condition reduced to one source channel crossing one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SimTrigger {
    source: Channel,
    threshold: i16,
    direction: ThresholdDirection,
    delay: u32,
    auto_trigger_ms: i16,
}

#[derive(Debug, Default)]
struct AdvancedState {
    properties: Vec<TriggerChannelProperties>,
    conditions: Vec<TriggerConditions>,
    directions: TriggerDirections,
    auto_trigger_ms: i16,
}

#[derive(Debug)]
struct BlockRun {
    ready: Arc<AtomicBool>,
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

enum ProducerMsg {
    Poll {
        callback: Arc<dyn StreamingCallback>,
        reply: mpsc::Sender<DriverResult<()>>,
    },
    Stop,
}

struct StreamRun {
    requests: mpsc::Sender<ProducerMsg>,
    thread: JoinHandle<()>,
}

struct Unit {
    slot: usize,
    caps: &'static ModelCapabilities,
    serial: String,
    signals: BTreeMap<Channel, Signal>,
    pacing: Pacing,
    min_streaming_interval_ns: f64,
    trigger_search_limit: u64,
    mains_available: Arc<AtomicBool>,

    resolution: Resolution,
    power: PowerSource,
    channels: Vec<ChannelSetting>,
    digital_ports: Vec<(bool, i16)>,
    bindings: BTreeMap<(Channel, u32), BufferBinding>,
    simple_trigger: Option<SimTrigger>,
    advanced: AdvancedState,
    trigger_delay: u32,

    segments: u32,
    captures: u32,
    memory: BTreeMap<(Channel, u32), Vec<i16>>,
    segment_overflow: BTreeMap<u32, u16>,
    segment_triggers: Vec<TriggerInfo>,

    block: Option<BlockRun>,
    streaming: Option<StreamRun>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fires(direction: ThresholdDirection, prev: i16, cur: i16, threshold: i16) -> bool {
    match direction {
        ThresholdDirection::Above => cur > threshold,
        ThresholdDirection::Below => cur < threshold,
        ThresholdDirection::None => false,
        d => {
            (d.fires_on_rise() && prev < threshold && cur >= threshold)
                || (d.fires_on_fall() && prev > threshold && cur <= threshold)
        }
    }
}

/// Collapses `raw` into one output sample as `(max, min)`.
fn reduce(raw: &[i16], mode: RatioMode) -> (i16, i16) {
    let first = raw.first().copied().unwrap_or(0);
    match mode {
        RatioMode::None | RatioMode::Decimate => (first, first),
        RatioMode::Average => {
            let sum: i64 = raw.iter().map(|v| i64::from(*v)).sum();
            let mean = (sum / raw.len().max(1) as i64) as i16;
            (mean, mean)
        }
        RatioMode::Aggregate => (
            raw.iter().copied().max().unwrap_or(first),
            raw.iter().copied().min().unwrap_or(first),
        ),
    }
}

impl Unit {
    fn setting(&self, channel: Channel) -> Option<&ChannelSetting> {
        self.channels.get(channel.index())
    }

    fn enabled(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, s)| s.enabled)
            .filter_map(|(i, _)| Channel::from_index(i))
            .collect()
    }

    fn max_adc(&self) -> i16 {
        self.caps.max_adc_value(self.resolution)
    }

    fn signal(&self, channel: Channel) -> Signal {
        self.signals.get(&channel).copied().unwrap_or_default()
    }

    fn range(&self, channel: Channel) -> Range {
        self.setting(channel).map_or(Range::R5V, |s| s.range)
    }

    fn quota(&self) -> usize {
        self.caps.channel_quota(self.resolution, self.power)
    }

    fn is_busy(&self) -> bool {
        self.streaming.is_some()
            || self
                .block
                .as_ref()
                .and_then(|run| run.thread.as_ref())
                .is_some_and(|thread| !thread.is_finished())
    }

    fn active_trigger(&self) -> Option<SimTrigger> {
        self.simple_trigger.or_else(|| self.advanced_trigger())
    }

    // The first condition that requires a channel selects the property and direction used.
    fn advanced_trigger(&self) -> Option<SimTrigger> {
        let advanced = &self.advanced;
        let source = advanced.conditions.iter().find_map(|condition| {
            condition
                .states
                .iter()
                .find_map(|(source, state)| match (source, state) {
                    (TriggerSource::Channel(c), ConditionState::True) => Some(*c),
                    _ => None,
                })
        })?;
        let property = advanced
            .properties
            .iter()
            .find(|p| p.source == TriggerSource::Channel(source))?;
        let direction = advanced.directions.get(TriggerSource::Channel(source));
        let threshold = if direction.fires_on_fall() && !direction.fires_on_rise() {
            property.lower_threshold
        } else {
            property.upper_threshold
        };
        Some(SimTrigger {
            source,
            threshold,
            direction,
            delay: self.trigger_delay,
            auto_trigger_ms: advanced.auto_trigger_ms,
        })
    }

    /// Raw index of the first trigger event at or after `from`, delay included.
    fn find_trigger(&self, trigger: &SimTrigger, from: u64) -> Option<u64> {
        let signal = self.signal(trigger.source);
        let range = self.range(trigger.source);
        let max_adc = self.max_adc();
        let mut prev = signal.adc_at(from.saturating_sub(1), range, max_adc);
        (from..from.saturating_add(self.trigger_search_limit)).find_map(|i| {
            let cur = signal.adc_at(i, range, max_adc);
            let hit = fires(trigger.direction, prev, cur, trigger.threshold);
            prev = cur;
            hit.then(|| i + u64::from(trigger.delay))
        })
    }

    fn overflow_mask(&self, channels: &[Channel], from: u64, len: u64) -> u16 {
        channels.iter().fold(0u16, |mask, channel| {
            let signal = self.signal(*channel);
            let range = self.range(*channel);
            if (from..from + len).any(|i| signal.over_range(i, range)) {
                mask | (1 << channel.index())
            } else {
                mask
            }
        })
    }

    fn read_into(
        &self,
        start: u32,
        no_of_samples: u32,
        ratio: u32,
        mode: RatioMode,
        segment: u32,
    ) -> DriverResult<u32> {
        let ratio = ratio.max(1) as usize;
        let mut written = no_of_samples;
        for channel in self.enabled() {
            let raw = self
                .memory
                .get(&(channel, segment))
                .ok_or(DriverError::SegmentOutOfRange(segment))?;
            let binding = self
                .bindings
                .get(&(channel, segment))
                .ok_or(DriverError::BufferNotSet(channel))?;
            if mode.needs_min_buffer() && binding.min.is_none() {
                return Err(DriverError::InvalidParameter("aggregation needs a min buffer"));
            }
            let start = (start as usize).min(raw.len());
            let end = start
                .saturating_add(no_of_samples as usize)
                .min(raw.len());
            let mut count = 0usize;
            for (i, chunk) in raw[start..end].chunks(ratio).enumerate() {
                if i >= binding.max.len() {
                    break;
                }
                let (max, min) = reduce(chunk, mode);
                binding.max.set(i, max);
                if let Some(buffer) = &binding.min {
                    buffer.set(i, min);
                }
                count += 1;
            }
            written = written.min(count as u32);
        }
        Ok(written)
    }
}

/// A [`ScopeDriver`] backed by synthetic signals.
pub struct SimulatedDriver {
    attached: Mutex<Vec<Attached>>,
    units: Mutex<BTreeMap<Handle, Arc<Mutex<Unit>>>>,
    next_handle: AtomicI16,
}

impl std::fmt::Debug for SimulatedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDriver")
            .field("attached", &lock(&self.attached).len())
            .field("open", &lock(&self.units).len())
            .finish()
    }
}

impl SimulatedDriver {
    /// A driver with a single attached unit.
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_units(vec![config])
    }

    /// Unknown variants are attached anyway; opening them reports the variant as-is.
    pub fn with_units(configs: Vec<SimulatorConfig>) -> Self {
        let attached = configs
            .into_iter()
            .filter_map(|config| {
                let Some(caps) = capabilities_for(&config.variant) else {
                    log::warn!("simulator: unknown variant {}, not attached", config.variant);
                    return None;
                };
                Some(Attached {
                    mains_available: Arc::new(AtomicBool::new(config.mains_available)),
                    config,
                    caps,
                    handle: None,
                })
            })
            .collect();
        Self {
            attached: Mutex::new(attached),
            units: Mutex::new(BTreeMap::new()),
            next_handle: AtomicI16::new(1),
        }
    }

    /// Plugs or unplugs the external supply of the unit with `serial`.
    pub fn set_mains_available(&self, serial: &str, available: bool) {
        if let Some(unit) = lock(&self.attached)
            .iter()
            .find(|a| a.config.serial == serial)
        {
            unit.mains_available.store(available, Ordering::Release);
        }
    }

    fn unit(&self, handle: Handle) -> DriverResult<Arc<Mutex<Unit>>> {
        lock(&self.units)
            .get(&handle)
            .cloned()
            .ok_or(DriverError::InvalidHandle(handle))
    }

    fn with_unit<T>(&self, handle: Handle, f: impl FnOnce(&mut Unit) -> DriverResult<T>) -> DriverResult<T> {
        let unit = self.unit(handle)?;
        let mut unit = lock(&unit);
        f(&mut unit)
    }

    fn with_idle_unit<T>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut Unit) -> DriverResult<T>,
    ) -> DriverResult<T> {
        self.with_unit(handle, |unit| {
            if unit.is_busy() {
                return Err(DriverError::Busy);
            }
            f(unit)
        })
    }
}

impl ScopeDriver for SimulatedDriver {
    fn open_unit(&self, serial: Option<&str>) -> DriverResult<OpenedUnit> {
        let mut attached = lock(&self.attached);
        let slot = match serial {
            Some(serial) => {
                let slot = attached
                    .iter()
                    .position(|a| a.config.serial == serial)
                    .ok_or(DriverError::NotFound)?;
                if attached[slot].handle.is_some() {
                    return Err(DriverError::AlreadyOpen);
                }
                slot
            }
            None => attached
                .iter()
                .position(|a| a.handle.is_none())
                .ok_or(DriverError::NotFound)?,
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let entry = &mut attached[slot];
        entry.handle = Some(handle);
        let config = &entry.config;
        let power = if config.start_on_usb_power {
            PowerSource::UsbOnly
        } else {
            PowerSource::MainsConnected
        };
        let unit = Unit {
            slot,
            caps: entry.caps,
            serial: config.serial.clone(),
            signals: config.signals.clone(),
            pacing: config.pacing,
            min_streaming_interval_ns: config.min_streaming_interval_ns,
            trigger_search_limit: config.trigger_search_limit,
            mains_available: Arc::clone(&entry.mains_available),
            resolution: entry.caps.default_resolution(),
            power,
            channels: vec![ChannelSetting::default(); entry.caps.channel_count],
            digital_ports: vec![(false, 0); entry.caps.digital_ports],
            bindings: BTreeMap::new(),
            simple_trigger: None,
            advanced: AdvancedState::default(),
            trigger_delay: 0,
            segments: 1,
            captures: 1,
            memory: BTreeMap::new(),
            segment_overflow: BTreeMap::new(),
            segment_triggers: Vec::new(),
            block: None,
            streaming: None,
        };
        log::debug!("simulator: opened {} ({}) as handle {handle}", config.serial, config.variant);
        lock(&self.units).insert(handle, Arc::new(Mutex::new(unit)));
        Ok(OpenedUnit {
            handle,
            power_notice: config
                .start_on_usb_power
                .then_some(PowerNotice::PowerSupplyNotConnected),
        })
    }

    fn close_unit(&self, handle: Handle) -> DriverResult<()> {
        self.stop(handle)?;
        let unit = lock(&self.units)
            .remove(&handle)
            .ok_or(DriverError::InvalidHandle(handle))?;
        let slot = lock(&unit).slot;
        if let Some(entry) = lock(&self.attached).get_mut(slot) {
            entry.handle = None;
        }
        log::debug!("simulator: closed handle {handle}");
        Ok(())
    }

    fn unit_info(&self, handle: Handle, line: InfoLine) -> DriverResult<String> {
        self.with_unit(handle, |unit| {
            Ok(match line {
                InfoLine::DriverVersion => format!("usbscope simulator {}", env!("CARGO_PKG_VERSION")),
                InfoLine::UsbVersion => "3.0".to_string(),
                InfoLine::HardwareVersion => "1".to_string(),
                InfoLine::VariantInfo => unit.caps.variant.to_string(),
                InfoLine::BatchAndSerial => unit.serial.clone(),
                InfoLine::CalDate => "01Jan26".to_string(),
                InfoLine::KernelVersion => "1.0".to_string(),
                InfoLine::Firmware1 => "1.0.0.0".to_string(),
                InfoLine::Firmware2 => "1.0.0.0".to_string(),
            })
        })
    }

    fn maximum_value(&self, handle: Handle) -> DriverResult<i16> {
        self.with_unit(handle, |unit| Ok(unit.max_adc()))
    }

    fn set_resolution(&self, handle: Handle, resolution: Resolution) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            if !unit.caps.supports_resolution(resolution) {
                return Err(DriverError::InvalidParameter("resolution"));
            }
            if unit.enabled().len() > unit.caps.channel_quota(resolution, unit.power) {
                return Err(DriverError::TooManyChannelsInUse);
            }
            unit.resolution = resolution;
            Ok(())
        })
    }

    fn change_power_source(&self, handle: Handle, source: PowerSource) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            match source {
                PowerSource::MainsConnected if !unit.mains_available.load(Ordering::Acquire) => {
                    return Err(DriverError::PowerSupplyNotConnected);
                }
                PowerSource::UsbOnly
                    if unit.enabled().len()
                        > unit.caps.channel_quota(unit.resolution, PowerSource::UsbOnly) =>
                {
                    return Err(DriverError::TooManyChannelsInUse);
                }
                _ => {}
            }
            unit.power = source;
            Ok(())
        })
    }

    fn current_power_source(&self, handle: Handle) -> DriverResult<PowerSource> {
        self.with_unit(handle, |unit| {
            let mains = unit.mains_available.load(Ordering::Acquire);
            match (unit.power, mains) {
                (PowerSource::MainsConnected, false) => Err(DriverError::PowerSourceNeedsAcknowledgement),
                (power, _) => Ok(power),
            }
        })
    }

    fn set_channel(&self, handle: Handle, channel: Channel, setting: &ChannelSetting) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            if channel.index() >= unit.caps.channel_count {
                return Err(DriverError::InvalidChannel);
            }
            if !unit.caps.range_allowed(setting.range) {
                return Err(DriverError::InvalidRange);
            }
            if !unit.caps.couplings.contains(&setting.coupling) {
                return Err(DriverError::InvalidCoupling);
            }
            unit.channels[channel.index()] = *setting;
            Ok(())
        })
    }

    fn set_digital_port(
        &self,
        handle: Handle,
        port: DigitalPort,
        enabled: bool,
        logic_threshold: i16,
    ) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            let slot = unit
                .digital_ports
                .get_mut(port.index())
                .ok_or(DriverError::NotUsed)?;
            *slot = (enabled, logic_threshold);
            Ok(())
        })
    }

    fn get_timebase(
        &self,
        handle: Handle,
        timebase: u32,
        _no_of_samples: u32,
        segment: u32,
    ) -> DriverResult<TimebaseInfo> {
        self.with_unit(handle, |unit| {
            let enabled = unit.enabled().len();
            if enabled > unit.quota() {
                return Err(DriverError::TooManyChannelsInUse);
            }
            if timebase < unit.caps.min_timebase(enabled) || timebase > unit.caps.max_timebase {
                return Err(DriverError::InvalidTimebase(timebase));
            }
            if segment >= unit.segments {
                return Err(DriverError::SegmentOutOfRange(segment));
            }
            let per_channel = unit.caps.memory_samples / unit.segments / enabled.max(1) as u32;
            Ok(TimebaseInfo {
                sample_interval_ns: unit.caps.timebase_interval_ns(timebase),
                max_samples: per_channel,
            })
        })
    }

    fn set_simple_trigger(&self, handle: Handle, trigger: Option<&SimpleTriggerAdc>) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            unit.simple_trigger = trigger.map(|t| SimTrigger {
                source: t.source,
                threshold: t.threshold,
                direction: t.direction,
                delay: t.delay,
                auto_trigger_ms: t.auto_trigger_ms,
            });
            unit.advanced = AdvancedState::default();
            Ok(())
        })
    }

    fn set_trigger_channel_properties(
        &self,
        handle: Handle,
        properties: &[TriggerChannelProperties],
        auto_trigger_ms: i16,
    ) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            unit.simple_trigger = None;
            unit.advanced.properties = properties.to_vec();
            unit.advanced.auto_trigger_ms = auto_trigger_ms;
            Ok(())
        })
    }

    fn set_trigger_channel_conditions(&self, handle: Handle, conditions: &[TriggerConditions]) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            unit.simple_trigger = None;
            unit.advanced.conditions = conditions.to_vec();
            Ok(())
        })
    }

    fn set_trigger_channel_directions(&self, handle: Handle, directions: &TriggerDirections) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            unit.advanced.directions = directions.clone();
            Ok(())
        })
    }

    fn set_pulse_width_qualifier(&self, handle: Handle, pwq: Option<&PulseWidthQualifier>) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            if let Some(pwq) = pwq {
                log::debug!("simulator: pulse width qualifier {:?} accepted, not evaluated", pwq.kind);
            }
            Ok(())
        })
    }

    fn set_trigger_delay(&self, handle: Handle, delay: u32) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            unit.trigger_delay = delay;
            Ok(())
        })
    }

    fn set_data_buffers(
        &self,
        handle: Handle,
        channel: Channel,
        segment: u32,
        binding: Option<BufferBinding>,
    ) -> DriverResult<()> {
        self.with_unit(handle, |unit| {
            if channel.index() >= unit.caps.channel_count {
                return Err(DriverError::InvalidChannel);
            }
            match binding {
                Some(binding) => {
                    unit.bindings.insert((channel, segment), binding);
                }
                None => {
                    unit.bindings.remove(&(channel, segment));
                }
            }
            Ok(())
        })
    }

    fn memory_segments(&self, handle: Handle, segments: u32) -> DriverResult<u32> {
        self.with_idle_unit(handle, |unit| {
            if segments == 0 || segments > unit.caps.max_segments {
                return Err(DriverError::SegmentOutOfRange(segments));
            }
            unit.segments = segments;
            unit.captures = unit.captures.min(segments);
            Ok(unit.caps.memory_samples / segments)
        })
    }

    fn set_no_of_captures(&self, handle: Handle, captures: u32) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            if captures == 0 || captures > unit.segments {
                return Err(DriverError::InvalidParameter("number of captures"));
            }
            unit.captures = captures;
            Ok(())
        })
    }

    fn get_no_of_captures(&self, handle: Handle) -> DriverResult<u32> {
        self.with_unit(handle, |unit| Ok(unit.segment_triggers.len() as u32))
    }

    fn run_block(
        &self,
        handle: Handle,
        pre_trigger: u32,
        post_trigger: u32,
        timebase: u32,
        segment: u32,
        ready: Arc<dyn BlockReadyCallback>,
    ) -> DriverResult<u32> {
        self.with_idle_unit(handle, |unit| {
            let enabled = unit.enabled();
            if enabled.is_empty() {
                return Err(DriverError::InvalidParameter("no channels enabled"));
            }
            if enabled.len() > unit.quota() {
                return Err(DriverError::TooManyChannelsInUse);
            }
            if timebase < unit.caps.min_timebase(enabled.len()) || timebase > unit.caps.max_timebase {
                return Err(DriverError::InvalidTimebase(timebase));
            }
            let total = u64::from(pre_trigger) + u64::from(post_trigger);
            let per_segment = u64::from(unit.caps.memory_samples / unit.segments) / enabled.len() as u64;
            if total == 0 || total > per_segment {
                return Err(DriverError::InvalidNumberOfSamples);
            }
            let last_segment = segment + unit.captures - 1;
            if last_segment >= unit.segments {
                return Err(DriverError::SegmentOutOfRange(last_segment));
            }

            unit.memory.clear();
            unit.segment_overflow.clear();
            unit.segment_triggers.clear();
            let trigger = unit.active_trigger();
            let mut cursor = 0u64;
            for seg in segment..=last_segment {
                let (start, triggered) = match trigger
                    .as_ref()
                    .and_then(|t| unit.find_trigger(t, cursor + u64::from(pre_trigger)))
                {
                    Some(at) => (at - u64::from(pre_trigger), true),
                    None => {
                        if trigger.is_some_and(|t| t.auto_trigger_ms == 0) {
                            log::warn!("simulator: trigger never fired in segment {seg}, capturing untriggered");
                        }
                        (cursor, false)
                    }
                };
                for channel in &enabled {
                    let signal = unit.signal(*channel);
                    let range = unit.range(*channel);
                    let max_adc = unit.max_adc();
                    let samples = (start..start + total)
                        .map(|i| signal.adc_at(i, range, max_adc))
                        .collect();
                    unit.memory.insert((*channel, seg), samples);
                }
                let overflow = unit.overflow_mask(&enabled, start, total);
                unit.segment_overflow.insert(seg, overflow);
                unit.segment_triggers.push(TriggerInfo {
                    segment: seg,
                    triggered,
                    trigger_index: if triggered { pre_trigger } else { 0 },
                });
                cursor = start + total + total / 2;
            }

            let interval_ns = unit.caps.timebase_interval_ns(timebase);
            let indisposed_ms = match unit.pacing {
                Pacing::Immediate { .. } => 0,
                Pacing::RealTime => {
                    (total as f64 * f64::from(unit.captures) * interval_ns / 1e6).ceil() as u32
                }
            };

            let ready_flag = Arc::new(AtomicBool::new(false));
            let (cancel, cancelled) = mpsc::channel();
            let flag = Arc::clone(&ready_flag);
            let thread = thread::Builder::new()
                .name(format!("sim-block-{handle}"))
                .spawn(move || {
                    match cancelled.recv_timeout(Duration::from_millis(u64::from(indisposed_ms))) {
                        Err(RecvTimeoutError::Timeout) => {
                            flag.store(true, Ordering::Release);
                            ready.on_block_ready(handle, Ok(()));
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            ready.on_block_ready(handle, Err(DriverError::Cancelled));
                        }
                    }
                })
                .map_err(|_| DriverError::UsbGenericFailure)?;
            unit.block = Some(BlockRun {
                ready: ready_flag,
                cancel: Some(cancel),
                thread: Some(thread),
            });
            log::debug!(
                "simulator: block armed on {handle}, {total} samples x {} captures",
                unit.captures
            );
            Ok(indisposed_ms)
        })
    }

    fn is_ready(&self, handle: Handle) -> DriverResult<bool> {
        self.with_unit(handle, |unit| {
            Ok(unit
                .block
                .as_ref()
                .is_some_and(|run| run.ready.load(Ordering::Acquire)))
        })
    }

    fn get_values(
        &self,
        handle: Handle,
        start: u32,
        no_of_samples: u32,
        downsample_ratio: u32,
        ratio_mode: RatioMode,
        segment: u32,
    ) -> DriverResult<(u32, u16)> {
        self.with_unit(handle, |unit| {
            if !unit
                .block
                .as_ref()
                .is_some_and(|run| run.ready.load(Ordering::Acquire))
            {
                return Err(DriverError::Busy);
            }
            let written = unit.read_into(start, no_of_samples, downsample_ratio, ratio_mode, segment)?;
            let overflow = unit.segment_overflow.get(&segment).copied().unwrap_or(0);
            Ok((written, overflow))
        })
    }

    fn get_values_bulk(
        &self,
        handle: Handle,
        no_of_samples: u32,
        from_segment: u32,
        to_segment: u32,
        downsample_ratio: u32,
        ratio_mode: RatioMode,
    ) -> DriverResult<(u32, Vec<u16>)> {
        if to_segment < from_segment {
            return Err(DriverError::InvalidParameter("segment range"));
        }
        let mut written = no_of_samples;
        let mut overflows = Vec::new();
        for segment in from_segment..=to_segment {
            let (n, overflow) =
                self.get_values(handle, 0, no_of_samples, downsample_ratio, ratio_mode, segment)?;
            written = written.min(n);
            overflows.push(overflow);
        }
        Ok((written, overflows))
    }

    fn get_trigger_info_bulk(&self, handle: Handle, from_segment: u32, to_segment: u32) -> DriverResult<Vec<TriggerInfo>> {
        self.with_unit(handle, |unit| {
            (from_segment..=to_segment)
                .map(|segment| {
                    unit.segment_triggers
                        .iter()
                        .find(|info| info.segment == segment)
                        .copied()
                        .ok_or(DriverError::SegmentOutOfRange(segment))
                })
                .collect()
        })
    }

    fn run_streaming(&self, handle: Handle, request: &mut StreamingRequest) -> DriverResult<()> {
        self.with_idle_unit(handle, |unit| {
            let enabled = unit.enabled();
            if enabled.is_empty() {
                return Err(DriverError::InvalidParameter("no channels enabled"));
            }
            if enabled.len() > unit.quota() {
                return Err(DriverError::TooManyChannelsInUse);
            }

            let unit_ns = request.time_units.as_nanos();
            let floor_ns = unit
                .min_streaming_interval_ns
                .max(unit.caps.timebase_interval_ns(unit.caps.min_timebase(enabled.len())));
            if f64::from(request.sample_interval) * unit_ns < floor_ns {
                let adjusted = (floor_ns / unit_ns).ceil().max(1.0) as u32;
                log::debug!(
                    "simulator: sample interval {} raised to {adjusted} ({:?})",
                    request.sample_interval,
                    request.time_units
                );
                request.sample_interval = adjusted;
            }
            let interval_ns = f64::from(request.sample_interval) * unit_ns;

            let ratio = request.downsample_ratio.max(1);
            let mut channels = Vec::with_capacity(enabled.len());
            for channel in &enabled {
                let binding = unit
                    .bindings
                    .get(&(*channel, 0))
                    .cloned()
                    .ok_or(DriverError::BufferNotSet(*channel))?;
                if request.ratio_mode.needs_min_buffer() && binding.min.is_none() {
                    return Err(DriverError::InvalidParameter("aggregation needs a min buffer"));
                }
                channels.push(ProducerChannel {
                    channel: *channel,
                    signal: unit.signal(*channel),
                    range: unit.range(*channel),
                    max: binding.max,
                    min: binding.min,
                });
            }
            let ring = channels.iter().map(|c| c.max.len()).min().unwrap_or(0);
            if ring == 0 {
                return Err(DriverError::InvalidParameter("empty streaming buffer"));
            }

            // pre/post count raw samples; the ring and the callbacks count downsampled ones
            let pre = u64::from(request.pre_trigger);
            let total = pre + u64::from(request.post_trigger);
            let (start_raw, trigger_at) = match unit.active_trigger() {
                Some(trigger) => match unit.find_trigger(&trigger, 0) {
                    Some(at) => {
                        let start = at.saturating_sub(pre);
                        (start, Some((at - start) / u64::from(ratio)))
                    }
                    None => (0, None),
                },
                None => (0, None),
            };

            let producer = Producer {
                handle,
                channels,
                max_adc: unit.max_adc(),
                ratio: u64::from(ratio),
                mode: request.ratio_mode,
                ring,
                produced: 0,
                target: request
                    .auto_stop
                    .then(|| total.div_ceil(u64::from(ratio))),
                start_raw,
                trigger_at,
                trigger_reported: false,
                pacing: unit.pacing,
                interval_ns: interval_ns * f64::from(ratio),
                started: Instant::now(),
            };
            let (requests, inbox) = mpsc::channel();
            let thread = thread::Builder::new()
                .name(format!("sim-stream-{handle}"))
                .spawn(move || producer.run(&inbox))
                .map_err(|_| DriverError::UsbGenericFailure)?;
            unit.streaming = Some(StreamRun { requests, thread });
            log::debug!("simulator: streaming on {handle}, ring of {ring} samples");
            Ok(())
        })
    }

    fn get_streaming_latest_values(&self, handle: Handle, callback: Arc<dyn StreamingCallback>) -> DriverResult<()> {
        let requests = self.with_unit(handle, |unit| {
            unit.streaming
                .as_ref()
                .map(|run| run.requests.clone())
                .ok_or(DriverError::NoSamplesReady)
        })?;
        let (reply, answer) = mpsc::channel();
        requests
            .send(ProducerMsg::Poll { callback, reply })
            .map_err(|_| DriverError::NoSamplesReady)?;
        answer.recv().unwrap_or(Err(DriverError::NoSamplesReady))
    }

    fn stop(&self, handle: Handle) -> DriverResult<()> {
        let (block, streaming) = self.with_unit(handle, |unit| {
            // a completed block keeps its ready flag and stays readable
            let block = unit.block.as_mut().and_then(|run| {
                if let Some(cancel) = run.cancel.take() {
                    let _ = cancel.send(());
                }
                run.thread.take()
            });
            Ok((block, unit.streaming.take()))
        })?;
        if let Some(run) = streaming {
            // the producer may already have exited after its inbox closed
            let _ = run.requests.send(ProducerMsg::Stop);
            if run.thread.join().is_err() {
                log::warn!("simulator: streaming thread of {handle} panicked");
            }
        }
        if let Some(thread) = block {
            if thread.join().is_err() {
                log::warn!("simulator: block thread of {handle} panicked");
            }
        }
        Ok(())
    }

    fn flash_led(&self, handle: Handle, count: i16) -> DriverResult<()> {
        self.with_unit(handle, |_| {
            log::debug!("simulator: flashing LED of {handle} {count} times");
            Ok(())
        })
    }
}

struct ProducerChannel {
    channel: Channel,
    signal: Signal,
    range: Range,
    max: Arc<SampleBuffer>,
    min: Option<Arc<SampleBuffer>>,
}

/// State of the streaming engine, owned by its thread.
struct Producer {
    handle: Handle,
    channels: Vec<ProducerChannel>,
    max_adc: i16,
    ratio: u64,
    mode: RatioMode,
    ring: usize,
    produced: u64,
    target: Option<u64>,
    start_raw: u64,
    trigger_at: Option<u64>,
    trigger_reported: bool,
    pacing: Pacing,
    interval_ns: f64,
    started: Instant,
}

impl Producer {
    fn run(mut self, inbox: &mpsc::Receiver<ProducerMsg>) {
        while let Ok(ProducerMsg::Poll { callback, reply }) = inbox.recv() {
            let result = match self.next_window() {
                Some(values) => {
                    callback.on_latest_values(self.handle, &values);
                    Ok(())
                }
                None => Err(DriverError::NoSamplesReady),
            };
            // the poller may have given up waiting
            let _ = reply.send(result);
        }
    }

    fn available(&self) -> u64 {
        match self.pacing {
            Pacing::Immediate { chunk } => u64::from(chunk.max(1)),
            Pacing::RealTime => {
                let elapsed = self.started.elapsed().as_nanos() as f64;
                let due = (elapsed / self.interval_ns.max(1.0)) as u64;
                due.saturating_sub(self.produced)
            }
        }
    }

    fn next_window(&mut self) -> Option<LatestValues> {
        let write_pos = (self.produced % self.ring as u64) as usize;
        let mut n = self
            .available()
            .min((self.ring - write_pos) as u64);
        if let Some(target) = self.target {
            n = n.min(target.saturating_sub(self.produced));
        }
        if n == 0 {
            return None;
        }

        let mut overflow = 0u16;
        let mut raw = Vec::with_capacity(self.ratio as usize);
        for channel in &self.channels {
            for i in 0..n {
                let first = self.start_raw + (self.produced + i) * self.ratio;
                raw.clear();
                raw.extend((first..first + self.ratio).map(|r| channel.signal.adc_at(r, channel.range, self.max_adc)));
                if (first..first + self.ratio).any(|r| channel.signal.over_range(r, channel.range)) {
                    overflow |= 1 << channel.channel.index();
                }
                let (max, min) = reduce(&raw, self.mode);
                channel.max.set(write_pos + i as usize, max);
                if let Some(buffer) = &channel.min {
                    buffer.set(write_pos + i as usize, min);
                }
            }
        }

        let mut values = LatestValues {
            no_of_samples: n as u32,
            start_index: write_pos as u32,
            overflow,
            ..LatestValues::default()
        };
        if let Some(at) = self.trigger_at {
            if !self.trigger_reported && (self.produced..self.produced + n).contains(&at) {
                values.triggered = true;
                values.triggered_at = (at - self.produced) as u32;
                self.trigger_reported = true;
            }
        }
        self.produced += n;
        values.auto_stop = self.target.is_some_and(|target| self.produced >= target);
        Some(values)
    }
}
