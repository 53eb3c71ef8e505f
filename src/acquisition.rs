//! Acquisition controller.
//!
//! Selects a timebase, arms block, rapid-block and streaming captures, waits for completion and
//! retrieves values. Every driver failure other than "no samples yet" is surfaced unchanged;
//! nothing here retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::buffers::BufferError;
use crate::capabilities::Range;
use crate::channels::ChannelError;
use crate::drain::AbortSignal;
use crate::driver::{
    BlockReadyCallback, Channel, DriverError, DriverResult, Handle, RatioMode, StreamingCallback,
    StreamingRequest, TimeUnits, TimebaseInfo,
};
use crate::registry::Device;
use crate::streaming::{IndexMode, StreamingPipeline};
use crate::trigger_config::{SimpleTriggerAdc, TriggerError, TriggerSpec};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("device is busy ({0:?})")]
    Busy(DeviceState),

    #[error("{operation} failed: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("{operation} failed: {source}")]
    Channel {
        operation: &'static str,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("setTrigger failed: {0}")]
    Trigger(#[from] TriggerError),

    #[error("no valid timebase between {from} and {to}")]
    TimebaseInvalid { from: u32, to: u32 },

    #[error("{requested} samples requested but only {available} fit")]
    TooManySamples { requested: u64, available: u64 },

    #[error("no channels enabled")]
    NoChannelsEnabled,

    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("not possible while {0:?}")]
    InvalidState(DeviceState),

    #[error("aborted")]
    Aborted,
}

impl AcquisitionError {
    pub(crate) fn driver(operation: &'static str) -> impl FnOnce(DriverError) -> Self {
        move |source| Self::Driver { operation, source }
    }
}

/// Lifecycle of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
    ChannelsSet,
    Armed,
    Streaming,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Block,
    RapidBlock,
    Stream,
    /// Streaming into a ring-sized application buffer.
    Window,
    Ets,
}

/// `pre + post`, which the driver counts in a `u32`.
fn sample_total(pre_trigger: u32, post_trigger: u32) -> Result<u32, AcquisitionError> {
    pre_trigger
        .checked_add(post_trigger)
        .ok_or(AcquisitionError::TooManySamples {
            requested: u64::from(pre_trigger) + u64::from(post_trigger),
            available: u64::from(u32::MAX),
        })
}

/// Parameters of the capture currently or last armed. Replaced only while stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionSettings {
    pub mode: CaptureMode,
    pub pre_trigger: u32,
    pub post_trigger: u32,
    pub downsample_ratio: u32,
    pub ratio_mode: RatioMode,
    pub auto_stop: bool,
    pub timebase: Option<u32>,
    pub sample_interval_ns: f64,
    pub segments: u32,
}

impl AcquisitionSettings {
    pub fn total_samples(&self) -> u32 {
        self.pre_trigger.saturating_add(self.post_trigger)
    }

    /// Samples per channel after downsampling.
    pub fn output_samples(&self) -> u32 {
        self.total_samples().div_ceil(self.downsample_ratio.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    pub pre_trigger: u32,
    pub post_trigger: u32,
    /// First timebase the selection probe tries.
    pub timebase: u32,
    pub downsample_ratio: u32,
    pub ratio_mode: RatioMode,
}

impl BlockConfig {
    pub fn new(samples: u32) -> Self {
        Self {
            pre_trigger: 0,
            post_trigger: samples,
            timebase: 0,
            downsample_ratio: 1,
            ratio_mode: RatioMode::None,
        }
    }

    /// Moves `pre` of the samples in front of the trigger point.
    pub fn with_pre_trigger(mut self, pre: u32) -> Self {
        let total = self.pre_trigger.saturating_add(self.post_trigger);
        self.pre_trigger = pre.min(total);
        self.post_trigger = total - self.pre_trigger;
        self
    }

    pub fn with_timebase(mut self, timebase: u32) -> Self {
        self.timebase = timebase;
        self
    }

    pub fn with_downsampling(mut self, ratio: u32, mode: RatioMode) -> Self {
        self.downsample_ratio = ratio.max(1);
        self.ratio_mode = mode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RapidBlockConfig {
    pub captures: u32,
    pub block: BlockConfig,
}

impl RapidBlockConfig {
    pub fn new(captures: u32, samples_per_capture: u32) -> Self {
        Self {
            captures,
            block: BlockConfig::new(samples_per_capture),
        }
    }

    pub fn with_pre_trigger(mut self, pre: u32) -> Self {
        self.block = self.block.with_pre_trigger(pre);
        self
    }

    pub fn with_timebase(mut self, timebase: u32) -> Self {
        self.block = self.block.with_timebase(timebase);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingConfig {
    pub sample_interval: u32,
    pub time_units: TimeUnits,
    /// Raw samples before the trigger. With downsampling the capture delivers
    /// `(pre_trigger + post_trigger) / downsample_ratio` samples, rounded up.
    pub pre_trigger: u32,
    pub post_trigger: u32,
    pub auto_stop: bool,
    pub downsample_ratio: u32,
    pub ratio_mode: RatioMode,
    /// Size of the driver buffers, and of the ring the driver writes into.
    pub buffer_capacity: u32,
    pub index_mode: IndexMode,
    /// Application buffer size in app-indexed mode. Defaults to pre + post trigger.
    pub app_capacity: Option<usize>,
}

impl StreamingConfig {
    pub fn new(sample_interval: u32, time_units: TimeUnits) -> Self {
        Self {
            sample_interval,
            time_units,
            pre_trigger: 0,
            post_trigger: 1_000_000,
            auto_stop: true,
            downsample_ratio: 1,
            ratio_mode: RatioMode::None,
            buffer_capacity: 100_000,
            index_mode: IndexMode::AppIndexed,
            app_capacity: None,
        }
    }

    /// Stop after `samples` samples.
    pub fn with_auto_stop(mut self, samples: u32) -> Self {
        self.pre_trigger = 0;
        self.post_trigger = samples;
        self.auto_stop = true;
        self
    }

    /// Keep `pre` samples before the trigger and `post` after it, then stop.
    pub fn with_trigger_window(mut self, pre: u32, post: u32) -> Self {
        self.pre_trigger = pre;
        self.post_trigger = post;
        self.auto_stop = true;
        self
    }

    /// Stream until stopped, writing into the driver-sized ring.
    pub fn continuous(mut self) -> Self {
        self.auto_stop = false;
        self.index_mode = IndexMode::DriverIndexed;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: u32) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_index_mode(mut self, mode: IndexMode) -> Self {
        self.index_mode = mode;
        self
    }

    pub fn with_app_capacity(mut self, capacity: usize) -> Self {
        self.app_capacity = Some(capacity);
        self
    }

    pub fn with_downsampling(mut self, ratio: u32, mode: RatioMode) -> Self {
        self.downsample_ratio = ratio.max(1);
        self.ratio_mode = mode;
        self
    }
}

/// What the driver agreed to when a block capture was armed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockArmed {
    pub timebase: u32,
    pub sample_interval_ns: f64,
    pub time_indisposed_ms: u32,
}

/// What the driver agreed to when streaming started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingStarted {
    pub requested_interval: u32,
    pub sample_interval: u32,
    pub time_units: TimeUnits,
}

impl StreamingStarted {
    pub fn interval_adjusted(&self) -> bool {
        self.sample_interval != self.requested_interval
    }
}

/// Completion flag handed to the driver by `runBlock`.
#[derive(Debug, Default)]
pub struct BlockReadyFlag {
    ready: AtomicBool,
}

impl BlockReadyFlag {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl BlockReadyCallback for BlockReadyFlag {
    fn on_block_ready(&self, _handle: Handle, status: DriverResult<()>) {
        if status != Err(DriverError::Cancelled) {
            self.ready.store(true, Ordering::Release);
        }
    }
}

/// Samples of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCapture {
    pub channel: Channel,
    pub range: Range,
    pub max: Vec<i16>,
    /// Minimum per interval when aggregating.
    pub min: Option<Vec<i16>>,
}

/// Result of `getValues`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCapture {
    pub sample_interval_ns: f64,
    pub max_adc: i16,
    pub overflow: u16,
    pub channels: Vec<ChannelCapture>,
}

impl BlockCapture {
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, |c| c.max.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelCapture> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    pub fn is_aggregated(&self) -> bool {
        self.channels.iter().any(|c| c.min.is_some())
    }
}

/// One segment of a rapid-block capture.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCapture {
    pub segment: u32,
    /// Trigger position within the segment, if the segment triggered.
    pub trigger_index: Option<u32>,
    pub capture: BlockCapture,
}

impl Device {
    /// Current state. A finished block or a streaming capture whose pipeline has raised
    /// auto-stop or buffer-full reads as `Stopped`.
    pub fn state(&self) -> DeviceState {
        match self.state {
            DeviceState::Armed if self.block_ready.as_ref().is_some_and(|f| f.is_ready()) => {
                DeviceState::Stopped
            }
            DeviceState::Streaming
                if self
                    .pipeline
                    .as_ref()
                    .is_some_and(|p| p.is_auto_stopped() || p.is_app_buffer_full()) =>
            {
                DeviceState::Stopped
            }
            state => state,
        }
    }

    pub fn acquisition(&self) -> Option<&AcquisitionSettings> {
        self.settings.as_ref()
    }

    pub fn trigger(&self) -> &TriggerSpec {
        &self.trigger
    }

    /// The pipeline of the current or last streaming capture.
    pub fn pipeline(&self) -> Option<&Arc<StreamingPipeline>> {
        self.pipeline.as_ref()
    }

    /// Fails with `Busy` while a capture is armed or streaming. A capture that finished on its
    /// own is stopped first so the device can be reconfigured or re-armed.
    pub(crate) fn ensure_idle(&mut self) -> Result<(), AcquisitionError> {
        self.state = self.state();
        match self.state {
            DeviceState::Armed | DeviceState::Streaming => Err(AcquisitionError::Busy(self.state)),
            DeviceState::Closed => Err(AcquisitionError::InvalidState(DeviceState::Closed)),
            DeviceState::Stopped if self.running => self.stop(),
            _ => Ok(()),
        }
    }

    fn ensure_channels(&self) -> Result<Vec<Channel>, AcquisitionError> {
        let enabled = self.channels.enabled();
        if enabled.is_empty() {
            return Err(AcquisitionError::NoChannelsEnabled);
        }
        Ok(enabled)
    }

    /// Applies `trigger` to the driver. The source channels must be enabled.
    pub fn set_trigger(&mut self, trigger: impl Into<TriggerSpec>) -> Result<(), AcquisitionError> {
        self.ensure_idle()?;
        let trigger = trigger.into();
        trigger.validate(&self.channels)?;
        let driver = self.driver.as_ref();
        let handle = self.handle;
        match &trigger {
            TriggerSpec::None => {
                log::debug!("setSimpleTrigger(disabled)");
                driver
                    .set_simple_trigger(handle, None)
                    .map_err(AcquisitionError::driver("setSimpleTrigger"))?;
            }
            TriggerSpec::Simple(simple) => {
                let range = self
                    .channels
                    .get(simple.source)
                    .map_or(Range::R5V, |s| s.range);
                let adc = simple.to_adc(range, self.max_adc)?;
                self.send_simple_trigger(simple.threshold_mv, &adc)?;
            }
            TriggerSpec::Advanced(advanced) => {
                log::debug!(
                    "advanced trigger: {} properties, {} conditions, pwq {}",
                    advanced.properties.len(),
                    advanced.conditions.len(),
                    advanced.pulse_width.is_some()
                );
                driver
                    .set_trigger_channel_properties(
                        handle,
                        &advanced.properties,
                        advanced.auto_trigger_ms,
                    )
                    .map_err(AcquisitionError::driver("setTriggerChannelProperties"))?;
                driver
                    .set_trigger_channel_conditions(handle, &advanced.conditions)
                    .map_err(AcquisitionError::driver("setTriggerChannelConditions"))?;
                driver
                    .set_trigger_channel_directions(handle, &advanced.directions)
                    .map_err(AcquisitionError::driver("setTriggerChannelDirections"))?;
                driver
                    .set_pulse_width_qualifier(handle, advanced.pulse_width.as_ref())
                    .map_err(AcquisitionError::driver("setPulseWidthQualifier"))?;
                driver
                    .set_trigger_delay(handle, advanced.delay)
                    .map_err(AcquisitionError::driver("setTriggerDelay"))?;
            }
        }
        self.trigger = trigger;
        Ok(())
    }

    pub(crate) fn send_simple_trigger(
        &self,
        threshold_mv: i32,
        adc: &SimpleTriggerAdc,
    ) -> Result<(), AcquisitionError> {
        log::debug!(
            "setSimpleTrigger({}, {threshold_mv} mV = {} counts, {:?}, delay {}, auto {} ms)",
            adc.source,
            adc.threshold,
            adc.direction,
            adc.delay,
            adc.auto_trigger_ms
        );
        self.driver
            .set_simple_trigger(self.handle, Some(adc))
            .map_err(AcquisitionError::driver("setSimpleTrigger"))
    }

    /// Smallest timebase at or above `preferred` that the driver accepts for `samples`
    /// samples with the current channel set.
    pub fn select_timebase(
        &self,
        preferred: u32,
        samples: u32,
    ) -> Result<(u32, TimebaseInfo), AcquisitionError> {
        self.select_timebase_in_segment(preferred, samples, 0)
    }

    fn select_timebase_in_segment(
        &self,
        preferred: u32,
        samples: u32,
        segment: u32,
    ) -> Result<(u32, TimebaseInfo), AcquisitionError> {
        let limit = self.caps.max_timebase;
        let mut timebase = preferred;
        while timebase <= limit {
            match self
                .driver
                .get_timebase(self.handle, timebase, samples, segment)
            {
                Ok(info) => {
                    log::debug!(
                        "timebase {timebase}: {} ns, {} samples max",
                        info.sample_interval_ns,
                        info.max_samples
                    );
                    return Ok((timebase, info));
                }
                Err(source @ (DriverError::InvalidChannel | DriverError::TooManyChannelsInUse)) => {
                    return Err(AcquisitionError::Driver {
                        operation: "getTimebase",
                        source,
                    });
                }
                Err(error) => {
                    log::trace!("timebase {timebase} rejected: {error}");
                    match timebase.checked_add(1) {
                        Some(next) => timebase = next,
                        None => break,
                    }
                }
            }
        }
        Err(AcquisitionError::TimebaseInvalid {
            from: preferred,
            to: limit,
        })
    }

    fn arm_block(
        &mut self,
        block: &BlockConfig,
        timebase: u32,
        segment: u32,
    ) -> Result<u32, AcquisitionError> {
        let ready = Arc::new(BlockReadyFlag::default());
        log::debug!(
            "runBlock(pre={}, post={}, timebase={timebase}, segment={segment})",
            block.pre_trigger,
            block.post_trigger
        );
        let indisposed = self
            .driver
            .run_block(
                self.handle,
                block.pre_trigger,
                block.post_trigger,
                timebase,
                segment,
                Arc::clone(&ready) as Arc<dyn BlockReadyCallback>,
            )
            .map_err(AcquisitionError::driver("runBlock"))?;
        self.block_ready = Some(ready);
        self.pipeline = None;
        self.buffers.pin();
        self.running = true;
        self.state = DeviceState::Armed;
        Ok(indisposed)
    }

    /// Arms a single block capture. Completion is signalled through [`Device::is_ready`].
    pub fn run_block(&mut self, config: &BlockConfig) -> Result<BlockArmed, AcquisitionError> {
        self.ensure_idle()?;
        let enabled = self.ensure_channels()?;
        self.trigger.validate(&self.channels)?;
        let total = sample_total(config.pre_trigger, config.post_trigger)?;
        let (timebase, info) = self.select_timebase(config.timebase, total)?;
        if total > info.max_samples {
            return Err(AcquisitionError::TooManySamples {
                requested: u64::from(total),
                available: u64::from(info.max_samples),
            });
        }

        let capacity = total.div_ceil(config.downsample_ratio.max(1)) as usize;
        for channel in enabled {
            self.buffers
                .allocate(channel, capacity, config.ratio_mode.needs_min_buffer())?;
            self.buffers.register(
                self.driver.as_ref(),
                self.handle,
                channel,
                0,
                config.ratio_mode,
            )?;
        }

        let time_indisposed_ms = self.arm_block(config, timebase, 0)?;
        self.settings = Some(AcquisitionSettings {
            mode: CaptureMode::Block,
            pre_trigger: config.pre_trigger,
            post_trigger: config.post_trigger,
            downsample_ratio: config.downsample_ratio.max(1),
            ratio_mode: config.ratio_mode,
            auto_stop: true,
            timebase: Some(timebase),
            sample_interval_ns: info.sample_interval_ns,
            segments: 1,
        });
        Ok(BlockArmed {
            timebase,
            sample_interval_ns: info.sample_interval_ns,
            time_indisposed_ms,
        })
    }

    /// Equivalent-time sampling is exposed as a mode only.
    pub fn run_ets(&mut self, _config: &BlockConfig) -> Result<BlockArmed, AcquisitionError> {
        self.ensure_idle()?;
        if self.caps.has_ets {
            Err(AcquisitionError::Unsupported("ETS reconstruction".to_string()))
        } else {
            Err(AcquisitionError::Unsupported(format!(
                "ETS on the {}",
                self.caps.variant
            )))
        }
    }

    /// Partitions memory into `captures` segments and arms one block per segment.
    #[tracing::instrument(skip(self), fields(handle = self.handle))]
    pub fn run_rapid_block(
        &mut self,
        config: &RapidBlockConfig,
    ) -> Result<BlockArmed, AcquisitionError> {
        self.ensure_idle()?;
        let enabled = self.ensure_channels()?;
        self.trigger.validate(&self.channels)?;
        let captures = config.captures;
        let block = &config.block;

        log::debug!("memorySegments({captures})");
        let per_segment = self
            .driver
            .memory_segments(self.handle, captures)
            .map_err(AcquisitionError::driver("memorySegments"))?;
        log::debug!("setNoOfCaptures({captures})");
        self.driver
            .set_no_of_captures(self.handle, captures)
            .map_err(AcquisitionError::driver("setNoOfCaptures"))?;

        let total = sample_total(block.pre_trigger, block.post_trigger)?;
        let (timebase, info) = self.select_timebase(block.timebase, total)?;
        let available = info
            .max_samples
            .min(per_segment / enabled.len() as u32);
        if total > available {
            return Err(AcquisitionError::TooManySamples {
                requested: u64::from(total),
                available: u64::from(available),
            });
        }

        let capacity = total.div_ceil(block.downsample_ratio.max(1)) as usize;
        for segment in 0..captures {
            for channel in &enabled {
                self.buffers.allocate_segment(
                    *channel,
                    segment,
                    capacity,
                    block.ratio_mode.needs_min_buffer(),
                )?;
                self.buffers.register(
                    self.driver.as_ref(),
                    self.handle,
                    *channel,
                    segment,
                    block.ratio_mode,
                )?;
            }
        }

        let time_indisposed_ms = self.arm_block(block, timebase, 0)?;
        self.settings = Some(AcquisitionSettings {
            mode: CaptureMode::RapidBlock,
            pre_trigger: block.pre_trigger,
            post_trigger: block.post_trigger,
            downsample_ratio: block.downsample_ratio.max(1),
            ratio_mode: block.ratio_mode,
            auto_stop: true,
            timebase: Some(timebase),
            sample_interval_ns: info.sample_interval_ns,
            segments: captures,
        });
        Ok(BlockArmed {
            timebase,
            sample_interval_ns: info.sample_interval_ns,
            time_indisposed_ms,
        })
    }

    /// Whether the armed block capture has completed. A cancelled capture never reads ready.
    pub fn is_ready(&self) -> bool {
        self.block_ready.as_ref().is_some_and(|f| f.is_ready())
    }

    /// Blocks until the armed capture completes, polling every `poll` and stopping the device
    /// when `abort` fires.
    pub fn wait_ready(
        &mut self,
        poll: Duration,
        abort: &dyn AbortSignal,
    ) -> Result<(), AcquisitionError> {
        if self.block_ready.is_none() || self.state == DeviceState::Closed {
            return Err(AcquisitionError::InvalidState(self.state()));
        }
        loop {
            if self.is_ready() {
                self.state = DeviceState::Stopped;
                return Ok(());
            }
            if abort.should_abort() {
                log::info!("block capture on {} aborted", self.handle);
                self.stop()?;
                return Err(AcquisitionError::Aborted);
            }
            thread::sleep(poll);
        }
    }

    fn completed_block(&self, mode: CaptureMode) -> Result<AcquisitionSettings, AcquisitionError> {
        match self.settings {
            Some(settings) if settings.mode == mode && self.is_ready() => Ok(settings),
            _ => Err(AcquisitionError::InvalidState(self.state())),
        }
    }

    fn collect_segment(
        &self,
        segment: u32,
        samples: usize,
        settings: &AcquisitionSettings,
        overflow: u16,
    ) -> Result<BlockCapture, AcquisitionError> {
        let channels = self
            .channels
            .enabled()
            .into_iter()
            .map(|channel| {
                let pair = self
                    .buffers
                    .get(channel, segment)
                    .ok_or(BufferError::NotAllocated { channel, segment })?;
                Ok(ChannelCapture {
                    channel,
                    range: self.channels.get(channel).map_or(Range::R5V, |s| s.range),
                    max: pair.driver_max.read(0, samples),
                    min: pair.driver_min.as_ref().map(|min| min.read(0, samples)),
                })
            })
            .collect::<Result<Vec<_>, BufferError>>()?;
        Ok(BlockCapture {
            sample_interval_ns: settings.sample_interval_ns * f64::from(settings.downsample_ratio),
            max_adc: self.max_adc,
            overflow,
            channels,
        })
    }

    /// Retrieves a completed block capture.
    pub fn get_values(&mut self) -> Result<BlockCapture, AcquisitionError> {
        let settings = self.completed_block(CaptureMode::Block)?;
        let (samples, overflow) = self
            .driver
            .get_values(
                self.handle,
                0,
                settings.total_samples(),
                settings.downsample_ratio,
                settings.ratio_mode,
                0,
            )
            .map_err(AcquisitionError::driver("getValues"))?;
        log::debug!("getValues: {samples} samples, overflow {overflow:#06b}");
        self.state = DeviceState::Stopped;
        self.collect_segment(0, samples as usize, &settings, overflow)
    }

    /// Retrieves every segment of a completed rapid-block capture.
    pub fn get_values_bulk(&mut self) -> Result<Vec<SegmentCapture>, AcquisitionError> {
        let settings = self.completed_block(CaptureMode::RapidBlock)?;
        let last = settings.segments.saturating_sub(1);
        let (samples, overflows) = self
            .driver
            .get_values_bulk(
                self.handle,
                settings.total_samples(),
                0,
                last,
                settings.downsample_ratio,
                settings.ratio_mode,
            )
            .map_err(AcquisitionError::driver("getValuesBulk"))?;
        let triggers = self
            .driver
            .get_trigger_info_bulk(self.handle, 0, last)
            .map_err(AcquisitionError::driver("getTriggerInfoBulk"))?;
        log::debug!(
            "getValuesBulk: {} segments x {samples} samples",
            settings.segments
        );
        self.state = DeviceState::Stopped;

        (0..settings.segments)
            .map(|segment| {
                let overflow = overflows.get(segment as usize).copied().unwrap_or(0);
                let trigger_index = triggers
                    .iter()
                    .find(|info| info.segment == segment)
                    .filter(|info| info.triggered)
                    .map(|info| info.trigger_index);
                Ok(SegmentCapture {
                    segment,
                    trigger_index,
                    capture: self.collect_segment(segment, samples as usize, &settings, overflow)?,
                })
            })
            .collect()
    }

    /// Number of segments captured by the last rapid-block run.
    pub fn captures_completed(&self) -> Result<u32, AcquisitionError> {
        self.driver
            .get_no_of_captures(self.handle)
            .map_err(AcquisitionError::driver("getNoOfCaptures"))
    }

    /// Allocates and registers streaming buffers, then starts streaming. The driver may raise
    /// the sample interval; the returned value is the one in effect.
    #[tracing::instrument(skip(self), fields(handle = self.handle))]
    pub fn run_streaming(
        &mut self,
        config: &StreamingConfig,
    ) -> Result<StreamingStarted, AcquisitionError> {
        self.ensure_idle()?;
        let enabled = self.ensure_channels()?;
        self.trigger.validate(&self.channels)?;
        let with_min = config.ratio_mode.needs_min_buffer();
        let driver_capacity = config.buffer_capacity as usize;
        let total = sample_total(config.pre_trigger, config.post_trigger)?;
        let app_capacity = config
            .app_capacity
            .unwrap_or_else(|| total.div_ceil(config.downsample_ratio.max(1)) as usize);

        let mut pairs = Vec::with_capacity(enabled.len());
        for channel in enabled {
            let pair = match config.index_mode {
                IndexMode::DriverIndexed => {
                    self.buffers.allocate(channel, driver_capacity, with_min)?
                }
                IndexMode::AppIndexed => {
                    self.buffers
                        .allocate_linear(channel, driver_capacity, app_capacity, with_min)?
                }
            };
            self.buffers.register(
                self.driver.as_ref(),
                self.handle,
                channel,
                0,
                config.ratio_mode,
            )?;
            pairs.push(pair);
        }
        let pipeline = Arc::new(StreamingPipeline::new(config.index_mode, pairs));

        let mut request = StreamingRequest {
            sample_interval: config.sample_interval,
            time_units: config.time_units,
            pre_trigger: config.pre_trigger,
            post_trigger: config.post_trigger,
            auto_stop: config.auto_stop,
            downsample_ratio: config.downsample_ratio.max(1),
            ratio_mode: config.ratio_mode,
            buffer_capacity: config.buffer_capacity,
        };
        log::debug!("runStreaming({request:?}, {:?})", config.index_mode);
        self.driver
            .run_streaming(self.handle, &mut request)
            .map_err(AcquisitionError::driver("runStreaming"))?;

        let started = StreamingStarted {
            requested_interval: config.sample_interval,
            sample_interval: request.sample_interval,
            time_units: config.time_units,
        };
        if started.interval_adjusted() {
            log::warn!(
                "sample interval adjusted from {} to {} {:?}",
                started.requested_interval,
                started.sample_interval,
                started.time_units
            );
        }

        self.pipeline = Some(pipeline);
        self.block_ready = None;
        self.buffers.pin();
        self.running = true;
        self.state = DeviceState::Streaming;
        self.settings = Some(AcquisitionSettings {
            mode: match config.index_mode {
                IndexMode::DriverIndexed => CaptureMode::Window,
                IndexMode::AppIndexed => CaptureMode::Stream,
            },
            pre_trigger: config.pre_trigger,
            post_trigger: config.post_trigger,
            downsample_ratio: config.downsample_ratio.max(1),
            ratio_mode: config.ratio_mode,
            auto_stop: config.auto_stop,
            timebase: None,
            sample_interval_ns: f64::from(request.sample_interval) * config.time_units.as_nanos(),
            segments: 1,
        });
        Ok(started)
    }

    /// Asks the driver for new streaming data. Returns `false` when nothing was ready; the
    /// pipeline callback has run when this returns `true`.
    pub fn poll_latest_values(&mut self) -> Result<bool, AcquisitionError> {
        let pipeline = match (&self.pipeline, self.running) {
            (Some(pipeline), true) => Arc::clone(pipeline),
            _ => return Err(AcquisitionError::InvalidState(self.state())),
        };
        match self
            .driver
            .get_streaming_latest_values(self.handle, pipeline as Arc<dyn StreamingCallback>)
        {
            Ok(()) => Ok(true),
            Err(DriverError::NoSamplesReady) => Ok(false),
            Err(source) => Err(AcquisitionError::Driver {
                operation: "getStreamingLatestValues",
                source,
            }),
        }
    }

    /// Stops any capture. No streaming callback fires after this returns, and a pending block
    /// completion is delivered as cancelled.
    pub fn stop(&mut self) -> Result<(), AcquisitionError> {
        log::debug!("stop({})", self.handle);
        self.driver
            .stop(self.handle)
            .map_err(AcquisitionError::driver("stop"))?;
        self.running = false;
        self.buffers.unpin();
        if matches!(
            self.state,
            DeviceState::Armed | DeviceState::Streaming | DeviceState::Stopped
        ) {
            self.state = DeviceState::Stopped;
        }
        Ok(())
    }

    /// Unregisters every buffer from the driver and frees it. Fails while a capture runs.
    pub fn release_buffers(&mut self) -> Result<(), AcquisitionError> {
        if self.running {
            return Err(AcquisitionError::Busy(self.state()));
        }
        self.buffers
            .clear_all(self.driver.as_ref(), self.handle)
            .map_err(AcquisitionError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelSetting;
    use crate::drain::{AbortFlag, NeverAbort};
    use crate::registry::DeviceRegistry;
    use crate::simulator::{Pacing, Signal, SimulatedDriver, SimulatorConfig};
    use crate::trigger_config::SimpleTrigger;

    fn device(config: SimulatorConfig) -> Device {
        DeviceRegistry::new(Arc::new(SimulatedDriver::new(config)))
            .open(None)
            .unwrap()
    }

    #[test]
    fn test_timebase_probe_skips_invalid() {
        let mut device = device(SimulatorConfig::new("3406D"));
        for channel in [Channel::A, Channel::B, Channel::C] {
            device
                .set_channel(channel, ChannelSetting::enabled(Range::R1V))
                .unwrap();
        }
        let (timebase, info) = device.select_timebase(0, 1_000).unwrap();
        assert_eq!(timebase, 2);
        assert!((info.sample_interval_ns - 4.0).abs() < f64::EPSILON);
        assert_eq!(device.select_timebase(7, 1_000).unwrap().0, 7);
    }

    #[test]
    fn test_timebase_probe_stops_on_channel_errors() {
        use crate::driver::ScopeDriver;

        let driver = Arc::new(SimulatedDriver::new(SimulatorConfig::new("3406D").on_usb_power()));
        let mut device = DeviceRegistry::new(driver.clone()).open(None).unwrap();
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R1V))
            .unwrap();
        // enabled behind the store, over the two-channel USB quota
        for channel in [Channel::B, Channel::C] {
            driver
                .set_channel(device.handle(), channel, &ChannelSetting::enabled(Range::R1V))
                .unwrap();
        }
        assert_eq!(
            device.select_timebase(0, 100),
            Err(AcquisitionError::Driver {
                operation: "getTimebase",
                source: DriverError::TooManyChannelsInUse,
            })
        );
    }

    #[test]
    fn test_block_transitions_and_busy() {
        let mut device = device(SimulatorConfig::new("2204A"));
        assert!(matches!(
            device.run_block(&BlockConfig::new(100)),
            Err(AcquisitionError::NoChannelsEnabled)
        ));
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R1V))
            .unwrap();
        let armed = device.run_block(&BlockConfig::new(100).with_timebase(7)).unwrap();
        assert_eq!(armed.timebase, 7);

        device.wait_ready(Duration::from_millis(1), &NeverAbort).unwrap();
        assert_eq!(device.state(), DeviceState::Stopped);
        let capture = device.get_values().unwrap();
        assert_eq!(capture.len(), 100);
        assert_eq!(capture.overflow, 0);

        // rearm from stopped
        device.run_block(&BlockConfig::new(50)).unwrap();
        device.wait_ready(Duration::from_millis(1), &NeverAbort).unwrap();
        assert_eq!(device.get_values().unwrap().len(), 50);
    }

    #[test]
    fn test_setting_channel_while_armed_is_busy() {
        let mut device = device(SimulatorConfig::new("2204A").with_pacing(Pacing::RealTime));
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R1V))
            .unwrap();
        device
            .run_block(&BlockConfig::new(8_000).with_timebase(1_000_000))
            .unwrap();
        assert_eq!(device.state(), DeviceState::Armed);
        assert_eq!(
            device.set_channel(Channel::B, ChannelSetting::enabled(Range::R1V)),
            Err(AcquisitionError::Busy(DeviceState::Armed))
        );

        let abort = AbortFlag::new();
        abort.raise();
        assert_eq!(
            device.wait_ready(Duration::from_millis(1), &abort),
            Err(AcquisitionError::Aborted)
        );
        // cancelled completion never sets the ready flag
        assert!(!device.is_ready());
        assert_eq!(device.state(), DeviceState::Stopped);
        assert!(device
            .set_channel(Channel::B, ChannelSetting::enabled(Range::R1V))
            .is_ok());
    }

    #[test]
    fn test_block_ready_flag_ignores_cancelled() {
        let flag = BlockReadyFlag::default();
        flag.on_block_ready(1, Err(DriverError::Cancelled));
        assert!(!flag.is_ready());
        flag.on_block_ready(1, Ok(()));
        assert!(flag.is_ready());
    }

    #[test]
    fn test_aggregated_block() {
        let mut device = device(SimulatorConfig::new("2204A").with_signal(
            Channel::A,
            Signal::Ramp {
                low_mv: -500,
                high_mv: 500,
                period_samples: 10,
            },
        ));
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R1V))
            .unwrap();
        device
            .run_block(&BlockConfig::new(100).with_downsampling(10, RatioMode::Aggregate))
            .unwrap();
        device.wait_ready(Duration::from_millis(1), &NeverAbort).unwrap();
        let capture = device.get_values().unwrap();
        assert_eq!(capture.len(), 10);
        assert!(capture.is_aggregated());
        let a = capture.channel(Channel::A).unwrap();
        assert!(a.max.iter().all(|v| *v > 0));
        assert!(a.min.as_ref().unwrap().iter().all(|v| *v < 0));
    }

    #[test]
    fn test_trigger_source_must_be_enabled() {
        let mut device = device(SimulatorConfig::new("2204A"));
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R2V))
            .unwrap();
        assert_eq!(
            device.set_trigger(SimpleTrigger::start_capturing_when(Channel::B).rising_edge(500)),
            Err(AcquisitionError::Trigger(TriggerError::SourceDisabled(Channel::B)))
        );
        device
            .set_trigger(SimpleTrigger::start_capturing_when(Channel::A).rising_edge(500))
            .unwrap();
        assert!(matches!(device.trigger(), TriggerSpec::Simple(_)));
    }

    #[test]
    fn test_disabled_trigger_source_blocks_arming() {
        let mut device = device(SimulatorConfig::new("2204A"));
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R2V))
            .unwrap();
        device
            .set_trigger(SimpleTrigger::start_capturing_when(Channel::A).rising_edge(500))
            .unwrap();
        device
            .set_channel(Channel::B, ChannelSetting::enabled(Range::R2V))
            .unwrap();
        device
            .set_channel(Channel::A, ChannelSetting::disabled())
            .unwrap();

        let disabled = Err(AcquisitionError::Trigger(TriggerError::SourceDisabled(Channel::A)));
        assert_eq!(
            device
                .run_streaming(&StreamingConfig::new(1, TimeUnits::Us).with_auto_stop(100))
                .map(|_| ()),
            disabled
        );
        assert_eq!(device.run_block(&BlockConfig::new(100)).map(|_| ()), disabled);
        assert_eq!(
            device
                .run_rapid_block(&RapidBlockConfig::new(2, 100))
                .map(|_| ()),
            disabled
        );
        assert_eq!(device.state(), DeviceState::ChannelsSet);

        device.set_trigger(TriggerSpec::None).unwrap();
        device.run_block(&BlockConfig::new(100)).unwrap();
    }

    #[test]
    fn test_trigger_follows_source_range() {
        let mut device = device(SimulatorConfig::new("2204A").with_signal(
            Channel::A,
            Signal::Step {
                low_mv: 0,
                high_mv: 1_500,
                at_sample: 20_000,
            },
        ));
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R2V))
            .unwrap();
        device
            .set_trigger(SimpleTrigger::start_capturing_when(Channel::A).rising_edge(1_000))
            .unwrap();
        // counts converted for ±2V would read as 2.5V on ±5V and never fire
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R5V))
            .unwrap();
        assert!(matches!(
            device.set_channel(Channel::A, ChannelSetting::enabled(Range::R500mV)),
            Err(AcquisitionError::Trigger(TriggerError::ThresholdOutOfRange { .. }))
        ));
        assert_eq!(device.channels().get(Channel::A).unwrap().range, Range::R5V);

        device
            .run_streaming(
                &StreamingConfig::new(1, TimeUnits::Us)
                    .with_trigger_window(1_000, 9_000)
                    .with_buffer_capacity(4_096),
            )
            .unwrap();
        while !device.pipeline().unwrap().is_auto_stopped() {
            device.poll_latest_values().unwrap();
        }
        assert_eq!(device.pipeline().unwrap().triggered_at(), Some(1_000));
        device.stop().unwrap();
    }

    #[test]
    fn test_sample_total_overflow_is_rejected() {
        let mut device = device(SimulatorConfig::new("2204A"));
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R2V))
            .unwrap();
        let overflow = Err(AcquisitionError::TooManySamples {
            requested: u64::from(u32::MAX) + 10,
            available: u64::from(u32::MAX),
        });
        let block = BlockConfig {
            pre_trigger: u32::MAX,
            post_trigger: 10,
            ..BlockConfig::new(0)
        };
        assert_eq!(device.run_block(&block).map(|_| ()), overflow);
        let stream = StreamingConfig {
            pre_trigger: u32::MAX,
            post_trigger: 10,
            ..StreamingConfig::new(1, TimeUnits::Us)
        };
        assert_eq!(device.run_streaming(&stream).map(|_| ()), overflow);
        assert_eq!(device.state(), DeviceState::ChannelsSet);
    }

    #[test]
    fn test_ets_is_unsupported() {
        let mut device = device(SimulatorConfig::new("2204A"));
        assert!(matches!(
            device.run_ets(&BlockConfig::new(10)),
            Err(AcquisitionError::Unsupported(_))
        ));
    }

    #[test]
    fn test_streaming_interval_is_reflected() {
        let mut device = device(
            SimulatorConfig::new("2204A").with_min_streaming_interval_ns(2_000.0),
        );
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R1V))
            .unwrap();
        let started = device
            .run_streaming(&StreamingConfig::new(1, TimeUnits::Us).with_auto_stop(1_000))
            .unwrap();
        assert!(started.interval_adjusted());
        assert_eq!(started.sample_interval, 2);
        assert_eq!(device.state(), DeviceState::Streaming);
        assert!(device.buffers().is_pinned());

        while !device.pipeline().unwrap().is_auto_stopped() {
            device.poll_latest_values().unwrap();
        }
        assert_eq!(device.state(), DeviceState::Stopped);
        assert_eq!(device.pipeline().unwrap().total_samples(), 1_000);
        device.stop().unwrap();
        assert!(!device.buffers().is_pinned());
        assert!(matches!(
            device.poll_latest_values(),
            Err(AcquisitionError::InvalidState(_))
        ));
        device.release_buffers().unwrap();
        assert!(device.buffers().get(Channel::A, 0).is_none());
    }
}
