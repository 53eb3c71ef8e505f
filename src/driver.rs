//! The vendor driver boundary.
//!
//! Everything the acquisition core needs from the oscilloscope driver is expressed by the
//! [`ScopeDriver`] trait. A production build binds it to the vendor library; the crate ships
//! [`crate::simulator::SimulatedDriver`] for tests and demos.
//!
//! The driver calls back into the application from its own threads. Callbacks are delivered
//! through the two callback traits in this module, passed to the driver as shared trait
//! objects in place of the raw `void *` context slot of a C API.

use std::fmt;
use std::sync::Arc;

use crate::buffers::SampleBuffer;
use crate::channels::ChannelSetting;
use crate::trigger_config::{
    PulseWidthQualifier, SimpleTriggerAdc, TriggerChannelProperties, TriggerConditions,
    TriggerDirections,
};

/// Opaque device handle handed out by the driver.
pub type Handle = i16;

pub type DriverResult<T> = Result<T, DriverError>;

/// Status codes the driver can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("device not found")]
    NotFound,

    #[error("device is already open")]
    AlreadyOpen,

    #[error("generic USB failure")]
    UsbGenericFailure,

    #[error("power supply not connected")]
    PowerSupplyNotConnected,

    #[error("USB 3.0 device connected to a USB 2.0 port")]
    Usb3On2Port,

    #[error("power source change must be acknowledged")]
    PowerSourceNeedsAcknowledgement,

    #[error("invalid handle {0}")]
    InvalidHandle(Handle),

    #[error("invalid channel")]
    InvalidChannel,

    #[error("invalid range")]
    InvalidRange,

    #[error("invalid coupling")]
    InvalidCoupling,

    #[error("invalid timebase {0}")]
    InvalidTimebase(u32),

    #[error("too many channels in use for the current resolution")]
    TooManyChannelsInUse,

    #[error("invalid number of samples")]
    InvalidNumberOfSamples,

    #[error("no samples ready")]
    NoSamplesReady,

    #[error("device busy")]
    Busy,

    #[error("cancelled")]
    Cancelled,

    #[error("feature not supported by this device")]
    NotUsed,

    #[error("segment {0} out of range")]
    SegmentOutOfRange(u32),

    #[error("no data buffer registered for {0}")]
    BufferNotSet(Channel),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("device lost")]
    DeviceLost,
}

/// Analogue input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
}

impl Channel {
    pub const ALL: [Self; 8] = [
        Self::A,
        Self::B,
        Self::C,
        Self::D,
        Self::E,
        Self::F,
        Self::G,
        Self::H,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Digital port of a mixed-signal model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigitalPort {
    Port0,
    Port1,
}

impl DigitalPort {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    Bits8,
    Bits10,
    Bits12,
    Bits14,
    Bits15,
    Bits16,
}

impl Resolution {
    pub fn bits(self) -> u8 {
        match self {
            Self::Bits8 => 8,
            Self::Bits10 => 10,
            Self::Bits12 => 12,
            Self::Bits14 => 14,
            Self::Bits15 => 15,
            Self::Bits16 => 16,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerSource {
    UsbOnly,
    MainsConnected,
}

/// Reason an opened unit wants its power source acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerNotice {
    PowerSupplyNotConnected,
    Usb3On2Port,
}

/// Downsampling applied by the driver before samples reach the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RatioMode {
    #[default]
    None,
    /// Min/max per interval; needs two buffers per channel.
    Aggregate,
    Decimate,
    Average,
}

impl RatioMode {
    pub fn needs_min_buffer(self) -> bool {
        self == Self::Aggregate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnits {
    Fs,
    Ps,
    #[default]
    Ns,
    Us,
    Ms,
    S,
}

impl TimeUnits {
    pub fn as_nanos(self) -> f64 {
        match self {
            Self::Fs => 1e-6,
            Self::Ps => 1e-3,
            Self::Ns => 1.0,
            Self::Us => 1e3,
            Self::Ms => 1e6,
            Self::S => 1e9,
        }
    }
}

/// Lines reported by `getUnitInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoLine {
    DriverVersion,
    UsbVersion,
    HardwareVersion,
    VariantInfo,
    BatchAndSerial,
    CalDate,
    KernelVersion,
    Firmware1,
    Firmware2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedUnit {
    pub handle: Handle,
    pub power_notice: Option<PowerNotice>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimebaseInfo {
    pub sample_interval_ns: f64,
    pub max_samples: u32,
}

/// Arguments of `runStreaming`. The driver may raise `sample_interval` when the hardware cannot
/// honour the request; callers read the adjusted value back from the same struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingRequest {
    pub sample_interval: u32,
    pub time_units: TimeUnits,
    /// Raw samples; auto-stop fires after `(pre + post) / downsample_ratio` delivered ones.
    pub pre_trigger: u32,
    pub post_trigger: u32,
    pub auto_stop: bool,
    pub downsample_ratio: u32,
    pub ratio_mode: RatioMode,
    /// Capacity of the registered buffers, in delivered samples.
    pub buffer_capacity: u32,
}

/// Payload of one latest-values callback, shared by every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatestValues {
    pub no_of_samples: u32,
    pub start_index: u32,
    /// Bit `i` set when channel `i` went over range in this window.
    pub overflow: u16,
    /// Trigger position relative to `start_index`; meaningful only when `triggered` is set.
    pub triggered_at: u32,
    pub triggered: bool,
    pub auto_stop: bool,
}

/// Per-segment trigger report of a rapid-block capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerInfo {
    pub segment: u32,
    pub triggered: bool,
    pub trigger_index: u32,
}

/// Buffers handed to the driver by `setDataBuffer(s)`.
#[derive(Debug, Clone)]
pub struct BufferBinding {
    pub max: Arc<SampleBuffer>,
    pub min: Option<Arc<SampleBuffer>>,
    pub segment: u32,
    pub ratio_mode: RatioMode,
}

/// Invoked on a driver thread for every run of freshly streamed samples.
///
/// Implementations must not block: no I/O, no locks that the polling thread may hold.
pub trait StreamingCallback: Send + Sync {
    fn on_latest_values(&self, handle: Handle, values: &LatestValues);
}

/// Invoked on a driver thread when a block capture finishes or is cancelled.
pub trait BlockReadyCallback: Send + Sync {
    fn on_block_ready(&self, handle: Handle, status: DriverResult<()>);
}

/// Driver entry points consumed by the acquisition core.
pub trait ScopeDriver: Send + Sync + 'static {
    fn open_unit(&self, serial: Option<&str>) -> DriverResult<OpenedUnit>;
    fn close_unit(&self, handle: Handle) -> DriverResult<()>;
    fn unit_info(&self, handle: Handle, line: InfoLine) -> DriverResult<String>;
    fn maximum_value(&self, handle: Handle) -> DriverResult<i16>;
    fn set_resolution(&self, handle: Handle, resolution: Resolution) -> DriverResult<()>;
    fn change_power_source(&self, handle: Handle, source: PowerSource) -> DriverResult<()>;
    fn current_power_source(&self, handle: Handle) -> DriverResult<PowerSource>;

    fn set_channel(&self, handle: Handle, channel: Channel, setting: &ChannelSetting)
        -> DriverResult<()>;
    fn set_digital_port(
        &self,
        handle: Handle,
        port: DigitalPort,
        enabled: bool,
        logic_threshold: i16,
    ) -> DriverResult<()>;

    fn get_timebase(
        &self,
        handle: Handle,
        timebase: u32,
        no_of_samples: u32,
        segment: u32,
    ) -> DriverResult<TimebaseInfo>;

    fn set_simple_trigger(&self, handle: Handle, trigger: Option<&SimpleTriggerAdc>)
        -> DriverResult<()>;
    fn set_trigger_channel_properties(
        &self,
        handle: Handle,
        properties: &[TriggerChannelProperties],
        auto_trigger_ms: i16,
    ) -> DriverResult<()>;
    fn set_trigger_channel_conditions(&self, handle: Handle, conditions: &[TriggerConditions])
        -> DriverResult<()>;
    fn set_trigger_channel_directions(&self, handle: Handle, directions: &TriggerDirections)
        -> DriverResult<()>;
    fn set_pulse_width_qualifier(&self, handle: Handle, pwq: Option<&PulseWidthQualifier>)
        -> DriverResult<()>;
    fn set_trigger_delay(&self, handle: Handle, delay: u32) -> DriverResult<()>;

    /// Binds (`Some`) or releases (`None`) the buffers the driver writes for `channel`.
    fn set_data_buffers(
        &self,
        handle: Handle,
        channel: Channel,
        segment: u32,
        binding: Option<BufferBinding>,
    ) -> DriverResult<()>;

    /// Partitions capture memory, returning the per-segment sample capacity.
    fn memory_segments(&self, handle: Handle, segments: u32) -> DriverResult<u32>;
    fn set_no_of_captures(&self, handle: Handle, captures: u32) -> DriverResult<()>;
    fn get_no_of_captures(&self, handle: Handle) -> DriverResult<u32>;

    /// Arms a block capture, returning the expected time indisposed in milliseconds.
    fn run_block(
        &self,
        handle: Handle,
        pre_trigger: u32,
        post_trigger: u32,
        timebase: u32,
        segment: u32,
        ready: Arc<dyn BlockReadyCallback>,
    ) -> DriverResult<u32>;
    fn is_ready(&self, handle: Handle) -> DriverResult<bool>;

    /// Returns the number of samples written and the overflow mask.
    fn get_values(
        &self,
        handle: Handle,
        start: u32,
        no_of_samples: u32,
        downsample_ratio: u32,
        ratio_mode: RatioMode,
        segment: u32,
    ) -> DriverResult<(u32, u16)>;

    /// Returns the samples written per segment and one overflow mask per segment.
    fn get_values_bulk(
        &self,
        handle: Handle,
        no_of_samples: u32,
        from_segment: u32,
        to_segment: u32,
        downsample_ratio: u32,
        ratio_mode: RatioMode,
    ) -> DriverResult<(u32, Vec<u16>)>;
    fn get_trigger_info_bulk(&self, handle: Handle, from_segment: u32, to_segment: u32)
        -> DriverResult<Vec<TriggerInfo>>;

    fn run_streaming(&self, handle: Handle, request: &mut StreamingRequest) -> DriverResult<()>;

    /// Non-blocking. Returns `NoSamplesReady` without invoking `callback` when nothing new
    /// has been captured. Returns after any callback it triggered has completed.
    fn get_streaming_latest_values(
        &self,
        handle: Handle,
        callback: Arc<dyn StreamingCallback>,
    ) -> DriverResult<()>;

    /// Terminates any capture. No callback fires after this returns.
    fn stop(&self, handle: Handle) -> DriverResult<()>;

    fn flash_led(&self, handle: Handle, count: i16) -> DriverResult<()>;
}
