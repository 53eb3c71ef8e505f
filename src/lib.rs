//! # usbscope RS
//!
//! Streaming acquisition for USB oscilloscopes driven through a vendor driver library.
//!
//! The crate sits between the application and the driver. It opens units, validates channel
//! and trigger settings against a per-model capability table, owns the driver and application
//! sample buffers, arms block, rapid-block and streaming captures, and drains streamed samples
//! into a delimited record sink.
//!
//! ## Features
//!
//! - **Driver boundary**: everything needed from the vendor library is the [`ScopeDriver`] trait
//! - **Capability table**: channel counts, ranges, resolutions and quotas per model variant
//! - **Lock-free streaming**: the driver callback copies into application buffers without locks
//! - **Pluggable abort**: stop a drain on Enter, a deadline or a shared flag
//! - **DataFrame output**: block captures convert to `polars` frames
//! - **Simulator**: [`SimulatedDriver`] implements the driver trait with synthetic signals
//!
//! ## Examples
//!
//! ### Block capture
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use usbscope::{
//!     BlockConfig, Channel, ChannelSetting, DeviceRegistry, NeverAbort, Range,
//!     SimulatedDriver, SimulatorConfig,
//! };
//!
//! let registry = DeviceRegistry::new(Arc::new(SimulatedDriver::new(SimulatorConfig::new("2204A"))));
//! let mut device = registry.open(None)?;
//! device.set_channel(Channel::A, ChannelSetting::enabled(Range::R2V))?;
//!
//! device.run_block(&BlockConfig::new(1_000).with_timebase(7))?;
//! device.wait_ready(Duration::from_millis(1), &NeverAbort)?;
//! let capture = device.get_values()?;
//! println!("captured {} samples", capture.len());
//! device.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Streaming to a file
//!
//! ```rust,no_run
//! use std::fs::File;
//! use std::io::BufWriter;
//! use std::sync::Arc;
//! use usbscope::{
//!     Channel, ChannelSetting, DeviceRegistry, Drain, KeyPress, Range, RecordFormat,
//!     RecordSink, Scaling, SimulatedDriver, SimulatorConfig, StreamingConfig, TimeUnits,
//! };
//!
//! let registry = DeviceRegistry::new(Arc::new(SimulatedDriver::new(SimulatorConfig::new("2204A"))));
//! let mut device = registry.open(None)?;
//! device.set_channel(Channel::A, ChannelSetting::enabled(Range::R1V))?;
//! device.set_channel(Channel::B, ChannelSetting::enabled(Range::R1V))?;
//!
//! let started = device.run_streaming(&StreamingConfig::new(1, TimeUnits::Us).with_auto_stop(100_000))?;
//! println!("sampling every {} {:?}", started.sample_interval, started.time_units);
//!
//! let file = BufWriter::new(File::create("stream.csv")?);
//! let mut sink = RecordSink::for_device(file, RecordFormat::Csv, Scaling::Millivolts, &device);
//! let abort = KeyPress::spawn()?;
//! let report = Drain::new(&mut device).with_sink(&mut sink).with_abort(&abort).run()?;
//! println!("{:?}: {} samples", report.exit, report.stats.total_samples);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Triggers
//!
//! ```rust
//! use usbscope::{Channel, Range, SimpleTrigger};
//!
//! let trigger = SimpleTrigger::start_capturing_when(Channel::A)
//!     .rising_edge(1_000)
//!     .auto(100);
//! let adc = trigger.to_adc(Range::R2V, 32_512).unwrap();
//! assert_eq!(adc.threshold, 16_256);
//! ```

pub mod acquisition;
pub mod buffers;
pub mod capabilities;
pub mod channels;
pub mod drain;
pub mod driver;
pub mod registry;
pub mod simulator;
pub mod sink;
pub mod streaming;
pub mod trigger_config;
pub mod units;

// Re-export the main types for convenience
pub use acquisition::{
    AcquisitionError, BlockCapture, BlockConfig, CaptureMode, DeviceState, RapidBlockConfig,
    SegmentCapture, StreamingConfig, StreamingStarted,
};
pub use capabilities::{capabilities_for, ModelCapabilities, Range};
pub use channels::{ChannelError, ChannelSetting, Coupling};
pub use drain::{AbortFlag, AbortSignal, AfterDelay, Drain, DrainError, DrainExit, KeyPress, NeverAbort};
pub use driver::{Channel, DriverError, PowerSource, RatioMode, Resolution, ScopeDriver, TimeUnits};
pub use registry::{Device, DeviceRegistry, OpenError, UnitInfo};
pub use simulator::{Pacing, Signal, SimulatedDriver, SimulatorConfig};
pub use sink::{RecordFormat, RecordSink, SampleSink, Scaling, SinkError};
pub use streaming::{IndexMode, StreamStats, StreamingPipeline};
pub use trigger_config::{AdvancedTrigger, SimpleTrigger, TriggerSpec};
