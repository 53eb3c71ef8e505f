//! Consumer drain.
//!
//! [`Drain`] is the pull loop of a streaming capture: it polls the driver for new samples,
//! hands every delivered window to a [`SampleSink`], and decides when to stop. The stop reason
//! is taken in priority order: an [`AbortSignal`], then the pipeline's auto-stop flag, then its
//! buffer-full flag. Whatever the outcome the device is stopped, the sink flushed and the
//! buffers released before [`Drain::run`] returns.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::acquisition::{AcquisitionError, DeviceState};
use crate::registry::Device;
use crate::sink::{SampleSink, SinkError};
use crate::streaming::{StreamStats, StreamingPipeline};

/// Source of a user or caller abort, consulted once per poll cycle.
pub trait AbortSignal {
    fn should_abort(&self) -> bool;
}

/// Never aborts; the capture ends on auto-stop or buffer-full.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverAbort;

impl AbortSignal for NeverAbort {
    fn should_abort(&self) -> bool {
        false
    }
}

/// Abort raised from another thread.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl AbortSignal for AbortFlag {
    fn should_abort(&self) -> bool {
        self.is_raised()
    }
}

/// Aborts once a deadline has passed.
#[derive(Debug, Clone, Copy)]
pub struct AfterDelay {
    deadline: Instant,
}

impl AfterDelay {
    pub fn new(delay: Duration) -> Self {
        Self {
            deadline: Instant::now() + delay,
        }
    }
}

impl AbortSignal for AfterDelay {
    fn should_abort(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Aborts when anything arrives on stdin.
///
/// Stdin is read as the terminal delivers it, so on a line-buffered terminal the signal fires
/// on Enter rather than on the first key. Piped input fires on its first byte. The watcher
/// thread blocks on stdin and is left behind when the capture ends first.
#[derive(Debug, Clone)]
pub struct KeyPress {
    flag: AbortFlag,
}

impl KeyPress {
    pub fn spawn() -> std::io::Result<Self> {
        let flag = AbortFlag::new();
        let raised = flag.clone();
        thread::Builder::new()
            .name("keypress".to_string())
            .spawn(move || {
                let mut byte = [0u8; 1];
                if matches!(std::io::stdin().read(&mut byte), Ok(n) if n > 0) {
                    raised.raise();
                }
            })?;
        Ok(Self { flag })
    }
}

impl AbortSignal for KeyPress {
    fn should_abort(&self) -> bool {
        self.flag.is_raised()
    }
}

/// Why the drain stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainExit {
    Aborted,
    AutoStop,
    /// The application buffer filled up; later samples were dropped.
    AppBufferFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub exit: DrainExit,
    pub stats: StreamStats,
    pub rows_written: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error("writing samples failed: {0}")]
    Sink(#[from] SinkError),
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Pulls a running streaming capture into a sink until it ends.
pub struct Drain<'a> {
    device: &'a mut Device,
    sink: Option<&'a mut dyn SampleSink>,
    abort: &'a dyn AbortSignal,
    poll_interval: Duration,
}

impl<'a> Drain<'a> {
    pub fn new(device: &'a mut Device) -> Self {
        Self {
            device,
            sink: None,
            abort: &NeverAbort,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_sink(mut self, sink: &'a mut dyn SampleSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_abort(mut self, abort: &'a dyn AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Sleep between polls that returned no data.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[tracing::instrument(skip(self), fields(handle = self.device.handle()))]
    pub fn run(mut self) -> Result<DrainReport, DrainError> {
        let pipeline = match (self.device.pipeline(), self.device.state()) {
            (Some(pipeline), DeviceState::Streaming | DeviceState::Stopped) => Arc::clone(pipeline),
            (_, state) => return Err(AcquisitionError::InvalidState(state).into()),
        };

        let mut empty_polls = 0u64;
        let mut rows_written = 0u64;
        let outcome = self.pump(&pipeline, &mut empty_polls, &mut rows_written);
        let cleanup = self.finish();

        let exit = outcome?;
        cleanup?;
        let stats = StreamStats {
            empty_polls,
            ..pipeline.stats()
        };
        log::info!(
            "drain finished ({exit:?}): {} samples in {} callbacks, {rows_written} rows",
            stats.total_samples,
            stats.callbacks
        );
        Ok(DrainReport {
            exit,
            stats,
            rows_written,
        })
    }

    fn pump(
        &mut self,
        pipeline: &StreamingPipeline,
        empty_polls: &mut u64,
        rows_written: &mut u64,
    ) -> Result<DrainExit, DrainError> {
        loop {
            if self.abort.should_abort() {
                log::info!("capture aborted after {} samples", pipeline.total_samples());
                return Ok(DrainExit::Aborted);
            }
            if pipeline.is_auto_stopped() {
                return Ok(DrainExit::AutoStop);
            }
            if pipeline.is_app_buffer_full() {
                log::warn!(
                    "application buffer full at {} samples, {} dropped",
                    pipeline.app_capacity(),
                    pipeline.stats().truncated_samples
                );
                return Ok(DrainExit::AppBufferFull);
            }

            if !self.device.poll_latest_values()? {
                *empty_polls += 1;
                thread::sleep(self.poll_interval);
                continue;
            }
            // a driver-indexed window is only valid until the next poll
            if let (Some(window), Some(sink)) = (pipeline.take_window(), self.sink.as_mut()) {
                if !window.is_empty() {
                    let samples = pipeline.read_window(&window);
                    *rows_written += sink.write_window(&window, &samples)? as u64;
                }
            }
        }
    }

    fn finish(&mut self) -> Result<(), DrainError> {
        let stopped = self.device.stop();
        let flushed = self.sink.as_mut().map_or(Ok(()), |sink| sink.flush());
        let released = self.device.release_buffers();
        stopped?;
        flushed?;
        released?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::StreamingConfig;
    use crate::capabilities::Range;
    use crate::channels::ChannelSetting;
    use crate::driver::{Channel, RatioMode, TimeUnits};
    use crate::registry::DeviceRegistry;
    use crate::simulator::{Pacing, Signal, SimulatedDriver, SimulatorConfig};
    use crate::trigger_config::SimpleTrigger;
    use crate::streaming::{ChannelSamples, IndexMode, LatestWindow};

    #[derive(Default)]
    struct CountingSink {
        rows: usize,
        windows: usize,
        flushed: bool,
    }

    impl SampleSink for CountingSink {
        fn write_window(
            &mut self,
            window: &LatestWindow,
            samples: &[ChannelSamples],
        ) -> Result<usize, SinkError> {
            assert!(samples.iter().all(|c| c.max.len() == window.len));
            self.windows += 1;
            self.rows += window.len;
            Ok(window.len)
        }

        fn flush(&mut self) -> Result<(), SinkError> {
            self.flushed = true;
            Ok(())
        }
    }

    fn streaming_device(pacing: Pacing) -> Device {
        let driver = SimulatedDriver::new(SimulatorConfig::new("2204A").with_pacing(pacing));
        let mut device = DeviceRegistry::new(Arc::new(driver)).open(None).unwrap();
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R1V))
            .unwrap();
        device
    }

    #[test]
    fn test_abort_signals() {
        assert!(!NeverAbort.should_abort());
        let flag = AbortFlag::new();
        let shared = flag.clone();
        assert!(!flag.should_abort());
        shared.raise();
        assert!(flag.should_abort());
        assert!(AfterDelay::new(Duration::ZERO).should_abort());
        assert!(!AfterDelay::new(Duration::from_secs(60)).should_abort());
    }

    #[test]
    fn test_drain_until_auto_stop() {
        let mut device = streaming_device(Pacing::Immediate { chunk: 300 });
        device
            .run_streaming(
                &StreamingConfig::new(1, TimeUnits::Us)
                    .with_auto_stop(2_000)
                    .with_buffer_capacity(1_024),
            )
            .unwrap();

        let mut sink = CountingSink::default();
        let report = Drain::new(&mut device).with_sink(&mut sink).run().unwrap();
        assert_eq!(report.exit, DrainExit::AutoStop);
        assert_eq!(report.stats.total_samples, 2_000);
        assert_eq!(report.rows_written, 2_000);
        assert_eq!(sink.rows, 2_000);
        assert_eq!(sink.windows as u64, report.stats.callbacks);
        assert!(sink.flushed);
        assert_eq!(device.state(), DeviceState::Stopped);
        assert!(device.buffers().get(Channel::A, 0).is_none());
    }

    #[derive(Default)]
    struct PairSink {
        rows: usize,
        inverted: usize,
    }

    impl SampleSink for PairSink {
        fn write_window(
            &mut self,
            window: &LatestWindow,
            samples: &[ChannelSamples],
        ) -> Result<usize, SinkError> {
            for channel in samples {
                let min = channel.min.as_ref().unwrap();
                self.inverted += channel.max.iter().zip(min).filter(|(hi, lo)| lo > hi).count();
            }
            self.rows += window.len;
            Ok(window.len)
        }

        fn flush(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn test_aggregated_stream_stops_at_window() {
        let config = SimulatorConfig::new("2204A")
            .with_pacing(Pacing::Immediate { chunk: 300 })
            .with_signal(
                Channel::A,
                Signal::Step {
                    low_mv: -200,
                    high_mv: 600,
                    at_sample: 50_000,
                },
            );
        let mut device = DeviceRegistry::new(Arc::new(SimulatedDriver::new(config)))
            .open(None)
            .unwrap();
        device
            .set_channel(Channel::A, ChannelSetting::enabled(Range::R1V))
            .unwrap();
        device
            .set_trigger(SimpleTrigger::start_capturing_when(Channel::A).rising_edge(200))
            .unwrap();
        device
            .run_streaming(
                &StreamingConfig::new(1, TimeUnits::Us)
                    .with_trigger_window(10_000, 40_000)
                    .with_buffer_capacity(1_024)
                    .with_downsampling(10, RatioMode::Aggregate),
            )
            .unwrap();
        assert_eq!(device.pipeline().unwrap().app_capacity(), 5_000);

        let mut sink = PairSink::default();
        let report = Drain::new(&mut device).with_sink(&mut sink).run().unwrap();
        assert_eq!(report.exit, DrainExit::AutoStop);
        assert_eq!(report.stats.total_samples, 5_000);
        assert_eq!(report.stats.truncated_samples, 0);
        assert_eq!(sink.rows, 5_000);
        assert_eq!(sink.inverted, 0);
        // 10_000 raw samples before the edge are 1_000 aggregated ones
        let at = report.stats.triggered_at.unwrap();
        assert!((999..=1_001).contains(&at), "triggered at {at}");
    }

    #[test]
    fn test_drain_reports_buffer_full() {
        let mut device = streaming_device(Pacing::Immediate { chunk: 300 });
        device
            .run_streaming(
                &StreamingConfig::new(1, TimeUnits::Us)
                    .continuous()
                    .with_index_mode(IndexMode::AppIndexed)
                    .with_buffer_capacity(1_024)
                    .with_app_capacity(1_000),
            )
            .unwrap();

        let report = Drain::new(&mut device).run().unwrap();
        assert_eq!(report.exit, DrainExit::AppBufferFull);
        assert_eq!(report.stats.total_samples, 1_000);
        assert!(report.stats.truncated_samples > 0);
    }

    #[test]
    fn test_abort_stops_continuous_capture() {
        let mut device = streaming_device(Pacing::RealTime);
        device
            .run_streaming(
                &StreamingConfig::new(10, TimeUnits::Us)
                    .continuous()
                    .with_buffer_capacity(10_000),
            )
            .unwrap();

        let abort = AfterDelay::new(Duration::from_millis(50));
        let report = Drain::new(&mut device)
            .with_abort(&abort)
            .with_poll_interval(Duration::from_millis(1))
            .run()
            .unwrap();
        assert_eq!(report.exit, DrainExit::Aborted);
        let callbacks = device.pipeline().unwrap().callbacks();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(device.pipeline().unwrap().callbacks(), callbacks);
    }

    #[test]
    fn test_drain_needs_streaming_capture() {
        let mut device = streaming_device(Pacing::default());
        assert!(matches!(
            Drain::new(&mut device).run(),
            Err(DrainError::Acquisition(AcquisitionError::InvalidState(
                DeviceState::ChannelsSet
            )))
        ));
    }
}
