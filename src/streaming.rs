//! Streaming pipeline.
//!
//! [`StreamingPipeline`] is the per-capture context handed to the driver as its latest-values
//! callback. On every invocation it copies the reported window out of the driver buffers into
//! the application buffers, advances the running sample count, latches the first trigger
//! position and raises the auto-stop and buffer-full flags.
//!
//! The driver serialises callbacks for one device, so the callback takes no lock. It publishes
//! its bookkeeping with a release increment of the callback counter; readers acquire that
//! counter before touching the published window.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffers::{BufferPair, SampleBuffer};
use crate::driver::{Channel, Handle, LatestValues, StreamingCallback};

/// Where the pipeline writes inside the application buffers. Fixed for a capture's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexMode {
    /// The app buffer mirrors the driver's ring; samples land at the driver's `start_index`.
    #[default]
    DriverIndexed,
    /// The app buffer is linear; samples land at the running total and stop at capacity.
    AppIndexed,
}

/// Samples delivered by one callback, located in the application buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestWindow {
    /// Absolute index of the first sample of the window.
    pub first_sample: u64,
    /// Offset of the window in the application buffers.
    pub app_start: usize,
    pub len: usize,
    pub overflow: u16,
}

impl LatestWindow {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Max (and, when aggregating, min) samples of one channel for one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSamples {
    pub channel: Channel,
    pub max: Vec<i16>,
    pub min: Option<Vec<i16>>,
}

/// Counters collected over one streaming capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    pub callbacks: u64,
    pub empty_polls: u64,
    pub total_samples: u64,
    /// Samples the driver delivered that did not fit the application buffers.
    pub truncated_samples: u64,
    /// Union of every overflow mask seen.
    pub overflow: u16,
    pub triggered_at: Option<u64>,
}

#[derive(Debug)]
pub struct StreamingPipeline {
    mode: IndexMode,
    pairs: Vec<Arc<BufferPair>>,

    total_samples: AtomicU64,
    truncated: AtomicU64,
    callbacks: AtomicU64,
    consumed: AtomicU64,

    window_first: AtomicU64,
    window_start: AtomicU64,
    window_len: AtomicU64,
    last_overflow: AtomicU16,
    overflow_seen: AtomicU16,

    triggered: AtomicBool,
    triggered_at: AtomicU64,
    auto_stop: AtomicBool,
    app_buffer_full: AtomicBool,
}

impl StreamingPipeline {
    pub fn new(mode: IndexMode, pairs: Vec<Arc<BufferPair>>) -> Self {
        Self {
            mode,
            pairs,
            total_samples: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
            callbacks: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            window_first: AtomicU64::new(0),
            window_start: AtomicU64::new(0),
            window_len: AtomicU64::new(0),
            last_overflow: AtomicU16::new(0),
            overflow_seen: AtomicU16::new(0),
            triggered: AtomicBool::new(false),
            triggered_at: AtomicU64::new(0),
            auto_stop: AtomicBool::new(false),
            app_buffer_full: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.pairs.iter().map(|p| p.channel)
    }

    /// Smallest application buffer across channels; the app-indexed write limit.
    pub fn app_capacity(&self) -> usize {
        self.pairs
            .iter()
            .map(|p| p.app_capacity())
            .min()
            .unwrap_or(0)
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples.load(Ordering::Acquire)
    }

    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Acquire)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Absolute index of the trigger, latched on the first callback that reported one.
    pub fn triggered_at(&self) -> Option<u64> {
        self.is_triggered()
            .then(|| self.triggered_at.load(Ordering::Acquire))
    }

    pub fn is_auto_stopped(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
    }

    pub fn is_app_buffer_full(&self) -> bool {
        self.app_buffer_full.load(Ordering::Acquire)
    }

    /// Overflow mask of the most recent callback.
    pub fn overflow(&self) -> u16 {
        self.last_overflow.load(Ordering::Acquire)
    }

    pub fn app_buffer(&self, channel: Channel) -> Option<&Arc<SampleBuffer>> {
        self.pair(channel).map(|p| &p.app_max)
    }

    fn pair(&self, channel: Channel) -> Option<&Arc<BufferPair>> {
        self.pairs.iter().find(|p| p.channel == channel)
    }

    /// Returns the window of the latest callback if one arrived since the previous call.
    ///
    /// Only the consuming thread should call this; with the driver-indexed layout a window
    /// is overwritten once the driver wraps, so it must be read before the next poll.
    pub fn take_window(&self) -> Option<LatestWindow> {
        let callbacks = self.callbacks.load(Ordering::Acquire);
        let consumed = self.consumed.swap(callbacks, Ordering::AcqRel);
        if callbacks == consumed {
            return None;
        }
        Some(LatestWindow {
            first_sample: self.window_first.load(Ordering::Relaxed),
            app_start: self.window_start.load(Ordering::Relaxed) as usize,
            len: self.window_len.load(Ordering::Relaxed) as usize,
            overflow: self.last_overflow.load(Ordering::Relaxed),
        })
    }

    /// Copies `window` out of the application buffers, one entry per channel in channel order.
    pub fn read_window(&self, window: &LatestWindow) -> Vec<ChannelSamples> {
        self.pairs
            .iter()
            .map(|pair| ChannelSamples {
                channel: pair.channel,
                max: pair.app_max.read(window.app_start, window.len),
                min: pair
                    .app_min
                    .as_ref()
                    .map(|min| min.read(window.app_start, window.len)),
            })
            .collect()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            callbacks: self.callbacks(),
            empty_polls: 0,
            total_samples: self.total_samples(),
            truncated_samples: self.truncated.load(Ordering::Acquire),
            overflow: self.overflow_seen.load(Ordering::Acquire),
            triggered_at: self.triggered_at(),
        }
    }

    fn copy_window(&self, src_start: usize, dst_start: usize, count: usize) -> usize {
        let mut copied = count;
        for pair in &self.pairs {
            copied = copied.min(pair.app_max.copy_from(&pair.driver_max, src_start, dst_start, count));
            if let (Some(app_min), Some(driver_min)) = (&pair.app_min, &pair.driver_min) {
                app_min.copy_from(driver_min, src_start, dst_start, count);
            }
        }
        copied
    }
}

impl StreamingCallback for StreamingPipeline {
    fn on_latest_values(&self, _handle: Handle, values: &LatestValues) {
        let before = self.total_samples.load(Ordering::Relaxed);
        let start = values.start_index as usize;
        let count = values.no_of_samples as usize;

        let (app_start, delivered) = match self.mode {
            IndexMode::DriverIndexed => (start, self.copy_window(start, start, count)),
            IndexMode::AppIndexed => {
                let dst = usize::try_from(before).unwrap_or(usize::MAX);
                let room = self.app_capacity().saturating_sub(dst);
                let accepted = if self.app_buffer_full.load(Ordering::Relaxed) {
                    0
                } else {
                    count.min(room)
                };
                if count > room {
                    self.app_buffer_full.store(true, Ordering::Release);
                }
                let copied = if accepted > 0 {
                    self.copy_window(start, dst, accepted)
                } else {
                    0
                };
                self.truncated
                    .fetch_add((count - copied) as u64, Ordering::Relaxed);
                (dst, copied)
            }
        };

        if values.triggered && !self.triggered.load(Ordering::Relaxed) {
            self.triggered_at
                .store(before + u64::from(values.triggered_at), Ordering::Relaxed);
            self.triggered.store(true, Ordering::Release);
        }
        if values.auto_stop {
            self.auto_stop.store(true, Ordering::Release);
        }

        self.last_overflow.store(values.overflow, Ordering::Relaxed);
        self.overflow_seen.fetch_or(values.overflow, Ordering::Relaxed);
        self.window_first.store(before, Ordering::Relaxed);
        self.window_start.store(app_start as u64, Ordering::Relaxed);
        self.window_len.store(delivered as u64, Ordering::Relaxed);
        self.total_samples
            .store(before + delivered as u64, Ordering::Release);
        self.callbacks.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(channel: Channel, driver: usize, app: usize) -> Arc<BufferPair> {
        Arc::new(BufferPair::linear(channel, driver, app, false))
    }

    fn produce(pair: &BufferPair, start: usize, values: &[i16]) {
        for (i, v) in values.iter().enumerate() {
            pair.driver_max.set(start + i, *v);
        }
    }

    fn values(start: u32, n: u32) -> LatestValues {
        LatestValues {
            no_of_samples: n,
            start_index: start,
            ..LatestValues::default()
        }
    }

    #[test]
    fn test_driver_indexed_copies_at_start_index() {
        let a = pair(Channel::A, 8, 8);
        let pipeline = StreamingPipeline::new(IndexMode::DriverIndexed, vec![Arc::clone(&a)]);

        produce(&a, 0, &[1, 2, 3, 4, 5]);
        pipeline.on_latest_values(1, &values(0, 5));
        let window = pipeline.take_window().unwrap();
        assert_eq!((window.first_sample, window.app_start, window.len), (0, 0, 5));
        assert!(pipeline.take_window().is_none());

        produce(&a, 5, &[6, 7, 8]);
        pipeline.on_latest_values(1, &values(5, 3));
        produce(&a, 0, &[9, 10]);
        pipeline.on_latest_values(1, &values(0, 2));

        let window = pipeline.take_window().unwrap();
        assert_eq!((window.first_sample, window.app_start, window.len), (8, 0, 2));
        assert_eq!(pipeline.read_window(&window)[0].max, vec![9, 10]);
        assert_eq!(pipeline.total_samples(), 10);
        assert_eq!(pipeline.callbacks(), 3);
    }

    #[test]
    fn test_app_indexed_appends_at_total() {
        let a = pair(Channel::A, 4, 12);
        let b = pair(Channel::B, 4, 12);
        let pipeline =
            StreamingPipeline::new(IndexMode::AppIndexed, vec![Arc::clone(&a), Arc::clone(&b)]);

        let mut expected = Vec::new();
        for round in 0..3i16 {
            let chunk: Vec<i16> = (0..4).map(|i| round * 10 + i).collect();
            produce(&a, 0, &chunk);
            produce(&b, 0, &chunk.iter().map(|v| -v).collect::<Vec<_>>());
            pipeline.on_latest_values(1, &values(0, 4));
            expected.extend(chunk);
        }
        assert_eq!(pipeline.total_samples(), 12);
        assert_eq!(a.app_max.to_vec(), expected);
        assert_eq!(b.app_max.get(5), Some(-11));
        assert!(!pipeline.is_app_buffer_full());
    }

    #[test]
    fn test_app_buffer_full_clamps() {
        let a = pair(Channel::A, 4, 10);
        let pipeline = StreamingPipeline::new(IndexMode::AppIndexed, vec![Arc::clone(&a)]);

        produce(&a, 0, &[1, 2, 3, 4]);
        pipeline.on_latest_values(1, &values(0, 4));
        pipeline.on_latest_values(1, &values(0, 4));
        assert!(!pipeline.is_app_buffer_full());

        pipeline.on_latest_values(1, &values(0, 4));
        assert!(pipeline.is_app_buffer_full());
        assert_eq!(pipeline.total_samples(), 10);
        assert_eq!(a.app_max.read(8, 2), vec![1, 2]);

        // further callbacks are accepted but copy nothing
        pipeline.on_latest_values(1, &values(0, 4));
        let stats = pipeline.stats();
        assert_eq!(stats.total_samples, 10);
        assert_eq!(stats.truncated_samples, 6);
        assert_eq!(stats.callbacks, 4);
    }

    #[test]
    fn test_trigger_is_latched_once() {
        let a = pair(Channel::A, 100, 100);
        let pipeline = StreamingPipeline::new(IndexMode::DriverIndexed, vec![a]);

        pipeline.on_latest_values(1, &values(0, 30));
        assert_eq!(pipeline.triggered_at(), None);

        let mut v = values(30, 30);
        v.triggered = true;
        v.triggered_at = 7;
        pipeline.on_latest_values(1, &v);
        assert_eq!(pipeline.triggered_at(), Some(37));

        let mut again = values(60, 30);
        again.triggered = true;
        again.triggered_at = 2;
        pipeline.on_latest_values(1, &again);
        assert_eq!(pipeline.triggered_at(), Some(37));
        assert_eq!(pipeline.total_samples(), 90);
    }

    #[test]
    fn test_auto_stop_keeps_final_window() {
        let a = pair(Channel::A, 16, 16);
        let pipeline = StreamingPipeline::new(IndexMode::DriverIndexed, vec![Arc::clone(&a)]);
        produce(&a, 0, &[5; 6]);
        let mut v = values(0, 6);
        v.auto_stop = true;
        v.overflow = 0b1;
        pipeline.on_latest_values(1, &v);

        assert!(pipeline.is_auto_stopped());
        let window = pipeline.take_window().unwrap();
        assert_eq!(window.len, 6);
        assert_eq!(window.overflow, 1);
        assert_eq!(pipeline.read_window(&window)[0].max, vec![5; 6]);
    }

    #[test]
    fn test_aggregate_copies_min_buffer() {
        let a = Arc::new(BufferPair::new(Channel::A, 4, true));
        let pipeline = StreamingPipeline::new(IndexMode::DriverIndexed, vec![Arc::clone(&a)]);
        if let Some(min) = &a.driver_min {
            min.set(1, -40);
        }
        a.driver_max.set(1, 40);
        pipeline.on_latest_values(1, &values(0, 2));
        let window = pipeline.take_window().unwrap();
        let samples = &pipeline.read_window(&window)[0];
        assert_eq!(samples.max, vec![0, 40]);
        assert_eq!(samples.min, Some(vec![0, -40]));
    }
}
