//! Buffer pair pool.
//!
//! Every enabled channel owns a [`BufferPair`]: a *driver* buffer the driver writes into
//! asynchronously and an *application* buffer the streaming pipeline copies into. Samples are
//! stored as atomics so the driver thread and the polling thread can share them without locks;
//! the driver serialises callbacks, and readers only touch indices the pipeline has published.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;

use crate::driver::{BufferBinding, Channel, DriverError, Handle, RatioMode, ScopeDriver};

/// Fixed-capacity, zero-initialised sample storage shared between threads.
#[derive(Debug)]
pub struct SampleBuffer {
    samples: Box<[AtomicI16]>,
}

impl SampleBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            samples: (0..len).map(|_| AtomicI16::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<i16> {
        self.samples.get(index).map(|s| s.load(Ordering::Relaxed))
    }

    pub fn set(&self, index: usize, value: i16) {
        if let Some(slot) = self.samples.get(index) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    /// Copies `count` samples from `src[src_start..]` into `self[dst_start..]`, clamped to
    /// both buffers. Returns the number copied.
    pub fn copy_from(
        &self,
        src: &Self,
        src_start: usize,
        dst_start: usize,
        count: usize,
    ) -> usize {
        let count = count
            .min(src.len().saturating_sub(src_start))
            .min(self.len().saturating_sub(dst_start));
        for (dst, src) in self.samples[dst_start..dst_start + count]
            .iter()
            .zip(&src.samples[src_start..src_start + count])
        {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        count
    }

    /// Snapshot of `start..start + count`, clamped to the buffer.
    pub fn read(&self, start: usize, count: usize) -> Vec<i16> {
        let end = start.saturating_add(count).min(self.len());
        let start = start.min(end);
        self.samples[start..end]
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect()
    }

    pub fn to_vec(&self) -> Vec<i16> {
        self.read(0, self.len())
    }
}

/// Driver and application buffers for one channel and segment.
#[derive(Debug)]
pub struct BufferPair {
    pub channel: Channel,
    pub segment: u32,
    pub driver_max: Arc<SampleBuffer>,
    pub driver_min: Option<Arc<SampleBuffer>>,
    pub app_max: Arc<SampleBuffer>,
    pub app_min: Option<Arc<SampleBuffer>>,
}

impl BufferPair {
    /// Same-size driver and application buffers.
    pub fn new(channel: Channel, capacity: usize, with_min_max: bool) -> Self {
        Self::linear(channel, capacity, capacity, with_min_max)
    }

    /// Application buffers sized independently of the driver's, for app-indexed streaming.
    pub fn linear(
        channel: Channel,
        driver_capacity: usize,
        app_capacity: usize,
        with_min_max: bool,
    ) -> Self {
        let min = |len| with_min_max.then(|| Arc::new(SampleBuffer::new(len)));
        Self {
            channel,
            segment: 0,
            driver_max: Arc::new(SampleBuffer::new(driver_capacity)),
            driver_min: min(driver_capacity),
            app_max: Arc::new(SampleBuffer::new(app_capacity)),
            app_min: min(app_capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.driver_max.len()
    }

    pub fn app_capacity(&self) -> usize {
        self.app_max.len()
    }

    pub fn has_min_max(&self) -> bool {
        self.driver_min.is_some()
    }

    fn binding(&self, ratio_mode: RatioMode) -> BufferBinding {
        BufferBinding {
            max: Arc::clone(&self.driver_max),
            min: self.driver_min.clone(),
            segment: self.segment,
            ratio_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("buffers are pinned while a capture is armed")]
    Pinned,

    #[error("no buffer allocated for channel {channel} segment {segment}")]
    NotAllocated { channel: Channel, segment: u32 },

    #[error("setDataBuffer({channel}) failed: {source}")]
    Driver {
        channel: Channel,
        #[source]
        source: DriverError,
    },
}

type Key = (Channel, u32);

/// Buffer pairs of one device, keyed by channel and segment.
#[derive(Debug, Default)]
pub struct BufferPool {
    pairs: BTreeMap<Key, Arc<BufferPair>>,
    registered: BTreeMap<Key, RatioMode>,
    pinned: bool,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel: Channel, segment: u32) -> Option<&Arc<BufferPair>> {
        self.pairs.get(&(channel, segment))
    }

    pub fn is_registered(&self, channel: Channel, segment: u32) -> bool {
        self.registered.contains_key(&(channel, segment))
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Pins every buffer for the armed-through-stopped lifetime of a capture.
    pub(crate) fn pin(&mut self) {
        self.pinned = true;
    }

    pub(crate) fn unpin(&mut self) {
        self.pinned = false;
    }

    pub fn allocate(
        &mut self,
        channel: Channel,
        capacity: usize,
        with_min_max: bool,
    ) -> Result<Arc<BufferPair>, BufferError> {
        self.insert(BufferPair::new(channel, capacity, with_min_max))
    }

    pub fn allocate_linear(
        &mut self,
        channel: Channel,
        driver_capacity: usize,
        app_capacity: usize,
        with_min_max: bool,
    ) -> Result<Arc<BufferPair>, BufferError> {
        self.insert(BufferPair::linear(
            channel,
            driver_capacity,
            app_capacity,
            with_min_max,
        ))
    }

    pub fn allocate_segment(
        &mut self,
        channel: Channel,
        segment: u32,
        capacity: usize,
        with_min_max: bool,
    ) -> Result<Arc<BufferPair>, BufferError> {
        let mut pair = BufferPair::new(channel, capacity, with_min_max);
        pair.segment = segment;
        self.insert(pair)
    }

    fn insert(&mut self, pair: BufferPair) -> Result<Arc<BufferPair>, BufferError> {
        let key = (pair.channel, pair.segment);
        if self.pinned && self.pairs.contains_key(&key) {
            return Err(BufferError::Pinned);
        }
        // a replaced pair must be registered again before the driver sees it
        self.registered.remove(&key);
        let pair = Arc::new(pair);
        self.pairs.insert(key, Arc::clone(&pair));
        Ok(pair)
    }

    /// Tells the driver where to deposit samples. Calling again rebinds.
    pub fn register<D: ScopeDriver + ?Sized>(
        &mut self,
        driver: &D,
        handle: Handle,
        channel: Channel,
        segment: u32,
        ratio_mode: RatioMode,
    ) -> Result<(), BufferError> {
        let pair = self
            .pairs
            .get(&(channel, segment))
            .ok_or(BufferError::NotAllocated { channel, segment })?;
        log::debug!(
            "setDataBuffers({channel}, segment {segment}, {} samples, {ratio_mode:?})",
            pair.capacity()
        );
        driver
            .set_data_buffers(handle, channel, segment, Some(pair.binding(ratio_mode)))
            .map_err(|source| BufferError::Driver { channel, source })?;
        self.registered.insert((channel, segment), ratio_mode);
        Ok(())
    }

    /// Unregisters `channel`'s buffers so the driver stops writing into them.
    pub fn clear<D: ScopeDriver + ?Sized>(
        &mut self,
        driver: &D,
        handle: Handle,
        channel: Channel,
        segment: u32,
    ) -> Result<(), BufferError> {
        if self.pinned {
            return Err(BufferError::Pinned);
        }
        if self.registered.remove(&(channel, segment)).is_some() {
            log::debug!("clearing data buffers for {channel}, segment {segment}");
            driver
                .set_data_buffers(handle, channel, segment, None)
                .map_err(|source| BufferError::Driver { channel, source })?;
        }
        Ok(())
    }

    /// Unregisters every buffer, then frees them.
    pub fn clear_all<D: ScopeDriver + ?Sized>(
        &mut self,
        driver: &D,
        handle: Handle,
    ) -> Result<(), BufferError> {
        let keys: Vec<Key> = self.registered.keys().copied().collect();
        for (channel, segment) in keys {
            self.clear(driver, handle, channel, segment)?;
        }
        self.pairs.clear();
        Ok(())
    }

    /// Frees pairs for `channel` that are no longer registered.
    pub fn release(&mut self, channel: Channel) {
        let registered = &self.registered;
        self.pairs
            .retain(|key, _| key.0 != channel || registered.contains_key(key));
    }
}
