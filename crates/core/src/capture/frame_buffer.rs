use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use super::domain::camera_source::CaptureError;
use crate::shared::frame::{Frame, FrameId, FrameShape};

/// Point-in-time counters for a [`FrameBuffer`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameBufferStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub current_size: usize,
    pub capacity: usize,
    pub pool_hits: u64,
    pub pool_misses: u64,
}

impl FrameBufferStats {
    pub fn drop_ratio(&self) -> f64 {
        if self.frames_received == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / self.frames_received as f64
        }
    }
}

/// Bounded frame queue between capture and processing with drop-oldest
/// overflow and pixel-storage reuse.
///
/// One producer and any number of consumers may use it concurrently. When
/// full, the oldest queued frame is evicted so the newest is always
/// admitted; queued frames never exceed `capacity`. Consumed frames should
/// be handed back through [`FrameBuffer::recycle`] so their storage can be
/// reused by [`FrameBuffer::acquire`] for the next frame of the same shape.
pub struct FrameBuffer {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
    pool: Mutex<HashMap<FrameShape, Vec<Vec<u8>>>>,
    pool_per_shape: usize,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
}

impl FrameBuffer {
    pub fn new(capacity: usize, pool_per_shape: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            pool: Mutex::new(HashMap::new()),
            pool_per_shape,
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
        }
    }

    /// Queues `frame`, evicting the oldest queued frame if the buffer is full.
    ///
    /// Returns `true` when the frame was admitted without evicting anything
    /// and `false` when an older frame had to be dropped to make room.
    pub fn put(&self, frame: Frame) -> bool {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        let mut pending = frame;
        let mut evicted = false;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return !evicted,
                Err(TrySendError::Full(back)) => {
                    pending = back;
                    // A consumer may have emptied a slot meanwhile; retry either way.
                    if let Ok(oldest) = self.rx.try_recv() {
                        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Frame buffer full, dropped frame {}", oldest.frame_id());
                        self.recycle(oldest);
                        evicted = true;
                    }
                }
                // Both channel ends live in `self`, so this cannot happen.
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Copies `pixels` into pooled storage and queues the result.
    ///
    /// Pixels that do not fill `shape` exactly are rejected before any
    /// storage is taken from the pool.
    pub fn put_copy(
        &self,
        pixels: &[u8],
        shape: FrameShape,
        frame_id: FrameId,
        timestamp: Duration,
    ) -> Result<bool, CaptureError> {
        if pixels.len() != shape.byte_len() {
            return Err(CaptureError::ShapeMismatch {
                expected: shape.byte_len(),
                actual: pixels.len(),
            });
        }
        let mut data = self.acquire(shape);
        data.copy_from_slice(pixels);
        Ok(self.put(Frame::new(
            data,
            shape.width,
            shape.height,
            shape.channels,
            frame_id,
            timestamp,
        )))
    }

    /// Waits up to `timeout` for the oldest queued frame.
    pub fn get(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_get(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Hands out a zeroed-or-reused buffer sized for `shape`.
    ///
    /// Reuse is best-effort: with no spare buffer of that shape a fresh one
    /// is allocated.
    pub fn acquire(&self, shape: FrameShape) -> Vec<u8> {
        let reused = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&shape)
            .and_then(Vec::pop);
        match reused {
            Some(data) if data.len() == shape.byte_len() => {
                self.pool_hits.fetch_add(1, Ordering::Relaxed);
                data
            }
            _ => {
                self.pool_misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; shape.byte_len()]
            }
        }
    }

    /// Returns a consumed frame's storage to the pool.
    pub fn recycle(&self, frame: Frame) {
        let shape = frame.shape();
        let data = frame.into_data();
        if data.len() != shape.byte_len() {
            return;
        }
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let spares = pool.entry(shape).or_default();
        if spares.len() < self.pool_per_shape {
            spares.push(data);
        }
    }

    /// Drops every queued frame, keeping their storage for reuse.
    pub fn clear(&self) {
        while let Ok(frame) = self.rx.try_recv() {
            self.recycle(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FrameBufferStats {
        FrameBufferStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity,
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    const SHAPE: FrameShape = FrameShape {
        width: 4,
        height: 2,
        channels: 3,
    };

    fn frame(frame_id: FrameId) -> Frame {
        Frame::new(
            vec![frame_id as u8; SHAPE.byte_len()],
            SHAPE.width,
            SHAPE.height,
            SHAPE.channels,
            frame_id,
            Duration::from_millis(frame_id * 33),
        )
    }

    #[test]
    fn test_put_then_get_in_order() {
        let buffer = FrameBuffer::new(5, 2);
        assert!(buffer.put(frame(1)));
        assert!(buffer.put(frame(2)));
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.try_get().unwrap().frame_id(), 1);
        assert_eq!(buffer.try_get().unwrap().frame_id(), 2);
        assert!(buffer.try_get().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buffer = FrameBuffer::new(3, 2);
        for id in 1..=3 {
            assert!(buffer.put(frame(id)));
        }
        for id in 4..=7 {
            assert!(!buffer.put(frame(id)));
            assert_eq!(buffer.len(), 3);
        }

        let ids: Vec<FrameId> = std::iter::from_fn(|| buffer.try_get())
            .map(|f| f.frame_id())
            .collect();
        assert_eq!(ids, vec![5, 6, 7]);

        let stats = buffer.stats();
        assert_eq!(stats.frames_received, 7);
        assert_eq!(stats.frames_dropped, 4);
        assert!((stats.drop_ratio() - 4.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_get_times_out_when_empty() {
        let buffer = FrameBuffer::new(2, 2);
        let start = std::time::Instant::now();
        assert!(buffer.get(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_recycled_storage_is_reused() {
        let buffer = FrameBuffer::new(2, 2);
        let data = buffer.acquire(SHAPE);
        let ptr = data.as_ptr();
        buffer.put(Frame::new(data, SHAPE.width, SHAPE.height, 3, 0, Duration::ZERO));

        let consumed = buffer.try_get().unwrap();
        buffer.recycle(consumed);

        let reused = buffer.acquire(SHAPE);
        assert_eq!(reused.as_ptr(), ptr);
        assert_eq!(buffer.stats().pool_hits, 1);
        assert_eq!(buffer.stats().pool_misses, 1);
    }

    #[test]
    fn test_acquire_with_other_shape_allocates_fresh() {
        let buffer = FrameBuffer::new(2, 2);
        buffer.recycle(frame(0));

        let other = FrameShape::new(8, 8, 3);
        let data = buffer.acquire(other);
        assert_eq!(data.len(), other.byte_len());
        assert_eq!(buffer.stats().pool_misses, 1);
        assert_eq!(buffer.stats().pool_hits, 0);
    }

    #[test]
    fn test_pool_depth_is_bounded() {
        let buffer = FrameBuffer::new(2, 1);
        buffer.recycle(frame(0));
        buffer.recycle(frame(1));

        buffer.acquire(SHAPE);
        buffer.acquire(SHAPE);
        let stats = buffer.stats();
        assert_eq!(stats.pool_hits, 1);
        assert_eq!(stats.pool_misses, 1);
    }

    #[test]
    fn test_put_copy_uses_pooled_storage() {
        let buffer = FrameBuffer::new(2, 2);
        let pixels = vec![42u8; SHAPE.byte_len()];
        assert!(buffer
            .put_copy(&pixels, SHAPE, 3, Duration::from_secs(1))
            .unwrap());

        let f = buffer.try_get().unwrap();
        assert_eq!(f.frame_id(), 3);
        assert_eq!(f.data(), &pixels[..]);
    }

    #[test]
    fn test_put_copy_rejects_wrong_length() {
        let buffer = FrameBuffer::new(2, 2);
        buffer.recycle(frame(0));

        let result = buffer.put_copy(&[0u8; 5], FrameShape::new(4, 2, 3), 1, Duration::ZERO);
        assert!(matches!(
            result,
            Err(CaptureError::ShapeMismatch {
                expected: 24,
                actual: 5
            })
        ));
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().frames_received, 0);
        // The pooled buffer is still there for the next good frame.
        buffer.acquire(SHAPE);
        assert_eq!(buffer.stats().pool_hits, 1);
    }

    #[test]
    fn test_clear_empties_and_keeps_storage() {
        let buffer = FrameBuffer::new(4, 4);
        for id in 0..3 {
            buffer.put(frame(id));
        }
        buffer.clear();
        assert!(buffer.is_empty());

        for _ in 0..3 {
            buffer.acquire(SHAPE);
        }
        assert_eq!(buffer.stats().pool_hits, 3);
    }

    #[test]
    fn test_concurrent_producer_and_consumers_stay_bounded() {
        let buffer = Arc::new(FrameBuffer::new(5, 4));
        let done = Arc::new(AtomicBool::new(false));
        let consumed = Arc::new(AtomicU64::new(0));

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let buffer = buffer.clone();
                let done = done.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    let mut last_seen = 0;
                    while !done.load(Ordering::SeqCst) || !buffer.is_empty() {
                        assert!(buffer.len() <= buffer.capacity());
                        if let Some(f) = buffer.get(Duration::from_millis(5)) {
                            last_seen = f.frame_id();
                            consumed.fetch_add(1, Ordering::SeqCst);
                            buffer.recycle(f);
                        }
                    }
                    last_seen
                })
            })
            .collect();

        for id in 1..=500 {
            buffer
                .put_copy(&vec![0u8; SHAPE.byte_len()], SHAPE, id, Duration::ZERO)
                .unwrap();
            assert!(buffer.len() <= buffer.capacity());
        }
        done.store(true, Ordering::SeqCst);
        let last_ids: Vec<FrameId> = consumers.into_iter().map(|h| h.join().unwrap()).collect();

        let stats = buffer.stats();
        assert_eq!(stats.frames_received, 500);
        assert_eq!(
            consumed.load(Ordering::SeqCst) + stats.frames_dropped,
            500
        );
        assert!(last_ids.contains(&500));
    }
}
