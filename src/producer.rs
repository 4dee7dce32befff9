//! Frame producer shared with hardware callback threads.
//!
//! The producer never blocks: if no buffer is free, or the callback queue
//! cannot take another descriptor, the frame is counted as dropped and the
//! call returns.
//!
//! Shutdown ordering: the session first marks the producer closed, so new
//! invocations return before touching the pool. An invocation that passed
//! that check already owns its claimed buffer; when it tries to publish it
//! sees the closed flag (or a disconnected queue) and hands the buffer back
//! to the pool, which frees it once the pool itself has been closed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::command::FrameCallback;
use crate::delivery::{DeliveryMsg, FrameDescriptor, SharedCallback};
use crate::error::Result;
use crate::pool::{BufferHandle, FramePool};
use crate::traits::{FrameMetadata, FrameSize};

struct ProducerInner {
    pool: FramePool,
    queue: Sender<DeliveryMsg>,
    callback: Mutex<Option<SharedCallback>>,
    frame_size: Mutex<FrameSize>,
    active: AtomicBool,
    closed: AtomicBool,
    /// Next sequence number. Held while a descriptor is queued so queue
    /// order and sequence order agree.
    sequence: Mutex<u64>,
    produced: AtomicU64,
    dropped: AtomicU64,
    epoch: Instant,
}

/// Entry point for frames into the session.
///
/// Cloned into hardware devices at [`crate::CameraDevice::start_capture`];
/// [`FrameProducer::on_frame`] may then be called from any thread.
#[derive(Clone)]
pub struct FrameProducer {
    inner: Arc<ProducerInner>,
}

impl FrameProducer {
    pub(crate) fn new(pool: FramePool, queue: Sender<DeliveryMsg>, frame_size: FrameSize) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                pool,
                queue,
                callback: Mutex::new(None),
                frame_size: Mutex::new(frame_size),
                active: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                sequence: Mutex::new(0),
                produced: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        }
    }

    /// Copy a captured frame into the next pool buffer and queue it.
    ///
    /// At most `min(payload.len(), buffer length)` bytes are copied. Returns
    /// whether the frame was queued; `false` means it was dropped or the
    /// session is not streaming.
    pub fn on_frame(&self, payload: &[u8]) -> bool {
        self.produce_with(|buf| Ok(buf.copy_from(payload)))
    }

    /// Claim a buffer, let `fill` write into it and queue the result.
    pub(crate) fn produce_with<F>(&self, fill: F) -> bool
    where
        F: FnOnce(&mut BufferHandle) -> Result<usize>,
    {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) || !inner.active.load(Ordering::Acquire) {
            return false;
        }

        let Some(mut handle) = inner.pool.claim_next() else {
            self.count_drop("pool exhausted");
            return false;
        };

        let timestamp = inner.epoch.elapsed();
        let bytes_used = match fill(&mut handle) {
            Ok(len) => len.min(handle.capacity()),
            Err(err) => {
                warn!(error = %err, "frame source failed");
                self.give_back(handle);
                return false;
            }
        };
        handle.set_len(bytes_used);

        let Some(callback) = inner.callback.lock().clone() else {
            self.give_back(handle);
            self.count_drop("no frame callback");
            return false;
        };

        if inner.closed.load(Ordering::Acquire) {
            self.give_back(handle);
            return false;
        }

        // try_send never blocks, so holding the lock here stays cheap.
        let mut next = inner.sequence.lock();
        let sequence = *next;
        *next += 1;
        let metadata = FrameMetadata {
            sequence,
            timestamp,
            bytes_used,
            size: *inner.frame_size.lock(),
        };
        let descriptor = FrameDescriptor::new(handle, callback, metadata);

        match inner.queue.try_send(DeliveryMsg::Frame(descriptor)) {
            Ok(()) => {
                drop(next);
                inner.produced.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(msg) | TrySendError::Disconnected(msg)) => {
                drop(next);
                if let DeliveryMsg::Frame(descriptor) = msg {
                    self.give_back(descriptor.into_handle());
                }
                self.record_drop(sequence, "callback queue unavailable");
                false
            }
        }
    }

    /// Count a frame dropped before it got a sequence number. It still
    /// consumes one so the gap shows downstream.
    fn count_drop(&self, reason: &'static str) {
        let sequence = {
            let mut next = self.inner.sequence.lock();
            let sequence = *next;
            *next += 1;
            sequence
        };
        self.record_drop(sequence, reason);
    }

    fn record_drop(&self, sequence: u64, reason: &'static str) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(sequence, reason, "frame dropped");
    }

    fn give_back(&self, handle: BufferHandle) {
        if let Err(err) = self.inner.pool.release(handle) {
            warn!(error = %err, "failed to return buffer to pool");
        }
    }

    /// Install the application callback for subsequent frames.
    pub(crate) fn set_callback(&self, callback: FrameCallback) {
        *self.inner.callback.lock() = Some(Arc::new(Mutex::new(callback)));
    }

    /// Forget the application callback.
    pub(crate) fn clear_callback(&self) {
        *self.inner.callback.lock() = None;
    }

    /// Accept frames from now on.
    pub(crate) fn resume(&self) {
        self.inner.active.store(true, Ordering::Release);
    }

    /// Ignore frames from now on.
    pub(crate) fn pause(&self) {
        self.inner.active.store(false, Ordering::Release);
    }

    /// Refuse every future frame. Irreversible.
    pub(crate) fn close(&self) {
        self.inner.active.store(false, Ordering::Release);
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Record the geometry stamped on subsequent frames.
    pub(crate) fn set_frame_size(&self, size: FrameSize) {
        *self.inner.frame_size.lock() = size;
    }

    /// Geometry stamped on frames.
    #[must_use]
    pub fn frame_size(&self) -> FrameSize {
        *self.inner.frame_size.lock()
    }

    /// Capacity of each frame buffer.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.inner.pool.buffer_len()
    }

    /// Whether frames are currently accepted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Frames queued for delivery since the session opened.
    #[must_use]
    pub fn produced_frames(&self) -> u64 {
        self.inner.produced.load(Ordering::Relaxed)
    }

    /// Frames dropped since the last reset.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Reset the dropped-frame counter.
    pub(crate) fn reset_dropped(&self) {
        self.inner.dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Receiver};

    fn producer(buffers: usize, len: usize) -> (FrameProducer, FramePool, Receiver<DeliveryMsg>) {
        let pool = FramePool::new(buffers, len).expect("pool should allocate");
        let (tx, rx) = bounded(buffers);
        let producer = FrameProducer::new(pool.clone(), tx, FrameSize::new(4, 1));
        producer.set_callback(Box::new(|_, _| {}));
        producer.resume();
        (producer, pool, rx)
    }

    fn drain(rx: &Receiver<DeliveryMsg>) -> Vec<FrameDescriptor> {
        rx.try_iter()
            .filter_map(|msg| match msg {
                DeliveryMsg::Frame(descriptor) => Some(descriptor),
                DeliveryMsg::Shutdown => None,
            })
            .collect()
    }

    #[test]
    fn test_inactive_producer_ignores_frames() {
        let (producer, pool, rx) = producer(2, 4);
        producer.pause();

        assert!(!producer.on_frame(&[1, 2, 3, 4]));
        assert_eq!(pool.available(), 2);
        assert_eq!(producer.dropped_frames(), 0);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_frames_copied_and_truncated() {
        let (producer, pool, rx) = producer(2, 4);

        assert!(producer.on_frame(&[1, 2]));
        assert!(producer.on_frame(&[1, 2, 3, 4, 5, 6]));

        let frames = drain(&rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data(), &[1, 2]);
        assert_eq!(frames[1].data(), &[1, 2, 3, 4]);
        assert_eq!(frames[1].metadata().bytes_used, 4);
        assert_eq!(frames[0].metadata().sequence + 1, frames[1].metadata().sequence);

        for frame in frames {
            pool.release(frame.into_handle()).expect("release should succeed");
        }
    }

    #[test]
    fn test_exhausted_pool_drops_without_descriptor() {
        let (producer, pool, rx) = producer(1, 4);

        assert!(producer.on_frame(&[1]));
        assert_eq!(pool.available(), 0);

        assert!(!producer.on_frame(&[2]));
        assert_eq!(pool.available(), 0, "available count never goes negative");
        assert_eq!(producer.dropped_frames(), 1);
        assert_eq!(drain(&rx).len(), 1);

        producer.reset_dropped();
        assert_eq!(producer.dropped_frames(), 0);
    }

    #[test]
    fn test_closed_producer_never_touches_pool() {
        let (producer, pool, rx) = producer(2, 4);
        producer.close();
        pool.close();

        assert!(!producer.on_frame(&[1, 2, 3]));
        assert_eq!(pool.total_claims(), 0);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_missing_callback_counts_as_drop() {
        let (producer, pool, rx) = producer(2, 4);
        producer.clear_callback();

        assert!(!producer.on_frame(&[1]));
        assert_eq!(pool.available(), 2);
        assert_eq!(producer.dropped_frames(), 1);
        assert!(drain(&rx).is_empty());

        producer.set_callback(Box::new(|_, _| {}));
        assert!(producer.on_frame(&[2]));
        let frames = drain(&rx);
        assert_eq!(frames[0].metadata().sequence, 1, "drop left a gap");
        for frame in frames {
            pool.release(frame.into_handle()).expect("release should succeed");
        }
    }

    #[test]
    fn test_concurrent_producers_queue_in_sequence_order() {
        const PER_THREAD: usize = 200;
        let (producer, pool, rx) = producer(4 * PER_THREAD, 4);

        std::thread::scope(|scope| {
            for byte in 0..4u8 {
                let producer = producer.clone();
                scope.spawn(move || {
                    for _ in 0..PER_THREAD {
                        producer.on_frame(&[byte; 4]);
                    }
                });
            }
        });

        let frames = drain(&rx);
        assert_eq!(frames.len(), 4 * PER_THREAD);
        assert!(frames
            .windows(2)
            .all(|pair| pair[0].metadata().sequence < pair[1].metadata().sequence));
        for frame in frames {
            pool.release(frame.into_handle()).expect("release should succeed");
        }
    }

    #[test]
    fn test_disconnected_queue_returns_buffer() {
        let (producer, pool, rx) = producer(2, 4);
        drop(rx);

        assert!(!producer.on_frame(&[1]));
        assert_eq!(pool.available(), 2);
        assert_eq!(producer.dropped_frames(), 1);
    }
}
