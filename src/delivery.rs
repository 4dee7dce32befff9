//! Callback queue and the delivery thread.
//!
//! Application callbacks run here and nowhere else, so slow application
//! code can only delay delivery, never the producer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::command::FrameCallback;
use crate::pool::{BufferHandle, FramePool};
use crate::traits::FrameMetadata;

/// Application callback shared between the producer and queued descriptors.
pub(crate) type SharedCallback = Arc<Mutex<FrameCallback>>;

/// A produced frame waiting for delivery.
pub struct FrameDescriptor {
    handle: BufferHandle,
    callback: SharedCallback,
    metadata: FrameMetadata,
}

impl FrameDescriptor {
    pub(crate) const fn new(
        handle: BufferHandle,
        callback: SharedCallback,
        metadata: FrameMetadata,
    ) -> Self {
        Self {
            handle,
            callback,
            metadata,
        }
    }

    /// Pool slot holding the frame.
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.handle.index()
    }

    /// Valid frame bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.handle.as_slice()
    }

    /// Capture metadata.
    #[must_use]
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub(crate) fn into_handle(self) -> BufferHandle {
        self.handle
    }
}

/// Message accepted by the delivery thread.
pub(crate) enum DeliveryMsg {
    Frame(FrameDescriptor),
    Shutdown,
}

/// Drains the callback queue on a dedicated thread.
pub(crate) struct DeliveryTask {
    queue: Receiver<DeliveryMsg>,
    pool: FramePool,
    stop: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
}

impl DeliveryTask {
    pub(crate) const fn new(
        queue: Receiver<DeliveryMsg>,
        pool: FramePool,
        stop: Arc<AtomicBool>,
        delivered: Arc<AtomicU64>,
    ) -> Self {
        Self {
            queue,
            pool,
            stop,
            delivered,
        }
    }

    /// Deliver frames in FIFO order until shutdown, then release whatever
    /// is still queued without invoking the callback.
    pub(crate) fn run(self) {
        debug!("delivery thread started");

        while let Ok(DeliveryMsg::Frame(descriptor)) = self.queue.recv() {
            if self.stop.load(Ordering::Acquire) {
                self.release(descriptor.into_handle());
            } else {
                self.deliver(descriptor);
            }
        }

        let mut discarded = 0usize;
        for msg in self.queue.try_iter() {
            if let DeliveryMsg::Frame(descriptor) = msg {
                self.release(descriptor.into_handle());
                discarded += 1;
            }
        }

        debug!(discarded, "delivery thread stopped");
    }

    fn deliver(&self, descriptor: FrameDescriptor) {
        let FrameDescriptor {
            handle,
            callback,
            metadata,
        } = descriptor;

        let outcome = {
            let mut callback = callback.lock();
            panic::catch_unwind(AssertUnwindSafe(|| {
                (*callback)(handle.as_slice(), &metadata);
            }))
        };

        if outcome.is_err() {
            error!(sequence = metadata.sequence, "frame callback panicked");
        } else {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }

        self.release(handle);
    }

    fn release(&self, handle: BufferHandle) {
        if let Err(err) = self.pool.release(handle) {
            warn!(error = %err, "failed to return delivered buffer");
        }
    }
}
