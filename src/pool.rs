//! Fixed-size pool of frame buffers.
//!
//! The pool owns `N` byte buffers allocated once when the session opens.
//! [`FramePool::claim_next`] moves a buffer out of its slot into a
//! [`BufferHandle`]; [`FramePool::release`] moves it back. A slot that has
//! been claimed is empty until its handle returns, so a slot can never be
//! claimed twice while in flight.
//!
//! Claiming never blocks. An exhausted pool returns `None` and the caller
//! drops the frame.
//!
//! After [`FramePool::close`] the pool frees every idle buffer and refuses
//! further claims. Handles still in flight own their buffer, so a producer
//! racing with shutdown keeps writing into memory it owns; releasing such a
//! handle afterwards simply frees the buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolState {
    /// `None` while the slot's buffer is claimed.
    slots: Vec<Option<Vec<u8>>>,
    /// Slot the next claim starts from.
    next: usize,
    /// Buffers currently available to the producer.
    available: usize,
    closed: bool,
    total_claims: u64,
    total_releases: u64,
}

struct PoolInner {
    id: u64,
    buffer_len: usize,
    buffer_count: usize,
    state: Mutex<PoolState>,
}

/// Pool of pre-allocated frame buffers shared by producer and delivery.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Allocate `buffer_count` buffers of `buffer_len` bytes each.
    ///
    /// Fails with [`SessionError::MemAlloc`] when either size is zero or an
    /// allocation cannot be satisfied.
    pub fn new(buffer_count: usize, buffer_len: usize) -> Result<Self> {
        if buffer_count == 0 {
            return Err(SessionError::MemAlloc("pool needs at least one buffer".to_owned()));
        }
        if buffer_len == 0 {
            return Err(SessionError::MemAlloc("buffer length must be non-zero".to_owned()));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(buffer_count)
            .map_err(|err| SessionError::MemAlloc(err.to_string()))?;

        for _ in 0..buffer_count {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(buffer_len)
                .map_err(|err| SessionError::MemAlloc(err.to_string()))?;
            buffer.resize(buffer_len, 0);
            slots.push(Some(buffer));
        }

        info!(buffer_count, buffer_len, "frame pool allocated");

        Ok(Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                buffer_len,
                buffer_count,
                state: Mutex::new(PoolState {
                    slots,
                    next: 0,
                    available: buffer_count,
                    closed: false,
                    total_claims: 0,
                    total_releases: 0,
                }),
            }),
        })
    }

    /// Claim the next free buffer, or `None` if the pool is exhausted or closed.
    ///
    /// With buffers released in delivery order the claimed slot is always
    /// `next`, so the index advances by exactly one per claim.
    #[must_use]
    pub fn claim_next(&self) -> Option<BufferHandle> {
        let mut state = self.inner.state.lock();
        if state.closed || state.available == 0 {
            return None;
        }

        let count = self.inner.buffer_count;
        let start = state.next;
        let (index, buffer) = (0..count).find_map(|offset| {
            let index = (start + offset) % count;
            state
                .slots
                .get_mut(index)
                .and_then(Option::take)
                .map(|buffer| (index, buffer))
        })?;

        state.next = (index + 1) % count;
        state.available -= 1;
        state.total_claims += 1;

        Some(BufferHandle {
            pool_id: self.inner.id,
            index,
            buffer,
            len: 0,
        })
    }

    /// Return a claimed buffer to its slot.
    ///
    /// Handles from another pool are rejected. After [`FramePool::close`]
    /// the buffer is freed instead of being stored.
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        if handle.pool_id != self.inner.id {
            return Err(SessionError::ForeignBuffer(handle.index));
        }

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.closed {
            debug!(slot = handle.index, "buffer released after pool close");
            return Ok(());
        }

        let BufferHandle { index, buffer, .. } = handle;
        match state.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(buffer);
                state.available += 1;
                state.total_releases += 1;
                Ok(())
            }
            _ => {
                warn!(slot = index, "rejected release of an occupied slot");
                Err(SessionError::ForeignBuffer(index))
            }
        }
    }

    /// Free every idle buffer and refuse further claims.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let in_flight = self.inner.buffer_count - state.available;
        state.slots.iter_mut().for_each(|slot| *slot = None);
        state.available = 0;
        debug!(in_flight, "frame pool closed");
    }

    /// Number of buffers available to the producer.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Number of buffers claimed and not yet released.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let state = self.inner.state.lock();
        if state.closed {
            0
        } else {
            self.inner.buffer_count - state.available
        }
    }

    /// Total number of buffers in the pool.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.inner.buffer_count
    }

    /// Capacity of each buffer in bytes.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.inner.buffer_len
    }

    /// Index of the slot the next claim starts from.
    #[must_use]
    pub fn next_index(&self) -> usize {
        self.inner.state.lock().next
    }

    /// Whether the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Total number of successful claims since the pool was created.
    #[must_use]
    pub fn total_claims(&self) -> u64 {
        self.inner.state.lock().total_claims
    }

    /// Total number of releases since the pool was created.
    #[must_use]
    pub fn total_releases(&self) -> u64 {
        self.inner.state.lock().total_releases
    }
}

/// A buffer moved out of the pool.
///
/// The handle owns its memory until it is passed back to
/// [`FramePool::release`]. Dropping it instead permanently shrinks the pool,
/// which shows up as [`FramePool::in_flight`] never returning to zero.
#[must_use = "a buffer handle must be released back to its pool"]
#[derive(Debug)]
pub struct BufferHandle {
    pool_id: u64,
    index: usize,
    buffer: Vec<u8>,
    len: usize,
}

impl BufferHandle {
    /// Slot index this buffer belongs to.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Full capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes of valid data.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no data has been written.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Valid data.
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.get(..self.len).unwrap_or_default()
    }

    /// Whole buffer for writing; follow with [`BufferHandle::set_len`].
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Set the number of valid bytes, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buffer.len());
    }

    /// Copy at most `capacity` bytes of `payload`, returning the count copied.
    pub fn copy_from(&mut self, payload: &[u8]) -> usize {
        let len = payload.len().min(self.buffer.len());
        if let (Some(dst), Some(src)) = (self.buffer.get_mut(..len), payload.get(..len)) {
            dst.copy_from_slice(src);
        }
        self.len = len;
        len
    }
}
