//! Pooled scratch buffers for frame serialization.
//!
//! The writer task checks a buffer out, serializes one frame into it,
//! writes it to the transport, and checks it back in. Buffers are sized to
//! the frame header plus the current max-frame-size; when the peer changes
//! MAX_FRAME_SIZE, undersized buffers are retired on checkin.
//!
//! Not thread-safe: the pool is owned by the single writer task.

use bytes::BytesMut;

use crate::frame::FRAME_HEADER_SIZE;

/// Upper bound on buffers retained between frames.
const MAX_POOLED: usize = 8;

pub(crate) struct BufferPool {
    free: Vec<BytesMut>,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `FRAME_HEADER_SIZE + max_frame_size`.
    pub(crate) fn new(max_frame_size: u32) -> Self {
        Self {
            free: Vec::with_capacity(MAX_POOLED),
            capacity: FRAME_HEADER_SIZE + max_frame_size as usize,
        }
    }

    /// Resize future checkouts. Already-pooled buffers that are now too
    /// small are dropped lazily on checkin.
    pub(crate) fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.capacity = FRAME_HEADER_SIZE + max_frame_size as usize;
        self.free.retain(|b| b.capacity() >= self.capacity);
    }

    /// Check out an empty buffer with at least the pool capacity reserved.
    pub(crate) fn checkout(&mut self) -> BytesMut {
        match self.free.pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(self.capacity),
        }
    }

    /// Return a buffer to the pool. Oversubscribed or undersized buffers
    /// are dropped.
    pub(crate) fn checkin(&mut self, mut buf: BytesMut) {
        if self.free.len() >= MAX_POOLED || buf.capacity() < self.capacity {
            return;
        }
        buf.clear();
        self.free.push(buf);
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.len()
    }
}
