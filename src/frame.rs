//! Captured frames and the buffers behind them.
//!
//! - `Frame`: one encoded image owned by whoever acquired it, until it is
//!   handed back to its source with `FrameSource::release_frame`.
//! - `BufferPool`: bounded set of retained buffers reused across captures.
//!   Memory recovery empties it.

use parking_lot::Mutex;
use std::time::{Instant, SystemTime};

/// One encoded image from the sensor.
///
/// Deliberately not `Clone`: a frame is a large transient value and there is
/// exactly one owner at a time.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
    /// Monotonic capture instant.
    acquired: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: SystemTime::now(),
            acquired: Instant::now(),
        }
    }

    /// Encoded payload to persist.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time since acquisition.
    pub fn held_for_ms(&self) -> u128 {
        self.acquired.elapsed().as_millis()
    }

    /// Give the buffer back, for return to a pool.
    pub fn into_buffer(self) -> Vec<u8> {
        self.data
    }
}

/// Retained frame buffers.
///
/// Sources draw buffers with `take` and return them with `give`. At most
/// `max_retained` buffers are kept; extra buffers are freed on return.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_retained: usize,
}

impl BufferPool {
    pub fn new(max_retained: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_retained)),
            max_retained,
        }
    }

    /// An empty buffer with at least `capacity` bytes reserved.
    pub fn take(&self, capacity: usize) -> Vec<u8> {
        let reused = self.buffers.lock().pop();
        match reused {
            Some(mut buf) => {
                buf.clear();
                buf.reserve(capacity);
                buf
            }
            None => Vec::with_capacity(capacity),
        }
    }

    pub fn give(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_retained {
            buffers.push(buf);
        }
    }

    /// Free every retained buffer. Returns the number of bytes released.
    pub fn shrink(&self) -> usize {
        let drained: Vec<Vec<u8>> = std::mem::take(&mut *self.buffers.lock());
        drained.iter().map(|buf| buf.capacity()).sum()
    }

    pub fn retained(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Memory usage estimate.
    pub fn retained_bytes(&self) -> usize {
        self.buffers.lock().iter().map(|buf| buf.capacity()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_returned_buffers() {
        let pool = BufferPool::new(2);
        let mut buf = pool.take(1024);
        buf.extend_from_slice(b"jpeg");
        pool.give(buf);
        assert_eq!(pool.retained(), 1);

        let reused = pool.take(16);
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 1024);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn pool_enforces_retention_cap() {
        let pool = BufferPool::new(1);
        pool.give(vec![0u8; 8]);
        pool.give(vec![0u8; 8]);
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn shrink_releases_everything() {
        let pool = BufferPool::new(4);
        pool.give(Vec::with_capacity(100));
        pool.give(Vec::with_capacity(200));
        let released = pool.shrink();
        assert!(released >= 300);
        assert_eq!(pool.retained(), 0);
        assert_eq!(pool.retained_bytes(), 0);
    }

    #[test]
    fn frame_hands_back_its_buffer() {
        let frame = Frame::new(vec![1, 2, 3], 2, 2);
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.bytes(), &[1, 2, 3]);
        assert_eq!(frame.into_buffer(), vec![1, 2, 3]);
    }
}
