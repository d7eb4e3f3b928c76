//! Bounded pool of reusable write buffers.

use bytes::BytesMut;
use parking_lot::Mutex;

/// Fixed number of write buffers shared by every writer of one file.
///
/// Buffers are allocated lazily up to the pool capacity and recycled on
/// release. An empty pool signals back-pressure to the network side.
#[derive(Debug)]
pub struct BufferPool {
    state: Mutex<PoolState>,
    buffer_size: usize,
}

#[derive(Debug)]
struct PoolState {
    free: Vec<BytesMut>,
    allocated: usize,
    capacity: usize,
}

impl BufferPool {
    /// Creates pool of `capacity` buffers of `buffer_size` bytes each.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(capacity),
                allocated: 0,
                capacity: capacity.max(1),
            }),
            buffer_size,
        }
    }

    /// Takes a cleared buffer, or None if every buffer is in use.
    pub fn acquire_write_buffer(&self) -> Option<BytesMut> {
        let mut state = self.state.lock();
        if let Some(mut buffer) = state.free.pop() {
            buffer.clear();
            return Some(buffer);
        }
        if state.allocated < state.capacity {
            state.allocated += 1;
            return Some(BytesMut::with_capacity(self.buffer_size));
        }
        None
    }

    /// Returns a buffer to the pool.
    pub fn release(&self, buffer: BytesMut) {
        let mut state = self.state.lock();
        if state.free.len() < state.capacity {
            state.free.push(buffer);
        }
    }

    /// Buffers that can be acquired right now.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.free.len() + (state.capacity - state.allocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_and_recycle() {
        let pool = BufferPool::new(2, 16);

        let first = pool.acquire_write_buffer().unwrap();
        let _second = pool.acquire_write_buffer().unwrap();
        assert!(pool.acquire_write_buffer().is_none());
        assert_eq!(pool.available(), 0);

        pool.release(first);
        assert_eq!(pool.available(), 1);
        let recycled = pool.acquire_write_buffer().unwrap();
        assert!(recycled.is_empty());
        assert!(recycled.capacity() >= 16);
    }
}
