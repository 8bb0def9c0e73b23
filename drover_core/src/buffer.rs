//! Pooled byte buffers ("mbufs").
//!
//! Cached responses are written to the client in one shot. When header plus
//! body fit in a single fixed-size buffer the write comes straight out of
//! this slab pool; larger responses fall back to a request-scoped `BytesMut`
//! sized exactly for the payload. Buffers are recycled rather than freed so
//! a busy controller reaches a steady state with no allocation on the cache
//! hit path.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Default capacity of one pooled buffer.
pub const MBUF_SIZE: usize = 16 * 1024;

pub struct MbufPool {
    chunk_size: usize,
    max_free: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl MbufPool {
    pub fn new(chunk_size: usize, max_free: usize) -> Self {
        Self {
            chunk_size,
            max_free,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Capacity of the buffers handed out by this pool.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Takes an empty buffer from the pool, allocating one only when the
    /// free list is empty.
    pub fn get(&self) -> BytesMut {
        let mut free = self.free.lock();
        match free.pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(self.chunk_size),
        }
    }

    /// Returns a buffer to the free list. Buffers beyond `max_free`, or
    /// buffers that grew past the pool's chunk size, are dropped instead.
    pub fn recycle(&self, mut buf: BytesMut) {
        if buf.capacity() < self.chunk_size {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(buf);
        }
    }

    /// Freezes `buf` for writing and recycles nothing: the returned `Bytes`
    /// is refcounted, and its storage returns to the allocator when the last
    /// clone drops.
    pub fn freeze(buf: BytesMut) -> Bytes {
        buf.freeze()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for MbufPool {
    fn default() -> Self {
        Self::new(MBUF_SIZE, 64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reuses_recycled_buffers() {
        let pool = MbufPool::new(128, 4);
        let mut buf = pool.get();
        buf.extend_from_slice(b"hello");
        pool.recycle(buf);
        assert_eq!(pool.free_count(), 1);
        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 128);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn bounded_free_list() {
        let pool = MbufPool::new(64, 2);
        let bufs: Vec<_> = (0..4).map(|_| pool.get()).collect();
        for buf in bufs {
            pool.recycle(buf);
        }
        assert_eq!(pool.free_count(), 2);
    }
}
