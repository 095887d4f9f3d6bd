use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;

use super::pool::BufferPool;

/// A byte region split into front headroom, data `[start, end)` and rear headroom.
///
/// Buffers obtained from a [`BufferPool`] return their storage on [`Buffer::release`] or on drop,
/// unless another holder still has a reference ([`Buffer::inc_ref`]) or the buffer was leaked.
pub struct Buffer {
    storage: Vec<u8>,
    start: usize,
    end: usize,
    capacity: usize,
    refs: AtomicI32,
    pool: Option<Arc<BufferPool>>,
}

impl Buffer {
    /// An unmanaged buffer with `capacity` bytes of storage.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity],
            start: 0,
            end: 0,
            capacity,
            refs: AtomicI32::new(0),
            pool: None,
        }
    }

    pub(super) fn from_pool(storage: Vec<u8>, capacity: usize, pool: Arc<BufferPool>) -> Self {
        debug_assert!(storage.len() >= capacity);
        Self {
            storage,
            start: 0,
            end: 0,
            capacity,
            refs: AtomicI32::new(0),
            pool: Some(pool),
        }
    }

    /// An unmanaged buffer holding exactly `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            storage: data,
            start: 0,
            end: len,
            capacity: len,
            refs: AtomicI32::new(0),
            pool: None,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.end == self.capacity
    }

    /// Space available before the data for headers.
    pub fn front_headroom(&self) -> usize {
        self.start
    }

    /// Space available after the data.
    pub fn free_len(&self) -> usize {
        self.capacity - self.end
    }

    /// The unused region after the data. Fill it and call [`Buffer::truncate_extend`].
    pub fn free_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.end..self.capacity]
    }

    /// Marks `n` bytes of the free region as data and returns them.
    pub fn extend(&mut self, n: usize) -> &mut [u8] {
        assert!(
            n <= self.free_len(),
            "buffer overflow: extend {n} with {} free",
            self.free_len()
        );
        let old_end = self.end;
        self.end += n;
        &mut self.storage[old_end..self.end]
    }

    /// Records that `n` bytes were written into the slice returned by `free_bytes_mut`.
    pub fn truncate_extend(&mut self, n: usize) {
        self.extend(n);
    }

    /// Appends as much of `data` as fits, returning the number of bytes copied.
    pub fn write_slice(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free_len());
        self.storage[self.end..self.end + n].copy_from_slice(&data[..n]);
        self.end += n;
        n
    }

    pub fn write_u8(&mut self, value: u8) {
        self.extend(1)[0] = value;
    }

    pub fn write_u16_be(&mut self, value: u16) {
        self.extend(2).copy_from_slice(&value.to_be_bytes());
    }

    /// Moves the start backward by `n` and returns the new prefix for in-place header writes.
    ///
    /// Panics if less than `n` bytes of front headroom exist. Writers announce their needs
    /// through `front_headroom()` so callers can allocate enough up front.
    pub fn extend_header(&mut self, n: usize) -> &mut [u8] {
        assert!(
            n <= self.start,
            "buffer overflow: extend header {n} with {} headroom",
            self.start
        );
        self.start -= n;
        &mut self.storage[self.start..self.start + n]
    }

    /// Sets the data window to `[start, start + len)` without moving bytes.
    pub fn resize(&mut self, start: usize, len: usize) {
        assert!(
            start + len <= self.capacity,
            "buffer overflow: resize {start}+{len} over capacity {}",
            self.capacity
        );
        self.start = start;
        self.end = start + len;
    }

    /// Drops `n` bytes from the front of the data.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len(), "advance {n} over length {}", self.len());
        self.start += n;
    }

    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.end = self.start + len;
        }
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Ensures at least `n` bytes of unused rear capacity, growing the storage only when needed.
    pub fn reserve(&mut self, n: usize) {
        if self.free_len() >= n {
            return;
        }
        let required = self.end + n;
        if self.storage.len() >= required {
            self.capacity = required;
            return;
        }
        let mut grown = vec![0u8; required];
        grown[self.start..self.end].copy_from_slice(&self.storage[self.start..self.end]);
        let old = std::mem::replace(&mut self.storage, grown);
        self.capacity = required;
        // The grown storage is no longer a pool size class.
        if let Some(pool) = self.pool.take() {
            let _ = pool.put(old);
        }
    }

    /// Shrinks the usable capacity so the last `n` bytes stay untouched by writes.
    pub fn hold_rear(&mut self, n: usize) {
        assert!(n <= self.free_len());
        self.capacity -= n;
    }

    /// Gives back rear bytes held by `hold_rear`.
    pub fn release_rear(&mut self, n: usize) {
        assert!(self.capacity + n <= self.storage.len());
        self.capacity += n;
    }

    pub fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_ref(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "buffer reference count below zero");
    }

    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_managed(&self) -> bool {
        self.pool.is_some()
    }

    /// Returns the storage to the pool when no other reference is held. Returns false while
    /// references remain; the buffer then stays usable and must be released again later.
    pub fn release(&mut self) -> bool {
        if self.refs() > 0 {
            return false;
        }
        if let Some(pool) = self.pool.take() {
            let storage = std::mem::take(&mut self.storage);
            let _ = pool.put(storage);
        }
        self.capacity = 0;
        self.start = 0;
        self.end = 0;
        true
    }

    /// Removes the buffer from pool accounting. Used when ownership of the storage is unclear,
    /// for example after a failed partial write.
    pub fn leak(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.mark_leaked();
        }
    }

    /// Copies the data into a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    /// Converts the data into `Bytes`, taking the storage out of the pool.
    pub fn freeze(mut self) -> Bytes {
        self.leak();
        let storage = std::mem::take(&mut self.storage);
        let (start, end) = (self.start, self.end);
        Bytes::from(storage).slice(start..end)
    }

    /// Copies the data into a new buffer with the requested headroom.
    pub fn copy_with_headroom(&self, pool: &Arc<BufferPool>, front: usize, rear: usize) -> Buffer {
        let mut copy = pool.buffer_with_headroom(front, self.len(), rear);
        copy.write_slice(self.bytes());
        copy
    }
}

impl From<Bytes> for Buffer {
    fn from(bytes: Bytes) -> Self {
        Buffer::from_vec(Vec::from(bytes))
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("start", &self.start)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("managed", &self.is_managed())
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.pool.is_none() {
            return;
        }
        if self.refs() > 0 {
            // Another holder still claims the storage; it cannot go back to the pool.
            self.leak();
        } else {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariant(buffer: &Buffer) {
        assert!(buffer.start() <= buffer.start() + buffer.len());
        assert!(buffer.start() + buffer.len() <= buffer.capacity());
    }

    #[test]
    fn test_headroom_operations_keep_invariant() {
        let pool = BufferPool::new();
        let mut buffer = pool.buffer_with_headroom(8, 100, 16);
        assert_eq!(buffer.front_headroom(), 8);
        assert!(buffer.free_len() >= 116);
        assert_invariant(&buffer);

        buffer.write_slice(b"payload");
        assert_invariant(&buffer);

        let header = buffer.extend_header(4);
        header.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buffer.bytes(), b"\x01\x02\x03\x04payload");
        assert_eq!(buffer.front_headroom(), 4);
        assert_invariant(&buffer);

        buffer.resize(6, 5);
        assert_eq!(buffer.len(), 5);
        assert_invariant(&buffer);

        buffer.reserve(10_000);
        assert!(buffer.free_len() >= 10_000);
        assert_invariant(&buffer);
        assert_eq!(buffer.bytes(), &[3, 4, b'p', b'a', b'y']);
    }

    #[test]
    #[should_panic(expected = "buffer overflow")]
    fn test_extend_header_without_headroom_panics() {
        let mut buffer = Buffer::new(16);
        buffer.write_slice(b"abc");
        buffer.extend_header(1);
    }

    #[test]
    fn test_write_slice_stops_at_capacity() {
        let mut buffer = Buffer::new(4);
        assert_eq!(buffer.write_slice(b"abcdef"), 4);
        assert!(buffer.is_full());
        assert_eq!(buffer.bytes(), b"abcd");
    }

    #[test]
    fn test_release_with_held_reference() {
        let pool = BufferPool::new();
        let mut buffer = pool.buffer(512);
        buffer.write_slice(b"data");
        assert_eq!(pool.free_count(512), 0);

        buffer.inc_ref();
        assert!(!buffer.release());
        assert_eq!(pool.free_count(512), 0);
        assert_eq!(buffer.bytes(), b"data");

        buffer.dec_ref();
        assert!(buffer.release());
        assert_eq!(pool.free_count(512), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_drop_returns_to_pool() {
        let pool = BufferPool::new();
        {
            let _buffer = pool.buffer(100);
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.free_count(100), 1);
    }

    #[test]
    fn test_leak_removes_from_accounting() {
        let pool = BufferPool::new();
        let mut buffer = pool.buffer(100);
        buffer.leak();
        drop(buffer);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.leaked(), 1);
        assert_eq!(pool.free_count(100), 0);
    }

    #[test]
    fn test_hold_rear() {
        let mut buffer = Buffer::new(10);
        buffer.hold_rear(4);
        assert_eq!(buffer.write_slice(b"0123456789"), 6);
        buffer.release_rear(4);
        assert_eq!(buffer.free_len(), 4);
    }

    #[test]
    fn test_freeze() {
        let pool = BufferPool::new();
        let mut buffer = pool.buffer_with_headroom(4, 16, 0);
        buffer.write_slice(b"hello");
        let bytes = buffer.freeze();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(pool.leaked(), 1);
    }
}
