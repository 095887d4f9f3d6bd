//! Size-classed free lists for byte vectors.
//!
//! Sizes are rounded up to the next power of two between 64 bytes and 64 KiB. Larger requests are
//! served by plain allocations that are never pooled. Memory handed out by `get` is not zeroed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::buffer::Buffer;

const MIN_CLASS_SHIFT: u32 = 6;
const MAX_CLASS_SHIFT: u32 = 16;
const NUM_CLASSES: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;
const MAX_FREE_PER_CLASS: usize = 512;

pub const MAX_POOLED_SIZE: usize = 1 << MAX_CLASS_SHIFT;

#[derive(Debug)]
pub struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; NUM_CLASSES],
    outstanding: AtomicUsize,
    leaked: AtomicUsize,
    low_memory: AtomicBool,
}

fn class_index(size: usize) -> Option<usize> {
    if size > MAX_POOLED_SIZE {
        return None;
    }
    let size = size.max(1 << MIN_CLASS_SHIFT);
    let shift = usize::BITS - (size - 1).leading_zeros();
    Some((shift - MIN_CLASS_SHIFT) as usize)
}

fn class_size(index: usize) -> usize {
    1 << (index as u32 + MIN_CLASS_SHIFT)
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
            outstanding: AtomicUsize::new(0),
            leaked: AtomicUsize::new(0),
            low_memory: AtomicBool::new(false),
        })
    }

    /// Returns a vector of exactly `size` bytes whose capacity is the size class.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let Some(index) = class_index(size) else {
            return vec![0u8; size];
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let mut vec = self.classes[index]
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; class_size(index)]);
        vec.truncate(size);
        vec
    }

    /// Returns a vector obtained from `get`. The vector is filed under the largest class its
    /// capacity covers; capacities outside the class range are rejected.
    pub fn put(&self, mut vec: Vec<u8>) -> std::io::Result<()> {
        let capacity = vec.capacity();
        if !(1 << MIN_CLASS_SHIFT..=MAX_POOLED_SIZE).contains(&capacity) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("buffer capacity {capacity} does not belong to the pool"),
            ));
        }
        let index = (usize::BITS - 1 - capacity.leading_zeros() - MIN_CLASS_SHIFT) as usize;
        self.release_outstanding();
        vec.resize(capacity, 0);
        let mut free = self.classes[index].lock();
        if free.len() < MAX_FREE_PER_CLASS {
            free.push(vec);
        }
        Ok(())
    }

    /// A managed buffer of `size` bytes, empty, starting at offset 0.
    pub fn buffer(self: &Arc<Self>, size: usize) -> Buffer {
        if size > MAX_POOLED_SIZE {
            return Buffer::new(size);
        }
        let storage = self.get(size);
        Buffer::from_pool(storage, size, self.clone())
    }

    /// A managed buffer with `front` bytes of headroom before the data and `rear` bytes after
    /// `size`.
    pub fn buffer_with_headroom(self: &Arc<Self>, front: usize, size: usize, rear: usize) -> Buffer {
        let mut buffer = self.buffer(front + size + rear);
        buffer.resize(front, 0);
        buffer.reserve(rear);
        buffer
    }

    fn release_outstanding(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub(super) fn mark_leaked(&self) {
        self.release_outstanding();
        self.leaked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn leaked(&self) -> usize {
        self.leaked.load(Ordering::Relaxed)
    }

    pub fn free_count(&self, size: usize) -> usize {
        match class_index(size) {
            Some(index) => self.classes[index].lock().len(),
            None => 0,
        }
    }

    pub fn set_low_memory(&self, low_memory: bool) {
        self.low_memory.store(low_memory, Ordering::Relaxed);
    }

    pub fn is_low_memory(&self) -> bool {
        self.low_memory.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_index() {
        assert_eq!(class_index(1), Some(0));
        assert_eq!(class_index(64), Some(0));
        assert_eq!(class_index(65), Some(1));
        assert_eq!(class_index(MAX_POOLED_SIZE), Some(NUM_CLASSES - 1));
        assert_eq!(class_index(MAX_POOLED_SIZE + 1), None);
    }

    #[test]
    fn test_get_put_reuses_storage() {
        let pool = BufferPool::new();
        let vec = pool.get(1000);
        assert_eq!(vec.len(), 1000);
        assert_eq!(vec.capacity(), 1024);
        let ptr = vec.as_ptr();
        pool.put(vec).unwrap();
        assert_eq!(pool.free_count(1000), 1);
        assert_eq!(pool.outstanding(), 0);

        let vec = pool.get(700);
        assert_eq!(vec.as_ptr(), ptr);
        assert_eq!(vec.len(), 700);
        pool.put(vec).unwrap();
    }

    #[test]
    fn test_put_rejects_foreign_vec() {
        let pool = BufferPool::new();
        assert!(pool.put(Vec::with_capacity(10)).is_err());
        assert!(pool.put(Vec::with_capacity(MAX_POOLED_SIZE * 4)).is_err());
    }

    #[test]
    fn test_oversized_not_pooled() {
        let pool = BufferPool::new();
        let vec = pool.get(MAX_POOLED_SIZE * 2);
        assert_eq!(vec.len(), MAX_POOLED_SIZE * 2);
        assert_eq!(pool.outstanding(), 0);
    }
}
