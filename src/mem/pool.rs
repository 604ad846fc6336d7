use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

// Size classes are powers of two; requests above the largest class fall
// through to the system allocator.
const MIN_CLASS_SHIFT: u32 = 6; // 64 bytes
const MAX_CLASS_SHIFT: u32 = 20; // 1 MiB
const MAX_FREE_PER_CLASS: usize = 64;

/// Allocation counters, exposed for the status endpoint.
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    pub gets: u64,
    pub reuses: u64,
    pub returns: u64,
    pub oversize: u64,
}

/// Recycling pool of byte buffers in power-of-two size classes.
///
/// `get` returns a cleared buffer with at least the requested capacity;
/// `put` hands it back for reuse. Buffers above the largest class are
/// allocated and dropped normally.
pub struct BlockPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    gets: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    oversize: AtomicU64,
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockPool {
    pub fn new() -> Self {
        let class_count = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;
        Self {
            classes: (0..class_count).map(|_| Mutex::new(Vec::new())).collect(),
            gets: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            oversize: AtomicU64::new(0),
        }
    }

    fn class_for(size: usize) -> Option<usize> {
        let bits = size.max(1).next_power_of_two().trailing_zeros();
        let shift = bits.max(MIN_CLASS_SHIFT);
        if shift > MAX_CLASS_SHIFT {
            None
        } else {
            Some((shift - MIN_CLASS_SHIFT) as usize)
        }
    }

    pub fn get(&self, size: usize) -> Vec<u8> {
        self.gets.fetch_add(1, Ordering::Relaxed);

        match Self::class_for(size) {
            Some(class) => {
                if let Some(mut buf) = self.classes[class].lock().pop() {
                    self.reuses.fetch_add(1, Ordering::Relaxed);
                    buf.clear();
                    return buf;
                }
                Vec::with_capacity(1usize << (class as u32 + MIN_CLASS_SHIFT))
            }
            None => {
                self.oversize.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(size)
            }
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        if let Some(class) = Self::class_for(buf.capacity()) {
            // only recycle buffers that actually fit their class
            if buf.capacity() >= 1usize << (class as u32 + MIN_CLASS_SHIFT) {
                let mut free = self.classes[class].lock();
                if free.len() < MAX_FREE_PER_CLASS {
                    self.returns.fetch_add(1, Ordering::Relaxed);
                    free.push(buf);
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            gets: self.gets.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_reuses_buffer() {
        let pool = BlockPool::new();
        let mut buf = pool.get(100);
        buf.extend_from_slice(&[1, 2, 3]);
        pool.put(buf);

        let again = pool.get(100);
        assert!(again.is_empty());
        assert!(again.capacity() >= 100);
        assert_eq!(pool.stats().reuses, 1);
    }

    #[test]
    fn test_oversize_falls_through() {
        let pool = BlockPool::new();
        let buf = pool.get(4 * 1024 * 1024);
        assert!(buf.capacity() >= 4 * 1024 * 1024);
        assert_eq!(pool.stats().oversize, 1);
    }
}
