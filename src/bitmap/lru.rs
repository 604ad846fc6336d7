use std::collections::HashMap;

/// LRU bookkeeping for hot attribute bitmaps.
///
/// Tracks `(property_id, value_hash)` keys by last touch; `insert`
/// returns the evicted key when over capacity so the attribute store can
/// recompress that record.
pub struct IndexLru {
    ticks: HashMap<(u32, i64), u64>,
    tick: u64,
    capacity: usize,
}

impl IndexLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            ticks: HashMap::new(),
            tick: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn touch(&mut self, property: u32, value_hash: i64) {
        self.tick += 1;
        if let Some(entry) = self.ticks.get_mut(&(property, value_hash)) {
            *entry = self.tick;
        }
    }

    pub fn insert(&mut self, property: u32, value_hash: i64) -> Option<(u32, i64)> {
        self.tick += 1;
        self.ticks.insert((property, value_hash), self.tick);

        if self.ticks.len() <= self.capacity {
            return None;
        }
        let oldest = self
            .ticks
            .iter()
            .min_by_key(|(_, tick)| **tick)
            .map(|(key, _)| *key)?;
        self.ticks.remove(&oldest);
        Some(oldest)
    }

    pub fn remove(&mut self, property: u32, value_hash: i64) {
        self.ticks.remove(&(property, value_hash));
    }

    pub fn contains(&self, property: u32, value_hash: i64) -> bool {
        self.ticks.contains_key(&(property, value_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_returns_least_recent() {
        let mut lru = IndexLru::new(2);
        assert_eq!(lru.insert(1, 10), None);
        assert_eq!(lru.insert(1, 20), None);
        lru.touch(1, 10); // 20 is now the oldest
        assert_eq!(lru.insert(1, 30), Some((1, 20)));
        assert!(lru.contains(1, 10));
        assert!(lru.contains(1, 30));
    }
}
