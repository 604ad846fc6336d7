use crate::common::hash_str;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Per-partition text interning dictionary: value hash -> string.
///
/// Bitmaps and result keys carry only the hash; the blob resolves it back
/// on emit. Insertion takes the guard; readers work from returned clones
/// so no reference escapes the lock.
#[derive(Default)]
pub struct AttributeBlob {
    values: Mutex<HashMap<i64, String>>,
}

impl AttributeBlob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_make(&self, text: &str) -> i64 {
        let hash = hash_str(text);
        let mut values = self.values.lock();
        values.entry(hash).or_insert_with(|| text.to_string());
        hash
    }

    pub fn get(&self, hash: i64) -> Option<String> {
        self.values.lock().get(&hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    pub fn dump(&self) -> Vec<(i64, String)> {
        self.values
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn merge(&self, entries: Vec<(i64, String)>) {
        let mut values = self.values.lock();
        for (hash, text) in entries {
            values.entry(hash).or_insert(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_dedupes() {
        let blob = AttributeBlob::new();
        let a = blob.get_make("mango");
        let b = blob.get_make("mango");
        assert_eq!(a, b);
        assert_eq!(blob.len(), 1);
        assert_eq!(blob.get(a).as_deref(), Some("mango"));
    }
}
