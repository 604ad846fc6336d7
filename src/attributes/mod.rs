// The per-partition attribute index.
//
// Two-level map (property_id -> value_hash -> cell), each cell owning a
// customer bitmap. Cells hold an LZ4 stored form and decompress lazily on
// access; an LRU bounds how many stay hot. The value_hash doubles as the
// comparable value for int/bool (the value itself), double (scaled) and
// text (dictionary hash), which is what makes the comparison-mode scans
// below possible without touching row data.

mod blob;

pub use blob::AttributeBlob;

use crate::bitmap::{IndexBits, IndexLru};
use crate::common::NONE;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const HOT_INDEX_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Present,
}

#[derive(Default)]
struct AttrRecord {
    stored: Option<Vec<u8>>,
    hot: Option<IndexBits>,
}

/// Serialized form of the whole store, used for replica transfer and
/// at-rest persistence.
#[derive(Serialize, Deserialize)]
pub struct AttributesTransfer {
    pub cells: Vec<(u32, i64, Vec<u8>)>,
    pub text: Vec<(i64, String)>,
}

pub struct Attributes {
    partition: usize,
    props: HashMap<u32, HashMap<i64, AttrRecord>>,
    blob: Arc<AttributeBlob>,
    lru: IndexLru,
    dirty: HashSet<(u32, i64)>,
}

impl Attributes {
    pub fn new(partition: usize, blob: Arc<AttributeBlob>) -> Self {
        Self {
            partition,
            props: HashMap::new(),
            blob,
            lru: IndexLru::new(HOT_INDEX_CAPACITY),
            dirty: HashSet::new(),
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn blob(&self) -> &Arc<AttributeBlob> {
        &self.blob
    }

    /// Intern a text value and return its hash.
    pub fn intern(&self, text: &str) -> i64 {
        self.blob.get_make(text)
    }

    fn record_mut(&mut self, property: u32, value_hash: i64) -> &mut AttrRecord {
        self.props
            .entry(property)
            .or_default()
            .entry(value_hash)
            .or_default()
    }

    fn make_hot(record: &mut AttrRecord) -> Result<&mut IndexBits> {
        if record.hot.is_none() {
            let mut bits = IndexBits::new();
            if let Some(stored) = &record.stored {
                bits.mount(stored)?;
            }
            record.hot = Some(bits);
        }
        Ok(record.hot.as_mut().unwrap())
    }

    fn evict(&mut self, key: (u32, i64)) {
        if let Some(record) = self
            .props
            .get_mut(&key.0)
            .and_then(|values| values.get_mut(&key.1))
        {
            if let Some(mut hot) = record.hot.take() {
                if hot.is_dirty() || record.stored.is_none() {
                    record.stored = Some(hot.store());
                }
            }
        }
    }

    /// Set or clear one customer's bit in the cell for (property, value).
    /// Creates the cell on first set.
    pub fn set(
        &mut self,
        property: u32,
        value_hash: i64,
        linear_id: usize,
        state: bool,
    ) -> Result<()> {
        let evicted = if self.lru.contains(property, value_hash) {
            self.lru.touch(property, value_hash);
            None
        } else {
            self.lru.insert(property, value_hash)
        };
        if let Some(key) = evicted {
            self.evict(key);
        }

        let record = self.record_mut(property, value_hash);
        let bits = Self::make_hot(record)?;
        if state {
            bits.bit_set(linear_id);
        } else {
            bits.bit_clear(linear_id);
        }
        self.dirty.insert((property, value_hash));
        Ok(())
    }

    /// A customer property changed value: move the bit between cells.
    pub fn swap_state(
        &mut self,
        property: u32,
        old_hash: i64,
        new_hash: i64,
        linear_id: usize,
    ) -> Result<()> {
        if old_hash != NONE && old_hash != new_hash {
            self.set(property, old_hash, linear_id, false)?;
        }
        if new_hash != NONE {
            self.set(property, new_hash, linear_id, true)?;
        }
        Ok(())
    }

    /// Decompress-on-demand copy of the bitmap for (property, value).
    /// Returns an empty bitmap for cells that do not exist.
    pub fn get_bits(&mut self, property: u32, value_hash: i64) -> Result<IndexBits> {
        let evicted = if self.lru.contains(property, value_hash) {
            self.lru.touch(property, value_hash);
            None
        } else if self
            .props
            .get(&property)
            .map(|v| v.contains_key(&value_hash))
            .unwrap_or(false)
        {
            self.lru.insert(property, value_hash)
        } else {
            return Ok(IndexBits::new());
        };
        if let Some(key) = evicted {
            self.evict(key);
        }

        let record = self.record_mut(property, value_hash);
        Ok(Self::make_hot(record)?.clone())
    }

    /// Mutate a cell's bitmap in place; used by the segment engine which
    /// owns the SEGMENT property cells.
    pub fn with_bits_mut<R>(
        &mut self,
        property: u32,
        value_hash: i64,
        apply: impl FnOnce(&mut IndexBits) -> R,
    ) -> Result<R> {
        let record = self.record_mut(property, value_hash);
        let bits = Self::make_hot(record)?;
        let out = apply(bits);
        self.dirty.insert((property, value_hash));
        Ok(out)
    }

    /// All live value hashes for a property.
    pub fn get_property_values(&self, property: u32) -> Vec<i64> {
        self.props
            .get(&property)
            .map(|values| values.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Value hashes for a property whose comparable value satisfies the
    /// mode against `value`. Valid for numeric-keyed properties; text
    /// supports Eq/Neq/Present only (callers enforce via the schema).
    pub fn matching_values(&self, property: u32, mode: ListMode, value: i64) -> Vec<i64> {
        let Some(values) = self.props.get(&property) else {
            return Vec::new();
        };
        values
            .keys()
            .copied()
            .filter(|&candidate| match mode {
                ListMode::Eq => candidate == value,
                ListMode::Neq => candidate != value,
                ListMode::Gt => candidate > value,
                ListMode::Gte => candidate >= value,
                ListMode::Lt => candidate < value,
                ListMode::Lte => candidate <= value,
                ListMode::Present => true,
            })
            .collect()
    }

    /// Composite evaluation for the index planner: OR the bitmaps of every
    /// matching cell, with the NONE/negation rules:
    ///
    ///   EQ NONE   -> not PRESENT (customer has no value for property)
    ///   NEQ NONE  -> PRESENT
    ///   NEQ value -> not (EQ value)
    ///
    /// The union is grown to the stop bit before any negation so NOT
    /// covers every customer.
    pub fn composite_bits(
        &mut self,
        property: u32,
        mode: ListMode,
        value: i64,
        stop_bit: usize,
    ) -> Result<IndexBits> {
        let (scan_mode, negate) = match (mode, value) {
            (ListMode::Eq, NONE) => (ListMode::Present, true),
            (ListMode::Neq, NONE) => (ListMode::Present, false),
            (ListMode::Neq, _) => (ListMode::Eq, true),
            (m, _) => (m, false),
        };

        let matches = self.matching_values(property, scan_mode, value);

        let mut result = IndexBits::new();
        let mut initialized = false;
        for value_hash in matches {
            let work = self.get_bits(property, value_hash)?;
            if initialized {
                result.op_or(&work);
            } else {
                result.op_copy(&work);
                initialized = true;
            }
        }
        if !initialized {
            result.make_bits(64, false);
        }

        if negate {
            result.grow(stop_bit / 64 + 1);
            result.op_not();
        }
        Ok(result)
    }

    /// Commit mutations accumulated during a slice: refresh the stored
    /// form of every dirty cell.
    pub fn clear_dirty(&mut self) {
        let keys: Vec<_> = self.dirty.drain().collect();
        for (property, value_hash) in keys {
            if let Some(record) = self
                .props
                .get_mut(&property)
                .and_then(|values| values.get_mut(&value_hash))
            {
                if let Some(hot) = record.hot.as_mut() {
                    record.stored = Some(hot.store());
                }
            }
        }
    }

    pub fn to_transfer(&mut self) -> AttributesTransfer {
        self.clear_dirty();
        let mut cells = Vec::new();
        for (&property, values) in &mut self.props {
            for (&value_hash, record) in values.iter_mut() {
                let stored = match (&record.stored, record.hot.as_mut()) {
                    (Some(stored), _) => stored.clone(),
                    (None, Some(hot)) => {
                        let bytes = hot.store();
                        record.stored = Some(bytes.clone());
                        bytes
                    }
                    (None, None) => continue,
                };
                cells.push((property, value_hash, stored));
            }
        }
        AttributesTransfer {
            cells,
            text: self.blob.dump(),
        }
    }

    pub fn from_transfer(&mut self, transfer: AttributesTransfer) {
        self.blob.merge(transfer.text);
        for (property, value_hash, stored) in transfer.cells {
            let record = self.record_mut(property, value_hash);
            record.stored = Some(stored);
            record.hot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::properties::PROP_SEGMENT;

    fn store() -> Attributes {
        Attributes::new(0, Arc::new(AttributeBlob::new()))
    }

    #[test]
    fn test_set_then_get_bits() {
        let mut attrs = store();
        attrs.set(1000, 42, 3, true).unwrap();
        attrs.set(1000, 42, 9, true).unwrap();
        let bits = attrs.get_bits(1000, 42).unwrap();
        assert!(bits.bit_state(3));
        assert!(bits.bit_state(9));
        assert_eq!(bits.population(16), 2);
    }

    #[test]
    fn test_missing_cell_is_empty() {
        let mut attrs = store();
        let bits = attrs.get_bits(1000, 77).unwrap();
        assert_eq!(bits.population(64), 0);
    }

    #[test]
    fn test_matching_values_numeric_modes() {
        let mut attrs = store();
        for (value, lin) in [(10i64, 0usize), (20, 1), (30, 2)] {
            attrs.set(1000, value, lin, true).unwrap();
        }
        let mut gt = attrs.matching_values(1000, ListMode::Gt, 15);
        gt.sort();
        assert_eq!(gt, vec![20, 30]);
        assert_eq!(attrs.matching_values(1000, ListMode::Eq, 20), vec![20]);
        assert_eq!(attrs.matching_values(1000, ListMode::Present, 0).len(), 3);
    }

    #[test]
    fn test_composite_neq_value_negates_union() {
        let mut attrs = store();
        // customers 0,1 have value 5; customer 2 has value 7
        attrs.set(1000, 5, 0, true).unwrap();
        attrs.set(1000, 5, 1, true).unwrap();
        attrs.set(1000, 7, 2, true).unwrap();

        let bits = attrs.composite_bits(1000, ListMode::Neq, 5, 3).unwrap();
        assert!(!bits.bit_state(0));
        assert!(!bits.bit_state(1));
        assert!(bits.bit_state(2));
        assert_eq!(bits.population(3), 1);
    }

    #[test]
    fn test_composite_eq_none_is_absence() {
        let mut attrs = store();
        attrs.set(1000, 5, 0, true).unwrap();
        // customer 1 never set the property
        let bits = attrs.composite_bits(1000, ListMode::Eq, NONE, 2).unwrap();
        assert!(!bits.bit_state(0));
        assert!(bits.bit_state(1));
    }

    #[test]
    fn test_transfer_round_trip() {
        let mut attrs = store();
        let hash = attrs.intern("pears");
        attrs.set(1001, hash, 4, true).unwrap();
        attrs.set(PROP_SEGMENT, 99, 2, true).unwrap();

        let transfer = attrs.to_transfer();

        let mut other = store();
        other.from_transfer(transfer);
        assert!(other.get_bits(1001, hash).unwrap().bit_state(4));
        assert!(other.get_bits(PROP_SEGMENT, 99).unwrap().bit_state(2));
        assert_eq!(other.blob().get(hash).as_deref(), Some("pears"));
    }
}
