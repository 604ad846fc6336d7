// Keyed aggregation results.
//
// A ResultSet maps a RowKey (up to 4 tagged group levels) to an
// accumulator row of (value, count) cells, width = columns x segment
// lanes. Partitions accumulate locklessly into their own sets; merging
// is a deterministic sort-merge keyed by RowKey with per-column modifier
// rules.

pub mod muxdemux;

use crate::common::NONE;
use crate::query::Modifier;
use std::collections::{BTreeMap, HashMap};

pub const KEY_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i8)]
pub enum ResultType {
    Int = 0,
    Double = 1,
    Bool = 2,
    Text = 3,
    None = 4,
}

impl ResultType {
    pub fn from_i8(value: i8) -> Self {
        match value {
            1 => ResultType::Double,
            2 => ResultType::Bool,
            3 => ResultType::Text,
            4 => ResultType::None,
            _ => ResultType::Int,
        }
    }
}

/// Group key: 4 levels of (value, type); unused levels hold NONE.
/// Ordering compares values level by level, which is what the sort-merge
/// and the grouped JSON emit both rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub key: [i64; KEY_DEPTH],
    pub types: [ResultType; KEY_DEPTH],
}

impl Default for RowKey {
    fn default() -> Self {
        Self {
            key: [NONE; KEY_DEPTH],
            types: [ResultType::Int; KEY_DEPTH],
        }
    }
}

impl RowKey {
    pub fn clear(&mut self) {
        *self = RowKey::default();
    }

    pub fn clear_from(&mut self, index: usize) {
        for i in index..KEY_DEPTH {
            self.key[i] = NONE;
            self.types[i] = ResultType::Int;
        }
    }

    pub fn depth(&self) -> usize {
        self.key.iter().take_while(|&&k| k != NONE).count()
    }

    pub fn key_from(&self, index: usize) -> RowKey {
        let mut out = *self;
        out.clear_from(index);
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Accum {
    pub value: i64,
    pub count: i32,
}

impl Default for Accum {
    fn default() -> Self {
        Self {
            value: NONE,
            count: 0,
        }
    }
}

impl Accum {
    /// Fold one observation in, per the column's modifier.
    pub fn apply(&mut self, modifier: Modifier, value: i64) {
        match modifier {
            Modifier::Sum | Modifier::Avg => {
                if value != NONE {
                    self.value = if self.value == NONE {
                        value
                    } else {
                        self.value + value
                    };
                    self.count += 1;
                }
            }
            Modifier::Min => {
                if value != NONE && (self.value == NONE || value < self.value) {
                    self.value = value;
                }
                self.count += 1;
            }
            Modifier::Max => {
                if value != NONE && (self.value == NONE || value > self.value) {
                    self.value = value;
                }
                self.count += 1;
            }
            Modifier::Count | Modifier::Dist | Modifier::DistCountPerson => {
                self.count += 1;
            }
            Modifier::Value | Modifier::Var => {
                self.value = value;
                self.count += 1;
            }
        }
    }

    /// Combine another partition's cell into this one.
    pub fn merge(&mut self, other: &Accum, modifier: Modifier) {
        match modifier {
            Modifier::Sum | Modifier::Avg => {
                if other.value != NONE {
                    self.value = if self.value == NONE {
                        other.value
                    } else {
                        self.value + other.value
                    };
                }
                self.count += other.count;
            }
            Modifier::Min => {
                if other.value != NONE && (self.value == NONE || other.value < self.value) {
                    self.value = other.value;
                }
                self.count += other.count;
            }
            Modifier::Max => {
                if other.value != NONE && (self.value == NONE || other.value > self.value) {
                    self.value = other.value;
                }
                self.count += other.count;
            }
            Modifier::Count | Modifier::Dist | Modifier::DistCountPerson => {
                self.count += other.count;
            }
            Modifier::Value | Modifier::Var => {
                if self.value == NONE {
                    self.value = other.value;
                }
                self.count += other.count;
            }
        }
    }

    /// The number a reader sees for this cell.
    pub fn emit(&self, modifier: Modifier) -> i64 {
        match modifier {
            Modifier::Count | Modifier::Dist | Modifier::DistCountPerson => self.count as i64,
            Modifier::Avg => {
                if self.count == 0 || self.value == NONE {
                    NONE
                } else {
                    self.value / self.count as i64
                }
            }
            _ => self.value,
        }
    }
}

pub struct ResultSet {
    pub results: HashMap<RowKey, Vec<Accum>>,
    /// key-sorted rows; populated by `make_sorted` or by the demux
    pub sorted: Vec<(RowKey, Vec<Accum>)>,
    /// demuxed sets carry rows only in `sorted`
    pub is_premerged: bool,
    pub width: usize,
    /// text values local to this partition, hash -> string
    pub local_text: HashMap<i64, String>,
}

impl ResultSet {
    pub fn new(width: usize) -> Self {
        Self {
            results: HashMap::new(),
            sorted: Vec::new(),
            is_premerged: false,
            width: width.max(1),
            local_text: HashMap::new(),
        }
    }

    pub fn accum_mut(&mut self, key: RowKey) -> &mut Vec<Accum> {
        let width = self.width;
        self.results
            .entry(key)
            .or_insert_with(|| vec![Accum::default(); width])
    }

    pub fn add_local_text(&mut self, hash: i64, value: &str) {
        self.local_text
            .entry(hash)
            .or_insert_with(|| value.to_string());
    }

    pub fn make_sorted(&mut self) {
        let mut rows: Vec<_> = self
            .results
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        self.sorted = rows;
    }

    pub fn rows(&self) -> &[(RowKey, Vec<Accum>)] {
        &self.sorted
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.sorted.is_empty()
    }
}

/// Sort-merge any number of result sets into one. `modifiers` has one
/// entry per accumulator column (aggregates repeated per segment lane).
/// Equal keys combine cell-wise; ties and ordering are fixed by RowKey
/// order so the merge is deterministic given identical inputs.
pub fn merge_sets(sets: Vec<ResultSet>, width: usize, modifiers: &[Modifier]) -> ResultSet {
    let mut merged: BTreeMap<RowKey, Vec<Accum>> = BTreeMap::new();
    let mut out = ResultSet::new(width);

    for mut set in sets {
        if !set.is_premerged {
            set.make_sorted();
        }
        for (key, accums) in set.sorted.drain(..) {
            match merged.get_mut(&key) {
                Some(existing) => {
                    for (column, cell) in accums.iter().enumerate().take(existing.len()) {
                        let modifier = modifiers
                            .get(column)
                            .copied()
                            .unwrap_or(Modifier::Value);
                        existing[column].merge(cell, modifier);
                    }
                }
                None => {
                    merged.insert(key, accums);
                }
            }
        }
        for (hash, text) in set.local_text.drain() {
            out.local_text.entry(hash).or_insert(text);
        }
    }

    out.sorted = merged.into_iter().collect();
    out.is_premerged = true;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key1(value: i64) -> RowKey {
        let mut key = RowKey::default();
        key.key[0] = value;
        key
    }

    #[test]
    fn test_accumulate_and_emit() {
        let mut set = ResultSet::new(2);
        let accums = set.accum_mut(key1(5));
        accums[0].apply(Modifier::Sum, 10);
        accums[0].apply(Modifier::Sum, 32);
        accums[1].apply(Modifier::Count, 0);

        let accums = &set.results[&key1(5)];
        assert_eq!(accums[0].emit(Modifier::Sum), 42);
        assert_eq!(accums[1].emit(Modifier::Count), 1);
    }

    #[test]
    fn test_avg_is_count_aware_across_merge() {
        let modifiers = [Modifier::Avg];
        let mut a = ResultSet::new(1);
        a.accum_mut(key1(1))[0].apply(Modifier::Avg, 10);
        a.accum_mut(key1(1))[0].apply(Modifier::Avg, 20);
        let mut b = ResultSet::new(1);
        b.accum_mut(key1(1))[0].apply(Modifier::Avg, 60);

        let merged = merge_sets(vec![a, b], 1, &modifiers);
        assert_eq!(merged.sorted.len(), 1);
        // (10 + 20 + 60) / 3, not an average of averages
        assert_eq!(merged.sorted[0].1[0].emit(Modifier::Avg), 30);
    }

    #[test]
    fn test_merge_is_key_sorted_and_deterministic() {
        let modifiers = [Modifier::Sum];
        let mut a = ResultSet::new(1);
        a.accum_mut(key1(9))[0].apply(Modifier::Sum, 1);
        a.accum_mut(key1(2))[0].apply(Modifier::Sum, 1);
        let mut b = ResultSet::new(1);
        b.accum_mut(key1(5))[0].apply(Modifier::Sum, 1);
        b.accum_mut(key1(2))[0].apply(Modifier::Sum, 1);

        let merged = merge_sets(vec![a, b], 1, &modifiers);
        let keys: Vec<i64> = merged.sorted.iter().map(|(k, _)| k.key[0]).collect();
        assert_eq!(keys, vec![2, 5, 9]);
        assert_eq!(merged.sorted[0].1[0].emit(Modifier::Sum), 2);
    }

    #[test]
    fn test_row_key_depth_and_prefix() {
        let mut key = RowKey::default();
        key.key[0] = 10;
        key.key[1] = 20;
        assert_eq!(key.depth(), 2);
        let prefix = key.key_from(1);
        assert_eq!(prefix.depth(), 1);
        assert_eq!(prefix.key[0], 10);
    }
}
