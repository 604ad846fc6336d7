// The partition container: one table's state on one partition.
//
// Binds the attribute index, the people/grid store, the partition-local
// segment map and the change-message buffer. Everything here is touched
// only by the partition's loop, so the wrapping mutex is uncontended on
// the hot path.

use crate::attributes::{AttributeBlob, Attributes, AttributesTransfer};
use crate::bitmap::IndexBits;
use crate::grid::{People, PeopleTransfer};
use crate::segments::SegmentPartitioned;
use crate::table::{ChangeMessage, Table};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Serialized partition for replica transfer: the attribute index plus
/// the people store, with the unread side-log span riding along.
#[derive(Serialize, Deserialize)]
pub struct PartitionTransfer {
    pub attributes: AttributesTransfer,
    pub people: PeopleTransfer,
    pub sidelog: Vec<u8>,
}

pub struct TablePartitioned {
    pub table: String,
    pub partition: usize,
    pub attributes: Attributes,
    pub people: People,
    pub segments: HashMap<String, SegmentPartitioned>,
    /// on-insert segment names in z-index descending order
    pub on_insert_order: Vec<String>,
    messages: Vec<ChangeMessage>,
    /// open-loops holding segment state bump this to delay config sync
    pub segment_usage_count: i32,
}

impl TablePartitioned {
    pub fn new(table: &Table, partition: usize) -> Self {
        let blob = Arc::new(AttributeBlob::new());
        let mut parts = Self {
            table: table.name().to_string(),
            partition,
            attributes: Attributes::new(partition, blob),
            people: People::new(partition),
            segments: HashMap::new(),
            on_insert_order: Vec::new(),
            messages: Vec::new(),
            segment_usage_count: 0,
        };
        parts.sync_segments_with_table(table);
        parts
    }

    /// Import added/changed segments from the table's master registry and
    /// drop removed ones. Skipped while any open-loop holds segment
    /// bitmaps (`segment_usage_count`).
    pub fn sync_segments_with_table(&mut self, table: &Table) {
        if self.segment_usage_count > 0 {
            return;
        }

        let master = table.segments.read();

        for (name, def) in master.iter() {
            let stale = self
                .segments
                .get(name)
                .map(|existing| existing.last_modified != def.last_modified)
                .unwrap_or(true);
            if stale {
                self.segments.insert(
                    name.clone(),
                    SegmentPartitioned::new(
                        name,
                        def.macros.clone(),
                        def.flags.clone(),
                        def.last_modified,
                    ),
                );
            }
        }

        let orphaned: Vec<String> = self
            .segments
            .keys()
            .filter(|name| !master.contains_key(*name))
            .cloned()
            .collect();
        for name in orphaned {
            self.segments.remove(&name);
        }

        let mut on_insert: Vec<(&String, i64)> = self
            .segments
            .iter()
            .filter(|(_, seg)| seg.on_insert)
            .map(|(name, seg)| (name, seg.z_index))
            .collect();
        on_insert.sort_by(|a, b| b.1.cmp(&a.1));
        self.on_insert_order = on_insert.into_iter().map(|(name, _)| name.clone()).collect();
    }

    /// Segment bitmaps by name, falling back to the index for segments
    /// built by other partitions or earlier refreshes.
    pub fn get_segment_bits(&mut self, name: &str) -> Option<IndexBits> {
        if let Some(segment) = self.segments.get(name) {
            return segment.bits(&mut self.attributes).ok();
        }
        let hash = crate::common::hash_str(name);
        let bits = self
            .attributes
            .get_bits(crate::table::properties::PROP_SEGMENT, hash)
            .ok()?;
        Some(bits)
    }

    /// Snapshot every named segment's bitmap, so segment math evaluated
    /// in one refresh pass sees a consistent view.
    pub fn segment_snapshot(&mut self) -> HashMap<String, IndexBits> {
        let names: Vec<String> = self.segments.keys().cloned().collect();
        let mut snapshot = HashMap::new();
        for name in names {
            if let Some(bits) = self.get_segment_bits(&name) {
                snapshot.insert(name, bits);
            }
        }
        snapshot
    }

    pub fn push_message(&mut self, message: ChangeMessage) {
        self.messages.push(message);
    }

    pub fn push_messages(&mut self, mut batch: Vec<ChangeMessage>) {
        self.messages.append(&mut batch);
    }

    /// Hand buffered messages to the table's main queue for dispatch.
    pub fn flush_messages(&mut self, table: &Table) {
        if self.messages.is_empty() {
            return;
        }
        table.push_messages(std::mem::take(&mut self.messages));
    }

    pub fn to_transfer(&mut self, sidelog: Vec<u8>) -> PartitionTransfer {
        PartitionTransfer {
            attributes: self.attributes.to_transfer(),
            people: self.people.to_transfer(),
            sidelog,
        }
    }

    pub fn from_transfer(&mut self, transfer: PartitionTransfer) {
        self.attributes.from_transfer(transfer.attributes);
        self.people.from_transfer(transfer.people);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{self, SegmentFlags};
    use crate::table::properties::PropType;

    fn table_with_segments() -> Table {
        let table = Table::new("t");
        table
            .properties
            .write()
            .add("plan", PropType::Text, false, true)
            .unwrap();
        let schema = table.properties.read().clone();
        for (name, z, on_insert) in [("a", 5i64, true), ("b", 9, true), ("c", 1, false)] {
            let macros = query::compile("where plan == 'x'", &schema).unwrap();
            let flags = SegmentFlags {
                z_index: z,
                on_insert,
                ..SegmentFlags::default()
            };
            // flags come from the section header in real use
            let mut with_flags = (*macros).clone();
            with_flags.segment = Some(flags.clone());
            table.set_segment(name, "where plan == 'x'", Arc::new(with_flags), flags);
        }
        table
    }

    #[test]
    fn test_sync_orders_on_insert_by_z_index() {
        let table = table_with_segments();
        let parts = TablePartitioned::new(&table, 0);
        assert_eq!(parts.on_insert_order, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(parts.segments.len(), 3);
    }

    #[test]
    fn test_sync_drops_removed_segments() {
        let table = table_with_segments();
        let mut parts = TablePartitioned::new(&table, 0);
        table.drop_segment("a");
        parts.sync_segments_with_table(&table);
        assert!(!parts.segments.contains_key("a"));
        assert_eq!(parts.on_insert_order, vec!["b".to_string()]);
    }

    #[test]
    fn test_sync_gated_by_usage_count() {
        let table = table_with_segments();
        let mut parts = TablePartitioned::new(&table, 0);
        parts.segment_usage_count = 1;
        table.drop_segment("a");
        parts.sync_segments_with_table(&table);
        // held segments survive until the open-loop lets go
        assert!(parts.segments.contains_key("a"));
    }

    #[test]
    fn test_transfer_round_trip() {
        let table = table_with_segments();
        let mut parts = TablePartitioned::new(&table, 0);
        let customer = parts.people.get_make("u@x");
        parts
            .attributes
            .set(1000, 42, customer.linear_id, true)
            .unwrap();

        let transfer = parts.to_transfer(Vec::new());
        let mut clone = TablePartitioned::new(&table, 0);
        clone.from_transfer(transfer);
        assert_eq!(clone.people.customer_count(), 1);
        assert!(clone.attributes.get_bits(1000, 42).unwrap().bit_state(0));
    }
}
