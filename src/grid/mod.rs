// The event grid: one customer's history, decompressed for use.
//
// `CustomerData` is the at-rest form (LZ4 over bincode column blocks);
// `Grid` is the working overlay. The expensive part of a job is mapping
// the table once; after that the same Grid is re-used by mounting one
// customer after another (mount -> prepare -> read/insert -> commit).

mod people;

pub use people::{CustomerData, People, PeopleTransfer};

use crate::attributes::Attributes;
use crate::common::{now_ms, scale_double, NONE};
use crate::error::{Error, ErrorCode, Result};
use crate::table::properties::{Properties, Property, PropType, PROP_EVENT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_SESSION_TIME_MS: i64 = 30 * 60 * 1000;

/// One event: stamp, event hash, and sparse (property, value) cells.
/// Set properties simply contribute multiple cells with the same id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowData {
    pub stamp: i64,
    pub event: i64,
    pub cells: Vec<(u32, i64)>,
}

impl RowData {
    pub fn values(&self, property: u32) -> impl Iterator<Item = i64> + '_ {
        self.cells
            .iter()
            .filter(move |(p, _)| *p == property)
            .map(|(_, v)| *v)
    }

    pub fn first_value(&self, property: u32) -> Option<i64> {
        self.values(property).next()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GridBlocks {
    rows: Vec<RowData>,
    customer_cells: Vec<(u32, i64)>,
}

/// Retention policy applied by the cleaner.
#[derive(Debug, Clone, Copy)]
pub struct CullPolicy {
    pub max_rows: usize,
    pub max_age_ms: Option<i64>,
}

impl Default for CullPolicy {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            max_age_ms: None,
        }
    }
}

pub struct Grid {
    mapped: Vec<Property>,
    by_id: HashMap<u32, usize>,
    event_order: HashMap<i64, usize>,
    session_time: i64,
    meta: Option<Arc<CustomerData>>,
    rows: Vec<RowData>,
    customer_cells: Vec<(u32, i64)>,
    sessions: Vec<i64>,
}

impl Grid {
    pub fn new() -> Self {
        Self {
            mapped: Vec::new(),
            by_id: HashMap::new(),
            event_order: HashMap::new(),
            session_time: DEFAULT_SESSION_TIME_MS,
            meta: None,
            rows: Vec::new(),
            customer_cells: Vec::new(),
            sessions: Vec::new(),
        }
    }

    /// Pin the schema, optionally reduced to a projection for queries.
    /// Unknown projected names are a query error.
    pub fn map_table(&mut self, schema: &Properties, projection: Option<&[String]>) -> Result<()> {
        self.mapped.clear();
        self.by_id.clear();
        match projection {
            Some(names) => {
                for name in names {
                    let prop = schema.require(name)?;
                    self.by_id.insert(prop.id, self.mapped.len());
                    self.mapped.push(prop.clone());
                }
            }
            None => {
                for prop in schema.iter() {
                    self.by_id.insert(prop.id, self.mapped.len());
                    self.mapped.push(prop.clone());
                }
            }
        }
        Ok(())
    }

    pub fn set_session_time(&mut self, session_time_ms: i64) {
        self.session_time = session_time_ms.max(1);
    }

    /// Event-type ranking used to break stamp ties on insert.
    pub fn set_event_order(&mut self, order: HashMap<i64, usize>) {
        self.event_order = order;
    }

    pub fn is_mapped(&self, property: u32) -> bool {
        self.by_id.contains_key(&property)
    }

    pub fn mount(&mut self, data: Arc<CustomerData>) {
        self.meta = Some(data);
        self.rows.clear();
        self.customer_cells.clear();
        self.sessions.clear();
    }

    pub fn meta(&self) -> Option<&Arc<CustomerData>> {
        self.meta.as_ref()
    }

    /// Decompress the mounted blob into rows and derive sessions.
    pub fn prepare(&mut self) -> Result<()> {
        let Some(meta) = &self.meta else {
            return Err(Error::run_time(
                ErrorCode::GeneralError,
                "grid prepare without mount",
            ));
        };
        if meta.blob.is_empty() {
            self.rows.clear();
            self.customer_cells.clear();
            self.derive_sessions();
            return Ok(());
        }

        let raw = lz4_flex::decompress_size_prepended(&meta.blob)
            .map_err(|e| Error::corruption(format!("customer blob: {e}")))?;
        let (blocks, _): (GridBlocks, usize) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| Error::corruption(format!("customer blocks: {e}")))?;

        // apply the projection: keep only mapped cells
        self.rows = blocks
            .rows
            .into_iter()
            .map(|mut row| {
                row.cells.retain(|(p, _)| self.by_id.contains_key(p));
                row
            })
            .collect();
        self.customer_cells = blocks.customer_cells;
        self.derive_sessions();
        Ok(())
    }

    fn derive_sessions(&mut self) {
        self.sessions.clear();
        self.sessions.reserve(self.rows.len());
        let mut session = 0i64;
        let mut last_stamp = i64::MIN;
        for row in &self.rows {
            if last_stamp == i64::MIN || row.stamp - last_stamp > self.session_time {
                session += 1;
            }
            last_stamp = row.stamp;
            self.sessions.push(session);
        }
    }

    pub fn rows(&self) -> &[RowData] {
        &self.rows
    }

    pub fn session(&self, row: usize) -> i64 {
        self.sessions.get(row).copied().unwrap_or(NONE)
    }

    pub fn session_count(&self) -> i64 {
        self.sessions.last().copied().unwrap_or(0)
    }

    pub fn customer_value(&self, property: u32) -> Option<i64> {
        self.customer_cells
            .iter()
            .find(|(p, _)| *p == property)
            .map(|(_, v)| *v)
    }

    fn json_to_cell(prop: &Property, value: &serde_json::Value, attrs: &Attributes) -> Option<i64> {
        match prop.ptype {
            PropType::Int => value
                .as_i64()
                .or_else(|| value.as_f64().map(|f| f as i64)),
            PropType::Double => value.as_f64().map(scale_double),
            PropType::Bool => value.as_bool().map(|b| b as i64),
            PropType::Text => value.as_str().map(|s| attrs.intern(s)),
        }
    }

    fn parse_stamp(value: Option<&serde_json::Value>) -> Result<i64> {
        match value {
            None => Ok(now_ms()),
            Some(v) if v.is_i64() || v.is_u64() => Ok(v.as_i64().unwrap_or(0)),
            Some(v) => {
                let text = v.as_str().ok_or_else(|| {
                    Error::insert("stamp must be epoch milliseconds or ISO 8601")
                })?;
                chrono::DateTime::parse_from_rfc3339(text)
                    .map(|dt| dt.timestamp_millis())
                    .map_err(|_| Error::parse(ErrorCode::DateParseError, text.to_string()))
            }
        }
    }

    /// Insert one event row. Keeps rows ordered by stamp (equal stamps by
    /// configured event order, then insertion order) and maintains the
    /// attribute index for every value it lands.
    pub fn insert(&mut self, attrs: &mut Attributes, event: &serde_json::Value) -> Result<()> {
        let meta = self
            .meta
            .as_ref()
            .ok_or_else(|| Error::insert("grid insert without mount"))?;
        let linear_id = meta.linear_id;

        let props = event
            .get("_")
            .and_then(|v| v.as_object())
            .ok_or_else(|| Error::insert("row missing '_' payload"))?;

        let stamp = Self::parse_stamp(event.get("stamp"))?;
        let event_name = props
            .get("event")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::insert("row missing event name"))?;
        let event_hash = attrs.intern(event_name);

        let mut row = RowData {
            stamp,
            event: event_hash,
            cells: Vec::new(),
        };

        for (name, value) in props {
            if name == "event" {
                continue;
            }
            // unknown properties are skipped, matching per-row error policy
            let Some(prop) = self.mapped.iter().find(|p| &p.name == name) else {
                tracing::debug!(property = %name, "insert skipping unknown property");
                continue;
            };
            let prop = prop.clone();

            let mut values = Vec::new();
            match value {
                serde_json::Value::Array(items) if prop.is_set => {
                    for item in items {
                        if let Some(cell) = Self::json_to_cell(&prop, item, attrs) {
                            values.push(cell);
                        }
                    }
                }
                single => {
                    if let Some(cell) = Self::json_to_cell(&prop, single, attrs) {
                        values.push(cell);
                    }
                }
            }

            for cell in values {
                if prop.is_customer {
                    let old = self
                        .customer_cells
                        .iter()
                        .find(|(p, _)| *p == prop.id)
                        .map(|(_, v)| *v)
                        .unwrap_or(NONE);
                    attrs.swap_state(prop.id, old, cell, linear_id)?;
                    self.customer_cells.retain(|(p, _)| *p != prop.id);
                    self.customer_cells.push((prop.id, cell));
                } else {
                    attrs.set(prop.id, cell, linear_id, true)?;
                    row.cells.push((prop.id, cell));
                }
            }
        }

        attrs.set(PROP_EVENT, event_hash, linear_id, true)?;

        let rank = |r: &RowData| {
            self.event_order
                .get(&r.event)
                .copied()
                .unwrap_or(usize::MAX)
        };
        let new_rank = rank(&row);
        let position = self
            .rows
            .iter()
            .position(|r| {
                r.stamp > row.stamp || (r.stamp == row.stamp && rank(r) > new_rank)
            })
            .unwrap_or(self.rows.len());
        self.rows.insert(position, row);
        self.derive_sessions();
        Ok(())
    }

    /// Re-compress into a fresh CustomerData. The caller swaps it into the
    /// People store; the previously mounted record is superseded.
    pub fn commit(&mut self) -> Result<Arc<CustomerData>> {
        let meta = self
            .meta
            .as_ref()
            .ok_or_else(|| Error::insert("grid commit without mount"))?;

        let blocks = GridBlocks {
            rows: self.rows.clone(),
            customer_cells: self.customer_cells.clone(),
        };
        let raw = bincode::serde::encode_to_vec(&blocks, bincode::config::standard())
            .map_err(|e| Error::run_time(ErrorCode::GeneralError, format!("encode: {e}")))?;
        let blob = lz4_flex::compress_prepend_size(&raw);

        let committed = Arc::new(CustomerData {
            id_hash: meta.id_hash,
            id: meta.id.clone(),
            linear_id: meta.linear_id,
            flags: meta.flags,
            blob,
        });
        self.meta = Some(committed.clone());
        Ok(committed)
    }

    /// Apply retention: drop rows past the age limit or beyond the row
    /// cap (oldest first). Returns whether anything was dropped.
    pub fn cull(&mut self, policy: &CullPolicy, now: i64) -> bool {
        let before = self.rows.len();
        if let Some(max_age) = policy.max_age_ms {
            let cutoff = now - max_age;
            self.rows.retain(|r| r.stamp >= cutoff);
        }
        if self.rows.len() > policy.max_rows {
            let drop = self.rows.len() - policy.max_rows;
            self.rows.drain(0..drop);
        }
        if self.rows.len() != before {
            self.derive_sessions();
            true
        } else {
            false
        }
    }

    /// Render the mounted customer for the single-customer endpoint.
    pub fn to_json(&self, schema: &Properties, blob: &crate::attributes::AttributeBlob) -> serde_json::Value {
        let meta = self.meta.as_ref();
        let mut events = Vec::with_capacity(self.rows.len());
        for (index, row) in self.rows.iter().enumerate() {
            let mut props = serde_json::Map::new();
            for (prop_id, value) in &row.cells {
                let Some(prop) = schema.get_by_id(*prop_id) else {
                    continue;
                };
                let rendered = render_value(prop.ptype, *value, blob);
                match props.get_mut(&prop.name) {
                    Some(serde_json::Value::Array(items)) => items.push(rendered),
                    Some(existing) => {
                        let first = existing.take();
                        props.insert(
                            prop.name.clone(),
                            serde_json::Value::Array(vec![first, rendered]),
                        );
                    }
                    None => {
                        props.insert(prop.name.clone(), rendered);
                    }
                }
            }
            events.push(serde_json::json!({
                "stamp": row.stamp,
                "event": blob.get(row.event),
                "session": self.session(index),
                "_": props,
            }));
        }

        serde_json::json!({
            "id": meta.map(|m| m.id.clone()),
            "events": events,
        })
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self::new()
    }
}

fn render_value(
    ptype: PropType,
    value: i64,
    blob: &crate::attributes::AttributeBlob,
) -> serde_json::Value {
    if value == NONE {
        return serde_json::Value::Null;
    }
    match ptype {
        PropType::Int => serde_json::json!(value),
        PropType::Double => serde_json::json!(crate::common::descale_double(value)),
        PropType::Bool => serde_json::json!(value != 0),
        PropType::Text => blob
            .get(value)
            .map(|s| serde_json::json!(s))
            .unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeBlob;
    use crate::table::properties::Properties;

    fn fixture() -> (Properties, Attributes, People, Grid) {
        let mut schema = Properties::new();
        schema.add("product", PropType::Text, true, false).unwrap();
        schema.add("price", PropType::Double, false, false).unwrap();
        schema.add("plan", PropType::Text, false, true).unwrap();
        let attrs = Attributes::new(0, Arc::new(AttributeBlob::new()));
        let people = People::new(0);
        let mut grid = Grid::new();
        grid.map_table(&schema, None).unwrap();
        (schema, attrs, people, grid)
    }

    fn event(stamp: i64, name: &str, extra: serde_json::Value) -> serde_json::Value {
        let mut payload = serde_json::json!({ "event": name });
        if let Some(map) = extra.as_object() {
            for (k, v) in map {
                payload[k] = v.clone();
            }
        }
        serde_json::json!({ "stamp": stamp, "_": payload })
    }

    #[test]
    fn test_insert_commit_mount_round_trip() {
        let (_schema, mut attrs, mut people, mut grid) = fixture();
        let customer = people.get_make("u@x");
        grid.mount(customer);
        grid.prepare().unwrap();
        grid.insert(
            &mut attrs,
            &event(10, "purchase", serde_json::json!({"price": 2.5, "product": "pear"})),
        )
        .unwrap();
        grid.insert(&mut attrs, &event(5, "view", serde_json::json!({})))
            .unwrap();
        let committed = grid.commit().unwrap();
        people.replace(committed.clone());

        // remount and confirm ordering and values survive the blob
        let mut grid2 = Grid::new();
        let mut schema = Properties::new();
        schema.add("product", PropType::Text, true, false).unwrap();
        schema.add("price", PropType::Double, false, false).unwrap();
        schema.add("plan", PropType::Text, false, true).unwrap();
        grid2.map_table(&schema, None).unwrap();
        grid2.mount(committed);
        grid2.prepare().unwrap();

        let rows = grid2.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stamp, 5); // stamp order, not insert order
        assert_eq!(rows[1].stamp, 10);
        let price_prop = schema.get("price").unwrap().id;
        assert_eq!(rows[1].first_value(price_prop), Some(25_000));
    }

    #[test]
    fn test_equal_stamps_keep_insertion_order() {
        let (_s, mut attrs, mut people, mut grid) = fixture();
        grid.mount(people.get_make("u"));
        grid.prepare().unwrap();
        for name in ["first", "second", "third"] {
            grid.insert(&mut attrs, &event(100, name, serde_json::json!({})))
                .unwrap();
        }
        let events: Vec<i64> = grid.rows().iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![
                attrs.intern("first"),
                attrs.intern("second"),
                attrs.intern("third")
            ]
        );
    }

    #[test]
    fn test_session_derivation() {
        let (_s, mut attrs, mut people, mut grid) = fixture();
        grid.set_session_time(30 * 60 * 1000);
        grid.mount(people.get_make("u"));
        grid.prepare().unwrap();
        let min = 60_000i64;
        for stamp in [0, 5 * min, 40 * min, 45 * min] {
            grid.insert(&mut attrs, &event(stamp, "e", serde_json::json!({})))
                .unwrap();
        }
        let sessions: Vec<i64> = (0..4).map(|i| grid.session(i)).collect();
        assert_eq!(sessions, vec![1, 1, 2, 2]);
        assert_eq!(grid.session_count(), 2);
    }

    #[test]
    fn test_insert_maintains_attribute_index() {
        let (schema, mut attrs, mut people, mut grid) = fixture();
        grid.mount(people.get_make("u"));
        grid.prepare().unwrap();
        grid.insert(
            &mut attrs,
            &event(1, "buy", serde_json::json!({"product": ["pear", "fig"]})),
        )
        .unwrap();

        let product = schema.get("product").unwrap().id;
        let pear = attrs.intern("pear");
        let fig = attrs.intern("fig");
        assert!(attrs.get_bits(product, pear).unwrap().bit_state(0));
        assert!(attrs.get_bits(product, fig).unwrap().bit_state(0));
    }

    #[test]
    fn test_customer_property_moves_between_cells() {
        let (schema, mut attrs, mut people, mut grid) = fixture();
        grid.mount(people.get_make("u"));
        grid.prepare().unwrap();
        grid.insert(&mut attrs, &event(1, "e", serde_json::json!({"plan": "free"})))
            .unwrap();
        grid.insert(&mut attrs, &event(2, "e", serde_json::json!({"plan": "pro"})))
            .unwrap();

        let plan = schema.get("plan").unwrap().id;
        let free = attrs.intern("free");
        let pro = attrs.intern("pro");
        assert!(!attrs.get_bits(plan, free).unwrap().bit_state(0));
        assert!(attrs.get_bits(plan, pro).unwrap().bit_state(0));
        assert_eq!(grid.customer_value(plan), Some(pro));
    }

    #[test]
    fn test_cull_by_age_and_cap() {
        let (_s, mut attrs, mut people, mut grid) = fixture();
        grid.mount(people.get_make("u"));
        grid.prepare().unwrap();
        for stamp in 0..10 {
            grid.insert(&mut attrs, &event(stamp, "e", serde_json::json!({})))
                .unwrap();
        }
        let policy = CullPolicy {
            max_rows: 4,
            max_age_ms: Some(100),
        };
        assert!(grid.cull(&policy, 105)); // stamps 0..4 age out, cap trims to 4
        assert_eq!(grid.rows().len(), 4);
        assert_eq!(grid.rows()[0].stamp, 6);
        assert!(!grid.cull(&policy, 105));
    }
}
