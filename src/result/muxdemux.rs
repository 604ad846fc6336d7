// Result transport and emit.
//
// Internode binary layout (detected by the two-byte marker):
//
//   [0x01 0x02][row_count: i64][text_count: i64]
//   row_count x ( key: 4 x i64, types: 4 x u8, accums: width x (i64, i32) )
//   text_count x ( value_hash: i64, length: i32, utf8 bytes, 0x00 )
//
// The width is not self-describing; both ends hold the compiled query.
// The demux produces a "premerged" set (rows only in `sorted`) that feeds
// the originator's final sort-merge.

use super::{Accum, ResultSet, ResultType, RowKey, KEY_DEPTH};
use crate::common::{descale_double, NONE};
use crate::error::{Error, ErrorCode, Result};
use crate::mem::HeapStack;
use crate::query::Modifier;

const MARKER: [u8; 2] = [0x01, 0x02];
const HEADER_LEN: usize = 2 + 8 + 8;

/// Per-column metadata the emitter needs: display name, fold rule, and
/// whether values descale to doubles.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub modifier: Modifier,
    pub is_double: bool,
}

pub fn multiset_to_internode(sets: &mut [ResultSet], width: usize) -> Vec<u8> {
    let mut rows = 0i64;
    for set in sets.iter_mut() {
        if !set.is_premerged {
            set.make_sorted();
        }
        rows += set.sorted.len() as i64;
    }
    let text_count: usize = sets.iter().map(|s| s.local_text.len()).sum();

    let mut out = HeapStack::new();
    out.write(&MARKER);
    out.write_i64(rows);
    out.write_i64(text_count as i64);

    for set in sets.iter() {
        for (key, accums) in &set.sorted {
            for k in key.key {
                out.write_i64(k);
            }
            for t in key.types {
                out.write_u8(t as u8);
            }
            for column in 0..width {
                let cell = accums.get(column).copied().unwrap_or_default();
                out.write_i64(cell.value);
                out.write_i32(cell.count);
            }
        }
    }
    // text entries in stable hash order so re-encoding is byte-identical
    let mut texts: Vec<(&i64, &String)> = sets.iter().flat_map(|s| s.local_text.iter()).collect();
    texts.sort_by_key(|(hash, _)| **hash);
    for (hash, text) in texts {
        out.write_i64(*hash);
        out.write_i32(text.len() as i32);
        out.write(text.as_bytes());
        out.write_u8(0);
    }
    out.flatten()
}

pub fn is_internode(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && data[0..2] == MARKER
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::internode(
                ErrorCode::InternodeError,
                "internode buffer truncated",
            ));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

pub fn internode_to_result_set(data: &[u8], width: usize) -> Result<ResultSet> {
    if !is_internode(data) {
        return Err(Error::internode(
            ErrorCode::InternodeError,
            "missing internode marker",
        ));
    }
    let mut reader = Reader { data, pos: 2 };
    let rows = reader.i64()?;
    let texts = reader.i64()?;

    let mut set = ResultSet::new(width);
    set.is_premerged = true;
    set.sorted.reserve(rows.max(0) as usize);

    for _ in 0..rows {
        let mut key = RowKey::default();
        for i in 0..KEY_DEPTH {
            key.key[i] = reader.i64()?;
        }
        for i in 0..KEY_DEPTH {
            key.types[i] = ResultType::from_i8(reader.u8()? as i8);
        }
        let mut accums = Vec::with_capacity(width);
        for _ in 0..width {
            let value = reader.i64()?;
            let count = reader.i32()?;
            accums.push(Accum { value, count });
        }
        set.sorted.push((key, accums));
    }
    for _ in 0..texts {
        let hash = reader.i64()?;
        let length = reader.i32()?;
        let bytes = reader.take(length.max(0) as usize)?;
        let terminator = reader.u8()?;
        if terminator != 0 {
            return Err(Error::internode(
                ErrorCode::InternodeError,
                "unterminated text entry",
            ));
        }
        let text = String::from_utf8_lossy(bytes).into_owned();
        set.local_text.insert(hash, text);
    }
    Ok(set)
}

fn render_key(set: &ResultSet, value: i64, rtype: ResultType) -> serde_json::Value {
    if value == NONE {
        return serde_json::Value::Null;
    }
    match rtype {
        ResultType::Int => serde_json::json!(value),
        ResultType::Double => serde_json::json!(descale_double(value)),
        ResultType::Bool => serde_json::json!(value != 0),
        ResultType::Text => set
            .local_text
            .get(&value)
            .map(|s| serde_json::json!(s))
            .unwrap_or(serde_json::Value::Null),
        ResultType::None => serde_json::Value::Null,
    }
}

fn render_cell(cell: &Accum, meta: &ColumnMeta) -> serde_json::Value {
    let value = cell.emit(meta.modifier);
    if value == NONE {
        return serde_json::Value::Null;
    }
    let descale = meta.is_double
        && !matches!(
            meta.modifier,
            Modifier::Count | Modifier::Dist | Modifier::DistCountPerson
        );
    if descale {
        serde_json::json!(descale_double(value))
    } else {
        serde_json::json!(value)
    }
}

/// Emit the merged set as nested group arrays. Each row renders as
/// `{"g": key, "c": [..], "c2": [..], .., "_": [children]}` with one
/// column array per segment lane.
pub fn result_set_to_json(
    set: &ResultSet,
    columns: &[ColumnMeta],
    set_count: usize,
) -> serde_json::Value {
    let set_count = set_count.max(1);

    fn emit_level(
        set: &ResultSet,
        rows: &[(RowKey, Vec<Accum>)],
        columns: &[ColumnMeta],
        set_count: usize,
        depth: usize,
    ) -> Vec<serde_json::Value> {
        let per_lane = columns.len();
        let mut out = Vec::new();
        let mut index = 0usize;
        while index < rows.len() {
            let (key, accums) = &rows[index];
            if key.depth() != depth + 1 {
                index += 1;
                continue;
            }
            // children share this row's key prefix
            let prefix = key.key_from(depth + 1);
            let mut end = index + 1;
            while end < rows.len() && rows[end].0.key_from(depth + 1) == prefix {
                end += 1;
            }

            let mut row = serde_json::Map::new();
            row.insert(
                "g".to_string(),
                render_key(set, key.key[depth], key.types[depth]),
            );
            for lane in 0..set_count {
                let label = if lane == 0 {
                    "c".to_string()
                } else {
                    format!("c{}", lane + 1)
                };
                let cells: Vec<serde_json::Value> = (0..per_lane)
                    .map(|column| {
                        let cell = accums
                            .get(lane * per_lane + column)
                            .copied()
                            .unwrap_or_default();
                        render_cell(&cell, &columns[column])
                    })
                    .collect();
                row.insert(label, serde_json::Value::Array(cells));
            }

            let children = emit_level(set, &rows[index + 1..end], columns, set_count, depth + 1);
            if !children.is_empty() {
                row.insert("_".to_string(), serde_json::Value::Array(children));
            }
            out.push(serde_json::Value::Object(row));
            index = end;
        }
        out
    }

    serde_json::json!({ "_": emit_level(set, &set.sorted, columns, set_count, 0) })
}

/// Densely fill histogram buckets between min and max at the top group
/// level; missing buckets get zeroed columns.
pub fn json_histogram_fill(doc: &mut serde_json::Value, bucket: f64, min: f64, max: f64) {
    if bucket <= 0.0 {
        return;
    }
    let Some(rows) = doc.get_mut("_").and_then(|v| v.as_array_mut()) else {
        return;
    };

    let column_arity = rows
        .first()
        .and_then(|r| r.get("c"))
        .and_then(|c| c.as_array())
        .map(|c| c.len())
        .unwrap_or(1);
    let lane_labels: Vec<String> = rows
        .first()
        .and_then(|r| r.as_object())
        .map(|o| {
            o.keys()
                .filter(|k| *k == "c" || k.starts_with('c'))
                .cloned()
                .collect()
        })
        .unwrap_or_else(|| vec!["c".to_string()]);

    let existing: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.get("g").and_then(|g| g.as_f64()))
        .collect();

    let mut cursor = min;
    // nudge for fixed-point drift at 4 decimals
    let epsilon = 1e-9;
    while cursor <= max + epsilon {
        let found = existing.iter().any(|&g| (g - cursor).abs() < epsilon);
        if !found {
            let mut row = serde_json::Map::new();
            let g = if cursor.fract() == 0.0 && bucket.fract() == 0.0 {
                serde_json::json!(cursor as i64)
            } else {
                serde_json::json!(cursor)
            };
            row.insert("g".to_string(), g);
            for label in &lane_labels {
                row.insert(
                    label.clone(),
                    serde_json::Value::Array(vec![serde_json::json!(0); column_arity]),
                );
            }
            rows.push(serde_json::Value::Object(row));
        }
        cursor += bucket;
    }

    rows.sort_by(|a, b| {
        let ga = a.get("g").and_then(|g| g.as_f64()).unwrap_or(f64::MIN);
        let gb = b.get("g").and_then(|g| g.as_f64()).unwrap_or(f64::MIN);
        ga.partial_cmp(&gb).unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort top-level rows by group key.
pub fn json_sort_by_group(doc: &mut serde_json::Value, order: SortOrder) {
    let Some(rows) = doc.get_mut("_").and_then(|v| v.as_array_mut()) else {
        return;
    };
    rows.sort_by(|a, b| {
        let fallback = || (f64::MIN, String::new());
        let ga = a.get("g").map(json_sort_token).unwrap_or_else(fallback);
        let gb = b.get("g").map(json_sort_token).unwrap_or_else(fallback);
        let cmp = ga.partial_cmp(&gb).unwrap_or(std::cmp::Ordering::Equal);
        if order == SortOrder::Desc {
            cmp.reverse()
        } else {
            cmp
        }
    });
}

/// Sort top-level rows by a named column (first lane).
pub fn json_sort_by_column(
    doc: &mut serde_json::Value,
    columns: &[ColumnMeta],
    name: &str,
    order: SortOrder,
) {
    let Some(index) = columns.iter().position(|c| c.name == name) else {
        return;
    };
    let Some(rows) = doc.get_mut("_").and_then(|v| v.as_array_mut()) else {
        return;
    };
    rows.sort_by(|a, b| {
        let va = a
            .get("c")
            .and_then(|c| c.get(index))
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::MIN);
        let vb = b
            .get("c")
            .and_then(|c| c.get(index))
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::MIN);
        let cmp = va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal);
        if order == SortOrder::Desc {
            cmp.reverse()
        } else {
            cmp
        }
    });
}

pub fn json_trim(doc: &mut serde_json::Value, limit: usize) {
    if let Some(rows) = doc.get_mut("_").and_then(|v| v.as_array_mut()) {
        rows.truncate(limit);
    }
}

fn json_sort_token(value: &serde_json::Value) -> (f64, String) {
    match value {
        serde_json::Value::Number(n) => (n.as_f64().unwrap_or(0.0), String::new()),
        serde_json::Value::String(s) => (f64::MAX, s.clone()),
        serde_json::Value::Bool(b) => (*b as i64 as f64, String::new()),
        _ => (f64::MIN, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::scale_double;

    fn column(name: &str, modifier: Modifier, is_double: bool) -> ColumnMeta {
        ColumnMeta {
            name: name.to_string(),
            modifier,
            is_double,
        }
    }

    fn keyed(values: &[(i64, ResultType)]) -> RowKey {
        let mut key = RowKey::default();
        for (i, (v, t)) in values.iter().enumerate() {
            key.key[i] = *v;
            key.types[i] = *t;
        }
        key
    }

    #[test]
    fn test_internode_round_trip() {
        let mut set = ResultSet::new(2);
        let hash = crate::common::hash_str("pear");
        set.accum_mut(keyed(&[(hash, ResultType::Text)]))[0].apply(Modifier::Sum, 42);
        set.accum_mut(keyed(&[(7, ResultType::Int)]))[1].apply(Modifier::Count, 0);
        set.add_local_text(hash, "pear");

        let buffer = multiset_to_internode(&mut [set], 2);
        assert!(is_internode(&buffer));

        let decoded = internode_to_result_set(&buffer, 2).unwrap();
        assert!(decoded.is_premerged);
        assert_eq!(decoded.sorted.len(), 2);
        assert_eq!(decoded.local_text.get(&hash).map(|s| s.as_str()), Some("pear"));

        // re-encoding the decoded set yields the identical buffer
        let mut decoded = decoded;
        let again = multiset_to_internode(std::slice::from_mut(&mut decoded), 2);
        assert_eq!(buffer, again);
    }

    #[test]
    fn test_internode_rejects_garbage() {
        assert!(!is_internode(b"{}"));
        assert!(internode_to_result_set(b"nope", 1).is_err());
    }

    #[test]
    fn test_json_emit_nested_groups() {
        let mut set = ResultSet::new(1);
        set.accum_mut(keyed(&[(1, ResultType::Int)]))[0].apply(Modifier::Count, 0);
        set.accum_mut(keyed(&[(1, ResultType::Int), (10, ResultType::Int)]))[0]
            .apply(Modifier::Count, 0);
        set.make_sorted();

        let doc = result_set_to_json(&set, &[column("count", Modifier::Count, false)], 1);
        let rows = doc["_"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["g"], 1);
        assert_eq!(rows[0]["c"][0], 1);
        let children = rows[0]["_"].as_array().unwrap();
        assert_eq!(children[0]["g"], 10);
    }

    #[test]
    fn test_histogram_fill_dense_buckets() {
        let mut set = ResultSet::new(1);
        for score in [0.0f64, 0.5, 0.5, 1.0, 2.0] {
            set.accum_mut(keyed(&[(scale_double(score), ResultType::Double)]))[0]
                .apply(Modifier::Count, 0);
        }
        set.make_sorted();
        let mut doc = result_set_to_json(&set, &[column("count", Modifier::Count, false)], 1);
        json_histogram_fill(&mut doc, 0.5, 0.0, 3.0);

        let rows = doc["_"].as_array().unwrap();
        let keys: Vec<f64> = rows.iter().map(|r| r["g"].as_f64().unwrap()).collect();
        assert_eq!(keys, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0]);
        let counts: Vec<i64> = rows.iter().map(|r| r["c"][0].as_i64().unwrap()).collect();
        assert_eq!(counts, vec![1, 2, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn test_sort_and_trim() {
        let mut set = ResultSet::new(1);
        for (key, count) in [(3i64, 5), (1, 9), (2, 7)] {
            let accums = set.accum_mut(keyed(&[(key, ResultType::Int)]));
            for _ in 0..count {
                accums[0].apply(Modifier::Count, 0);
            }
        }
        set.make_sorted();
        let columns = [column("count", Modifier::Count, false)];
        let mut doc = result_set_to_json(&set, &columns, 1);

        json_sort_by_column(&mut doc, &columns, "count", SortOrder::Desc);
        let rows = doc["_"].as_array().unwrap();
        assert_eq!(rows[0]["g"], 1);

        json_trim(&mut doc, 2);
        assert_eq!(doc["_"].as_array().unwrap().len(), 2);
    }
}
