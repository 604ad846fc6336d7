// Property histogram: answered purely from the attribute index. Each
// value cell of the property becomes a row keyed by the value, counting
// the matching customers, with a column group per requested segment.

use super::Collector;
use crate::attributes::ListMode;
use crate::common::{descale_double, scale_double, NONE};
use crate::error::{Error, ErrorCode};
use crate::result::{ResultSet, ResultType, RowKey};
use crate::scheduler::{Cell, CellCtx, Priority};
use crate::table::properties::PropType;
use std::sync::Arc;

/// Filter over the property's values, straight from the query string.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PropertyFilter {
    pub gt: Option<f64>,
    pub gte: Option<f64>,
    pub lt: Option<f64>,
    pub lte: Option<f64>,
    pub eq: Option<f64>,
    pub between: Option<(f64, f64)>,
    /// regex over text values
    pub rx: Option<String>,
    /// substring over text values
    pub sub: Option<String>,
    pub bucket: Option<f64>,
}

pub struct OpenLoopProperty {
    table: String,
    property: String,
    filter: PropertyFilter,
    segments: Vec<String>,
    collector: Arc<Collector<ResultSet>>,
    finished: bool,
}

impl OpenLoopProperty {
    pub fn new(
        table: &str,
        property: &str,
        filter: PropertyFilter,
        segments: Vec<String>,
        collector: Arc<Collector<ResultSet>>,
    ) -> Self {
        Self {
            table: table.to_string(),
            property: property.to_string(),
            filter,
            segments,
            collector,
            finished: false,
        }
    }

    fn fail(&mut self, ctx: &mut CellCtx, error: Error) {
        self.finished = true;
        self.collector.fail(error);
        ctx.suicide();
    }

    fn numeric_pass(&self, scaled: i64, ptype: PropType) -> bool {
        let value = match ptype {
            PropType::Double => descale_double(scaled),
            _ => scaled as f64,
        };
        if let Some(gt) = self.filter.gt {
            if !(value > gt) {
                return false;
            }
        }
        if let Some(gte) = self.filter.gte {
            if !(value >= gte) {
                return false;
            }
        }
        if let Some(lt) = self.filter.lt {
            if !(value < lt) {
                return false;
            }
        }
        if let Some(lte) = self.filter.lte {
            if !(value <= lte) {
                return false;
            }
        }
        if let Some(eq) = self.filter.eq {
            if (value - eq).abs() > f64::EPSILON {
                return false;
            }
        }
        if let Some((lo, hi)) = self.filter.between {
            if value < lo || value >= hi {
                return false;
            }
        }
        true
    }
}

impl Cell for OpenLoopProperty {
    fn name(&self) -> &'static str {
        "property"
    }

    fn priority(&self) -> Priority {
        Priority::Realtime
    }

    fn table(&self) -> Option<&str> {
        Some(&self.table)
    }

    fn prepare(&mut self, _ctx: &mut CellCtx) {}

    fn run(&mut self, ctx: &mut CellCtx) {
        let Some(table) = ctx.services.db.get_table(&self.table) else {
            self.fail(ctx, Error::config(format!("no table '{}'", self.table)));
            return;
        };
        let Some(parts) = table.get_partition_objects(ctx.services, ctx.partition, true) else {
            self.fail(ctx, Error::partition_migrated(ctx.partition));
            return;
        };
        let mut parts = parts.lock();

        let prop = {
            let schema = table.properties.read();
            match schema.get(&self.property) {
                Some(prop) => prop.clone(),
                None => {
                    self.fail(
                        ctx,
                        Error::query(
                            ErrorCode::PropertyNotInTable,
                            format!("no property '{}'", self.property),
                        ),
                    );
                    return;
                }
            }
        };

        let regex = match &self.filter.rx {
            Some(pattern) => match regex::Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    self.fail(
                        ctx,
                        Error::query(
                            ErrorCode::GeneralQueryError,
                            format!("regex compile failure: {e}"),
                        ),
                    );
                    return;
                }
            },
            None => None,
        };

        let stop_bit = parts.people.customer_count();

        let mut lanes = Vec::new();
        for name in &self.segments {
            match parts.get_segment_bits(name) {
                Some(bits) => lanes.push(bits),
                None => {
                    self.fail(
                        ctx,
                        Error::query(ErrorCode::ItemNotFound, format!("unknown segment '{name}'")),
                    );
                    return;
                }
            }
        }

        let width = 1 + lanes.len();
        let mut result = ResultSet::new(width);
        let bucket_scaled = self.filter.bucket.map(scale_double).filter(|b| *b > 0);

        for value_hash in parts.attributes.get_property_values(prop.id) {
            if value_hash == NONE {
                continue;
            }
            // value filters work on the comparable key: numbers directly,
            // text through the dictionary
            match prop.ptype {
                PropType::Text => {
                    if regex.is_some() || self.filter.sub.is_some() {
                        let Some(text) = parts.attributes.blob().get(value_hash) else {
                            continue;
                        };
                        if let Some(re) = &regex {
                            if !re.is_match(&text) {
                                continue;
                            }
                        }
                        if let Some(sub) = &self.filter.sub {
                            if !text.contains(sub.as_str()) {
                                continue;
                            }
                        }
                    }
                }
                ptype => {
                    if !self.numeric_pass(value_hash, ptype) {
                        continue;
                    }
                }
            }

            let bits = match parts.attributes.get_bits(prop.id, value_hash) {
                Ok(bits) => bits,
                Err(e) => {
                    self.fail(ctx, e);
                    return;
                }
            };

            let (key_value, key_type) = match prop.ptype {
                PropType::Text => (value_hash, ResultType::Text),
                PropType::Double => {
                    let keyed = match bucket_scaled {
                        Some(bucket) => value_hash.div_euclid(bucket) * bucket,
                        None => value_hash,
                    };
                    (keyed, ResultType::Double)
                }
                PropType::Bool => (value_hash, ResultType::Bool),
                PropType::Int => {
                    let keyed = match bucket_scaled {
                        Some(bucket) => {
                            let step = bucket / crate::common::UNIT_SCALE;
                            if step > 0 {
                                value_hash.div_euclid(step) * step
                            } else {
                                value_hash
                            }
                        }
                        None => value_hash,
                    };
                    (keyed, ResultType::Int)
                }
            };

            if key_type == ResultType::Text {
                if let Some(text) = parts.attributes.blob().get(value_hash) {
                    result.add_local_text(value_hash, &text);
                }
            }

            let mut key = RowKey::default();
            key.key[0] = key_value;
            key.types[0] = key_type;
            let accums = result.accum_mut(key);
            accums[0].count += bits.population(stop_bit) as i32;
            for (lane, segment_bits) in lanes.iter().enumerate() {
                let mut overlap = bits.clone();
                overlap.op_and(segment_bits);
                accums[lane + 1].count += overlap.population(stop_bit) as i32;
            }
        }

        result.make_sorted();
        self.finished = true;
        self.collector.complete(result);
        ctx.suicide();
    }

    fn partition_removed(&mut self) {
        if !self.finished {
            self.finished = true;
            self.collector.fail(Error::new(
                crate::error::ErrorClass::Internode,
                ErrorCode::PartitionMigrated,
                "partition migrated during property scan",
            ));
        }
    }
}
