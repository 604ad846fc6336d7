// Scripted histogram: runs the script per customer, buckets the return
// value to the nearest bucket boundary and counts customers per bucket.
// With `foreach`, the script runs once per distinct value of the named
// property, with that value bound to the script variable of the same
// name.

use super::Collector;
use crate::bitmap::IndexBits;
use crate::common::NONE;
use crate::error::Error;
use crate::grid::Grid;
use crate::query::{indexing, InterpretMode, Interpreter, Macro, Modifier, Value};
use crate::result::{ResultSet, ResultType, RowKey};
use crate::scheduler::{Cell, CellCtx, Priority};
use std::sync::Arc;

pub struct OpenLoopHistogram {
    table: String,
    macros: Arc<Macro>,
    /// bucket size in the scaled domain; 0 = no bucketing
    bucket: i64,
    foreach: Option<String>,
    collector: Arc<Collector<ResultSet>>,
    job: Option<HistogramJob>,
    finished: bool,
}

struct HistogramJob {
    cursor: i64,
    index: IndexBits,
    stop_bit: usize,
    grid: Grid,
    interpreter: Interpreter,
    result: ResultSet,
}

impl OpenLoopHistogram {
    pub fn new(
        table: &str,
        macros: Arc<Macro>,
        bucket: i64,
        foreach: Option<String>,
        collector: Arc<Collector<ResultSet>>,
    ) -> Self {
        Self {
            table: table.to_string(),
            macros,
            bucket,
            foreach,
            collector,
            job: None,
            finished: false,
        }
    }

    fn bucket_key(&self, value: &Value) -> Option<(i64, ResultType)> {
        let (raw, rtype) = match value {
            Value::Int(v) => (*v, ResultType::Int),
            Value::Float(v) => (*v, ResultType::Double),
            Value::Bool(b) => (*b as i64, ResultType::Int),
            _ => return None,
        };
        if raw == NONE {
            return None;
        }
        if self.bucket <= 0 {
            return Some((raw, rtype));
        }
        // nearest bucket boundary
        let bucketed =
            ((raw as f64 / self.bucket as f64).round() as i64).saturating_mul(self.bucket);
        Some((bucketed, rtype))
    }

    fn tally_return(&self, interpreter: &Interpreter, result: &mut ResultSet) {
        for value in &interpreter.returns {
            let values: Vec<&Value> = match value {
                Value::List(items) => items.iter().collect(),
                single => vec![single],
            };
            for single in values {
                let Some((bucketed, rtype)) = self.bucket_key(single) else {
                    continue;
                };
                let mut key = RowKey::default();
                key.key[0] = bucketed;
                key.types[0] = rtype;
                result.accum_mut(key)[0].apply(Modifier::Count, 0);
            }
        }
    }

    fn finish(&mut self, ctx: &mut CellCtx, result: ResultSet) {
        self.finished = true;
        self.collector.complete(result);
        ctx.suicide();
    }

    fn fail(&mut self, ctx: &mut CellCtx, error: Error) {
        self.finished = true;
        self.collector.fail(error);
        ctx.suicide();
    }
}

impl Cell for OpenLoopHistogram {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn priority(&self) -> Priority {
        Priority::Realtime
    }

    fn table(&self) -> Option<&str> {
        Some(&self.table)
    }

    fn prepare(&mut self, ctx: &mut CellCtx) {
        let Some(table) = ctx.services.db.get_table(&self.table) else {
            self.fail(ctx, Error::config(format!("no table '{}'", self.table)));
            return;
        };
        let Some(parts) = table.get_partition_objects(ctx.services, ctx.partition, true) else {
            self.fail(ctx, Error::partition_migrated(ctx.partition));
            return;
        };
        let mut parts = parts.lock();

        let stop_bit = parts.people.customer_count();
        let schema = table.properties.read().clone();
        let plan =
            match indexing::build_index(&self.macros, &mut parts.attributes, &schema, stop_bit) {
                Ok(plan) => plan,
                Err(e) => {
                    self.fail(ctx, e);
                    return;
                }
            };

        let mut grid = Grid::new();
        let mut projection = self.macros.referenced_names();
        if let Some(prop) = &self.foreach {
            if !projection.contains(prop) {
                projection.push(prop.clone());
            }
        }
        if let Err(e) = grid.map_table(&schema, Some(&projection)) {
            self.fail(ctx, e);
            return;
        }
        grid.set_session_time(table.settings.read().session_time_ms);

        let mut interpreter = Interpreter::new(self.macros.clone(), InterpretMode::Query);
        interpreter.set_exec_limit(ctx.services.config.exec_limit);
        interpreter.set_blob(parts.attributes.blob().clone());
        interpreter.set_stop_bit(stop_bit);

        self.job = Some(HistogramJob {
            cursor: -1,
            index: plan.bits,
            stop_bit,
            grid,
            interpreter,
            result: ResultSet::new(1),
        });
    }

    fn run(&mut self, ctx: &mut CellCtx) {
        if self.finished {
            ctx.suicide();
            return;
        }
        let Some(mut job) = self.job.take() else {
            ctx.suicide();
            return;
        };
        let Some(table) = ctx.services.db.get_table(&self.table) else {
            self.fail(ctx, Error::config(format!("no table '{}'", self.table)));
            return;
        };
        let Some(parts) = table.get_partition_objects(ctx.services, ctx.partition, false) else {
            self.fail(ctx, Error::partition_migrated(ctx.partition));
            return;
        };
        let parts = parts.lock();
        let foreach_name = self.foreach.clone();
        let foreach_prop = foreach_name
            .as_ref()
            .and_then(|name| table.properties.read().get(name).cloned());

        while !ctx.slice_complete() {
            if !job.index.linear_iter(&mut job.cursor, job.stop_bit) {
                let mut result = job.result;
                result.make_sorted();
                self.finish(ctx, result);
                return;
            }
            let linear = job.cursor as usize;
            let Some(record) = parts.people.get_by_lin(linear) else {
                continue;
            };
            job.grid.mount(record.clone());
            if let Err(e) = job.grid.prepare() {
                self.fail(ctx, e);
                return;
            }

            match (&foreach_name, &foreach_prop) {
                (Some(name), Some(prop)) => {
                    // distinct values of the property across the grid
                    let mut seen: Vec<i64> = Vec::new();
                    for row in job.grid.rows() {
                        for value in row.values(prop.id) {
                            if !seen.contains(&value) {
                                seen.push(value);
                            }
                        }
                    }
                    for raw in seen {
                        let bound = match prop.ptype {
                            crate::table::properties::PropType::Int => Value::Int(raw),
                            crate::table::properties::PropType::Double => Value::Float(raw),
                            crate::table::properties::PropType::Bool => Value::Bool(raw != 0),
                            crate::table::properties::PropType::Text => Value::Text(raw),
                        };
                        job.interpreter.preset_var(name, bound);
                        if let Err(e) = job.interpreter.exec(&job.grid, &record, &mut job.result)
                        {
                            self.fail(ctx, e);
                            return;
                        }
                        self.tally_return(&job.interpreter, &mut job.result);
                    }
                }
                _ => {
                    if let Err(e) = job.interpreter.exec(&job.grid, &record, &mut job.result) {
                        self.fail(ctx, e);
                        return;
                    }
                    self.tally_return(&job.interpreter, &mut job.result);
                }
            }
        }
        self.job = Some(job);
    }

    fn partition_removed(&mut self) {
        if !self.finished {
            self.finished = true;
            self.collector.fail(Error::new(
                crate::error::ErrorClass::Internode,
                crate::error::ErrorCode::PartitionMigrated,
                "partition migrated during histogram",
            ));
        }
    }
}
