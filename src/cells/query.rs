// Per-partition query execution: realtime cells that evaluate the index
// plan, walk matching customers through the interpreter and hand their
// local result set to the collector. A partition migrating mid-flight
// reports a retryable error instead of a result.

use super::Collector;
use crate::bitmap::IndexBits;
use crate::error::{Error, ErrorCode};
use crate::grid::Grid;
use crate::query::{indexing, InterpretMode, Interpreter, Macro};
use crate::result::{ResultSet, ResultType, RowKey};
use crate::scheduler::{Cell, CellCtx, Priority};
use std::sync::Arc;

struct QueryJob {
    cursor: i64,
    index: IndexBits,
    stop_bit: usize,
    grid: Grid,
    interpreter: Interpreter,
    result: ResultSet,
}

pub struct OpenLoopQuery {
    table: String,
    macros: Arc<Macro>,
    segments: Vec<String>,
    collector: Arc<Collector<ResultSet>>,
    job: Option<QueryJob>,
    finished: bool,
}

impl OpenLoopQuery {
    pub fn new(
        table: &str,
        macros: Arc<Macro>,
        segments: Vec<String>,
        collector: Arc<Collector<ResultSet>>,
    ) -> Self {
        Self {
            table: table.to_string(),
            macros,
            segments,
            collector,
            job: None,
            finished: false,
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

impl Cell for OpenLoopQuery {
    fn name(&self) -> &'static str {
        "query"
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
        let plan = match indexing::build_index(&self.macros, &mut parts.attributes, &schema, stop_bit)
        {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(ctx, e);
                return;
            }
        };

        let mut lanes = Vec::new();
        for name in &self.segments {
            match parts.get_segment_bits(name) {
                Some(bits) => lanes.push((name.clone(), bits)),
                None => {
                    self.fail(
                        ctx,
                        Error::query(ErrorCode::ItemNotFound, format!("unknown segment '{name}'")),
                    );
                    return;
                }
            }
        }

        let width = self.macros.aggs.len() * (1 + lanes.len());
        let mut result = ResultSet::new(width);

        // fully countable with no script body: index math answers it
        let body_is_empty = self
            .macros
            .blocks
            .first()
            .map(|b| b.iter().all(|i| matches!(i.op, crate::query::OpCode::Term)))
            .unwrap_or(true);
        if plan.countable && body_is_empty {
            let mut key = RowKey::default();
            key.key[0] = 0;
            key.types[0] = ResultType::Int;
            let accums = result.accum_mut(key);
            accums[0].count = plan.bits.population(stop_bit) as i32;
            result.make_sorted();
            self.finish(ctx, result);
            return;
        }

        let mut grid = Grid::new();
        let projection = self.macros.referenced_names();
        if let Err(e) = grid.map_table(&schema, Some(&projection)) {
            self.fail(ctx, e);
            return;
        }
        grid.set_session_time(table.settings.read().session_time_ms);

        let snapshot = parts.segment_snapshot();
        let mut interpreter = Interpreter::new(self.macros.clone(), InterpretMode::Query);
        interpreter.set_exec_limit(ctx.services.config.exec_limit);
        interpreter.set_blob(parts.attributes.blob().clone());
        interpreter.set_stop_bit(stop_bit);
        interpreter.set_lanes(lanes);
        interpreter.set_segment_resolver(Box::new(move |name: &str| snapshot.get(name).cloned()));

        self.job = Some(QueryJob {
            cursor: -1,
            index: plan.bits,
            stop_bit,
            grid,
            interpreter,
            result,
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
            if let Err(e) = job.interpreter.exec(&job.grid, &record, &mut job.result) {
                self.fail(ctx, e);
                return;
            }
        }
        self.job = Some(job);
    }

    fn partition_removed(&mut self) {
        if !self.finished {
            self.finished = true;
            self.collector.fail(Error::new(
                crate::error::ErrorClass::Internode,
                ErrorCode::PartitionMigrated,
                "partition migrated during query",
            ));
        }
    }
}
