// The segment refresh loop.
//
// Walks segments whose refresh is due. Countable plans short-circuit to
// pure index math: the planner's bitmap replaces the segment's, and the
// diff becomes enter/exit messages. Segment-math scripts combine other
// segments with no customer iteration. Everything else walks the index's
// matching customers through the cached interpreter, one slice at a
// time.

use crate::bitmap::IndexBits;
use crate::common::now_ms;
use crate::grid::{CustomerData, Grid};
use crate::partition::TablePartitioned;
use crate::query::indexing;
use crate::result::ResultSet;
use crate::scheduler::{Cell, CellCtx};
use crate::segments::emit_differences;
use crate::table::Table;
use std::sync::Arc;
use tracing::{info, warn};

struct WalkJob {
    name: String,
    cursor: i64,
    index: IndexBits,
    stop_bit: usize,
    start_population: u64,
}

pub struct OpenLoopSegmentRefresh {
    table: String,
    due: Vec<String>,
    job: Option<WalkJob>,
    holding_usage: bool,
}

impl OpenLoopSegmentRefresh {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            due: Vec::new(),
            job: None,
            holding_usage: false,
        }
    }

    fn release_usage(&mut self, parts: &mut TablePartitioned) {
        if self.holding_usage {
            parts.segment_usage_count -= 1;
            self.holding_usage = false;
        }
    }

    fn respawn(&mut self, ctx: &mut CellCtx, table: &Table, parts: &mut TablePartitioned) {
        self.release_usage(parts);
        let interval = table.settings.read().segment_interval_ms;
        ctx.spawn(
            Box::new(OpenLoopSegmentRefresh::new(&self.table)),
            interval,
        );
        ctx.suicide();
    }

    /// Start work on the next due segment. Returns a walk job when the
    /// segment needs customer iteration; index-math segments finish
    /// inline.
    fn next_due(
        &mut self,
        ctx: &mut CellCtx,
        table: &Table,
        parts: &mut TablePartitioned,
    ) -> Option<WalkJob> {
        let exec_limit = ctx.services.config.exec_limit;

        while let Some(name) = self.due.pop() {
            let stop_bit = parts.people.customer_count();
            let Some(segment) = parts.segments.get(&name) else {
                continue;
            };
            let macros = segment.macros.clone();
            let is_math = segment.macros.is_segment_math;

            let schema = table.properties.read().clone();
            let plan = match indexing::build_index(&macros, &mut parts.attributes, &schema, stop_bit)
            {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(segment = %name, error = %e, "index plan failed");
                    continue;
                }
            };

            // pure index math: the plan result is the segment
            if plan.countable && !is_math {
                let before = match parts.get_segment_bits(&name) {
                    Some(bits) => bits,
                    None => IndexBits::new(),
                };
                let mut messages = Vec::new();
                {
                    let TablePartitioned {
                        segments, people, ..
                    } = &mut *parts;
                    let segment = segments.get_mut(&name).unwrap();
                    emit_differences(
                        segment,
                        &before,
                        &plan.bits,
                        stop_bit,
                        |lin| people.get_by_lin(lin).map(|c| c.id.clone()),
                        &mut messages,
                    );
                }
                let delta = plan.bits.population(stop_bit) as i64 - before.population(stop_bit) as i64;
                {
                    let TablePartitioned {
                        segments,
                        attributes,
                        ..
                    } = &mut *parts;
                    let segment = segments.get_mut(&name).unwrap();
                    if let Err(e) = segment.store_bits(attributes, &plan.bits) {
                        warn!(segment = %name, error = %e, "segment store failed");
                    }
                    segment.schedule_next_refresh();
                }
                parts.push_messages(messages);
                if delta != 0 {
                    info!(table = %self.table, segment = %name, delta, "segment refresh");
                }
                continue;
            }

            // segment math: evaluate against a snapshot, no iteration
            if is_math {
                let before = parts.get_segment_bits(&name).unwrap_or_default();
                let snapshot = parts.segment_snapshot();
                let blob = parts.attributes.blob().clone();

                let after = {
                    let TablePartitioned { segments, .. } = &mut *parts;
                    let segment = segments.get_mut(&name).unwrap();
                    let interpreter = segment.interpreter();
                    interpreter.set_exec_limit(exec_limit);
                    interpreter.set_blob(blob);
                    interpreter.set_stop_bit(stop_bit);
                    interpreter.set_segment_resolver(Box::new(move |segment_name: &str| {
                        snapshot.get(segment_name).cloned()
                    }));

                    let grid = Grid::new();
                    let dummy = Arc::new(CustomerData {
                        id_hash: 0,
                        id: String::new(),
                        linear_id: 0,
                        flags: 0,
                        blob: Vec::new(),
                    });
                    let mut sink = ResultSet::new(1);
                    match interpreter.exec(&grid, &dummy, &mut sink) {
                        Ok(()) => interpreter.last_return_bits(),
                        Err(e) => {
                            warn!(segment = %name, error = %e, "segment math failed");
                            None
                        }
                    }
                };

                if let Some(after) = after {
                    let mut messages = Vec::new();
                    {
                        let TablePartitioned {
                            segments, people, ..
                        } = &mut *parts;
                        let segment = segments.get_mut(&name).unwrap();
                        emit_differences(
                            segment,
                            &before,
                            &after,
                            stop_bit,
                            |lin| people.get_by_lin(lin).map(|c| c.id.clone()),
                            &mut messages,
                        );
                    }
                    let TablePartitioned {
                        segments,
                        attributes,
                        ..
                    } = &mut *parts;
                    let segment = segments.get_mut(&name).unwrap();
                    if let Err(e) = segment.store_bits(attributes, &after) {
                        warn!(segment = %name, error = %e, "segment store failed");
                    }
                    segment.schedule_next_refresh();
                    parts.push_messages(messages);
                } else if let Some(segment) = parts.segments.get_mut(&name) {
                    segment.schedule_next_refresh();
                }
                continue;
            }

            // a real script: walk matching customers
            let start_population = parts
                .get_segment_bits(&name)
                .map(|bits| bits.population(stop_bit))
                .unwrap_or(0);
            return Some(WalkJob {
                name,
                cursor: -1,
                index: plan.bits,
                stop_bit,
                start_population,
            });
        }
        None
    }

    /// Continue a customer walk; true when the segment is finished.
    fn walk(
        &mut self,
        ctx: &mut CellCtx,
        table: &Table,
        parts: &mut TablePartitioned,
        job: &mut WalkJob,
    ) -> bool {
        let exec_limit = ctx.services.config.exec_limit;
        let session_time = table.settings.read().session_time_ms;

        let mut grid = Grid::new();
        {
            let schema = table.properties.read();
            let Some(segment) = parts.segments.get(&job.name) else {
                return true;
            };
            let projection = segment.macros.referenced_names();
            if grid.map_table(&schema, Some(&projection)).is_err() {
                return true;
            }
        }
        grid.set_session_time(session_time);

        let snapshot = parts.segment_snapshot();
        let blob = parts.attributes.blob().clone();
        let mut messages = Vec::new();

        while !ctx.slice_complete() {
            if !job.index.linear_iter(&mut job.cursor, job.stop_bit) {
                // done: store, emit the delta, move on
                let TablePartitioned {
                    segments,
                    attributes,
                    ..
                } = &mut *parts;
                if let Some(segment) = segments.get_mut(&job.name) {
                    segment.schedule_next_refresh();
                }
                attributes.clear_dirty();
                parts.push_messages(std::mem::take(&mut messages));
                let end_population = parts
                    .get_segment_bits(&job.name)
                    .map(|bits| bits.population(job.stop_bit))
                    .unwrap_or(0);
                let delta = end_population as i64 - job.start_population as i64;
                if delta != 0 {
                    info!(table = %self.table, segment = %job.name, delta, "segment refresh");
                }
                return true;
            }

            let linear = job.cursor as usize;
            let Some(record) = parts.people.get_by_lin(linear) else {
                continue;
            };
            grid.mount(record.clone());
            if let Err(e) = grid.prepare() {
                warn!(error = %e, linear, "refresh skipping unreadable customer");
                continue;
            }

            let TablePartitioned {
                segments,
                attributes,
                ..
            } = &mut *parts;
            let Some(segment) = segments.get_mut(&job.name) else {
                return true;
            };
            let snapshot = snapshot.clone();
            let interpreter = segment.interpreter();
            interpreter.set_exec_limit(exec_limit);
            interpreter.set_blob(blob.clone());
            interpreter.set_stop_bit(job.stop_bit);
            interpreter
                .set_segment_resolver(Box::new(move |name: &str| snapshot.get(name).cloned()));

            let mut sink = ResultSet::new(1);
            let in_segment = match interpreter.exec(&grid, &record, &mut sink) {
                Ok(()) => interpreter.last_return_truthy(),
                Err(e) => {
                    warn!(segment = %job.name, error = %e, "refresh aborted");
                    if let Some(segment) = segments.get_mut(&job.name) {
                        segment.schedule_next_refresh();
                    }
                    return true;
                }
            };

            match segment.set_bit(attributes, linear, in_segment) {
                Ok(Some(change)) => {
                    messages.push(segment.make_message(change, record.id.clone()));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "segment bit update failed"),
            }
        }

        parts.push_messages(messages);
        false
    }
}

impl Cell for OpenLoopSegmentRefresh {
    fn name(&self) -> &'static str {
        "segment_refresh"
    }

    fn table(&self) -> Option<&str> {
        Some(&self.table)
    }

    fn prepare(&mut self, ctx: &mut CellCtx) {
        let Some(table) = ctx.services.db.get_table(&self.table) else {
            ctx.suicide();
            return;
        };
        let Some(parts) = table.get_partition_objects(ctx.services, ctx.partition, false) else {
            ctx.suicide();
            return;
        };
        let mut parts = parts.lock();
        parts.sync_segments_with_table(&table);
        parts.segment_usage_count += 1;
        self.holding_usage = true;

        let now = now_ms();
        self.due = parts
            .segments
            .iter()
            .filter(|(_, seg)| {
                seg.is_refresh_due(now) || (seg.ttl_ms > 0 && seg.ttl_expires <= now)
            })
            .map(|(name, _)| name.clone())
            .collect();
    }

    fn run(&mut self, ctx: &mut CellCtx) {
        let Some(table) = ctx.services.db.get_table(&self.table) else {
            ctx.suicide();
            return;
        };
        let Some(parts) = table.get_partition_objects(ctx.services, ctx.partition, false) else {
            ctx.suicide();
            return;
        };
        let mut parts = parts.lock();

        loop {
            if ctx.slice_complete() {
                parts.flush_messages(&table);
                return;
            }

            let mut job = match self.job.take() {
                Some(job) => job,
                None => match self.next_due(ctx, &table, &mut parts) {
                    Some(job) => job,
                    None => {
                        parts.flush_messages(&table);
                        self.respawn(ctx, &table, &mut parts);
                        return;
                    }
                },
            };

            if !self.walk(ctx, &table, &mut parts, &mut job) {
                self.job = Some(job);
                parts.flush_messages(&table);
                return;
            }
        }
    }

    fn partition_removed(&mut self) {
        // usage count lives on the partition object being dropped
        self.holding_usage = false;
    }
}
