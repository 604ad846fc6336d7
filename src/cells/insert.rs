// The insert drain: pulls pending rows off the side log, applies all of
// one customer's events in a single mount/commit, then runs the
// on-insert segments in z-index order.

use crate::cluster::NodeState;
use crate::error::ErrorCode;
use crate::grid::Grid;
use crate::partition::TablePartitioned;
use crate::result::ResultSet;
use crate::scheduler::{Cell, CellCtx};
use crate::table::Table;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct OpenLoopInsert {
    table: String,
    sleep_counter: i64,
}

impl OpenLoopInsert {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            sleep_counter: 0,
        }
    }

    fn extract_id(row: &serde_json::Value) -> Option<String> {
        for key in ["person", "id", "profile"] {
            match row.get(key) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => {
                    return Some(s.to_lowercase())
                }
                Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
                _ => {}
            }
        }
        None
    }

    fn run_on_insert_segments(
        parts: &mut TablePartitioned,
        grid: &Grid,
        customer: &Arc<crate::grid::CustomerData>,
        exec_limit: u64,
    ) {
        let order = parts.on_insert_order.clone();
        if order.is_empty() {
            return;
        }
        let snapshot = parts.segment_snapshot();
        let customer_count = parts.people.customer_count();

        let TablePartitioned {
            segments,
            attributes,
            ..
        } = parts;

        let mut pending = Vec::new();
        for name in order {
            let Some(segment) = segments.get_mut(&name) else {
                continue;
            };
            // segment math cannot be crunched inline; expire it so the
            // refresh loop rebuilds it on the next pass
            if segment.macros.is_segment_math {
                segment.expire_now();
                continue;
            }

            let snapshot = snapshot.clone();
            let interpreter = segment.interpreter();
            interpreter.set_exec_limit(exec_limit);
            interpreter.set_blob(attributes.blob().clone());
            interpreter.set_stop_bit(customer_count);
            interpreter
                .set_segment_resolver(Box::new(move |name: &str| snapshot.get(name).cloned()));

            let mut sink = ResultSet::new(1);
            let in_segment = match interpreter.exec(grid, customer, &mut sink) {
                Ok(()) => interpreter.last_return_truthy(),
                Err(e) => {
                    warn!(segment = %name, error = %e, "on-insert segment failed");
                    continue;
                }
            };

            match segment.set_bit(attributes, customer.linear_id, in_segment) {
                Ok(Some(change)) => {
                    pending.push(segment.make_message(change, customer.id.clone()));
                }
                Ok(None) => {}
                Err(e) => warn!(segment = %name, error = %e, "segment bit update failed"),
            }
        }
        parts.push_messages(pending);
    }

    fn build_grid(table: &Table) -> Grid {
        let mut grid = Grid::new();
        let schema = table.properties.read();
        let settings = table.settings.read();
        let _ = grid.map_table(&schema, None);
        grid.set_session_time(settings.session_time_ms);
        let order: HashMap<i64, usize> = settings
            .event_order
            .iter()
            .enumerate()
            .map(|(rank, name)| (crate::common::hash_str(name), rank))
            .collect();
        grid.set_event_order(order);
        grid
    }
}

impl Cell for OpenLoopInsert {
    fn name(&self) -> &'static str {
        "insert"
    }

    fn table(&self) -> Option<&str> {
        Some(&self.table)
    }

    fn prepare(&mut self, ctx: &mut CellCtx) {
        let Some(table) = ctx.services.db.get_table(&self.table) else {
            ctx.suicide();
            return;
        };
        if table
            .get_partition_objects(ctx.services, ctx.partition, false)
            .is_none()
        {
            ctx.suicide();
            return;
        }
        info!(table = %self.table, partition = ctx.partition, "insert job started");
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
        parts.sync_segments_with_table(&table);

        // non-active partitions backlog their inserts until promoted
        let state = ctx.services.mapper.local_state(ctx.partition);
        if state != NodeState::ActiveOwner && state != NodeState::ActiveClone {
            self.sleep_counter = 0;
            ctx.schedule_future(1_000);
            return;
        }

        let limit = if ctx.in_bypass() {
            ctx.services.config.insert_batch_bypass
        } else {
            ctx.services.config.insert_batch_hot
        };
        let (rows, handle) = ctx.services.log.read(&self.table, ctx.partition, limit);

        if rows.is_empty() {
            ctx.services
                .log
                .update_read_head(&self.table, ctx.partition, handle);
            // lazy back-off while the log is quiet
            ctx.schedule_future(self.sleep_counter.min(10) * 100);
            self.sleep_counter += 1;
            return;
        }
        self.sleep_counter = 0;

        // group rows by customer so each one pays a single mount/commit
        let mut order: Vec<String> = Vec::new();
        let mut by_customer: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
        for raw in rows {
            let Ok(row) = serde_json::from_slice::<serde_json::Value>(&raw) else {
                continue; // malformed rows are skipped, not fatal
            };
            let Some(id) = Self::extract_id(&row) else {
                continue;
            };
            if row.get("_").map(|a| a.is_object()).unwrap_or(false) {
                if !by_customer.contains_key(&id) {
                    order.push(id.clone());
                }
                by_customer.entry(id).or_default().push(row);
            }
        }

        // rows are grouped; the head can move before the grid work
        ctx.services
            .log
            .update_read_head(&self.table, ctx.partition, handle);

        let mut grid = Self::build_grid(&table);
        let exec_limit = ctx.services.config.exec_limit;

        for id in order {
            let events = by_customer.remove(&id).unwrap_or_default();
            let record = parts.people.get_make(&id);
            grid.mount(record);
            if let Err(e) = grid.prepare() {
                if e.code == ErrorCode::DataCorruption {
                    error!(table = %self.table, partition = ctx.partition, error = %e,
                        "customer blob corrupt; failing partition");
                    ctx.services.mapper.partition_map.set_state(
                        ctx.partition,
                        ctx.services.mapper.node_id(),
                        NodeState::Failed,
                    );
                    ctx.services.mapper.set_map_changed();
                    ctx.suicide();
                    return;
                }
                warn!(error = %e, "skipping customer on prepare failure");
                continue;
            }

            for event in &events {
                if let Err(e) = grid.insert(&mut parts.attributes, event) {
                    warn!(error = %e, "row skipped");
                }
            }

            match grid.commit() {
                Ok(committed) => {
                    parts.people.replace(committed.clone());
                    Self::run_on_insert_segments(&mut parts, &grid, &committed, exec_limit);
                }
                Err(e) => warn!(error = %e, "commit failed; customer unchanged"),
            }
        }

        parts.attributes.clear_dirty();
        parts.flush_messages(&table);
    }
}
