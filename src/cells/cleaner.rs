// Retention sweeper: walks the partition's customers applying the cull
// policy, committing shrunken grids and dropping customers whose history
// emptied out.

use crate::common::now_ms;
use crate::grid::Grid;
use crate::scheduler::{Cell, CellCtx};
use tracing::warn;

pub struct OpenLoopCleaner {
    table: String,
    linear_id: usize,
}

impl OpenLoopCleaner {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            linear_id: 0,
        }
    }
}

impl Cell for OpenLoopCleaner {
    fn name(&self) -> &'static str {
        "cleaner"
    }

    fn table(&self) -> Option<&str> {
        Some(&self.table)
    }

    fn prepare(&mut self, ctx: &mut CellCtx) {
        self.linear_id = 0;
        let missing = ctx
            .services
            .db
            .get_table(&self.table)
            .and_then(|t| t.get_partition_objects(ctx.services, ctx.partition, false))
            .is_none();
        if missing {
            ctx.suicide();
        }
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

        let policy = table.settings.read().cull_policy();
        let session_time = table.settings.read().session_time_ms;
        let maint_interval = table.settings.read().maint_interval_ms;

        let mut grid = Grid::new();
        if grid.map_table(&table.properties.read(), None).is_err() {
            ctx.suicide();
            return;
        }
        grid.set_session_time(session_time);

        let now = now_ms();
        let mut dirty = false;

        loop {
            if ctx.slice_complete() {
                if dirty {
                    parts.attributes.clear_dirty();
                }
                return; // let other open loops run; we resume here
            }
            if self.linear_id >= parts.people.customer_count() {
                if dirty {
                    parts.attributes.clear_dirty();
                }
                // respawn a fresh sweep on the maintenance cadence
                ctx.spawn(Box::new(OpenLoopCleaner::new(&self.table)), maint_interval);
                ctx.suicide();
                return;
            }

            let linear_id = self.linear_id;
            self.linear_id += 1;

            let Some(record) = parts.people.get_by_lin(linear_id) else {
                continue;
            };
            grid.mount(record);
            if let Err(e) = grid.prepare() {
                warn!(error = %e, linear_id, "cleaner skipping unreadable customer");
                continue;
            }
            if !grid.cull(&policy, now) {
                continue;
            }
            dirty = true;
            if grid.rows().is_empty() {
                let id_hash = grid.meta().map(|m| m.id_hash).unwrap_or(0);
                parts.people.drop_customer(id_hash);
            } else {
                match grid.commit() {
                    Ok(committed) => parts.people.replace(committed),
                    Err(e) => warn!(error = %e, "cull commit failed"),
                }
            }
        }
    }
}
