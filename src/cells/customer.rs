// Single-customer fetch: a realtime cell that mounts one grid and
// renders the event history as JSON through its reply shuttle.

use crate::common::{hash_customer_id, partition_for};
use crate::error::{Error, ErrorCode, Result};
use crate::grid::Grid;
use crate::scheduler::{Cell, CellCtx, Priority};
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub struct OpenLoopCustomer {
    table: String,
    id: String,
    shuttle: Mutex<Option<oneshot::Sender<Result<serde_json::Value>>>>,
}

impl OpenLoopCustomer {
    pub fn new(
        table: &str,
        id: &str,
        shuttle: oneshot::Sender<Result<serde_json::Value>>,
    ) -> Self {
        Self {
            table: table.to_string(),
            id: id.to_string(),
            shuttle: Mutex::new(Some(shuttle)),
        }
    }

    /// The partition this customer lives on.
    pub fn home_partition(id: &str, partition_max: usize) -> usize {
        partition_for(hash_customer_id(id), partition_max)
    }

    fn reply(&self, response: Result<serde_json::Value>) {
        if let Some(tx) = self.shuttle.lock().take() {
            let _ = tx.send(response);
        }
    }
}

impl Cell for OpenLoopCustomer {
    fn name(&self) -> &'static str {
        "customer"
    }

    fn priority(&self) -> Priority {
        Priority::Realtime
    }

    fn table(&self) -> Option<&str> {
        Some(&self.table)
    }

    fn prepare(&mut self, _ctx: &mut CellCtx) {}

    fn run(&mut self, ctx: &mut CellCtx) {
        let response = (|| -> Result<serde_json::Value> {
            let table = ctx
                .services
                .db
                .require_table(&self.table)?;
            let parts = table
                .get_partition_objects(ctx.services, ctx.partition, true)
                .ok_or_else(|| Error::partition_migrated(ctx.partition))?;
            let parts = parts.lock();

            let record = parts.people.get_by_id(&self.id).ok_or_else(|| {
                Error::query(
                    ErrorCode::ItemNotFound,
                    format!("customer '{}' not found", self.id),
                )
            })?;

            let schema = table.properties.read().clone();
            let mut grid = Grid::new();
            grid.map_table(&schema, None)?;
            grid.set_session_time(table.settings.read().session_time_ms);
            grid.mount(record);
            grid.prepare()?;
            Ok(grid.to_json(&schema, parts.attributes.blob()))
        })();

        self.reply(response);
        ctx.suicide();
    }

    fn partition_removed(&mut self) {
        self.reply(Err(Error::new(
            crate::error::ErrorClass::Internode,
            ErrorCode::PartitionMigrated,
            "partition migrated during fetch",
        )));
    }
}
