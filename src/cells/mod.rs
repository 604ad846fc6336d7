// The open-loop cells: the standing per-partition jobs (insert drain,
// segment refresh, cleaner) and the per-request jobs (query, customer
// fetch, histograms). Each is a small state machine the scheduler drives
// cooperatively; anything long-running checks `slice_complete` and
// yields.

mod cleaner;
mod customer;
mod histogram;
mod insert;
mod property;
mod query;
mod segment_refresh;

pub use cleaner::OpenLoopCleaner;
pub use customer::OpenLoopCustomer;
pub use histogram::OpenLoopHistogram;
pub use insert::OpenLoopInsert;
pub use property::{OpenLoopProperty, PropertyFilter};
pub use query::OpenLoopQuery;
pub use segment_refresh::OpenLoopSegmentRefresh;

use crate::error::Error;
use crate::Services;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fan-in point for per-partition jobs: each participating cell either
/// completes with an item or fails; when the last one reports, the
/// waiting request is notified. The first error wins.
pub struct Collector<T> {
    pending: AtomicUsize,
    items: Mutex<Vec<T>>,
    error: Mutex<Option<Error>>,
    notify: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl<T> Collector<T> {
    pub fn new(pending: usize, notify: tokio::sync::oneshot::Sender<()>) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(pending.max(1)),
            items: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            notify: Mutex::new(Some(notify)),
        })
    }

    pub fn complete(&self, item: T) {
        self.items.lock().push(item);
        self.countdown();
    }

    pub fn fail(&self, error: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.countdown();
    }

    fn countdown(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(tx) = self.notify.lock().take() {
                let _ = tx.send(());
            }
        }
    }

    /// Drain the results after the notify fires.
    pub fn take(&self) -> (Vec<T>, Option<Error>) {
        (
            std::mem::take(&mut *self.items.lock()),
            self.error.lock().take(),
        )
    }
}

/// Queue the standing cells for a freshly created table partition.
pub fn spawn_standing_cells(services: &Arc<Services>, table: &str, partition: usize) {
    let (segment_interval, maint_interval) = services
        .db
        .get_table(table)
        .map(|t| {
            let settings = t.settings.read();
            (settings.segment_interval_ms, settings.maint_interval_ms)
        })
        .unwrap_or((60_000, 300_000));

    services
        .pool
        .queue_cell_delayed(partition, Box::new(OpenLoopInsert::new(table)), 1_000);
    services.pool.queue_cell_delayed(
        partition,
        Box::new(OpenLoopSegmentRefresh::new(table)),
        segment_interval,
    );
    services.pool.queue_cell_delayed(
        partition,
        Box::new(OpenLoopCleaner::new(table)),
        maint_interval,
    );
}
