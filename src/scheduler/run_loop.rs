use super::cell::{Cell, CellCtx, Priority};
use crate::common::now_ms;
use crate::Services;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

pub(crate) struct CellSlot {
    pub cell: Box<dyn Cell>,
    pub prepared: bool,
    pub run_at: i64,
    pub priority: Priority,
}

struct LoopInner {
    active: Vec<CellSlot>,
    completed: Vec<CellSlot>,
    loop_count: u64,
}

/// One partition's cooperative loop: a FIFO of cells run single-threaded
/// by whichever worker owns the partition. Queuing is the only cross-
/// thread entry point.
pub struct AsyncLoop {
    pub partition: usize,
    queued: Mutex<Vec<CellSlot>>,
    inner: Mutex<LoopInner>,
    pub realtime: AtomicI32,
}

impl AsyncLoop {
    pub fn new(partition: usize) -> Self {
        Self {
            partition,
            queued: Mutex::new(Vec::new()),
            inner: Mutex::new(LoopInner {
                active: Vec::new(),
                completed: Vec::new(),
                loop_count: 0,
            }),
            realtime: AtomicI32::new(0),
        }
    }

    /// May be called from any thread.
    pub fn queue_cell(&self, cell: Box<dyn Cell>) {
        self.queue_cell_at(cell, 0);
    }

    pub fn queue_cell_at(&self, cell: Box<dyn Cell>, run_at: i64) {
        let priority = cell.priority();
        if priority == Priority::Realtime {
            self.realtime.fetch_add(1, Ordering::SeqCst);
        }
        self.queued.lock().push(CellSlot {
            cell,
            prepared: false,
            run_at,
            priority,
        });
    }

    pub fn queued_len(&self) -> usize {
        self.queued.lock().len() + self.inner.lock().active.len()
    }

    fn retire(&self, slot: CellSlot, completed: &mut Vec<CellSlot>) {
        if slot.priority == Priority::Realtime {
            self.realtime.fetch_sub(1, Ordering::SeqCst);
        }
        completed.push(slot);
    }

    /// One pass over the active cells. Returns true if any cell did work;
    /// `next_run` collects the soonest future `run_at` seen (-1 = none).
    pub fn run(
        &self,
        services: &Arc<Services>,
        slice_ms: i64,
        bypass_divisor: i64,
        cleanup_every: u64,
        next_run: &mut i64,
    ) -> bool {
        let mut inner = self.inner.lock();

        // inject queued work; prepare happens on this thread, not the caller's
        {
            let mut queued = self.queued.lock();
            inner.active.append(&mut *queued);
        }

        if inner.active.is_empty() {
            return false;
        }

        let mut run_count = 0u32;
        let mut rerun: Vec<CellSlot> = Vec::with_capacity(inner.active.len());
        let mut completed_now: Vec<CellSlot> = Vec::new();
        let mut spawned_all: Vec<(Box<dyn Cell>, i64)> = Vec::new();

        for mut slot in std::mem::take(&mut inner.active) {
            let now = now_ms();
            let realtime_running = self.realtime.load(Ordering::SeqCst) > 0;
            let bypass = slot.priority == Priority::Background && realtime_running;

            if now <= slot.run_at {
                if *next_run == -1 || slot.run_at < *next_run {
                    *next_run = slot.run_at;
                }
                rerun.push(slot);
                continue;
            }

            let effective_slice = if bypass {
                slice_ms / bypass_divisor.max(1)
            } else {
                slice_ms
            };
            let mut ctx = CellCtx::new(services, self.partition, effective_slice, bypass);
            if !slot.prepared {
                slot.cell.prepare(&mut ctx);
                slot.prepared = true;
            }
            if !ctx.done {
                slot.cell.run(&mut ctx);
                run_count += 1;
            }

            if let Some(run_at) = ctx.run_at {
                slot.run_at = run_at;
                if !ctx.done && run_at > now && (*next_run == -1 || run_at < *next_run) {
                    *next_run = run_at;
                }
            }
            spawned_all.append(&mut ctx.spawned);

            if ctx.done {
                self.retire(slot, &mut completed_now);
            } else {
                rerun.push(slot);
            }
        }

        inner.active = rerun;
        inner.completed.append(&mut completed_now);

        // spawned cells enter through the queue so they see a fresh pass
        {
            let mut queued = self.queued.lock();
            for (cell, run_at) in spawned_all {
                let priority = cell.priority();
                if priority == Priority::Realtime {
                    self.realtime.fetch_add(1, Ordering::SeqCst);
                }
                queued.push(CellSlot {
                    cell,
                    prepared: false,
                    run_at,
                    priority,
                });
            }
        }

        // low tech garbage collection
        inner.loop_count += 1;
        if inner.loop_count % cleanup_every == 0 && !inner.completed.is_empty() {
            inner.completed.clear();
        }

        run_count > 0
    }

    /// Shift every pending timer forward, so a suspend window does not
    /// burn scheduled delays.
    pub fn shift_timers(&self, delta_ms: i64) {
        for slot in self.queued.lock().iter_mut() {
            if slot.run_at > 0 {
                slot.run_at += delta_ms;
            }
        }
        for slot in self.inner.lock().active.iter_mut() {
            if slot.run_at > 0 {
                slot.run_at += delta_ms;
            }
        }
    }

    /// Drop all cells, giving each a chance at graceful error handling.
    pub fn release(&self) {
        let mut queued = self.queued.lock();
        for slot in queued.iter_mut() {
            slot.cell.partition_removed();
        }
        queued.clear();
        drop(queued);

        let mut inner = self.inner.lock();
        for slot in inner.active.iter_mut() {
            slot.cell.partition_removed();
        }
        inner.active.clear();
        inner.completed.clear();
    }

    /// Remove cells belonging to a dropped table.
    pub fn purge_by_table(&self, table: &str) {
        let purge = |slots: &mut Vec<CellSlot>, realtime: &AtomicI32| {
            slots.retain_mut(|slot| {
                if slot.cell.table() == Some(table) {
                    slot.cell.partition_removed();
                    if slot.priority == Priority::Realtime {
                        realtime.fetch_sub(1, Ordering::SeqCst);
                    }
                    false
                } else {
                    true
                }
            });
        };
        purge(&mut self.queued.lock(), &self.realtime);
        purge(&mut self.inner.lock().active, &self.realtime);
    }
}
