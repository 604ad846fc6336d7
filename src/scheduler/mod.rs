// The async pool: worker threads, each owning a set of per-partition
// cooperative loops.
//
// All mutation of a partition's grid/attributes/segments happens on its
// loop, so the hot path needs no locking discipline beyond "one loop, one
// thread at a time". Cross-partition work (map changes, table DDL) takes
// the process-wide suspend barrier: every worker parks at its next yield
// point and stays parked until the resume count drains. Removed
// partitions go to a zombie list and are freed after a quiescent grace.

mod cell;
mod run_loop;

pub use cell::{Cell, CellCtx, Priority};
pub use run_loop::AsyncLoop;

use crate::common::now_ms;
use crate::Services;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct PartitionSlot {
    pub run_loop: AsyncLoop,
    pub worker: AtomicUsize,
}

struct WorkerInfo {
    lock: Mutex<bool>, // the triggered flag lives under the condvar lock
    cv: Condvar,
    jobs: Mutex<Vec<usize>>,
}

struct Suspend {
    outer: Mutex<()>,
    want: AtomicBool,
    depth: AtomicI32,
    parked: AtomicI32,
    started_at: AtomicI64,
}

pub struct AsyncPool {
    pub worker_max: usize,
    partition_max: AtomicUsize,
    partitions: RwLock<HashMap<usize, Arc<PartitionSlot>>>,
    workers: Vec<Arc<WorkerInfo>>,
    suspend: Suspend,
    running: AtomicBool,
    zombies: Mutex<Vec<Arc<PartitionSlot>>>,
    last_zombie_stamp: AtomicI64,
    slice_ms: i64,
    bypass_divisor: i64,
    idle_wait_ms: i64,
    cleanup_every: u64,
    zombie_grace_ms: i64,
}

impl AsyncPool {
    pub fn new(worker_max: usize, config: &crate::Config) -> Self {
        let worker_max = worker_max.max(1);
        Self {
            worker_max,
            partition_max: AtomicUsize::new(0),
            partitions: RwLock::new(HashMap::new()),
            workers: (0..worker_max)
                .map(|_| {
                    Arc::new(WorkerInfo {
                        lock: Mutex::new(false),
                        cv: Condvar::new(),
                        jobs: Mutex::new(Vec::new()),
                    })
                })
                .collect(),
            suspend: Suspend {
                outer: Mutex::new(()),
                want: AtomicBool::new(false),
                depth: AtomicI32::new(0),
                parked: AtomicI32::new(0),
                started_at: AtomicI64::new(0),
            },
            running: AtomicBool::new(false),
            zombies: Mutex::new(Vec::new()),
            last_zombie_stamp: AtomicI64::new(0),
            slice_ms: config.slice_ms,
            bypass_divisor: config.bypass_divisor,
            idle_wait_ms: config.idle_wait_ms,
            cleanup_every: config.cleanup_every,
            zombie_grace_ms: config.zombie_grace_ms,
        }
    }

    pub fn partition_max(&self) -> usize {
        self.partition_max.load(Ordering::SeqCst)
    }

    pub fn set_partition_max(&self, partition_max: usize) {
        self.partition_max.store(partition_max, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn least_busy_worker(&self) -> usize {
        let mut best = 0;
        let mut best_len = usize::MAX;
        for (index, worker) in self.workers.iter().enumerate() {
            let len = worker.jobs.lock().len();
            if len < best_len {
                best = index;
                best_len = len;
            }
        }
        best
    }

    /// Create (or return) the loop for a partition and bind it to the
    /// least busy worker. Callers hold the suspend lock when the pool is
    /// running.
    pub fn init_partition(&self, partition: usize) -> Arc<PartitionSlot> {
        let mut partitions = self.partitions.write();
        if let Some(existing) = partitions.get(&partition) {
            return existing.clone();
        }
        let worker = self.least_busy_worker();
        let slot = Arc::new(PartitionSlot {
            run_loop: AsyncLoop::new(partition),
            worker: AtomicUsize::new(worker),
        });
        self.workers[worker].jobs.lock().push(partition);
        partitions.insert(partition, slot.clone());
        slot
    }

    pub fn is_partition(&self, partition: usize) -> Option<Arc<PartitionSlot>> {
        self.partitions.read().get(&partition).cloned()
    }

    pub fn get_partition(&self, partition: usize) -> Arc<PartitionSlot> {
        if let Some(slot) = self.is_partition(partition) {
            return slot;
        }
        self.init_partition(partition)
    }

    pub fn count(&self) -> usize {
        self.partitions.read().len()
    }

    /// Orphan a partition's loop. Cells get `partition_removed` and the
    /// resources free after the zombie grace.
    pub fn free_partition(&self, partition: usize) {
        let removed = self.partitions.write().remove(&partition);
        if let Some(slot) = removed {
            let worker = slot.worker.load(Ordering::SeqCst);
            self.workers[worker].jobs.lock().retain(|&p| p != partition);
            slot.run_loop.release();
            self.zombies.lock().push(slot);
            self.last_zombie_stamp.store(now_ms(), Ordering::SeqCst);
        }
    }

    pub fn queue_cell(&self, partition: usize, cell: Box<dyn Cell>) {
        let slot = self.get_partition(partition);
        slot.run_loop.queue_cell(cell);
        self.wake_worker(slot.worker.load(Ordering::SeqCst));
    }

    pub fn queue_cell_delayed(&self, partition: usize, cell: Box<dyn Cell>, delay_ms: i64) {
        let slot = self.get_partition(partition);
        slot.run_loop.queue_cell_at(cell, now_ms() + delay_ms);
        self.wake_worker(slot.worker.load(Ordering::SeqCst));
    }

    /// Queue one factory-built cell per listed partition. The factory may
    /// return None when a partition does not apply (e.g. a query on a
    /// non-owner partition).
    pub fn cell_factory(
        &self,
        partition_list: &[usize],
        mut factory: impl FnMut(usize) -> Option<Box<dyn Cell>>,
    ) {
        for &partition in partition_list {
            if let Some(cell) = factory(partition) {
                self.queue_cell(partition, cell);
            }
        }
    }

    pub fn purge_by_table(&self, table: &str) {
        for slot in self.partitions.read().values() {
            slot.run_loop.purge_by_table(table);
        }
    }

    pub fn realtime_running(&self, partition: usize) -> i32 {
        self.is_partition(partition)
            .map(|slot| slot.run_loop.realtime.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn wake_worker(&self, worker: usize) {
        let info = &self.workers[worker];
        let mut triggered = info.lock.lock();
        *triggered = true;
        info.cv.notify_one();
    }

    fn wake_all(&self) {
        for worker in 0..self.worker_max {
            self.wake_worker(worker);
        }
    }

    /// Park every worker at its next yield. Reference counted; the first
    /// suspender waits for all workers to acknowledge.
    pub fn suspend_async(&self) {
        if !self.running.load(Ordering::SeqCst) {
            self.suspend.want.store(true, Ordering::SeqCst);
            self.suspend.depth.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let _guard = self.suspend.outer.lock();
        if !self.suspend.want.swap(true, Ordering::SeqCst) {
            self.suspend.started_at.store(now_ms(), Ordering::SeqCst);
        }
        self.wake_all();
        while self.suspend.parked.load(Ordering::SeqCst) != self.worker_max as i32 {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.suspend.depth.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resume_async(&self) {
        if !self.running.load(Ordering::SeqCst) {
            if self.suspend.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.suspend.want.store(false, Ordering::SeqCst);
            }
            return;
        }

        let _guard = self.suspend.outer.lock();
        if self.suspend.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            // pending timers move forward by the suspended window
            let delta = now_ms() - self.suspend.started_at.load(Ordering::SeqCst);
            if delta > 0 {
                for slot in self.partitions.read().values() {
                    slot.run_loop.shift_timers(delta);
                }
            }
            self.suspend.want.store(false, Ordering::SeqCst);
            while self.suspend.parked.load(Ordering::SeqCst) != 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend.depth.load(Ordering::SeqCst) > 0
    }

    fn worker_loop(services: Arc<Services>, worker_id: usize) {
        let pool = &services.pool;
        let info = pool.workers[worker_id].clone();
        let mut run_again = false;
        let mut next_run: i64 = -1;

        while pool.running.load(Ordering::SeqCst) {
            if pool.suspend.want.load(Ordering::SeqCst) {
                pool.suspend.parked.fetch_add(1, Ordering::SeqCst);
                while pool.suspend.want.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                pool.suspend.parked.fetch_sub(1, Ordering::SeqCst);
            }

            if !run_again {
                let delay = if next_run == -1 {
                    pool.idle_wait_ms
                } else {
                    (next_run - now_ms()).clamp(0, pool.idle_wait_ms)
                };
                let mut triggered = info.lock.lock();
                if delay > 0 && !*triggered {
                    let _ = info
                        .cv
                        .wait_for(&mut triggered, Duration::from_millis(delay as u64));
                }
                *triggered = false;
            }

            if pool.suspend.want.load(Ordering::SeqCst)
                || pool.suspend.depth.load(Ordering::SeqCst) > 0
            {
                continue;
            }

            run_again = false;
            next_run = -1;

            let jobs: Vec<usize> = info.jobs.lock().clone();
            for partition in jobs {
                if !services.mapper.is_mapped_locally(partition) {
                    continue;
                }
                let Some(slot) = pool.is_partition(partition) else {
                    continue;
                };
                if slot.run_loop.run(
                    &services,
                    pool.slice_ms,
                    pool.bypass_divisor,
                    pool.cleanup_every,
                    &mut next_run,
                ) {
                    run_again = true;
                }
            }
        }
    }

    fn maint_loop(services: Arc<Services>) {
        let pool = &services.pool;
        while pool.running.load(Ordering::SeqCst) {
            let stamp = pool.last_zombie_stamp.load(Ordering::SeqCst);
            if stamp != 0 && stamp + pool.zombie_grace_ms < now_ms() {
                let drained: Vec<_> = pool.zombies.lock().drain(..).collect();
                if !drained.is_empty() {
                    info!(count = drained.len(), "cleaned abandoned partitions");
                }
                pool.last_zombie_stamp.store(0, Ordering::SeqCst);
                drop(drained);
            }
            std::thread::sleep(Duration::from_millis(5000));
        }
    }

    /// Start the worker and maintenance threads. Threads hold an Arc to
    /// the whole services struct; they exit when `shutdown` clears the
    /// running flag.
    pub fn start_async(services: &Arc<Services>) {
        let pool = &services.pool;
        if pool.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(workers = pool.worker_max, "creating partition pool threads");
        for worker_id in 0..pool.worker_max {
            let cloned = services.clone();
            std::thread::spawn(move || AsyncPool::worker_loop(cloned, worker_id));
        }
        let cloned = services.clone();
        std::thread::spawn(move || AsyncPool::maint_loop(cloned));
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake_all();
    }
}
