use crate::common::now_ms;
use crate::Services;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Background,
    Realtime,
}

/// A unit of cooperative work scheduled on a partition's loop.
///
/// `prepare` runs once on the owning worker thread before the first
/// `run`. `run` is called repeatedly; the cell checks
/// `ctx.slice_complete()` and returns to yield. Completion, rescheduling
/// and spawning all go through the context.
pub trait Cell: Send {
    fn name(&self) -> &'static str;

    fn priority(&self) -> Priority {
        Priority::Background
    }

    /// Table this cell belongs to, for table-drop purges.
    fn table(&self) -> Option<&str> {
        None
    }

    fn prepare(&mut self, ctx: &mut CellCtx);

    fn run(&mut self, ctx: &mut CellCtx);

    /// The partition was migrated away mid-flight. Cells holding reply
    /// shuttles answer with a retryable error here; there is no forced
    /// termination.
    fn partition_removed(&mut self) {}
}

/// Per-invocation view handed to a cell.
pub struct CellCtx<'a> {
    pub services: &'a Arc<Services>,
    pub partition: usize,
    pub(crate) run_start: i64,
    pub(crate) slice_ms: i64,
    pub(crate) bypass: bool,
    pub(crate) done: bool,
    pub(crate) run_at: Option<i64>,
    pub(crate) spawned: Vec<(Box<dyn Cell>, i64)>,
}

impl<'a> CellCtx<'a> {
    pub(crate) fn new(
        services: &'a Arc<Services>,
        partition: usize,
        slice_ms: i64,
        bypass: bool,
    ) -> Self {
        Self {
            services,
            partition,
            run_start: now_ms(),
            slice_ms,
            bypass,
            done: false,
            run_at: None,
            spawned: Vec::new(),
        }
    }

    /// True while realtime cells are active on this partition and this
    /// cell is background work.
    pub fn in_bypass(&self) -> bool {
        self.bypass
    }

    /// Time to give other cells a turn? `slice_ms` arrives already
    /// shortened when this cell is in bypass.
    pub fn slice_complete(&self) -> bool {
        now_ms() > self.run_start + self.slice_ms
    }

    /// Mark this cell finished; it is removed after this call returns.
    pub fn suicide(&mut self) {
        self.done = true;
    }

    pub fn schedule_future(&mut self, milli_from_now: i64) {
        self.run_at = Some(now_ms() + milli_from_now);
    }

    pub fn schedule_at(&mut self, milli_run_at: i64) {
        self.run_at = Some(milli_run_at);
    }

    /// Enqueue a new cell on this loop; it is picked up on the next
    /// schedule pass.
    pub fn spawn(&mut self, cell: Box<dyn Cell>, delay_ms: i64) {
        self.spawned.push((cell, now_ms() + delay_ms));
    }
}
