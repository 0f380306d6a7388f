//! Pending Work Queue
//!
//! Subframes that arrive while every worker is busy wait here. Every
//! deferred subframe leaves a TTI stamp in the skip list, in arrival order;
//! the samples themselves are buffered only while the work queue has room.
//! The helper thread hands stamps to workers oldest first, with the buffered
//! samples when they exist and a placeholder job otherwise.

use super::stats::PipelineStats;
use super::worker::{DecoderJob, JobDispatch, SubframeWork};
use common::{BoundedQueue, CellIndex, Tti};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Subframes whose samples can be held back
pub const DEFAULT_PENDING_CAPACITY: usize = 15;

/// Deferred subframe stamps, buffered or not
pub const DEFAULT_SKIP_CAPACITY: usize = 64;

/// Longest the helper waits for a worker before looking at the queue again
const DISPATCH_SLICE: Duration = Duration::from_millis(1);

/// Longest the helper sleeps on an empty queue
const IDLE_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the idle worker with this index
    Assigned(usize),
    /// Samples and stamp queued
    Buffered,
    /// Work queue full: samples dropped, only the stamp queued
    PlaceholderOnly,
    /// Skip list full: the subframe is lost
    Dropped,
}

struct PendingState {
    work: BoundedQueue<DecoderJob>,
    skip: BoundedQueue<Tti>,
    /// Oldest stamp, out with the helper while it waits for a worker;
    /// `Some(true)` when it carries buffered samples
    in_flight: Option<bool>,
}

impl PendingState {
    /// Nothing deferred, so new work may go straight to a worker
    fn is_clear(&self) -> bool {
        self.skip.is_empty() && self.in_flight.is_none()
    }

    // The in-flight entry keeps its place so a failed hand-off can return it
    fn stamp_room(&self) -> bool {
        self.skip.len() + usize::from(self.in_flight.is_some()) < self.skip.capacity()
    }

    fn work_room(&self) -> bool {
        self.work.len() + usize::from(self.in_flight == Some(true)) < self.work.capacity()
    }
}

pub struct PendingWorkQueue {
    cell: CellIndex,
    cell_prb: u8,
    state: Mutex<PendingState>,
    available: Condvar,
    stats: Arc<PipelineStats>,
}

impl PendingWorkQueue {
    pub fn new(cell: CellIndex, cell_prb: u8, work_capacity: usize, skip_capacity: usize, stats: Arc<PipelineStats>) -> Self {
        Self {
            cell,
            cell_prb,
            state: Mutex::new(PendingState {
                work: BoundedQueue::new(work_capacity),
                skip: BoundedQueue::new(skip_capacity),
                in_flight: None,
            }),
            available: Condvar::new(),
            stats,
        }
    }

    /// Assign `work` to an idle worker, or defer it behind everything
    /// already waiting
    pub fn submit(&self, pool: &dyn JobDispatch, work: SubframeWork) -> SubmitOutcome {
        let mut state = self.state.lock();
        let tti = work.tti;

        let job = if state.is_clear() {
            match pool.try_assign(DecoderJob::Decode(work)) {
                Ok(worker) => {
                    PipelineStats::incr(&self.stats.assigned_direct);
                    trace!("Cell {} TTI {} -> worker {}", self.cell, tti, worker);
                    return SubmitOutcome::Assigned(worker);
                }
                Err(job) => job,
            }
        } else {
            DecoderJob::Decode(work)
        };

        if !state.stamp_room() || state.skip.try_push(tti).is_err() {
            PipelineStats::incr(&self.stats.dropped);
            warn!("Cell {}: skip list full, TTI {} dropped", self.cell, tti);
            return SubmitOutcome::Dropped;
        }

        let outcome = if state.work_room() && state.work.try_push(job).is_ok() {
            PipelineStats::incr(&self.stats.buffered);
            SubmitOutcome::Buffered
        } else {
            PipelineStats::incr(&self.stats.placeholders);
            warn!("Cell {}: pending queue full, TTI {} will be a placeholder", self.cell, tti);
            SubmitOutcome::PlaceholderOnly
        };
        drop(state);
        self.available.notify_one();
        outcome
    }

    /// Hand the oldest deferred subframe to the next free worker.
    ///
    /// Waits briefly for a stamp. Returns whether a job was assigned;
    /// an unassigned job keeps its place at the head of the queue.
    pub fn dispatch_next(&self, pool: &dyn JobDispatch) -> bool {
        self.dispatch_within(pool, DISPATCH_SLICE)
    }

    fn dispatch_within(&self, pool: &dyn JobDispatch, wait: Duration) -> bool {
        let (tti, job) = {
            let mut state = self.state.lock();
            if state.skip.is_empty() {
                self.available.wait_for(&mut state, wait);
            }
            let Some(tti) = state.skip.pop() else {
                return false;
            };

            let buffered = state.work.front().map(DecoderJob::tti) == Some(tti);
            let job = buffered.then(|| state.work.pop()).flatten();
            state.in_flight = Some(job.is_some());
            let job = job.unwrap_or(DecoderJob::Placeholder {
                cell: self.cell,
                tti,
                cell_prb: self.cell_prb,
            });
            (tti, job)
        };

        // Unlocked: the scheduler keeps submitting while we wait
        let assigned = pool.wait_assign(job, DISPATCH_SLICE);

        let mut state = self.state.lock();
        state.in_flight = None;
        match assigned {
            Ok(worker) => {
                trace!("Cell {} deferred TTI {} -> worker {}", self.cell, tti, worker);
                true
            }
            Err(job) => {
                let _ = state.skip.push_front(tti);
                if let DecoderJob::Decode(_) = job {
                    let _ = state.work.push_front(job);
                }
                false
            }
        }
    }

    /// Stamps still waiting for a worker
    pub fn backlog(&self) -> usize {
        let state = self.state.lock();
        state.skip.len() + usize::from(state.in_flight.is_some())
    }

    /// Helper loop: keep handing out deferred work until the front-end has
    /// stopped submitting and the backlog is empty
    pub fn run_helper(&self, pool: &dyn JobDispatch, source_done: impl Fn() -> bool) {
        debug!("Cell {}: pending queue helper started", self.cell);
        let mut dispatched = 0u64;
        loop {
            if self.dispatch_within(pool, IDLE_WAIT) {
                dispatched += 1;
                continue;
            }
            if source_done() && self.backlog() == 0 {
                break;
            }
            std::thread::yield_now();
        }
        debug!("Cell {}: pending queue drained after {} deferred subframes", self.cell, dispatched);
    }
}
