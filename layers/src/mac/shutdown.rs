//! Cooperative shutdown shared by every pipeline thread

use common::CellIndex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Stop flag plus, per radio front-end, a completion flag for its source
/// and a drained flag for its decoder pool
#[derive(Debug)]
pub struct ShutdownContext {
    stop: AtomicBool,
    finished: Vec<AtomicBool>,
    drained: Vec<AtomicBool>,
}

impl ShutdownContext {
    pub fn new(front_ends: usize) -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            finished: (0..front_ends).map(|_| AtomicBool::new(false)).collect(),
            drained: (0..front_ends).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    /// Ask every loop to exit at its next check
    pub fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn keep_running(&self) -> bool {
        !self.is_stopped()
    }

    /// Record that a front-end will produce no more subframes
    pub fn mark_finished(&self, cell: CellIndex) {
        if let Some(flag) = self.finished.get(cell.as_usize()) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_finished(&self, cell: CellIndex) -> bool {
        self.finished
            .get(cell.as_usize())
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    pub fn all_finished(&self) -> bool {
        self.finished.iter().all(|f| f.load(Ordering::SeqCst))
    }

    /// Record that every subframe of a front-end has left its workers.
    ///
    /// Only set once the pending backlog is empty and the pool is joined,
    /// so all of the cell's sets are already in the output queue.
    pub fn mark_drained(&self, cell: CellIndex) {
        if let Some(flag) = self.drained.get(cell.as_usize()) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_drained(&self, cell: CellIndex) -> bool {
        self.drained
            .get(cell.as_usize())
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_flags() {
        let ctx = ShutdownContext::new(2);
        assert!(ctx.keep_running());
        ctx.mark_finished(CellIndex(1));
        assert!(!ctx.is_finished(CellIndex(0)));
        assert!(ctx.is_finished(CellIndex(1)));
        assert!(!ctx.all_finished());
        ctx.mark_finished(CellIndex(0));
        assert!(ctx.all_finished());
        assert!(!ctx.is_drained(CellIndex(0)));
        ctx.mark_drained(CellIndex(0));
        assert!(ctx.is_drained(CellIndex(0)));
        assert!(!ctx.is_drained(CellIndex(1)));

        ctx.request_stop();
        ctx.request_stop();
        assert!(ctx.is_stopped());
    }
}
