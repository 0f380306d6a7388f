//! Task Scheduler
//!
//! One per radio front-end. Acquires subframes, keeps the running TTI
//! locked to the broadcast SFN, and submits every synchronised subframe to
//! the decoder pool through the pending work queue.

use super::pending::{PendingWorkQueue, SubmitOutcome};
use super::shutdown::ShutdownContext;
use super::stats::PipelineStats;
use super::worker::{JobDispatch, SubframeWork};
use crate::phy::PdcchPhy;
use common::{CellIndex, Tti};
use interfaces::source::{SubframeSamples, SubframeSource};
use interfaces::InterfaceError;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Running TTI counter locked to the broadcast SFN
#[derive(Debug, Default)]
pub struct SfnTracker {
    current: Option<Tti>,
    last_sequence: Option<u64>,
}

impl SfnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Tti> {
        self.current
    }

    pub fn is_locked(&self) -> bool {
        self.current.is_some()
    }

    /// TTI of the subframe in `samples`, or `None` while unsynchronised.
    ///
    /// Before lock the broadcast channel is tried on every subframe; after
    /// it the prediction is checked again on each subframe 0.
    pub fn advance(&mut self, phy: &mut dyn PdcchPhy, samples: &SubframeSamples, stats: &PipelineStats) -> Option<Tti> {
        if let Some(last) = self.last_sequence {
            if self.current.is_some() && samples.sequence != last.wrapping_add(1) {
                PipelineStats::incr(&stats.sequence_gaps);
                warn!("Front-end skipped from subframe {} to {}, resynchronising", last, samples.sequence);
                self.current = None;
            }
        }
        self.last_sequence = Some(samples.sequence);

        let tti = match self.current.map(|t| t.next()) {
            None => {
                let Some(sfn) = phy.decode_broadcast(samples) else {
                    PipelineStats::incr(&stats.subframes_unsynced);
                    return None;
                };
                let tti = Tti::from_frame(sfn, 0);
                info!("SFN locked at {}", sfn);
                tti
            }
            Some(predicted) if predicted.subframe() == 0 => match phy.decode_broadcast(samples) {
                Some(sfn) if sfn != predicted.sfn() => {
                    PipelineStats::incr(&stats.sequence_gaps);
                    warn!("Broadcast SFN {} but expected {}, resynchronising", sfn, predicted.sfn());
                    let resynced = Tti::from_frame(sfn, 0);
                    if predicted.is_after(resynced) {
                        warn!(
                            "TTI moved back {} subframes; output up to TTI {} will arrive late",
                            resynced.distance_to(predicted),
                            predicted
                        );
                    }
                    resynced
                }
                _ => predicted,
            },
            Some(predicted) => predicted,
        };

        self.current = Some(tti);
        Some(tti)
    }
}

pub struct TaskScheduler {
    cell: CellIndex,
    cell_prb: u8,
    source: Box<dyn SubframeSource>,
    phy: Box<dyn PdcchPhy>,
    tracker: SfnTracker,
    pending: Arc<PendingWorkQueue>,
    pool: Arc<dyn JobDispatch>,
    shutdown: Arc<ShutdownContext>,
    stats: Arc<PipelineStats>,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cell: CellIndex,
        cell_prb: u8,
        source: Box<dyn SubframeSource>,
        phy: Box<dyn PdcchPhy>,
        pending: Arc<PendingWorkQueue>,
        pool: Arc<dyn JobDispatch>,
        shutdown: Arc<ShutdownContext>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            cell,
            cell_prb,
            source,
            phy,
            tracker: SfnTracker::new(),
            pending,
            pool,
            shutdown,
            stats,
        }
    }

    /// Acquire and submit until stopped or the source ends
    pub fn run(mut self) {
        info!("Cell {}: scheduler reading from {}", self.cell, self.source.describe());

        while self.shutdown.keep_running() {
            let samples = match self.source.acquire() {
                Ok(samples) => samples,
                Err(InterfaceError::EndOfStream) => {
                    info!("Cell {}: front-end finished", self.cell);
                    break;
                }
                Err(e) if e.is_transient() => {
                    PipelineStats::incr(&self.stats.source_errors);
                    debug!("Cell {}: acquisition failed: {}", self.cell, e);
                    continue;
                }
                Err(e) => {
                    error!("Cell {}: front-end failed: {}", self.cell, e);
                    break;
                }
            };
            PipelineStats::incr(&self.stats.subframes_acquired);

            let Some(tti) = self.tracker.advance(self.phy.as_mut(), &samples, &self.stats) else {
                continue;
            };

            let work = SubframeWork {
                cell: self.cell,
                tti,
                cell_prb: self.cell_prb,
                samples,
            };
            match self.pending.submit(self.pool.as_ref(), work) {
                SubmitOutcome::Assigned(worker) => trace!("Cell {} TTI {} on worker {}", self.cell, tti, worker),
                outcome => trace!("Cell {} TTI {}: {:?}", self.cell, tti, outcome),
            }
        }

        self.shutdown.mark_finished(self.cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::worker::{DecoderWorkerPool, WorkerContext};
    use crate::phy::{PhyFactory, SimulatedPhy, SimulatedPhyConfig, SimulatedPhyFactory};
    use common::{DciFormat, Rnti, SharedQueue};
    use interfaces::source::SimulatedSource;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn samples(sequence: u64) -> SubframeSamples {
        SubframeSamples {
            sequence,
            ..Default::default()
        }
    }

    fn phy(sfn_offset: u16) -> SimulatedPhy {
        let mut config = SimulatedPhyConfig::random(3, vec![]);
        config.sfn_offset = sfn_offset;
        SimulatedPhy::new(CellIndex(0), config)
    }

    #[test]
    fn test_locks_on_first_broadcast() {
        let stats = PipelineStats::default();
        let mut phy = phy(100);
        let mut tracker = SfnTracker::new();

        for seq in 3..10 {
            assert_eq!(tracker.advance(&mut phy, &samples(seq), &stats), None);
        }
        assert_eq!(stats.subframes_unsynced.load(Ordering::Relaxed), 7);

        assert_eq!(tracker.advance(&mut phy, &samples(10), &stats), Some(Tti::from_frame(101, 0)));
        assert_eq!(tracker.advance(&mut phy, &samples(11), &stats), Some(Tti::from_frame(101, 1)));
        for seq in 12..20 {
            tracker.advance(&mut phy, &samples(seq), &stats);
        }
        assert_eq!(tracker.advance(&mut phy, &samples(20), &stats), Some(Tti::from_frame(102, 0)));
        assert_eq!(stats.sequence_gaps.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_broadcast_mismatch_is_sequence_gap() {
        let stats = PipelineStats::default();
        let mut tracker = SfnTracker::new();
        let mut phy = phy(0);

        for seq in 0..10 {
            tracker.advance(&mut phy, &samples(seq), &stats);
        }
        assert_eq!(tracker.current(), Some(Tti::from_frame(0, 9)));

        // The cell now reports a frame five ahead of the running count
        let mut shifted = self::phy(4);
        let tti = tracker.advance(&mut shifted, &samples(10), &stats);
        assert_eq!(tti, Some(Tti::from_frame(5, 0)));
        assert_eq!(stats.sequence_gaps.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dropped_subframes_force_resync() {
        let stats = PipelineStats::default();
        let mut tracker = SfnTracker::new();
        let mut phy = phy(0);

        for seq in 0..5 {
            tracker.advance(&mut phy, &samples(seq), &stats);
        }
        assert!(tracker.is_locked());

        assert_eq!(tracker.advance(&mut phy, &samples(8), &stats), None);
        assert_eq!(stats.sequence_gaps.load(Ordering::Relaxed), 1);
        assert_eq!(tracker.advance(&mut phy, &samples(9), &stats), None);
        assert_eq!(tracker.advance(&mut phy, &samples(10), &stats), Some(Tti::from_frame(1, 0)));
    }

    #[test]
    fn test_scheduler_submits_every_synchronised_subframe() {
        let stats = Arc::new(PipelineStats::default());
        let shutdown = ShutdownContext::new(1);
        let factory = SimulatedPhyFactory::new(SimulatedPhyConfig::random(9, vec![Rnti(70), Rnti(71)]));
        let ctx = WorkerContext {
            target: Rnti(70),
            formats: DciFormat::DEFAULT_SEARCH.to_vec(),
            output: Arc::new(SharedQueue::new(64)),
            output_wait: Duration::from_millis(1),
            stats: stats.clone(),
        };
        let pool = Arc::new(DecoderWorkerPool::spawn(CellIndex(0), 2, &factory, ctx).unwrap());
        let pending = Arc::new(PendingWorkQueue::new(CellIndex(0), 50, 15, 64, stats.clone()));

        let scheduler = TaskScheduler::new(
            CellIndex(0),
            50,
            Box::new(SimulatedSource::with_period(Duration::ZERO, Some(40))),
            factory.create(CellIndex(0)).unwrap(),
            pending,
            pool.clone(),
            shutdown.clone(),
            stats.clone(),
        );
        scheduler.run();

        let snap = stats.snapshot();
        assert_eq!(snap.subframes_acquired, 40);
        assert_eq!(snap.subframes_unsynced, 0);
        assert_eq!(snap.assigned_direct + snap.buffered + snap.placeholders + snap.dropped, 40);
        assert!(shutdown.is_finished(CellIndex(0)));

        pool.shutdown();
    }
}
