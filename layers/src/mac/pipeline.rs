//! Decoding pipeline assembly
//!
//! Per front-end: one scheduler thread, one pending-queue helper thread and
//! a decoder worker pool. All pools publish into one output queue drained
//! by the aggregation status tracker thread.

use super::pending::{PendingWorkQueue, DEFAULT_PENDING_CAPACITY, DEFAULT_SKIP_CAPACITY};
use super::ring::{DEFAULT_GAP_TIMEOUT, DEFAULT_RING_SIZE};
use super::scheduler::TaskScheduler;
use super::shutdown::ShutdownContext;
use super::stats::{PipelineStats, StatsSnapshot};
use super::status::AggregationStatusTracker;
use super::ue_tracker::DEFAULT_INACTIVITY;
use super::worker::{DecoderWorkerPool, JobDispatch, WorkerContext};
use crate::phy::PhyFactory;
use crate::LayerError;
use common::{CellIndex, DciFormat, Rnti, SharedQueue, SubframeDciSet, TtiSubscriber};
use interfaces::source::SubframeSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Most radio front-ends one pipeline drives
pub const MAX_FRONT_ENDS: usize = 4;

/// One monitored cell
pub struct FrontEnd {
    pub cell_prb: u8,
    pub source: Box<dyn SubframeSource>,
    pub phy_factory: Arc<dyn PhyFactory>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers_per_radio: usize,
    /// UE whose solo decodes and PHICH are followed; zero for none
    pub target: Rnti,
    pub formats: Vec<DciFormat>,
    pub ring_size: usize,
    pub pending_capacity: usize,
    pub skip_capacity: usize,
    pub output_capacity: usize,
    pub gap_timeout: u16,
    /// Longest a worker waits for room in the output queue
    pub output_wait: Duration,
    pub ue_inactivity: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers_per_radio: 4,
            target: Rnti(0),
            formats: DciFormat::DEFAULT_SEARCH.to_vec(),
            ring_size: DEFAULT_RING_SIZE,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            skip_capacity: DEFAULT_SKIP_CAPACITY,
            output_capacity: 64,
            gap_timeout: DEFAULT_GAP_TIMEOUT,
            output_wait: Duration::from_millis(2),
            ue_inactivity: DEFAULT_INACTIVITY,
        }
    }
}

/// Threads feeding one cell's decoder pool
struct CellThreads {
    cell: CellIndex,
    pool: Arc<DecoderWorkerPool>,
    scheduler: JoinHandle<()>,
    helper: JoinHandle<()>,
}

pub struct Pipeline {
    shutdown: Arc<ShutdownContext>,
    stats: Arc<PipelineStats>,
    output: Arc<SharedQueue<SubframeDciSet>>,
    cells: Vec<CellThreads>,
    producers_done: Arc<AtomicBool>,
    tracker: Option<JoinHandle<AggregationStatusTracker>>,
}

impl Pipeline {
    /// Start every front-end. One that fails to initialise is left out;
    /// the pipeline fails only when none starts.
    pub fn start(
        config: PipelineConfig,
        front_ends: Vec<FrontEnd>,
        subscribers: Vec<Box<dyn TtiSubscriber>>,
    ) -> Result<Self, LayerError> {
        if front_ends.is_empty() || front_ends.len() > MAX_FRONT_ENDS {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} front-ends, expected 1 to {}",
                front_ends.len(),
                MAX_FRONT_ENDS
            )));
        }

        let cells = front_ends.len();
        let shutdown = ShutdownContext::new(cells);
        let stats = Arc::new(PipelineStats::default());
        let output = Arc::new(SharedQueue::new(config.output_capacity));
        let mut running = Vec::new();

        for (index, front_end) in front_ends.into_iter().enumerate() {
            let cell = CellIndex(index as u8);
            match Self::start_front_end(&config, cell, front_end, &shutdown, &stats, &output) {
                Ok(threads) => running.push(threads),
                Err(e) => {
                    error!("Cell {}: front-end not started: {}", cell, e);
                    shutdown.mark_finished(cell);
                    shutdown.mark_drained(cell);
                }
            }
        }

        if running.is_empty() {
            return Err(LayerError::InitializationFailed("no front-end could be started".to_string()));
        }

        let mut tracker = AggregationStatusTracker::new(cells, config.ring_size, config.gap_timeout, config.ue_inactivity, stats.clone());
        for subscriber in subscribers {
            tracker.subscribe(subscriber);
        }
        let producers_done = Arc::new(AtomicBool::new(false));
        let tracker = {
            let (output, shutdown, done) = (output.clone(), shutdown.clone(), producers_done.clone());
            thread::Builder::new()
                .name("status-tracker".to_string())
                .spawn(move || tracker.run(output, shutdown, move || !done.load(Ordering::SeqCst)))?
        };

        info!("Pipeline running: {} of {} front-ends", running.len(), cells);
        Ok(Self {
            shutdown,
            stats,
            output,
            cells: running,
            producers_done,
            tracker: Some(tracker),
        })
    }

    fn start_front_end(
        config: &PipelineConfig,
        cell: CellIndex,
        front_end: FrontEnd,
        shutdown: &Arc<ShutdownContext>,
        stats: &Arc<PipelineStats>,
        output: &Arc<SharedQueue<SubframeDciSet>>,
    ) -> Result<CellThreads, LayerError> {
        let sync_phy = front_end.phy_factory.create(cell)?;
        let ctx = WorkerContext {
            target: config.target,
            formats: config.formats.clone(),
            output: output.clone(),
            output_wait: config.output_wait,
            stats: stats.clone(),
        };
        let pool = Arc::new(DecoderWorkerPool::spawn(
            cell,
            config.workers_per_radio,
            front_end.phy_factory.as_ref(),
            ctx,
        )?);
        let pending = Arc::new(PendingWorkQueue::new(
            cell,
            front_end.cell_prb,
            config.pending_capacity,
            config.skip_capacity,
            stats.clone(),
        ));

        // The helper outlives the scheduler: it empties the backlog, then
        // closes the pool so every set of this cell is in the output queue
        let helper = {
            let (pending, pool, shutdown) = (pending.clone(), pool.clone(), shutdown.clone());
            thread::Builder::new().name(format!("pending-{}", cell)).spawn(move || {
                pending.run_helper(pool.as_ref(), || shutdown.is_finished(cell));
                pool.shutdown();
                shutdown.mark_drained(cell);
                debug!("Cell {}: decoder pool drained", cell);
            })
        };
        let helper = match helper {
            Ok(helper) => helper,
            Err(e) => {
                pool.shutdown();
                return Err(e.into());
            }
        };

        let scheduler = TaskScheduler::new(
            cell,
            front_end.cell_prb,
            front_end.source,
            sync_phy,
            pending,
            pool.clone() as Arc<dyn JobDispatch>,
            shutdown.clone(),
            stats.clone(),
        );
        let scheduler = thread::Builder::new()
            .name(format!("scheduler-{}", cell))
            .spawn(move || scheduler.run())?;

        Ok(CellThreads {
            cell,
            pool,
            scheduler,
            helper,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Live counters, for periodic reporting
    pub fn counters(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn shutdown_context(&self) -> Arc<ShutdownContext> {
        self.shutdown.clone()
    }

    /// Every front-end has stopped producing
    pub fn is_finished(&self) -> bool {
        self.shutdown.all_finished()
    }

    /// Stop all threads, deliver what was decoded and return the final counters
    pub fn stop(mut self) -> StatsSnapshot {
        self.shutdown.request_stop();

        for threads in self.cells.drain(..) {
            if threads.scheduler.join().is_err() {
                warn!("Cell {}: scheduler panicked", threads.cell);
            }
            // Lets the helper finish even when the scheduler died early
            self.shutdown.mark_finished(threads.cell);
            if threads.helper.join().is_err() {
                warn!("Cell {}: pending queue helper panicked", threads.cell);
            }
            threads.pool.shutdown();
            self.shutdown.mark_drained(threads.cell);
        }

        self.producers_done.store(true, Ordering::SeqCst);
        self.output.notify_all();
        if let Some(tracker) = self.tracker.take() {
            match tracker.join() {
                Ok(tracker) => info!("Delivered through TTI {:?}", tracker.delivered().map(|t| t.value())),
                Err(_) => warn!("Status tracker panicked"),
            }
        }

        let snapshot = self.stats.snapshot();
        info!(
            "Pipeline stopped: {} subframes, {} DCIs, {} TTIs delivered",
            snapshot.subframes_acquired, snapshot.dci_decoded, snapshot.ttis_delivered
        );
        snapshot
    }
}
