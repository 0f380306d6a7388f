//! Decoder Worker Pool
//!
//! A fixed set of OS threads per front-end. Each worker owns its PHY
//! instance and receives jobs over its own zero-capacity channel, so a send
//! only completes when that worker is idle and waiting. Dropping the senders
//! stops the workers once their current job is published.

use super::harq::PendingAckTable;
use super::stats::PipelineStats;
use crate::phy::{BlindDecoder, PdcchPhy, PhyFactory, SearchSpaceBuilder, TreeMatcher};
use crate::LayerError;
use common::{CellIndex, DciFormat, LinkDirection, Rnti, SharedQueue, SubframeDciSet, Tti};
use crossbeam::channel::{self, Receiver, Select, Sender, TrySendError};
use interfaces::source::SubframeSamples;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// One subframe ready for decoding
#[derive(Debug, Clone)]
pub struct SubframeWork {
    pub cell: CellIndex,
    pub tti: Tti,
    pub cell_prb: u8,
    pub samples: SubframeSamples,
}

/// Message sent to a worker
#[derive(Debug)]
pub enum DecoderJob {
    Decode(SubframeWork),
    /// Publish an empty entry for a subframe whose samples were dropped
    Placeholder { cell: CellIndex, tti: Tti, cell_prb: u8 },
}

impl DecoderJob {
    pub fn tti(&self) -> Tti {
        match self {
            DecoderJob::Decode(work) => work.tti,
            DecoderJob::Placeholder { tti, .. } => *tti,
        }
    }
}

/// Hand-off of jobs to idle workers
pub trait JobDispatch: Send + Sync {
    /// Give the job to a worker that is idle right now
    fn try_assign(&self, job: DecoderJob) -> Result<usize, DecoderJob>;

    /// Give the job to the first worker to become idle within `wait`
    fn wait_assign(&self, job: DecoderJob, wait: Duration) -> Result<usize, DecoderJob>;
}

/// Settings shared by every worker of a pool
#[derive(Clone)]
pub struct WorkerContext {
    pub target: Rnti,
    pub formats: Vec<DciFormat>,
    pub output: Arc<SharedQueue<SubframeDciSet>>,
    /// Longest a worker waits for room in the output queue
    pub output_wait: Duration,
    pub stats: Arc<PipelineStats>,
}

/// Full per-subframe decode: control region, search space, matching,
/// and the PHICH of a pending uplink grant
pub struct SubframeDecoder {
    phy: Box<dyn PdcchPhy>,
    builder: SearchSpaceBuilder,
    matcher: TreeMatcher,
    acks: Arc<Mutex<PendingAckTable>>,
}

impl SubframeDecoder {
    pub fn new(phy: Box<dyn PdcchPhy>, target: Rnti, formats: &[DciFormat], acks: Arc<Mutex<PendingAckTable>>) -> Self {
        Self {
            phy,
            builder: SearchSpaceBuilder::new(formats),
            matcher: TreeMatcher::new(target),
            acks,
        }
    }

    pub fn decode(&mut self, work: &SubframeWork) -> Result<SubframeDciSet, LayerError> {
        let mut set = SubframeDciSet::new(work.cell, work.tti, work.cell_prb, work.samples.timestamp_us);

        let due = self.acks.lock().take_due(work.tti);
        if let Some(ack) = due {
            set.ul_ack = self.phy.decode_ack(&work.samples, &ack);
            trace!("TTI {}: PHICH for grant of TTI {} = {:?}", work.tti, ack.grant_tti, set.ul_ack);
        }

        let region = self.phy.estimate_control_region(&work.samples, work.tti)?;
        let mut tree = self.builder.build(&region);
        let mut decoder = BlindDecoder::new(work.cell_prb, &tree);
        self.matcher.run(self.phy.as_mut(), &mut decoder, &mut tree, &mut set);

        let target = self.matcher.target();
        if !target.is_zero() {
            if let Some(grant) = set.find(target, LinkDirection::Uplink) {
                self.acks.lock().register(work.tti, grant);
            }
        }
        Ok(set)
    }
}

struct Worker {
    id: usize,
    rx: Receiver<DecoderJob>,
    decoder: SubframeDecoder,
    ctx: WorkerContext,
}

impl Worker {
    fn run(mut self) {
        debug!("Decoder worker {} started", self.id);
        while let Ok(job) = self.rx.recv() {
            let set = match job {
                DecoderJob::Placeholder { cell, tti, cell_prb } => SubframeDciSet::placeholder(cell, tti, cell_prb),
                DecoderJob::Decode(work) => match self.decoder.decode(&work) {
                    Ok(set) => {
                        PipelineStats::add(&self.ctx.stats.dci_decoded, set.len() as u64);
                        set
                    }
                    Err(e) => {
                        // Publish an empty entry so the ring header keeps moving
                        PipelineStats::incr(&self.ctx.stats.decode_errors);
                        debug!("Worker {}: TTI {} not decoded: {}", self.id, work.tti, e);
                        SubframeDciSet::new(work.cell, work.tti, work.cell_prb, work.samples.timestamp_us)
                    }
                },
            };
            self.publish(set);
        }
        debug!("Decoder worker {} stopped", self.id);
    }

    fn publish(&self, set: SubframeDciSet) {
        let tti = set.tti;
        PipelineStats::incr(&self.ctx.stats.sets_published);
        if let Some(lost) = self.ctx.output.push_timeout(set, self.ctx.output_wait) {
            PipelineStats::incr(&self.ctx.stats.output_overwritten);
            warn!("Output queue full, TTI {} of cell {} overwritten by TTI {}", lost.tti, lost.cell, tti);
        }
    }
}

/// Worker threads of one front-end
pub struct DecoderWorkerPool {
    cell: CellIndex,
    senders: RwLock<Vec<Sender<DecoderJob>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl DecoderWorkerPool {
    /// Start `count` workers, each with its own PHY from `factory`
    pub fn spawn(cell: CellIndex, count: usize, factory: &dyn PhyFactory, ctx: WorkerContext) -> Result<Self, LayerError> {
        if count == 0 {
            return Err(LayerError::InvalidConfiguration("decoder pool needs at least one worker".to_string()));
        }

        let acks = Arc::new(Mutex::new(PendingAckTable::new()));
        let mut senders = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for id in 0..count {
            let phy = factory.create(cell)?;
            let (tx, rx) = channel::bounded(0);
            let worker = Worker {
                id,
                rx,
                decoder: SubframeDecoder::new(phy, ctx.target, &ctx.formats, acks.clone()),
                ctx: ctx.clone(),
            };
            let join = thread::Builder::new()
                .name(format!("decoder-{}-{}", cell, id))
                .spawn(move || worker.run())?;
            senders.push(tx);
            joins.push(join);
        }

        info!("Cell {}: {} decoder workers running", cell, count);
        Ok(Self {
            cell,
            senders: RwLock::new(senders),
            joins: Mutex::new(joins),
        })
    }

    pub fn cell(&self) -> CellIndex {
        self.cell
    }

    /// Workers still accepting jobs
    pub fn size(&self) -> usize {
        self.senders.read().len()
    }

    /// Stop and join every worker; a job in progress is finished first
    pub fn shutdown(&self) {
        let senders: Vec<Sender<DecoderJob>> = self.senders.write().drain(..).collect();
        trace!("Cell {}: closing {} worker channels", self.cell, senders.len());
        drop(senders);

        let joins: Vec<JoinHandle<()>> = self.joins.lock().drain(..).collect();
        for join in joins {
            if join.join().is_err() {
                warn!("Cell {}: decoder worker panicked", self.cell);
            }
        }
    }
}

impl JobDispatch for DecoderWorkerPool {
    fn try_assign(&self, mut job: DecoderJob) -> Result<usize, DecoderJob> {
        for (id, tx) in self.senders.read().iter().enumerate() {
            match tx.try_send(job) {
                Ok(()) => return Ok(id),
                Err(TrySendError::Full(back)) | Err(TrySendError::Disconnected(back)) => job = back,
            }
        }
        Err(job)
    }

    fn wait_assign(&self, job: DecoderJob, wait: Duration) -> Result<usize, DecoderJob> {
        let senders = self.senders.read();
        if senders.is_empty() {
            return Err(job);
        }
        let mut select = Select::new();
        for tx in senders.iter() {
            select.send(tx);
        }
        let assigned = match select.select_timeout(wait) {
            Ok(oper) => {
                let id = oper.index();
                oper.send(&senders[id], job).map(|_| id).map_err(|e| e.into_inner())
            }
            Err(_) => Err(job),
        };
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::sim::{SimulatedDci, SimulatedPhyConfig, SimulatedPhyFactory, Traffic};
    use std::collections::HashMap;

    fn context(target: u16) -> WorkerContext {
        WorkerContext {
            target: Rnti(target),
            formats: DciFormat::DEFAULT_SEARCH.to_vec(),
            output: Arc::new(SharedQueue::new(16)),
            output_wait: Duration::from_millis(10),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    fn scripted_factory(script: Vec<(u16, SimulatedDci)>) -> SimulatedPhyFactory {
        let mut map: HashMap<u16, Vec<SimulatedDci>> = HashMap::new();
        for (tti, dci) in script {
            map.entry(tti).or_default().push(dci);
        }
        let mut config = SimulatedPhyConfig::random(0, vec![]);
        config.traffic = Traffic::Scripted(map);
        SimulatedPhyFactory::new(config)
    }

    fn dci(format: DciFormat, rnti: u16, level: u8, ncce: u32) -> SimulatedDci {
        SimulatedDci {
            format,
            rnti: Rnti(rnti),
            aggregation_level: level,
            ncce,
            prb_count: 12,
            harq_id: 1,
            mcs: 16,
            rv: 0,
            ndi: true,
        }
    }

    fn work(tti: u32) -> SubframeWork {
        SubframeWork {
            cell: CellIndex(0),
            tti: Tti::new(tti),
            cell_prb: 50,
            samples: SubframeSamples::default(),
        }
    }

    #[test]
    fn test_subframe_decoder_finds_paired_and_solo() {
        let factory = scripted_factory(vec![
            (20, dci(DciFormat::Format1A, 1111, 2, 16)),
            (20, dci(DciFormat::Format0, 2222, 0, 30)),
            (20, dci(DciFormat::Format2A, 3333, 3, 32)),
        ]);
        let phy = factory.create(CellIndex(0)).unwrap();
        let acks = Arc::new(Mutex::new(PendingAckTable::new()));
        let mut decoder = SubframeDecoder::new(phy, Rnti(2222), &DciFormat::DEFAULT_SEARCH, acks.clone());

        let set = decoder.decode(&work(20)).unwrap();
        let dl: Vec<u16> = set.downlink.iter().map(|d| d.rnti.value()).collect();
        assert!(dl.contains(&1111));
        assert!(dl.contains(&3333));
        assert_eq!(set.uplink.len(), 1);
        assert_eq!(set.uplink[0].rnti, Rnti(2222));

        // Target uplink grant at TTI 20 is acknowledged at TTI 28
        let later = decoder.decode(&work(28)).unwrap();
        assert!(later.ul_ack.is_some());
        assert!(later.is_empty());
    }

    #[test]
    fn test_idle_worker_takes_job_and_publishes() {
        let factory = scripted_factory(vec![(5, dci(DciFormat::Format1, 4444, 1, 2))]);
        let ctx = context(0);
        let output = ctx.output.clone();
        let pool = DecoderWorkerPool::spawn(CellIndex(0), 2, &factory, ctx).unwrap();

        assert!(pool.wait_assign(DecoderJob::Decode(work(5)), Duration::from_secs(2)).is_ok());
        assert!(pool
            .wait_assign(DecoderJob::Placeholder { cell: CellIndex(0), tti: Tti::new(6), cell_prb: 50 }, Duration::from_secs(2))
            .is_ok());

        let mut published = Vec::new();
        while published.len() < 2 {
            let set = output.pop_timeout(Duration::from_secs(2)).expect("worker output");
            published.push(set);
        }
        published.sort_by_key(|s| s.tti.value());
        assert_eq!(published[0].downlink[0].rnti, Rnti(4444));
        assert!(published[1].placeholder);

        pool.shutdown();
        assert_eq!(pool.size(), 0);
        let late = DecoderJob::Placeholder { cell: CellIndex(0), tti: Tti::new(7), cell_prb: 50 };
        assert!(pool.try_assign(late).is_err());
    }

    #[test]
    fn test_empty_pool_rejected() {
        let factory = scripted_factory(vec![]);
        assert!(DecoderWorkerPool::spawn(CellIndex(0), 0, &factory, context(0)).is_err());
    }
}
