//! Aggregation Status Tracker
//!
//! Consumes the worker output queue, files every subframe set into its
//! cell's ring and keeps the cross-cell combined header. Each TTI at or
//! behind the combined header is taken out of every ring, annotated by the
//! cell's UE tracker and handed to the subscribers, strictly in TTI order.

use super::ring::{CellRingBuffer, InsertOutcome};
use super::shutdown::ShutdownContext;
use super::stats::PipelineStats;
use super::ue_tracker::UeTracker;
use common::{AggregatedTti, CellIndex, SharedQueue, SubframeDciSet, Tti, TtiSubscriber};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Per-cell headers and the combined header derived from them
#[derive(Debug, Clone)]
pub struct AggregationStatus {
    headers: Vec<Option<Tti>>,
    live: Vec<bool>,
}

impl AggregationStatus {
    pub fn new(cells: usize) -> Self {
        Self {
            headers: vec![None; cells],
            live: vec![true; cells],
        }
    }

    pub fn update(&mut self, cell: CellIndex, header: Option<Tti>) {
        if let Some(slot) = self.headers.get_mut(cell.as_usize()) {
            *slot = header;
        }
    }

    /// Stop waiting on a cell that will produce nothing more
    pub fn retire(&mut self, cell: CellIndex) {
        if let Some(live) = self.live.get_mut(cell.as_usize()) {
            *live = false;
        }
    }

    pub fn is_live(&self, cell: CellIndex) -> bool {
        self.live.get(cell.as_usize()).copied().unwrap_or(false)
    }

    /// Every live cell has inserted at least once
    pub fn is_ready(&self) -> bool {
        let mut live = self.headers.iter().zip(&self.live).filter(|(_, live)| **live).peekable();
        live.peek().is_some() && live.all(|(header, _)| header.is_some())
    }

    /// Wraparound-aware minimum of the live cell headers
    pub fn combined(&self) -> Option<Tti> {
        if !self.is_ready() {
            return None;
        }
        self.headers
            .iter()
            .zip(&self.live)
            .filter(|(_, live)| **live)
            .filter_map(|(header, _)| *header)
            .reduce(Tti::earliest)
    }
}

pub struct AggregationStatusTracker {
    rings: Vec<CellRingBuffer>,
    status: AggregationStatus,
    ue_trackers: Vec<UeTracker>,
    delivered: Option<Tti>,
    subscribers: Vec<Box<dyn TtiSubscriber>>,
    stats: Arc<PipelineStats>,
}

impl AggregationStatusTracker {
    pub fn new(cells: usize, ring_size: usize, gap_timeout: u16, ue_inactivity: u16, stats: Arc<PipelineStats>) -> Self {
        Self {
            rings: (0..cells).map(|_| CellRingBuffer::new(ring_size, gap_timeout)).collect(),
            status: AggregationStatus::new(cells),
            ue_trackers: (0..cells).map(|_| UeTracker::new(ue_inactivity)).collect(),
            delivered: None,
            subscribers: Vec::new(),
            stats,
        }
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn TtiSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn status(&self) -> &AggregationStatus {
        &self.status
    }

    pub fn ring(&self, cell: CellIndex) -> Option<&CellRingBuffer> {
        self.rings.get(cell.as_usize())
    }

    pub fn ue_tracker(&self, cell: CellIndex) -> Option<&UeTracker> {
        self.ue_trackers.get(cell.as_usize())
    }

    /// Last TTI handed to the subscribers
    pub fn delivered(&self) -> Option<Tti> {
        self.delivered
    }

    /// File one subframe set and deliver whatever it completes
    pub fn ingest(&mut self, set: SubframeDciSet) -> usize {
        let cell = set.cell;
        let Some(ring) = self.rings.get_mut(cell.as_usize()) else {
            warn!("Subframe set for unknown cell {}", cell);
            return 0;
        };

        let tti = set.tti;
        match ring.insert(set) {
            InsertOutcome::Late => {
                PipelineStats::incr(&self.stats.late_sets);
                debug!("Cell {}: TTI {} arrived behind the ring header", cell, tti);
            }
            InsertOutcome::Rewound => {
                PipelineStats::incr(&self.stats.late_sets);
                warn!(
                    "Cell {}: TTI {} is far behind ring header {:?}; sets are discarded until the header is passed",
                    cell,
                    tti,
                    ring.header().map(|h| h.value())
                );
            }
            InsertOutcome::Stored { overwritten, forced_gaps } => {
                if let Some(lost) = overwritten {
                    PipelineStats::incr(&self.stats.ring_overwrites);
                    warn!("Cell {}: ring slot of TTI {} reused before delivery", cell, lost);
                }
                PipelineStats::add(&self.stats.gaps_forced, forced_gaps as u64);
            }
        }
        self.status.update(cell, ring.header());

        match self.status.combined() {
            Some(target) => self.deliver_through(target),
            None => 0,
        }
    }

    /// Stop waiting on `cell`; returns whether it was still live
    pub fn retire(&mut self, cell: CellIndex) -> bool {
        if !self.status.is_live(cell) {
            return false;
        }
        info!("Cell {} retired from aggregation", cell);
        self.status.retire(cell);
        if let Some(target) = self.status.combined() {
            self.deliver_through(target);
        }
        true
    }

    /// Deliver everything up to the most advanced cell header
    pub fn flush(&mut self) -> usize {
        let latest = self
            .rings
            .iter()
            .filter_map(|r| r.header())
            .reduce(|a, b| if b.is_after(a) { b } else { a });
        match latest {
            Some(target) => self.deliver_through(target),
            None => 0,
        }
    }

    fn deliver_through(&mut self, target: Tti) -> usize {
        let mut delivered = match self.delivered {
            Some(delivered) => delivered,
            // Start where every cell that has reported has data
            None => match self
                .rings
                .iter()
                .filter_map(|r| r.origin())
                .reduce(|a, b| if b.is_after(a) { b } else { a })
            {
                Some(start) => start,
                None => return 0,
            },
        };

        let window = self.rings.first().map_or(0, |r| r.size()) as u16;
        if target.is_after(delivered) && delivered.distance_to(target) > window {
            let skipped = target.sub(window);
            debug!("Delivery jumped from TTI {} to {}", delivered, skipped);
            delivered = skipped;
        }

        let mut count = 0;
        while target.is_after(delivered) {
            let tti = delivered.next();
            let mut cells: Vec<Option<SubframeDciSet>> = self.rings.iter_mut().map(|r| r.take(tti)).collect();
            for (set, tracker) in cells.iter_mut().zip(self.ue_trackers.iter_mut()) {
                if let Some(set) = set {
                    tracker.annotate(set);
                }
            }

            let aggregated = AggregatedTti { tti, cells };
            trace!("Delivering TTI {} ({} cells decoded)", tti, aggregated.decoded().count());
            for subscriber in self.subscribers.iter_mut() {
                subscriber.deliver(&aggregated);
            }

            PipelineStats::incr(&self.stats.ttis_delivered);
            delivered = tti;
            count += 1;
        }

        self.delivered = Some(delivered);
        count
    }

    /// Drain `queue` until `keep_running` turns false and the queue is empty
    pub fn run(
        mut self,
        queue: Arc<SharedQueue<SubframeDciSet>>,
        shutdown: Arc<ShutdownContext>,
        keep_running: impl Fn() -> bool,
    ) -> Self {
        info!("Aggregation status tracker started for {} cells", self.rings.len());

        loop {
            if let Some(set) = queue.pop_timeout(Duration::from_millis(10)) {
                self.ingest(set);
            } else if !keep_running() {
                break;
            }

            // A drained cell has nothing left outside the queue; once the
            // queue is empty too, nothing more can arrive for it
            for cell in 0..self.rings.len() {
                let cell = CellIndex(cell as u8);
                if self.status.is_live(cell) && shutdown.is_drained(cell) && queue.is_empty() {
                    self.retire(cell);
                }
            }
        }

        let tail = self.flush();
        info!("Aggregation status tracker stopped, {} TTIs flushed", tail);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DciCandidate, DciFormat, LinkDirection, Rnti, TransportBlock};
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<AggregatedTti>>>);

    impl TtiSubscriber for Collect {
        fn deliver(&mut self, tti: &AggregatedTti) {
            self.0.lock().push(tti.clone());
        }
    }

    impl Collect {
        fn ttis(&self) -> Vec<u16> {
            self.0.lock().iter().map(|a| a.tti.value()).collect()
        }
    }

    fn set(cell: u8, tti: u32) -> SubframeDciSet {
        SubframeDciSet::new(CellIndex(cell), Tti::new(tti), 50, 0)
    }

    fn tracker(cells: usize) -> (AggregationStatusTracker, Collect) {
        let mut tracker = AggregationStatusTracker::new(cells, 320, 30, 3000, Arc::new(PipelineStats::default()));
        let collect = Collect::default();
        tracker.subscribe(Box::new(collect.clone()));
        (tracker, collect)
    }

    #[test]
    fn test_combined_header_across_wraparound() {
        let mut status = AggregationStatus::new(2);
        status.update(CellIndex(0), Some(Tti::new(10239)));
        assert!(!status.is_ready());
        assert_eq!(status.combined(), None);

        status.update(CellIndex(1), Some(Tti::new(0)));
        assert!(status.is_ready());
        assert_eq!(status.combined(), Some(Tti::new(10239)));

        status.update(CellIndex(0), Some(Tti::new(1)));
        assert_eq!(status.combined(), Some(Tti::new(0)));
    }

    #[test]
    fn test_retired_cell_no_longer_holds_back() {
        let mut status = AggregationStatus::new(2);
        status.update(CellIndex(0), Some(Tti::new(40)));
        status.update(CellIndex(1), Some(Tti::new(12)));
        assert_eq!(status.combined(), Some(Tti::new(12)));
        status.retire(CellIndex(1));
        assert_eq!(status.combined(), Some(Tti::new(40)));
        status.retire(CellIndex(0));
        assert!(!status.is_ready());
    }

    #[test]
    fn test_out_of_order_completion_delivered_in_order() {
        let (mut tracker, collect) = tracker(1);
        for tti in [5, 7, 6, 9, 8] {
            tracker.ingest(set(0, tti));
        }
        assert_eq!(collect.ttis(), vec![5, 6, 7, 8, 9]);
        assert_eq!(tracker.delivered(), Some(Tti::new(9)));
    }

    #[test]
    fn test_two_cells_wait_for_each_other() {
        let (mut tracker, collect) = tracker(2);
        tracker.ingest(set(0, 100));
        tracker.ingest(set(0, 101));
        assert!(collect.ttis().is_empty());

        tracker.ingest(set(1, 100));
        assert_eq!(collect.ttis(), vec![100]);
        tracker.ingest(set(1, 101));
        assert_eq!(collect.ttis(), vec![100, 101]);

        let delivered = collect.0.lock();
        assert_eq!(delivered[0].cells.len(), 2);
        assert_eq!(delivered[0].decoded().count(), 2);
    }

    #[test]
    fn test_backward_jump_discarded_until_header_passed() {
        let stats = Arc::new(PipelineStats::default());
        let mut tracker = AggregationStatusTracker::new(1, 320, 30, 3000, stats.clone());
        let collect = Collect::default();
        tracker.subscribe(Box::new(collect.clone()));

        for tti in 1000..1005 {
            tracker.ingest(set(0, tti));
        }
        for tti in 200..203 {
            tracker.ingest(set(0, tti));
        }
        assert_eq!(stats.snapshot().late_sets, 3);
        assert_eq!(collect.ttis(), vec![1000, 1001, 1002, 1003, 1004]);

        tracker.ingest(set(0, 1005));
        assert_eq!(collect.ttis().last(), Some(&1005));
    }

    #[test]
    fn test_wraparound_delivery() {
        let (mut tracker, collect) = tracker(1);
        for tti in [10238, 10239, 0, 1] {
            tracker.ingest(set(0, tti));
        }
        assert_eq!(collect.ttis(), vec![10238, 10239, 0, 1]);
    }

    #[test]
    fn test_delivery_annotates_retransmissions() {
        let (mut tracker, collect) = tracker(1);
        let grant = DciCandidate {
            format: DciFormat::Format1,
            rnti: Rnti(0x4601),
            aggregation_level: 1,
            ncce: 4,
            prb_count: 20,
            harq_id: 2,
            tb: [TransportBlock { mcs: 20, rv: 0, tbs: 9000, ndi: false }, TransportBlock::default()],
            decode_prob: 0.95,
            correlation: 0.9,
            direction: LinkDirection::Downlink,
            retransmission: false,
        };
        let mut first = set(0, 50);
        first.push(grant.clone());
        let mut second = set(0, 58);
        second.push(grant);

        tracker.ingest(first);
        tracker.ingest(second);
        for tti in 51..58 {
            tracker.ingest(set(0, tti));
        }

        let delivered = collect.0.lock();
        assert_eq!(delivered.len(), 9);
        let retx: Vec<bool> = delivered
            .iter()
            .flat_map(|a| a.decoded().flat_map(|s| s.downlink.iter().map(|d| d.retransmission)))
            .collect();
        assert_eq!(retx, vec![false, true]);
        drop(delivered);
        assert!(tracker.ue_tracker(CellIndex(0)).unwrap().get(Rnti(0x4601)).is_some());
    }

    #[test]
    fn test_run_drains_and_flushes() {
        let (tracker, collect) = tracker(2);
        let queue = Arc::new(SharedQueue::new(64));
        let shutdown = ShutdownContext::new(2);
        for tti in 0..10 {
            queue.try_push(set(0, tti)).unwrap();
        }
        queue.try_push(set(1, 0)).unwrap();
        for cell in [CellIndex(1), CellIndex(0)] {
            shutdown.mark_finished(cell);
            shutdown.mark_drained(cell);
        }

        let tracker = tracker.run(queue.clone(), shutdown, || false);
        assert!(queue.is_empty());
        assert_eq!(collect.ttis(), (0..10).collect::<Vec<u16>>());
        assert_eq!(tracker.delivered(), Some(Tti::new(9)));
    }

    #[test]
    fn test_finished_cell_waited_on_until_drained() {
        let (tracker, collect) = tracker(2);
        let queue = Arc::new(SharedQueue::new(64));
        let shutdown = ShutdownContext::new(2);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handle = {
            let (queue, shutdown, done) = (queue.clone(), shutdown.clone(), done.clone());
            std::thread::spawn(move || {
                tracker.run(queue, shutdown, move || !done.load(std::sync::atomic::Ordering::SeqCst))
            })
        };

        queue.try_push(set(0, 0)).unwrap();
        for tti in 0..20 {
            queue.try_push(set(1, tti)).unwrap();
        }
        // Cell 0's source is done but its workers still hold TTIs 1 to 5
        shutdown.mark_finished(CellIndex(0));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(collect.ttis(), vec![0]);

        for tti in 1..6 {
            queue.try_push(set(0, tti)).unwrap();
        }
        shutdown.mark_drained(CellIndex(0));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(collect.ttis(), (0..20).collect::<Vec<u16>>());

        done.store(true, std::sync::atomic::Ordering::SeqCst);
        handle.join().unwrap();

        let delivered = collect.0.lock();
        let from_cell0: Vec<u16> = delivered
            .iter()
            .filter(|a| a.cells[0].is_some())
            .map(|a| a.tti.value())
            .collect();
        assert_eq!(from_cell0, (0..6).collect::<Vec<u16>>());
        assert!(delivered.iter().all(|a| a.cells[1].is_some()));
    }
}
