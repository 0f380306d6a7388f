//! Tab-separated DCI Logs
//!
//! One file per cell and direction. Each aggregated TTI produces one row per
//! decoded message, or a zero-filled row when the direction carried none.

use crate::InterfaceError;
use bitflags::bitflags;
use common::{AggregatedTti, DciCandidate, SharedQueue, SubframeDciSet, Tti, TtiSubscriber};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

bitflags! {
    /// Directions written to disk
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LogFlags: u8 {
        const DOWNLINK = 0b01;
        const UPLINK = 0b10;
    }
}

/// Column header written at the top of every file
pub const HEADER: &str = "#tti\trnti\tcell_prb\tue_prb\tmcs0\trv0\ttbs0\tmcs1\trv1\ttbs1\tharq\ttimestamp_us";

/// Row writer for one cell and direction
pub struct DciLogWriter<W: Write> {
    writer: W,
    rows: u64,
}

impl<W: Write> DciLogWriter<W> {
    pub fn new(mut writer: W) -> Result<Self, InterfaceError> {
        writeln!(writer, "{}", HEADER)?;
        Ok(Self { writer, rows: 0 })
    }

    /// Write one decoded message
    pub fn write_dci(&mut self, tti: Tti, cell_prb: u8, timestamp_us: u64, dci: &DciCandidate) -> Result<(), InterfaceError> {
        let [tb0, tb1] = &dci.tb;
        writeln!(
            self.writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            tti,
            dci.rnti,
            cell_prb,
            dci.prb_count,
            tb0.mcs,
            tb0.rv,
            tb0.tbs,
            tb1.mcs,
            tb1.rv,
            tb1.tbs,
            dci.harq_id,
            timestamp_us
        )?;
        self.rows += 1;
        Ok(())
    }

    /// Write the row standing for "nothing scheduled"
    pub fn write_empty(&mut self, tti: Tti, cell_prb: u8, timestamp_us: u64) -> Result<(), InterfaceError> {
        writeln!(self.writer, "{}\t0\t{}\t0\t0\t0\t0\t0\t0\t0\t0\t{}", tti, cell_prb, timestamp_us)?;
        self.rows += 1;
        Ok(())
    }

    /// Write every message of one direction, or a zero row
    pub fn write_direction(&mut self, tti: Tti, cell_prb: u8, timestamp_us: u64, messages: &[DciCandidate]) -> Result<(), InterfaceError> {
        if messages.is_empty() {
            return self.write_empty(tti, cell_prb, timestamp_us);
        }
        for dci in messages {
            self.write_dci(tti, cell_prb, timestamp_us, dci)?;
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> Result<(), InterfaceError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

struct CellLogs {
    cell_prb: u8,
    downlink: Option<DciLogWriter<BufWriter<File>>>,
    uplink: Option<DciLogWriter<BufWriter<File>>>,
}

/// Per-cell log files for a whole run
pub struct DciLogger {
    dir: PathBuf,
    cells: Vec<CellLogs>,
}

impl DciLogger {
    /// Create `dir` and open the files selected by `flags`, one per cell
    pub fn create(dir: impl AsRef<Path>, cell_prb: &[u8], flags: LogFlags) -> Result<Self, InterfaceError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let open = |cell: usize, suffix: &str| -> Result<DciLogWriter<BufWriter<File>>, InterfaceError> {
            let path = dir.join(format!("dci_cell{}_{}.log", cell, suffix));
            debug!("Opening DCI log {}", path.display());
            DciLogWriter::new(BufWriter::new(File::create(&path)?))
        };

        let mut cells = Vec::with_capacity(cell_prb.len());
        for (cell, prb) in cell_prb.iter().enumerate() {
            cells.push(CellLogs {
                cell_prb: *prb,
                downlink: if flags.contains(LogFlags::DOWNLINK) { Some(open(cell, "dl")?) } else { None },
                uplink: if flags.contains(LogFlags::UPLINK) { Some(open(cell, "ul")?) } else { None },
            });
        }

        info!("DCI logs for {} cells in {} ({:?})", cells.len(), dir.display(), flags);
        Ok(Self { dir, cells })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append the rows of one aggregated TTI
    pub fn log(&mut self, agg: &AggregatedTti) -> Result<(), InterfaceError> {
        for (index, logs) in self.cells.iter_mut().enumerate() {
            let entry: Option<&SubframeDciSet> = agg.cells.get(index).and_then(|c| c.as_ref());
            let (cell_prb, timestamp_us) = match entry {
                Some(set) => (set.cell_prb, set.timestamp_us),
                None => (logs.cell_prb, 0),
            };

            if let Some(writer) = logs.downlink.as_mut() {
                let messages = entry.map(|s| s.downlink.as_slice()).unwrap_or(&[]);
                writer.write_direction(agg.tti, cell_prb, timestamp_us, messages)?;
            }
            if let Some(writer) = logs.uplink.as_mut() {
                let messages = entry.map(|s| s.uplink.as_slice()).unwrap_or(&[]);
                writer.write_direction(agg.tti, cell_prb, timestamp_us, messages)?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), InterfaceError> {
        for logs in &mut self.cells {
            if let Some(writer) = logs.downlink.as_mut() {
                writer.flush()?;
            }
            if let Some(writer) = logs.uplink.as_mut() {
                writer.flush()?;
            }
        }
        Ok(())
    }
}

/// Pipeline-side end of the log stage queue
pub struct LogStageSender {
    queue: Arc<SharedQueue<AggregatedTti>>,
    wait: Duration,
}

impl LogStageSender {
    /// `wait` bounds how long a full queue holds the pipeline before the
    /// oldest unwritten TTI is overwritten
    pub fn new(queue: Arc<SharedQueue<AggregatedTti>>, wait: Duration) -> Self {
        Self { queue, wait }
    }
}

impl TtiSubscriber for LogStageSender {
    fn deliver(&mut self, tti: &AggregatedTti) {
        if let Some(lost) = self.queue.push_timeout(tti.clone(), self.wait) {
            warn!("Log stage full, TTI {} overwritten", lost.tti);
        }
    }
}

/// Drain `queue` into `logger` on a dedicated thread until `keep_running`
/// turns false and the queue is empty
pub fn spawn_log_stage<F>(
    mut logger: DciLogger,
    queue: Arc<SharedQueue<AggregatedTti>>,
    keep_running: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: Fn() -> bool + Send + 'static,
{
    thread::Builder::new().name("dci-log".to_string()).spawn(move || {
        let mut written = 0u64;
        loop {
            match queue.pop_timeout(Duration::from_millis(100)) {
                Some(agg) => {
                    if let Err(e) = logger.log(&agg) {
                        warn!("Failed to write DCI log for TTI {}: {}", agg.tti, e);
                    }
                    written += 1;
                }
                None if !keep_running() => break,
                None => {}
            }
        }

        if let Err(e) = logger.flush() {
            warn!("Failed to flush DCI logs: {}", e);
        }
        info!("DCI log stage stopped after {} TTIs", written);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CellIndex, DciFormat, LinkDirection, Rnti, TransportBlock};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn downlink(rnti: u16) -> DciCandidate {
        DciCandidate {
            format: DciFormat::Format2A,
            rnti: Rnti(rnti),
            aggregation_level: 2,
            ncce: 8,
            prb_count: 25,
            harq_id: 5,
            tb: [
                TransportBlock { mcs: 20, rv: 0, tbs: 15000, ndi: true },
                TransportBlock { mcs: 18, rv: 2, tbs: 12000, ndi: false },
            ],
            decode_prob: 0.99,
            correlation: 0.95,
            direction: LinkDirection::Downlink,
            retransmission: false,
        }
    }

    #[test]
    fn test_row_format() {
        let mut writer = DciLogWriter::new(Vec::new()).unwrap();
        writer.write_dci(Tti::new(321), 50, 1_700_000_000_000_000, &downlink(4660)).unwrap();
        writer.write_empty(Tti::new(322), 50, 7).unwrap();
        assert_eq!(writer.rows(), 2);

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[1], "321\t4660\t50\t25\t20\t0\t15000\t18\t2\t12000\t5\t1700000000000000");
        assert_eq!(lines[2], "322\t0\t50\t0\t0\t0\t0\t0\t0\t0\t0\t7");
        assert_eq!(lines[1].split('\t').count(), 12);
    }

    #[test]
    fn test_logger_writes_zero_rows_for_missing_cells() {
        let dir = std::env::temp_dir().join(format!("dci_scanner_log_{}", std::process::id()));
        let mut logger = DciLogger::create(&dir, &[100, 50], LogFlags::DOWNLINK).unwrap();

        let mut set = SubframeDciSet::new(CellIndex(0), Tti::new(10), 100, 55);
        set.push(downlink(1000));
        set.push(downlink(1001));
        logger.log(&AggregatedTti { tti: Tti::new(10), cells: vec![Some(set), None] }).unwrap();
        logger.flush().unwrap();

        let cell0 = fs::read_to_string(dir.join("dci_cell0_dl.log")).unwrap();
        assert_eq!(cell0.lines().count(), 3);
        let cell1 = fs::read_to_string(dir.join("dci_cell1_dl.log")).unwrap();
        assert_eq!(cell1.lines().nth(1), Some("10\t0\t50\t0\t0\t0\t0\t0\t0\t0\t0\t0"));
        assert!(!dir.join("dci_cell0_ul.log").exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_log_stage_drains_queue_before_exit() {
        let dir = std::env::temp_dir().join(format!("dci_scanner_stage_{}", std::process::id()));
        let logger = DciLogger::create(&dir, &[25], LogFlags::all()).unwrap();
        let queue = Arc::new(SharedQueue::new(16));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            spawn_log_stage(logger, queue.clone(), move || running.load(Ordering::SeqCst)).unwrap()
        };

        let mut sender = LogStageSender::new(queue.clone(), Duration::from_millis(10));
        for tti in 0..5 {
            sender.deliver(&AggregatedTti { tti: Tti::new(tti), cells: vec![None] });
        }
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        let ul = fs::read_to_string(dir.join("dci_cell0_ul.log")).unwrap();
        assert_eq!(ul.lines().count(), 6);
        fs::remove_dir_all(&dir).unwrap();
    }
}
