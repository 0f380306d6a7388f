//! Real-time decoding pipeline
//!
//! Schedulers, decoder worker pools, the pending work queue, per-cell ring
//! buffers and the cross-cell aggregation that turns subframes from several
//! radio front-ends into one TTI-ordered DCI stream.

pub mod harq;
pub mod pending;
pub mod pipeline;
pub mod ring;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod status;
pub mod ue_tracker;
pub mod worker;

pub use harq::{PendingAck, PendingAckTable};
pub use pending::{PendingWorkQueue, SubmitOutcome};
pub use pipeline::{FrontEnd, Pipeline, PipelineConfig};
pub use ring::{CellRingBuffer, InsertOutcome};
pub use scheduler::{SfnTracker, TaskScheduler};
pub use shutdown::ShutdownContext;
pub use stats::{PipelineStats, StatsSnapshot};
pub use status::{AggregationStatus, AggregationStatusTracker};
pub use ue_tracker::{UeActivity, UeTracker};
pub use worker::{DecoderJob, DecoderWorkerPool, JobDispatch, SubframeDecoder, SubframeWork, WorkerContext};
