//! Pipeline counters
//!
//! Capacity and sequence anomalies never surface as errors; they are
//! counted here and reported periodically.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! pipeline_counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Shared atomic counters
        #[derive(Debug, Default)]
        pub struct PipelineStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of `PipelineStats`
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $(pub $name: u64,)*
        }

        impl PipelineStats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

pipeline_counters! {
    /// Subframes read from the front-ends
    subframes_acquired,
    /// Subframes discarded while the SFN was unknown
    subframes_unsynced,
    /// Transient front-end errors
    source_errors,
    /// Broadcast SFN disagreed with the running count
    sequence_gaps,
    /// Work handed straight to an idle worker
    assigned_direct,
    /// Work parked in the pending queue
    buffered,
    /// Pending queue full: samples dropped, placeholder sent instead
    placeholders,
    /// Skip list full: subframe lost entirely
    dropped,
    /// Control region estimation failures
    decode_errors,
    /// DCIs accepted by the matcher
    dci_decoded,
    /// Subframe sets pushed to the output queue
    sets_published,
    /// Output queue entries overwritten while full
    output_overwritten,
    /// Ring gaps released by the timeout
    gaps_forced,
    /// Ring entries overwritten before being consumed
    ring_overwrites,
    /// Sets arriving behind their ring header
    late_sets,
    /// Aggregated TTIs handed to subscribers
    ttis_delivered,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
