//! Albor Space LTE DCI Scanner
//!
//! Monitors the PDCCH of up to four LTE cells and reports every downlink
//! and uplink grant, whoever it is addressed to.

mod config;

use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::{Bandwidth, Rnti, SharedQueue, TtiSubscriber};
use config::{default_cce_count, RadioConfig, ScannerConfig, SourceConfig};
use interfaces::dci_log::{spawn_log_stage, DciLogger, LogStageSender};
use interfaces::remote_sink::{self, RemoteSinkConfig, RemoteSinkServer};
use interfaces::source::{FileSubframeSource, SimulatedSource, SubframeSource};
use interfaces::zmq_rf::{ZmqRfConfig, ZmqSubframeSource};
use layers::mac::{FrontEnd, Pipeline, ShutdownContext};
use layers::phy::sim::Traffic;
use layers::phy::{SimulatedPhyConfig, SimulatedPhyFactory};

/// Albor Space LTE DCI Scanner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "scanner.yml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Replace every configured source with a simulated clock
    #[arg(long)]
    simulate: bool,

    /// Follow this C-RNTI instead of the configured target
    #[arg(long)]
    target_rnti: Option<u16>,

    /// Seconds between statistics reports
    #[arg(long, default_value = "5")]
    stats_interval: u64,
}

fn open_source(radio: &RadioConfig, simulate: bool) -> Result<Box<dyn SubframeSource>> {
    if simulate {
        return Ok(Box::new(SimulatedSource::new(None)));
    }

    let source: Box<dyn SubframeSource> = match &radio.source {
        SourceConfig::Zmq { device_args } => {
            let zmq_config = ZmqRfConfig::from_device_args(device_args)?;
            info!("  ZMQ RX address: {}", zmq_config.rx_address);
            info!("  Sample rate: {} MHz", zmq_config.sample_rate / 1e6);
            Box::new(ZmqSubframeSource::connect(zmq_config)?)
        }
        SourceConfig::File { path } => {
            let bandwidth = Bandwidth::from_prb(radio.prb)
                .ok_or_else(|| anyhow::anyhow!("Invalid bandwidth: {} PRB", radio.prb))?;
            Box::new(FileSubframeSource::open(path, bandwidth.samples_per_subframe())?)
        }
        SourceConfig::Simulated { limit } => Box::new(SimulatedSource::new(*limit)),
    };
    Ok(source)
}

fn build_front_ends(config: &ScannerConfig, simulate: bool) -> Result<Vec<FrontEnd>> {
    let mut front_ends = Vec::with_capacity(config.radios.len());
    for (index, radio) in config.radios.iter().enumerate() {
        info!("Radio {}:", index);
        info!("  Bandwidth: {} PRB", radio.prb);
        if let Some(frequency) = radio.center_frequency_hz {
            info!("  Frequency: {} MHz", frequency / 1e6);
        }

        let phy = SimulatedPhyConfig {
            n_cce: radio.phy.n_cce.unwrap_or_else(|| default_cce_count(radio.prb)),
            cfi: 3,
            cell_prb: radio.prb,
            formats: config.decoder.formats.clone(),
            sfn_offset: radio.phy.sfn_offset,
            traffic: Traffic::Random {
                seed: radio.phy.seed.wrapping_add(index as u64),
                ues: radio.phy.ues.iter().copied().map(Rnti).collect(),
                max_per_subframe: radio.phy.max_per_subframe,
            },
        };

        front_ends.push(FrontEnd {
            cell_prb: radio.prb,
            source: open_source(radio, simulate)?,
            phy_factory: Arc::new(SimulatedPhyFactory::new(phy)),
        });
    }
    Ok(front_ends)
}

async fn wait_all_finished(shutdown: Arc<ShutdownContext>) {
    while !shutdown.all_finished() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor Space LTE DCI Scanner");
    info!("Configuration file: {}", args.config);

    let config = ScannerConfig::from_yaml_file(&args.config)?;
    let pipeline_config = config.pipeline_config(args.target_rnti);
    let cell_prb = config.cell_prb();
    info!("Target RNTI: {}", pipeline_config.target);
    if args.simulate {
        info!("Simulated front-ends");
    }

    let front_ends = build_front_ends(&config, args.simulate)?;
    let mut subscribers: Vec<Box<dyn TtiSubscriber>> = Vec::new();

    // DCI log stage
    let log_running = Arc::new(AtomicBool::new(true));
    let log_handle = match &config.log.dir {
        Some(dir) => {
            let logger = DciLogger::create(dir, &cell_prb, config.log.log_flags())?;
            let queue = Arc::new(SharedQueue::new(config.log.queue_capacity));
            subscribers.push(Box::new(LogStageSender::new(queue.clone(), Duration::from_millis(5))));
            let running = log_running.clone();
            info!("Writing DCI logs to {}", dir.display());
            Some(spawn_log_stage(logger, queue, move || running.load(Ordering::SeqCst))?)
        }
        None => None,
    };

    // Remote sink
    let sink_handle = match &config.remote_sink {
        Some(sink) => {
            let (handle, rx) = remote_sink::channel(sink.queue_capacity);
            let server = RemoteSinkServer::bind(RemoteSinkConfig {
                bind_addr: sink.bind_addr,
                target: pipeline_config.target,
                cell_prb: cell_prb.clone(),
            })
            .await?;
            subscribers.push(Box::new(handle));
            Some(tokio::spawn(server.run(rx)))
        }
        None => None,
    };

    let pipeline = Pipeline::start(pipeline_config, front_ends, subscribers)?;
    let shutdown = pipeline.shutdown_context();
    info!("DCI scanner initialized successfully");

    // Start statistics reporting
    let stats_handle = {
        let counters = pipeline.counters();
        let shutdown = shutdown.clone();
        let period = Duration::from_secs(args.stats_interval.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            while shutdown.keep_running() {
                interval.tick().await;
                let stats = counters.snapshot();
                info!("Pipeline Statistics:");
                info!("  Subframes: {} acquired, {} unsynced, {} source errors",
                      stats.subframes_acquired, stats.subframes_unsynced, stats.source_errors);
                info!("  Scheduling: {} direct, {} buffered, {} placeholders, {} dropped",
                      stats.assigned_direct, stats.buffered, stats.placeholders, stats.dropped);
                info!("  Decoding: {} DCIs, {} errors, {} TTIs delivered",
                      stats.dci_decoded, stats.decode_errors, stats.ttis_delivered);
                if stats.sequence_gaps > 0 || stats.gaps_forced > 0 || stats.output_overwritten > 0 {
                    warn!("  Anomalies: {} sequence gaps, {} forced gaps, {} overwritten",
                          stats.sequence_gaps, stats.gaps_forced, stats.output_overwritten);
                }
            }
        })
    };

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = wait_all_finished(shutdown.clone()) => {
            info!("All front-ends finished");
        }
    }

    // Shutdown
    info!("Shutting down DCI scanner");
    let snapshot = tokio::task::spawn_blocking(move || pipeline.stop()).await?;
    stats_handle.abort();

    log_running.store(false, Ordering::SeqCst);
    if let Some(handle) = log_handle {
        if tokio::task::spawn_blocking(move || handle.join()).await?.is_err() {
            error!("DCI log stage panicked");
        }
    }

    if let Some(handle) = sink_handle {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("Remote sink error: {}", e),
            Ok(Err(e)) => error!("Remote sink task failed: {}", e),
            Err(_) => warn!("Remote sink did not stop in time"),
        }
    }

    info!("Final statistics: {}", serde_json::to_string(&snapshot)?);
    info!("DCI scanner shutdown complete");
    Ok(())
}
