//! CLI Entry Point for rtdp-ingest
//!
//! Provides command-line interface for:
//! - Ingesting from the TCP sources of a configuration file, one JSON line per decoded unit
//! - Inspecting a PCAP capture (per-packet listing or per-source summary)
//! - Printing an example configuration
//!
//! # Usage
//!
//! Ingest until interrupted:
//! ```bash
//! rtdp-ingest run --config ingest.toml
//! ```
//!
//! Summarise a capture:
//! ```bash
//! rtdp-ingest pcap capture.pcap --summary
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rtdp_ingest::codec::packet::{self, FlowTable};
use rtdp_ingest::codec::pcap::PcapReader;
use rtdp_ingest::pipeline::{DecodedUnit, IngestPipeline, PipelineStats};
use rtdp_ingest::tracing_setup::{self, TracingConfig};
use rtdp_ingest::{IngestConfig, IngestError};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "rtdp-ingest")]
#[command(about = "Real-time detector and packet stream ingestion", long_about = None)]
struct Cli {
    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured source and print decoded units as JSON lines
    Run {
        /// Path to the TOML configuration
        #[arg(long)]
        config: PathBuf,

        /// Stop after this many decoded units
        #[arg(long)]
        max_units: Option<u64>,

        /// Seconds between status log lines
        #[arg(long, default_value = "10")]
        status_interval_secs: u64,
    },

    /// Decode a PCAP capture
    Pcap {
        /// Capture file
        file: PathBuf,

        /// Read at most this many records
        #[arg(long)]
        limit: Option<u64>,

        /// Only print per-source totals
        #[arg(long)]
        summary: bool,

        /// Only list packets with this IP protocol number
        #[arg(long)]
        protocol: Option<u8>,
    },

    /// Print an example configuration file
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            max_units,
            status_interval_secs,
        } => {
            run_ingest(
                config,
                max_units,
                Duration::from_secs(status_interval_secs),
                cli.log_level,
            )
            .await
        }
        Commands::Pcap {
            file,
            limit,
            summary,
            protocol,
        } => {
            init_cli_tracing(cli.log_level.as_deref())?;
            tokio::task::spawn_blocking(move || inspect_pcap(file, limit, summary, protocol)).await?
        }
        Commands::DefaultConfig => {
            print!("{}", toml::to_string_pretty(&IngestConfig::example())?);
            Ok(())
        }
    }
}

fn init_cli_tracing(level: Option<&str>) -> Result<()> {
    let level = tracing_setup::parse_log_level(level.unwrap_or("info")).map_err(anyhow::Error::msg)?;
    tracing_setup::init(TracingConfig::new(level).with_ansi(false)).map_err(anyhow::Error::msg)
}

async fn run_ingest(
    path: PathBuf,
    max_units: Option<u64>,
    status_every: Duration,
    log_level: Option<String>,
) -> Result<()> {
    let mut config = IngestConfig::load_from(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    if let Some(level) = log_level {
        config.logging.level = level;
    }
    config.validate()?;
    tracing_setup::init_from_config(&config).map_err(anyhow::Error::msg)?;

    info!(
        config = %path.display(),
        sources = config.sources.len(),
        policy = %config.ingest.merge_policy,
        format = %config.ingest.payload_format,
        "Starting ingest"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let mut worker =
        tokio::task::spawn_blocking(move || consume(config, max_units, status_every, worker_stop));

    let stats = tokio::select! {
        joined = &mut worker => joined??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupt received, shutting down");
            stop.store(true, Ordering::SeqCst);
            worker.await??
        }
    };

    info!(
        events = stats.events,
        units = stats.units,
        decode_errors = stats.decode_errors,
        filtered = stats.filtered,
        "Ingest finished"
    );
    Ok(())
}

/// Blocking consumer loop; runs until stopped, exhausted or `max_units` is reached.
fn consume(
    config: IngestConfig,
    max_units: Option<u64>,
    status_every: Duration,
    stop: Arc<AtomicBool>,
) -> Result<PipelineStats> {
    let mut pipeline = IngestPipeline::from_config(&config);
    pipeline.source_mut().open_all()?;

    let poll = config.ingest.poll_interval();
    let mut out = BufWriter::new(io::stdout().lock());
    let mut last_status = Instant::now();

    let outcome: Result<()> = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        if max_units.is_some_and(|max| pipeline.stats().units >= max) {
            info!(max_units = ?max_units, "Unit limit reached");
            break Ok(());
        }

        match pipeline.next_unit(poll) {
            Ok(Some(unit)) => {
                if let Err(err) = write_unit(&mut out, &unit) {
                    break Err(err);
                }
            }
            Ok(None) => {
                if let Err(err) = out.flush() {
                    break Err(err.into());
                }
            }
            Err(IngestError::SourcesExhausted) => {
                info!("All sources exhausted");
                break Ok(());
            }
            Err(err) => break Err(err.into()),
        }

        if last_status.elapsed() >= status_every {
            let status = pipeline.source().status();
            let stats = pipeline.stats();
            info!(
                connected = status.connected_sources,
                total = status.num_sources,
                units = stats.units,
                decode_errors = stats.decode_errors,
                "Ingest status"
            );
            match serde_json::to_string(&status) {
                Ok(json) => debug!(status = %json, "Aggregator status"),
                Err(err) => warn!(error = %err, "Could not serialize aggregator status"),
            }
            last_status = Instant::now();
        }
    };

    let flushed = out.flush();
    for err in pipeline.close() {
        warn!(error = %err, "Error while closing source");
    }
    outcome?;
    flushed?;
    Ok(pipeline.stats())
}

fn write_unit(out: &mut impl Write, unit: &DecodedUnit) -> Result<()> {
    serde_json::to_writer(&mut *out, unit)?;
    out.write_all(b"\n")?;
    Ok(())
}

fn inspect_pcap(file: PathBuf, limit: Option<u64>, summary: bool, protocol: Option<u8>) -> Result<()> {
    let input = File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?;
    let mut reader = PcapReader::new(BufReader::new(input))?;
    let header = reader.header().clone();
    info!(
        file = %file.display(),
        byte_order = %header.byte_order,
        version = %format!("{}.{}", header.version_major, header.version_minor),
        snaplen = header.snaplen,
        network = header.network,
        "Opened capture"
    );

    let nanosecond = header.magic_kind.is_nanosecond();
    let mut flows = FlowTable::new();
    let mut out = BufWriter::new(io::stdout().lock());
    let mut index = 0u64;

    while limit.map_or(true, |limit| index < limit) {
        let Some(record) = reader.next_record()? else {
            break;
        };
        let meta = packet::extract(&record.payload);
        flows.record(index, &meta, record.payload.len());

        let listed = protocol.map_or(true, |p| meta.protocol.ip_protocol() == Some(p));
        if !summary && listed {
            let time = record
                .timestamp(nanosecond)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| format!("{}.{}", record.ts_sec, record.ts_usec));
            writeln!(out, "{index:>8} {time} len={} {meta}", record.captured_length)?;
        }
        index += 1;
    }

    writeln!(out, "{index} record(s), {} non-IPv4", flows.non_ipv4())?;
    for (address, stats) in flows.sources() {
        writeln!(
            out,
            "  {address:<15} packets={} bytes={} first={} last={}",
            stats.packets, stats.bytes, stats.first_index, stats.last_index
        )?;
    }
    out.flush()?;
    Ok(())
}
