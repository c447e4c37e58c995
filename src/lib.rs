//! # RTDP Ingest Library
//!
//! Real-time ingestion of detector and network data from one or more TCP sources. Each source
//! runs a connection handler thread that reads length-prefixed frames and publishes them into a
//! bounded single-producer/single-consumer ring. A consumer pulls events from one source or from
//! an aggregator that merges several, and decodes them as captured Ethernet frames or SAMPA
//! detector frames.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-layered TOML + environment configuration. See `config::IngestConfig`.
//! - **`error`**: The `IngestError` enum shared by every module.
//! - **`tracing_setup`**: `tracing-subscriber` initialisation (pretty, compact or JSON output).
//! - **`ring`**: The event ring (`RingChannel`) and its throughput monitor.
//! - **`source`**: TCP transport, retry policy and the per-source `ConnectionHandler`.
//! - **`aggregator`**: `Source` and `SourceAggregator` with the round-robin, first-available and
//!   concatenate merge policies.
//! - **`codec`**: PCAP file codec, packet metadata extraction and the SAMPA frame codec.
//! - **`analysis`**: Per-channel baseline, peak, integral and SNR of SAMPA waveforms.
//! - **`pipeline`**: `IngestPipeline`, which turns merged events into decoded units.

pub mod aggregator;
pub mod analysis;
pub mod codec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod ring;
pub mod source;
pub mod tracing_setup;

pub use aggregator::{EventSource, MergePolicy, MergedEvent, Source, SourceAggregator};
pub use config::IngestConfig;
pub use error::{AppResult, IngestError};
pub use pipeline::{DecodedUnit, IngestPipeline, PayloadFormat};
