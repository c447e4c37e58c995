//! Decoding stage on top of an [`EventSource`].
//!
//! [`IngestPipeline::next_unit`] pulls merged events, splits them into their per-source parts and
//! decodes each payload according to the configured [`PayloadFormat`]. Undecodable payloads and
//! packets rejected by the protocol filter are counted and skipped; they never end the stream.

use crate::aggregator::{EventSource, SourceAggregator};
use crate::analysis::{ChannelAnalyzer, ProcessedFrame};
use crate::codec::packet::{self, PacketMeta, Protocol};
use crate::codec::sampa::SampaFrame;
use crate::codec::CodecError;
use crate::config::IngestConfig;
use crate::error::{AppResult, IngestError};
use crate::ring::Event;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Smallest frame [`packet::extract`] can classify.
const MIN_CLASSIFIABLE_FRAME: usize = 34;

/// How frame payloads are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Each frame is one captured Ethernet frame.
    #[default]
    Ethernet,
    /// Each frame is one serialized [`SampaFrame`].
    Sampa,
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayloadFormat::Ethernet => "ethernet",
            PayloadFormat::Sampa => "sampa",
        })
    }
}

/// Decoded content of one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum UnitBody {
    /// Packet metadata of an Ethernet frame.
    Packet(PacketMeta),
    /// Analysis results of a SAMPA frame.
    Sampa(ProcessedFrame),
}

/// One decoded frame with its origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedUnit {
    /// Source the frame arrived on.
    pub source_id: u32,
    /// Position of the frame in its source's ring.
    pub sequence: u64,
    /// Decoded content.
    pub body: UnitBody,
}

impl DecodedUnit {
    /// Packet metadata, if this unit came from an Ethernet frame.
    pub fn packet(&self) -> Option<&PacketMeta> {
        match &self.body {
            UnitBody::Packet(meta) => Some(meta),
            UnitBody::Sampa(_) => None,
        }
    }

    /// Analysis results, if this unit came from a SAMPA frame.
    pub fn sampa(&self) -> Option<&ProcessedFrame> {
        match &self.body {
            UnitBody::Sampa(frame) => Some(frame),
            UnitBody::Packet(_) => None,
        }
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Frames taken from the source.
    pub events: u64,
    /// Units handed to the caller.
    pub units: u64,
    /// Frames that failed to decode.
    pub decode_errors: u64,
    /// Packets dropped by the protocol filter.
    pub filtered: u64,
}

/// Pulls frames from an [`EventSource`] and yields decoded units.
pub struct IngestPipeline<S: EventSource = SourceAggregator> {
    source: S,
    format: PayloadFormat,
    protocol_filter: Option<u8>,
    analyzer: ChannelAnalyzer,
    pending: VecDeque<Event>,
    stats: PipelineStats,
}

impl<S: EventSource> IngestPipeline<S> {
    /// Decode `source`'s frames as `format`.
    pub fn new(source: S, format: PayloadFormat) -> Self {
        Self {
            source,
            format,
            protocol_filter: None,
            analyzer: ChannelAnalyzer::default(),
            pending: VecDeque::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Keep only packets whose IP protocol number is `protocol`.
    pub fn with_protocol_filter(mut self, protocol: Option<u8>) -> Self {
        self.protocol_filter = protocol;
        self
    }

    /// Use `analyzer` for SAMPA frames.
    pub fn with_analyzer(mut self, analyzer: ChannelAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Payload format in effect.
    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// Counters so far.
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// The underlying event source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable access to the underlying event source.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Next decoded unit, waiting up to `timeout` in total.
    ///
    /// `Ok(None)` means nothing decodable arrived in time. Errors from the source, including
    /// [`IngestError::SourcesExhausted`], are returned once every buffered part is consumed.
    pub fn next_unit(&mut self, timeout: Duration) -> AppResult<Option<DecodedUnit>> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(event) = self.pending.pop_front() {
                if let Some(unit) = self.decode(event) {
                    self.stats.units += 1;
                    return Ok(Some(unit));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.source.next_event_timeout(remaining)? {
                Some(merged) => {
                    let parts = merged.into_parts();
                    self.stats.events += parts.len() as u64;
                    self.pending.extend(parts);
                }
                None => return Ok(None),
            }
        }
    }

    /// Close the source, returning any errors it reported.
    pub fn close(&mut self) -> Vec<IngestError> {
        self.pending.clear();
        self.source.close()
    }

    fn decode(&mut self, event: Event) -> Option<DecodedUnit> {
        let body = match self.format {
            PayloadFormat::Ethernet => {
                let meta = match decode_packet(&event.payload) {
                    Ok(meta) => meta,
                    Err(err) => return self.reject(&event, err),
                };
                if let Some(wanted) = self.protocol_filter {
                    if meta.protocol.ip_protocol() != Some(wanted) {
                        self.stats.filtered += 1;
                        return None;
                    }
                }
                UnitBody::Packet(meta)
            }
            PayloadFormat::Sampa => match SampaFrame::deserialize(&event.payload) {
                Ok(frame) => UnitBody::Sampa(self.analyzer.analyze_frame(&frame)),
                Err(err) => return self.reject(&event, err),
            },
        };

        Some(DecodedUnit {
            source_id: event.source_id,
            sequence: event.sequence,
            body,
        })
    }

    fn reject(&mut self, event: &Event, err: CodecError) -> Option<DecodedUnit> {
        self.stats.decode_errors += 1;
        if self.stats.decode_errors == 1 {
            warn!(
                source_id = event.source_id,
                sequence = event.sequence,
                format = %self.format,
                error = %err,
                "Skipping undecodable frame"
            );
        } else {
            debug!(
                source_id = event.source_id,
                sequence = event.sequence,
                error = %err,
                "Skipping undecodable frame"
            );
        }
        None
    }
}

impl IngestPipeline<SourceAggregator> {
    /// Aggregator and decoding settings from `config`; sources are not opened.
    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(
            SourceAggregator::from_config(config),
            config.ingest.payload_format,
        )
        .with_protocol_filter(config.ingest.protocol_filter)
    }
}

impl<S: EventSource> fmt::Debug for IngestPipeline<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("format", &self.format)
            .field("protocol_filter", &self.protocol_filter)
            .field("pending", &self.pending.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Packet metadata of a frame long enough to classify.
pub fn decode_packet(frame: &[u8]) -> Result<PacketMeta, CodecError> {
    let meta = packet::extract(frame);
    if meta.protocol == Protocol::Unknown {
        return Err(CodecError::TruncatedHeader {
            what: "ethernet/ipv4 header",
            needed: MIN_CLASSIFIABLE_FRAME,
            got: frame.len(),
        });
    }
    Ok(meta)
}
