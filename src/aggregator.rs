//! Single- and multi-source event aggregation.
//!
//! A [`Source`] pairs one producer (a network [`ConnectionHandler`] or an in-process
//! [`RingProducer`]) with the consuming half of its ring. A [`SourceAggregator`] owns an ordered
//! list of sources and merges their events under a [`MergePolicy`]:
//!
//! - **round_robin**: scan at most once around the list starting after the last source that
//!   yielded; the start index moves past the yielding source.
//! - **first_available**: scan from index 0 on every call. Low indices are favoured; a busy
//!   source 0 can starve the others.
//! - **concatenate**: take one event from every source that has one and return them together,
//!   in source order.
//!
//! Ordering holds within a source only. Sources that are disconnected are still drained, so
//! events buffered before a connection dropped are delivered.

use crate::config::{IngestConfig, SourceConfig};
use crate::error::{AppResult, IngestError};
use crate::ring::{
    Event, MonitorSnapshot, ReadySignal, RingBufferMonitor, RingChannel, RingConsumer, RingProducer,
};
use crate::source::{ConnectionHandler, HandlerConfig, HandlerStatsSnapshot};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How events from several sources are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Rotate the starting source after every yielded event.
    #[default]
    RoundRobin,
    /// Always prefer the lowest-index source with an event.
    FirstAvailable,
    /// One event from every ready source, concatenated in source order.
    Concatenate,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergePolicy::RoundRobin => "round_robin",
            MergePolicy::FirstAvailable => "first_available",
            MergePolicy::Concatenate => "concatenate",
        })
    }
}

/// One or more events returned by a single pull.
///
/// Round-robin and first-available always yield exactly one part; concatenate yields one part
/// per ready source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEvent {
    parts: Vec<Event>,
}

impl MergedEvent {
    /// Wrap a single event.
    pub fn single(event: Event) -> Self {
        Self { parts: vec![event] }
    }

    /// Constituent events in source order.
    pub fn parts(&self) -> &[Event] {
        &self.parts
    }

    /// Take the constituent events.
    pub fn into_parts(self) -> Vec<Event> {
        self.parts
    }

    /// Source of every part, in order.
    pub fn source_ids(&self) -> Vec<u32> {
        self.parts.iter().map(|e| e.source_id).collect()
    }

    /// Total payload bytes.
    pub fn payload_len(&self) -> usize {
        self.parts.iter().map(|e| e.payload.len()).sum()
    }

    /// All payloads concatenated in source order.
    pub fn into_payload(mut self) -> Bytes {
        if self.parts.len() == 1 {
            return self.parts.remove(0).payload;
        }
        let mut out = BytesMut::with_capacity(self.payload_len());
        for part in &self.parts {
            out.extend_from_slice(&part.payload);
        }
        out.freeze()
    }
}

/// Anything the ingest pipeline can pull merged events from.
pub trait EventSource {
    /// Next event, waiting up to `timeout`. `Ok(None)` is idle; errors are fatal.
    fn next_event_timeout(&mut self, timeout: Duration) -> AppResult<Option<MergedEvent>>;

    /// Whether at least one producer can still deliver events.
    fn is_open(&self) -> bool;

    /// Tear everything down, returning the errors encountered.
    fn close(&mut self) -> Vec<IngestError>;
}

enum Feed {
    Network(ConnectionHandler),
    Local,
}

/// One producer and the consuming half of its ring.
pub struct Source {
    feed: Feed,
    consumer: RingConsumer,
    monitor: Arc<RingBufferMonitor>,
    endpoint: String,
    source_id: u32,
}

/// Status of one source inside an [`AggregatorStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    /// Position in the source list.
    pub index: usize,
    /// Identifier stamped on the source's events.
    pub source_id: u32,
    /// `host:port`, or `local:<name>` for in-process sources.
    pub endpoint: String,
    /// Connection state label.
    pub state: String,
    /// Whether the source currently counts as connected.
    pub connected: bool,
    /// Failure reason of a failed source.
    pub failure: Option<String>,
    /// Ring fill level and throughput.
    pub buffer: MonitorSnapshot,
    /// Handler counters (network sources only).
    pub stats: Option<HandlerStatsSnapshot>,
}

/// Aggregate connectivity and per-source status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorStatus {
    /// Time the status was taken.
    pub generated_at: DateTime<Utc>,
    /// Merge policy in effect.
    pub policy: MergePolicy,
    /// Number of sources.
    pub num_sources: usize,
    /// Number of connected sources.
    pub connected_sources: usize,
    /// Per-source details, in source order.
    pub sources: Vec<SourceStatus>,
}

impl fmt::Display for AggregatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}/{} sources connected (policy {})",
            self.connected_sources, self.num_sources, self.policy
        )?;
        for s in &self.sources {
            writeln!(f, "  [{}] {} ({}) id={} {}", s.index, s.endpoint, s.state, s.source_id, s.buffer)?;
        }
        Ok(())
    }
}

impl Source {
    /// Network source over TCP.
    pub fn network(config: HandlerConfig) -> Self {
        let endpoint = config.source.endpoint();
        let source_id = config.source_id;
        let (handler, consumer) = ConnectionHandler::tcp(config);
        let monitor = Arc::clone(handler.monitor());
        Self {
            feed: Feed::Network(handler),
            consumer,
            monitor,
            endpoint,
            source_id,
        }
    }

    /// Network source for `host:port` with default parameters.
    pub fn tcp(params: SourceConfig, source_id: u32) -> Self {
        Self::network(HandlerConfig::new(params, source_id))
    }

    /// In-process source fed through the returned producer (file replay, tests).
    ///
    /// It counts as connected until the producer is dropped.
    pub fn local(name: &str, source_id: u32, capacity: usize) -> (Self, RingProducer) {
        let (producer, consumer) = RingChannel::with_capacity(capacity, source_id);
        let monitor = Arc::new(RingBufferMonitor::new(Arc::clone(producer.channel())));
        let source = Self {
            feed: Feed::Local,
            consumer,
            monitor,
            endpoint: format!("local:{name}"),
            source_id,
        };
        (source, producer)
    }

    /// Endpoint name.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Identifier stamped on this source's events.
    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    /// The network handler, if this is a network source.
    pub fn handler(&self) -> Option<&ConnectionHandler> {
        match &self.feed {
            Feed::Network(handler) => Some(handler),
            Feed::Local => None,
        }
    }

    /// Connect (network sources) and start producing.
    pub fn open(&self) -> AppResult<()> {
        match &self.feed {
            Feed::Network(handler) => handler.open(),
            Feed::Local => Ok(()),
        }
    }

    /// Stop the producer. Buffered events remain readable.
    pub fn close(&self) -> AppResult<()> {
        match &self.feed {
            Feed::Network(handler) => handler.stop(),
            Feed::Local => {
                self.consumer.channel().alert();
                Ok(())
            }
        }
    }

    /// Whether the producer is currently delivering.
    pub fn is_connected(&self) -> bool {
        match &self.feed {
            Feed::Network(handler) => handler.is_connected(),
            Feed::Local => !self.consumer.channel().is_closed(),
        }
    }

    /// Whether the producer is gone and every buffered event has been read.
    pub fn is_exhausted(&self) -> bool {
        self.consumer.is_drained()
    }

    /// Next event without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        self.consumer.try_next()
    }

    /// Next event, waiting up to `timeout`.
    pub fn next_event(&mut self, timeout: Duration) -> Option<Event> {
        self.consumer.next_event(timeout)
    }

    /// Throughput monitor of this source's ring.
    pub fn monitor(&self) -> &Arc<RingBufferMonitor> {
        &self.monitor
    }

    /// Status entry for position `index`.
    pub fn status(&self, index: usize) -> SourceStatus {
        let (state, failure, stats) = match &self.feed {
            Feed::Network(handler) => {
                let state = handler.state();
                (
                    state.label().to_string(),
                    state.failure_reason().map(str::to_owned),
                    Some(handler.stats()),
                )
            }
            Feed::Local => {
                // Local rings have no handler feeding the monitor.
                self.monitor.refresh();
                let state = if self.is_connected() { "connected" } else { "closed" };
                (state.to_string(), None, None)
            }
        };

        SourceStatus {
            index,
            source_id: self.source_id,
            endpoint: self.endpoint.clone(),
            connected: self.is_connected(),
            state,
            failure,
            buffer: self.monitor.snapshot(),
            stats,
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("endpoint", &self.endpoint)
            .field("source_id", &self.source_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl EventSource for Source {
    fn next_event_timeout(&mut self, timeout: Duration) -> AppResult<Option<MergedEvent>> {
        if let Some(event) = self.consumer.next_event(timeout) {
            return Ok(Some(MergedEvent::single(event)));
        }
        if self.is_exhausted() {
            return Err(IngestError::SourcesExhausted);
        }
        Ok(None)
    }

    fn is_open(&self) -> bool {
        self.is_connected()
    }

    fn close(&mut self) -> Vec<IngestError> {
        Source::close(self).err().into_iter().collect()
    }
}

/// Ordered set of sources merged under one policy.
#[derive(Debug)]
pub struct SourceAggregator {
    sources: Vec<Source>,
    policy: MergePolicy,
    next_index: usize,
    ready: Arc<ReadySignal>,
}

impl SourceAggregator {
    /// Aggregate `sources` (not yet opened).
    pub fn new(sources: Vec<Source>, policy: MergePolicy) -> Self {
        let ready = Arc::new(ReadySignal::new());
        for source in &sources {
            source.consumer.channel().attach(Arc::clone(&ready));
        }
        Self {
            sources,
            policy,
            next_index: 0,
            ready,
        }
    }

    /// Network sources for every `[[sources]]` entry (not yet opened).
    pub fn from_config(config: &IngestConfig) -> Self {
        let sources = (0..config.sources.len())
            .map(|index| Source::network(HandlerConfig::from_ingest_config(config, index)))
            .collect();
        Self::new(sources, config.ingest.merge_policy)
    }

    /// Build from `config` and open every source.
    pub fn open(config: &IngestConfig) -> AppResult<Self> {
        let mut aggregator = Self::from_config(config);
        aggregator.open_all()?;
        Ok(aggregator)
    }

    /// Open every source. Fails only if no source could be opened.
    pub fn open_all(&mut self) -> AppResult<()> {
        if self.sources.is_empty() {
            return Err(IngestError::NotOpen);
        }

        let mut errors = Vec::new();
        for source in &self.sources {
            if let Err(err) = source.open() {
                warn!(endpoint = %source.endpoint(), error = %err, "Source failed to open");
                errors.push(format!("{}: {}", source.endpoint(), err));
            }
        }

        let total = self.sources.len();
        if errors.len() == total {
            error!(total, "No source could be opened");
            return Err(IngestError::AllSourcesFailed { errors });
        }
        if errors.is_empty() {
            info!(total, policy = %self.policy, "All sources open");
        } else {
            warn!(
                connected = total - errors.len(),
                total,
                "Partial connectivity; continuing with the sources that opened"
            );
        }
        Ok(())
    }

    /// Merge policy.
    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Sources in order.
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Index the next round-robin scan starts from.
    pub fn next_source_index(&self) -> usize {
        self.next_index
    }

    /// Number of sources currently connected.
    pub fn connected_count(&self) -> usize {
        self.sources.iter().filter(|s| s.is_connected()).count()
    }

    /// Whether any source is connected.
    pub fn is_open(&self) -> bool {
        self.connected_count() > 0
    }

    /// Whether every source is finished and drained.
    pub fn is_exhausted(&self) -> bool {
        self.sources.iter().all(Source::is_exhausted)
    }

    /// Next merged event without waiting.
    ///
    /// Returns [`IngestError::SourcesExhausted`] once every source has stopped producing and
    /// nothing is buffered.
    pub fn next_event(&mut self) -> AppResult<Option<MergedEvent>> {
        if self.sources.is_empty() {
            return Err(IngestError::NotOpen);
        }

        let merged = match self.policy {
            MergePolicy::RoundRobin => self.next_round_robin(),
            MergePolicy::FirstAvailable => self
                .sources
                .iter_mut()
                .find_map(Source::try_next)
                .map(MergedEvent::single),
            MergePolicy::Concatenate => {
                let parts: Vec<Event> = self.sources.iter_mut().filter_map(Source::try_next).collect();
                (!parts.is_empty()).then_some(MergedEvent { parts })
            }
        };

        match merged {
            Some(event) => Ok(Some(event)),
            None if self.is_exhausted() => Err(IngestError::SourcesExhausted),
            None => Ok(None),
        }
    }

    fn next_round_robin(&mut self) -> Option<MergedEvent> {
        let n = self.sources.len();
        for offset in 0..n {
            let index = (self.next_index + offset) % n;
            if let Some(event) = self.sources[index].try_next() {
                self.next_index = (index + 1) % n;
                return Some(MergedEvent::single(event));
            }
        }
        None
    }

    /// Pull under the merge policy until an event arrives or `timeout` elapses.
    pub fn next_event_timeout(&mut self, timeout: Duration) -> AppResult<Option<MergedEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Taken before polling so a publish in between is not missed.
            let seen = self.ready.epoch();
            if let Some(event) = self.next_event()? {
                return Ok(Some(event));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.ready.wait_past(seen, deadline - now);
        }
    }

    /// Stop every source regardless of state, collecting per-source errors.
    pub fn close(&mut self) -> Vec<IngestError> {
        let mut errors = Vec::new();
        for source in &self.sources {
            if let Err(err) = source.close() {
                error!(endpoint = %source.endpoint(), error = %err, "Failed to close source");
                errors.push(err);
            }
        }
        info!(sources = self.sources.len(), failures = errors.len(), "Aggregator closed");
        errors
    }

    /// Per-source and aggregate status.
    pub fn status(&self) -> AggregatorStatus {
        let sources: Vec<SourceStatus> = self
            .sources
            .iter()
            .enumerate()
            .map(|(index, source)| source.status(index))
            .collect();
        AggregatorStatus {
            generated_at: Utc::now(),
            policy: self.policy,
            num_sources: sources.len(),
            connected_sources: sources.iter().filter(|s| s.connected).count(),
            sources,
        }
    }

    /// [`status`](Self::status) as pretty-printed JSON.
    pub fn status_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.status())
    }
}

impl EventSource for SourceAggregator {
    fn next_event_timeout(&mut self, timeout: Duration) -> AppResult<Option<MergedEvent>> {
        SourceAggregator::next_event_timeout(self, timeout)
    }

    fn is_open(&self) -> bool {
        SourceAggregator::is_open(self)
    }

    fn close(&mut self) -> Vec<IngestError> {
        SourceAggregator::close(self)
    }
}
