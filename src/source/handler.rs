//! Per-endpoint connection handler.
//!
//! A [`ConnectionHandler`] owns one [`Transport`] and the producing half of one ring. `open()`
//! connects (with the `[connect]` retry policy) on the caller's thread, then spawns a dedicated
//! worker thread that reads frames and publishes them into the ring. Dropped connections and
//! desynchronized streams are re-established with the `[reconnect]` policy; exhausting it leaves
//! the handler in the terminal `Failed` state.
//!
//! # Shutdown
//!
//! `stop()` can be called from any thread, any number of times. It clears the running flag,
//! wakes any retry sleep, closes the transport (unblocking a socket read), alerts the ring
//! (unblocking a publish) and joins the worker.

use super::reconnect::{ConnectionState, RetryPolicy};
use super::transport::{FrameRead, TcpTransport, Transport};
use crate::config::{IngestConfig, SourceConfig};
use crate::error::{AppResult, IngestError};
use crate::ring::{RingBufferMonitor, RingChannel, RingConsumer, RingError, RingProducer};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Everything a handler needs besides its transport.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Connection parameters (ring capacity, frame limit, ...).
    pub source: SourceConfig,
    /// Identifier stamped on every event.
    pub source_id: u32,
    /// Policy for the initial connect.
    pub connect: RetryPolicy,
    /// Policy after an established connection drops.
    pub reconnect: RetryPolicy,
    /// How long a publish may wait for ring space before the source is declared stalled.
    pub publish_timeout: Duration,
    /// Interval between monitor updates.
    pub monitor_interval: Duration,
}

impl HandlerConfig {
    /// Defaults for `source`: three connect and reconnect attempts one second apart.
    pub fn new(source: SourceConfig, source_id: u32) -> Self {
        Self {
            source,
            source_id,
            connect: RetryPolicy::connect_default(),
            reconnect: RetryPolicy::default(),
            publish_timeout: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(1),
        }
    }

    /// Settings for source `index` of a full configuration.
    pub fn from_ingest_config(config: &IngestConfig, index: usize) -> Self {
        Self {
            source: config.sources[index].clone(),
            source_id: config.source_id(index),
            connect: config.connect.clone(),
            reconnect: config.reconnect.clone(),
            publish_timeout: config.ingest.publish_timeout(),
            monitor_interval: config.ingest.monitor_interval(),
        }
    }

    /// Replace the connect policy.
    pub fn with_connect(mut self, policy: RetryPolicy) -> Self {
        self.connect = policy;
        self
    }

    /// Replace the reconnect policy.
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Replace the publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// Counters owned by one handler.
#[derive(Debug, Default)]
pub struct HandlerStats {
    frames: AtomicU64,
    bytes: AtomicU64,
    read_timeouts: AtomicU64,
    desyncs: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Copy of [`HandlerStats`] for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStatsSnapshot {
    /// Frames published into the ring.
    pub frames: u64,
    /// Payload bytes published.
    pub bytes: u64,
    /// Read timeouts with no frame pending.
    pub read_timeouts: u64,
    /// Invalid length prefixes.
    pub desyncs: u64,
    /// Reconnect attempts, successful or not.
    pub reconnect_attempts: u64,
    /// Successful reconnects.
    pub reconnects: u64,
    /// Most recent connection error.
    pub last_error: Option<String>,
}

impl HandlerStats {
    /// Current values.
    pub fn snapshot(&self) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            read_timeouts: self.read_timeouts.load(Ordering::Relaxed),
            desyncs: self.desyncs.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn record_error(&self, err: &IngestError) {
        *self.last_error.lock() = Some(err.to_string());
    }
}

/// Interruptible sleep shared between the worker and `stop()`.
#[derive(Debug, Default)]
struct StopSignal {
    lock: Mutex<()>,
    wake: Condvar,
}

struct Shared<T: Transport> {
    transport: T,
    config: HandlerConfig,
    endpoint: String,
    running: AtomicBool,
    stopped: AtomicBool,
    state: Mutex<ConnectionState>,
    stats: HandlerStats,
    ring: Arc<RingChannel>,
    monitor: Arc<RingBufferMonitor>,
    signal: StopSignal,
}

/// Connection state machine for one endpoint.
pub struct ConnectionHandler<T: Transport = TcpTransport> {
    shared: Arc<Shared<T>>,
    producer: Mutex<Option<RingProducer>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandler<TcpTransport> {
    /// TCP handler for `config.source`, with the consuming half of its ring.
    pub fn tcp(config: HandlerConfig) -> (Self, RingConsumer) {
        let transport = TcpTransport::new(config.source.clone());
        Self::new(transport, config)
    }
}

impl<T: Transport> ConnectionHandler<T> {
    /// Handler over `transport`; creates its ring and returns the consuming half.
    pub fn new(transport: T, config: HandlerConfig) -> (Self, RingConsumer) {
        let (producer, consumer) =
            RingChannel::with_capacity(config.source.ring_capacity, config.source_id);
        let ring = Arc::clone(producer.channel());
        let monitor = Arc::new(RingBufferMonitor::new(Arc::clone(&ring)));

        let shared = Arc::new(Shared {
            endpoint: transport.endpoint(),
            transport,
            config,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Disconnected),
            stats: HandlerStats::default(),
            ring,
            monitor,
            signal: StopSignal::default(),
        });

        let handler = Self {
            shared,
            producer: Mutex::new(Some(producer)),
            worker: Mutex::new(None),
        };
        (handler, consumer)
    }

    /// Endpoint name used in logs.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Identifier stamped on every event.
    pub fn source_id(&self) -> u32 {
        self.shared.config.source_id
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().clone()
    }

    /// Whether the handler is in `Connected`.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().is_connected()
    }

    /// Handler counters.
    pub fn stats(&self) -> HandlerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Throughput monitor of this handler's ring.
    pub fn monitor(&self) -> &Arc<RingBufferMonitor> {
        &self.shared.monitor
    }

    /// Connect with the `[connect]` retry policy, then start the reader thread.
    ///
    /// Calling `open()` on a running handler is a no-op.
    pub fn open(&self) -> AppResult<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(IngestError::Stopped {
                endpoint: self.shared.endpoint.clone(),
            });
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::Release);
        if let Err(err) = self.shared.connect_with_retry() {
            self.shared.running.store(false, Ordering::Release);
            // No reader will ever publish; let the consumer see the ring as finished.
            self.shared.ring.alert();
            self.producer.lock().take();
            return Err(err);
        }

        let Some(producer) = self.producer.lock().take() else {
            return Err(IngestError::Stopped {
                endpoint: self.shared.endpoint.clone(),
            });
        };

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("rtdp-src-{}", self.shared.config.source_id))
            .spawn(move || shared.run(producer))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop reading, close the connection and join the reader thread. Idempotent.
    pub fn stop(&self) -> AppResult<()> {
        let shared = &self.shared;
        shared.stopped.store(true, Ordering::Release);
        let was_running = shared.running.swap(false, Ordering::AcqRel);
        {
            let mut state = shared.state.lock();
            if !matches!(*state, ConnectionState::Failed { .. }) {
                *state = ConnectionState::Closing;
            }
        }

        shared.signal.wake_all();
        shared.transport.close();
        shared.ring.alert();
        // Nothing will ever publish through an unopened handler.
        self.producer.lock().take();

        let handle = self.worker.lock().take();
        let joined = match handle {
            Some(handle) if handle.thread().id() != thread::current().id() => {
                handle.join().map_err(|_| IngestError::WorkerPanicked {
                    endpoint: shared.endpoint.clone(),
                })
            }
            _ => Ok(()),
        };

        {
            let mut state = shared.state.lock();
            if matches!(*state, ConnectionState::Closing) {
                *state = ConnectionState::Disconnected;
            }
        }
        if was_running {
            info!(endpoint = %shared.endpoint, "Connection handler stopped");
        }
        joined
    }
}

impl<T: Transport> Drop for ConnectionHandler<T> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(endpoint = %self.shared.endpoint, error = %err, "Handler shutdown failed");
        }
    }
}

impl<T: Transport> std::fmt::Debug for ConnectionHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("endpoint", &self.shared.endpoint)
            .field("source_id", &self.shared.config.source_id)
            .field("state", &self.state().label())
            .finish()
    }
}

impl StopSignal {
    /// Sleep for `duration` unless `running` clears first. Returns false if stopped.
    fn sleep_while(&self, running: &AtomicBool, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.lock.lock();
        while running.load(Ordering::Acquire) {
            if self.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        running.load(Ordering::Acquire)
    }

    fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.wake.notify_all();
    }
}

impl<T: Transport> Shared<T> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        // stop() owns the state once it has started.
        if !state.is_terminal() {
            *state = next;
        }
    }

    fn fail(&self, reason: String) {
        error!(endpoint = %self.endpoint, %reason, "Connection handler failed");
        self.running.store(false, Ordering::Release);
        {
            let mut state = self.state.lock();
            if !matches!(*state, ConnectionState::Closing) {
                *state = ConnectionState::Failed { reason };
            }
        }
        self.transport.close();
        self.ring.alert();
    }

    fn connect_with_retry(&self) -> AppResult<()> {
        let policy = &self.config.connect;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.set_state(ConnectionState::Connecting { attempt });

            match self.transport.connect() {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected {
                        connected_at: Instant::now(),
                    });
                    info!(endpoint = %self.endpoint, attempt, "Connected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(endpoint = %self.endpoint, attempt, error = %err, "Connect attempt failed");
                    self.stats.record_error(&err);
                    if !policy.should_retry(attempt) {
                        let failure = IngestError::ConnectFailed {
                            endpoint: self.endpoint.clone(),
                            attempts: attempt,
                            message: err.to_string(),
                        };
                        self.set_state(ConnectionState::Failed {
                            reason: failure.to_string(),
                        });
                        return Err(failure);
                    }
                    if !self
                        .signal
                        .sleep_while(&self.running, policy.delay_for_attempt(attempt + 1))
                    {
                        return Err(IngestError::Stopped {
                            endpoint: self.endpoint.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Re-establish a dropped connection. Returns false when the handler must exit.
    fn reconnect(&self, cause: &IngestError) -> bool {
        let policy = &self.config.reconnect;
        if !policy.enabled {
            self.fail(format!("connection lost and reconnect is disabled: {cause}"));
            return false;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let delay = policy.delay_for_attempt(attempt);
            info!(
                endpoint = %self.endpoint,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            if !self.signal.sleep_while(&self.running, delay) {
                return false;
            }

            self.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            self.set_state(ConnectionState::Connecting { attempt });
            match self.transport.connect() {
                Ok(()) => {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected {
                        connected_at: Instant::now(),
                    });
                    info!(endpoint = %self.endpoint, attempt, "Reconnected");
                    return true;
                }
                Err(err) => {
                    warn!(endpoint = %self.endpoint, attempt, error = %err, "Reconnect attempt failed");
                    self.stats.record_error(&err);
                    if !self.is_running() {
                        return false;
                    }
                    if !policy.should_retry(attempt) {
                        self.fail(format!(
                            "reconnect to {} failed after {attempt} attempt(s): {err}",
                            self.endpoint
                        ));
                        return false;
                    }
                }
            }
        }
    }

    /// Worker thread body.
    fn run(self: Arc<Self>, mut producer: RingProducer) {
        let span = info_span!("source", id = self.config.source_id, endpoint = %self.endpoint);
        let _enter = span.enter();
        debug!("Reader thread started");

        let mut frame = Vec::with_capacity(self.config.source.max_frame_bytes as usize);
        let mut bytes_since_update = 0u64;
        let mut last_update = Instant::now();

        while self.is_running() {
            match self.transport.read_frame(&mut frame) {
                Ok(FrameRead::Frame(len)) => {
                    match producer.publish_blocking(&frame[..len], self.config.publish_timeout) {
                        Ok(_) => {
                            self.stats.frames.fetch_add(1, Ordering::Relaxed);
                            self.stats.bytes.fetch_add(len as u64, Ordering::Relaxed);
                            bytes_since_update += len as u64;
                        }
                        Err(RingError::Closed) => break,
                        Err(RingError::Timeout(_) | RingError::Full) => {
                            let stall = IngestError::ChannelStall {
                                timeout_ms: self.config.publish_timeout.as_millis() as u64,
                            };
                            self.stats.record_error(&stall);
                            self.fail(stall.to_string());
                            break;
                        }
                    }
                }
                Ok(FrameRead::Idle) => {
                    self.stats.read_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    if !self.is_running() {
                        break;
                    }
                    if !err.is_reconnectable() {
                        self.stats.record_error(&err);
                        self.fail(err.to_string());
                        break;
                    }
                    if let IngestError::Desync { length, max } = err {
                        self.stats.desyncs.fetch_add(1, Ordering::Relaxed);
                        warn!(length, max, "Invalid frame length, resynchronizing by reconnect");
                    } else {
                        warn!(error = %err, "Connection lost");
                    }
                    self.stats.record_error(&err);
                    self.transport.close();
                    self.set_state(ConnectionState::Disconnected);
                    if !self.reconnect(&err) {
                        break;
                    }
                }
            }

            if last_update.elapsed() >= self.config.monitor_interval {
                self.monitor.update(bytes_since_update);
                bytes_since_update = 0;
                last_update = Instant::now();
                debug!(status = %self.monitor.snapshot(), "Ring status");
            }
        }

        self.monitor.update(bytes_since_update);
        self.transport.close();
        debug!("Reader thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Transport driven by scripted connect and read outcomes.
    #[derive(Default)]
    struct ScriptedTransport {
        connects: Mutex<VecDeque<bool>>,
        reads: Mutex<VecDeque<AppResult<Vec<u8>>>>,
        connect_calls: AtomicU64,
        connected: AtomicBool,
    }

    impl ScriptedTransport {
        fn new(connects: Vec<bool>, reads: Vec<AppResult<Vec<u8>>>) -> Self {
            Self {
                connects: Mutex::new(connects.into()),
                reads: Mutex::new(reads.into()),
                ..Default::default()
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn endpoint(&self) -> String {
            "scripted:0".into()
        }

        fn connect(&self) -> AppResult<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.connects.lock().pop_front().unwrap_or(false) {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused).into())
            }
        }

        fn read_frame(&self, buf: &mut Vec<u8>) -> AppResult<FrameRead> {
            match self.reads.lock().pop_front() {
                Some(Ok(bytes)) => {
                    buf.clear();
                    buf.extend_from_slice(&bytes);
                    Ok(FrameRead::Frame(bytes.len()))
                }
                Some(Err(err)) => Err(err),
                None => {
                    thread::sleep(Duration::from_millis(5));
                    Ok(FrameRead::Idle)
                }
            }
        }

        fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn config(connect: RetryPolicy, reconnect: RetryPolicy) -> HandlerConfig {
        HandlerConfig::new(SourceConfig::default(), 7)
            .with_connect(connect)
            .with_reconnect(reconnect)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_open_publishes_frames_in_order() {
        let transport = ScriptedTransport::new(
            vec![true],
            vec![Ok(b"one".to_vec()), Ok(b"two".to_vec())],
        );
        let (handler, mut consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::default(), RetryPolicy::default()),
        );
        handler.open().unwrap();
        assert!(handler.is_connected());

        let first = consumer.next_event(Duration::from_secs(2)).unwrap();
        let second = consumer.next_event(Duration::from_secs(2)).unwrap();
        assert_eq!(&first.payload[..], b"one");
        assert_eq!(&second.payload[..], b"two");
        assert_eq!(first.source_id, 7);

        handler.stop().unwrap();
        assert_eq!(handler.state(), ConnectionState::Disconnected);
        assert_eq!(handler.stats().frames, 2);
    }

    #[test]
    fn test_connect_retries_then_fails() {
        let transport = ScriptedTransport::new(vec![false, false, false], vec![]);
        let (handler, _consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::fixed(3, Duration::from_millis(1)), RetryPolicy::default()),
        );
        let err = handler.open().unwrap_err();
        assert!(matches!(err, IngestError::ConnectFailed { attempts: 3, .. }));
        assert_eq!(handler.shared.transport.connect_calls.load(Ordering::SeqCst), 3);
        assert!(matches!(handler.state(), ConnectionState::Failed { .. }));
    }

    #[test]
    fn test_failed_open_closes_ring() {
        let transport = ScriptedTransport::new(vec![false], vec![]);
        let (handler, mut consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::fixed(1, Duration::from_millis(1)), RetryPolicy::default()),
        );
        assert!(handler.open().is_err());
        assert!(consumer.channel().is_alerted());
        assert!(consumer.is_drained());
        assert!(consumer.next_event(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_stop_during_connect_retry_reports_stopped() {
        let transport = ScriptedTransport::new(vec![false, false, false], vec![]);
        let (handler, _consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::fixed(3, Duration::from_secs(30)), RetryPolicy::default()),
        );

        thread::scope(|scope| {
            let opener = scope.spawn(|| handler.open());
            assert!(wait_for(|| {
                handler.shared.transport.connect_calls.load(Ordering::SeqCst) == 1
            }));

            let started = Instant::now();
            handler.stop().unwrap();
            let result = opener.join().unwrap();
            assert!(matches!(result, Err(IngestError::Stopped { .. })));
            assert!(started.elapsed() < Duration::from_secs(5));
        });

        assert_eq!(handler.shared.transport.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_succeeds_on_retry() {
        let transport = ScriptedTransport::new(vec![false, true], vec![]);
        let (handler, _consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::fixed(3, Duration::from_millis(1)), RetryPolicy::default()),
        );
        handler.open().unwrap();
        assert!(handler.is_connected());
        handler.stop().unwrap();
    }

    #[test]
    fn test_desync_triggers_reconnect() {
        let transport = ScriptedTransport::new(
            vec![true, true],
            vec![
                Ok(b"before".to_vec()),
                Err(IngestError::Desync { length: -1, max: 65536 }),
                Ok(b"after".to_vec()),
            ],
        );
        let (handler, mut consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::default(), RetryPolicy::fixed(3, Duration::from_millis(1))),
        );
        handler.open().unwrap();

        assert_eq!(&consumer.next_event(Duration::from_secs(2)).unwrap().payload[..], b"before");
        assert_eq!(&consumer.next_event(Duration::from_secs(2)).unwrap().payload[..], b"after");

        let stats = handler.stats();
        assert_eq!(stats.desyncs, 1);
        assert_eq!(stats.reconnects, 1);
        assert!(handler.is_connected());
        handler.stop().unwrap();
    }

    #[test]
    fn test_reconnect_bound_enters_failed() {
        let delay = Duration::from_millis(20);
        let transport = ScriptedTransport::new(
            vec![true, false, false, false, true],
            vec![Err(io::Error::from(io::ErrorKind::ConnectionReset).into())],
        );
        let (handler, mut consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::default(), RetryPolicy::fixed(3, delay)),
        );

        let started = Instant::now();
        handler.open().unwrap();
        assert!(wait_for(|| matches!(handler.state(), ConnectionState::Failed { .. })));
        assert!(started.elapsed() >= delay * 3);

        let stats = handler.stats();
        assert_eq!(stats.reconnect_attempts, 3);
        assert_eq!(stats.reconnects, 0);
        // One initial connect plus exactly three reconnect attempts.
        assert_eq!(handler.shared.transport.connect_calls.load(Ordering::SeqCst), 4);
        assert!(consumer.next_event(Duration::from_millis(10)).is_none());
        assert!(consumer.is_drained());

        handler.stop().unwrap();
        assert!(matches!(handler.state(), ConnectionState::Failed { .. }));
    }

    #[test]
    fn test_channel_stall_is_fatal() {
        let mut source = SourceConfig::default();
        source.ring_capacity = 1;
        let transport = ScriptedTransport::new(
            vec![true],
            vec![Ok(b"a".to_vec()), Ok(b"b".to_vec())],
        );
        let (handler, _consumer) = ConnectionHandler::new(
            transport,
            HandlerConfig::new(source, 0).with_publish_timeout(Duration::from_millis(20)),
        );
        handler.open().unwrap();

        assert!(wait_for(|| matches!(handler.state(), ConnectionState::Failed { .. })));
        let reason = handler.state().failure_reason().map(str::to_owned).unwrap();
        assert!(reason.contains("stalled"));
    }

    #[test]
    fn test_non_transport_read_error_fails_without_reconnect() {
        let transport = ScriptedTransport::new(vec![true, true], vec![Err(IngestError::NotOpen)]);
        let (handler, _consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::default(), RetryPolicy::fixed(3, Duration::from_millis(1))),
        );
        handler.open().unwrap();

        assert!(wait_for(|| matches!(handler.state(), ConnectionState::Failed { .. })));
        assert_eq!(handler.stats().reconnect_attempts, 0);
        assert_eq!(handler.shared.transport.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_blocks_reopen() {
        let transport = ScriptedTransport::new(vec![true], vec![]);
        let (handler, _consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::default(), RetryPolicy::default()),
        );
        handler.open().unwrap();
        handler.stop().unwrap();
        handler.stop().unwrap();
        assert!(matches!(handler.open(), Err(IngestError::Stopped { .. })));
    }

    #[test]
    fn test_stop_interrupts_reconnect_sleep() {
        let transport = ScriptedTransport::new(
            vec![true],
            vec![Err(io::Error::from(io::ErrorKind::BrokenPipe).into())],
        );
        let (handler, _consumer) = ConnectionHandler::new(
            transport,
            config(RetryPolicy::default(), RetryPolicy::fixed(3, Duration::from_secs(30))),
        );
        handler.open().unwrap();
        assert!(wait_for(|| !handler.is_connected()));

        let started = Instant::now();
        handler.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
