//! Bounded single-producer/single-consumer event ring.
//!
//! A [`RingChannel`] is a fixed array of reusable [`EventSlot`]s addressed by two monotonically
//! increasing sequence counters. It decouples a network reader thread (the producer) from the
//! thread that decodes events (the consumer).
//!
//! # Features
//! - Power-of-two capacity, slot index = `sequence & (capacity - 1)`
//! - Slot payload buffers are reused in place; their capacity survives across laps
//! - Claim-then-commit publishing: the cursor advances only after the copy is complete
//! - Backpressure: a full ring never overwrites, the producer waits or gets `Full`
//! - Alerting: wakes every waiter and refuses further publishes
//!
//! # Architecture
//!
//! ```text
//!  consumer_sequence            publish_cursor
//!        │                            │
//!  ┌─────▼────┬──────────┬────────────▼─┬──────────┐
//!  │ slot n   │ slot n+1 │ ...          │ free     │
//!  └──────────┴──────────┴──────────────┴──────────┘
//! ```
//!
//! Invariants: `consumer_sequence <= publish_cursor` and
//! `publish_cursor - consumer_sequence <= capacity`.
//!
//! # Thread Safety
//!
//! - **Roles**: [`channel`] returns one [`RingProducer`] and one [`RingConsumer`]. Neither is
//!   `Clone` and both take `&mut self` to advance their cursor, so a second producer or consumer
//!   cannot exist.
//! - **Cursors**: `AtomicU64` with Release stores after a slot is written/read and Acquire
//!   loads before it is read/reused.
//! - **Waiting**: a mutex/condvar pair per direction. Publishers notify under the signal lock so
//!   a consumer that checked the cursor and then waits cannot miss the wakeup. The alert flag is
//!   re-checked after every wakeup.

pub mod monitor;

pub use monitor::{MonitorSnapshot, RingBufferMonitor};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Largest slot count a ring is created with; larger requests are clamped.
pub const MAX_CAPACITY: usize = 1 << 20;

/// Publish/consume failures of a ring channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Every slot holds an unconsumed event (non-blocking publish only).
    #[error("Ring channel full")]
    Full,

    /// The consumer did not free a slot before the publish timeout.
    #[error("Timed out after {0:?} waiting for ring space")]
    Timeout(Duration),

    /// The channel was alerted; no further events are accepted.
    #[error("Ring channel closed")]
    Closed,
}

/// A reusable event slot owned by the ring.
#[derive(Debug, Default)]
pub struct EventSlot {
    payload: Vec<u8>,
    length: u32,
    source_id: u32,
}

impl EventSlot {
    /// Valid bytes of the current event.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.length as usize]
    }

    /// Length of the current event in bytes.
    pub fn len(&self) -> u32 {
        self.length
    }

    /// Whether the current event carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Identifier of the source that produced the event.
    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    /// Allocated payload capacity retained by this slot.
    pub fn retained_capacity(&self) -> usize {
        self.payload.capacity()
    }

    fn fill(&mut self, bytes: &[u8], source_id: u32) {
        self.payload.clear();
        self.payload.extend_from_slice(bytes);
        self.length = bytes.len() as u32;
        self.source_id = source_id;
    }
}

/// An event copied out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Producing source.
    pub source_id: u32,
    /// Position of the event in its channel (0-based, gap-free).
    pub sequence: u64,
    /// Frame bytes.
    pub payload: Bytes,
}

/// Receipt for a committed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    /// Sequence number assigned to the event.
    pub sequence: u64,
    /// Slot index the event was written to.
    pub index: usize,
}

/// Wake-up shared by several rings so one consumer can wait on all of them.
///
/// Every attached ring bumps the epoch on publish, alert and producer drop.
#[derive(Debug, Default)]
pub struct ReadySignal {
    epoch: Mutex<u64>,
    changed: Condvar,
}

impl ReadySignal {
    /// Create a signal with no rings attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current epoch. Read it before checking the rings, then pass it to [`wait_past`](Self::wait_past).
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Wake every waiter.
    pub fn notify(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Wait up to `timeout` for the epoch to move past `seen`. Returns false on timeout.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            if self.changed.wait_until(&mut epoch, deadline).timed_out() {
                return *epoch != seen;
            }
        }
        true
    }
}

/// Shared state of one ring.
pub struct RingChannel {
    slots: Box<[Mutex<EventSlot>]>,
    mask: u64,
    source_id: u32,
    publish_cursor: AtomicU64,
    consumer_sequence: AtomicU64,
    published_bytes: AtomicU64,
    alerted: AtomicBool,
    producer_closed: AtomicBool,
    signal: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
    listener: Mutex<Option<Arc<ReadySignal>>>,
}

/// Create a ring with at least `capacity` slots for source 0.
pub fn channel(capacity: usize) -> (RingProducer, RingConsumer) {
    RingChannel::with_capacity(capacity, 0)
}

impl RingChannel {
    /// Create a ring for `source_id` with `capacity` rounded up to a power of two, at most
    /// [`MAX_CAPACITY`].
    pub fn with_capacity(capacity: usize, source_id: u32) -> (RingProducer, RingConsumer) {
        let capacity = capacity
            .max(1)
            .checked_next_power_of_two()
            .map_or(MAX_CAPACITY, |rounded| rounded.min(MAX_CAPACITY));
        let slots = (0..capacity)
            .map(|_| Mutex::new(EventSlot::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shared = Arc::new(Self {
            slots,
            mask: capacity as u64 - 1,
            source_id,
            publish_cursor: AtomicU64::new(0),
            consumer_sequence: AtomicU64::new(0),
            published_bytes: AtomicU64::new(0),
            alerted: AtomicBool::new(false),
            producer_closed: AtomicBool::new(false),
            signal: Mutex::new(()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            listener: Mutex::new(None),
        });

        (
            RingProducer {
                shared: Arc::clone(&shared),
            },
            RingConsumer { shared },
        )
    }

    /// Number of slots (always a power of two).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Source identifier stamped on every event.
    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    /// Total events published.
    pub fn publish_cursor(&self) -> u64 {
        self.publish_cursor.load(Ordering::Acquire)
    }

    /// Total events consumed.
    pub fn consumer_sequence(&self) -> u64 {
        self.consumer_sequence.load(Ordering::Acquire)
    }

    /// Total payload bytes published.
    pub fn published_bytes(&self) -> u64 {
        self.published_bytes.load(Ordering::Acquire)
    }

    /// Published but not yet consumed events.
    pub fn used(&self) -> usize {
        let consumed = self.consumer_sequence();
        let published = self.publish_cursor();
        (published.saturating_sub(consumed) as usize).min(self.capacity())
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Wake every waiter and refuse further publishes. Already published events stay readable.
    pub fn alert(&self) {
        self.alerted.store(true, Ordering::Release);
        {
            let _guard = self.signal.lock();
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
        self.notify_listener();
    }

    /// Also notify `signal` whenever this ring gains an event or closes.
    pub fn attach(&self, signal: Arc<ReadySignal>) {
        *self.listener.lock() = Some(signal);
        // A ring that is already readable must not be missed by the new listener.
        self.notify_listener();
    }

    fn notify_listener(&self) {
        if let Some(signal) = self.listener.lock().as_ref() {
            signal.notify();
        }
    }

    /// Whether [`alert`](Self::alert) has been called.
    pub fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::Acquire)
    }

    /// Whether no more events can arrive (alerted, or the producer was dropped).
    pub fn is_closed(&self) -> bool {
        self.is_alerted() || self.producer_closed.load(Ordering::Acquire)
    }

    fn notify(&self, condvar: &Condvar) {
        let _guard = self.signal.lock();
        condvar.notify_one();
    }
}

impl std::fmt::Debug for RingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingChannel")
            .field("capacity", &self.capacity())
            .field("source_id", &self.source_id)
            .field("publish_cursor", &self.publish_cursor())
            .field("consumer_sequence", &self.consumer_sequence())
            .field("alerted", &self.is_alerted())
            .finish()
    }
}

/// Publishing half of a ring.
#[derive(Debug)]
pub struct RingProducer {
    shared: Arc<RingChannel>,
}

impl RingProducer {
    /// Shared ring state (for monitoring and alerting).
    pub fn channel(&self) -> &Arc<RingChannel> {
        &self.shared
    }

    /// Publish without waiting. Returns [`RingError::Full`] when every slot is occupied.
    pub fn try_publish(&mut self, bytes: &[u8]) -> Result<SlotHandle, RingError> {
        let ring = &*self.shared;
        if ring.is_alerted() {
            return Err(RingError::Closed);
        }

        // Only this producer moves the publish cursor.
        let sequence = ring.publish_cursor.load(Ordering::Relaxed);
        let consumed = ring.consumer_sequence.load(Ordering::Acquire);
        if sequence - consumed >= ring.capacity() as u64 {
            return Err(RingError::Full);
        }

        let index = (sequence & ring.mask) as usize;
        ring.slots[index].lock().fill(bytes, ring.source_id);
        ring.published_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        ring.publish_cursor.store(sequence + 1, Ordering::Release);
        ring.notify(&ring.not_empty);
        ring.notify_listener();

        Ok(SlotHandle { sequence, index })
    }

    /// Publish, waiting up to `timeout` for the consumer to free a slot.
    pub fn publish_blocking(
        &mut self,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<SlotHandle, RingError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_publish(bytes) {
                Err(RingError::Full) => {}
                other => return other,
            }

            let ring = &*self.shared;
            let mut guard = ring.signal.lock();
            // Re-check under the lock; the consumer notifies while holding it.
            if ring.is_alerted() {
                return Err(RingError::Closed);
            }
            let consumed = ring.consumer_sequence.load(Ordering::Acquire);
            let published = ring.publish_cursor.load(Ordering::Relaxed);
            if published - consumed < ring.capacity() as u64 {
                continue;
            }
            if ring.not_full.wait_until(&mut guard, deadline).timed_out() {
                drop(guard);
                // One last attempt so a slot freed right at the deadline is not lost.
                return match self.try_publish(bytes) {
                    Err(RingError::Full) => Err(RingError::Timeout(timeout)),
                    other => other,
                };
            }
        }
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.shared.producer_closed.store(true, Ordering::Release);
        {
            let _guard = self.shared.signal.lock();
            self.shared.not_empty.notify_all();
        }
        self.shared.notify_listener();
    }
}

/// Consuming half of a ring.
#[derive(Debug)]
pub struct RingConsumer {
    shared: Arc<RingChannel>,
}

impl RingConsumer {
    /// Shared ring state (for monitoring and alerting).
    pub fn channel(&self) -> &Arc<RingChannel> {
        &self.shared
    }

    /// Whether an event is ready right now.
    pub fn has_event(&self) -> bool {
        self.shared.consumer_sequence.load(Ordering::Relaxed) < self.shared.publish_cursor()
    }

    /// Whether the ring is closed and every published event has been consumed.
    pub fn is_drained(&self) -> bool {
        self.shared.is_closed() && !self.has_event()
    }

    /// Next event, waiting up to `timeout`. `None` means no event arrived (idle, not an error).
    pub fn next_event(&mut self, timeout: Duration) -> Option<Event> {
        self.read_next(timeout, |sequence, slot| Event {
            source_id: slot.source_id(),
            sequence,
            payload: Bytes::copy_from_slice(slot.payload()),
        })
    }

    /// Next event without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        self.next_event(Duration::ZERO)
    }

    /// Run `f` on the next slot in place, then release the slot to the producer.
    pub fn read_next<R>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(u64, &EventSlot) -> R,
    ) -> Option<R> {
        if !self.wait_ready(timeout) {
            return None;
        }

        let ring = &*self.shared;
        let sequence = ring.consumer_sequence.load(Ordering::Relaxed);
        let index = (sequence & ring.mask) as usize;
        let result = f(sequence, &ring.slots[index].lock());
        ring.consumer_sequence.store(sequence + 1, Ordering::Release);
        ring.notify(&ring.not_full);
        Some(result)
    }

    /// Wait up to `timeout` for an event without consuming it.
    ///
    /// Returns false on timeout, or at once if the ring is closed and empty.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        if self.has_event() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let ring = &*self.shared;
        let deadline = Instant::now() + timeout;
        let mut guard = ring.signal.lock();
        loop {
            if self.has_event() {
                return true;
            }
            if ring.is_closed() {
                return false;
            }
            if ring.not_empty.wait_until(&mut guard, deadline).timed_out() {
                return self.has_event();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        let (producer, _consumer) = channel(1000);
        assert_eq!(producer.channel().capacity(), 1024);
        let (producer, _consumer) = channel(0);
        assert_eq!(producer.channel().capacity(), 1);
        let (producer, _consumer) = channel(8);
        assert_eq!(producer.channel().capacity(), 8);
    }

    #[test]
    fn test_ready_signal_wakes_on_publish_from_any_ring() {
        let signal = Arc::new(ReadySignal::new());
        let (_quiet, quiet_consumer) = channel(4);
        let (mut busy, busy_consumer) = channel(4);
        quiet_consumer.channel().attach(Arc::clone(&signal));
        busy_consumer.channel().attach(Arc::clone(&signal));

        let seen = signal.epoch();
        assert!(!signal.wait_past(seen, SHORT));

        let writer = thread::spawn(move || {
            thread::sleep(SHORT);
            busy.try_publish(b"go").unwrap();
            busy
        });
        assert!(signal.wait_past(seen, Duration::from_secs(2)));
        assert!(busy_consumer.has_event());
        let busy = writer.join().unwrap();

        let seen = signal.epoch();
        drop(busy);
        assert!(signal.wait_past(seen, SHORT));
    }

    #[test]
    fn test_capacity_is_clamped() {
        let (producer, _consumer) = channel(MAX_CAPACITY + 1);
        assert_eq!(producer.channel().capacity(), MAX_CAPACITY);
        let (producer, _consumer) = channel(usize::MAX);
        assert_eq!(producer.channel().capacity(), MAX_CAPACITY);
    }

    #[test]
    fn test_fifo_order() {
        let (mut producer, mut consumer) = RingChannel::with_capacity(8, 3);
        for i in 0..8u8 {
            producer.try_publish(&[i; 4]).unwrap();
        }
        for i in 0..8u8 {
            let event = consumer.next_event(SHORT).unwrap();
            assert_eq!(event.sequence, i as u64);
            assert_eq!(event.source_id, 3);
            assert_eq!(&event.payload[..], &[i; 4]);
        }
        assert!(consumer.next_event(SHORT).is_none());
    }

    #[test]
    fn test_full_ring_rejects_without_overwriting() {
        let (mut producer, mut consumer) = channel(2);
        producer.try_publish(b"a").unwrap();
        producer.try_publish(b"b").unwrap();
        assert_eq!(producer.try_publish(b"c"), Err(RingError::Full));
        assert_eq!(producer.channel().used(), 2);

        assert_eq!(&consumer.try_next().unwrap().payload[..], b"a");
        producer.try_publish(b"c").unwrap();
        assert_eq!(&consumer.try_next().unwrap().payload[..], b"b");
        assert_eq!(&consumer.try_next().unwrap().payload[..], b"c");
    }

    #[test]
    fn test_publish_blocking_times_out_when_full() {
        let (mut producer, _consumer) = channel(1);
        producer.try_publish(b"x").unwrap();
        let started = Instant::now();
        let result = producer.publish_blocking(b"y", Duration::from_millis(50));
        assert_eq!(result, Err(RingError::Timeout(Duration::from_millis(50))));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_publish_blocking_waits_for_consumer() {
        let (mut producer, mut consumer) = channel(1);
        producer.try_publish(b"first").unwrap();

        let reader = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let first = consumer.next_event(SHORT).unwrap();
            let second = consumer.next_event(Duration::from_secs(2)).unwrap();
            (first, second)
        });

        let handle = producer
            .publish_blocking(b"second", Duration::from_secs(2))
            .unwrap();
        assert_eq!(handle.sequence, 1);

        let (first, second) = reader.join().unwrap();
        assert_eq!(&first.payload[..], b"first");
        assert_eq!(&second.payload[..], b"second");
    }

    #[test]
    fn test_next_event_returns_none_on_timeout() {
        let (_producer, mut consumer) = channel(4);
        let started = Instant::now();
        assert!(consumer.next_event(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_alert_wakes_waiting_consumer() {
        let (producer, mut consumer) = channel(4);
        let ring = Arc::clone(producer.channel());

        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let event = consumer.next_event(Duration::from_secs(10));
            (event, started.elapsed())
        });

        thread::sleep(Duration::from_millis(30));
        ring.alert();
        let (event, waited) = waiter.join().unwrap();
        assert!(event.is_none());
        assert!(waited < Duration::from_secs(5));
        drop(producer);
    }

    #[test]
    fn test_alert_rejects_publish_but_keeps_buffered_events() {
        let (mut producer, mut consumer) = channel(4);
        producer.try_publish(b"kept").unwrap();
        producer.channel().alert();

        assert_eq!(producer.try_publish(b"late"), Err(RingError::Closed));
        assert_eq!(&consumer.try_next().unwrap().payload[..], b"kept");
        assert!(consumer.is_drained());
    }

    #[test]
    fn test_dropped_producer_drains_then_ends() {
        let (mut producer, mut consumer) = channel(4);
        producer.try_publish(b"last").unwrap();
        drop(producer);

        assert!(consumer.next_event(SHORT).is_some());
        let started = Instant::now();
        assert!(consumer.next_event(Duration::from_secs(5)).is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(consumer.is_drained());
    }

    #[test]
    fn test_slots_retain_capacity_across_laps() {
        let (mut producer, mut consumer) = channel(1);
        producer.try_publish(&[0u8; 4096]).unwrap();
        consumer.try_next().unwrap();
        producer.try_publish(b"tiny").unwrap();

        let capacity = consumer
            .read_next(SHORT, |_, slot| {
                assert_eq!(slot.payload(), b"tiny");
                slot.retained_capacity()
            })
            .unwrap();
        assert!(capacity >= 4096);
    }

    #[test]
    fn test_concurrent_producer_consumer_preserves_order() {
        const COUNT: u32 = 10_000;
        let (mut producer, mut consumer) = channel(16);

        let writer = thread::spawn(move || {
            for i in 0..COUNT {
                producer
                    .publish_blocking(&i.to_le_bytes(), Duration::from_secs(5))
                    .unwrap();
            }
        });

        for expected in 0..COUNT {
            let event = consumer.next_event(Duration::from_secs(5)).unwrap();
            let value = u32::from_le_bytes(event.payload[..4].try_into().unwrap());
            assert_eq!(value, expected);
        }
        writer.join().unwrap();
        assert!(consumer.is_drained());
    }
}
