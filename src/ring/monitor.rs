//! Fill level, lag and throughput of a ring channel.
//!
//! The monitor only reads published cursor values, so it can be sampled from any thread while
//! the producer and consumer are running.

use super::RingChannel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Point-in-time view of a ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    /// Number of slots.
    pub capacity: usize,
    /// Published but unconsumed events.
    pub used_slots: usize,
    /// Free slots.
    pub available_slots: usize,
    /// `used_slots / capacity * 100`.
    pub fill_pct: f64,
    /// Events the consumer is behind the producer (equal to `used_slots`).
    pub consumer_lag: u64,
    /// Events published since creation.
    pub total_published: u64,
    /// Events consumed since creation.
    pub total_consumed: u64,
    /// Bytes reported through [`RingBufferMonitor::update`].
    pub total_bytes: u64,
    /// Events published per second over the last update window.
    pub publish_rate_events_per_sec: f64,
    /// Bytes published per second over the last update window.
    pub publish_rate_bytes_per_sec: f64,
    /// Events consumed per second over the last update window.
    pub consume_rate_events_per_sec: f64,
}

impl fmt::Display for MonitorSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RingBuffer[used={}/{} ({:.1}%), lag={}, published={}, consumed={}, bytes={}, \
             rate={:.1} ev/s {:.1} B/s]",
            self.used_slots,
            self.capacity,
            self.fill_pct,
            self.consumer_lag,
            self.total_published,
            self.total_consumed,
            self.total_bytes,
            self.publish_rate_events_per_sec,
            self.publish_rate_bytes_per_sec,
        )
    }
}

#[derive(Debug)]
struct RateWindow {
    last_update: Instant,
    last_published: u64,
    last_consumed: u64,
    last_channel_bytes: u64,
    total_bytes: u64,
    publish_rate_events: f64,
    publish_rate_bytes: f64,
    consume_rate_events: f64,
}

/// Throughput monitor bound to one ring.
#[derive(Debug)]
pub struct RingBufferMonitor {
    channel: Arc<RingChannel>,
    window: Mutex<RateWindow>,
}

impl RingBufferMonitor {
    /// Start monitoring `channel`; the first rate window starts now.
    pub fn new(channel: Arc<RingChannel>) -> Self {
        let window = RateWindow {
            last_update: Instant::now(),
            last_published: channel.publish_cursor(),
            last_consumed: channel.consumer_sequence(),
            last_channel_bytes: channel.published_bytes(),
            total_bytes: 0,
            publish_rate_events: 0.0,
            publish_rate_bytes: 0.0,
            consume_rate_events: 0.0,
        };
        Self {
            channel,
            window: Mutex::new(window),
        }
    }

    /// The monitored ring.
    pub fn channel(&self) -> &Arc<RingChannel> {
        &self.channel
    }

    /// Close the current rate window, adding `bytes_since_last` to the byte total.
    ///
    /// Rates are `Δtotal / Δwallclock` since the previous update. An update with no elapsed
    /// time keeps the previous rates.
    pub fn update(&self, bytes_since_last: u64) {
        let now = Instant::now();
        let published = self.channel.publish_cursor();
        let consumed = self.channel.consumer_sequence();

        let mut w = self.window.lock();
        w.total_bytes += bytes_since_last;

        let elapsed = now.duration_since(w.last_update).as_secs_f64();
        if elapsed > 0.0 {
            w.publish_rate_events = published.saturating_sub(w.last_published) as f64 / elapsed;
            w.publish_rate_bytes = bytes_since_last as f64 / elapsed;
            w.consume_rate_events = consumed.saturating_sub(w.last_consumed) as f64 / elapsed;
        }

        w.last_update = now;
        w.last_published = published;
        w.last_consumed = consumed;
    }

    /// [`update`](Self::update) using the ring's own published-bytes counter.
    ///
    /// For rings fed in-process, where no connection handler reports byte counts.
    pub fn refresh(&self) {
        let bytes = self.channel.published_bytes();
        let delta = {
            let mut w = self.window.lock();
            let delta = bytes.saturating_sub(w.last_channel_bytes);
            w.last_channel_bytes = bytes;
            delta
        };
        self.update(delta);
    }

    /// Current fill level, lag and the rates of the last closed window.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let capacity = self.channel.capacity();
        let total_consumed = self.channel.consumer_sequence();
        let total_published = self.channel.publish_cursor();
        let used = (total_published.saturating_sub(total_consumed) as usize).min(capacity);
        let w = self.window.lock();

        MonitorSnapshot {
            capacity,
            used_slots: used,
            available_slots: capacity - used,
            fill_pct: used as f64 / capacity as f64 * 100.0,
            consumer_lag: used as u64,
            total_published,
            total_consumed,
            total_bytes: w.total_bytes,
            publish_rate_events_per_sec: w.publish_rate_events,
            publish_rate_bytes_per_sec: w.publish_rate_bytes,
            consume_rate_events_per_sec: w.consume_rate_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::channel;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fill_level_and_lag() {
        let (mut producer, mut consumer) = channel(8);
        let monitor = RingBufferMonitor::new(Arc::clone(producer.channel()));

        for _ in 0..6 {
            producer.try_publish(b"abcd").unwrap();
        }
        consumer.try_next().unwrap();
        consumer.try_next().unwrap();

        let snap = monitor.snapshot();
        assert_eq!(snap.capacity, 8);
        assert_eq!(snap.used_slots, 4);
        assert_eq!(snap.available_slots, 4);
        assert_eq!(snap.consumer_lag, 4);
        assert!((snap.fill_pct - 50.0).abs() < f64::EPSILON);
        assert_eq!(snap.total_published, 6);
        assert_eq!(snap.total_consumed, 2);
    }

    #[test]
    fn test_update_computes_rates() {
        let (mut producer, _consumer) = channel(64);
        let monitor = RingBufferMonitor::new(Arc::clone(producer.channel()));

        thread::sleep(Duration::from_millis(20));
        for _ in 0..10 {
            producer.try_publish(&[0u8; 100]).unwrap();
        }
        monitor.update(1000);

        let snap = monitor.snapshot();
        assert_eq!(snap.total_bytes, 1000);
        assert!(snap.publish_rate_events_per_sec > 0.0);
        // At least 20 ms elapsed, so at most 10 / 0.02 events per second.
        assert!(snap.publish_rate_events_per_sec <= 500.0 + 1e-6);
        assert!(snap.publish_rate_bytes_per_sec <= 50_000.0 + 1e-6);
        assert_eq!(snap.consume_rate_events_per_sec, 0.0);
    }

    #[test]
    fn test_refresh_uses_channel_byte_counter() {
        let (mut producer, _consumer) = channel(4);
        let monitor = RingBufferMonitor::new(Arc::clone(producer.channel()));
        producer.try_publish(&[1u8; 7]).unwrap();
        monitor.refresh();
        producer.try_publish(&[1u8; 3]).unwrap();
        monitor.refresh();
        assert_eq!(monitor.snapshot().total_bytes, 10);
    }

    #[test]
    fn test_display_contains_fill_and_lag() {
        let (mut producer, _consumer) = channel(4);
        let monitor = RingBufferMonitor::new(Arc::clone(producer.channel()));
        producer.try_publish(b"x").unwrap();
        let text = monitor.snapshot().to_string();
        assert!(text.contains("used=1/4 (25.0%)"));
        assert!(text.contains("lag=1"));
    }
}
