//! Per-channel waveform analysis of SAMPA frames.
//!
//! For a channel with samples `s[0..N]` and a baseline window of `k = min(10, N)` samples:
//!
//! - `baseline` = mean of `s[0..k]` (0 for an empty channel)
//! - `peak_index` = first index maximising `s[i] - baseline`
//! - `amplitude` = `s[peak_index] - baseline`, `peak_time` = `peak_index`
//! - `integral` = `Σ max(0, s[i] - baseline)`
//! - `noise` = sample standard deviation (n − 1) of `s[0..k]`, 0 when `k <= 1`
//! - `snr` = `amplitude / noise` when `noise > 0`, else 0

use crate::codec::sampa::{SampaChannel, SampaFrame};
use crate::codec::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Default number of leading samples used for baseline and noise.
pub const BASELINE_SAMPLES: usize = 10;

/// Serialized size of one [`ChannelResult`].
pub const CHANNEL_RESULT_LEN: usize = 4 + 4 + 5 * 8;

const PROCESSED_HEADER_LEN: usize = 4 + 8 + 4;

/// Raw statistics of one waveform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    /// Mean of the baseline window.
    pub baseline: f64,
    /// Index of the (first) maximum above baseline.
    pub peak_index: usize,
    /// Peak height above baseline.
    pub amplitude: f64,
    /// Sum of the positive excursions above baseline.
    pub integral: f64,
    /// Standard deviation of the baseline window.
    pub noise: f64,
    /// `amplitude / noise`, or 0 without noise.
    pub snr: f64,
}

/// Analysis result for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelResult {
    /// Channel number.
    pub channel_id: i32,
    /// Front-end card.
    pub fee_id: i32,
    /// Baseline level.
    pub baseline: f64,
    /// Peak height above baseline.
    pub amplitude: f64,
    /// Peak position in samples.
    pub peak_time: f64,
    /// Positive area above baseline.
    pub integral: f64,
    /// Signal-to-noise ratio.
    pub snr: f64,
}

/// Analysis results for a whole frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedFrame {
    /// Frame counter of the source frame.
    pub frame_id: i32,
    /// Timestamp of the source frame.
    pub timestamp: i64,
    /// One result per channel, in readout order.
    pub results: Vec<ChannelResult>,
}

/// Computes [`SignalStats`] with a configurable baseline window.
#[derive(Debug, Clone, Copy)]
pub struct ChannelAnalyzer {
    baseline_samples: usize,
}

impl Default for ChannelAnalyzer {
    fn default() -> Self {
        Self {
            baseline_samples: BASELINE_SAMPLES,
        }
    }
}

impl ChannelAnalyzer {
    /// Analyzer using the first `baseline_samples` samples (at least one) as the baseline window.
    pub fn new(baseline_samples: usize) -> Self {
        Self {
            baseline_samples: baseline_samples.max(1),
        }
    }

    /// Statistics of one waveform.
    pub fn analyze(&self, samples: &[i32]) -> SignalStats {
        if samples.is_empty() {
            return SignalStats::default();
        }

        let window = &samples[..self.baseline_samples.min(samples.len())];
        let k = window.len() as f64;
        let baseline = window.iter().map(|&s| f64::from(s)).sum::<f64>() / k;

        let mut peak_index = 0;
        let mut peak = f64::from(samples[0]) - baseline;
        let mut integral = 0.0;
        for (i, &sample) in samples.iter().enumerate() {
            let above = f64::from(sample) - baseline;
            if above > peak {
                peak = above;
                peak_index = i;
            }
            if above > 0.0 {
                integral += above;
            }
        }

        let noise = if window.len() > 1 {
            let variance = window
                .iter()
                .map(|&s| (f64::from(s) - baseline).powi(2))
                .sum::<f64>()
                / (k - 1.0);
            variance.sqrt()
        } else {
            0.0
        };

        SignalStats {
            baseline,
            peak_index,
            amplitude: peak,
            integral,
            noise,
            snr: if noise > 0.0 { peak / noise } else { 0.0 },
        }
    }

    /// Result for one channel.
    pub fn analyze_channel(&self, channel: &SampaChannel) -> ChannelResult {
        let stats = self.analyze(&channel.samples);
        ChannelResult {
            channel_id: channel.channel_id,
            fee_id: channel.fee_id,
            baseline: stats.baseline,
            amplitude: stats.amplitude,
            peak_time: stats.peak_index as f64,
            integral: stats.integral,
            snr: stats.snr,
        }
    }

    /// Results for every channel of `frame`.
    pub fn analyze_frame(&self, frame: &SampaFrame) -> ProcessedFrame {
        ProcessedFrame {
            frame_id: frame.frame_id,
            timestamp: frame.timestamp,
            results: frame
                .channels
                .iter()
                .map(|c| self.analyze_channel(c))
                .collect(),
        }
    }
}

impl ProcessedFrame {
    /// Encoded size: `16 + 48 × results`.
    pub fn serialized_size(&self) -> usize {
        PROCESSED_HEADER_LEN + CHANNEL_RESULT_LEN * self.results.len()
    }

    /// Little-endian encoding:
    /// `[frame_id:i32][timestamp:i64][count:i32]` then per result
    /// `[channel_id:i32][fee_id:i32][baseline][amplitude][peak_time][integral][snr]` as `f64`.
    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.serialized_size());
        out.put_i32_le(self.frame_id);
        out.put_i64_le(self.timestamp);
        out.put_i32_le(self.results.len() as i32);
        for r in &self.results {
            out.put_i32_le(r.channel_id);
            out.put_i32_le(r.fee_id);
            out.put_f64_le(r.baseline);
            out.put_f64_le(r.amplitude);
            out.put_f64_le(r.peak_time);
            out.put_f64_le(r.integral);
            out.put_f64_le(r.snr);
        }
        out.freeze()
    }

    /// Decode a buffer produced by [`serialize`](Self::serialize).
    pub fn deserialize(mut bytes: &[u8]) -> Result<Self, CodecError> {
        let total = bytes.len();
        let truncated = |remaining: usize, needed: usize| CodecError::TruncatedFrame {
            offset: total - remaining,
            needed,
            remaining,
        };

        if bytes.remaining() < PROCESSED_HEADER_LEN {
            return Err(truncated(bytes.remaining(), PROCESSED_HEADER_LEN));
        }
        let frame_id = bytes.get_i32_le();
        let timestamp = bytes.get_i64_le();
        let count = bytes.get_i32_le();
        let count = usize::try_from(count).map_err(|_| CodecError::NegativeCount {
            field: "result",
            value: count,
        })?;
        let needed = count.saturating_mul(CHANNEL_RESULT_LEN);
        if bytes.remaining() < needed {
            return Err(truncated(bytes.remaining(), needed));
        }

        let results = (0..count)
            .map(|_| ChannelResult {
                channel_id: bytes.get_i32_le(),
                fee_id: bytes.get_i32_le(),
                baseline: bytes.get_f64_le(),
                amplitude: bytes.get_f64_le(),
                peak_time: bytes.get_f64_le(),
                integral: bytes.get_f64_le(),
                snr: bytes.get_f64_le(),
            })
            .collect();

        if bytes.has_remaining() {
            return Err(CodecError::TrailingBytes(bytes.remaining()));
        }
        Ok(Self {
            frame_id,
            timestamp,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_flat_baseline_with_single_peak() {
        let mut samples = vec![10; 10];
        samples.extend_from_slice(&[50, 10, 10]);
        let stats = ChannelAnalyzer::default().analyze(&samples);

        assert!(close(stats.baseline, 10.0));
        assert_eq!(stats.peak_index, 10);
        assert!(close(stats.amplitude, 40.0));
        assert!(close(stats.integral, 40.0));
        assert!(close(stats.noise, 0.0));
        assert!(close(stats.snr, 0.0));
    }

    #[test]
    fn test_noise_and_snr() {
        // Baseline window 8, 12 repeated: mean 10, sample std sqrt(40/9).
        let mut samples: Vec<i32> = (0..10).map(|i| if i % 2 == 0 { 8 } else { 12 }).collect();
        samples.push(30);
        let stats = ChannelAnalyzer::default().analyze(&samples);

        let noise = (40.0f64 / 9.0).sqrt();
        assert!(close(stats.baseline, 10.0));
        assert!(close(stats.noise, noise));
        assert_eq!(stats.peak_index, 10);
        assert!(close(stats.snr, 20.0 / noise));
        // 5 × 2 above baseline in the window plus the 20 peak.
        assert!(close(stats.integral, 30.0));
    }

    #[test]
    fn test_first_maximum_wins() {
        let stats = ChannelAnalyzer::default().analyze(&[0, 5, 9, 9, 1]);
        assert_eq!(stats.peak_index, 2);
    }

    #[test]
    fn test_short_and_empty_channels() {
        let stats = ChannelAnalyzer::default().analyze(&[7]);
        assert!(close(stats.baseline, 7.0));
        assert_eq!(stats.peak_index, 0);
        assert!(close(stats.amplitude, 0.0));
        assert!(close(stats.noise, 0.0));

        let empty = ChannelAnalyzer::default().analyze(&[]);
        assert_eq!(empty, SignalStats::default());
    }

    #[test]
    fn test_custom_baseline_window() {
        let stats = ChannelAnalyzer::new(2).analyze(&[4, 6, 20, 5]);
        assert!(close(stats.baseline, 5.0));
        assert!(close(stats.amplitude, 15.0));
        assert!(close(stats.integral, 1.0 + 15.0));
    }

    #[test]
    fn test_analyze_frame_keeps_channel_identity() {
        let frame = SampaFrame {
            frame_id: 9,
            timestamp: 99,
            channels: vec![
                SampaChannel::new(1, 4, vec![0, 0, 3]),
                SampaChannel::new(2, 4, vec![]),
            ],
        };
        let processed = ChannelAnalyzer::default().analyze_frame(&frame);
        assert_eq!(processed.frame_id, 9);
        assert_eq!(processed.timestamp, 99);
        assert_eq!(processed.results.len(), 2);
        assert_eq!((processed.results[0].channel_id, processed.results[0].fee_id), (1, 4));
        assert!(close(processed.results[0].peak_time, 2.0));
        assert_eq!(processed.results[1].channel_id, 2);
    }

    #[test]
    fn test_processed_frame_encoding() {
        let processed = ProcessedFrame {
            frame_id: 3,
            timestamp: -1,
            results: vec![ChannelResult {
                channel_id: 5,
                fee_id: 6,
                baseline: 1.5,
                amplitude: 2.5,
                peak_time: 3.0,
                integral: 4.5,
                snr: 0.25,
            }],
        };
        let bytes = processed.serialize();
        assert_eq!(bytes.len(), 16 + 48);
        assert_eq!(processed.serialized_size(), bytes.len());
        assert_eq!(ProcessedFrame::deserialize(&bytes).unwrap(), processed);
        assert!(ProcessedFrame::deserialize(&bytes[..40]).is_err());
    }
}
