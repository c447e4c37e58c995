//! SAMPA detector frames.
//!
//! Little-endian layout:
//!
//! ```text
//! [frame_id:i32][timestamp:i64][channel_count:i32]
//! per channel: [channel_id:i32][fee_id:i32][sample_count:i32][samples:i32 × sample_count]
//! ```

use super::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Bytes before the first channel.
pub const FRAME_HEADER_LEN: usize = 4 + 8 + 4;
/// Bytes before a channel's samples.
pub const CHANNEL_HEADER_LEN: usize = 4 + 4 + 4;

/// Waveform of one readout channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampaChannel {
    /// Channel number within the front-end card.
    pub channel_id: i32,
    /// Front-end electronics card.
    pub fee_id: i32,
    /// ADC samples.
    pub samples: Vec<i32>,
}

/// One detector readout frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampaFrame {
    /// Frame counter.
    pub frame_id: i32,
    /// Front-end timestamp.
    pub timestamp: i64,
    /// Channels in readout order.
    pub channels: Vec<SampaChannel>,
}

impl SampaChannel {
    /// Channel with the given samples.
    pub fn new(channel_id: i32, fee_id: i32, samples: Vec<i32>) -> Self {
        Self {
            channel_id,
            fee_id,
            samples,
        }
    }

    fn serialized_size(&self) -> usize {
        CHANNEL_HEADER_LEN + 4 * self.samples.len()
    }
}

impl SampaFrame {
    /// Encoded size: `16 + Σ(12 + 4 × sample_count)`.
    pub fn serialized_size(&self) -> usize {
        FRAME_HEADER_LEN
            + self
                .channels
                .iter()
                .map(SampaChannel::serialized_size)
                .sum::<usize>()
    }

    /// Append the encoding to `out`, reserving the exact size up front.
    pub fn serialize_into(&self, out: &mut BytesMut) {
        out.reserve(self.serialized_size());
        out.put_i32_le(self.frame_id);
        out.put_i64_le(self.timestamp);
        out.put_i32_le(self.channels.len() as i32);
        for channel in &self.channels {
            out.put_i32_le(channel.channel_id);
            out.put_i32_le(channel.fee_id);
            out.put_i32_le(channel.samples.len() as i32);
            for &sample in &channel.samples {
                out.put_i32_le(sample);
            }
        }
    }

    /// Encode into a new buffer.
    pub fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.serialized_size());
        self.serialize_into(&mut out);
        out.freeze()
    }

    /// Decode exactly one frame; trailing bytes are an error.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let total = bytes.len();
        let mut buf = bytes;

        ensure(&buf, FRAME_HEADER_LEN, total)?;
        let frame_id = buf.get_i32_le();
        let timestamp = buf.get_i64_le();
        let channel_count = count(buf.get_i32_le(), "channel")?;
        // Every channel needs at least its header; reject before allocating.
        ensure(&buf, channel_count.saturating_mul(CHANNEL_HEADER_LEN), total)?;

        let mut channels = Vec::with_capacity(channel_count);
        for _ in 0..channel_count {
            ensure(&buf, CHANNEL_HEADER_LEN, total)?;
            let channel_id = buf.get_i32_le();
            let fee_id = buf.get_i32_le();
            let sample_count = count(buf.get_i32_le(), "sample")?;
            ensure(&buf, sample_count.saturating_mul(4), total)?;

            let samples = (0..sample_count).map(|_| buf.get_i32_le()).collect();
            channels.push(SampaChannel {
                channel_id,
                fee_id,
                samples,
            });
        }

        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }
        Ok(Self {
            frame_id,
            timestamp,
            channels,
        })
    }

    /// Total samples across all channels.
    pub fn sample_count(&self) -> usize {
        self.channels.iter().map(|c| c.samples.len()).sum()
    }
}

fn ensure(buf: &&[u8], needed: usize, total: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::TruncatedFrame {
            offset: total - buf.remaining(),
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn count(value: i32, field: &'static str) -> Result<usize, CodecError> {
    usize::try_from(value).map_err(|_| CodecError::NegativeCount { field, value })
}
