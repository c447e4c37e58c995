//! Binary codecs for the payloads carried by ingested frames.
//!
//! - [`pcap`]: packet-capture global and record headers.
//! - [`packet`]: Ethernet/IPv4/TCP/UDP metadata extraction from a captured frame.
//! - [`sampa`]: detector frames carrying per-channel waveform samples.

pub mod packet;
pub mod pcap;
pub mod sampa;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte order of multi-byte integers on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Network order.
    #[default]
    Big,
    /// Least significant byte first.
    Little,
}

impl ByteOrder {
    /// Decode a `u16`.
    pub fn u16_from(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Big => u16::from_be_bytes(bytes),
            ByteOrder::Little => u16::from_le_bytes(bytes),
        }
    }

    /// Decode a `u32`.
    pub fn u32_from(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        }
    }

    /// Decode an `i32`.
    pub fn i32_from(self, bytes: [u8; 4]) -> i32 {
        match self {
            ByteOrder::Big => i32::from_be_bytes(bytes),
            ByteOrder::Little => i32::from_le_bytes(bytes),
        }
    }

    /// Encode a `u16`.
    pub fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        }
    }

    /// Encode a `u32`.
    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        }
    }

    /// Encode a frame length prefix.
    pub fn length_prefix(self, length: i32) -> [u8; 4] {
        match self {
            ByteOrder::Big => length.to_be_bytes(),
            ByteOrder::Little => length.to_le_bytes(),
        }
    }
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ByteOrder::Big => "big-endian",
            ByteOrder::Little => "little-endian",
        })
    }
}

/// Malformed wire data.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The stream ended inside a fixed-size header.
    #[error("Truncated {what}: need {needed} bytes, got {got}")]
    TruncatedHeader {
        /// Which header.
        what: &'static str,
        /// Required bytes.
        needed: usize,
        /// Available bytes.
        got: usize,
    },

    /// A capture record declared an impossible captured length.
    ///
    /// **Error Type**: Desynchronization - the stream position can no longer be trusted.
    #[error("Invalid capture record length {length} (snaplen {snaplen})")]
    InvalidRecordLength {
        /// Declared captured length (signed on the wire).
        length: i64,
        /// Snapshot length from the global header.
        snaplen: u32,
    },

    /// The stream ended inside a record payload.
    #[error("Truncated capture record: expected {expected} payload bytes, got {got}")]
    TruncatedRecord {
        /// Declared captured length.
        expected: usize,
        /// Bytes available before end of stream.
        got: usize,
    },

    /// A SAMPA frame ended before the declared content.
    #[error("Truncated SAMPA frame at offset {offset}: need {needed} more bytes, {remaining} left")]
    TruncatedFrame {
        /// Byte offset where decoding stopped.
        offset: usize,
        /// Bytes required to continue.
        needed: usize,
        /// Bytes remaining.
        remaining: usize,
    },

    /// A count field was negative.
    #[error("Negative {field} count {value}")]
    NegativeCount {
        /// Field name.
        field: &'static str,
        /// Decoded value.
        value: i32,
    },

    /// Bytes left over after a complete SAMPA frame.
    #[error("{0} trailing bytes after SAMPA frame")]
    TrailingBytes(usize),

    /// Underlying reader or writer failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
