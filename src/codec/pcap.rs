//! Packet-capture (pcap) file format.
//!
//! ```text
//! global header (24 bytes)
//!   [magic:4][version_major:2][version_minor:2][thiszone:4][sigfigs:4][snaplen:4][network:4]
//! record header (16 bytes), repeated
//!   [ts_sec:4][ts_usec:4][captured_len:4][original_len:4] + captured_len payload bytes
//! ```
//!
//! The magic is read as a big-endian `u32` and selects the byte order of every other field:
//!
//! | magic        | meaning                                   | byte order |
//! |--------------|-------------------------------------------|------------|
//! | `0xa1b2c3d4` | standard, microseconds                    | big        |
//! | `0xd4c3b2a1` | standard written little-endian            | little     |
//! | `0x4d3cb2a1` | nanosecond capture written little-endian  | little     |
//!
//! Any other magic is accepted with a warning and treated as little-endian.

use super::{ByteOrder, CodecError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use tracing::{debug, warn};

/// Standard magic, as read big-endian from a big-endian file.
pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
/// Standard magic, as read big-endian from a little-endian file.
pub const PCAP_MAGIC_SWAPPED: u32 = 0xd4c3_b2a1;
/// Nanosecond-resolution magic, as read big-endian from a little-endian file.
pub const PCAP_MAGIC_NANO_SWAPPED: u32 = 0x4d3c_b2a1;

/// Size of the global header.
pub const GLOBAL_HEADER_LEN: usize = 24;
/// Size of a record header.
pub const RECORD_HEADER_LEN: usize = 16;

/// Link type for Ethernet captures.
pub const LINKTYPE_ETHERNET: u32 = 1;

/// Interpretation of the magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagicKind {
    /// `0xa1b2c3d4`.
    Standard,
    /// `0xd4c3b2a1`.
    Swapped,
    /// `0x4d3cb2a1`.
    NanoSwapped,
    /// Anything else.
    Unknown,
}

impl MagicKind {
    /// Classify a magic read big-endian.
    pub fn classify(magic: u32) -> Self {
        match magic {
            PCAP_MAGIC => MagicKind::Standard,
            PCAP_MAGIC_SWAPPED => MagicKind::Swapped,
            PCAP_MAGIC_NANO_SWAPPED => MagicKind::NanoSwapped,
            _ => MagicKind::Unknown,
        }
    }

    /// Byte order implied by the magic.
    pub fn byte_order(self) -> ByteOrder {
        match self {
            MagicKind::Standard => ByteOrder::Big,
            MagicKind::Swapped | MagicKind::NanoSwapped | MagicKind::Unknown => ByteOrder::Little,
        }
    }

    /// Whether the fractional timestamp field counts nanoseconds.
    pub fn is_nanosecond(self) -> bool {
        matches!(self, MagicKind::NanoSwapped)
    }
}

/// Decoded global header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcapGlobalHeader {
    /// Magic as read big-endian.
    pub magic: u32,
    /// Classification of `magic`.
    pub magic_kind: MagicKind,
    /// Byte order of every other field.
    pub byte_order: ByteOrder,
    /// Format major version.
    pub version_major: u16,
    /// Format minor version.
    pub version_minor: u16,
    /// GMT to local correction.
    pub thiszone: i32,
    /// Timestamp accuracy.
    pub sigfigs: u32,
    /// Maximum captured length per record.
    pub snaplen: u32,
    /// Link-layer type.
    pub network: u32,
}

impl PcapGlobalHeader {
    /// Version 2.4 microsecond header for writing in `byte_order`.
    pub fn new(byte_order: ByteOrder, snaplen: u32, network: u32) -> Self {
        let (magic, magic_kind) = match byte_order {
            ByteOrder::Big => (PCAP_MAGIC, MagicKind::Standard),
            ByteOrder::Little => (PCAP_MAGIC_SWAPPED, MagicKind::Swapped),
        };
        Self {
            magic,
            magic_kind,
            byte_order,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            network,
        }
    }

    /// Encode in the header's byte order.
    pub fn to_bytes(&self) -> [u8; GLOBAL_HEADER_LEN] {
        let order = self.byte_order;
        let mut out = [0u8; GLOBAL_HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&order.u16_bytes(self.version_major));
        out[6..8].copy_from_slice(&order.u16_bytes(self.version_minor));
        out[8..12].copy_from_slice(&order.u32_bytes(self.thiszone as u32));
        out[12..16].copy_from_slice(&order.u32_bytes(self.sigfigs));
        out[16..20].copy_from_slice(&order.u32_bytes(self.snaplen));
        out[20..24].copy_from_slice(&order.u32_bytes(self.network));
        out
    }
}

fn word(bytes: &[u8], at: usize) -> [u8; 4] {
    [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]
}

/// Parse a 24-byte global header.
pub fn parse_global_header(bytes: &[u8]) -> Result<PcapGlobalHeader, CodecError> {
    if bytes.len() < GLOBAL_HEADER_LEN {
        return Err(CodecError::TruncatedHeader {
            what: "pcap global header",
            needed: GLOBAL_HEADER_LEN,
            got: bytes.len(),
        });
    }

    let magic = u32::from_be_bytes(word(bytes, 0));
    let magic_kind = MagicKind::classify(magic);
    if magic_kind == MagicKind::Unknown {
        warn!(magic = format_args!("{magic:#010x}"), "Unknown pcap magic, assuming little-endian");
    }
    let order = magic_kind.byte_order();

    let header = PcapGlobalHeader {
        magic,
        magic_kind,
        byte_order: order,
        version_major: order.u16_from([bytes[4], bytes[5]]),
        version_minor: order.u16_from([bytes[6], bytes[7]]),
        thiszone: order.i32_from(word(bytes, 8)),
        sigfigs: order.u32_from(word(bytes, 12)),
        snaplen: order.u32_from(word(bytes, 16)),
        network: order.u32_from(word(bytes, 20)),
    };
    debug!(
        byte_order = %header.byte_order,
        version = format_args!("{}.{}", header.version_major, header.version_minor),
        snaplen = header.snaplen,
        network = header.network,
        "Parsed pcap global header"
    );
    Ok(header)
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Seconds since the epoch.
    pub ts_sec: u32,
    /// Sub-second part (micro- or nanoseconds).
    pub ts_frac: u32,
    /// Captured length, signed on the wire.
    pub captured_length: i32,
    /// Original length on the wire.
    pub original_length: u32,
}

impl RecordHeader {
    /// Parse a 16-byte record header in `order`.
    pub fn parse(bytes: &[u8; RECORD_HEADER_LEN], order: ByteOrder) -> Self {
        Self {
            ts_sec: order.u32_from(word(bytes, 0)),
            ts_frac: order.u32_from(word(bytes, 4)),
            captured_length: order.i32_from(word(bytes, 8)),
            original_length: order.u32_from(word(bytes, 12)),
        }
    }

    /// Captured length if it is positive and within `snaplen`.
    pub fn validated_length(&self, snaplen: u32) -> Result<usize, CodecError> {
        if self.captured_length <= 0 || self.captured_length as u32 > snaplen {
            return Err(CodecError::InvalidRecordLength {
                length: i64::from(self.captured_length),
                snaplen,
            });
        }
        Ok(self.captured_length as usize)
    }
}

/// One captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapRecord {
    /// Seconds since the epoch.
    pub ts_sec: u32,
    /// Sub-second part; microseconds unless the file uses the nanosecond magic.
    pub ts_usec: u32,
    /// Bytes captured (length of `payload`).
    pub captured_length: u32,
    /// Length of the packet on the wire.
    pub original_length: u32,
    /// Captured bytes.
    pub payload: Bytes,
}

impl PcapRecord {
    /// Capture time; `nanosecond` selects the unit of `ts_usec`.
    pub fn timestamp(&self, nanosecond: bool) -> Option<DateTime<Utc>> {
        let nanos = if nanosecond {
            self.ts_usec
        } else {
            self.ts_usec.checked_mul(1000)?
        };
        DateTime::from_timestamp(i64::from(self.ts_sec), nanos)
    }
}

/// Read up to `buf.len()` bytes, stopping early only at end of stream.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streaming reader over a capture.
#[derive(Debug)]
pub struct PcapReader<R> {
    reader: R,
    header: PcapGlobalHeader,
    records_read: u64,
    failed: bool,
}

impl<R: Read> PcapReader<R> {
    /// Read the global header from `reader`.
    pub fn new(mut reader: R) -> Result<Self, CodecError> {
        let mut buf = [0u8; GLOBAL_HEADER_LEN];
        let got = read_up_to(&mut reader, &mut buf)?;
        let header = parse_global_header(&buf[..got])?;
        Ok(Self {
            reader,
            header,
            records_read: 0,
            failed: false,
        })
    }

    /// The global header.
    pub fn header(&self) -> &PcapGlobalHeader {
        &self.header
    }

    /// Records returned so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Next record; `Ok(None)` at end of stream.
    ///
    /// A stream ending inside a record header is a clean end. An invalid captured length or a
    /// stream ending inside a payload is an error.
    pub fn next_record(&mut self) -> Result<Option<PcapRecord>, CodecError> {
        let mut raw = [0u8; RECORD_HEADER_LEN];
        let got = read_up_to(&mut self.reader, &mut raw)?;
        if got < RECORD_HEADER_LEN {
            if got > 0 {
                debug!(got, "Partial record header at end of capture, ignoring");
            }
            return Ok(None);
        }

        let header = RecordHeader::parse(&raw, self.header.byte_order);
        let length = header.validated_length(self.header.snaplen)?;

        let mut payload = vec![0u8; length];
        let got = read_up_to(&mut self.reader, &mut payload)?;
        if got < length {
            return Err(CodecError::TruncatedRecord {
                expected: length,
                got,
            });
        }

        self.records_read += 1;
        Ok(Some(PcapRecord {
            ts_sec: header.ts_sec,
            ts_usec: header.ts_frac,
            captured_length: length as u32,
            original_length: header.original_length,
            payload: Bytes::from(payload),
        }))
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for PcapReader<R> {
    type Item = Result<PcapRecord, CodecError>;

    /// Yields records until end of stream; stops after the first error.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Writes captures (used to generate replay files and test fixtures).
#[derive(Debug)]
pub struct PcapWriter<W: Write> {
    writer: W,
    header: PcapGlobalHeader,
}

impl<W: Write> PcapWriter<W> {
    /// Write `header` and return a writer for records.
    pub fn new(mut writer: W, header: PcapGlobalHeader) -> Result<Self, CodecError> {
        writer.write_all(&header.to_bytes())?;
        Ok(Self { writer, header })
    }

    /// Append a record; data beyond `snaplen` is truncated, the original length is kept.
    pub fn write_record(&mut self, ts_sec: u32, ts_frac: u32, data: &[u8]) -> Result<(), CodecError> {
        let order = self.header.byte_order;
        let captured = data.len().min(self.header.snaplen as usize);
        let mut raw = [0u8; RECORD_HEADER_LEN];
        raw[0..4].copy_from_slice(&order.u32_bytes(ts_sec));
        raw[4..8].copy_from_slice(&order.u32_bytes(ts_frac));
        raw[8..12].copy_from_slice(&order.u32_bytes(captured as u32));
        raw[12..16].copy_from_slice(&order.u32_bytes(data.len() as u32));
        self.writer.write_all(&raw)?;
        self.writer.write_all(&data[..captured])?;
        Ok(())
    }

    /// Flush and give back the underlying writer.
    pub fn finish(mut self) -> Result<W, CodecError> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}
