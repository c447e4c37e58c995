//! Ethernet/IPv4/TCP/UDP metadata extraction.
//!
//! Extraction never fails: a frame that is too short or not IPv4 yields whatever fields could be
//! read and defaults for the rest.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Ethernet header length.
pub const ETHERNET_HEADER_LEN: usize = 14;
/// Minimum frame length to read an IPv4 header (Ethernet + 20-byte IP header).
pub const MIN_IPV4_FRAME_LEN: usize = ETHERNET_HEADER_LEN + 20;
/// EtherType of IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// IEEE 802 MAC address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Transport classification of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Too short to tell.
    #[default]
    Unknown,
    /// Not IPv4 (other EtherType, or IP version other than 4).
    NonIpv4,
    /// IP protocol 1.
    Icmp,
    /// IP protocol 6.
    Tcp,
    /// IP protocol 17.
    Udp,
    /// Any other IP protocol number.
    Other(u8),
}

impl Protocol {
    /// Classify an IPv4 protocol number.
    pub fn from_ip_protocol(number: u8) -> Self {
        match number {
            1 => Protocol::Icmp,
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            n => Protocol::Other(n),
        }
    }

    /// IPv4 protocol number, if this is an IPv4 classification.
    pub fn ip_protocol(self) -> Option<u8> {
        match self {
            Protocol::Icmp => Some(1),
            Protocol::Tcp => Some(6),
            Protocol::Udp => Some(17),
            Protocol::Other(n) => Some(n),
            Protocol::Unknown | Protocol::NonIpv4 => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Unknown => f.write_str("UNKNOWN"),
            Protocol::NonIpv4 => f.write_str("NON-IPV4"),
            Protocol::Icmp => f.write_str("ICMP"),
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Other(n) => write!(f, "IP({n})"),
        }
    }
}

/// Header-derived metadata of one captured frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketMeta {
    /// Transport classification.
    pub protocol: Protocol,
    /// Source MAC.
    pub src_mac: MacAddr,
    /// Destination MAC.
    pub dst_mac: MacAddr,
    /// EtherType.
    pub ether_type: u16,
    /// IP version nibble (0 if not read).
    pub ip_version: u8,
    /// Source IPv4 address.
    pub src_ip: Ipv4Addr,
    /// Destination IPv4 address.
    pub dst_ip: Ipv4Addr,
    /// Source port (TCP/UDP).
    pub src_port: u16,
    /// Destination port (TCP/UDP).
    pub dst_port: u16,
    /// IHL × 4.
    pub ip_header_length: usize,
    /// TCP data offset × 4, or 8 for UDP.
    pub transport_header_length: usize,
    /// Ethernet + IP + transport header bytes recognised.
    pub header_length: usize,
    /// IP total length field.
    pub ip_total_length: usize,
    /// `ip_total_length - (ip_header_length + transport_header_length)`, floored at 0.
    pub payload_length: usize,
}

impl Default for PacketMeta {
    fn default() -> Self {
        Self {
            protocol: Protocol::Unknown,
            src_mac: MacAddr::default(),
            dst_mac: MacAddr::default(),
            ether_type: 0,
            ip_version: 0,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
            ip_header_length: 0,
            transport_header_length: 0,
            header_length: 0,
            ip_total_length: 0,
            payload_length: 0,
        }
    }
}

impl fmt::Display for PacketMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Tcp | Protocol::Udp => write!(
                f,
                "{} {}:{} -> {}:{} payload={}",
                self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.payload_length
            ),
            Protocol::Icmp | Protocol::Other(_) => write!(
                f,
                "{} {} -> {} payload={}",
                self.protocol, self.src_ip, self.dst_ip, self.payload_length
            ),
            Protocol::Unknown | Protocol::NonIpv4 => write!(
                f,
                "{} {} -> {} ethertype={:#06x}",
                self.protocol, self.src_mac, self.dst_mac, self.ether_type
            ),
        }
    }
}

fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn mac(bytes: &[u8]) -> MacAddr {
    let mut out = [0u8; 6];
    out.copy_from_slice(&bytes[..6]);
    MacAddr(out)
}

/// Extract metadata from an Ethernet frame.
pub fn extract(frame: &[u8]) -> PacketMeta {
    let mut meta = PacketMeta::default();
    if frame.len() < ETHERNET_HEADER_LEN {
        return meta;
    }

    meta.dst_mac = mac(&frame[0..6]);
    meta.src_mac = mac(&frame[6..12]);
    meta.ether_type = be16(frame, 12);
    meta.header_length = ETHERNET_HEADER_LEN;

    if meta.ether_type != ETHERTYPE_IPV4 {
        meta.protocol = Protocol::NonIpv4;
        return meta;
    }
    if frame.len() < MIN_IPV4_FRAME_LEN {
        return meta;
    }

    let ip = &frame[ETHERNET_HEADER_LEN..];
    meta.ip_version = ip[0] >> 4;
    if meta.ip_version != 4 {
        meta.protocol = Protocol::NonIpv4;
        return meta;
    }

    let ihl = usize::from(ip[0] & 0x0f) * 4;
    meta.ip_total_length = usize::from(be16(ip, 2));
    meta.protocol = Protocol::from_ip_protocol(ip[9]);
    meta.src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    meta.dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
    meta.ip_header_length = ihl;

    // A header length below the 20-byte minimum leaves the transport offset meaningless.
    if ihl >= 20 {
        meta.header_length += ihl;
        let transport = ip.get(ihl..).unwrap_or_default();
        match meta.protocol {
            Protocol::Tcp if transport.len() >= TCP_MIN_HEADER_LEN => {
                meta.src_port = be16(transport, 0);
                meta.dst_port = be16(transport, 2);
                meta.transport_header_length = usize::from(transport[12] >> 4) * 4;
            }
            Protocol::Udp if transport.len() >= UDP_HEADER_LEN => {
                meta.src_port = be16(transport, 0);
                meta.dst_port = be16(transport, 2);
                meta.transport_header_length = UDP_HEADER_LEN;
            }
            _ => {}
        }
        meta.header_length += meta.transport_header_length;
    }

    meta.payload_length = meta
        .ip_total_length
        .saturating_sub(meta.ip_header_length + meta.transport_header_length);
    meta
}

/// Per-source-address packet and byte counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    /// Packets seen.
    pub packets: u64,
    /// Captured bytes seen.
    pub bytes: u64,
    /// Position of the first packet.
    pub first_index: u64,
    /// Position of the last packet.
    pub last_index: u64,
}

/// Packet positions and volume grouped by source IPv4 address.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowTable {
    by_source: BTreeMap<Ipv4Addr, FlowStats>,
    non_ipv4: u64,
}

impl FlowTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account the packet at position `index`.
    pub fn record(&mut self, index: u64, meta: &PacketMeta, captured_len: usize) {
        if meta.ip_version != 4 {
            self.non_ipv4 += 1;
            return;
        }
        let entry = self.by_source.entry(meta.src_ip).or_insert(FlowStats {
            first_index: index,
            ..Default::default()
        });
        entry.packets += 1;
        entry.bytes += captured_len as u64;
        entry.last_index = index;
    }

    /// Per-source statistics ordered by address.
    pub fn sources(&self) -> impl Iterator<Item = (&Ipv4Addr, &FlowStats)> {
        self.by_source.iter()
    }

    /// Frames that were not IPv4.
    pub fn non_ipv4(&self) -> u64 {
        self.non_ipv4
    }
}
