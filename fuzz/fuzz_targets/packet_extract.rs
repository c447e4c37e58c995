//! Fuzz target for Ethernet/IPv4 metadata extraction.
//!
//! Tests:
//! - Frames of any length, including truncated IP and transport headers
//! - IHL and TCP data offset values outside the valid range

#![no_main]

use libfuzzer_sys::fuzz_target;
use rtdp_ingest::codec::packet::{self, FlowTable};

fuzz_target!(|data: &[u8]| {
    let meta = packet::extract(data);
    let mut flows = FlowTable::new();
    flows.record(0, &meta, data.len());
    let _ = meta.to_string();
});
