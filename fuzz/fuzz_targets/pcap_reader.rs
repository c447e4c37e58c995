//! Fuzz target for the capture file reader.
//!
//! Tests:
//! - Arbitrary global headers (any magic, any snaplen)
//! - Record headers with negative, zero or oversized lengths
//! - Streams that end inside a header or payload

#![no_main]

use libfuzzer_sys::fuzz_target;
use rtdp_ingest::codec::pcap::PcapReader;

fuzz_target!(|data: &[u8]| {
    let Ok(reader) = PcapReader::new(data) else {
        return;
    };
    let snaplen = reader.header().snaplen;

    for record in reader.take(10_000) {
        match record {
            Ok(record) => {
                assert!(record.captured_length > 0);
                assert!(record.captured_length <= snaplen);
                assert_eq!(record.payload.len(), record.captured_length as usize);
            }
            Err(_) => break,
        }
    }
});
