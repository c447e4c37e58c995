//! Fuzz target for ring publish/consume sequences.
//!
//! Tests:
//! - FIFO order and gap-free sequence numbers under arbitrary interleavings
//! - Full-ring rejection at exactly `capacity` outstanding events
//! - Slot reuse with payloads of varying sizes

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rtdp_ingest::ring::{RingChannel, RingError};
use std::collections::VecDeque;

#[derive(Debug, Arbitrary)]
enum Op {
    Publish { len: u8, fill: u8 },
    Consume,
}

#[derive(Debug, Arbitrary)]
struct RingInput {
    capacity_bits: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: RingInput| {
    let capacity = 1usize << (input.capacity_bits % 6);
    let (mut producer, mut consumer) = RingChannel::with_capacity(capacity, 9);
    let mut expected: VecDeque<Vec<u8>> = VecDeque::new();
    let mut next_sequence = 0u64;

    for op in input.ops.iter().take(1000) {
        match *op {
            Op::Publish { len, fill } => {
                let payload = vec![fill; usize::from(len)];
                match producer.try_publish(&payload) {
                    Ok(_) => expected.push_back(payload),
                    Err(RingError::Full) => assert_eq!(expected.len(), capacity),
                    Err(other) => panic!("unexpected publish error: {other}"),
                }
            }
            Op::Consume => match consumer.try_next() {
                Some(event) => {
                    let want = expected.pop_front().expect("event without publish");
                    assert_eq!(&event.payload[..], &want[..]);
                    assert_eq!(event.sequence, next_sequence);
                    assert_eq!(event.source_id, 9);
                    next_sequence += 1;
                }
                None => assert!(expected.is_empty()),
            },
        }
    }
});
