//! Fuzz target for SAMPA frame decoding and channel analysis.
//!
//! Tests:
//! - Negative and huge channel/sample counts must not allocate or panic
//! - Any frame that decodes re-encodes to the same bytes
//! - Analysis of decoded waveforms never panics

#![no_main]

use libfuzzer_sys::fuzz_target;
use rtdp_ingest::analysis::ChannelAnalyzer;
use rtdp_ingest::codec::sampa::SampaFrame;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = SampaFrame::deserialize(data) else {
        return;
    };
    assert_eq!(&frame.serialize()[..], data);

    let processed = ChannelAnalyzer::default().analyze_frame(&frame);
    assert_eq!(processed.results.len(), frame.channels.len());
});
