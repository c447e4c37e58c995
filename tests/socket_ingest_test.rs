//! End-to-end tests of a single TCP source against loopback servers.

mod common;

use common::{closed_port, framed, handler_config, raw_prefix, ScriptedServer};
use rtdp_ingest::aggregator::Source;
use rtdp_ingest::error::IngestError;
use rtdp_ingest::source::ConnectionState;
use serial_test::serial;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
#[serial]
fn test_frames_arrive_in_order() {
    let payloads: Vec<Vec<u8>> = (0..200u32).map(|i| i.to_le_bytes().repeat(i as usize % 7 + 1)).collect();
    let session: Vec<u8> = payloads.iter().flat_map(|p| framed(p)).collect();
    let server = ScriptedServer::start(vec![session], Duration::from_millis(200));

    let mut source = Source::network(handler_config(server.port, 7, 1, Duration::from_millis(10)));
    source.open().unwrap();

    for (i, expected) in payloads.iter().enumerate() {
        let event = source.next_event(WAIT).expect("event should arrive");
        assert_eq!(event.source_id, 7);
        assert_eq!(event.sequence, i as u64);
        assert_eq!(&event.payload[..], &expected[..]);
    }

    let stats = source.handler().unwrap().stats();
    assert_eq!(stats.frames, 200);
    assert_eq!(stats.bytes, payloads.iter().map(|p| p.len() as u64).sum::<u64>());
    source.close().unwrap();
    assert_eq!(server.join(), 1);
}

#[test]
#[serial]
fn test_invalid_length_triggers_reconnect() {
    let mut first = framed(b"one");
    first.extend(raw_prefix(-5));
    let server = ScriptedServer::start(
        vec![first, framed(b"two")],
        Duration::from_millis(100),
    );

    let mut source = Source::network(handler_config(server.port, 1, 3, Duration::from_millis(20)));
    source.open().unwrap();

    let one = source.next_event(WAIT).unwrap();
    let two = source.next_event(WAIT).unwrap();
    assert_eq!(&one.payload[..], b"one");
    assert_eq!(&two.payload[..], b"two");
    assert_eq!((one.sequence, two.sequence), (0, 1));

    let stats = source.handler().unwrap().stats();
    assert_eq!(stats.desyncs, 1);
    assert_eq!(stats.reconnects, 1);
    source.close().unwrap();
}

#[test]
#[serial]
fn test_oversized_length_is_a_desync() {
    let mut session = framed(b"ok");
    session.extend(raw_prefix(1 << 30));
    let server = ScriptedServer::start(vec![session], Duration::from_millis(50));

    let mut source = Source::network(handler_config(server.port, 1, 1, Duration::from_millis(10)));
    source.open().unwrap();
    assert_eq!(&source.next_event(WAIT).unwrap().payload[..], b"ok");

    let handler = source.handler().unwrap();
    assert!(wait_until(WAIT, || handler.stats().desyncs == 1));
    source.close().unwrap();
}

#[test]
#[serial]
fn test_reconnect_gives_up_after_policy_attempts() {
    let delay = Duration::from_millis(50);
    let server = ScriptedServer::start(vec![framed(b"only")], Duration::ZERO);

    let mut source = Source::network(handler_config(server.port, 3, 3, delay));
    let start = Instant::now();
    source.open().unwrap();
    assert_eq!(&source.next_event(WAIT).unwrap().payload[..], b"only");

    let handler = source.handler().unwrap();
    assert!(wait_until(WAIT, || matches!(handler.state(), ConnectionState::Failed { .. })));
    assert!(start.elapsed() >= delay * 3);
    assert_eq!(handler.stats().reconnect_attempts, 3);
    assert!(handler.state().failure_reason().unwrap().contains("3 attempt"));

    // The failed source is closed and drained.
    assert!(source.next_event(Duration::from_millis(20)).is_none());
    assert!(source.is_exhausted());
    assert!(!source.is_connected());
}

#[test]
#[serial]
fn test_connect_failure_reports_attempts() {
    let source = Source::network(handler_config(closed_port(), 1, 2, Duration::from_millis(20)));
    match source.open() {
        Err(IngestError::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected ConnectFailed, got {other:?}"),
    }
    assert!(matches!(
        source.handler().unwrap().state(),
        ConnectionState::Failed { .. }
    ));
}

#[test]
#[serial]
fn test_close_interrupts_idle_connection() {
    let server = ScriptedServer::start(vec![framed(b"hello")], Duration::from_secs(2));

    let mut source = Source::network(handler_config(server.port, 1, 3, Duration::from_millis(10)));
    source.open().unwrap();
    assert_eq!(&source.next_event(WAIT).unwrap().payload[..], b"hello");
    assert!(source.is_connected());

    let start = Instant::now();
    source.close().unwrap();
    source.close().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!source.is_connected());
    assert!(matches!(source.open(), Err(IngestError::Stopped { .. })));
}
