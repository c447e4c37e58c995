//! Loopback TCP servers for integration tests.

#![allow(dead_code)]

use rtdp_ingest::config::SourceConfig;
use rtdp_ingest::source::{HandlerConfig, RetryPolicy};
use std::io::Write;
use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Big-endian length-prefixed frame.
pub fn framed(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as i32).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Raw length prefix, for desync scenarios.
pub fn raw_prefix(length: i32) -> Vec<u8> {
    length.to_be_bytes().to_vec()
}

/// Server that accepts one connection per session, writes the session's bytes, waits `linger`
/// and closes it. The listener is dropped after the last session.
pub struct ScriptedServer {
    pub port: u16,
    handle: JoinHandle<usize>,
}

impl ScriptedServer {
    pub fn start(sessions: Vec<Vec<u8>>, linger: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut served = 0;
            for bytes in sessions {
                let (mut stream, _) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let _ = stream.write_all(&bytes);
                let _ = stream.flush();
                thread::sleep(linger);
                drop(stream);
                served += 1;
            }
            served
        });
        Self { port, handle }
    }

    /// Sessions served once the server thread finishes.
    pub fn join(self) -> usize {
        self.handle.join().unwrap()
    }
}

/// Port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Handler settings for `port` with short timeouts and `attempts` fixed-delay retries.
pub fn handler_config(port: u16, source_id: u32, attempts: u32, delay: Duration) -> HandlerConfig {
    let mut source = SourceConfig::new("127.0.0.1", port);
    source.connect_timeout_ms = 500;
    source.read_timeout_ms = 50;
    source.ring_capacity = 64;
    HandlerConfig::new(source, source_id)
        .with_connect(RetryPolicy::fixed(attempts, delay))
        .with_reconnect(RetryPolicy::fixed(attempts, delay))
}
