//! Frame transports.
//!
//! A [`Transport`] delivers length-prefixed frames from one endpoint. The connection handler
//! calls `read_frame` from its worker thread while `close` may be called from any other thread
//! to unblock that read, so every method takes `&self`.

use crate::codec::ByteOrder;
use crate::config::SourceConfig;
use crate::error::{AppResult, IngestError};
use parking_lot::Mutex;
use std::io::{self, BufReader, ErrorKind, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, instrument};

/// Receive buffer of the socket reader.
const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Outcome of one `read_frame` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRead {
    /// A complete frame of this many bytes is in the caller's buffer.
    Frame(usize),
    /// The read timeout expired before the first byte of a frame. Not an error.
    Idle,
}

/// Source of length-prefixed frames.
pub trait Transport: Send + Sync + 'static {
    /// `host:port` or another human-readable endpoint name.
    fn endpoint(&self) -> String;

    /// Establish (or re-establish) the connection, replacing any previous one.
    fn connect(&self) -> AppResult<()>;

    /// Read the next frame into `buf` (resized to the frame length).
    ///
    /// Returns [`IngestError::Desync`] for an invalid length prefix and
    /// [`IngestError::Io`] when the connection breaks.
    fn read_frame(&self, buf: &mut Vec<u8>) -> AppResult<FrameRead>;

    /// Shut the connection down, unblocking a concurrent `read_frame`. Idempotent.
    fn close(&self);

    /// Whether a connection is currently established.
    fn is_connected(&self) -> bool;
}

/// Length-prefixed frames over TCP.
///
/// Wire format: `[length: i32 in the configured byte order][length bytes]`, with
/// `0 < length <= max_frame_bytes`.
#[derive(Debug)]
pub struct TcpTransport {
    params: SourceConfig,
    reader: Mutex<Option<BufReader<TcpStream>>>,
    control: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl TcpTransport {
    /// Transport for `params`; nothing is connected until [`Transport::connect`].
    pub fn new(params: SourceConfig) -> Self {
        Self {
            params,
            reader: Mutex::new(None),
            control: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Connection parameters.
    pub fn params(&self) -> &SourceConfig {
        &self.params
    }

    fn open_stream(&self) -> io::Result<TcpStream> {
        let addrs = (self.params.host.as_str(), self.params.port).to_socket_addrs()?;
        let mut last_err = io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("{} did not resolve to any address", self.params.endpoint()),
        );
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.params.connect_timeout()) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn decode_length(&self, prefix: [u8; 4]) -> AppResult<usize> {
        let length = self.params.byte_order.i32_from(prefix);
        if length <= 0 || length as u32 > self.params.max_frame_bytes {
            return Err(IngestError::Desync {
                length: i64::from(length),
                max: self.params.max_frame_bytes,
            });
        }
        Ok(length as usize)
    }
}

impl Transport for TcpTransport {
    fn endpoint(&self) -> String {
        self.params.endpoint()
    }

    #[instrument(skip(self), fields(endpoint = %self.params.endpoint()), err)]
    fn connect(&self) -> AppResult<()> {
        self.close();

        let stream = self.open_stream()?;
        stream.set_read_timeout(Some(self.params.read_timeout()))?;
        stream.set_nodelay(true)?;
        let control = stream.try_clone()?;

        *self.reader.lock() = Some(BufReader::with_capacity(READ_BUFFER_BYTES, stream));
        *self.control.lock() = Some(control);
        self.connected.store(true, Ordering::Release);
        debug!("TCP connection established");
        Ok(())
    }

    fn read_frame(&self, buf: &mut Vec<u8>) -> AppResult<FrameRead> {
        let mut guard = self.reader.lock();
        let reader = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "transport not connected"))?;

        let mut prefix = [0u8; 4];
        if !read_exact_or_idle(&mut *reader, &mut prefix, true)? {
            return Ok(FrameRead::Idle);
        }

        let length = self.decode_length(prefix)?;
        buf.resize(length, 0);
        read_exact_or_idle(&mut *reader, buf, false)?;
        Ok(FrameRead::Frame(length))
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(stream) = self.control.lock().take() {
            // Unblocks a read in progress on the worker thread.
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Fill `buf` completely, looping on short reads and read timeouts.
///
/// With `idle_ok`, a timeout before the first byte returns `Ok(false)`.
fn read_exact_or_idle(reader: &mut impl Read, buf: &mut [u8], idle_ok: bool) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("connection closed after {filled} of {} bytes", buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if is_timeout(&e) && filled == 0 && idle_ok => return Ok(false),
            Err(e) if is_timeout(&e) || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
