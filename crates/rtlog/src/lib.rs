//! Binary real-time event tracing with pluggable backends.
//!
//! Scheduler instrumentation is emitted as small binary *records*, framed in
//! byte-stuffed packets so a host-side tool can resynchronize on a lossy
//! transport. Each record carries a sequence number, an optional timestamp,
//! and a record-type identifier from [`records`].
//!
//! Producers do not talk to a [`Tracer`] directly; they hold a [`TraceHook`]
//! closure obtained from [`TracerHandle::hook`], which keeps the scheduler
//! core decoupled from the transport.

use std::io::{self, Write};
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

pub mod records;

/// Maximum payload length for a single record (excluding header/checksum).
const DEFAULT_MAX_RECORD_LEN: usize = 48;

/// Frame delimiter byte.
const FLAG: u8 = 0x7E;
/// Escape byte; the next byte is XORed with [`ESC_XOR`].
const ESC: u8 = 0x7D;
const ESC_XOR: u8 = 0x20;

/// Configuration for the tracer.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub max_record_len: usize,
    pub include_timestamp: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            include_timestamp: true,
        }
    }
}

/// A single trace record, as handed to the framing layer.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub seq: u8,
    pub record_type: u8,
    pub timestamp: Option<Duration>,
    pub payload: Vec<u8>,
}

/// Errors that can occur while emitting trace data.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("backend error: {0}")]
    Backend(#[from] io::Error),
}

/// Closure type through which producers emit records.
///
/// Arguments: record type, payload, whether to stamp the record with a
/// timestamp.
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> Result<(), TraceError> + Send + Sync>;

/// Backend trait that consumes framed bytes.
pub trait TraceBackend: Send + Sync {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError>;
}

/// Backend that writes frames to any `Write` implementation.
pub struct WriterBackend<W: Write + Send + Sync + 'static> {
    writer: Arc<Mutex<W>>,
}

impl<W: Write + Send + Sync + 'static> WriterBackend<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl<W: Write + Send + Sync + 'static> TraceBackend for WriterBackend<W> {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        let mut guard = self.writer.lock().unwrap();
        guard.write_all(frame).map_err(TraceError::from)
    }
}

/// Convenience backend that writes frames to stdout; handy for bring-up.
pub fn stdout_backend() -> WriterBackend<io::Stdout> {
    WriterBackend::new(io::stdout())
}

/// Backend that streams frames over a UDP socket, one record per datagram.
pub struct UdpBackend {
    socket: UdpSocket,
}

impl UdpBackend {
    /// Binds a local UDP socket and connects it to the provided remote
    /// address.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        Ok(Self { socket })
    }
}

impl TraceBackend for UdpBackend {
    fn write_frame(&self, frame: &[u8]) -> Result<(), TraceError> {
        self.socket.send(frame).map(|_| ()).map_err(TraceError::from)
    }
}

/// Record encoder driving a single backend.
pub struct Tracer<B: TraceBackend> {
    backend: B,
    cfg: LogConfig,
    seq: u8,
    epoch: Instant,
}

impl<B: TraceBackend> Tracer<B> {
    pub fn new(cfg: LogConfig, backend: B) -> Self {
        Self {
            backend,
            cfg,
            seq: 0,
            epoch: Instant::now(),
        }
    }

    /// Wraps the tracer for shared use across threads.
    pub fn into_handle(self) -> TracerHandle<B> {
        TracerHandle {
            inner: Arc::new(Mutex::new(self)),
        }
    }

    /// Frames and emits one record, returning what was sent.
    pub fn record(
        &mut self,
        record_type: u8,
        payload: &[u8],
        with_timestamp: bool,
    ) -> Result<LogRecord, TraceError> {
        if payload.len() > self.cfg.max_record_len {
            return Err(TraceError::PayloadTooLarge(payload.len()));
        }

        let timestamp = if self.cfg.include_timestamp && with_timestamp {
            Some(self.epoch.elapsed())
        } else {
            None
        };

        self.seq = self.seq.wrapping_add(1);
        let record = LogRecord {
            seq: self.seq,
            record_type,
            timestamp,
            payload: payload.to_vec(),
        };

        let frame = encode_frame(&record);
        self.backend.write_frame(&frame)?;
        Ok(record)
    }
}

/// Shared, clonable handle over a [`Tracer`].
pub struct TracerHandle<B: TraceBackend> {
    inner: Arc<Mutex<Tracer<B>>>,
}

impl<B: TraceBackend> Clone for TracerHandle<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: TraceBackend + 'static> TracerHandle<B> {
    pub fn emit(&self, record_type: u8, payload: &[u8]) -> Result<LogRecord, TraceError> {
        self.emit_internal(record_type, payload, false)
    }

    pub fn emit_with_timestamp(
        &self,
        record_type: u8,
        payload: &[u8],
    ) -> Result<LogRecord, TraceError> {
        self.emit_internal(record_type, payload, true)
    }

    fn emit_internal(
        &self,
        record_type: u8,
        payload: &[u8],
        with_timestamp: bool,
    ) -> Result<LogRecord, TraceError> {
        let mut guard = self.inner.lock().unwrap();
        guard.record(record_type, payload, with_timestamp)
    }

    /// Returns a [`TraceHook`] that producers can call without knowing the
    /// backend type.
    pub fn hook(&self) -> TraceHook {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |record_type, payload, with_timestamp| {
            let mut guard = inner.lock().unwrap();
            guard
                .record(record_type, payload, with_timestamp)
                .map(|_| ())
        })
    }
}

/// Frame layout: seq, record type, optional u32 LE microsecond timestamp,
/// payload, one's-complement additive checksum, closing [`FLAG`].
///
/// Every byte except the closing flag is escaped; the checksum covers the
/// unescaped bytes before the checksum itself.
fn encode_frame(record: &LogRecord) -> Vec<u8> {
    let mut frame = FrameWriter::with_capacity(record.payload.len() + 8);

    frame.push(record.seq);
    frame.push(record.record_type);

    if let Some(ts) = record.timestamp {
        let ticks = (ts.as_micros() as u32).to_le_bytes();
        for byte in ticks {
            frame.push(byte);
        }
    }

    for &byte in &record.payload {
        frame.push(byte);
    }

    frame.finish()
}

struct FrameWriter {
    bytes: Vec<u8>,
    checksum: u8,
}

impl FrameWriter {
    fn with_capacity(cap: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(cap),
            checksum: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.checksum = self.checksum.wrapping_add(byte);
        self.push_escaped(byte);
    }

    fn push_escaped(&mut self, byte: u8) {
        if byte == FLAG || byte == ESC {
            self.bytes.push(ESC);
            self.bytes.push(byte ^ ESC_XOR);
        } else {
            self.bytes.push(byte);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        let checksum = !self.checksum;
        self.push_escaped(checksum);
        self.bytes.push(FLAG);
        self.bytes
    }
}
