//! Transports a session can be bound to.
//!
//! The protocol layer only needs a small synchronous surface: queue a frame,
//! flush, check writability, close. [`TcpTransport`] realizes it over a tokio
//! socket with a writer task and a reader task; [`memory::MemoryTransport`]
//! records frames in process.

use bytes::BytesMut;
use link_wire::{Frame, FrameDecoder};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::session::SessionConfig;

/// Identity of one transport instance, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

impl TransportId {
    /// Allocate a fresh identity
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Write side of a connection as seen by the protocol.
///
/// All calls are fire-and-forget; failures surface later as a lost transport.
pub trait Transport {
    /// Identity used to tell a fresh connection from a stale one
    fn id(&self) -> TransportId;
    /// Whether more frames should be queued right now
    fn is_writable(&self) -> bool;
    /// Queue a frame without flushing
    fn write(&self, frame: Frame);
    /// Queue a frame and flush everything queued
    fn write_and_flush(&self, frame: Frame);
    /// Flush everything queued
    fn flush(&self);
    /// Close the connection; queued frames are still flushed first
    fn close(&self);
}

/// Receiver of frames read from a [`TcpTransport`]
pub(crate) trait FrameSink: Send + 'static {
    /// Handle one frame; returning `false` stops the reader
    fn on_frame(&mut self, transport: &TcpTransport, frame: Frame) -> bool;
    /// The connection is gone; called exactly once
    fn on_lost(&mut self, transport: TransportId);
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Read one frame, decoding whatever is already buffered before reading more.
///
/// Cancel safe: bytes read before cancellation stay in `buffer`.
pub async fn recv_any_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> Result<Frame, SessionError> {
    loop {
        if let Some(frame) = decoder.decode(buffer)? {
            return Ok(frame);
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF while reading frame",
            )));
        }

        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

#[derive(Debug)]
enum WriterCommand {
    Frame(bytes::Bytes),
    Flush,
    Close,
}

#[derive(Debug)]
struct Shared {
    id: TransportId,
    peer: SocketAddr,
    queued_bytes: AtomicUsize,
    closed: AtomicBool,
    write_high_water_mark: usize,
    max_frame_size: usize,
    stop_reader: watch::Sender<bool>,
}

/// Cloneable handle to a TCP connection driven by background tasks
#[derive(Clone, Debug)]
pub struct TcpTransport {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<WriterCommand>,
}

impl TcpTransport {
    /// Take ownership of `stream` and start its reader and writer tasks
    pub(crate) fn spawn<S: FrameSink>(
        stream: TcpStream,
        config: &SessionConfig,
        sink: S,
    ) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (stop_reader, stop_rx) = watch::channel(false);
        let transport = Self {
            shared: Arc::new(Shared {
                id: TransportId::next(),
                peer,
                queued_bytes: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                write_high_water_mark: config.write_high_water_mark,
                max_frame_size: config.max_frame_size,
                stop_reader,
            }),
            commands,
        };
        debug!("Transport {} bound to {}", transport.shared.id, peer);

        let writer = BufWriter::with_capacity(64 * 1024, write_half);
        tokio::spawn(run_writer(writer, command_rx, Arc::clone(&transport.shared)));
        tokio::spawn(run_reader(
            read_half,
            transport.clone(),
            sink,
            stop_rx,
            config.max_frame_size,
        ));

        Ok(transport)
    }

    /// Remote address of the connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Whether the connection has been closed or failed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn enqueue(&self, frame: Frame, flush: bool) {
        if self.is_closed() {
            return;
        }
        let bytes = match frame.encode(self.shared.max_frame_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Dropping {:?} frame on transport {}: {}",
                    frame.frame_type(),
                    self.shared.id,
                    e
                );
                return;
            }
        };

        self.shared
            .queued_bytes
            .fetch_add(bytes.len(), Ordering::AcqRel);
        let _ = self.commands.send(WriterCommand::Frame(bytes));
        if flush {
            let _ = self.commands.send(WriterCommand::Flush);
        }
    }
}

impl Transport for TcpTransport {
    fn id(&self) -> TransportId {
        self.shared.id
    }

    fn is_writable(&self) -> bool {
        !self.is_closed()
            && self.shared.queued_bytes.load(Ordering::Acquire) < self.shared.write_high_water_mark
    }

    fn write(&self, frame: Frame) {
        self.enqueue(frame, false);
    }

    fn write_and_flush(&self, frame: Frame) {
        self.enqueue(frame, true);
    }

    fn flush(&self) {
        if !self.is_closed() {
            let _ = self.commands.send(WriterCommand::Flush);
        }
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing transport {} to {}", self.shared.id, self.shared.peer);
            let _ = self.commands.send(WriterCommand::Close);
        }
    }
}

async fn run_writer(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    shared: Arc<Shared>,
) {
    while let Some(command) = commands.recv().await {
        let result = match command {
            WriterCommand::Frame(bytes) => {
                let result = writer.write_all(&bytes).await;
                shared.queued_bytes.fetch_sub(bytes.len(), Ordering::AcqRel);
                result
            }
            WriterCommand::Flush => writer.flush().await,
            WriterCommand::Close => break,
        };

        if let Err(e) = result {
            debug!("Write to {} failed on transport {}: {}", shared.peer, shared.id, e);
            break;
        }
    }

    shared.closed.store(true, Ordering::Release);
    let _ = writer.shutdown().await;
    let _ = shared.stop_reader.send(true);
    trace!("Writer for transport {} finished", shared.id);
}

async fn run_reader<S: FrameSink>(
    mut reader: OwnedReadHalf,
    transport: TcpTransport,
    mut sink: S,
    mut stop: watch::Receiver<bool>,
    max_frame_size: usize,
) {
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    let mut buffer = BytesMut::with_capacity(64 * 1024);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            result = recv_any_frame(&mut reader, &mut decoder, &mut buffer) => {
                match result {
                    Ok(frame) => {
                        trace!("Transport {} read {:?} frame", transport.id(), frame.frame_type());
                        if !sink.on_frame(&transport, frame) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(
                            "Transport {} to {} lost: {}",
                            transport.id(),
                            transport.peer_addr(),
                            e
                        );
                        break;
                    }
                }
            }
        }
    }

    transport.close();
    sink.on_lost(transport.id());
}

/// In-process transport that records frames instead of sending them
pub mod memory {
    use super::{Transport, TransportId};
    use link_wire::Frame;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    #[derive(Debug)]
    struct State {
        written: Vec<Frame>,
        writable: bool,
        closed: bool,
        flushes: usize,
    }

    /// Cloneable recording transport; clones share one outbox
    #[derive(Clone, Debug)]
    pub struct MemoryTransport {
        id: TransportId,
        state: Arc<Mutex<State>>,
    }

    impl MemoryTransport {
        /// Create an open, writable transport
        pub fn new() -> Self {
            Self {
                id: TransportId::next(),
                state: Arc::new(Mutex::new(State {
                    written: Vec::new(),
                    writable: true,
                    closed: false,
                    flushes: 0,
                })),
            }
        }

        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Take every frame written so far
        pub fn drain(&self) -> Vec<Frame> {
            std::mem::take(&mut self.state().written)
        }

        /// Simulate socket backpressure
        pub fn set_writable(&self, writable: bool) {
            self.state().writable = writable;
        }

        /// Whether `close` has been called
        pub fn is_closed(&self) -> bool {
            self.state().closed
        }

        /// Number of flushes requested
        pub fn flush_count(&self) -> usize {
            self.state().flushes
        }
    }

    impl Default for MemoryTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Transport for MemoryTransport {
        fn id(&self) -> TransportId {
            self.id
        }

        fn is_writable(&self) -> bool {
            let state = self.state();
            state.writable && !state.closed
        }

        fn write(&self, frame: Frame) {
            let mut state = self.state();
            if !state.closed {
                state.written.push(frame);
            }
        }

        fn write_and_flush(&self, frame: Frame) {
            let mut state = self.state();
            if !state.closed {
                state.written.push(frame);
                state.flushes += 1;
            }
        }

        fn flush(&self) {
            let mut state = self.state();
            if !state.closed {
                state.flushes += 1;
            }
        }

        fn close(&self) {
            self.state().closed = true;
        }
    }
}
