//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between two endpoints.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: A transport knows nothing about call frames, hubs or codecs.
//!   It moves opaque buffers, one whole frame per `send`/`recv`.
//! - **Duplex**: Both ends may send at any time. `recv` returns `Ok(None)` once the
//!   peer is gone or the transport was closed locally.
//! - **Object Safe**: Binders and sessions hold `Arc<dyn Transport>`.

use std::io::ErrorKind;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;

/// Default upper bound for one frame on a stream transport.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The frame is larger than the transport accepts.
    PayloadTooLarge { len: usize, max: usize },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "Frame of {} bytes exceeds transport limit of {} bytes", len, max)
            }
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => Self::ConnectionLost(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A duplex pipe of whole frames.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    ///
    /// # invariants
    /// - Must deliver frames in the order `send` was called.
    /// - Should not interpret the payload content.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next frame, or `None` once the stream has ended.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Ends the stream. A pending or later `recv` on either side yields `None`.
    async fn close(&self);
}

/// An in-memory transport built on tokio mpsc channels.
///
/// Frames sent on one half of a `pair()` appear on the other half's `recv()`.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed,
        }
    }

    /// Creates two transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let tx = self.tx.lock().await;
        let Some(tx) = tx.as_ref() else {
            return Err(Error::ConnectionLost("transport closed".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| Error::ConnectionLost("channel closed".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = closed.changed() => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.tx.lock().await.take();
    }
}

/// Length-prefixed frames over any byte stream.
///
/// Each frame is a little-endian `u32` length followed by that many bytes.
pub struct StreamTransport {
    reader: Mutex<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    max_frame_len: usize,
    closed: watch::Sender<bool>,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer)
    }

    pub fn tcp(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        let (reader, writer) = stream.into_split();
        Self::from_parts(reader, writer)
    }

    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            closed,
        }
    }

    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max.min(u32::MAX as usize);
        self
    }

    async fn read_frame(
        reader: &mut (dyn AsyncRead + Send + Unpin),
        max: usize,
    ) -> Result<Option<Vec<u8>>> {
        let len = match reader.read_u32_le().await {
            Ok(len) => len as usize,
            // eof between frames is a clean close
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > max {
            return Err(Error::PayloadTooLarge { len, max });
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }
}

#[async_trait::async_trait]
impl Transport for StreamTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_frame_len {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        if *self.closed.borrow() {
            return Err(Error::ConnectionLost("transport closed".into()));
        }

        let mut writer = self.writer.lock().await;
        writer.write_u32_le(payload.len() as u32).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            frame = Self::read_frame(&mut **reader, self.max_frame_len) => frame,
            _ = closed.changed() => Ok(None),
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "stream shutdown failed");
        }
    }
}
