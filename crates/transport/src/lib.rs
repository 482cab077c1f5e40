//! Framed duplex transports for the A3S agent-host protocol.
//!
//! This crate provides:
//! - [`FrameSource`] / [`FrameSink`]: async receive/send halves over any byte stream
//! - [`Framing`]: newline-delimited units or the binary [`Frame`] format
//! - [`Transport`]: a paired source and sink, built over stdio, a Unix
//!   socket, any `AsyncRead + AsyncWrite` stream, or an in-memory duplex

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod codec;
pub mod frame;
#[cfg(unix)]
pub mod unix;

pub use codec::{FrameReader, FrameWriter, Framing};
pub use frame::{Frame, FrameType, MAX_PAYLOAD_SIZE};

/// Buffer size of each direction of an in-memory pair.
const MEMORY_PIPE_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed framing: {0}")]
    Malformed(String),
    #[error("Peer reported error: {0}")]
    Remote(String),
}

impl TransportError {
    /// True when the peer violated the framing rules.
    pub fn is_malformed(&self) -> bool {
        matches!(self, TransportError::Malformed(_))
    }
}

// ---------------------------------------------------------------------------
// Halves
// ---------------------------------------------------------------------------

/// Receiving half: yields one unit payload at a time.
#[async_trait]
pub trait FrameSource: Send + std::fmt::Debug {
    /// Next unit, or `None` once the peer closed the stream cleanly.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Sending half: writes whole units in call order.
#[async_trait]
pub trait FrameSink: Send + std::fmt::Debug {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A connected duplex channel to one peer.
#[derive(Debug)]
pub struct Transport {
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
}

impl Transport {
    pub fn new(source: impl FrameSource + 'static, sink: impl FrameSink + 'static) -> Self {
        Self {
            source: Box::new(source),
            sink: Box::new(sink),
        }
    }

    /// Frame separate read and write streams.
    pub fn from_io<R, W>(reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            FrameReader::new(reader, framing),
            FrameWriter::new(writer, framing),
        )
    }

    /// Frame one bidirectional stream.
    pub fn from_stream<S>(stream: S, framing: Framing) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::from_io(r, w, framing)
    }

    /// Process stdin/stdout; stdout must carry nothing but frames.
    pub fn stdio(framing: Framing) -> Self {
        Self::from_io(tokio::io::stdin(), tokio::io::stdout(), framing)
    }

    /// Two transports connected back to back, for tests and embedding.
    pub fn memory_pair(framing: Framing) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(MEMORY_PIPE_SIZE);
        (Self::from_stream(a, framing), Self::from_stream(b, framing))
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.sink.send(payload).await
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.source.recv().await
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await
    }

    /// Split so reading and writing can proceed on different tasks.
    pub fn into_parts(self) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        (self.source, self.sink)
    }
}
