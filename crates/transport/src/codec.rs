//! Reader and writer halves that turn a byte stream into framed units.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{Frame, FrameType, MAX_PAYLOAD_SIZE};
use crate::{FrameSink, FrameSource, TransportError};

const READ_CHUNK: usize = 8 * 1024;

/// How units are delimited on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One JSON document per `\n`-terminated line.
    #[default]
    Lines,
    /// Length-prefixed [`Frame`]s.
    Binary,
}

impl Framing {
    /// Pull one unit off the front of `buf`, if a complete one is buffered.
    ///
    /// `scanned` counts leading bytes of `buf` already known to hold no
    /// newline, so a long line arriving in many reads is searched once.
    fn decode(
        &self,
        buf: &mut BytesMut,
        scanned: &mut usize,
    ) -> Result<Option<Frame>, TransportError> {
        match self {
            Framing::Binary => Frame::decode(buf),
            Framing::Lines => loop {
                let Some(offset) = buf[*scanned..].iter().position(|b| *b == b'\n') else {
                    *scanned = buf.len();
                    if buf.len() > MAX_PAYLOAD_SIZE {
                        return Err(TransportError::Malformed(format!(
                            "line exceeds {} bytes",
                            MAX_PAYLOAD_SIZE
                        )));
                    }
                    return Ok(None);
                };
                let pos = *scanned + offset;
                *scanned = 0;
                let line = buf.split_to(pos + 1);
                if let Some(frame) = line_frame(&line[..pos])? {
                    return Ok(Some(frame));
                }
            },
        }
    }
}

/// Blank lines are keep-alives and carry no unit.
fn line_frame(line: &[u8]) -> Result<Option<Frame>, TransportError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = std::str::from_utf8(line)
        .map_err(|e| TransportError::Malformed(format!("line is not valid UTF-8: {}", e)))?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(Frame::data(line.to_vec())))
}

/// Buffers partial reads until a whole unit is available.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    /// Prefix of `buf` searched for a line end without finding one
    scanned: usize,
    framing: Framing,
    done: bool,
}

impl<R> std::fmt::Debug for FrameReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("framing", &self.framing)
            .field("buffered", &self.buf.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
            framing,
            done: false,
        }
    }

    /// Read the next complete frame; `Ok(None)` on a clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.done {
            return Ok(None);
        }
        loop {
            if let Some(frame) = self.framing.decode(&mut self.buf, &mut self.scanned)? {
                return Ok(Some(frame));
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n > 0 {
                continue;
            }
            self.done = true;
            if self.buf.is_empty() {
                return Ok(None);
            }
            return match self.framing {
                // An unterminated final line is still one unit.
                Framing::Lines => {
                    let rest = self.buf.split();
                    line_frame(&rest)
                }
                Framing::Binary => Err(TransportError::Malformed(format!(
                    "truncated frame: {} bytes left at end of stream",
                    self.buf.len()
                ))),
            };
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for FrameReader<R> {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let Some(frame) = self.read_frame().await? else {
                return Ok(None);
            };
            match frame.frame_type {
                FrameType::Data => return Ok(Some(frame.payload)),
                FrameType::Heartbeat | FrameType::Control => {
                    tracing::trace!(frame_type = ?frame.frame_type, "Skipping non-data frame");
                }
                FrameType::Close => {
                    self.done = true;
                    return Ok(None);
                }
                FrameType::Error => {
                    self.done = true;
                    return Err(TransportError::Remote(
                        String::from_utf8_lossy(&frame.payload).into_owned(),
                    ));
                }
            }
        }
    }
}

/// Writes one unit at a time and flushes after each.
pub struct FrameWriter<W> {
    writer: W,
    framing: Framing,
    closed: bool,
}

impl<W> std::fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("framing", &self.framing)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(writer: W, framing: Framing) -> Self {
        Self {
            writer,
            framing,
            closed: false,
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let bytes = frame.encode()?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_line(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if payload.contains(&b'\n') {
            return Err(TransportError::Malformed(
                "payload contains a raw newline".to_string(),
            ));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::Malformed(format!(
                "payload too large: {} bytes (max {})",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for FrameWriter<W> {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        match self.framing {
            Framing::Lines => self.write_line(payload).await,
            Framing::Binary => self.write_frame(&Frame::data(payload.to_vec())).await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        if self.framing == Framing::Binary {
            self.write_frame(&Frame::close()).await?;
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }
}
