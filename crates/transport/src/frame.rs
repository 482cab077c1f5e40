//! Binary wire frame: `[type:u8][length:u32 big-endian][payload:length bytes]`

use bytes::{Buf, BytesMut};

use crate::TransportError;

/// Frame types for the binary framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x01,
    Control = 0x02,
    Heartbeat = 0x03,
    Error = 0x04,
    Close = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = TransportError;
    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Control),
            0x03 => Ok(Self::Heartbeat),
            0x04 => Ok(Self::Error),
            0x05 => Ok(Self::Close),
            _ => Err(TransportError::Malformed(format!(
                "unknown frame type 0x{:02x}",
                value
            ))),
        }
    }
}

/// Maximum payload size of one unit: 16 MiB
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
pub(crate) const HEADER_SIZE: usize = 5;

/// One framed unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_type: FrameType::Data,
            payload: payload.into(),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            frame_type: FrameType::Heartbeat,
            payload: Vec::new(),
        }
    }

    /// Error frame carrying a UTF-8 reason
    pub fn error(message: &str) -> Self {
        Self {
            frame_type: FrameType::Error,
            payload: message.as_bytes().to_vec(),
        }
    }

    pub fn close() -> Self {
        Self {
            frame_type: FrameType::Close,
            payload: Vec::new(),
        }
    }

    /// Encode this frame for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::Malformed(format!(
                "payload too large: {} bytes (max {})",
                self.payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is still
    /// incomplete. The header is validated as soon as it is available, so an
    /// oversized or unknown frame fails before its payload arrives.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TransportError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let frame_type = FrameType::try_from(buf[0])?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(TransportError::Malformed(format!(
                "payload too large: {} bytes (max {})",
                len, MAX_PAYLOAD_SIZE
            )));
        }
        if buf.len() < HEADER_SIZE + len {
            buf.reserve(HEADER_SIZE + len - buf.len());
            return Ok(None);
        }
        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(len).to_vec();
        Ok(Some(Self {
            frame_type,
            payload,
        }))
    }
}
