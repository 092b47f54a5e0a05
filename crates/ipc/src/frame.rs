//! The wire frame: `"jidl"` magic, one status byte, a little-endian u16
//! body length, and a UTF-8 JSON body.

use byteorder::{
    ByteOrder,
    LittleEndian,
};
use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use serde_json::Value as JsonValue;
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
};

use crate::status::StatusCode;

pub const MAGIC: [u8; 4] = *b"jidl";

/// Upper bound on a whole frame, header included.
pub const MAX_SIZE: usize = 65_536;

pub const HEADER_LEN: usize = MAGIC.len() + 1 + 2;

/// Decoder and encoder failure taxonomy. Each failure maps to the bad
/// response status a server sends back.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("unrecognized protocol magic")]
    UnrecognizedProtocol,
    #[error("incomplete frame data")]
    IncompleteData,
    #[error("invalid status code {0:#04x}")]
    InvalidStatusCode(u8),
    #[error("frame body is not valid JSON")]
    InvalidBody,
    #[error("frame exceeds {MAX_SIZE} bytes")]
    BufferOverflow,
}

impl FrameError {
    pub fn status(&self) -> StatusCode {
        match self {
            FrameError::UnrecognizedProtocol => StatusCode::UnrecognizedProtocol,
            FrameError::IncompleteData => StatusCode::IncompleteData,
            FrameError::InvalidStatusCode(_) => StatusCode::InvalidStatusCode,
            FrameError::InvalidBody => StatusCode::InvalidBody,
            FrameError::BufferOverflow => StatusCode::BufferOverflow,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub status: StatusCode,
    pub body: JsonValue,
}

impl Frame {
    pub fn new(status: StatusCode, body: JsonValue) -> Self {
        Self { status, body }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let body = serde_json::to_vec(&self.body).map_err(|_| FrameError::InvalidBody)?;
        if HEADER_LEN + body.len() > MAX_SIZE {
            return Err(FrameError::BufferOverflow);
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_slice(&MAGIC);
        buf.put_u8(self.status.as_byte());
        buf.put_u16_le(body.len() as u16);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decodes one complete frame from a byte slice.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MAGIC.len() {
            return Err(FrameError::IncompleteData);
        }
        if bytes[..MAGIC.len()] != MAGIC {
            return Err(FrameError::UnrecognizedProtocol);
        }
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::IncompleteData);
        }
        let status = StatusCode::from_byte(bytes[4])
            .ok_or(FrameError::InvalidStatusCode(bytes[4]))?;
        let body_len = LittleEndian::read_u16(&bytes[5..7]) as usize;
        if HEADER_LEN + body_len > MAX_SIZE {
            return Err(FrameError::BufferOverflow);
        }
        let body_bytes = bytes
            .get(HEADER_LEN..HEADER_LEN + body_len)
            .ok_or(FrameError::IncompleteData)?;
        let body = serde_json::from_slice(body_bytes).map_err(|_| FrameError::InvalidBody)?;
        Ok(Self { status, body })
    }
}

/// Reads one frame off the stream. Frame-shaped failures come back as
/// [`FrameError`] inside the chain so a server can answer with the matching
/// bad status.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Frame> {
    let mut magic = [0u8; MAGIC.len()];
    read_fully(reader, &mut magic).await?;
    if magic != MAGIC {
        anyhow::bail!(FrameError::UnrecognizedProtocol);
    }
    let mut rest = [0u8; 3];
    read_fully(reader, &mut rest).await?;
    let status = StatusCode::from_byte(rest[0]).ok_or(FrameError::InvalidStatusCode(rest[0]))?;
    let body_len = LittleEndian::read_u16(&rest[1..3]) as usize;
    if HEADER_LEN + body_len > MAX_SIZE {
        anyhow::bail!(FrameError::BufferOverflow);
    }
    let mut body_bytes = vec![0u8; body_len];
    read_fully(reader, &mut body_bytes).await?;
    let body = serde_json::from_slice(&body_bytes).map_err(|_| FrameError::InvalidBody)?;
    Ok(Frame { status, body })
}

/// One frame per write; flushed immediately.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> anyhow::Result<()> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_fully<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> anyhow::Result<()> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            anyhow::Error::from(FrameError::IncompleteData)
        } else {
            e.into()
        }
    })?;
    Ok(())
}
