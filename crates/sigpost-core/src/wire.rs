//! Wire envelope: explicit `{signal, payload}` frames over a byte stream.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! DATA   0x01 | stream_id u64 | signal u32 | len u32 | payload[len]
//! CLOSE  0x02 | code u64      | len u16    | reason[len] (UTF-8)
//! ```
//!
//! End of stream at a frame boundary means "no more frames"; end of stream
//! inside a frame is a truncation error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::BoxFuture;
use crate::signal::Signal;

pub use sigpost_config::limits::MAX_FRAME_PAYLOAD;

/// DATA frame tag.
pub const TAG_DATA: u8 = 0x01;
/// CLOSE frame tag.
pub const TAG_CLOSE: u8 = 0x02;

const DATA_HEADER_LEN: usize = 1 + 8 + 4 + 4;
const CLOSE_HEADER_LEN: usize = 1 + 8 + 2;

/// Disconnect reason that removes the client from the registry.
pub const TERMINATE_REASON: &str = "terminate";

/// Identifier carried by every DATA frame; names the client.
pub type StreamId = u64;

/// Errors from encoding, decoding, or moving frames.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream ended in the middle of a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("payload too large: max {max}, got {actual}")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("write side already finished")]
    Finished,
}

/// One signal plus the payload it qualifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The client this frame belongs to.
    pub stream_id: StreamId,
    /// Raw signal code as received. Use [`Envelope::signal`] to interpret it.
    pub code: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(stream_id: StreamId, signal: Signal, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            stream_id,
            code: signal.code(),
            payload: payload.into(),
        }
    }

    /// An envelope with no payload.
    pub fn bare(stream_id: StreamId, signal: Signal) -> Self {
        Self::new(stream_id, signal, Vec::new())
    }

    /// The decoded signal; unknown codes come back as [`Signal::Invalid`].
    pub fn signal(&self) -> Signal {
        Signal::decode(self.code)
    }
}

/// A frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Envelope),
    /// Disconnect notification with an integer code and a text reason.
    Close { code: u64, reason: String },
}

impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Self {
        Frame::Data(envelope)
    }
}

impl Frame {
    /// The disconnect a shutting-down client sends: its id and `"terminate"`.
    pub fn terminate(stream_id: StreamId) -> Self {
        Frame::Close {
            code: stream_id,
            reason: TERMINATE_REASON.to_string(),
        }
    }

    /// Serialize to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        match self {
            Frame::Data(env) => {
                if env.payload.len() > MAX_FRAME_PAYLOAD {
                    return Err(TransportError::PayloadTooLarge {
                        max: MAX_FRAME_PAYLOAD,
                        actual: env.payload.len(),
                    });
                }
                let mut buf = Vec::with_capacity(DATA_HEADER_LEN + env.payload.len());
                buf.push(TAG_DATA);
                buf.extend_from_slice(&env.stream_id.to_be_bytes());
                buf.extend_from_slice(&env.code.to_be_bytes());
                buf.extend_from_slice(&(env.payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(&env.payload);
                Ok(buf)
            }
            Frame::Close { code, reason } => {
                let reason_len =
                    u16::try_from(reason.len()).map_err(|_| TransportError::PayloadTooLarge {
                        max: u16::MAX as usize,
                        actual: reason.len(),
                    })?;
                let mut buf = Vec::with_capacity(CLOSE_HEADER_LEN + reason.len());
                buf.push(TAG_CLOSE);
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(&reason_len.to_be_bytes());
                buf.extend_from_slice(reason.as_bytes());
                Ok(buf)
            }
        }
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns:
    /// - `Ok(Some((frame, consumed)))` when a complete frame is available
    /// - `Ok(None)` when more bytes are needed
    /// - `Err` when the bytes can never form a valid frame
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, TransportError> {
        let Some(&tag) = buf.first() else {
            return Ok(None);
        };
        match tag {
            TAG_DATA => {
                if buf.len() < DATA_HEADER_LEN {
                    return Ok(None);
                }
                let stream_id = u64::from_be_bytes(be_array(&buf[1..9]));
                let code = u32::from_be_bytes(be_array(&buf[9..13]));
                let len = u32::from_be_bytes(be_array(&buf[13..17])) as usize;
                // Reject before waiting for bytes that would never be accepted.
                if len > MAX_FRAME_PAYLOAD {
                    return Err(TransportError::PayloadTooLarge {
                        max: MAX_FRAME_PAYLOAD,
                        actual: len,
                    });
                }
                let end = DATA_HEADER_LEN + len;
                if buf.len() < end {
                    return Ok(None);
                }
                let envelope = Envelope {
                    stream_id,
                    code,
                    payload: buf[DATA_HEADER_LEN..end].to_vec(),
                };
                Ok(Some((Frame::Data(envelope), end)))
            }
            TAG_CLOSE => {
                if buf.len() < CLOSE_HEADER_LEN {
                    return Ok(None);
                }
                let code = u64::from_be_bytes(be_array(&buf[1..9]));
                let len = u16::from_be_bytes(be_array(&buf[9..11])) as usize;
                let end = CLOSE_HEADER_LEN + len;
                if buf.len() < end {
                    return Ok(None);
                }
                let reason = String::from_utf8_lossy(&buf[CLOSE_HEADER_LEN..end]).into_owned();
                Ok(Some((Frame::Close { code, reason }, end)))
            }
            other => Err(TransportError::UnknownTag(other)),
        }
    }
}

/// Copy a slice whose length the caller has already checked into an array.
fn be_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Anything that accepts outbound frames.
///
/// Object-safe so the state machines can be driven against a socket, an
/// in-memory pipe, or a plain `Vec<Frame>` in tests.
pub trait FrameSink: Send {
    /// Send one frame.
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Signal that no more frames will follow.
    fn finish(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Whether `send` can still succeed.
    fn is_open(&self) -> bool {
        true
    }
}

/// Records frames in memory; `finish` is a no-op.
impl FrameSink for Vec<Frame> {
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>> {
        self.push(frame);
        Box::pin(async { Ok(()) })
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Reads frames from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Next frame, or `None` once the peer has finished sending.
    pub async fn next(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some((frame, consumed)) = Frame::decode(&self.buf)? {
                self.buf.drain(..consumed);
                return Ok(Some(frame));
            }
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Truncated {
                    buffered: self.buf.len(),
                });
            }
        }
    }
}

/// Writes frames to an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
    finished: bool,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// Whether the write side has been shut down.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.finished {
            return Err(TransportError::Finished);
        }
        let bytes = frame.encode()?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if !self.finished {
            self.finished = true;
            self.inner.shutdown().await?;
        }
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin + Send> FrameSink for FrameWriter<W> {
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.write_frame(frame))
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.shutdown())
    }

    fn is_open(&self) -> bool {
        !self.finished
    }
}
