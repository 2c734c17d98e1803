//! Error types for frame decoding and message handling.

use std::io;

/// Alias for `Result<T, stoic_proto::ProtoError>`.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors raised while reading or writing protocol frames.
///
/// Every variant except [`ProtoError::Closed`] leaves the connection in an
/// unknown state; callers tear the session down rather than resynchronize.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// The peer closed the stream cleanly before the first byte of a frame.
    #[error("stream closed by peer")]
    Closed,

    /// The stream ended partway through a frame.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame {
        /// Bytes the frame header promised.
        expected: usize,
        /// Bytes actually available before end-of-stream.
        actual: usize,
    },

    /// The size field is smaller than the fixed header it must cover.
    #[error("invalid frame size {0}")]
    InvalidSize(u32),

    /// The size field exceeds [`MAX_FRAME`](crate::MAX_FRAME).
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(u32),

    /// The payload tag does not name any known message type.
    #[error("unknown payload tag {0}")]
    UnknownPayloadTag(u32),

    /// A structured payload could not be encoded or decoded.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O error from the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtoError {
    /// Returns `true` if the peer hung up between frames.
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<ProtoError> for io::Error {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::Io(inner) => inner,
            eof @ (ProtoError::Closed | ProtoError::TruncatedFrame { .. }) => {
                Self::new(io::ErrorKind::UnexpectedEof, eof)
            }
            other => Self::new(io::ErrorKind::InvalidData, other),
        }
    }
}
