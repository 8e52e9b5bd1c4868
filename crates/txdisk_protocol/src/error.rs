//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while moving frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame announced a length above [`MAX_FRAME_LEN`](crate::MAX_FRAME_LEN).
    #[error("frame of {len} bytes exceeds the limit of {max}")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
        /// Accepted maximum.
        max: usize,
    },

    /// The stream ended inside a frame.
    #[error("stream ended inside a frame")]
    Truncated,

    /// A message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// A frame body is not a valid message.
    #[error("decode error: {0}")]
    Decode(String),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
