//! Protocol error types

use thiserror::Error;

/// Errors raised while reading or writing the framing protocol
///
/// Every variant is fatal to the connection it occurred on: the stream cannot be
/// resynchronised once a header or segment has been mangled.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed before {expected} declared audio bytes arrived")]
    ShortAudioSegment { expected: usize },

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Audio segment of {len} bytes exceeds limit of {max} bytes")]
    SegmentTooLarge { len: usize, max: usize },

    #[error("Control line exceeds {0} bytes")]
    LineTooLong(usize),
}
