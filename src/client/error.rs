//! Client error types

use thiserror::Error;

use crate::audio::AudioError;
use crate::protocol::ProtocolError;

/// Errors that can occur in the client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Connection closed")]
    ConnectionClosed,
}
