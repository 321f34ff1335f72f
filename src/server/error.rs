//! Server error types

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Room registry failures, reported to the client as a status line
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid room name.")]
    InvalidName,

    #[error("Room '{0}' not found. Type 'NEW:<Name>' or 'REQ:ROOM_LIST'.")]
    RoomNotFound(String),
}

/// Errors that can occur in the relay server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    ConnectionClosed,
}
