//! huddle - Room-based voice relay
//!
//! A TCP relay server that groups clients into named rooms and forwards each
//! participant's raw PCM audio to everyone else in the room, plus the client
//! side that captures, sends, buffers and plays that audio.

pub mod audio;
pub mod client;
pub mod protocol;
pub mod server;

pub use audio::{AudioBackend, AudioConfig, CpalBackend};
pub use client::{ClientConfig, ClientSession};
pub use protocol::{ClientCommand, ClientId, Framing};
pub use server::{RelayServer, ServerConfig};
