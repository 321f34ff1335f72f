//! Relay server
//!
//! Accepts client connections, runs the room join protocol against a shared
//! registry and fans each participant's audio out to the rest of its room.

mod error;
mod handler;
mod listener;
mod registry;

pub use error::{RegistryError, ServerError};
pub use handler::{ConnectionHandler, HandlerState};
pub use listener::{RelayServer, ServerConfig, ShutdownHandle};
pub use registry::{BroadcastReport, JoinRequest, Membership, OutboundTx, RoomRegistry};
