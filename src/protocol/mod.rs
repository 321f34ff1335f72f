//! Wire protocol shared by the relay server and its clients
//!
//! One TCP stream per client carries newline-terminated control lines and
//! length-prefixed binary audio segments.

mod codec;
mod error;
mod message;

pub use codec::{ClientFrame, FrameReader, ServerEvent, ServerFrame};
pub use error::ProtocolError;
pub use message::{
    format_room_list, AudioHeader, ClientCommand, ClientId, Framing, ServerMessage,
    MAX_LINE_LEN, MAX_SEGMENT_LEN, NO_ROOMS_TEXT,
};
