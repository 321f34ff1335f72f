//! Control line grammar
//!
//! Line formats (all terminated by `\n`):
//! - `ID:<id>` server -> client, assigns the client identifier
//! - `ROOM_LIST:<names>` server -> client, comma separated room names
//! - `DATA:<sender>:<length>` server -> client, followed by `length` raw audio bytes
//! - `AUDIO:<length>` client -> server (tagged framing only), followed by `length` raw bytes
//! - `NEW:<room>`, `REQ:ROOM_LIST`, `LEAVE`, `<room>` client -> server
//!
//! Any other server line is free-form status text.

use std::fmt;
use std::str::FromStr;

use super::error::ProtocolError;

/// Longest control line accepted from the peer, excluding the terminator
pub const MAX_LINE_LEN: usize = 1024;

/// Largest audio segment a header may declare
pub const MAX_SEGMENT_LEN: usize = 1024 * 1024;

/// Room listing sent when the registry is empty
pub const NO_ROOMS_TEXT: &str = "No rooms available.";

const ID_PREFIX: &str = "ID:";
const ROOM_LIST_PREFIX: &str = "ROOM_LIST:";
const DATA_PREFIX: &str = "DATA:";
const AUDIO_PREFIX: &str = "AUDIO:";
const NEW_PREFIX: &str = "NEW:";
const JOINED_PREFIX: &str = "Joined room: ";
const LEFT_PREFIX: &str = "Left room: ";
const REQ_ROOM_LIST: &str = "REQ:ROOM_LIST";
const LEAVE: &str = "LEAVE";

/// Server-assigned participant identifier
///
/// Assigned monotonically starting at 1 and never reused within one server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How microphone audio travels from client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Each frame is preceded by an `AUDIO:<length>` header line
    #[default]
    Tagged,
    /// Raw bytes; the server guesses commands from short UTF-8 reads
    Legacy,
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tagged" => Ok(Framing::Tagged),
            "legacy" => Ok(Framing::Legacy),
            other => Err(format!("unknown framing '{}' (expected tagged or legacy)", other)),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Tagged => write!(f, "tagged"),
            Framing::Legacy => write!(f, "legacy"),
        }
    }
}

/// Command lines a client sends to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `REQ:ROOM_LIST`
    RequestRoomList,
    /// `NEW:<room>`: create the room if needed, then join it
    Create(String),
    /// `<room>`: join an existing room
    Join(String),
    /// `LEAVE`
    Leave,
}

impl ClientCommand {
    /// Parse one command line. Blank lines yield `None`.
    ///
    /// The name after `NEW:` is trimmed but may be empty; validation is left to
    /// the room registry.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line == REQ_ROOM_LIST {
            return Some(ClientCommand::RequestRoomList);
        }
        if let Some(name) = line.strip_prefix(NEW_PREFIX) {
            return Some(ClientCommand::Create(name.trim().to_string()));
        }
        if line == LEAVE {
            return Some(ClientCommand::Leave);
        }

        Some(ClientCommand::Join(line.to_string()))
    }
}

impl fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCommand::RequestRoomList => write!(f, "{}", REQ_ROOM_LIST),
            ClientCommand::Create(name) => write!(f, "{}{}", NEW_PREFIX, name),
            ClientCommand::Join(name) => write!(f, "{}", name),
            ClientCommand::Leave => write!(f, "{}", LEAVE),
        }
    }
}

/// Header announcing a relayed audio segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub sender: ClientId,
    pub len: usize,
}

/// Control lines the server sends to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    AssignedId(ClientId),
    RoomList(String),
    Audio(AudioHeader),
    Joined(String),
    Left(String),
    /// Welcome banner lines, errors and anything unrecognised
    Text(String),
}

impl ServerMessage {
    /// Classify a line received from the server
    ///
    /// Only a malformed `DATA:` header is an error, since the bytes that follow
    /// it cannot be skipped.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix(DATA_PREFIX) {
            return parse_data_header(rest)
                .map(ServerMessage::Audio)
                .ok_or_else(|| ProtocolError::MalformedHeader(trimmed.to_string()));
        }
        if let Some(rest) = trimmed.strip_prefix(ID_PREFIX) {
            if let Ok(id) = rest.trim().parse::<u64>() {
                return Ok(ServerMessage::AssignedId(ClientId(id)));
            }
        }
        if let Some(rest) = trimmed.strip_prefix(ROOM_LIST_PREFIX) {
            return Ok(ServerMessage::RoomList(rest.trim().to_string()));
        }
        if let Some(rest) = trimmed.strip_prefix(JOINED_PREFIX) {
            return Ok(ServerMessage::Joined(rest.to_string()));
        }
        if let Some(rest) = trimmed.strip_prefix(LEFT_PREFIX) {
            return Ok(ServerMessage::Left(rest.to_string()));
        }

        Ok(ServerMessage::Text(trimmed.to_string()))
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::AssignedId(id) => write!(f, "{}{}", ID_PREFIX, id),
            ServerMessage::RoomList(rooms) => write!(f, "{}{}", ROOM_LIST_PREFIX, rooms),
            ServerMessage::Audio(header) => {
                write!(f, "{}{}:{}", DATA_PREFIX, header.sender, header.len)
            }
            ServerMessage::Joined(room) => write!(f, "{}{}", JOINED_PREFIX, room),
            ServerMessage::Left(room) => write!(f, "{}{}", LEFT_PREFIX, room),
            ServerMessage::Text(text) => write!(f, "{}", text),
        }
    }
}

/// `DATA:` body: `<sender>:<length>`
fn parse_data_header(rest: &str) -> Option<AudioHeader> {
    let (sender, len) = rest.split_once(':')?;
    let sender = sender.trim().parse::<u64>().ok()?;
    let len = len.trim().parse::<usize>().ok()?;
    Some(AudioHeader {
        sender: ClientId(sender),
        len,
    })
}

/// Parse an `AUDIO:<length>` line, if that is what it is
pub(crate) fn parse_audio_tag(line: &str) -> Option<Result<usize, ProtocolError>> {
    let rest = line.trim().strip_prefix(AUDIO_PREFIX)?;
    Some(
        rest.trim()
            .parse::<usize>()
            .map_err(|_| ProtocolError::MalformedHeader(line.trim().to_string())),
    )
}

pub(crate) fn audio_tag(len: usize) -> String {
    format!("{}{}", AUDIO_PREFIX, len)
}

/// Room names as carried by `ROOM_LIST:`
pub fn format_room_list(names: &[String]) -> String {
    if names.is_empty() {
        NO_ROOMS_TEXT.to_string()
    } else {
        names.join(",")
    }
}
