//! Per-connection state machine
//!
//! Welcoming -> Selecting -> Relaying -> Closed. `LEAVE` while relaying drops
//! back to Selecting on the same connection.

use std::sync::Arc;

use tokio::io::AsyncBufRead;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::protocol::{
    ClientCommand, ClientFrame, FrameReader, Framing, ServerFrame, ServerMessage, NO_ROOMS_TEXT,
};

use super::error::ServerError;
use super::listener::ServerConfig;
use super::registry::{JoinRequest, Membership, OutboundTx, RoomRegistry};

const NOT_IN_ROOM_TEXT: &str = "Not in a room.";

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Welcoming,
    Selecting,
    Relaying,
    Closed,
}

/// Drives one client connection until it closes
pub struct ConnectionHandler<R> {
    reader: FrameReader<R>,
    outbound: OutboundTx,
    registry: RoomRegistry,
    config: Arc<ServerConfig>,
    state: HandlerState,
    membership: Option<Membership>,
    peer: String,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(
        reader: R,
        outbound: OutboundTx,
        registry: RoomRegistry,
        config: Arc<ServerConfig>,
        peer: String,
    ) -> Self {
        Self {
            reader: FrameReader::new(reader),
            outbound,
            registry,
            config,
            state: HandlerState::Welcoming,
            membership: None,
            peer,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Run until end of stream, an I/O or protocol error, or server shutdown
    ///
    /// The participant (if any) is removed from its room exactly once on the way out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let peer = self.peer.clone();
        let result = tokio::select! {
            result = self.drive() => result,
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("Closing connection {} for shutdown", peer);
                Ok(())
            }
        };

        self.close();
        result
    }

    async fn drive(&mut self) -> Result<(), ServerError> {
        loop {
            match self.state {
                HandlerState::Welcoming => {
                    let banner = welcome_banner(&self.registry.room_names());
                    self.send(ServerFrame::Raw(banner)).await?;
                    self.state = HandlerState::Selecting;
                }
                HandlerState::Selecting => self.select_step().await?,
                HandlerState::Relaying => match self.config.framing {
                    Framing::Tagged => self.relay_tagged_step().await?,
                    Framing::Legacy => self.relay_legacy_step().await?,
                },
                HandlerState::Closed => return Ok(()),
            }
        }
    }

    async fn select_step(&mut self) -> Result<(), ServerError> {
        let command = match self.config.framing {
            Framing::Tagged => match self.reader.read_client_frame().await? {
                Some(ClientFrame::Command(command)) => Some(command),
                Some(ClientFrame::Audio(payload)) => {
                    // Microphone frames still in flight after a LEAVE
                    debug!(
                        "Discarding {} audio bytes from {} outside a room",
                        payload.len(),
                        self.peer
                    );
                    return Ok(());
                }
                None => None,
            },
            Framing::Legacy => match self.reader.read_line().await? {
                Some(line) => match ClientCommand::parse(&line) {
                    Some(command) => Some(command),
                    None => return Ok(()),
                },
                None => None,
            },
        };

        let command = match command {
            Some(command) => command,
            None => {
                debug!("Connection {} closed before joining a room", self.peer);
                self.state = HandlerState::Closed;
                return Ok(());
            }
        };

        match command {
            ClientCommand::RequestRoomList => self.send_room_list().await,
            ClientCommand::Leave => self.send_text(NOT_IN_ROOM_TEXT).await,
            ClientCommand::Create(name) => self.try_join(JoinRequest::Create(name)).await,
            ClientCommand::Join(name) => self.try_join(JoinRequest::Existing(name)).await,
        }
    }

    async fn try_join(&mut self, request: JoinRequest) -> Result<(), ServerError> {
        match self.registry.join(request, self.outbound.clone()) {
            Ok(membership) => {
                let room = membership.room.clone();
                let id = membership.id;
                self.membership = Some(membership);
                self.state = HandlerState::Relaying;

                self.send(ServerFrame::Line(ServerMessage::Joined(room))).await?;
                self.send(ServerFrame::Line(ServerMessage::AssignedId(id)))
                    .await
            }
            Err(e) => {
                debug!("Join rejected for {}: {}", self.peer, e);
                self.send_text(&e.to_string()).await
            }
        }
    }

    async fn relay_tagged_step(&mut self) -> Result<(), ServerError> {
        match self.reader.read_client_frame().await? {
            None => {
                self.state = HandlerState::Closed;
                Ok(())
            }
            Some(ClientFrame::Audio(payload)) => {
                self.relay(&payload);
                Ok(())
            }
            Some(ClientFrame::Command(command)) => self.relay_command(command).await,
        }
    }

    /// Compatibility path: short UTF-8 reads may be commands, everything else is audio
    async fn relay_legacy_step(&mut self) -> Result<(), ServerError> {
        let chunk = match self.reader.read_chunk(self.config.relay_chunk_size).await? {
            Some(chunk) => chunk,
            None => {
                self.state = HandlerState::Closed;
                return Ok(());
            }
        };

        match legacy_command(&chunk, self.config.legacy_text_limit) {
            Some(command) => self.relay_command(command).await,
            None => {
                self.relay(&chunk);
                Ok(())
            }
        }
    }

    async fn relay_command(&mut self, command: ClientCommand) -> Result<(), ServerError> {
        match command {
            ClientCommand::RequestRoomList => self.send_room_list().await,
            ClientCommand::Leave => self.leave().await,
            ClientCommand::Create(_) | ClientCommand::Join(_) => {
                let room = self
                    .membership
                    .as_ref()
                    .map(|m| m.room.clone())
                    .unwrap_or_default();
                self.send_text(&format!(
                    "Already in room '{}'. Send LEAVE first.",
                    room
                ))
                .await
            }
        }
    }

    fn relay(&self, payload: &[u8]) {
        if let Some(membership) = &self.membership {
            self.registry.broadcast(membership, payload);
        }
    }

    async fn leave(&mut self) -> Result<(), ServerError> {
        self.state = HandlerState::Selecting;
        match self.membership.take() {
            Some(membership) => {
                self.registry.leave(&membership);
                self.send(ServerFrame::Line(ServerMessage::Left(membership.room)))
                    .await
            }
            None => self.send_text(NOT_IN_ROOM_TEXT).await,
        }
    }

    fn close(&mut self) {
        if let Some(membership) = self.membership.take() {
            self.registry.leave(&membership);
            info!(
                "Client {} disconnected from room '{}'",
                membership.id, membership.room
            );
        }
        self.state = HandlerState::Closed;
    }

    async fn send_room_list(&self) -> Result<(), ServerError> {
        let rooms = self.registry.list_rooms();
        self.send(ServerFrame::Line(ServerMessage::RoomList(rooms)))
            .await
    }

    async fn send_text(&self, text: &str) -> Result<(), ServerError> {
        self.send(ServerFrame::Line(ServerMessage::Text(text.to_string())))
            .await
    }

    async fn send(&self, frame: ServerFrame) -> Result<(), ServerError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ServerError::ConnectionClosed)
    }
}

/// Resolves once shutdown is requested or the server is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Size-based guess used by legacy framing
fn legacy_command(chunk: &[u8], limit: usize) -> Option<ClientCommand> {
    if chunk.len() >= limit {
        return None;
    }
    let text = std::str::from_utf8(chunk).ok()?;
    match ClientCommand::parse(text)? {
        command @ (ClientCommand::RequestRoomList | ClientCommand::Leave) => Some(command),
        _ => None,
    }
}

fn welcome_banner(rooms: &[String]) -> String {
    let listing = if rooms.is_empty() {
        NO_ROOMS_TEXT.to_string()
    } else {
        rooms.join("\n")
    };
    format!(
        "Available rooms:\n{}\n\nType an existing room name to join it, \
         or type 'NEW:<RoomName>' to create a new room, \
         or 'REQ:ROOM_LIST' to refresh the room list.\n",
        listing
    )
}
