//! Inbound dispatcher
//!
//! Reads the server stream, hands control lines to the UI layer and audio to
//! the per-sender playback engines.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncBufRead;
use tracing::{debug, info, trace, warn};

use crate::protocol::{ClientId, FrameReader, ServerEvent, ServerMessage};

use super::error::ClientError;
use super::playback::PlaybackRegistry;

/// Callbacks into the user interface
///
/// Called from the dispatcher task; implementations must not block.
pub trait ClientEvents: Send + Sync {
    /// Welcome text, errors and any other status line
    fn on_control_line(&self, line: &str);

    /// Body of a `ROOM_LIST:` line
    fn on_room_list(&self, rooms: &str);

    fn on_joined(&self, room: &str);

    fn on_left(&self, _room: &str) {}

    fn on_assigned_id(&self, _id: ClientId) {}

    /// The server stream ended or failed
    fn on_disconnected(&self) {}
}

/// Routes everything the server sends
pub struct InboundDispatcher<R> {
    reader: FrameReader<R>,
    events: Arc<dyn ClientEvents>,
    playback: Arc<Mutex<PlaybackRegistry>>,
}

impl<R> InboundDispatcher<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(
        reader: R,
        events: Arc<dyn ClientEvents>,
        playback: Arc<Mutex<PlaybackRegistry>>,
    ) -> Self {
        Self {
            reader: FrameReader::new(reader),
            events,
            playback,
        }
    }

    /// Dispatch until the stream ends or breaks
    ///
    /// On the way out every playback engine is stopped and its buffer discarded.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let result = self.dispatch_all().await;

        self.playback.lock().stop_all();
        match &result {
            Ok(()) => info!("Server closed the connection"),
            Err(e) => warn!("Connection lost: {}", e),
        }
        self.events.on_disconnected();

        result
    }

    async fn dispatch_all(&mut self) -> Result<(), ClientError> {
        while let Some(event) = self.reader.read_server_event().await? {
            match event {
                ServerEvent::Audio { sender, payload } => {
                    trace!("Audio frame of {} bytes from client {}", payload.len(), sender);
                    self.playback.lock().push(sender, payload);
                }
                ServerEvent::Control(message) => self.dispatch_control(message),
            }
        }
        Ok(())
    }

    fn dispatch_control(&self, message: ServerMessage) {
        match message {
            ServerMessage::AssignedId(id) => {
                info!("Assigned client id {}", id);
                self.events.on_assigned_id(id);
            }
            ServerMessage::RoomList(rooms) => self.events.on_room_list(&rooms),
            ServerMessage::Joined(room) => {
                info!("Joined room '{}'", room);
                self.events.on_joined(&room);
            }
            ServerMessage::Left(room) => {
                info!("Left room '{}'", room);
                self.events.on_left(&room);
            }
            ServerMessage::Text(text) => {
                if !text.is_empty() {
                    self.events.on_control_line(&text);
                }
            }
            ServerMessage::Audio(header) => {
                // The reader always consumes DATA headers together with their payload
                debug!("Unexpected bare audio header from client {}", header.sender);
            }
        }
    }
}
