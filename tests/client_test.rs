//! End-to-end tests: client sessions talking through a real relay server
//!
//! Audio devices are replaced by an in-memory backend: each microphone emits
//! frames filled with one marker byte and each speaker records what it plays.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use huddle::audio::{AudioBackend, AudioConfig, AudioError, FrameSink, FrameSource};
use huddle::client::{ClientConfig, ClientEvents, ClientSession};
use huddle::protocol::{ClientCommand, ClientId, Framing};
use huddle::server::{RelayServer, RoomRegistry, ServerConfig};

const STEP_TIMEOUT: Duration = Duration::from_secs(3);

type Played = Arc<Mutex<Vec<(ClientId, Vec<u8>)>>>;

struct MarkerSource {
    marker: u8,
}

impl FrameSource for MarkerSource {
    fn read_frame(&mut self, len: usize) -> Result<Vec<u8>, AudioError> {
        thread::sleep(Duration::from_millis(5));
        Ok(vec![self.marker; len])
    }
}

struct RecordingSink {
    sender: ClientId,
    played: Played,
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), AudioError> {
        self.played.lock().push((self.sender, frame.to_vec()));
        thread::sleep(Duration::from_millis(5));
        Ok(())
    }
}

struct MemoryBackend {
    marker: u8,
    played: Played,
}

impl MemoryBackend {
    fn new(marker: u8) -> Arc<Self> {
        Arc::new(Self {
            marker,
            played: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn heard(&self, sender: ClientId, marker: u8) -> bool {
        self.played
            .lock()
            .iter()
            .any(|(s, f)| *s == sender && !f.is_empty() && f.iter().all(|&b| b == marker))
    }
}

impl AudioBackend for MemoryBackend {
    fn open_source(&self) -> Result<Box<dyn FrameSource>, AudioError> {
        Ok(Box::new(MarkerSource {
            marker: self.marker,
        }))
    }

    fn open_sink(&self, sender: ClientId) -> Result<Box<dyn FrameSink>, AudioError> {
        Ok(Box::new(RecordingSink {
            sender,
            played: self.played.clone(),
        }))
    }
}

#[derive(Debug, PartialEq)]
enum Event {
    Line(String),
    Rooms(String),
    Joined(String),
    Left(String),
    Id(ClientId),
    Disconnected,
}

struct ChannelEvents {
    tx: mpsc::UnboundedSender<Event>,
}

impl ClientEvents for ChannelEvents {
    fn on_control_line(&self, line: &str) {
        let _ = self.tx.send(Event::Line(line.to_string()));
    }

    fn on_room_list(&self, rooms: &str) {
        let _ = self.tx.send(Event::Rooms(rooms.to_string()));
    }

    fn on_joined(&self, room: &str) {
        let _ = self.tx.send(Event::Joined(room.to_string()));
    }

    fn on_left(&self, room: &str) {
        let _ = self.tx.send(Event::Left(room.to_string()));
    }

    fn on_assigned_id(&self, id: ClientId) {
        let _ = self.tx.send(Event::Id(id));
    }

    fn on_disconnected(&self) {
        let _ = self.tx.send(Event::Disconnected);
    }
}

struct TestClient {
    session: ClientSession,
    events: mpsc::UnboundedReceiver<Event>,
    backend: Arc<MemoryBackend>,
}

impl TestClient {
    async fn connect(server: &str, framing: Framing, marker: u8) -> Self {
        let backend = MemoryBackend::new(marker);
        let (tx, events) = mpsc::unbounded_channel();
        let config = ClientConfig {
            server_addr: server.to_string(),
            framing,
            audio: AudioConfig {
                sample_rate: 8000,
                channels: 1,
                frame_size: 32,
            },
            poll_interval: Duration::from_millis(2),
            ..Default::default()
        };
        let callbacks = Arc::new(ChannelEvents { tx });
        let session = ClientSession::connect(config, backend.clone(), callbacks)
            .await
            .expect("Failed to connect");
        Self {
            session,
            events,
            backend,
        }
    }

    async fn next_event(&mut self) -> Event {
        timeout(STEP_TIMEOUT, self.events.recv())
            .await
            .expect("Timed out waiting for an event")
            .expect("Event channel closed")
    }

    /// Skip banner lines until something else arrives
    async fn next_non_text(&mut self) -> Event {
        loop {
            match self.next_event().await {
                Event::Line(_) => continue,
                other => return other,
            }
        }
    }

    /// Send a join or create, then start streaming once the server confirms
    async fn enter(&mut self, command: ClientCommand, room: &str) -> ClientId {
        self.session.send_command(command).await.unwrap();
        assert_eq!(self.next_non_text().await, Event::Joined(room.to_string()));
        let id = match self.next_non_text().await {
            Event::Id(id) => id,
            other => panic!("Expected id, got {:?}", other),
        };
        self.session.start_streaming().unwrap();
        id
    }
}

async fn start_server() -> (String, RoomRegistry) {
    let server = RelayServer::bind(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    })
    .await
    .expect("Failed to bind relay server");
    let addr = server.local_addr().to_string();
    let registry = server.registry();
    tokio::spawn(server.run());
    (addr, registry)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Timed out waiting for condition"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Test: Two participants hear each other
/// Given A created room "demo" and B joined it
/// When both stream their microphones
/// Then each plays the other's audio and never its own
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_clients_hear_each_other() {
    let (addr, _registry) = start_server().await;

    let mut a = TestClient::connect(&addr, Framing::Tagged, 0xA1).await;
    let id_a = a.enter(ClientCommand::Create("demo".into()), "demo").await;
    let mut b = TestClient::connect(&addr, Framing::Tagged, 0xB2).await;
    let id_b = b.enter(ClientCommand::Join("demo".into()), "demo").await;

    let (a_backend, b_backend) = (a.backend.clone(), b.backend.clone());
    wait_until(|| b_backend.heard(id_a, 0xA1) && a_backend.heard(id_b, 0xB2)).await;

    assert!(!a.backend.heard(id_a, 0xA1));
    assert_eq!(b.session.active_senders(), vec![id_a]);
    assert!(b
        .session
        .playback_stats(id_a)
        .is_some_and(|s| s.frames_received > 0));

    a.session.close().await;
    b.session.close().await;
}

/// Test: Legacy clients interoperate through a legacy server
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_legacy_framing_session() {
    let server = RelayServer::bind(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        framing: Framing::Legacy,
        ..Default::default()
    })
    .await
    .unwrap();
    let addr = server.local_addr().to_string();
    tokio::spawn(server.run());

    let mut a = TestClient::connect(&addr, Framing::Legacy, 0x11).await;
    let id_a = a.enter(ClientCommand::Create("old".into()), "old").await;
    let mut b = TestClient::connect(&addr, Framing::Legacy, 0x22).await;
    b.enter(ClientCommand::Join("old".into()), "old").await;

    let b_backend = b.backend.clone();
    wait_until(|| b_backend.heard(id_a, 0x11)).await;

    a.session.close().await;
    b.session.close().await;
}

/// Test: Leaving a room
/// Given A and B streaming in one room
/// When B leaves
/// Then B stops playing, gets a `Left room` line and the room keeps only A
/// And the connection stays usable with nothing but the leave confirmation in between
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leave_stops_playback() {
    let (addr, registry) = start_server().await;

    let mut a = TestClient::connect(&addr, Framing::Tagged, 0xA1).await;
    let id_a = a.enter(ClientCommand::Create("demo".into()), "demo").await;
    let mut b = TestClient::connect(&addr, Framing::Tagged, 0xB2).await;
    b.enter(ClientCommand::Join("demo".into()), "demo").await;

    let b_backend = b.backend.clone();
    wait_until(|| b_backend.heard(id_a, 0xA1)).await;

    // Drop the banner and join confirmation so the next event is the leave reply
    while let Ok(event) = b.events.try_recv() {
        assert!(matches!(event, Event::Line(_)), "Unexpected event {:?}", event);
    }

    b.session.leave().await.unwrap();
    assert_eq!(b.next_event().await, Event::Left("demo".into()));
    assert!(!b.session.is_streaming());
    assert!(b.session.is_connected());
    assert!(b.session.active_senders().is_empty());
    wait_until(|| registry.members("demo") == Some(vec![id_a])).await;

    // Still connected and back at room selection
    b.session
        .send_command(ClientCommand::RequestRoomList)
        .await
        .unwrap();
    assert_eq!(b.next_event().await, Event::Rooms("demo".into()));
    assert!(b.session.is_connected());

    a.session.close().await;
    b.session.close().await;
}

/// Test: Server going away
/// When the last peer of a client disconnects and the server shuts down
/// Then the client is told it was disconnected
#[tokio::test]
async fn test_disconnect_is_reported() {
    let server = RelayServer::bind(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    })
    .await
    .unwrap();
    let addr = server.local_addr().to_string();
    let shutdown = server.shutdown_handle();
    tokio::spawn(server.run());

    let mut a = TestClient::connect(&addr, Framing::Tagged, 0xA1).await;
    assert_eq!(
        a.next_event().await,
        Event::Line("Available rooms:".into())
    );

    shutdown.shutdown();
    assert_eq!(a.next_non_text().await, Event::Disconnected);
    wait_until(|| !a.session.is_connected()).await;
}
