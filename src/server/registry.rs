//! Room registry: room name -> ordered participants
//!
//! A single mutex guards every room, the membership lists and the identifier
//! counter. Nothing inside the lock touches a socket: each participant owns a
//! bounded queue drained by its connection's writer task, and broadcast only
//! enqueues.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{format_room_list, ClientId, ServerFrame};

use super::error::RegistryError;

/// Queue feeding one connection's writer task
pub type OutboundTx = mpsc::Sender<ServerFrame>;

/// How a client asked to enter a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRequest {
    /// `NEW:<name>`: create on demand, then join
    Create(String),
    /// `<name>`: the room must already exist
    Existing(String),
}

/// A joined client's handle on its room membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room: String,
    pub id: ClientId,
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers whose queue accepted the frame
    pub delivered: usize,
    /// Peers whose queue was full or closed
    pub failed: usize,
}

struct Participant {
    id: ClientId,
    outbound: OutboundTx,
}

#[derive(Default)]
struct Room {
    participants: Vec<Participant>,
}

struct RegistryState {
    rooms: BTreeMap<String, Room>,
    next_id: u64,
}

/// Thread-safe registry of rooms and their participants
///
/// Cloning shares the same registry.
#[derive(Clone)]
pub struct RoomRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                rooms: BTreeMap::new(),
                next_id: 1,
            })),
        }
    }

    /// Room names in registry order
    pub fn room_names(&self) -> Vec<String> {
        self.state.lock().rooms.keys().cloned().collect()
    }

    /// Room listing as sent after `ROOM_LIST:`
    pub fn list_rooms(&self) -> String {
        format_room_list(&self.room_names())
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    pub fn contains_room(&self, name: &str) -> bool {
        self.state.lock().rooms.contains_key(name)
    }

    /// Participant ids of a room in join order
    pub fn members(&self, name: &str) -> Option<Vec<ClientId>> {
        self.state
            .lock()
            .rooms
            .get(name)
            .map(|room| room.participants.iter().map(|p| p.id).collect())
    }

    /// Create (if requested) and join a room in one critical section
    ///
    /// The new participant is appended to the room's list and gets the next
    /// client identifier. A room created here is never visible without its
    /// first participant.
    pub fn join(
        &self,
        request: JoinRequest,
        outbound: OutboundTx,
    ) -> Result<Membership, RegistryError> {
        let mut state = self.state.lock();

        let name = match request {
            JoinRequest::Create(name) => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(RegistryError::InvalidName);
                }
                if !state.rooms.contains_key(name) {
                    state.rooms.insert(name.to_string(), Room::default());
                    info!("Room '{}' created", name);
                }
                name.to_string()
            }
            JoinRequest::Existing(name) => {
                if !state.rooms.contains_key(&name) {
                    return Err(RegistryError::RoomNotFound(name));
                }
                name
            }
        };

        let id = ClientId(state.next_id);
        state.next_id += 1;

        if let Some(room) = state.rooms.get_mut(&name) {
            room.participants.push(Participant { id, outbound });
            info!(
                "Client {} joined room '{}' ({} participants)",
                id,
                name,
                room.participants.len()
            );
        }

        Ok(Membership { room: name, id })
    }

    /// Remove a participant, deleting its room if it was the last one
    ///
    /// Returns `true` if the room was deleted. Removing an unknown membership is
    /// a no-op.
    pub fn leave(&self, membership: &Membership) -> bool {
        let mut state = self.state.lock();

        let now_empty = match state.rooms.get_mut(&membership.room) {
            Some(room) => {
                room.participants.retain(|p| p.id != membership.id);
                room.participants.is_empty()
            }
            None => return false,
        };

        info!("Client {} left room '{}'", membership.id, membership.room);

        if now_empty {
            state.rooms.remove(&membership.room);
            info!("Room '{}' removed (empty)", membership.room);
        }
        now_empty
    }

    /// Forward an audio frame to every other participant of the sender's room
    ///
    /// A peer whose queue is full or closed is logged and skipped; it stays in
    /// the room until its own connection notices the disconnect.
    pub fn broadcast(&self, sender: &Membership, payload: &[u8]) -> BroadcastReport {
        let payload: Arc<[u8]> = Arc::from(payload);
        let mut report = BroadcastReport::default();

        let state = self.state.lock();
        let room = match state.rooms.get(&sender.room) {
            Some(room) => room,
            None => return report,
        };

        for peer in room.participants.iter().filter(|p| p.id != sender.id) {
            let frame = ServerFrame::Audio {
                sender: sender.id,
                payload: payload.clone(),
            };
            match peer.outbound.try_send(frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        "Failed to relay audio from client {} to client {}: {}",
                        sender.id, peer.id, e
                    );
                }
            }
        }

        debug!(
            "Relayed {} bytes from client {} to {} peers in '{}'",
            payload.len(),
            sender.id,
            report.delivered,
            sender.room
        );
        report
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (OutboundTx, mpsc::Receiver<ServerFrame>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_empty_registry_listing() {
        let registry = RoomRegistry::new();
        assert_eq!(registry.list_rooms(), "No rooms available.");
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_create_is_idempotent() {
        let registry = RoomRegistry::new();
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();

        let a = registry
            .join(JoinRequest::Create(" demo ".into()), tx1)
            .unwrap();
        let b = registry.join(JoinRequest::Create("demo".into()), tx2).unwrap();

        assert_eq!(a.room, "demo");
        assert_eq!(b.room, "demo");
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.members("demo"), Some(vec![a.id, b.id]));
    }

    #[test]
    fn test_invalid_name() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = queue();
        assert!(matches!(
            registry.join(JoinRequest::Create("   ".into()), tx),
            Err(RegistryError::InvalidName)
        ));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_join_unknown_room() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = queue();
        match registry.join(JoinRequest::Existing("nowhere".into()), tx) {
            Err(RegistryError::RoomNotFound(name)) => assert_eq!(name, "nowhere"),
            other => panic!("Expected RoomNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let registry = RoomRegistry::new();
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();
        registry.join(JoinRequest::Create("Demo".into()), tx1).unwrap();
        assert!(registry
            .join(JoinRequest::Existing("demo".into()), tx2)
            .is_err());
    }

    #[test]
    fn test_ids_increase_and_are_not_reused() {
        let registry = RoomRegistry::new();
        let mut last = 0;
        for _ in 0..5 {
            let (tx, _rx) = queue();
            let m = registry.join(JoinRequest::Create("r".into()), tx).unwrap();
            assert!(m.id.0 > last);
            last = m.id.0;
            registry.leave(&m);
        }
        assert_eq!(last, 5);
    }

    #[test]
    fn test_last_leave_deletes_room() {
        let registry = RoomRegistry::new();
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();
        let a = registry.join(JoinRequest::Create("demo".into()), tx1).unwrap();
        let b = registry
            .join(JoinRequest::Existing("demo".into()), tx2)
            .unwrap();

        assert!(!registry.leave(&a));
        assert_eq!(registry.members("demo"), Some(vec![b.id]));
        assert!(registry.leave(&b));
        assert!(!registry.contains_room("demo"));
        assert!(!registry.leave(&b));
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let registry = RoomRegistry::new();
        let (tx1, mut rx1) = queue();
        let (tx2, mut rx2) = queue();
        let (tx3, mut rx3) = queue();
        let a = registry.join(JoinRequest::Create("demo".into()), tx1).unwrap();
        registry.join(JoinRequest::Existing("demo".into()), tx2).unwrap();
        registry.join(JoinRequest::Existing("demo".into()), tx3).unwrap();

        let report = registry.broadcast(&a, b"pcm");
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 0);

        assert!(rx1.try_recv().is_err());
        for rx in [&mut rx2, &mut rx3] {
            match rx.try_recv().unwrap() {
                ServerFrame::Audio { sender, payload } => {
                    assert_eq!(sender, a.id);
                    assert_eq!(&payload[..], b"pcm");
                }
                other => panic!("Expected audio, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_failed_peer_does_not_block_others() {
        let registry = RoomRegistry::new();
        let (tx1, _rx1) = queue();
        let (tx2, rx2) = queue();
        let (tx3, mut rx3) = queue();
        let a = registry.join(JoinRequest::Create("demo".into()), tx1).unwrap();
        let b = registry
            .join(JoinRequest::Existing("demo".into()), tx2)
            .unwrap();
        registry.join(JoinRequest::Existing("demo".into()), tx3).unwrap();

        // Peer b's connection is gone but it has not left yet
        drop(rx2);

        let report = registry.broadcast(&a, b"pcm");
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(rx3.try_recv().is_ok());
        assert!(registry.members("demo").unwrap().contains(&b.id));
    }

    #[test]
    fn test_concurrent_joins_never_expose_empty_rooms() {
        let registry = RoomRegistry::new();
        let mut workers = Vec::new();

        for _ in 0..4 {
            let registry = registry.clone();
            workers.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let (tx, _rx) = mpsc::channel(1);
                    let m = registry.join(JoinRequest::Create("churn".into()), tx).unwrap();
                    registry.leave(&m);
                }
            }));
        }

        let observer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    if let Some(members) = registry.members("churn") {
                        assert!(!members.is_empty());
                    }
                }
            })
        };

        for w in workers {
            w.join().unwrap();
        }
        observer.join().unwrap();
        assert_eq!(registry.room_count(), 0);
    }
}
