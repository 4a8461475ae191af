//! Per-room fan-out for the relay.
//!
//! Every room owns one tokio broadcast channel. A frame is encoded once,
//! wrapped in an `Arc` and handed to every member's receiver; the member
//! loop skips frames it sent itself. Each receiver buffers up to
//! `capacity` frames before a slow member starts lagging.
//!
//! Alongside the channel a room keeps the shared state that late joiners
//! are synced from: members, the file tree, the drawing replica and the
//! chat history.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::{DrawingRecord, FileTree, Replica};
use tokio::sync::{broadcast, Mutex, MutexGuard, RwLock};

use crate::chat::ChatMessage;
use crate::presence::PresenceEntry;
use crate::protocol::{ProtocolError, ServerEvent};

/// An encoded event on a room channel.
#[derive(Debug)]
pub struct Frame {
    /// Socket that caused the frame; `None` reaches every member.
    pub from: Option<String>,
    pub text: Arc<str>,
}

impl Frame {
    /// Whether the member on `socket_id` should receive this frame.
    pub fn is_for(&self, socket_id: &str) -> bool {
        self.from.as_deref() != Some(socket_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub members: usize,
}

#[derive(Default)]
struct AtomicRoomStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// What a room remembers between events.
pub struct RoomState {
    /// Members keyed by socket id.
    pub users: BTreeMap<String, PresenceEntry>,
    pub files: FileTree,
    pub drawing: Replica<DrawingRecord>,
    history: VecDeque<ChatMessage>,
    history_limit: usize,
}

impl RoomState {
    fn new(root_name: &str, history_limit: usize) -> Self {
        Self {
            users: BTreeMap::new(),
            files: FileTree::new(root_name),
            drawing: Replica::new(),
            history: VecDeque::new(),
            history_limit,
        }
    }

    pub fn username_taken(&self, username: &str) -> bool {
        self.users.values().any(|u| u.username == username)
    }

    /// Append to the chat history, dropping the oldest past the limit.
    pub fn record_message(&mut self, message: ChatMessage) {
        self.history.push_back(message);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.iter().cloned().collect()
    }
}

/// One collaboration room.
pub struct Room {
    id: String,
    sender: broadcast::Sender<Arc<Frame>>,
    state: Mutex<RoomState>,
    capacity: usize,
    stats: AtomicRoomStats,
}

impl Room {
    pub fn new(id: impl Into<String>, capacity: usize, root_name: &str, history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            id: id.into(),
            sender,
            state: Mutex::new(RoomState::new(root_name, history_limit)),
            capacity,
            stats: AtomicRoomStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }

    /// Send `event` to every member except `from`.
    pub fn broadcast_from(&self, from: &str, event: &ServerEvent) -> Result<usize, ProtocolError> {
        self.send(Some(from.to_string()), event)
    }

    /// Send `event` to every member.
    pub fn broadcast_all(&self, event: &ServerEvent) -> Result<usize, ProtocolError> {
        self.send(None, event)
    }

    fn send(&self, from: Option<String>, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let frame = Frame {
            from,
            text: Arc::from(event.encode()?),
        };
        let receivers = self.sender.send(Arc::new(frame)).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!("Room {}: {} to {receivers} receivers", self.id, event.kind());
        Ok(receivers)
    }

    /// A member fell behind by `frames`.
    pub fn record_dropped(&self, frames: u64) {
        self.stats.frames_dropped.fetch_add(frames, Ordering::Relaxed);
    }

    pub async fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.users.len()
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Rooms keyed by room id.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    capacity: usize,
    root_name: String,
    history_limit: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, root_name: impl Into<String>, history_limit: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            root_name: root_name.into(),
            history_limit,
        }
    }

    pub async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                log::info!("Room {room_id} created");
                Arc::new(Room::new(
                    room_id,
                    self.capacity,
                    &self.root_name,
                    self.history_limit,
                ))
            })
            .clone()
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Drop the room if nobody is left in it.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(room_id) {
            Some(room) => room.member_count().await == 0,
            None => false,
        };
        if empty {
            rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
        }
        empty
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
