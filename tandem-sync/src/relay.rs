//! Development relay: an in-order rebroadcast room server.
//!
//! ```text
//! Client A ──┐                      ┌──► Client B
//!             ├── Room (room id) ───┤
//! Client C ──┘   users, file tree,  └──► Client C
//!                drawing, history
//! ```
//!
//! Every client event that changes shared state is applied to the room
//! state and rebroadcast to the other members while the room lock is held,
//! so a joining member's snapshot and its broadcast subscription never
//! miss or duplicate an edit.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tandem_core::{DrawingRecord, Origin, Patch};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::broadcast::{Frame, Room, RoomManager};
use crate::presence::{ConnectionStatus, PresenceEntry};
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub max_users_per_room: usize,
    /// Frames buffered per member before it lags.
    pub broadcast_capacity: usize,
    /// Chat messages kept per room.
    pub history_limit: usize,
    /// Name of the root directory of new rooms.
    pub root_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_users_per_room: 100,
            broadcast_capacity: 256,
            history_limit: 500,
            root_name: "workspace".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

pub struct Relay {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.root_name.clone(),
            config.history_limit,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until an accept fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

struct Membership {
    room: Arc<Room>,
    rx: broadcast::Receiver<Arc<Frame>>,
}

/// Per-socket protocol state.
struct Connection {
    socket_id: String,
    rooms: Arc<RoomManager>,
    config: RelayConfig,
    membership: Option<Membership>,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
    config: RelayConfig,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut conn = Connection {
        socket_id: Uuid::new_v4().to_string(),
        rooms,
        config,
        membership: None,
    };

    let result: Result<(), RelayError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += text.len() as u64;
                        }
                        for reply in conn.on_text(text.as_str()).await {
                            ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },

                frame = async {
                    match conn.membership.as_mut() {
                        Some(m) => m.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match frame {
                    Ok(frame) => {
                        if frame.is_for(&conn.socket_id) {
                            ws_sender.send(Message::Text(frame.text.to_string().into())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Socket {} lagged by {n} frames", conn.socket_id);
                        if let Some(m) = &conn.membership {
                            m.room.record_dropped(n);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
    .await;

    conn.leave().await;
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    result
}

impl Connection {
    async fn on_text(&mut self, text: &str) -> Vec<ServerEvent> {
        match ClientEvent::decode(text) {
            Ok(event) => {
                log::trace!("{} from {}", event.kind(), self.socket_id);
                self.on_event(event).await
            }
            Err(e) => {
                log::warn!("Rejecting frame from {}: {e}", self.socket_id);
                vec![ServerEvent::Error {
                    message: e.to_string(),
                }]
            }
        }
    }

    async fn on_event(&mut self, event: ClientEvent) -> Vec<ServerEvent> {
        if let ClientEvent::JoinRequest { username, room_id } = event {
            return self.join(username, room_id).await;
        }
        let Some(room) = self.membership.as_ref().map(|m| m.room.clone()) else {
            return vec![error("join a room first")];
        };
        match self.apply(&room, event).await {
            Ok(replies) => replies,
            Err(e) => {
                log::warn!("Room {}: {e}", room.id());
                vec![error(&e.to_string())]
            }
        }
    }

    async fn join(&mut self, username: String, room_id: String) -> Vec<ServerEvent> {
        if self.membership.is_some() {
            return vec![error("already joined")];
        }
        let room = self.rooms.get_or_create(&room_id).await;
        let mut state = room.state().await;

        if state.username_taken(&username) {
            log::info!("Room {room_id}: username {username} already in use");
            drop(state);
            self.rooms.remove_if_empty(&room_id).await;
            return vec![ServerEvent::UsernameExists {}];
        }
        if state.users.len() >= self.config.max_users_per_room {
            drop(state);
            return vec![error("room is full")];
        }

        let user = PresenceEntry::new(&username, &room_id, &self.socket_id);
        let users: Vec<PresenceEntry> = state.users.values().cloned().collect();
        state.users.insert(self.socket_id.clone(), user.clone());
        let file_structure = state.files.replica().iter().cloned().collect();
        let messages = state.history();

        let rx = room.subscribe();
        if let Err(e) = room.broadcast_from(&self.socket_id, &ServerEvent::UserJoined { user: user.clone() }) {
            log::error!("Room {room_id}: {e}");
        }
        drop(state);

        log::info!("{username} joined room {room_id} ({} members)", users.len() + 1);
        self.membership = Some(Membership { room, rx });

        vec![
            ServerEvent::JoinAccepted { user, users },
            ServerEvent::SyncFileStructure { file_structure },
            ServerEvent::MessageHistory { messages },
        ]
    }

    /// Apply a member's event to the room and fan it out.
    async fn apply(&self, room: &Room, event: ClientEvent) -> Result<Vec<ServerEvent>, RelayError> {
        let me = self.socket_id.as_str();
        let mut state = room.state().await;

        let outbound = match event {
            ClientEvent::JoinRequest { .. } => return Ok(vec![error("already joined")]),
            ClientEvent::DirectoryCreated { node } => {
                let patch = state.files.upsert_patch(node.clone());
                state.files.apply(&patch, Origin::Remote);
                ServerEvent::DirectoryCreated { node }
            }
            ClientEvent::DirectoryUpdated { node } => {
                let patch = state.files.upsert_patch(node.clone());
                state.files.apply(&patch, Origin::Remote);
                ServerEvent::DirectoryUpdated { node }
            }
            ClientEvent::DirectoryRenamed { node } => {
                let patch = state.files.upsert_patch(node.clone());
                state.files.apply(&patch, Origin::Remote);
                ServerEvent::DirectoryRenamed { node }
            }
            ClientEvent::FileCreated { node } => {
                let patch = state.files.upsert_patch(node.clone());
                state.files.apply(&patch, Origin::Remote);
                ServerEvent::FileCreated { node }
            }
            ClientEvent::FileRenamed { node } => {
                let patch = state.files.upsert_patch(node.clone());
                state.files.apply(&patch, Origin::Remote);
                ServerEvent::FileRenamed { node }
            }
            ClientEvent::FileUpdated {
                file_id,
                new_content,
            } => {
                match state.files.content_patch(file_id.as_str(), &new_content) {
                    Ok(patch) => {
                        state.files.apply(&patch, Origin::Remote);
                    }
                    Err(e) => log::debug!("Room {}: {e}", room.id()),
                }
                ServerEvent::FileUpdated {
                    file_id,
                    new_content,
                }
            }
            ClientEvent::DirectoryDeleted { id } => {
                if let Ok(patch) = state.files.delete_patch(id.as_str()) {
                    state.files.apply(&patch, Origin::Remote);
                }
                ServerEvent::DirectoryDeleted { id }
            }
            ClientEvent::FileDeleted { id } => {
                if let Ok(patch) = state.files.delete_patch(id.as_str()) {
                    state.files.apply(&patch, Origin::Remote);
                }
                ServerEvent::FileDeleted { id }
            }
            ClientEvent::Online { socket_id } => {
                set_status(&mut state.users, &socket_id, ConnectionStatus::Online);
                ServerEvent::Online { socket_id }
            }
            ClientEvent::Offline { socket_id } => {
                set_status(&mut state.users, &socket_id, ConnectionStatus::Offline);
                ServerEvent::Offline { socket_id }
            }
            ClientEvent::SendMessage { message } => {
                state.record_message(message.clone());
                ServerEvent::ReceiveMessage { message }
            }
            ClientEvent::TypingStart {
                cursor_position,
                current_file,
            } => {
                let Some(user) = state.users.get_mut(me) else {
                    return Ok(Vec::new());
                };
                user.typing = true;
                user.cursor_position = cursor_position;
                user.current_file = current_file;
                ServerEvent::TypingStart { user: user.clone() }
            }
            ClientEvent::TypingPause {} => {
                let Some(user) = state.users.get_mut(me) else {
                    return Ok(Vec::new());
                };
                user.typing = false;
                ServerEvent::TypingPause { user: user.clone() }
            }
            ClientEvent::DrawingReady {} => {
                let full = state
                    .drawing
                    .iter()
                    .fold(Patch::new(), |p, r| p.with_added(r.clone()));
                let snapshots = if full.is_empty() {
                    Vec::new()
                } else {
                    vec![full.to_raw().map_err(|e| ProtocolError::Encode(e.to_string()))?]
                };
                return Ok(vec![ServerEvent::SyncDrawing { snapshots }]);
            }
            ClientEvent::DrawingUpdate { snapshot } => {
                let (patch, _) = snapshot.decode::<DrawingRecord>();
                state.drawing.apply(&patch, Origin::Remote);
                ServerEvent::DrawingUpdate { snapshot }
            }
            ClientEvent::SyncDrawing { snapshots } => {
                for raw in &snapshots {
                    let (patch, _) = raw.decode::<DrawingRecord>();
                    state.drawing.apply(&patch, Origin::Remote);
                }
                return Ok(Vec::new());
            }
        };

        room.broadcast_from(me, &outbound)?;
        Ok(Vec::new())
    }

    /// Remove this socket from its room and tell the others.
    async fn leave(&mut self) {
        let Some(Membership { room, rx }) = self.membership.take() else {
            return;
        };
        drop(rx);
        {
            let mut state = room.state().await;
            if let Some(user) = state.users.remove(&self.socket_id) {
                log::info!("{} left room {}", user.username, room.id());
                if let Err(e) = room.broadcast_from(&self.socket_id, &ServerEvent::UserDisconnected { user }) {
                    log::error!("Room {}: {e}", room.id());
                }
            }
        }
        self.rooms.remove_if_empty(room.id()).await;
    }
}

fn set_status(
    users: &mut std::collections::BTreeMap<String, PresenceEntry>,
    socket_id: &str,
    status: ConnectionStatus,
) {
    if let Some(user) = users.get_mut(socket_id) {
        user.status = status;
    }
}

fn error(message: &str) -> ServerEvent {
    ServerEvent::Error {
        message: message.to_string(),
    }
}
