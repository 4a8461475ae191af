//! JSON event protocol carried over the room channel.
//!
//! Wire format (one WebSocket text frame per event):
//! ```text
//! { "event": "<kebab-case name>", "data": { ...camelCase fields... } }
//! ```
//!
//! [`ClientEvent`] is what a client sends, [`ServerEvent`] what it receives.
//! Several names (file and directory events, typing, online/offline,
//! drawing updates) exist in both directions with direction-specific
//! payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tandem_core::{FileNode, RawPatch, RecordId};
use thiserror::Error;

use crate::chat::ChatMessage;
use crate::presence::PresenceEntry;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("event could not be encoded: {0}")]
    Encode(String),
    #[error("frame is not a JSON event: {0}")]
    Decode(String),
    #[error("unknown event {0}")]
    UnknownEvent(String),
    #[error("malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },
    #[error("channel closed")]
    ConnectionClosed,
    #[error("connection attempt timed out")]
    Timeout,
}

/// Every event name on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    JoinRequest,
    JoinAccepted,
    UsernameExists,
    UserJoined,
    UserDisconnected,
    SyncFileStructure,
    DirectoryCreated,
    DirectoryUpdated,
    DirectoryRenamed,
    DirectoryDeleted,
    FileCreated,
    FileUpdated,
    FileRenamed,
    FileDeleted,
    Online,
    Offline,
    SendMessage,
    ReceiveMessage,
    MessageHistory,
    TypingStart,
    TypingPause,
    RequestDrawing,
    SyncDrawing,
    DrawingReady,
    DrawingUpdate,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 26] = [
        EventKind::JoinRequest,
        EventKind::JoinAccepted,
        EventKind::UsernameExists,
        EventKind::UserJoined,
        EventKind::UserDisconnected,
        EventKind::SyncFileStructure,
        EventKind::DirectoryCreated,
        EventKind::DirectoryUpdated,
        EventKind::DirectoryRenamed,
        EventKind::DirectoryDeleted,
        EventKind::FileCreated,
        EventKind::FileUpdated,
        EventKind::FileRenamed,
        EventKind::FileDeleted,
        EventKind::Online,
        EventKind::Offline,
        EventKind::SendMessage,
        EventKind::ReceiveMessage,
        EventKind::MessageHistory,
        EventKind::TypingStart,
        EventKind::TypingPause,
        EventKind::RequestDrawing,
        EventKind::SyncDrawing,
        EventKind::DrawingReady,
        EventKind::DrawingUpdate,
        EventKind::Error,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::JoinRequest => "join-request",
            EventKind::JoinAccepted => "join-accepted",
            EventKind::UsernameExists => "username-exists",
            EventKind::UserJoined => "user-joined",
            EventKind::UserDisconnected => "user-disconnected",
            EventKind::SyncFileStructure => "sync-file-structure",
            EventKind::DirectoryCreated => "directory-created",
            EventKind::DirectoryUpdated => "directory-updated",
            EventKind::DirectoryRenamed => "directory-renamed",
            EventKind::DirectoryDeleted => "directory-deleted",
            EventKind::FileCreated => "file-created",
            EventKind::FileUpdated => "file-updated",
            EventKind::FileRenamed => "file-renamed",
            EventKind::FileDeleted => "file-deleted",
            EventKind::Online => "online",
            EventKind::Offline => "offline",
            EventKind::SendMessage => "send-message",
            EventKind::ReceiveMessage => "receive-message",
            EventKind::MessageHistory => "message-history",
            EventKind::TypingStart => "typing-start",
            EventKind::TypingPause => "typing-pause",
            EventKind::RequestDrawing => "request-drawing",
            EventKind::SyncDrawing => "sync-drawing",
            EventKind::DrawingReady => "drawing-ready",
            EventKind::DrawingUpdate => "drawing-update",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinRequest { username: String, room_id: String },
    DirectoryCreated { node: FileNode },
    DirectoryUpdated { node: FileNode },
    DirectoryRenamed { node: FileNode },
    DirectoryDeleted { id: RecordId },
    FileCreated { node: FileNode },
    FileUpdated { file_id: RecordId, new_content: String },
    FileRenamed { node: FileNode },
    FileDeleted { id: RecordId },
    Online { socket_id: String },
    Offline { socket_id: String },
    SendMessage { message: ChatMessage },
    TypingStart { cursor_position: Option<usize>, current_file: Option<RecordId> },
    TypingPause {},
    DrawingReady {},
    DrawingUpdate { snapshot: RawPatch },
    SyncDrawing { snapshots: Vec<RawPatch> },
}

/// Events received by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    JoinAccepted { user: PresenceEntry, users: Vec<PresenceEntry> },
    UsernameExists {},
    UserJoined { user: PresenceEntry },
    UserDisconnected { user: PresenceEntry },
    SyncFileStructure { file_structure: Vec<FileNode> },
    DirectoryCreated { node: FileNode },
    DirectoryUpdated { node: FileNode },
    DirectoryRenamed { node: FileNode },
    DirectoryDeleted { id: RecordId },
    FileCreated { node: FileNode },
    FileUpdated { file_id: RecordId, new_content: String },
    FileRenamed { node: FileNode },
    FileDeleted { id: RecordId },
    Online { socket_id: String },
    Offline { socket_id: String },
    TypingStart { user: PresenceEntry },
    TypingPause { user: PresenceEntry },
    ReceiveMessage { message: ChatMessage },
    MessageHistory { messages: Vec<ChatMessage> },
    RequestDrawing {},
    SyncDrawing { snapshots: Vec<RawPatch> },
    DrawingUpdate { snapshot: RawPatch },
    Error { message: String },
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::JoinRequest { .. } => EventKind::JoinRequest,
            ClientEvent::DirectoryCreated { .. } => EventKind::DirectoryCreated,
            ClientEvent::DirectoryUpdated { .. } => EventKind::DirectoryUpdated,
            ClientEvent::DirectoryRenamed { .. } => EventKind::DirectoryRenamed,
            ClientEvent::DirectoryDeleted { .. } => EventKind::DirectoryDeleted,
            ClientEvent::FileCreated { .. } => EventKind::FileCreated,
            ClientEvent::FileUpdated { .. } => EventKind::FileUpdated,
            ClientEvent::FileRenamed { .. } => EventKind::FileRenamed,
            ClientEvent::FileDeleted { .. } => EventKind::FileDeleted,
            ClientEvent::Online { .. } => EventKind::Online,
            ClientEvent::Offline { .. } => EventKind::Offline,
            ClientEvent::SendMessage { .. } => EventKind::SendMessage,
            ClientEvent::TypingStart { .. } => EventKind::TypingStart,
            ClientEvent::TypingPause {} => EventKind::TypingPause,
            ClientEvent::DrawingReady {} => EventKind::DrawingReady,
            ClientEvent::DrawingUpdate { .. } => EventKind::DrawingUpdate,
            ClientEvent::SyncDrawing { .. } => EventKind::SyncDrawing,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_event(text)
    }

    /// Whether the event carries a document or chat change that peers must
    /// eventually see. Presence signals and handshakes are not edits.
    pub fn is_edit(&self) -> bool {
        !matches!(
            self,
            ClientEvent::JoinRequest { .. }
                | ClientEvent::Online { .. }
                | ClientEvent::Offline { .. }
                | ClientEvent::TypingStart { .. }
                | ClientEvent::TypingPause {}
                | ClientEvent::DrawingReady {}
                | ClientEvent::SyncDrawing { .. }
        )
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::JoinAccepted { .. } => EventKind::JoinAccepted,
            ServerEvent::UsernameExists {} => EventKind::UsernameExists,
            ServerEvent::UserJoined { .. } => EventKind::UserJoined,
            ServerEvent::UserDisconnected { .. } => EventKind::UserDisconnected,
            ServerEvent::SyncFileStructure { .. } => EventKind::SyncFileStructure,
            ServerEvent::DirectoryCreated { .. } => EventKind::DirectoryCreated,
            ServerEvent::DirectoryUpdated { .. } => EventKind::DirectoryUpdated,
            ServerEvent::DirectoryRenamed { .. } => EventKind::DirectoryRenamed,
            ServerEvent::DirectoryDeleted { .. } => EventKind::DirectoryDeleted,
            ServerEvent::FileCreated { .. } => EventKind::FileCreated,
            ServerEvent::FileUpdated { .. } => EventKind::FileUpdated,
            ServerEvent::FileRenamed { .. } => EventKind::FileRenamed,
            ServerEvent::FileDeleted { .. } => EventKind::FileDeleted,
            ServerEvent::Online { .. } => EventKind::Online,
            ServerEvent::Offline { .. } => EventKind::Offline,
            ServerEvent::TypingStart { .. } => EventKind::TypingStart,
            ServerEvent::TypingPause { .. } => EventKind::TypingPause,
            ServerEvent::ReceiveMessage { .. } => EventKind::ReceiveMessage,
            ServerEvent::MessageHistory { .. } => EventKind::MessageHistory,
            ServerEvent::RequestDrawing {} => EventKind::RequestDrawing,
            ServerEvent::SyncDrawing { .. } => EventKind::SyncDrawing,
            ServerEvent::DrawingUpdate { .. } => EventKind::DrawingUpdate,
            ServerEvent::Error { .. } => EventKind::Error,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_event(text)
    }
}

/// Decode a frame, classifying failures by event name so callers can log
/// which event was dropped.
fn decode_event<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let name = value
        .get("event")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Decode("missing event name".into()))?;

    serde_json::from_value(value).map_err(|e| {
        if EventKind::from_name(&name).is_none() {
            ProtocolError::UnknownEvent(name)
        } else {
            ProtocolError::Malformed {
                event: name,
                reason: e.to_string(),
            }
        }
    })
}

/// An inbound event stamped with the session generation that received it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub generation: u64,
    pub event: ServerEvent,
}

impl Envelope {
    pub fn new(generation: u64, event: ServerEvent) -> Self {
        Self { generation, event }
    }
}
