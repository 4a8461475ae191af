//! Presence tracking: who is in the room, which file they are in,
//! whether they are typing and whether their tab is visible.
//!
//! ```text
//! join-accepted ──► seed()            user-joined ──► upsert()
//! typing-start  ──┐                   online      ──► set_online()
//! typing-pause  ──┴► replace()        offline     ──► set_offline(flush)
//! user-disconnected ──► remove_by_username()
//! ```
//!
//! Entries are keyed by socket id. The tracker is the only owner of this
//! state; everything else reads it through queries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_core::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Online,
    Offline,
}

/// One participant, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub username: String,
    pub room_id: String,
    pub socket_id: String,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default)]
    pub typing: bool,
    #[serde(default)]
    pub current_file: Option<RecordId>,
    #[serde(default)]
    pub cursor_position: Option<usize>,
}

impl PresenceEntry {
    pub fn new(
        username: impl Into<String>,
        room_id: impl Into<String>,
        socket_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            room_id: room_id.into(),
            socket_id: socket_id.into(),
            status: ConnectionStatus::Online,
            typing: false,
            current_file: None,
            cursor_position: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == ConnectionStatus::Online
    }
}

/// Read model of the room's participants.
#[derive(Debug, Default)]
pub struct Presence {
    entries: BTreeMap<String, PresenceEntry>,
    local: Option<PresenceEntry>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to the participant list delivered with join-accepted.
    pub fn seed(&mut self, local: PresenceEntry, users: Vec<PresenceEntry>) {
        self.entries = users
            .into_iter()
            .map(|u| (u.socket_id.clone(), u))
            .collect();
        self.entries.insert(local.socket_id.clone(), local.clone());
        log::debug!("Presence seeded with {} users", self.entries.len());
        self.local = Some(local);
    }

    pub fn upsert(&mut self, user: PresenceEntry) {
        self.entries.insert(user.socket_id.clone(), user);
    }

    /// Replace an entry wholesale (typing events). Unknown users are added.
    pub fn replace(&mut self, user: PresenceEntry) {
        if !self.entries.contains_key(&user.socket_id) {
            log::debug!("Typing event for unknown user {}; adding", user.username);
        }
        log::trace!("Presence {} typing={}", user.username, user.typing);
        self.upsert(user);
    }

    /// Drop every entry with the given username.
    pub fn remove_by_username(&mut self, username: &str) -> Vec<PresenceEntry> {
        let gone: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.username == username)
            .map(|e| e.socket_id.clone())
            .collect();
        gone.iter()
            .filter_map(|socket| self.entries.remove(socket))
            .collect()
    }

    pub fn set_online(&mut self, socket_id: &str) -> bool {
        self.set_status(socket_id, ConnectionStatus::Online)
    }

    /// Mark a socket offline. When it is this client's own socket, `flush`
    /// runs before the status changes.
    pub fn set_offline(&mut self, socket_id: &str, flush: impl FnOnce()) -> bool {
        if self.is_local(socket_id) {
            flush();
        }
        self.set_status(socket_id, ConnectionStatus::Offline)
    }

    fn set_status(&mut self, socket_id: &str, status: ConnectionStatus) -> bool {
        let mut changed = false;
        if let Some(entry) = self.entries.get_mut(socket_id) {
            changed = entry.status != status;
            entry.status = status;
        }
        if let Some(local) = self.local.as_mut().filter(|l| l.socket_id == socket_id) {
            local.status = status;
        }
        changed
    }

    /// Remote participants typing in `file_id`. These are the cursors an
    /// editor showing that file should render.
    pub fn active_cursors(&self, file_id: &str) -> Vec<&PresenceEntry> {
        self.entries
            .values()
            .filter(|e| !self.is_local(&e.socket_id))
            .filter(|e| e.typing && e.current_file.as_ref().is_some_and(|f| f.as_str() == file_id))
            .collect()
    }

    pub fn is_local(&self, socket_id: &str) -> bool {
        self.local.as_ref().is_some_and(|l| l.socket_id == socket_id)
    }

    pub fn local(&self) -> Option<&PresenceEntry> {
        self.local.as_ref()
    }

    pub fn get(&self, socket_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(socket_id)
    }

    pub fn by_username(&self, username: &str) -> Option<&PresenceEntry> {
        self.entries.values().find(|e| e.username == username)
    }

    pub fn users(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.local = None;
    }
}
