//! Session supervisor: the room channel lifecycle.
//!
//! ```text
//!            begin_join              join_accepted
//!  Initial ─────────────► AttemptingJoin ─────────► Joined ──leave──► Disconnected
//!     ▲                      │      │                  │
//!     │  username_exists     │      │ failures ≥ N     │ failures ≥ N
//!     └──────────────────────┘      ▼                  ▼
//!     └──────── retry ──────── ConnectionFailed ◄──────┘
//! ```
//!
//! Every join attempt gets a new *generation*. Inbound events carry the
//! generation of the connection that received them; the routing table
//! only answers for the current generation, so handlers from an earlier
//! session never see events after a new session starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::protocol::EventKind;

const MIN_USERNAME_LEN: usize = 3;
const MIN_ROOM_ID_LEN: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("a join attempt is already in progress")]
    JoinInProgress,
    #[error("session already joined")]
    AlreadyJoined,
    #[error("session is not joined")]
    NotJoined,
    #[error("no join attempt is in progress")]
    NotJoining,
    #[error("session has not failed")]
    NotFailed,
    #[error("connection failed; retry before joining again")]
    RetryRequired,
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Initial,
    AttemptingJoin,
    Joined,
    ConnectionFailed,
    Disconnected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Initial => "initial",
            SessionStatus::AttemptingJoin => "attempting-join",
            SessionStatus::Joined => "joined",
            SessionStatus::ConnectionFailed => "connection-failed",
            SessionStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Who is joining which room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub username: String,
    pub room_id: String,
}

impl Identity {
    /// Trim and validate. Usernames need 3 characters, room ids 5.
    pub fn new(username: &str, room_id: &str) -> Result<Self, SessionError> {
        let username = username.trim();
        let room_id = room_id.trim();
        if username.chars().count() < MIN_USERNAME_LEN {
            return Err(SessionError::InvalidIdentity(format!(
                "username must be at least {MIN_USERNAME_LEN} characters"
            )));
        }
        if room_id.chars().count() < MIN_ROOM_ID_LEN {
            return Err(SessionError::InvalidIdentity(format!(
                "room id must be at least {MIN_ROOM_ID_LEN} characters"
            )));
        }
        Ok(Self {
            username: username.to_string(),
            room_id: room_id.to_string(),
        })
    }
}

/// Component that owns an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Session,
    Presence,
    FileTree,
    Drawing,
    Chat,
}

/// Event routing table for one session generation.
#[derive(Debug, Default)]
pub struct Subscriptions {
    generation: u64,
    routes: BTreeMap<EventKind, Component>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table. Nothing from the previous generation survives.
    pub fn install(
        &mut self,
        generation: u64,
        routes: impl IntoIterator<Item = (EventKind, Component)>,
    ) {
        self.generation = generation;
        self.routes = routes.into_iter().collect();
    }

    pub fn route(&self, generation: u64, kind: EventKind) -> Option<Component> {
        if generation != self.generation {
            return None;
        }
        self.routes.get(&kind).copied()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The inbound events a client session listens to, and their owners.
pub fn client_routes() -> Vec<(EventKind, Component)> {
    use Component::*;
    vec![
        (EventKind::JoinAccepted, Session),
        (EventKind::UsernameExists, Session),
        (EventKind::Error, Session),
        (EventKind::UserJoined, Presence),
        (EventKind::UserDisconnected, Presence),
        (EventKind::Online, Presence),
        (EventKind::Offline, Presence),
        (EventKind::TypingStart, Presence),
        (EventKind::TypingPause, Presence),
        (EventKind::SyncFileStructure, FileTree),
        (EventKind::DirectoryCreated, FileTree),
        (EventKind::DirectoryUpdated, FileTree),
        (EventKind::DirectoryRenamed, FileTree),
        (EventKind::DirectoryDeleted, FileTree),
        (EventKind::FileCreated, FileTree),
        (EventKind::FileUpdated, FileTree),
        (EventKind::FileRenamed, FileTree),
        (EventKind::FileDeleted, FileTree),
        (EventKind::RequestDrawing, Drawing),
        (EventKind::SyncDrawing, Drawing),
        (EventKind::DrawingUpdate, Drawing),
        (EventKind::ReceiveMessage, Chat),
        (EventKind::MessageHistory, Chat),
    ]
}

/// Result of reporting a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Below the threshold; the transport keeps retrying quietly.
    Retrying { failures: u32 },
    /// Threshold reached; the session is now `ConnectionFailed`.
    GaveUp { failures: u32 },
    /// No connection was expected, so the failure is not counted.
    Ignored,
}

#[derive(Debug)]
pub struct Supervisor {
    status: SessionStatus,
    failures: u32,
    threshold: u32,
    generation: u64,
    identity: Option<Identity>,
    subscriptions: Subscriptions,
}

impl Supervisor {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            status: SessionStatus::Initial,
            failures: 0,
            threshold: failure_threshold.max(1),
            generation: 0,
            identity: None,
            subscriptions: Subscriptions::new(),
        }
    }

    /// Start a join attempt. Returns the generation of the new session.
    pub fn begin_join(&mut self, identity: Identity) -> Result<u64, SessionError> {
        match self.status {
            SessionStatus::AttemptingJoin => return Err(SessionError::JoinInProgress),
            SessionStatus::Joined => return Err(SessionError::AlreadyJoined),
            SessionStatus::ConnectionFailed => return Err(SessionError::RetryRequired),
            SessionStatus::Initial | SessionStatus::Disconnected => {}
        }

        self.generation += 1;
        self.subscriptions.install(self.generation, client_routes());
        log::info!(
            "Joining room {} as {} (generation {})",
            identity.room_id,
            identity.username,
            self.generation
        );
        self.identity = Some(identity);
        self.status = SessionStatus::AttemptingJoin;
        Ok(self.generation)
    }

    /// The channel is (re)connected. Returns the identity to send a
    /// join-request with, if one should be sent.
    pub fn transport_connected(&mut self) -> Option<&Identity> {
        match self.status {
            SessionStatus::AttemptingJoin => {}
            SessionStatus::Joined => {
                log::info!("Channel reconnected; rejoining");
                self.status = SessionStatus::AttemptingJoin;
            }
            _ => return None,
        }
        self.identity.as_ref()
    }

    pub fn join_accepted(&mut self) -> Result<(), SessionError> {
        if self.status != SessionStatus::AttemptingJoin {
            return Err(SessionError::NotJoining);
        }
        self.failures = 0;
        self.status = SessionStatus::Joined;
        log::info!("Joined (generation {})", self.generation);
        Ok(())
    }

    /// Duplicate username. Back to `Initial`; the failure count is untouched.
    pub fn username_exists(&mut self) -> Result<(), SessionError> {
        if self.status != SessionStatus::AttemptingJoin {
            return Err(SessionError::NotJoining);
        }
        log::info!("Username rejected by room");
        self.subscriptions.clear();
        self.identity = None;
        self.status = SessionStatus::Initial;
        Ok(())
    }

    pub fn transport_failure(&mut self) -> FailureOutcome {
        if !matches!(
            self.status,
            SessionStatus::AttemptingJoin | SessionStatus::Joined
        ) {
            return FailureOutcome::Ignored;
        }

        self.failures += 1;
        if self.failures >= self.threshold {
            log::error!("Connection failed after {} attempts", self.failures);
            self.subscriptions.clear();
            self.status = SessionStatus::ConnectionFailed;
            FailureOutcome::GaveUp {
                failures: self.failures,
            }
        } else {
            log::warn!("Transport failure {} of {}", self.failures, self.threshold);
            FailureOutcome::Retrying {
                failures: self.failures,
            }
        }
    }

    /// The transport exhausted its own retry budget.
    pub fn transport_exhausted(&mut self) -> FailureOutcome {
        if !matches!(
            self.status,
            SessionStatus::AttemptingJoin | SessionStatus::Joined
        ) {
            return FailureOutcome::Ignored;
        }
        self.failures = self.failures.max(self.threshold - 1);
        self.transport_failure()
    }

    /// User-initiated retry after a terminal failure.
    pub fn retry(&mut self) -> Result<(), SessionError> {
        if self.status != SessionStatus::ConnectionFailed {
            return Err(SessionError::NotFailed);
        }
        self.failures = 0;
        self.status = SessionStatus::Initial;
        Ok(())
    }

    /// Explicit leave.
    pub fn leave(&mut self) -> Result<(), SessionError> {
        if self.status != SessionStatus::Joined {
            return Err(SessionError::NotJoined);
        }
        self.subscriptions.clear();
        self.status = SessionStatus::Disconnected;
        log::info!("Left room");
        Ok(())
    }

    /// Drop all handlers. A joined session ends `Disconnected`, a pending
    /// attempt goes back to `Initial`.
    pub fn teardown(&mut self) {
        self.subscriptions.clear();
        self.status = match self.status {
            SessionStatus::Joined => SessionStatus::Disconnected,
            SessionStatus::AttemptingJoin => SessionStatus::Initial,
            other => other,
        };
    }

    pub fn route(&self, generation: u64, kind: EventKind) -> Option<Component> {
        self.subscriptions.route(generation, kind)
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }
}
