//! # tandem-sync: real-time sync for tandem workspaces
//!
//! Keeps a shared file tree, drawing scene, presence list and chat in step
//! across the members of a room over one JSON event channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)  ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │   Relay     │
//! │ (per user)  │   {event, data}     │  (rooms)    │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Workspace   │                     │ RoomState   │
//! │ (sans-IO)   │                     │ files/draw/ │
//! └─────────────┘                     │ users/chat  │
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: event taxonomy and JSON framing
//! - [`session`]: join/reconnect state machine and generation routing
//! - [`workspace`]: sans-IO orchestrator over every component
//! - [`transport`]: WebSocket connector with bounded reconnection
//! - [`client`]: async shell driving a workspace
//! - [`api`]: HTTP setup and liveness calls
//! - [`broadcast`] / [`relay`]: development relay server

pub mod api;
pub mod bootstrap;
pub mod broadcast;
pub mod chat;
pub mod client;
pub mod config;
pub mod debounce;
pub mod heartbeat;
pub mod outbox;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod transport;
pub mod workspace;

pub use api::{ApiError, RoomApi};
pub use bootstrap::{BootstrapState, Bootstrapper, SyncSummary};
pub use broadcast::{Room, RoomManager, RoomState, RoomStats};
pub use chat::{ChatLog, ChatMessage};
pub use client::{ClientError, SyncClient, SyncHandle, WorkspaceSnapshot};
pub use config::{SyncConfig, TransportPolicy};
pub use debounce::{Debouncer, TypingSignal};
pub use heartbeat::Heartbeat;
pub use outbox::Outbox;
pub use presence::{ConnectionStatus, Presence, PresenceEntry};
pub use protocol::{ClientEvent, Envelope, EventKind, ProtocolError, ServerEvent};
pub use relay::{Relay, RelayConfig, RelayError, RelayStats};
pub use session::{Component, Identity, SessionError, SessionStatus, Subscriptions, Supervisor};
pub use transport::{Transport, TransportEvent};
pub use workspace::{Notice, Output, Visibility, Workspace, WorkspaceError};
