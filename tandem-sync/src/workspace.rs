//! Sans-IO orchestrator for one collaborative workspace.
//!
//! [`Workspace`] owns every sync component (session supervisor, presence,
//! the two document replicas, debouncers, bootstrapper, heartbeat, chat)
//! and never performs I/O itself. Callers feed it transport events, inbound
//! envelopes, local edits and the current time; it answers with a list of
//! [`Output`]s for the async shell to carry out.
//!
//! ```text
//!  transport ──► on_transport ──► handle(envelope) ──► component handler
//!                                      │ generation/route check
//!  local edit ──► replica.apply(Local) ──► local listener ──► drain_local
//!                                                                │
//!  remote patch ──► replica.apply(Remote)   (no listener fires)  ▼
//!                                                      Send / Notify outputs
//! ```
//!
//! The local listeners registered on both replicas only accept
//! [`Origin::Local`]; a remote patch can therefore never produce an
//! outbound emission.
//!
//! Edits made while the channel is down wait in an [`Outbox`] and are
//! replayed right after the next join-request. Until the server's file
//! structure arrives, the file events sent on the new channel are kept so
//! that the snapshot (taken before they were applied) cannot undo them.

use std::collections::BTreeMap;
use std::time::Instant;
use tandem_core::{
    DrawingRecord, DrawingScene, FileNode, FileTree, FileTreeError, ListenFilter, Origin, Patch,
    PatchError, Record, RecordId, ROOT_ID,
};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::bootstrap::{BootstrapState, Bootstrapper, SyncSummary};
use crate::chat::{ChatLog, ChatMessage};
use crate::config::SyncConfig;
use crate::debounce::{Debouncer, TypingSignal, TypingTransition};
use crate::heartbeat::Heartbeat;
use crate::outbox::Outbox;
use crate::presence::{Presence, PresenceEntry};
use crate::protocol::{ClientEvent, Envelope, EventKind, ProtocolError, ServerEvent};
use crate::session::{Component, FailureOutcome, Identity, SessionError, SessionStatus, Supervisor};
use crate::transport::TransportEvent;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    FileTree(#[from] FileTreeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("{event} is not handled by {component:?}")]
    Misrouted { event: EventKind, component: Component },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Something the UI should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    StatusChanged(SessionStatus),
    UsernameTaken,
    ConnectionFailed { failures: u32 },
    UserJoined(PresenceEntry),
    UserLeft(PresenceEntry),
    PresenceChanged,
    FilesChanged,
    DrawingChanged,
    DrawingSynced(SyncSummary),
    ChatUpdated,
    /// An `error` event from the server.
    ServerError(String),
    /// An inbound handler failed; the event was dropped.
    Error(String),
}

/// Work for the async shell.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Resolve the channel path for `room_id` and open a transport.
    Connect { generation: u64, room_id: String },
    /// Close the transport of `generation`.
    Close { generation: u64 },
    Send(ClientEvent),
    /// Make a liveness call.
    Heartbeat { room_id: String, username: String },
    Notify(Notice),
}

pub struct Workspace {
    config: SyncConfig,
    session: Supervisor,
    presence: Presence,
    files: FileTree,
    drawing: DrawingScene,
    bootstrap: Bootstrapper,
    content: Debouncer<RecordId>,
    typing: TypingSignal,
    heartbeat: Heartbeat,
    chat: ChatLog,
    active_file: Option<RecordId>,
    cursor: Option<usize>,
    visibility: Visibility,
    outbox: Outbox,
    /// A channel is open and a join-request has been sent on it.
    link_up: bool,
    /// Edits sent on this channel before its file structure arrived.
    unconfirmed_files: Option<Vec<ClientEvent>>,
    local_files: mpsc::UnboundedReceiver<Patch<FileNode>>,
    local_drawing: mpsc::UnboundedReceiver<()>,
}

impl Workspace {
    pub fn new(config: SyncConfig) -> Self {
        let mut files = FileTree::new(&config.root_name);
        let (file_tx, local_files) = mpsc::unbounded_channel();
        files.listen(ListenFilter::Local, move |patch, _| {
            let _ = file_tx.send(patch.clone());
        });

        let mut drawing = DrawingScene::new();
        let (drawing_tx, local_drawing) = mpsc::unbounded_channel();
        drawing
            .replica_mut()
            .listen(ListenFilter::Local, move |_, _| {
                let _ = drawing_tx.send(());
            });

        Self {
            session: Supervisor::new(config.failure_threshold),
            presence: Presence::new(),
            files,
            drawing,
            bootstrap: Bootstrapper::new(config.bootstrap_timeout),
            content: Debouncer::new(config.content_debounce),
            typing: TypingSignal::new(config.typing_idle),
            heartbeat: Heartbeat::new(config.heartbeat_interval),
            chat: ChatLog::new(),
            active_file: None,
            cursor: None,
            visibility: Visibility::Visible,
            outbox: Outbox::new(config.outbox_capacity),
            link_up: false,
            unconfirmed_files: None,
            local_files,
            local_drawing,
            config,
        }
    }

    // ── Session ──────────────────────────────────────────────────

    /// Validate the identity and start a join attempt.
    pub fn join(&mut self, username: &str, room_id: &str) -> Result<Vec<Output>, WorkspaceError> {
        let identity = Identity::new(username, room_id)?;
        let room_id = identity.room_id.clone();
        let generation = self.session.begin_join(identity)?;
        self.link_up = false;
        self.outbox.bind(&room_id);
        Ok(vec![
            Output::Notify(Notice::StatusChanged(SessionStatus::AttemptingJoin)),
            Output::Connect {
                generation,
                room_id,
            },
        ])
    }

    /// Leave `ConnectionFailed`; the next [`Workspace::join`] starts afresh.
    pub fn retry(&mut self) -> Result<Vec<Output>, WorkspaceError> {
        self.session.retry()?;
        Ok(vec![Output::Notify(Notice::StatusChanged(SessionStatus::Initial))])
    }

    /// Explicit leave. Pending local state is emitted before the channel closes.
    pub fn leave(&mut self, now: Instant) -> Result<Vec<Output>, WorkspaceError> {
        if self.session.status() != SessionStatus::Joined {
            return Err(SessionError::NotJoined.into());
        }
        let mut out = self.flush_pending(now);
        let generation = self.session.generation();
        self.session.leave()?;
        self.reset_state();
        out.push(Output::Notify(Notice::StatusChanged(SessionStatus::Disconnected)));
        out.push(Output::Close { generation });
        Ok(out)
    }

    /// The view is going away: flush, drop every subscription, close.
    pub fn teardown(&mut self, now: Instant) -> Vec<Output> {
        let mut out = self.flush_pending(now);
        if !self.outbox.is_empty() {
            log::warn!("Closing with {} undelivered edits", self.outbox.len());
        }
        let generation = self.session.generation();
        let before = self.session.status();
        self.session.teardown();
        self.reset_state();
        if self.session.status() != before {
            out.push(Output::Notify(Notice::StatusChanged(self.session.status())));
        }
        out.push(Output::Close { generation });
        out
    }

    pub fn on_transport(&mut self, event: TransportEvent, now: Instant) -> Vec<Output> {
        let generation = event.generation();
        if generation != self.session.generation() {
            log::debug!("Ignoring transport event from generation {generation}");
            return Vec::new();
        }

        let mut out = Vec::new();
        match event {
            TransportEvent::Connected { .. } => {
                let was = self.session.status();
                let join = self.session.transport_connected().map(|identity| {
                    ClientEvent::JoinRequest {
                        username: identity.username.clone(),
                        room_id: identity.room_id.clone(),
                    }
                });
                if let Some(join) = join {
                    out.push(Output::Send(join));
                    self.link_up = true;
                    self.unconfirmed_files = Some(Vec::new());
                    let queued = self.outbox.drain();
                    if !queued.is_empty() {
                        log::info!("Replaying {} queued edits", queued.len());
                    }
                    for event in queued {
                        self.send(&mut out, event);
                    }
                }
                if self.session.status() != was {
                    out.push(Output::Notify(Notice::StatusChanged(self.session.status())));
                }
            }
            TransportEvent::Message { text, .. } => match ServerEvent::decode(&text) {
                Ok(event) => return self.handle(Envelope::new(generation, event), now),
                Err(e) => log::warn!("Skipping inbound frame: {e}"),
            },
            TransportEvent::Unsent { frames, .. } => {
                let edits: Vec<ClientEvent> = frames
                    .iter()
                    .filter_map(|text| match ClientEvent::decode(text) {
                        Ok(event) if event.is_edit() => Some(event),
                        Ok(_) => None,
                        Err(e) => {
                            log::warn!("Dropping unsent frame: {e}");
                            None
                        }
                    })
                    .collect();
                log::info!("Queueing {} unsent edits for replay", edits.len());
                self.outbox.requeue_front(edits);
            }
            TransportEvent::Error { message, .. } => {
                log::warn!("Transport error: {message}");
                self.link_up = false;
                let outcome = self.session.transport_failure();
                self.on_failure(outcome, generation, &mut out);
            }
            TransportEvent::Closed { .. } => {
                self.link_up = false;
                let outcome = self.session.transport_failure();
                self.on_failure(outcome, generation, &mut out);
            }
            TransportEvent::GaveUp { .. } => {
                self.link_up = false;
                let outcome = self.session.transport_exhausted();
                self.on_failure(outcome, generation, &mut out);
            }
        }
        out
    }

    fn on_failure(&mut self, outcome: FailureOutcome, generation: u64, out: &mut Vec<Output>) {
        match outcome {
            FailureOutcome::Retrying { failures } => {
                log::info!("Reconnecting quietly after {failures} failures");
            }
            FailureOutcome::GaveUp { failures } => {
                self.heartbeat.stop();
                self.bootstrap.reset();
                out.push(Output::Notify(Notice::StatusChanged(
                    SessionStatus::ConnectionFailed,
                )));
                out.push(Output::Notify(Notice::ConnectionFailed { failures }));
                out.push(Output::Close { generation });
            }
            FailureOutcome::Ignored => {}
        }
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Dispatch one inbound event to the component that owns it.
    ///
    /// Events from another generation, or of a kind nobody subscribed to,
    /// are dropped. A failing handler is reported as [`Notice::Error`] and
    /// does not affect any other component.
    pub fn handle(&mut self, envelope: Envelope, now: Instant) -> Vec<Output> {
        let kind = envelope.event.kind();
        let Some(component) = self.session.route(envelope.generation, kind) else {
            log::debug!(
                "Dropping {kind} from generation {} (current {})",
                envelope.generation,
                self.session.generation()
            );
            return Vec::new();
        };
        log::trace!("Inbound {kind} -> {component:?}");

        let mut out = Vec::new();
        let result = match component {
            Component::Session => self.on_session(envelope.event, now, &mut out),
            Component::Presence => self.on_presence(envelope.event, &mut out),
            Component::FileTree => self.on_file_tree(envelope.event, &mut out),
            Component::Drawing => self.on_drawing(envelope.event, &mut out),
            Component::Chat => self.on_chat(envelope.event, &mut out),
        };
        if let Err(e) = result {
            log::warn!("{kind} handler failed: {e}");
            out.push(Output::Notify(Notice::Error(e.to_string())));
        }

        out.extend(self.drain_local(now));
        out
    }

    fn on_session(
        &mut self,
        event: ServerEvent,
        now: Instant,
        out: &mut Vec<Output>,
    ) -> Result<(), WorkspaceError> {
        match event {
            ServerEvent::JoinAccepted { user, users } => {
                self.session.join_accepted()?;
                self.presence.seed(user, users);
                self.heartbeat.start(now);
                self.bootstrap.start(now);
                out.push(Output::Notify(Notice::StatusChanged(SessionStatus::Joined)));
                self.send(out, ClientEvent::DrawingReady {});
            }
            ServerEvent::UsernameExists {} => {
                let generation = self.session.generation();
                self.session.username_exists()?;
                self.link_up = false;
                out.push(Output::Notify(Notice::StatusChanged(SessionStatus::Initial)));
                out.push(Output::Notify(Notice::UsernameTaken));
                out.push(Output::Close { generation });
            }
            ServerEvent::Error { message } => {
                log::warn!("Server error: {message}");
                out.push(Output::Notify(Notice::ServerError(message)));
            }
            other => return Err(misrouted(other.kind(), Component::Session)),
        }
        Ok(())
    }

    fn on_presence(&mut self, event: ServerEvent, out: &mut Vec<Output>) -> Result<(), WorkspaceError> {
        match event {
            ServerEvent::UserJoined { user } => {
                log::info!("{} joined", user.username);
                self.presence.upsert(user.clone());
                out.push(Output::Notify(Notice::UserJoined(user)));
            }
            ServerEvent::UserDisconnected { user } => {
                log::info!("{} left", user.username);
                self.presence.remove_by_username(&user.username);
                out.push(Output::Notify(Notice::UserLeft(user)));
            }
            ServerEvent::Online { socket_id } => {
                if self.presence.set_online(&socket_id) {
                    out.push(Output::Notify(Notice::PresenceChanged));
                }
            }
            ServerEvent::Offline { socket_id } => {
                self.go_offline(&socket_id, out);
            }
            ServerEvent::TypingStart { user } | ServerEvent::TypingPause { user } => {
                self.presence.replace(user);
                out.push(Output::Notify(Notice::PresenceChanged));
            }
            other => return Err(misrouted(other.kind(), Component::Presence)),
        }
        Ok(())
    }

    /// Mark `socket_id` offline. For this client's own socket, buffered
    /// content is emitted first.
    fn go_offline(&mut self, socket_id: &str, out: &mut Vec<Output>) {
        let content = &mut self.content;
        let files = &self.files;
        let mut flushed = None;
        let changed = self.presence.set_offline(socket_id, || {
            flushed = content.flush().and_then(|id| content_event(files, &id));
        });
        if let Some(event) = flushed {
            self.send(out, event);
        }
        if changed {
            out.push(Output::Notify(Notice::PresenceChanged));
        }
    }

    fn on_file_tree(&mut self, event: ServerEvent, out: &mut Vec<Output>) -> Result<(), WorkspaceError> {
        let changed = match event {
            ServerEvent::SyncFileStructure { file_structure } => self.sync_file_structure(file_structure),
            ServerEvent::DirectoryCreated { node }
            | ServerEvent::DirectoryUpdated { node }
            | ServerEvent::DirectoryRenamed { node }
            | ServerEvent::FileCreated { node }
            | ServerEvent::FileRenamed { node } => {
                let patch = self.files.upsert_patch(node);
                self.files.apply(&patch, Origin::Remote).changed()
            }
            ServerEvent::FileUpdated {
                file_id,
                new_content,
            } => {
                if self.files.get(file_id.as_str()).is_none() {
                    log::warn!("Content for unknown file {file_id}; skipped");
                    return Ok(());
                }
                let patch = self.files.content_patch(file_id.as_str(), &new_content)?;
                self.files.apply(&patch, Origin::Remote).changed()
            }
            ServerEvent::DirectoryDeleted { id } | ServerEvent::FileDeleted { id } => {
                if self.files.get(id.as_str()).is_none() {
                    log::debug!("Delete for unknown node {id}; already gone");
                    return Ok(());
                }
                let patch = self.files.delete_patch(id.as_str())?;
                self.forget_removed(&patch);
                self.files.apply(&patch, Origin::Remote).changed()
            }
            other => return Err(misrouted(other.kind(), Component::FileTree)),
        };
        if changed > 0 {
            out.push(Output::Notify(Notice::FilesChanged));
        }
        Ok(())
    }

    /// Replace the tree with the server's copy. The local root is kept when
    /// the server does not send one.
    fn sync_file_structure(&mut self, nodes: Vec<FileNode>) -> usize {
        let mut target: BTreeMap<RecordId, FileNode> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        if !target.contains_key(ROOT_ID) {
            if let Some(root) = self.files.get(ROOT_ID) {
                target.insert(root.id.clone(), root.clone());
            }
        }

        // The snapshot predates edits sent on this channel and edits still
        // queued; replay both on top of it.
        let unconfirmed = self.unconfirmed_files.take().unwrap_or_default();
        for event in unconfirmed.iter().chain(self.outbox.iter()) {
            overlay_edit(&mut target, event);
        }
        if let Some(id) = self.content.pending() {
            if let (Some(local), Some(node)) = (self.files.get(id.as_str()), target.get_mut(id)) {
                node.content = local.content.clone();
            }
        }

        let patch = Patch::diff(self.files.replica().records(), &target);
        self.forget_removed(&patch);
        let report = self.files.apply(&patch, Origin::Remote);
        log::info!("File structure synced ({} nodes)", self.files.len());
        report.changed()
    }

    /// Drop pending work that refers to nodes `patch` removes.
    fn forget_removed(&mut self, patch: &Patch<FileNode>) {
        if self
            .content
            .pending()
            .is_some_and(|id| patch.removed.contains_key(id))
        {
            self.content.cancel();
        }
        if self
            .active_file
            .as_ref()
            .is_some_and(|id| patch.removed.contains_key(id))
        {
            self.active_file = None;
        }
    }

    fn on_drawing(&mut self, event: ServerEvent, out: &mut Vec<Output>) -> Result<(), WorkspaceError> {
        match event {
            ServerEvent::SyncDrawing { snapshots } => {
                let summary = self.bootstrap.snapshots(&mut self.drawing, &snapshots);
                if summary.skipped > 0 {
                    log::warn!("Drawing sync skipped {} records", summary.skipped);
                }
                self.unconfirmed_files = None;
                out.push(Output::Notify(Notice::DrawingSynced(summary)));
                self.emit_drawing(out);
            }
            ServerEvent::DrawingUpdate { snapshot } => {
                let (patch, anomalies) = snapshot.decode::<DrawingRecord>();
                let report = self.drawing.replica_mut().apply(&patch, Origin::Remote);
                log::debug!(
                    "Drawing update: {} changed, {} skipped",
                    report.changed(),
                    anomalies.len()
                );
                if report.changed() > 0 {
                    out.push(Output::Notify(Notice::DrawingChanged));
                }
            }
            ServerEvent::RequestDrawing {} => {
                let full = self
                    .drawing
                    .replica()
                    .iter()
                    .fold(Patch::new(), |p, r| p.with_added(r.clone()));
                let snapshot = full.to_raw()?;
                self.send(out, ClientEvent::SyncDrawing {
                    snapshots: vec![snapshot],
                });
            }
            other => return Err(misrouted(other.kind(), Component::Drawing)),
        }
        Ok(())
    }

    fn on_chat(&mut self, event: ServerEvent, out: &mut Vec<Output>) -> Result<(), WorkspaceError> {
        match event {
            ServerEvent::ReceiveMessage { message } => {
                if self.chat.append(message) {
                    out.push(Output::Notify(Notice::ChatUpdated));
                }
            }
            ServerEvent::MessageHistory { messages } => {
                self.chat.replace(messages);
                out.push(Output::Notify(Notice::ChatUpdated));
            }
            other => return Err(misrouted(other.kind(), Component::Chat)),
        }
        Ok(())
    }

    // ── Local edits ──────────────────────────────────────────────

    pub fn create_node(&mut self, node: FileNode, now: Instant) -> Result<Vec<Output>, WorkspaceError> {
        self.files.create(node)?;
        Ok(self.drain_local(now))
    }

    pub fn rename_node(
        &mut self,
        id: &str,
        name: &str,
        now: Instant,
    ) -> Result<Vec<Output>, WorkspaceError> {
        self.files.rename(id, name)?;
        Ok(self.drain_local(now))
    }

    /// Delete a node and its subtree.
    pub fn delete_node(&mut self, id: &str, now: Instant) -> Result<Vec<Output>, WorkspaceError> {
        self.files.delete(id)?;
        Ok(self.drain_local(now))
    }

    /// Focus a file. Buffered content of the previously active file is
    /// emitted right away.
    pub fn open_file(&mut self, id: &str, now: Instant) -> Result<Vec<Output>, WorkspaceError> {
        let node = self
            .files
            .get(id)
            .ok_or_else(|| FileTreeError::UnknownNode(id.to_string()))?;
        if node.is_dir() {
            return Err(FileTreeError::NotAFile(id.to_string()).into());
        }
        let node_id = node.id.clone();

        let mut out = Vec::new();
        if self.content.pending().is_some_and(|p| p.as_str() != id) {
            self.flush_content(&mut out);
        }
        self.active_file = Some(node_id);
        self.files.set_open(id, true)?;
        out.extend(self.drain_local(now));
        Ok(out)
    }

    /// A keystroke in the editor: new full content plus cursor offset.
    pub fn edit_file(
        &mut self,
        id: &str,
        content: &str,
        cursor: Option<usize>,
        now: Instant,
    ) -> Result<Vec<Output>, WorkspaceError> {
        self.files.update_content(id, content)?;
        self.cursor = cursor;
        self.active_file = Some(RecordId::new(id));
        Ok(self.drain_local(now))
    }

    /// Insert or replace drawing records.
    pub fn draw(
        &mut self,
        records: impl IntoIterator<Item = DrawingRecord>,
        now: Instant,
    ) -> Vec<Output> {
        self.drawing.replica_mut().put(records);
        self.drain_local(now)
    }

    pub fn erase<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>, now: Instant) -> Vec<Output> {
        self.drawing.replica_mut().remove(ids);
        self.drain_local(now)
    }

    pub fn send_chat(&mut self, text: &str) -> Result<Vec<Output>, WorkspaceError> {
        if self.session.status() != SessionStatus::Joined {
            return Err(SessionError::NotJoined.into());
        }
        let username = self
            .session
            .identity()
            .map(|i| i.username.clone())
            .ok_or(SessionError::NotJoined)?;
        let message = ChatMessage::compose(username, text);
        self.chat.append(message.clone());
        let mut out = Vec::new();
        self.send(&mut out, ClientEvent::SendMessage { message });
        out.push(Output::Notify(Notice::ChatUpdated));
        Ok(out)
    }

    pub fn set_visibility(&mut self, visibility: Visibility, now: Instant) -> Vec<Output> {
        if visibility == self.visibility {
            return Vec::new();
        }
        self.visibility = visibility;

        let mut out = Vec::new();
        let Some(socket_id) = self.presence.local().map(|l| l.socket_id.clone()) else {
            return out;
        };
        match visibility {
            Visibility::Hidden => {
                self.go_offline(&socket_id, &mut out);
                self.send(&mut out, ClientEvent::Offline { socket_id });
            }
            Visibility::Visible => {
                if self.presence.set_online(&socket_id) {
                    out.push(Output::Notify(Notice::PresenceChanged));
                }
                self.send(&mut out, ClientEvent::Online { socket_id });
                if self.heartbeat.visibility_regained(now) {
                    self.push_heartbeat(&mut out);
                }
            }
        }
        out
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Fire every timer whose deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Vec<Output> {
        let mut out = self.drain_local(now);

        if let Some(id) = self.content.poll(now) {
            if let Some(event) = content_event(&self.files, &id) {
                self.send(&mut out, event);
            }
        }
        if self.typing.poll(now).is_some() {
            self.send(&mut out, ClientEvent::TypingPause {});
        }
        if self.bootstrap.poll(&mut self.drawing, now) {
            self.unconfirmed_files = None;
            out.push(Output::Notify(Notice::DrawingSynced(SyncSummary::default())));
            self.emit_drawing(&mut out);
        }
        if self.heartbeat.due(now) {
            self.push_heartbeat(&mut out);
        }
        out
    }

    /// The earliest instant at which [`Workspace::poll`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.content.next_deadline(),
            self.typing.next_deadline(),
            self.bootstrap.next_deadline(),
            self.heartbeat.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Turn queued local replica changes into outbound events.
    fn drain_local(&mut self, now: Instant) -> Vec<Output> {
        let mut out = Vec::new();
        while let Ok(patch) = self.local_files.try_recv() {
            self.route_local_files(&patch, now, &mut out);
        }

        let mut drawing_dirty = false;
        while self.local_drawing.try_recv().is_ok() {
            drawing_dirty = true;
        }
        if drawing_dirty {
            self.emit_drawing(&mut out);
        }
        out
    }

    fn route_local_files(&mut self, patch: &Patch<FileNode>, now: Instant, out: &mut Vec<Output>) {
        for node in patch.added.values() {
            let event = if node.is_dir() {
                ClientEvent::DirectoryCreated { node: node.clone() }
            } else {
                ClientEvent::FileCreated { node: node.clone() }
            };
            self.send(out, event);
        }

        for (from, to) in patch.updated.values() {
            if from.name != to.name || from.parent_id != to.parent_id {
                let event = if to.is_dir() {
                    ClientEvent::DirectoryRenamed { node: to.clone() }
                } else {
                    ClientEvent::FileRenamed { node: to.clone() }
                };
                self.send(out, event);
            }
            if from.content != to.content && !to.is_dir() {
                self.content_changed(to.id.clone(), now, out);
            }
        }

        // Peers delete whole subtrees, so only the topmost removed node is sent.
        for node in patch.removed.values() {
            let parent_removed = node
                .parent_id
                .as_ref()
                .is_some_and(|p| patch.removed.contains_key(p));
            if !parent_removed {
                let event = if node.is_dir() {
                    ClientEvent::DirectoryDeleted { id: node.id.clone() }
                } else {
                    ClientEvent::FileDeleted { id: node.id.clone() }
                };
                self.send(out, event);
            }
        }
        self.forget_removed(patch);
    }

    fn content_changed(&mut self, id: RecordId, now: Instant, out: &mut Vec<Output>) {
        if let Some(previous) = self.content.notify(id.clone(), now) {
            if previous != id {
                if let Some(event) = content_event(&self.files, &previous) {
                    self.send(out, event);
                }
            }
        }
        if self.typing.mutation(now) == Some(TypingTransition::Start) {
            self.send(out, ClientEvent::TypingStart {
                cursor_position: self.cursor,
                current_file: Some(id),
            });
        }
    }

    /// Send pending drawing changes. They stay pending (uncommitted) until
    /// a joined channel can carry them.
    fn emit_drawing(&mut self, out: &mut Vec<Output>) {
        if !self.bootstrap.is_committed()
            || !self.link_up
            || self.session.status() != SessionStatus::Joined
        {
            log::debug!("Holding drawing changes until sync completes");
            return;
        }
        let Some(patch) = self.drawing.replica_mut().take_outbound() else {
            return;
        };
        match patch.to_raw() {
            Ok(snapshot) => self.send(out, ClientEvent::DrawingUpdate { snapshot }),
            Err(e) => log::error!("Dropping drawing update: {e}"),
        }
    }

    fn flush_content(&mut self, out: &mut Vec<Output>) {
        if let Some(id) = self.content.flush() {
            if let Some(event) = content_event(&self.files, &id) {
                self.send(out, event);
            }
        }
    }

    /// Emit everything still buffered: content, typing state, drawing.
    fn flush_pending(&mut self, now: Instant) -> Vec<Output> {
        let mut out = self.drain_local(now);
        self.flush_content(&mut out);
        if self.typing.stop().is_some() {
            self.send(&mut out, ClientEvent::TypingPause {});
        }
        self.emit_drawing(&mut out);
        out
    }

    fn push_heartbeat(&self, out: &mut Vec<Output>) {
        if self.session.status() != SessionStatus::Joined {
            return;
        }
        if let Some(identity) = self.session.identity() {
            out.push(Output::Heartbeat {
                room_id: identity.room_id.clone(),
                username: identity.username.clone(),
            });
        }
    }

    /// Emit `event` on the open channel, or queue it for replay when the
    /// session is still live but the channel is down.
    fn send(&mut self, out: &mut Vec<Output>, event: ClientEvent) {
        let status = self.session.status();
        let live = matches!(status, SessionStatus::AttemptingJoin | SessionStatus::Joined);
        if live && self.link_up {
            if let Some(sent) = self.unconfirmed_files.as_mut() {
                if event.is_edit() {
                    sent.push(event.clone());
                }
            }
            out.push(Output::Send(event));
        } else if live && event.is_edit() {
            log::debug!("Queueing {} until the channel is back", event.kind());
            self.outbox.enqueue(event);
        } else {
            log::debug!("Dropping {} while {status}", event.kind());
        }
    }

    fn reset_state(&mut self) {
        self.files.reset(&self.config.root_name);
        self.drawing.reset();
        self.presence.clear();
        self.chat.clear();
        self.bootstrap.reset();
        self.heartbeat.stop();
        self.content.cancel();
        self.typing.stop();
        self.active_file = None;
        self.cursor = None;
        self.outbox.clear();
        self.link_up = false;
        self.unconfirmed_files = None;
        while self.local_files.try_recv().is_ok() {}
        while self.local_drawing.try_recv().is_ok() {}
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn generation(&self) -> u64 {
        self.session.generation()
    }

    pub fn failures(&self) -> u32 {
        self.session.failures()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.session.identity()
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn files(&self) -> &FileTree {
        &self.files
    }

    pub fn drawing(&self) -> &DrawingScene {
        &self.drawing
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    /// Edits waiting for the channel to come back.
    pub fn queued_edits(&self) -> usize {
        self.outbox.len()
    }

    pub fn active_file(&self) -> Option<&RecordId> {
        self.active_file.as_ref()
    }

    /// Remote users typing in the active file.
    pub fn active_cursors(&self) -> Vec<&PresenceEntry> {
        match &self.active_file {
            Some(id) => self.presence.active_cursors(id.as_str()),
            None => Vec::new(),
        }
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.bootstrap.state()
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

fn misrouted(event: EventKind, component: Component) -> WorkspaceError {
    WorkspaceError::Misrouted { event, component }
}

/// Apply one outbound file event to a node map.
fn overlay_edit(target: &mut BTreeMap<RecordId, FileNode>, event: &ClientEvent) {
    match event {
        ClientEvent::DirectoryCreated { node }
        | ClientEvent::DirectoryUpdated { node }
        | ClientEvent::DirectoryRenamed { node }
        | ClientEvent::FileCreated { node }
        | ClientEvent::FileRenamed { node } => {
            target.insert(node.id.clone(), node.clone());
        }
        ClientEvent::FileUpdated {
            file_id,
            new_content,
        } => {
            if let Some(node) = target.get_mut(file_id) {
                node.content = Some(new_content.clone());
            }
        }
        ClientEvent::DirectoryDeleted { id } | ClientEvent::FileDeleted { id } => {
            let mut doomed = vec![id.clone()];
            let mut next = 0;
            while next < doomed.len() {
                let parent = doomed[next].clone();
                doomed.extend(
                    target
                        .values()
                        .filter(|n| n.parent_id.as_ref() == Some(&parent))
                        .map(|n| n.id.clone()),
                );
                next += 1;
            }
            for id in doomed {
                target.remove(&id);
            }
        }
        _ => {}
    }
}

fn content_event(files: &FileTree, id: &RecordId) -> Option<ClientEvent> {
    let node = files.get(id.as_str())?;
    Some(ClientEvent::FileUpdated {
        file_id: node.id().clone(),
        new_content: node.content.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::ConnectionStatus;
    use serde_json::json;
    use std::time::Duration;
    use tandem_core::RawPatch;

    fn config() -> SyncConfig {
        SyncConfig::direct("http://127.0.0.1:9")
    }

    fn accepted(username: &str, socket: &str) -> ServerEvent {
        ServerEvent::JoinAccepted {
            user: PresenceEntry::new(username, "room-1", socket),
            users: vec![PresenceEntry::new("bob", "room-1", "s-bob")],
        }
    }

    /// A workspace joined as alice with its drawing baseline committed.
    fn joined(t0: Instant) -> Workspace {
        let mut ws = Workspace::new(config());
        ws.join("alice", "room-1").unwrap();
        let generation = ws.generation();
        ws.on_transport(TransportEvent::Connected { generation }, t0);
        ws.handle(Envelope::new(generation, accepted("alice", "s-alice")), t0);
        ws.handle(
            Envelope::new(generation, ServerEvent::SyncDrawing { snapshots: vec![] }),
            t0,
        );
        ws
    }

    fn sent(out: &[Output]) -> Vec<&ClientEvent> {
        out.iter()
            .filter_map(|o| match o {
                Output::Send(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn sent_kinds(out: &[Output]) -> Vec<EventKind> {
        sent(out).into_iter().map(ClientEvent::kind).collect()
    }

    fn inbound(ws: &mut Workspace, event: ServerEvent, now: Instant) -> Vec<Output> {
        let generation = ws.generation();
        ws.handle(Envelope::new(generation, event), now)
    }

    fn create_file(ws: &mut Workspace, name: &str, now: Instant) -> RecordId {
        let node = FileNode::file(name, &RecordId::new(ROOT_ID), "");
        let id = node.id.clone();
        ws.create_node(node, now).unwrap();
        id
    }

    #[test]
    fn test_join_flow() {
        let t0 = Instant::now();
        let mut ws = Workspace::new(config());

        let out = ws.join("  alice ", "room-1").unwrap();
        let generation = ws.generation();
        assert_eq!(
            out[1],
            Output::Connect {
                generation,
                room_id: "room-1".into()
            }
        );
        assert_eq!(ws.status(), SessionStatus::AttemptingJoin);

        let out = ws.on_transport(TransportEvent::Connected { generation }, t0);
        assert_eq!(
            sent(&out),
            vec![&ClientEvent::JoinRequest {
                username: "alice".into(),
                room_id: "room-1".into()
            }]
        );

        let out = ws.handle(Envelope::new(generation, accepted("alice", "s-alice")), t0);
        assert_eq!(ws.status(), SessionStatus::Joined);
        assert_eq!(sent_kinds(&out), vec![EventKind::DrawingReady]);
        assert_eq!(ws.presence().len(), 2);
        assert!(ws.presence().is_local("s-alice"));
        assert!(matches!(ws.bootstrap_state(), BootstrapState::AwaitingSnapshot { .. }));
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let mut ws = Workspace::new(config());
        assert!(matches!(
            ws.join("al", "room-1"),
            Err(WorkspaceError::Session(SessionError::InvalidIdentity(_)))
        ));
        assert_eq!(ws.status(), SessionStatus::Initial);
    }

    #[test]
    fn test_remote_patches_never_echo() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let node = FileNode::file("a.js", &RecordId::new(ROOT_ID), "x").with_id("f1");

        let mut out = inbound(&mut ws, ServerEvent::FileCreated { node }, t0);
        out.extend(inbound(
            &mut ws,
            ServerEvent::FileUpdated {
                file_id: RecordId::new("f1"),
                new_content: "x = 2".into(),
            },
            t0,
        ));
        let snapshot = Patch::new()
            .with_added(DrawingRecord::new("shape:1", "shape"))
            .to_raw()
            .unwrap();
        out.extend(inbound(&mut ws, ServerEvent::DrawingUpdate { snapshot }, t0));
        out.extend(ws.poll(t0 + Duration::from_secs(60)));

        assert!(sent(&out).is_empty());
        assert_eq!(ws.files().get("f1").unwrap().content.as_deref(), Some("x = 2"));
        assert_eq!(ws.drawing().replica().len(), 1);
        assert!(ws.drawing().replica().pending_local().is_empty());
    }

    #[test]
    fn test_content_edits_coalesce_into_one_update() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let id = create_file(&mut ws, "a.js", t0);

        let mut out = Vec::new();
        for i in 0..10u64 {
            let now = t0 + Duration::from_millis(i * 100);
            out.extend(ws.edit_file(id.as_str(), &format!("v{i}"), Some(i as usize), now).unwrap());
        }
        out.extend(ws.poll(t0 + Duration::from_millis(5000)));
        let updates = |out: &[Output]| {
            sent(out)
                .into_iter()
                .filter(|e| e.kind() == EventKind::FileUpdated)
                .cloned()
                .collect::<Vec<_>>()
        };
        assert!(updates(&out).is_empty());

        let fired = ws.poll(t0 + Duration::from_millis(900) + Duration::from_millis(5000));
        assert_eq!(
            updates(&fired),
            vec![ClientEvent::FileUpdated {
                file_id: id,
                new_content: "v9".into()
            }]
        );
    }

    #[test]
    fn test_teardown_flushes_pending_content() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let id = create_file(&mut ws, "a.js", t0);
        ws.edit_file(id.as_str(), "unsaved", None, t0).unwrap();

        let out = ws.teardown(t0 + Duration::from_millis(10));
        let kinds = sent_kinds(&out);
        assert_eq!(kinds, vec![EventKind::FileUpdated, EventKind::TypingPause]);
        assert!(out.contains(&Output::Close { generation: 1 }));
        assert_eq!(ws.status(), SessionStatus::Disconnected);
        assert!(ws.next_deadline().is_none());
    }

    #[test]
    fn test_offline_flushes_before_status_flip() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let id = create_file(&mut ws, "f1.js", t0);
        ws.edit_file(id.as_str(), "draft", Some(5), t0).unwrap();

        let out = inbound(
            &mut ws,
            ServerEvent::Offline {
                socket_id: "s-alice".into(),
            },
            t0 + Duration::from_millis(50),
        );

        assert_eq!(
            out[0],
            Output::Send(ClientEvent::FileUpdated {
                file_id: id,
                new_content: "draft".into()
            })
        );
        assert_eq!(
            ws.presence().get("s-alice").unwrap().status,
            ConnectionStatus::Offline
        );
        assert!(ws.poll(t0 + Duration::from_secs(10)).iter().all(|o| !matches!(
            o,
            Output::Send(ClientEvent::FileUpdated { .. })
        )));
    }

    #[test]
    fn test_remote_offline_does_not_flush() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let id = create_file(&mut ws, "a.js", t0);
        ws.edit_file(id.as_str(), "draft", None, t0).unwrap();

        let out = inbound(
            &mut ws,
            ServerEvent::Offline {
                socket_id: "s-bob".into(),
            },
            t0,
        );
        assert!(sent(&out).is_empty());
        assert!(!ws.presence().get("s-bob").unwrap().is_online());
    }

    #[test]
    fn test_two_failures_stay_quiet_third_fails() {
        let t0 = Instant::now();
        let mut ws = Workspace::new(config());
        ws.join("alice", "room-1").unwrap();
        let generation = ws.generation();
        let error = || TransportEvent::Error {
            generation,
            message: "refused".into(),
        };

        let mut out = ws.on_transport(error(), t0);
        out.extend(ws.on_transport(error(), t0));
        assert!(out.is_empty());
        assert_eq!(ws.status(), SessionStatus::AttemptingJoin);

        let out = ws.on_transport(error(), t0);
        assert!(out.contains(&Output::Notify(Notice::ConnectionFailed { failures: 3 })));
        assert!(out.contains(&Output::Close { generation }));
        assert_eq!(ws.status(), SessionStatus::ConnectionFailed);

        ws.retry().unwrap();
        assert_eq!(ws.status(), SessionStatus::Initial);
        assert!(ws.join("alice", "room-1").is_ok());
    }

    #[test]
    fn test_reconnect_after_two_failures_is_silent() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let generation = ws.generation();

        ws.on_transport(TransportEvent::Closed { generation }, t0);
        ws.on_transport(
            TransportEvent::Error {
                generation,
                message: "refused".into(),
            },
            t0,
        );
        let out = ws.on_transport(TransportEvent::Connected { generation }, t0);
        assert_eq!(sent_kinds(&out), vec![EventKind::JoinRequest]);
        let out = inbound(&mut ws, accepted("alice", "s-alice-2"), t0);

        assert!(!out
            .iter()
            .any(|o| matches!(o, Output::Notify(Notice::ConnectionFailed { .. }))));
        assert_eq!(ws.status(), SessionStatus::Joined);
        assert_eq!(ws.failures(), 0);
    }

    #[test]
    fn test_username_taken_then_rejoin() {
        let t0 = Instant::now();
        let mut ws = Workspace::new(config());
        ws.join("alice", "room-1").unwrap();
        let first = ws.generation();
        ws.on_transport(
            TransportEvent::Error {
                generation: first,
                message: "blip".into(),
            },
            t0,
        );
        ws.on_transport(TransportEvent::Connected { generation: first }, t0);

        let out = inbound(&mut ws, ServerEvent::UsernameExists {}, t0);
        assert!(out.contains(&Output::Notify(Notice::UsernameTaken)));
        assert!(out.contains(&Output::Close { generation: first }));
        assert_eq!(ws.status(), SessionStatus::Initial);
        assert_eq!(ws.failures(), 1);

        ws.join("alice2", "room-1").unwrap();
        let second = ws.generation();
        assert_ne!(first, second);

        let stale = ws.handle(Envelope::new(first, accepted("alice", "s-old")), t0);
        assert!(stale.is_empty());
        assert_eq!(ws.status(), SessionStatus::AttemptingJoin);

        ws.on_transport(TransportEvent::Connected { generation: second }, t0);
        ws.handle(Envelope::new(second, accepted("alice2", "s-new")), t0);
        assert_eq!(ws.status(), SessionStatus::Joined);
    }

    #[test]
    fn test_stale_transport_events_ignored() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let old = ws.generation() - 1;
        assert!(ws
            .on_transport(TransportEvent::GaveUp { generation: old }, t0)
            .is_empty());
        assert_eq!(ws.status(), SessionStatus::Joined);
    }

    #[test]
    fn test_drawing_converges_between_two_clients() {
        let t0 = Instant::now();
        let mut a = joined(t0);
        let mut b = joined(t0);

        let out = a.draw([DrawingRecord::new("shape:1", "shape").with("x", json!(1))], t0);
        let snapshot = match sent(&out)[..] {
            [ClientEvent::DrawingUpdate { snapshot }] => snapshot.clone(),
            ref other => panic!("unexpected {other:?}"),
        };
        inbound(&mut b, ServerEvent::DrawingUpdate { snapshot }, t0);

        let out = b.draw([DrawingRecord::new("shape:1", "shape").with("x", json!(2))], t0);
        let snapshot = match sent(&out)[..] {
            [ClientEvent::DrawingUpdate { snapshot }] => snapshot.clone(),
            ref other => panic!("unexpected {other:?}"),
        };
        assert_eq!(snapshot.updated.len(), 1);
        let echo = inbound(&mut a, ServerEvent::DrawingUpdate { snapshot }, t0);
        assert!(sent(&echo).is_empty());

        assert_eq!(a.drawing().replica().records(), b.drawing().replica().records());
        assert_eq!(
            a.drawing().replica().get("shape:1").unwrap().get("x"),
            Some(&json!(2))
        );
    }

    #[test]
    fn test_drawing_held_until_sync_completes() {
        let t0 = Instant::now();
        let mut ws = Workspace::new(config());
        ws.join("alice", "room-1").unwrap();
        let generation = ws.generation();
        ws.on_transport(TransportEvent::Connected { generation }, t0);
        ws.handle(Envelope::new(generation, accepted("alice", "s-alice")), t0);

        let out = ws.draw([DrawingRecord::new("shape:1", "shape")], t0);
        assert!(sent(&out).is_empty());

        let out = ws.poll(t0 + Duration::from_secs(3));
        assert!(out.contains(&Output::Notify(Notice::DrawingSynced(SyncSummary::default()))));
        assert_eq!(ws.bootstrap_state(), BootstrapState::BaselineCommitted);

        let out = ws.draw([DrawingRecord::new("shape:2", "shape")], t0);
        assert_eq!(sent_kinds(&out), vec![EventKind::DrawingUpdate]);
    }

    #[test]
    fn test_malformed_drawing_record_skipped() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let snapshot: RawPatch = serde_json::from_value(json!({
            "added": {
                "shape:1": {"id": "shape:1", "typeName": "shape"},
                "shape:2": 42
            }
        }))
        .unwrap();

        let out = inbound(&mut ws, ServerEvent::DrawingUpdate { snapshot }, t0);
        assert!(out.contains(&Output::Notify(Notice::DrawingChanged)));
        assert_eq!(ws.drawing().replica().len(), 1);
    }

    #[test]
    fn test_typing_start_once_then_pause() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let id = create_file(&mut ws, "a.js", t0);

        let out = ws.edit_file(id.as_str(), "a", Some(1), t0).unwrap();
        assert_eq!(
            sent(&out),
            vec![&ClientEvent::TypingStart {
                cursor_position: Some(1),
                current_file: Some(id.clone())
            }]
        );
        let out = ws
            .edit_file(id.as_str(), "ab", Some(2), t0 + Duration::from_millis(400))
            .unwrap();
        assert!(sent(&out).is_empty());

        let out = ws.poll(t0 + Duration::from_millis(1400));
        assert_eq!(sent_kinds(&out), vec![EventKind::TypingPause]);
    }

    #[test]
    fn test_remote_typing_drives_active_cursors() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let id = create_file(&mut ws, "a.js", t0);
        ws.open_file(id.as_str(), t0).unwrap();

        let bob = PresenceEntry {
            typing: true,
            current_file: Some(id.clone()),
            cursor_position: Some(3),
            ..PresenceEntry::new("bob", "room-1", "s-bob")
        };
        inbound(&mut ws, ServerEvent::TypingStart { user: bob.clone() }, t0);
        assert_eq!(ws.active_cursors().len(), 1);

        let paused = PresenceEntry { typing: false, ..bob };
        inbound(&mut ws, ServerEvent::TypingPause { user: paused }, t0);
        assert!(ws.active_cursors().is_empty());
    }

    #[test]
    fn test_request_drawing_replies_with_full_scene() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        ws.draw(
            [
                DrawingRecord::new("page:1", "page"),
                DrawingRecord::new("shape:1", "shape"),
            ],
            t0,
        );

        let out = inbound(&mut ws, ServerEvent::RequestDrawing {}, t0);
        match sent(&out)[..] {
            [ClientEvent::SyncDrawing { snapshots }] => {
                assert_eq!(snapshots.len(), 1);
                assert_eq!(snapshots[0].added.len(), 2);
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sync_file_structure_replaces_tree() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let stale = create_file(&mut ws, "old.js", t0);
        let root = RecordId::new(ROOT_ID);
        let src = FileNode::directory("src", &root).with_id("d1");
        let main = FileNode::file("main.js", &RecordId::new("d1"), "go()").with_id("f1");

        let out = inbound(
            &mut ws,
            ServerEvent::SyncFileStructure {
                file_structure: vec![src, main],
            },
            t0,
        );

        assert!(sent(&out).is_empty());
        assert!(ws.files().get(stale.as_str()).is_none());
        assert!(ws.files().get(ROOT_ID).is_some());
        assert_eq!(ws.files().path_of("f1").as_deref(), Some("./src/main.js"));
    }

    #[test]
    fn test_local_delete_sends_subtree_root_only() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let root = RecordId::new(ROOT_ID);
        let dir = FileNode::directory("src", &root);
        let dir_id = dir.id.clone();
        ws.create_node(dir, t0).unwrap();
        let file = FileNode::file("a.js", &dir_id, "");
        let file_id = file.id.clone();
        ws.create_node(file, t0).unwrap();
        ws.open_file(file_id.as_str(), t0).unwrap();

        let out = ws.delete_node(dir_id.as_str(), t0).unwrap();
        assert_eq!(
            sent(&out),
            vec![&ClientEvent::DirectoryDeleted { id: dir_id }]
        );
        assert_eq!(ws.active_file(), None);
    }

    #[test]
    fn test_rename_emits_renamed_node() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let id = create_file(&mut ws, "a.js", t0);

        let out = ws.rename_node(id.as_str(), "b.js", t0).unwrap();
        match sent(&out)[..] {
            [ClientEvent::FileRenamed { node }] => assert_eq!(node.name, "b.js"),
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_handler_error_is_isolated() {
        let t0 = Instant::now();
        let mut ws = joined(t0);

        let out = inbound(&mut ws, accepted("alice", "s-alice"), t0);
        assert!(matches!(out[..], [Output::Notify(Notice::Error(_))]));
        assert_eq!(ws.status(), SessionStatus::Joined);

        let out = inbound(
            &mut ws,
            ServerEvent::UserJoined {
                user: PresenceEntry::new("carol", "room-1", "s-carol"),
            },
            t0,
        );
        assert!(matches!(out[..], [Output::Notify(Notice::UserJoined(_))]));
    }

    #[test]
    fn test_malformed_frame_skipped() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let generation = ws.generation();

        let out = ws.on_transport(
            TransportEvent::Message {
                generation,
                text: r#"{"event":"online","data":{"socket":1}}"#.into(),
            },
            t0,
        );
        assert!(out.is_empty());

        let out = ws.on_transport(
            TransportEvent::Message {
                generation,
                text: r#"{"event":"error","data":{"message":"room is full"}}"#.into(),
            },
            t0,
        );
        assert_eq!(
            out,
            vec![Output::Notify(Notice::ServerError("room is full".into()))]
        );
    }

    #[test]
    fn test_visibility_round_trip() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let id = create_file(&mut ws, "a.js", t0);
        ws.edit_file(id.as_str(), "draft", None, t0).unwrap();

        let out = ws.set_visibility(Visibility::Hidden, t0);
        assert_eq!(
            sent_kinds(&out),
            vec![EventKind::FileUpdated, EventKind::Offline]
        );
        assert!(!ws.presence().local().unwrap().is_online());

        let out = ws.set_visibility(Visibility::Visible, t0 + Duration::from_secs(30));
        assert_eq!(sent_kinds(&out), vec![EventKind::Online]);
        assert!(out.contains(&Output::Heartbeat {
            room_id: "room-1".into(),
            username: "alice".into()
        }));
    }

    #[test]
    fn test_heartbeat_due_while_joined() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let out = ws.poll(t0 + Duration::from_secs(600));
        assert!(out.iter().any(|o| matches!(o, Output::Heartbeat { .. })));
    }

    #[test]
    fn test_sends_dropped_when_not_joined() {
        let t0 = Instant::now();
        let mut ws = Workspace::new(config());
        let out = ws.create_node(FileNode::file("a.js", &RecordId::new(ROOT_ID), ""), t0);
        assert!(sent(&out.unwrap()).is_empty());
        assert!(matches!(
            ws.send_chat("hi"),
            Err(WorkspaceError::Session(SessionError::NotJoined))
        ));
    }

    #[test]
    fn test_chat_flow() {
        let t0 = Instant::now();
        let mut ws = joined(t0);

        let out = ws.send_chat("hello").unwrap();
        assert_eq!(sent_kinds(&out), vec![EventKind::SendMessage]);
        assert_eq!(ws.chat().len(), 1);

        let remote = ChatMessage::compose("bob", "hi alice");
        inbound(
            &mut ws,
            ServerEvent::ReceiveMessage {
                message: remote.clone(),
            },
            t0,
        );
        inbound(
            &mut ws,
            ServerEvent::ReceiveMessage { message: remote },
            t0,
        );
        assert_eq!(ws.chat().len(), 2);

        inbound(&mut ws, ServerEvent::MessageHistory { messages: vec![] }, t0);
        assert!(ws.chat().is_empty());
    }

    #[test]
    fn test_leave_resets_documents() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        create_file(&mut ws, "a.js", t0);

        let out = ws.leave(t0).unwrap();
        assert!(out.contains(&Output::Notify(Notice::StatusChanged(
            SessionStatus::Disconnected
        ))));
        assert_eq!(ws.files().len(), 1);
        assert!(ws.presence().is_empty());
        assert!(ws.leave(t0).is_err());
    }

    #[test]
    fn test_drawing_edit_during_reconnect_is_sent_after_resync() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let generation = ws.generation();

        ws.on_transport(TransportEvent::Closed { generation }, t0);
        let out = ws.draw([DrawingRecord::new("shape:9", "shape")], t0);
        assert!(sent(&out).is_empty());

        let out = ws.on_transport(TransportEvent::Connected { generation }, t0);
        assert_eq!(sent_kinds(&out), vec![EventKind::JoinRequest]);
        let out = inbound(&mut ws, accepted("alice", "s-alice-2"), t0);
        assert_eq!(sent_kinds(&out), vec![EventKind::DrawingReady]);

        let out = inbound(&mut ws, ServerEvent::SyncDrawing { snapshots: vec![] }, t0);
        match sent(&out)[..] {
            [ClientEvent::DrawingUpdate { snapshot }] => {
                assert!(snapshot.added.contains_key("shape:9"));
            }
            ref other => panic!("unexpected {other:?}"),
        }
        assert!(ws.drawing().replica().pending_local().is_empty());
    }

    #[test]
    fn test_file_edits_during_reconnect_survive_resync() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let generation = ws.generation();
        let kept = create_file(&mut ws, "kept.js", t0);
        let server_copy = ws.files().get(kept.as_str()).unwrap().clone();

        ws.on_transport(TransportEvent::Closed { generation }, t0);
        let offline = FileNode::file("offline.js", &RecordId::new(ROOT_ID), "").with_id("f-off");
        let out = ws.create_node(offline, t0).unwrap();
        assert!(sent(&out).is_empty());
        assert_eq!(ws.queued_edits(), 1);
        ws.edit_file("f-off", "draft", None, t0).unwrap();

        let out = ws.on_transport(TransportEvent::Connected { generation }, t0);
        assert_eq!(
            sent_kinds(&out),
            vec![EventKind::JoinRequest, EventKind::FileCreated]
        );
        assert_eq!(ws.queued_edits(), 0);
        inbound(&mut ws, accepted("alice", "s-alice-2"), t0);

        // Taken by the server before the replayed create reached it.
        let out = inbound(
            &mut ws,
            ServerEvent::SyncFileStructure {
                file_structure: vec![server_copy],
            },
            t0,
        );
        assert!(sent(&out).is_empty());
        assert_eq!(ws.files().get("f-off").unwrap().content.as_deref(), Some("draft"));
        assert!(ws.files().get(kept.as_str()).is_some());

        let fired = ws.poll(t0 + Duration::from_secs(10));
        assert!(sent(&fired).contains(&&ClientEvent::FileUpdated {
            file_id: RecordId::new("f-off"),
            new_content: "draft".into()
        }));
    }

    #[test]
    fn test_teardown_while_rejoining_flushes_content() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let generation = ws.generation();
        let id = create_file(&mut ws, "a.js", t0);
        ws.edit_file(id.as_str(), "unsaved", None, t0).unwrap();

        ws.on_transport(TransportEvent::Closed { generation }, t0);
        ws.on_transport(TransportEvent::Connected { generation }, t0);
        assert_eq!(ws.status(), SessionStatus::AttemptingJoin);

        let out = ws.teardown(t0 + Duration::from_millis(10));
        assert!(sent(&out).contains(&&ClientEvent::FileUpdated {
            file_id: id,
            new_content: "unsaved".into()
        }));
        assert_eq!(ws.status(), SessionStatus::Initial);
    }

    #[test]
    fn test_content_timer_fires_while_rejoining() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let generation = ws.generation();
        let id = create_file(&mut ws, "a.js", t0);
        ws.edit_file(id.as_str(), "v1", None, t0).unwrap();

        ws.on_transport(TransportEvent::Closed { generation }, t0);
        ws.on_transport(TransportEvent::Connected { generation }, t0);
        let out = ws.poll(t0 + Duration::from_secs(6));
        assert!(sent_kinds(&out).contains(&EventKind::FileUpdated));
    }

    #[test]
    fn test_unsent_frames_replayed_after_join_request() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let generation = ws.generation();
        let out = ws.draw([DrawingRecord::new("shape:1", "shape")], t0);
        let frame = match sent(&out)[..] {
            [event] => event.encode().unwrap(),
            ref other => panic!("unexpected {other:?}"),
        };

        ws.on_transport(TransportEvent::Closed { generation }, t0);
        ws.on_transport(
            TransportEvent::Unsent {
                generation,
                frames: vec![frame, ClientEvent::TypingPause {}.encode().unwrap()],
            },
            t0,
        );
        assert_eq!(ws.queued_edits(), 1);

        let out = ws.on_transport(TransportEvent::Connected { generation }, t0);
        assert_eq!(
            sent_kinds(&out),
            vec![EventKind::JoinRequest, EventKind::DrawingUpdate]
        );
    }

    #[test]
    fn test_chat_while_channel_down_is_queued() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let generation = ws.generation();
        ws.on_transport(TransportEvent::Closed { generation }, t0);

        let out = ws.send_chat("still here").unwrap();
        assert!(sent(&out).is_empty());
        assert_eq!(ws.chat().len(), 1);

        let out = ws.on_transport(TransportEvent::Connected { generation }, t0);
        assert_eq!(
            sent_kinds(&out),
            vec![EventKind::JoinRequest, EventKind::SendMessage]
        );
    }

    #[test]
    fn test_leave_drops_queued_edits() {
        let t0 = Instant::now();
        let mut ws = joined(t0);
        let generation = ws.generation();
        ws.on_transport(TransportEvent::Closed { generation }, t0);
        create_file(&mut ws, "a.js", t0);
        assert_eq!(ws.queued_edits(), 1);

        ws.leave(t0).unwrap();
        assert_eq!(ws.queued_edits(), 0);
    }
}
