//! Async shell around [`Workspace`].
//!
//! One task owns the workspace and the transport. It selects over UI
//! commands, transport events, resolved channel paths and the earliest
//! workspace timer, and carries out every [`Output`] the workspace returns.
//! The UI talks to it through a cloneable [`SyncHandle`] and receives
//! [`Notice`]s on an unbounded channel.

use std::time::Instant;
use tandem_core::{DrawingRecord, FileNode, RecordId, Record};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::api::{ApiError, RoomApi};
use crate::bootstrap::BootstrapState;
use crate::chat::ChatMessage;
use crate::config::SyncConfig;
use crate::presence::PresenceEntry;
use crate::session::SessionStatus;
use crate::transport::{Transport, TransportEvent};
use crate::workspace::{Notice, Output, Visibility, Workspace, WorkspaceError};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("sync client has stopped")]
    Stopped,
}

type Reply = oneshot::Sender<Result<(), WorkspaceError>>;

enum Command {
    Join { username: String, room_id: String, reply: Reply },
    Retry { reply: Reply },
    Leave { reply: Reply },
    CreateNode { node: FileNode, reply: Reply },
    RenameNode { id: String, name: String, reply: Reply },
    DeleteNode { id: String, reply: Reply },
    OpenFile { id: String, reply: Reply },
    EditFile { id: String, content: String, cursor: Option<usize>, reply: Reply },
    Draw { records: Vec<DrawingRecord>, reply: Reply },
    Erase { ids: Vec<String>, reply: Reply },
    SendChat { text: String, reply: Reply },
    SetVisibility { visibility: Visibility, reply: Reply },
    Snapshot { reply: oneshot::Sender<WorkspaceSnapshot> },
    Shutdown,
}

/// Point-in-time copy of the workspace state.
#[derive(Debug, Clone)]
pub struct WorkspaceSnapshot {
    pub status: SessionStatus,
    pub generation: u64,
    pub failures: u32,
    pub local: Option<PresenceEntry>,
    pub users: Vec<PresenceEntry>,
    pub files: Vec<FileNode>,
    pub drawing: Vec<DrawingRecord>,
    pub chat: Vec<ChatMessage>,
    pub active_file: Option<RecordId>,
    pub bootstrap: BootstrapState,
    pub visibility: Visibility,
    /// Edits waiting for the channel to come back.
    pub queued_edits: usize,
}

impl WorkspaceSnapshot {
    pub fn file(&self, id: &str) -> Option<&FileNode> {
        self.files.iter().find(|n| n.id.as_str() == id)
    }

    pub fn drawing_record(&self, id: &str) -> Option<&DrawingRecord> {
        self.drawing.iter().find(|r| r.id().as_str() == id)
    }
}

/// Cloneable command handle for a running [`SyncClient`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
}

impl SyncHandle {
    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)??;
        Ok(())
    }

    pub async fn join(&self, username: &str, room_id: &str) -> Result<(), ClientError> {
        let (username, room_id) = (username.to_string(), room_id.to_string());
        self.request(|reply| Command::Join { username, room_id, reply }).await
    }

    pub async fn retry(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Retry { reply }).await
    }

    pub async fn leave(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Leave { reply }).await
    }

    pub async fn create_node(&self, node: FileNode) -> Result<(), ClientError> {
        self.request(|reply| Command::CreateNode { node, reply }).await
    }

    pub async fn rename_node(&self, id: &str, name: &str) -> Result<(), ClientError> {
        let (id, name) = (id.to_string(), name.to_string());
        self.request(|reply| Command::RenameNode { id, name, reply }).await
    }

    pub async fn delete_node(&self, id: &str) -> Result<(), ClientError> {
        let id = id.to_string();
        self.request(|reply| Command::DeleteNode { id, reply }).await
    }

    pub async fn open_file(&self, id: &str) -> Result<(), ClientError> {
        let id = id.to_string();
        self.request(|reply| Command::OpenFile { id, reply }).await
    }

    pub async fn edit_file(
        &self,
        id: &str,
        content: &str,
        cursor: Option<usize>,
    ) -> Result<(), ClientError> {
        let (id, content) = (id.to_string(), content.to_string());
        self.request(|reply| Command::EditFile { id, content, cursor, reply })
            .await
    }

    pub async fn draw(&self, records: Vec<DrawingRecord>) -> Result<(), ClientError> {
        self.request(|reply| Command::Draw { records, reply }).await
    }

    pub async fn erase(&self, ids: &[&str]) -> Result<(), ClientError> {
        let ids = ids.iter().map(|s| s.to_string()).collect();
        self.request(|reply| Command::Erase { ids, reply }).await
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), ClientError> {
        let text = text.to_string();
        self.request(|reply| Command::SendChat { text, reply }).await
    }

    pub async fn set_visibility(&self, visibility: Visibility) -> Result<(), ClientError> {
        self.request(|reply| Command::SetVisibility { visibility, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<WorkspaceSnapshot, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Flush pending edits, close the channel and stop the client task.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// The task that drives one [`Workspace`].
pub struct SyncClient {
    workspace: Workspace,
    api: Option<RoomApi>,
    transport: Option<Transport>,
    transport_tx: mpsc::Sender<TransportEvent>,
    resolved_tx: mpsc::Sender<(u64, Result<String, ApiError>)>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl SyncClient {
    /// Start a client task and return its handle and notice stream.
    pub fn spawn(config: SyncConfig) -> (SyncHandle, mpsc::UnboundedReceiver<Notice>) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (transport_tx, transport_rx) = mpsc::channel(256);
        let (resolved_tx, resolved_rx) = mpsc::channel(8);
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        let api = config
            .use_room_api
            .then(|| RoomApi::new(config.backend_url.clone()));
        let client = SyncClient {
            workspace: Workspace::new(config),
            api,
            transport: None,
            transport_tx,
            resolved_tx,
            notices: notices_tx,
        };
        tokio::spawn(client.run(commands_rx, transport_rx, resolved_rx));

        (SyncHandle { commands: commands_tx }, notices_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut resolved_rx: mpsc::Receiver<(u64, Result<String, ApiError>)>,
    ) {
        loop {
            let deadline = self.workspace.next_deadline();

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        let out = self.workspace.teardown(now());
                        self.execute(out);
                        break;
                    }
                    Some(cmd) => {
                        let out = self.on_command(cmd);
                        self.execute(out);
                    }
                },

                Some(event) = transport_rx.recv() => {
                    let out = self.workspace.on_transport(event, now());
                    self.execute(out);
                }

                Some((generation, resolved)) = resolved_rx.recv() => {
                    self.on_resolved(generation, resolved);
                }

                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at.into()).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let out = self.workspace.poll(now());
                    self.execute(out);
                }
            }
        }

        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        log::debug!("Sync client stopped");
    }

    fn on_command(&mut self, cmd: Command) -> Vec<Output> {
        let now = now();
        let ws = &mut self.workspace;
        match cmd {
            Command::Join { username, room_id, reply } => respond(reply, ws.join(&username, &room_id)),
            Command::Retry { reply } => respond(reply, ws.retry()),
            Command::Leave { reply } => respond(reply, ws.leave(now)),
            Command::CreateNode { node, reply } => respond(reply, ws.create_node(node, now)),
            Command::RenameNode { id, name, reply } => respond(reply, ws.rename_node(&id, &name, now)),
            Command::DeleteNode { id, reply } => respond(reply, ws.delete_node(&id, now)),
            Command::OpenFile { id, reply } => respond(reply, ws.open_file(&id, now)),
            Command::EditFile { id, content, cursor, reply } => {
                respond(reply, ws.edit_file(&id, &content, cursor, now))
            }
            Command::Draw { records, reply } => respond(reply, Ok(ws.draw(records, now))),
            Command::Erase { ids, reply } => {
                respond(reply, Ok(ws.erase(ids.iter().map(String::as_str), now)))
            }
            Command::SendChat { text, reply } => respond(reply, ws.send_chat(&text)),
            Command::SetVisibility { visibility, reply } => {
                respond(reply, Ok(ws.set_visibility(visibility, now)))
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(snapshot(ws));
                Vec::new()
            }
            Command::Shutdown => Vec::new(),
        }
    }

    fn execute(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Connect { generation, room_id } => self.connect(generation, room_id),
                Output::Close { generation } => {
                    if self.transport.as_ref().is_some_and(|t| t.generation() == generation) {
                        if let Some(transport) = self.transport.take() {
                            transport.close();
                        }
                    }
                }
                Output::Send(event) => {
                    let Some(transport) = &self.transport else {
                        log::debug!("No transport for {}", event.kind());
                        continue;
                    };
                    match event.encode() {
                        Ok(text) => {
                            if let Err(e) = transport.send(text) {
                                log::warn!("Dropping {}: {e}", event.kind());
                            }
                        }
                        Err(e) => log::error!("Could not encode {}: {e}", event.kind()),
                    }
                }
                Output::Heartbeat { room_id, username } => {
                    if let Some(api) = self.api.clone() {
                        tokio::spawn(async move {
                            if let Err(e) = api.heartbeat(&room_id, &username).await {
                                log::warn!("Failed to send heartbeat: {e}");
                            }
                        });
                    }
                }
                Output::Notify(notice) => {
                    let _ = self.notices.send(notice);
                }
            }
        }
    }

    /// Open a transport for `generation`, resolving the channel path first
    /// when the room API is in use.
    fn connect(&mut self, generation: u64, room_id: String) {
        if let Some(old) = self.transport.take() {
            old.close();
        }
        match self.api.clone() {
            Some(api) => {
                let resolved_tx = self.resolved_tx.clone();
                tokio::spawn(async move {
                    let resolved = api.resolve_socket_path(&room_id).await;
                    let _ = resolved_tx.send((generation, resolved)).await;
                });
            }
            None => self.open_transport(generation, &room_id),
        }
    }

    fn on_resolved(&mut self, generation: u64, resolved: Result<String, ApiError>) {
        if generation != self.workspace.generation() {
            log::debug!("Discarding channel path for generation {generation}");
            return;
        }
        match resolved {
            Ok(path) => self.open_transport(generation, &path),
            Err(e) => {
                log::error!("Could not resolve channel path: {e}");
                let out = self
                    .workspace
                    .on_transport(TransportEvent::GaveUp { generation }, now());
                self.execute(out);
            }
        }
    }

    fn open_transport(&mut self, generation: u64, path: &str) {
        let config = self.workspace.config();
        let url = config.channel_url(path);
        log::info!("Opening channel {url} for generation {generation}");
        self.transport = Some(Transport::spawn(
            url,
            generation,
            config.transport.clone(),
            self.transport_tx.clone(),
        ));
    }
}

fn respond(reply: Reply, result: Result<Vec<Output>, WorkspaceError>) -> Vec<Output> {
    match result {
        Ok(out) => {
            let _ = reply.send(Ok(()));
            out
        }
        Err(e) => {
            log::debug!("Command rejected: {e}");
            let _ = reply.send(Err(e));
            Vec::new()
        }
    }
}

fn snapshot(ws: &Workspace) -> WorkspaceSnapshot {
    WorkspaceSnapshot {
        status: ws.status(),
        generation: ws.generation(),
        failures: ws.failures(),
        local: ws.presence().local().cloned(),
        users: ws.presence().users().cloned().collect(),
        files: ws.files().replica().iter().cloned().collect(),
        drawing: ws.drawing().replica().iter().cloned().collect(),
        chat: ws.chat().messages().to_vec(),
        active_file: ws.active_file().cloned(),
        bootstrap: ws.bootstrap_state(),
        visibility: ws.visibility(),
        queued_edits: ws.queued_edits(),
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionError;
    use tandem_core::ROOT_ID;

    fn offline_config() -> SyncConfig {
        SyncConfig::direct("http://127.0.0.1:1")
    }

    #[tokio::test]
    async fn test_initial_snapshot() {
        let (handle, _notices) = SyncClient::spawn(offline_config());
        let snapshot = handle.snapshot().await.unwrap();

        assert_eq!(snapshot.status, SessionStatus::Initial);
        assert_eq!(snapshot.files.len(), 1);
        assert!(snapshot.file(ROOT_ID).is_some());
        assert!(snapshot.users.is_empty());
        assert_eq!(snapshot.visibility, Visibility::Visible);
        assert_eq!(snapshot.queued_edits, 0);
    }

    #[tokio::test]
    async fn test_invalid_identity_is_returned() {
        let (handle, _notices) = SyncClient::spawn(offline_config());
        let err = handle.join("al", "room-1").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Workspace(WorkspaceError::Session(SessionError::InvalidIdentity(_)))
        ));
    }

    #[tokio::test]
    async fn test_local_edits_apply_before_join() {
        let (handle, _notices) = SyncClient::spawn(offline_config());
        let node = FileNode::file("a.js", &RecordId::new(ROOT_ID), "").with_id("f1");
        handle.create_node(node).await.unwrap();
        handle.edit_file("f1", "let a = 1", Some(9)).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.file("f1").unwrap().content.as_deref(), Some("let a = 1"));
        assert_eq!(snapshot.active_file, Some(RecordId::new("f1")));
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let (handle, mut notices) = SyncClient::spawn(offline_config());
        handle.shutdown().await;
        while notices.recv().await.is_some() {}

        assert!(matches!(handle.snapshot().await, Err(ClientError::Stopped)));
        assert!(matches!(handle.retry().await, Err(ClientError::Stopped)));
    }
}
