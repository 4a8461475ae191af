//! WebSocket transport with bounded reconnection.
//!
//! One [`Transport`] serves one session generation. It connects, pumps
//! text frames both ways and reconnects with capped exponential backoff
//! until the policy's attempt budget is spent. Everything it observes is
//! reported as a [`TransportEvent`] stamped with its generation.
//!
//! Frames that were queued but never written to a socket are handed back
//! as [`TransportEvent::Unsent`] just before the next `Connected`, so the
//! owner can replay them after it has rejoined.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::TransportPolicy;
use crate::protocol::ProtocolError;

const CLOSE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { generation: u64 },
    Message { generation: u64, text: String },
    /// Frames accepted by [`Transport::send`] that no socket carried, oldest
    /// first. Always followed by `Connected`.
    Unsent { generation: u64, frames: Vec<String> },
    /// A connection attempt or an open connection failed.
    Error { generation: u64, message: String },
    /// The peer closed the connection.
    Closed { generation: u64 },
    /// The attempt budget is spent; the transport has stopped.
    GaveUp { generation: u64 },
}

impl TransportEvent {
    pub fn generation(&self) -> u64 {
        match self {
            TransportEvent::Connected { generation }
            | TransportEvent::Message { generation, .. }
            | TransportEvent::Unsent { generation, .. }
            | TransportEvent::Error { generation, .. }
            | TransportEvent::Closed { generation }
            | TransportEvent::GaveUp { generation } => *generation,
        }
    }
}

enum PumpEnd {
    Closed,
    Failed(String),
    /// The owner dropped the transport or stopped listening.
    Detached,
}

pub struct Transport {
    generation: u64,
    outgoing: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl Transport {
    pub fn spawn(
        url: String,
        generation: u64,
        policy: TransportPolicy,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(url, generation, policy, events, outgoing_rx));
        Self {
            generation,
            outgoing,
            task,
        }
    }

    /// Queue a text frame. Frames that miss their socket come back as
    /// [`TransportEvent::Unsent`] on reconnect.
    pub fn send(&self, text: String) -> Result<(), ProtocolError> {
        self.outgoing
            .send(text)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send what is queued, close the socket and stop reconnecting.
    pub fn close(self) {
        let Transport { outgoing, task, .. } = self;
        drop(outgoing);
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            task.abort();
        });
    }
}

async fn run(
    url: String,
    generation: u64,
    policy: TransportPolicy,
    events: mpsc::Sender<TransportEvent>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) {
    let mut attempt: u32 = 0;
    let mut unsent: Vec<String> = Vec::new();

    loop {
        log::debug!("Connecting to {url} (generation {generation}, attempt {})", attempt + 1);
        let failure = match tokio::time::timeout(
            policy.timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((ws, _))) => {
                attempt = 0;
                while let Ok(text) = outgoing.try_recv() {
                    unsent.push(text);
                }
                if !unsent.is_empty() {
                    log::info!("Handing back {} unsent frames", unsent.len());
                    let frames = std::mem::take(&mut unsent);
                    if events
                        .send(TransportEvent::Unsent { generation, frames })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                if events
                    .send(TransportEvent::Connected { generation })
                    .await
                    .is_err()
                {
                    return;
                }
                log::info!("Channel open to {url}");

                match pump(ws, generation, &events, &mut outgoing, &mut unsent).await {
                    PumpEnd::Detached => return,
                    PumpEnd::Closed => {
                        log::info!("Channel closed by peer");
                        if events.send(TransportEvent::Closed { generation }).await.is_err() {
                            return;
                        }
                        None
                    }
                    PumpEnd::Failed(message) => Some(message),
                }
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(ProtocolError::Timeout.to_string()),
        };

        if let Some(message) = failure {
            log::error!("Transport error on generation {generation}: {message}");
            if events
                .send(TransportEvent::Error { generation, message })
                .await
                .is_err()
            {
                return;
            }
        }

        attempt += 1;
        if attempt >= policy.reconnection_attempts {
            log::error!("Giving up on {url} after {attempt} attempts");
            if !unsent.is_empty() {
                log::warn!("{} frames were never sent", unsent.len());
            }
            let _ = events.send(TransportEvent::GaveUp { generation }).await;
            return;
        }
        tokio::time::sleep(policy.backoff_for(attempt - 1)).await;
    }
}

async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    generation: u64,
    events: &mpsc::Sender<TransportEvent>,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    unsent: &mut Vec<String>,
) -> PumpEnd {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let event = TransportEvent::Message {
                        generation,
                        text: text.as_str().to_string(),
                    };
                    if events.send(event).await.is_err() {
                        return PumpEnd::Detached;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        return PumpEnd::Failed(e.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => return PumpEnd::Closed,
                Some(Err(e)) => return PumpEnd::Failed(e.to_string()),
                Some(Ok(_)) => {}
            },

            out = outgoing.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.clone().into())).await {
                        unsent.push(text);
                        return PumpEnd::Failed(e.to_string());
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return PumpEnd::Detached;
                }
            },
        }
    }
}
