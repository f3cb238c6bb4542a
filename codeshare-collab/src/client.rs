//! WebSocket client driving a [`Replica`].
//!
//! ```text
//!            ┌── reader task ── decode ──▶ inbound queue ──┐
//! socket ────┤                                             ▼
//!            └── writer task ◀── outgoing queue ◀── SyncClient::next_event()
//!                                                    │  Replica::handle()
//!                                                    ▼
//!                                               EditorView
//! ```
//!
//! All replica mutation happens on the caller's task through `&mut self`,
//! one inbound message at a time. Sending is fire-and-forget into the
//! writer's queue. There is no automatic reconnect: a dropped channel
//! surfaces as [`SyncEvent::Disconnected`].

use std::collections::VecDeque;
use std::time::Duration;

use codeshare_core::Position;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::presence::CURSOR_BROADCAST_INTERVAL;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::replica::{ConnectionState, EditorView, HeadlessView, Replica, ResyncReason, SyncEvent};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the session server
    pub server_url: String,
    pub session: String,
    pub user: String,
    /// Minimum spacing of outgoing cursor updates
    pub cursor_interval: Duration,
    /// Capacity of the inbound and outgoing queues
    pub channel_capacity: usize,
    /// How long [`SyncClient::wait_joined`] waits for `initial_state`
    pub join_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, session: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            session: session.into(),
            user: user.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            session: "default".to_string(),
            user: "anonymous".to_string(),
            cursor_interval: CURSOR_BROADCAST_INTERVAL,
            channel_capacity: 256,
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(#[from] tungstenite::Error),
    #[error("connection closed")]
    ChannelClosed,
    #[error("join rejected: {0}")]
    Rejected(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

enum Inbound {
    Message(ServerMessage),
    Closed(String),
}

/// A connected collaborator.
pub struct SyncClient<V: EditorView = HeadlessView> {
    config: ClientConfig,
    replica: Replica,
    view: V,
    outgoing: Option<mpsc::Sender<ClientMessage>>,
    inbound: mpsc::Receiver<Inbound>,
    pending: VecDeque<SyncEvent>,
    writer: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
}

impl<V: EditorView> SyncClient<V> {
    /// Connect to the server and send `join`.
    ///
    /// Spawns the reader and writer tasks. The join completes once
    /// [`SyncEvent::Joined`] comes out of [`next_event`](Self::next_event).
    pub async fn connect(config: ClientConfig, view: V) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(config.server_url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("connected to {} as {}", config.server_url, config.user);

        let capacity = config.channel_capacity.max(1);
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(capacity);
        let (in_tx, in_rx) = mpsc::channel::<Inbound>(capacity);

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("failed to encode {}: {e}", message.kind());
                        continue;
                    }
                };
                if let Err(e) = ws_writer.send(Message::Text(json.into())).await {
                    log::error!("send failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                let decoded = match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => ServerMessage::from_json(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => ServerMessage::from_json(&data),
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.as_str().to_owned())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_owned());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                    None => break "connection closed".to_owned(),
                };

                match decoded {
                    Ok(message) => {
                        if in_tx.send(Inbound::Message(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!("failed to decode server message: {e}"),
                }
            };
            let _ = in_tx.send(Inbound::Closed(reason)).await;
        });

        let mut replica = Replica::with_cursor_interval(config.session.clone(), config.user.clone(), config.cursor_interval);
        let join = replica.join_request();
        out_tx.send(join).await.map_err(|_| ClientError::ChannelClosed)?;

        Ok(Self {
            config,
            replica,
            view,
            outgoing: Some(out_tx),
            inbound: in_rx,
            pending: VecDeque::new(),
            writer: Some(writer),
            reader,
        })
    }

    /// Process inbound messages until the join completes.
    ///
    /// Returns the revision the session was at. Events seen on the way are
    /// discarded.
    pub async fn wait_joined(&mut self) -> Result<u64, ClientError> {
        let timeout = self.config.join_timeout;
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match self.next_event().await {
                    Some(SyncEvent::Joined { revision, .. }) => return Ok(revision),
                    Some(SyncEvent::ServerError { message }) => return Err(ClientError::Rejected(message)),
                    Some(SyncEvent::Disconnected { .. }) | None => return Err(ClientError::ChannelClosed),
                    Some(_) => {}
                }
            }
        })
        .await;
        outcome.map_err(|_| ClientError::Timeout("initial state"))?
    }

    /// Next event, processing at most one inbound message at a time.
    ///
    /// `None` once the connection is gone and every event was delivered.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let inbound = self.inbound.recv().await?;
            self.process(inbound).await;
        }
    }

    async fn process(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => {
                let reaction = self.replica.handle(message, &mut self.view);
                for reply in reaction.replies {
                    if let Err(e) = self.send(reply).await {
                        log::warn!("dropping reply: {e}");
                    }
                }
                self.pending.extend(reaction.events);
            }
            Inbound::Closed(reason) => {
                log::warn!("connection to {} lost: {reason}", self.config.server_url);
                self.outgoing = None;
                let event = self.replica.disconnected(reason, &mut self.view);
                self.pending.push_back(event);
            }
        }
    }

    /// The local editor now shows `text`. Returns whether a batch was sent.
    pub async fn edit(&mut self, text: &str) -> Result<bool, ClientError> {
        match self.replica.local_change(text) {
            Some(message) => {
                self.send(message).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The local cursor moved. Returns whether an update was sent.
    pub async fn move_cursor(&mut self, position: Position) -> Result<bool, ClientError> {
        match self.replica.local_cursor(position) {
            Some(message) => {
                self.send(message).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Ask the server for its snapshot.
    pub async fn request_resync(&mut self) -> Result<bool, ClientError> {
        match self.replica.request_resync(ResyncReason::Requested) {
            Some(message) => {
                self.send(message).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Ping).await
    }

    /// Leave the session and close the connection. Best-effort.
    pub async fn leave(mut self) -> V {
        if let Some(message) = self.replica.leave(&mut self.view) {
            if let Err(e) = self.send(message).await {
                log::debug!("leave not delivered: {e}");
            }
        }
        // Closing the queue lets the writer flush and close the socket.
        self.outgoing = None;
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
                log::debug!("writer did not finish in time");
            }
        }
        self.reader.abort();
        log::info!("{} left session {}", self.config.user, self.config.session);
        self.view
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        let outgoing = self.outgoing.as_ref().ok_or(ClientError::ChannelClosed)?;
        log::trace!("sending {}", message.kind());
        outgoing.send(message).await.map_err(|_| ClientError::ChannelClosed)
    }

    pub fn state(&self) -> ConnectionState {
        self.replica.state()
    }

    pub fn snapshot(&self) -> &str {
        self.replica.snapshot()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
