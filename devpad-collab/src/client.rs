//! Connection lifecycle for one participant.
//!
//! Owns the transport (connect, reconnect-with-resync, disconnect), feeds
//! the reconciliation engine, and surfaces everything the embedding editor
//! widget needs as [`CollabEvent`]s on a channel.
//!
//! Reference: Kleppmann, Chapter 5 - Replication.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::change::{ChangeError, EditEvent, EditInstruction};
use crate::protocol::{Message, ProtocolError};
use crate::reconcile::{LocalEdit, ReconcileEngine, RemoteApply};
use crate::signal::SignalMessage;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the embedding editor widget.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Transport established and the session joined.
    Connected,
    /// Transport lost.
    Disconnected,
    /// Authoritative snapshot replaced local state; reload the widget text.
    StateSynced { revision: u64, text: String },
    /// A remote edit, already rebased for the local view.
    RemoteEdit {
        instruction: EditInstruction,
        revision: u64,
        originator: Uuid,
    },
    /// Our outstanding edit was accepted at this revision.
    EditConfirmed { revision: u64 },
    /// A participant entered the session.
    PeerJoined(Uuid),
    /// A participant left the session.
    PeerLeft(Uuid),
    /// Media-signaling message addressed to us.
    Signal(SignalMessage),
    /// Join refused; the session is unavailable.
    SessionRejected { reason: String },
}

/// The collaboration client for one document session.
pub struct CollabClient {
    connection_id: Uuid,
    session_id: String,
    identity_token: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    engine: Arc<Mutex<ReconcileEngine>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<CollabEvent>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
}

impl CollabClient {
    /// Create a client for one session. The connection id identifies this
    /// participant for the lifetime of the client, across reconnects.
    pub fn new(
        session_id: impl Into<String>,
        identity_token: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let connection_id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            connection_id,
            session_id: session_id.into(),
            identity_token: identity_token.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            engine: Arc::new(Mutex::new(ReconcileEngine::new(connection_id))),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay and join the session.
    ///
    /// Completes once the authoritative snapshot has been received and
    /// applied (it also arrives as a [`CollabEvent::StateSynced`] event).
    /// A rejected identity token fails with [`ProtocolError::AuthRequired`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        self.establish(false).await
    }

    /// Re-establish a dropped connection, retrying up to `max_attempts`.
    ///
    /// The pending edit and queue are discarded first: an unacknowledged
    /// edit may or may not have been accepted, and the engine never rebases
    /// across that uncertainty. The server answers the follow-up resync
    /// request with `ResyncNoop` when nothing changed while we were away.
    pub async fn reconnect(&mut self, max_attempts: u32) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Reconnecting;

        {
            let mut engine = self.engine.lock().await;
            engine.discard_unconfirmed();
        }

        let mut attempts = 0;
        loop {
            match self.establish(true).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        *self.state.write().await = ConnectionState::Disconnected;
                        let _ = self.event_tx.send(CollabEvent::Disconnected).await;
                        return Err(e);
                    }
                    log::debug!(
                        "Reconnect attempt {attempts}/{max_attempts} failed, retrying"
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn establish(&mut self, resync: bool) -> Result<(), ProtocolError> {
        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;

        match ws_result {
            Ok((ws_stream, _)) => {
                let (ws_writer, ws_reader) = ws_stream.split();

                let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
                self.outgoing_tx = Some(out_tx.clone());

                // Writer task: forward the outgoing channel to the socket.
                let writer = Arc::new(Mutex::new(ws_writer));
                tokio::spawn(async move {
                    while let Some(data) = out_rx.recv().await {
                        let mut w = writer.lock().await;
                        if w.send(WsMessage::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                });

                // Resolved by the reader on the first handshake answer:
                // snapshot, resync no-op, or rejection.
                let (ready_tx, ready_rx) =
                    tokio::sync::oneshot::channel::<Result<(), ProtocolError>>();
                tokio::spawn(reader_loop(
                    ws_reader,
                    self.engine.clone(),
                    self.event_tx.clone(),
                    self.state.clone(),
                    out_tx,
                    self.session_id.clone(),
                    self.connection_id,
                    ready_tx,
                ));

                // Join resumes existing membership when the connection id is
                // already known to the session.
                self.send(&Message::JoinSession {
                    session_id: self.session_id.clone(),
                    connection_id: self.connection_id,
                    identity_token: self.identity_token.clone(),
                })
                .await?;

                if resync {
                    let last_known = self.engine.lock().await.last_seen_revision();
                    self.send(&Message::ResyncRequest {
                        session_id: self.session_id.clone(),
                        last_known_revision: last_known,
                    })
                    .await?;
                }

                match tokio::time::timeout(HANDSHAKE_TIMEOUT, ready_rx).await {
                    Ok(Ok(Ok(()))) => {
                        *self.state.write().await = ConnectionState::Connected;
                        let _ = self.event_tx.send(CollabEvent::Connected).await;
                        Ok(())
                    }
                    Ok(Ok(Err(e))) => {
                        *self.state.write().await = ConnectionState::Disconnected;
                        Err(e)
                    }
                    Ok(Err(_)) => {
                        *self.state.write().await = ConnectionState::Disconnected;
                        Err(ProtocolError::ConnectionClosed)
                    }
                    Err(_) => {
                        *self.state.write().await = ConnectionState::Disconnected;
                        Err(ProtocolError::Timeout)
                    }
                }
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Submit a local edit from the widget.
    ///
    /// The edit is applied to the local view immediately and either sent or
    /// queued behind the outstanding one. Malformed ranges are rejected and
    /// never sent.
    pub async fn local_edit(&self, event: EditEvent) -> Result<(), ChangeError> {
        let outcome = {
            let mut engine = self.engine.lock().await;
            engine.local_edit(&event)?
        };

        match outcome {
            LocalEdit::Send(descriptor) => {
                if *self.state.read().await == ConnectionState::Connected {
                    let _ = self.send(&Message::Change { descriptor }).await;
                } else {
                    log::debug!("Edit made while disconnected; discarded on next resync");
                }
                Ok(())
            }
            LocalEdit::Queued => Ok(()),
            LocalEdit::Overflow => {
                // Queue exhausted: revert to the synced text and ask the
                // relay whether anything newer exists.
                log::warn!("Edit queue full, reverting to last synced state");
                let (revision, text) = {
                    let mut engine = self.engine.lock().await;
                    engine.discard_unconfirmed();
                    (engine.last_seen_revision(), engine.synced_text().to_string())
                };
                let _ = self
                    .event_tx
                    .send(CollabEvent::StateSynced { revision, text })
                    .await;
                let _ = self
                    .send(&Message::ResyncRequest {
                        session_id: self.session_id.clone(),
                        last_known_revision: revision,
                    })
                    .await;
                Ok(())
            }
        }
    }

    /// Send a media-signaling message to a peer.
    pub async fn send_signal(&self, signal: &SignalMessage) -> Result<(), ProtocolError> {
        let payload = signal
            .encode()
            .map_err(ProtocolError::SerializationError)?;
        self.send(&Message::Signal { payload }).await
    }

    /// Send a protocol-level heartbeat.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&Message::Ping).await
    }

    /// Leave the session and drop the transport. Best effort: never blocks
    /// on the network.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = &self.outgoing_tx {
            if let Ok(bytes) = (Message::LeaveSession {
                session_id: self.session_id.clone(),
            })
            .encode()
            {
                let _ = tx.try_send(bytes);
            }
        }
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        let bytes = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(bytes)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The last revision this participant has applied.
    pub async fn last_seen_revision(&self) -> u64 {
        self.engine.lock().await.last_seen_revision()
    }

    /// The optimistic local document text.
    pub async fn document(&self) -> String {
        self.engine.lock().await.document().to_string()
    }
}

/// Reader task: dispatch incoming messages until the socket closes.
#[allow(clippy::too_many_arguments)]
async fn reader_loop(
    mut ws_reader: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    engine: Arc<Mutex<ReconcileEngine>>,
    event_tx: mpsc::Sender<CollabEvent>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: mpsc::Sender<Vec<u8>>,
    session_id: String,
    connection_id: Uuid,
    ready_tx: tokio::sync::oneshot::Sender<Result<(), ProtocolError>>,
) {
    let mut ready = Some(ready_tx);
    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(WsMessage::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                let message = match Message::decode(&bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Failed to decode incoming message: {e}");
                        continue;
                    }
                };

                match message {
                    Message::SessionState {
                        revision,
                        snapshot_text,
                    } => {
                        {
                            let mut e = engine.lock().await;
                            e.resync(revision, snapshot_text.clone());
                        }
                        let _ = event_tx
                            .send(CollabEvent::StateSynced {
                                revision,
                                text: snapshot_text,
                            })
                            .await;
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }

                    Message::ResyncNoop => {
                        log::debug!("Resync not needed for session {session_id}");
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }

                    Message::ChangeAck { assigned_revision } => {
                        let next = {
                            let mut e = engine.lock().await;
                            e.acknowledge(assigned_revision)
                        };
                        let _ = event_tx
                            .send(CollabEvent::EditConfirmed {
                                revision: assigned_revision,
                            })
                            .await;
                        if let Some(descriptor) = next {
                            send_message(&outgoing, &Message::Change { descriptor }).await;
                        }
                    }

                    Message::ChangeApplied { applied } => {
                        let outcome = {
                            let mut e = engine.lock().await;
                            e.apply_remote(&applied)
                        };
                        match outcome {
                            RemoteApply::Applied(instruction) => {
                                let _ = event_tx
                                    .send(CollabEvent::RemoteEdit {
                                        instruction,
                                        revision: applied.assigned_revision,
                                        originator: applied.change.originator,
                                    })
                                    .await;
                            }
                            RemoteApply::Ignored => {}
                            RemoteApply::ResyncRequired(reason) => {
                                log::warn!("Resyncing session {session_id}: {reason}");
                                let last_known =
                                    { engine.lock().await.last_seen_revision() };
                                send_message(
                                    &outgoing,
                                    &Message::ResyncRequest {
                                        session_id: session_id.clone(),
                                        last_known_revision: last_known,
                                    },
                                )
                                .await;
                            }
                        }
                    }

                    Message::PeerJoined {
                        connection_id: peer,
                    } => {
                        let _ = event_tx.send(CollabEvent::PeerJoined(peer)).await;
                    }

                    Message::PeerLeft {
                        connection_id: peer,
                    } => {
                        let _ = event_tx.send(CollabEvent::PeerLeft(peer)).await;
                    }

                    Message::Signal { payload } => match SignalMessage::decode(&payload) {
                        Ok(signal) if signal.to() == connection_id => {
                            let _ = event_tx.send(CollabEvent::Signal(signal)).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("Failed to decode signaling payload: {e}");
                        }
                    },

                    Message::JoinRejected { reason } => {
                        log::warn!("Join rejected for session {session_id}: {reason}");
                        *state.write().await = ConnectionState::Disconnected;
                        let _ = event_tx
                            .send(CollabEvent::SessionRejected { reason })
                            .await;
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Err(ProtocolError::AuthRequired));
                        }
                    }

                    Message::Pong => {
                        log::trace!("Heartbeat pong");
                    }

                    other => {
                        log::debug!("Unhandled message kind: {other:?}");
                    }
                }
            }

            Ok(WsMessage::Close(_)) | Err(_) => break,

            _ => {}
        }
    }

    if let Some(tx) = ready.take() {
        let _ = tx.send(Err(ProtocolError::ConnectionClosed));
    }
    *state.write().await = ConnectionState::Disconnected;
    let _ = event_tx.send(CollabEvent::Disconnected).await;
}

async fn send_message(outgoing: &mpsc::Sender<Vec<u8>>, msg: &Message) {
    match msg.encode() {
        Ok(bytes) => {
            if outgoing.send(bytes).await.is_err() {
                log::debug!("Outgoing channel closed");
            }
        }
        Err(e) => log::error!("Failed to encode outgoing message: {e}"),
    }
}
