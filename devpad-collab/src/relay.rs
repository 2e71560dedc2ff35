//! Broadcast Relay: the ordering backbone of a session.
//!
//! ```text
//! Participant A ──┐
//!                 ├── Session (registry) ── revision counter + text
//! Participant B ──┘            │
//!                              │  bump_revision + fan-out, one unit
//!                   ┌──────────┴──────────┐
//!                   ▼                     ▼
//!              Participant B         ChangeAck to A
//!              (ChangeApplied)
//! ```
//!
//! Total order is established centrally: every accepted change gets the next
//! revision under its session's lock, and deliveries to any single peer are
//! initiated in that same order. Peers apply in the order received; no peer
//! performs conflict resolution of its own. A slow peer only loses its own
//! deliveries (bounded outbound queue), never delays revision assignment or
//! the other peers.
//!
//! Reference: Kleppmann - Designing Data-Intensive Applications, Chapter 9.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::change::{self, AppliedChange};
use crate::protocol::Message;
use crate::registry::SessionRegistry;

/// Identity collaborator hook: resolves an opaque token to a stable
/// participant id, or rejects it (`None`).
pub type IdentityHook =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Document-metadata collaborator hook: supplies the initial snapshot text
/// for a session id on cold start (`None` means an empty document).
pub type SnapshotHook =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Relay server configuration.
#[derive(Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Maximum participants per session.
    pub max_peers_per_session: usize,
    /// Outbound queue capacity per connection.
    pub outbound_capacity: usize,
    /// Transport heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// How long an empty session keeps its revision state.
    pub teardown_grace: Duration,
    /// Identity collaborator; `None` accepts every token.
    pub authenticate: Option<IdentityHook>,
    /// Document-metadata collaborator; `None` cold-starts empty.
    pub load_snapshot: Option<SnapshotHook>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_session: 100,
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            teardown_grace: Duration::from_secs(30),
            authenticate: None,
            load_snapshot: None,
        }
    }
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub accepted_changes: u64,
    pub active_sessions: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Create a relay server with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.teardown_grace));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Start listening for connections. Runs the accept loop forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// The session registry backing this relay.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Handle a single connection until it closes.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<RelayStats>>,
    config: RelayConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("Connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Everything addressed to this connection funnels through one queue, so
    // the stream a peer sees is exactly the order deliveries were initiated.
    let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(config.outbound_capacity);

    let mut connection_id: Option<Uuid> = None;
    let mut session_id: Option<String> = None;
    let mut join_epoch: u64 = 0;

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        let message = match Message::decode(&bytes) {
                            Ok(message) => message,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };

                        match message {
                            Message::JoinSession { session_id: sid, connection_id: cid, identity_token } => {
                                if let Some(authenticate) = &config.authenticate {
                                    match authenticate(identity_token).await {
                                        Some(participant) => {
                                            log::debug!("Identity resolved for {cid}: {participant}");
                                        }
                                        None => {
                                            log::warn!("Identity token rejected for {cid} from {addr}");
                                            let reject = Message::JoinRejected {
                                                reason: "identity token rejected".to_string(),
                                            };
                                            ws_sender.send(WsMessage::Binary(reject.encode()?.into())).await?;
                                            break;
                                        }
                                    }
                                }

                                if let Some(session) = registry.session(&sid).await {
                                    let s = session.lock().await;
                                    if !s.contains(cid) && s.participant_count() >= config.max_peers_per_session {
                                        drop(s);
                                        log::warn!("Session {sid} full, rejecting {cid}");
                                        let reject = Message::JoinRejected {
                                            reason: "session full".to_string(),
                                        };
                                        ws_sender.send(WsMessage::Binary(reject.encode()?.into())).await?;
                                        break;
                                    }
                                }

                                // Cold start: the document-metadata collaborator
                                // supplies the initial text.
                                let initial_text = match registry.session(&sid).await {
                                    Some(_) => None,
                                    None => match &config.load_snapshot {
                                        Some(load) => load(sid.clone()).await,
                                        None => None,
                                    },
                                };

                                let outcome =
                                    registry.join(&sid, cid, out_tx.clone(), initial_text).await;
                                join_epoch = outcome.join_epoch;
                                {
                                    let mut s = outcome.session.lock().await;
                                    if outcome.resumed {
                                        // Same connection id rejoining: membership
                                        // resumes silently; the client follows up
                                        // with a resync request.
                                        log::info!("Peer {cid} resumed session {sid}");
                                    } else {
                                        let state = Message::SessionState {
                                            revision: s.revision(),
                                            snapshot_text: s.text().to_string(),
                                        };
                                        s.deliver_to(cid, &state);
                                        s.fan_out(cid, &Message::PeerJoined { connection_id: cid });
                                        log::info!(
                                            "Peer {cid} joined session {sid} at revision {}",
                                            s.revision()
                                        );
                                    }
                                }

                                connection_id = Some(cid);
                                session_id = Some(sid);

                                let count = registry.session_count().await;
                                stats.write().await.active_sessions = count;
                            }

                            Message::Change { mut descriptor } => {
                                if let (Some(cid), Some(sid)) = (connection_id, session_id.as_deref()) {
                                    descriptor.originator = cid;
                                    if let Some(session) = registry.session(sid).await {
                                        let mut s = session.lock().await;
                                        // Revision assignment and fan-out initiation
                                        // form one unit under the session lock: a
                                        // change reaches the whole peer set or, if
                                        // the sender is already gone, nobody.
                                        match change::decode(&descriptor, s.text_len()) {
                                            Ok(instruction) => {
                                                let assigned = s.bump_revision();
                                                s.apply_instruction(&instruction);
                                                let applied = AppliedChange::new(descriptor, assigned);
                                                s.fan_out(cid, &Message::ChangeApplied { applied });
                                                s.deliver_to(cid, &Message::ChangeAck {
                                                    assigned_revision: assigned,
                                                });
                                                drop(s);
                                                stats.write().await.accepted_changes += 1;
                                            }
                                            Err(e) => {
                                                // Not accepted: no revision assigned,
                                                // nothing fanned out. The sender gets a
                                                // fresh snapshot to resync from.
                                                log::warn!("Rejecting change from {cid} in {sid}: {e}");
                                                let state = Message::SessionState {
                                                    revision: s.revision(),
                                                    snapshot_text: s.text().to_string(),
                                                };
                                                s.deliver_to(cid, &state);
                                            }
                                        }
                                    }
                                }
                            }

                            Message::ResyncRequest { session_id: sid, last_known_revision } => {
                                if let Some(cid) = connection_id {
                                    if let Some(session) = registry.session(&sid).await {
                                        let mut s = session.lock().await;
                                        if s.revision() == last_known_revision {
                                            s.deliver_to(cid, &Message::ResyncNoop);
                                        } else {
                                            let state = Message::SessionState {
                                                revision: s.revision(),
                                                snapshot_text: s.text().to_string(),
                                            };
                                            s.deliver_to(cid, &state);
                                        }
                                    }
                                }
                            }

                            Message::LeaveSession { .. } => {
                                if let Some(cid) = connection_id {
                                    if let Some((sid, session)) =
                                        registry.leave_if_current(cid, join_epoch).await
                                    {
                                        session.lock().await.fan_out(cid, &Message::PeerLeft {
                                            connection_id: cid,
                                        });
                                        log::info!("Peer {cid} left session {sid}");
                                    }
                                    session_id = None;
                                }
                            }

                            Message::Signal { payload } => {
                                // Store-and-forward only: no revision, no
                                // ordering guarantees across senders.
                                if let (Some(cid), Some(sid)) = (connection_id, session_id.as_deref()) {
                                    if let Some(session) = registry.session(sid).await {
                                        session.lock().await.fan_out(cid, &Message::Signal { payload });
                                    }
                                }
                            }

                            Message::Ping => {
                                ws_sender.send(WsMessage::Binary(Message::Pong.encode()?.into())).await?;
                            }

                            other => {
                                log::debug!("Unhandled message kind from {addr}: {other:?}");
                            }
                        }
                    }

                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(WsMessage::Ping(data))) => {
                        ws_sender.send(WsMessage::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            frame = out_rx.recv() => {
                match frame {
                    Some(bytes) => {
                        ws_sender.send(WsMessage::Binary(bytes.to_vec().into())).await?;
                    }
                    None => break,
                }
            }

            _ = heartbeat.tick() => {
                ws_sender.send(WsMessage::Ping(Vec::new().into())).await?;
            }
        }
    }

    // Cleanup: a disconnect is a leave, unless a newer connection already
    // resumed this membership. Any edit this connection sent that was not
    // processed before this point was never assigned a revision and is
    // simply dropped.
    if let Some(cid) = connection_id {
        if let Some((sid, session)) = registry.leave_if_current(cid, join_epoch).await {
            session.lock().await.fan_out(cid, &Message::PeerLeft { connection_id: cid });
            log::info!("Connection {cid} closed, removed from session {sid}");
        }
    }

    let count = registry.session_count().await;
    {
        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_sessions = count;
    }

    Ok(())
}
