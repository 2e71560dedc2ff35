//! Session Registry: ownership of all live session state.
//!
//! Maps session id to participant set and connection id to session id (the
//! reverse lookup keeps disconnect handling O(1)). A session's revision
//! counter, authoritative text, and participant set are mutated only through
//! the registry and the per-session lock; connection handlers hold a
//! [`PeerHandle`] with an outbound queue, never the state itself.
//!
//! Concurrency model: one lock per session. Unrelated sessions never contend;
//! everything inside one session (revision assignment, text apply, fan-out
//! initiation) happens under its lock as a single unit, which is what gives
//! each session its total order and keeps per-peer delivery in assignment
//! order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::change::{self, EditInstruction};
use crate::protocol::Message;

/// Fan-out statistics for one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// One participant's live link: its connection id and outbound queue.
///
/// Deliveries never block the relay. A peer whose queue is full simply loses
/// that delivery and recovers through a revision-gap resync.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub connection_id: Uuid,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
    /// Which join installed this handle; a rejoin with the same connection
    /// id supersedes the old handle and its epoch.
    join_epoch: u64,
}

impl PeerHandle {
    fn new(connection_id: Uuid, outbound: mpsc::Sender<Arc<Vec<u8>>>, join_epoch: u64) -> Self {
        Self {
            connection_id,
            outbound,
            join_epoch,
        }
    }

    pub fn join_epoch(&self) -> u64 {
        self.join_epoch
    }

    /// Queue an encoded frame without blocking.
    pub fn deliver_raw(&self, frame: Arc<Vec<u8>>) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// Encode and queue one message without blocking.
    pub fn deliver(&self, msg: &Message) -> bool {
        match msg.encode() {
            Ok(bytes) => self.deliver_raw(Arc::new(bytes)),
            Err(e) => {
                log::error!("Failed to encode outbound message: {e}");
                false
            }
        }
    }
}

/// Live state of one collaborative document.
pub struct Session {
    session_id: String,
    revision: u64,
    text: String,
    participants: HashMap<Uuid, PeerHandle>,
    /// Bumped on every join; a scheduled teardown only fires if the epoch it
    /// captured is still current.
    teardown_epoch: u64,
    /// Counts joins; gives each installed handle its epoch.
    join_counter: u64,
    stats: SessionStats,
}

impl Session {
    fn new(session_id: String, initial_text: String) -> Self {
        Self {
            session_id,
            revision: 0,
            text: initial_text,
            participants: HashMap::new(),
            teardown_epoch: 0,
            join_counter: 0,
            stats: SessionStats::default(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Authoritative text at the current revision.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Character length of the authoritative text.
    pub fn text_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.participants.contains_key(&connection_id)
    }

    /// Increment and return the revision counter. The single serialization
    /// point: every accepted change in this session gets its order here.
    pub fn bump_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Apply an accepted change to the authoritative text.
    pub fn apply_instruction(&mut self, instruction: &EditInstruction) {
        self.text = change::apply(&self.text, instruction);
    }

    /// All live peers except `excluding`.
    pub fn peers(&self, excluding: Uuid) -> Vec<PeerHandle> {
        self.participants
            .values()
            .filter(|p| p.connection_id != excluding)
            .cloned()
            .collect()
    }

    /// Queue a message to one participant.
    pub fn deliver_to(&mut self, connection_id: Uuid, msg: &Message) -> bool {
        match self.participants.get(&connection_id) {
            Some(peer) => {
                let ok = peer.deliver(msg);
                if ok {
                    self.stats.messages_sent += 1;
                } else {
                    self.stats.messages_dropped += 1;
                }
                ok
            }
            None => false,
        }
    }

    /// Encode once and queue to every peer except `excluding`.
    ///
    /// All deliveries are initiated here, under the session lock, so a
    /// change is either fanned out to the full peer set or to nobody; a
    /// disconnect can interleave only before or after, never halfway.
    pub fn fan_out(&mut self, excluding: Uuid, msg: &Message) -> usize {
        let encoded = match msg.encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Failed to encode fan-out message: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        for peer in self.participants.values() {
            if peer.connection_id == excluding {
                continue;
            }
            if peer.deliver_raw(encoded.clone()) {
                delivered += 1;
                self.stats.messages_sent += 1;
            } else {
                self.stats.messages_dropped += 1;
                log::warn!(
                    "Peer {} lagging in session {}, delivery dropped",
                    peer.connection_id,
                    self.session_id
                );
            }
        }
        delivered
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }
}

/// Result of a join: the session, whether an existing membership was
/// resumed, and the epoch identifying the installed handle.
pub struct JoinOutcome {
    pub session: Arc<Mutex<Session>>,
    pub resumed: bool,
    pub join_epoch: u64,
}

/// The registry: session id to session, connection id to session id.
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<Session>>>>>,
    by_connection: Arc<RwLock<HashMap<Uuid, String>>>,
    teardown_grace: Duration,
}

impl SessionRegistry {
    /// Create a registry whose empty sessions survive `teardown_grace`
    /// before their revision state is dropped.
    pub fn new(teardown_grace: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            by_connection: Arc::new(RwLock::new(HashMap::new())),
            teardown_grace,
        }
    }

    /// Add a connection to a session, creating the session (revision 0,
    /// `initial_text` as its document) if absent.
    ///
    /// Idempotent: joining again with the same `connection_id` replaces the
    /// outbound queue without duplicating the participant.
    pub async fn join(
        &self,
        session_id: &str,
        connection_id: Uuid,
        outbound: mpsc::Sender<Arc<Vec<u8>>>,
        initial_text: Option<String>,
    ) -> JoinOutcome {
        // Fast path: read lock.
        let existing = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };

        let session = match existing {
            Some(session) => session,
            None => {
                let mut sessions = self.sessions.write().await;
                // Double-check after acquiring the write lock.
                sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| {
                        log::info!("Session {session_id} created");
                        Arc::new(Mutex::new(Session::new(
                            session_id.to_string(),
                            initial_text.unwrap_or_default(),
                        )))
                    })
                    .clone()
            }
        };

        let (resumed, join_epoch) = {
            let mut s = session.lock().await;
            // Any scheduled teardown captured an older epoch and will no-op.
            s.teardown_epoch += 1;
            s.join_counter += 1;
            let epoch = s.join_counter;
            let resumed = s.participants.contains_key(&connection_id);
            s.participants.insert(
                connection_id,
                PeerHandle::new(connection_id, outbound, epoch),
            );
            (resumed, epoch)
        };

        self.by_connection
            .write()
            .await
            .insert(connection_id, session_id.to_string());

        JoinOutcome {
            session,
            resumed,
            join_epoch,
        }
    }

    /// Remove a connection from its session. Unknown connections are a
    /// no-op: a disconnect racing a teardown must not fail.
    ///
    /// When the session empties, teardown is scheduled after the grace
    /// window so a quick rejoin keeps the revision state.
    pub async fn leave(&self, connection_id: Uuid) -> Option<(String, Arc<Mutex<Session>>)> {
        let session_id = self.by_connection.write().await.remove(&connection_id)?;
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(&session_id).cloned()?
        };

        let empty_epoch = {
            let mut s = session.lock().await;
            s.participants.remove(&connection_id);
            if s.participants.is_empty() {
                Some(s.teardown_epoch)
            } else {
                None
            }
        };

        if let Some(epoch) = empty_epoch {
            self.schedule_teardown(session_id.clone(), epoch);
        }

        Some((session_id, session))
    }

    /// Remove a connection only if `join_epoch` still identifies its live
    /// handle. A stale socket's cleanup racing a rejoin of the same
    /// connection id is a no-op instead of evicting the new membership.
    pub async fn leave_if_current(
        &self,
        connection_id: Uuid,
        join_epoch: u64,
    ) -> Option<(String, Arc<Mutex<Session>>)> {
        let session_id = self.by_connection.read().await.get(&connection_id).cloned()?;
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(&session_id).cloned()?
        };

        let empty_epoch = {
            let mut s = session.lock().await;
            match s.participants.get(&connection_id) {
                Some(handle) if handle.join_epoch == join_epoch => {
                    s.participants.remove(&connection_id);
                }
                _ => return None,
            }
            if s.participants.is_empty() {
                Some(s.teardown_epoch)
            } else {
                None
            }
        };

        self.by_connection.write().await.remove(&connection_id);

        if let Some(epoch) = empty_epoch {
            self.schedule_teardown(session_id.clone(), epoch);
        }

        Some((session_id, session))
    }

    fn schedule_teardown(&self, session_id: String, epoch: u64) {
        let sessions = self.sessions.clone();
        let grace = self.teardown_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut map = sessions.write().await;
            let still_empty = match map.get(&session_id) {
                Some(session) => {
                    let s = session.lock().await;
                    s.participants.is_empty() && s.teardown_epoch == epoch
                }
                None => false,
            };
            if still_empty {
                map.remove(&session_id);
                log::info!("Session {session_id} removed (empty past grace period)");
            }
        });
    }

    /// Look up a live session.
    pub async fn session(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Which session a connection belongs to.
    pub async fn session_of(&self, connection_id: Uuid) -> Option<String> {
        self.by_connection.read().await.get(&connection_id).cloned()
    }

    /// All other live connections in a session; empty for unknown sessions.
    pub async fn peers(&self, session_id: &str, excluding: Uuid) -> Vec<PeerHandle> {
        match self.session(session_id).await {
            Some(session) => session.lock().await.peers(excluding),
            None => Vec::new(),
        }
    }

    /// Atomically increment a session's revision counter; `None` for
    /// unknown sessions.
    pub async fn bump_revision(&self, session_id: &str) -> Option<u64> {
        let session = self.session(session_id).await?;
        let mut s = session.lock().await;
        Some(s.bump_revision())
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
