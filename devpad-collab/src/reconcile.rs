//! Local Reconciliation Engine.
//!
//! Keeps one participant's visible document consistent with the canonical
//! session history while a local edit is in flight: optimistic local apply,
//! eventual remote confirmation.
//!
//! ```text
//!          local edit                     ack (assigned revision)
//!   SYNCED ──────────▶ PENDING ─────────────────────────▶ SYNCED
//!              │            │
//!              │            └─ remote change: rebased against the one
//!              │               outstanding edit before applying
//!              └─ further local edits queue behind the pending one
//! ```
//!
//! At most one local edit is outstanding per connection. Anything typed
//! while waiting queues and is sent after the ack, which bounds every rebase
//! to one outstanding edit against N incoming remote changes. When a clean
//! rebase is not possible the engine discards its optimistic state and asks
//! for a fresh snapshot instead of guessing.

use std::collections::VecDeque;
use uuid::Uuid;

use crate::change::{
    self, AppliedChange, ChangeDescriptor, ChangeError, EditEvent, EditInstruction,
};

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Reconciliation state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No local edit outstanding.
    Synced,
    /// One local edit sent, awaiting acknowledgment.
    Pending,
}

/// Outcome of submitting a local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    /// Send this descriptor to the relay now.
    Send(ChangeDescriptor),
    /// Another edit is outstanding; this one is queued behind it.
    Queued,
    /// The queue is full; the caller must resync.
    Overflow,
}

/// Outcome of an incoming remote change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteApply {
    /// Instruction for the widget to apply, already rebased for the local
    /// view.
    Applied(EditInstruction),
    /// Duplicate delivery or own echo; nothing to do.
    Ignored,
    /// Local state can no longer be reconciled; request a fresh snapshot.
    ResyncRequired(ResyncReason),
}

/// Why a resync became necessary. Recovered transparently, never surfaced
/// as a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// A delivery was missed; applying across the gap would diverge.
    RevisionGap,
    /// Remote offsets exceed the local document bounds.
    OutOfRange,
    /// The remote change targets text the pending edit already replaced.
    StaleRebase,
    /// Remote change raced local edits still waiting in the queue.
    QueuedEdits,
}

impl std::fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RevisionGap => write!(f, "revision gap"),
            Self::OutOfRange => write!(f, "offsets out of range"),
            Self::StaleRebase => write!(f, "pending edit cannot be rebased"),
            Self::QueuedEdits => write!(f, "remote change raced queued edits"),
        }
    }
}

/// The one outstanding local edit, tracked in the coordinates of the synced
/// base revision and shifted as remote changes land ahead of it.
#[derive(Debug, Clone)]
struct PendingEdit {
    from_offset: i64,
    to_offset: i64,
    inserted_text: String,
}

impl PendingEdit {
    fn from_instruction(instruction: &EditInstruction) -> Self {
        Self {
            from_offset: instruction.from_offset as i64,
            to_offset: instruction.to_offset as i64,
            inserted_text: instruction.inserted_text.clone(),
        }
    }

    fn len_delta(&self) -> i64 {
        self.inserted_text.chars().count() as i64 - (self.to_offset - self.from_offset)
    }

    fn instruction(&self) -> EditInstruction {
        EditInstruction {
            from_offset: self.from_offset.max(0) as usize,
            to_offset: self.to_offset.max(0) as usize,
            inserted_text: self.inserted_text.clone(),
        }
    }
}

/// Bounded FIFO of local edits waiting behind the pending one.
#[derive(Debug)]
pub struct EditQueue {
    queue: VecDeque<EditInstruction>,
    max_size: usize,
}

impl EditQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(64)),
            max_size,
        }
    }

    /// Queue an edit for later send. Returns false when full.
    pub fn enqueue(&mut self, instruction: EditInstruction) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(instruction);
        true
    }

    pub fn pop(&mut self) -> Option<EditInstruction> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total characters of queued inserted text.
    pub fn total_chars(&self) -> usize {
        self.queue
            .iter()
            .map(|i| i.inserted_text.chars().count())
            .sum()
    }
}

/// Per-connection reconciliation engine.
pub struct ReconcileEngine {
    connection_id: Uuid,
    /// Optimistic local view; mirrors what the widget shows.
    document: String,
    /// Authoritative view at `last_seen_revision`.
    synced_text: String,
    last_seen_revision: u64,
    pending: Option<PendingEdit>,
    queue: EditQueue,
}

impl ReconcileEngine {
    pub fn new(connection_id: Uuid) -> Self {
        Self::with_queue_capacity(connection_id, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(connection_id: Uuid, queue_capacity: usize) -> Self {
        Self {
            connection_id,
            document: String::new(),
            synced_text: String::new(),
            last_seen_revision: 0,
            pending: None,
            queue: EditQueue::new(queue_capacity),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// The optimistic local view.
    pub fn document(&self) -> &str {
        &self.document
    }

    /// The last authoritative view.
    pub fn synced_text(&self) -> &str {
        &self.synced_text
    }

    pub fn last_seen_revision(&self) -> u64 {
        self.last_seen_revision
    }

    pub fn state(&self) -> SyncState {
        if self.pending.is_some() {
            SyncState::Pending
        } else {
            SyncState::Synced
        }
    }

    pub fn queued_edits(&self) -> usize {
        self.queue.len()
    }

    /// Replace all local state with a fresh authoritative snapshot.
    pub fn resync(&mut self, revision: u64, snapshot_text: String) {
        self.synced_text = snapshot_text;
        self.document = self.synced_text.clone();
        self.last_seen_revision = revision;
        self.pending = None;
        self.queue.clear();
    }

    /// Drop the pending edit and queue, reverting the optimistic view to
    /// the last synced text.
    ///
    /// Used before a reconnect resync: an unacknowledged edit may or may
    /// not have been accepted, and rebasing across that uncertainty is
    /// never attempted.
    pub fn discard_unconfirmed(&mut self) {
        self.pending = None;
        self.queue.clear();
        self.document = self.synced_text.clone();
    }

    /// Submit a local edit from the widget.
    ///
    /// The edit is applied to the local view immediately; whether it is
    /// sent now or queued depends on the state machine. Malformed ranges
    /// are rejected before anything is touched and never sent.
    pub fn local_edit(&mut self, event: &EditEvent) -> Result<LocalEdit, ChangeError> {
        let descriptor = change::encode(event, self.last_seen_revision, self.connection_id)?;
        let doc_len = self.document.chars().count();
        let instruction = change::decode(&descriptor, doc_len)?;

        // Optimistic apply: the widget already shows this edit.
        self.document = change::apply(&self.document, &instruction);

        if self.pending.is_none() {
            self.pending = Some(PendingEdit::from_instruction(&instruction));
            Ok(LocalEdit::Send(descriptor))
        } else if self.queue.enqueue(instruction) {
            Ok(LocalEdit::Queued)
        } else {
            Ok(LocalEdit::Overflow)
        }
    }

    /// Handle the relay's acknowledgment of the outstanding edit.
    ///
    /// Advances the synced view to include the confirmed edit at its
    /// (possibly shifted) range, then promotes the next queued edit if any;
    /// the returned descriptor must be sent to the relay.
    pub fn acknowledge(&mut self, assigned_revision: u64) -> Option<ChangeDescriptor> {
        let pending = self.pending.take()?;
        self.last_seen_revision = assigned_revision;
        self.synced_text = change::apply(&self.synced_text, &pending.instruction());

        let next = self.queue.pop()?;
        let descriptor = ChangeDescriptor {
            from_offset: next.from_offset as u64,
            to_offset: next.to_offset as u64,
            inserted_text: next.inserted_text.clone(),
            origin_revision: self.last_seen_revision,
            originator: self.connection_id,
        };
        self.pending = Some(PendingEdit::from_instruction(&next));
        Some(descriptor)
    }

    /// Apply a remote change delivered by the relay.
    pub fn apply_remote(&mut self, applied: &AppliedChange) -> RemoteApply {
        if applied.change.originator == self.connection_id {
            // Own change echoed back; confirmation arrives as the ack.
            return RemoteApply::Ignored;
        }
        if applied.assigned_revision <= self.last_seen_revision {
            return RemoteApply::Ignored;
        }
        if applied.assigned_revision > self.last_seen_revision + 1 {
            return RemoteApply::ResyncRequired(ResyncReason::RevisionGap);
        }

        match self.pending {
            None => self.apply_remote_synced(applied),
            Some(_) if !self.queue.is_empty() => {
                // The rebase is defined against a single outstanding edit
                // only; queued edits on top make it ambiguous.
                self.discard_to(applied);
                RemoteApply::ResyncRequired(ResyncReason::QueuedEdits)
            }
            Some(_) => self.apply_remote_pending(applied),
        }
    }

    fn apply_remote_synced(&mut self, applied: &AppliedChange) -> RemoteApply {
        let doc_len = self.document.chars().count();
        match applied.instruction(doc_len) {
            Ok(instruction) => {
                self.document = change::apply(&self.document, &instruction);
                self.synced_text = self.document.clone();
                self.last_seen_revision = applied.assigned_revision;
                RemoteApply::Applied(instruction)
            }
            Err(_) => RemoteApply::ResyncRequired(ResyncReason::OutOfRange),
        }
    }

    fn apply_remote_pending(&mut self, applied: &AppliedChange) -> RemoteApply {
        let Some(mut pending) = self.pending.take() else {
            return RemoteApply::Ignored;
        };

        let remote_from = applied.change.from_offset as i64;
        let remote_to = applied.change.to_offset as i64;
        let remote_delta = applied.change.len_delta();

        if remote_to <= pending.from_offset {
            // Entirely before the pending edit: applied as given; the
            // pending edit's effective range shifts with the remote delta.
            let doc_len = self.document.chars().count();
            match applied.instruction(doc_len) {
                Ok(instruction) => {
                    self.document = change::apply(&self.document, &instruction);
                    self.synced_text = change::apply(&self.synced_text, &instruction);
                    pending.from_offset += remote_delta;
                    pending.to_offset += remote_delta;
                    self.last_seen_revision = applied.assigned_revision;
                    self.pending = Some(pending);
                    RemoteApply::Applied(instruction)
                }
                Err(_) => {
                    self.discard_to(applied);
                    RemoteApply::ResyncRequired(ResyncReason::OutOfRange)
                }
            }
        } else if remote_from >= pending.to_offset {
            // Entirely after: shifted by the pending edit's net delta in the
            // local view; the synced view takes it as given.
            let local_delta = pending.len_delta();
            let shifted = ChangeDescriptor {
                from_offset: (remote_from + local_delta) as u64,
                to_offset: (remote_to + local_delta) as u64,
                ..applied.change.clone()
            };
            let doc_len = self.document.chars().count();
            let synced_len = self.synced_text.chars().count();
            match (
                change::decode(&shifted, doc_len),
                applied.instruction(synced_len),
            ) {
                (Ok(local_instruction), Ok(base_instruction)) => {
                    self.document = change::apply(&self.document, &local_instruction);
                    self.synced_text = change::apply(&self.synced_text, &base_instruction);
                    self.last_seen_revision = applied.assigned_revision;
                    self.pending = Some(pending);
                    RemoteApply::Applied(local_instruction)
                }
                _ => {
                    self.discard_to(applied);
                    RemoteApply::ResyncRequired(ResyncReason::OutOfRange)
                }
            }
        } else if remote_from >= pending.from_offset && remote_to <= pending.to_offset {
            // The text the remote change targets was replaced by the pending
            // edit and no longer exists locally.
            self.discard_to(applied);
            RemoteApply::ResyncRequired(ResyncReason::StaleRebase)
        } else {
            // Partial overlap: the remote change wins positionally; the
            // pending edit's effective range carries the remote delta once
            // confirmed.
            let doc_len = self.document.chars().count();
            match applied.instruction(doc_len) {
                Ok(instruction) => {
                    self.document = change::apply(&self.document, &instruction);
                    self.synced_text = change::apply(&self.synced_text, &instruction);
                    pending.from_offset += remote_delta;
                    pending.to_offset += remote_delta;
                    self.last_seen_revision = applied.assigned_revision;
                    self.pending = Some(pending);
                    RemoteApply::Applied(instruction)
                }
                Err(_) => {
                    self.discard_to(applied);
                    RemoteApply::ResyncRequired(ResyncReason::OutOfRange)
                }
            }
        }
    }

    /// Failure path: discard the optimistic local state and reapply the
    /// remote change onto the last synced text. The caller requests a full
    /// resync afterwards.
    fn discard_to(&mut self, applied: &AppliedChange) {
        self.pending = None;
        self.queue.clear();
        let synced_len = self.synced_text.chars().count();
        if let Ok(instruction) = applied.instruction(synced_len) {
            self.synced_text = change::apply(&self.synced_text, &instruction);
            self.last_seen_revision = applied.assigned_revision;
        }
        self.document = self.synced_text.clone();
    }
}
