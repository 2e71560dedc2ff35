//! # devpad-collab - Real-time collaborative editing core for DevPad
//!
//! Change propagation for the shared code editor: multiple participants
//! edit the same document, every accepted change gets a centrally assigned
//! revision, and each participant's local view reconciles remote changes
//! against its own in-flight edit.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ RelayServer  │
//! │ (per user)   │    Binary Proto     │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                    ┌────────────────┐
//! │ Reconcile    │                    │ SessionRegistry│
//! │ Engine       │                    │ (revision +    │
//! │ (rebase)     │                    │  fan-out)      │
//! └──────────────┘                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`change`] - edit translation between widget events and wire descriptors
//! - [`protocol`] - binary wire protocol (bincode-encoded [`Message`])
//! - [`registry`] - session ownership: participants, revision, teardown grace
//! - [`relay`] - revision assignment and in-order fan-out to peers
//! - [`reconcile`] - client-side state machine and offset rebase
//! - [`client`] - connection lifecycle: join, reconnect-with-resync, leave
//! - [`signal`] - media-signaling pass-through on the same transport
//!
//! ## Ordering guarantees
//!
//! Per-session total order established solely by revision assignment;
//! per-peer delivery order equals assignment order; no ordering across
//! sessions.

pub mod change;
pub mod client;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod signal;

// Re-exports for convenience
pub use change::{
    AppliedChange, ChangeDescriptor, ChangeError, EditEvent, EditInstruction,
};
pub use client::{CollabClient, CollabEvent, ConnectionState};
pub use protocol::{Message, ProtocolError};
pub use reconcile::{
    EditQueue, LocalEdit, ReconcileEngine, RemoteApply, ResyncReason, SyncState,
};
pub use registry::{JoinOutcome, PeerHandle, Session, SessionRegistry, SessionStats};
pub use relay::{IdentityHook, RelayConfig, RelayServer, RelayStats, SnapshotHook};
pub use signal::SignalMessage;
