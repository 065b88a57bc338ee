//! # Core Engine Module
//!
//! Everything needed to run a shared ranked list, independent of transport.
//!
//! ## Core Components:
//!
//! - **`hub`**: The single task that owns all state and serializes client
//!   events, keepalive rounds and debounced saves.
//!
//! - **`engine`**: Command handling, voting, moderation and connection
//!   lifecycle. Driven by the hub.
//!
//! - **`ranklist`**: The ordered item list with lock-aware promotion.
//!
//! - **`dispatcher`**: Zero-copy fan-out of serialized messages to sockets.
//!
//! - **`persistence`**: Dirty-tracked JSON documents over a pluggable blob
//!   store, with numbered archive rollover.
//!
//! - **`presence`**: Per-tab connection counts shown to everyone.
//!
//! - **`admission`** / **`abuse`**: Per-address connection caps, ban set and
//!   heuristic strike counters.

#![forbid(unsafe_code)]

pub mod abuse;
pub mod admission;
pub mod commands;
pub mod dispatcher;
pub mod engine;
pub mod hub;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod ranklist;
/// Cancellable delayed tasks with generation tracking.
pub mod scheduler;

// --- Public API Re-exports ---
pub use dispatcher::{Dispatcher, Outbound, OutboundReceiver, OutboundSender};
pub use engine::{idle_grace, CloseReason, Engine, Rejection};
pub use hub::{Hub, HubEvent, HubHandle};
pub use persistence::{BlobStore, Document, FsStore, MemoryStore, StoreError};
pub use presence::{Counts, Tab};
pub use protocol::{ChatLine, ServerMessage};
pub use ranklist::{ListItem, RankedList, SessionId};
