//! Outbound wire messages. Each serializes as a JSON object with a single
//! top-level key naming the message, e.g. `{"moved":4}`.

use serde::{Deserialize, Serialize};

use super::presence::Counts;
use super::ranklist::{ListItem, SessionId};
use crate::configs::ConfigEcho;

/// A discussion log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    pub text: String,
    pub id: SessionId,
}

/// Full state sent once to a newly admitted connection.
#[derive(Debug, Clone, Serialize)]
pub struct InitialState {
    pub items: Vec<ListItem>,
    pub id: SessionId,
    pub config: ConfigEcho,
    pub lines: Vec<ChatLine>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMessage {
    Initial(InitialState),
    Added(ListItem),
    /// Index the item occupied before removal.
    Removed(usize),
    Update { id: SessionId, text: String },
    /// The item at this index swapped with the one above it.
    Moved(usize),
    Color { id: SessionId, color: String },
    Admin(usize),
    Pinned(usize),
    Announcement(String),
    Lines(Vec<ChatLine>),
    /// Open connection count after the join.
    Joined(usize),
    /// Open connection count after the leave.
    Left(usize),
    /// Connections per tab, sent on join, leave and tab switch.
    Counts(Counts),
    Reset(bool),
}
