//! Server-side item changes.

use serde::{Deserialize, Serialize};

/// What happened to an item on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The item is new to the device.
    Add,
    /// The item's content changed.
    Modify,
    /// The item was deleted or moved out of the folder.
    Delete,
    /// Only the read flag changed.
    ReadFlag(bool),
}

/// A pending server change for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChange {
    /// Server id of the item.
    pub id: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Backend modification stamp of the change.
    pub stamp: u64,
}

impl ItemChange {
    /// Creates a change.
    pub fn new(id: impl Into<String>, kind: ChangeKind, stamp: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            stamp,
        }
    }

    /// Returns true if exporting this change needs the item payload.
    pub fn needs_payload(&self) -> bool {
        matches!(self.kind, ChangeKind::Add | ChangeKind::Modify)
    }
}

/// Identity and modification stamp of an item after the backend applied a
/// device change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStat {
    /// Server id.
    pub id: String,
    /// Modification stamp after the change.
    pub stamp: u64,
}
