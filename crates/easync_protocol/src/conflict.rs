//! Conflict policy for device-originated changes.

use serde::{Deserialize, Serialize};

/// How a device change to an item that also changed on the server is
/// resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// The device's version replaces the server's (`Conflict` = 0).
    ClientWins,
    /// The server's version is kept and sent back to the device
    /// (`Conflict` = 1).
    ServerWins,
}

impl ConflictPolicy {
    /// Returns the wire value.
    pub fn code(self) -> u8 {
        match self {
            ConflictPolicy::ClientWins => 0,
            ConflictPolicy::ServerWins => 1,
        }
    }

    /// Parses a wire value.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ConflictPolicy::ClientWins),
            1 => Some(ConflictPolicy::ServerWins),
            _ => None,
        }
    }

    /// Decides whether a device change must be dropped in favour of the
    /// server copy.
    ///
    /// `server_stamp` is the item's modification stamp on the server and
    /// `synced_through` the stamp the device last synchronized up to. A
    /// conflict exists only when the server copy changed after that point.
    pub fn server_keeps(self, server_stamp: u64, synced_through: Option<u64>) -> bool {
        let changed_since_sync = match synced_through {
            Some(stamp) => server_stamp > stamp,
            None => false,
        };
        changed_since_sync && self == ConflictPolicy::ServerWins
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::ServerWins
    }
}
