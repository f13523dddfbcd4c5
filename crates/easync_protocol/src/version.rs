//! ActiveSync protocol versions.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A protocol version negotiated through `MS-ASProtocolVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// 2.5
    V2_5,
    /// 12.0
    V12_0,
    /// 12.1
    V12_1,
    /// 14.0
    V14_0,
    /// 14.1
    V14_1,
    /// 16.0
    V16_0,
}

impl ProtocolVersion {
    /// Returns the wire string.
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V2_5 => "2.5",
            ProtocolVersion::V12_0 => "12.0",
            ProtocolVersion::V12_1 => "12.1",
            ProtocolVersion::V14_0 => "14.0",
            ProtocolVersion::V14_1 => "14.1",
            ProtocolVersion::V16_0 => "16.0",
        }
    }

    /// Returns true if the version allows empty and partial SYNC requests,
    /// `Wait` and request-level `WindowSize`.
    pub fn supports_short_sync(self) -> bool {
        self >= ProtocolVersion::V12_1
    }

    /// Returns true if the version allows `HeartbeatInterval` in SYNC.
    pub fn supports_sync_heartbeat(self) -> bool {
        self >= ProtocolVersion::V14_0
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V14_1
    }
}

impl FromStr for ProtocolVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        Ok(match s.trim() {
            "2.5" => ProtocolVersion::V2_5,
            "12.0" => ProtocolVersion::V12_0,
            "12.1" => ProtocolVersion::V12_1,
            "14.0" => ProtocolVersion::V14_0,
            "14.1" => ProtocolVersion::V14_1,
            "16.0" => ProtocolVersion::V16_0,
            other => return Err(ProtocolError::UnsupportedVersion(other.to_string())),
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
