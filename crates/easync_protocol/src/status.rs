//! Status codes returned in-band by each command.

use std::fmt;

/// Status codes of the SYNC command, globally or per collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// The exchange succeeded.
    Success,
    /// The protocol version does not support the request.
    VersionMismatch,
    /// The synckey is invalid or stale; the client must resync from `0`.
    KeyMismatch,
    /// The request is malformed.
    ProtocolError,
    /// The server could not complete the request.
    ServerError,
    /// A fetched or changed item does not exist.
    ObjectNotFound,
    /// The folder hierarchy changed; the client must issue FOLDERSYNC.
    FolderSyncRequired,
    /// The client must send the full request instead of a short one.
    RequestIncomplete,
    /// `Wait` or `HeartbeatInterval` is out of range.
    InvalidWaitOrHeartbeat,
}

impl SyncStatus {
    /// Returns the wire value.
    pub fn code(self) -> u8 {
        match self {
            SyncStatus::Success => 1,
            SyncStatus::VersionMismatch => 2,
            SyncStatus::KeyMismatch => 3,
            SyncStatus::ProtocolError => 4,
            SyncStatus::ServerError => 5,
            SyncStatus::ObjectNotFound => 8,
            SyncStatus::FolderSyncRequired => 12,
            SyncStatus::RequestIncomplete => 13,
            SyncStatus::InvalidWaitOrHeartbeat => 14,
        }
    }

    /// Parses a wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => SyncStatus::Success,
            2 => SyncStatus::VersionMismatch,
            3 => SyncStatus::KeyMismatch,
            4 => SyncStatus::ProtocolError,
            5 => SyncStatus::ServerError,
            8 => SyncStatus::ObjectNotFound,
            12 => SyncStatus::FolderSyncRequired,
            13 => SyncStatus::RequestIncomplete,
            14 => SyncStatus::InvalidWaitOrHeartbeat,
            _ => return None,
        })
    }
}

/// Status codes of the PING command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PingStatus {
    /// The heartbeat expired without changes.
    NoChanges,
    /// At least one folder has changes.
    ChangesAvailable,
    /// The request named no folders and none are cached.
    MissingParameters,
    /// The request is malformed.
    ProtocolError,
    /// The heartbeat is outside the allowed range.
    HeartbeatOutOfBounds,
    /// More folders than the server monitors.
    TooManyFolders,
    /// The folder hierarchy changed.
    FolderSyncRequired,
    /// The server could not complete the request.
    ServerError,
}

impl PingStatus {
    /// Returns the wire value.
    pub fn code(self) -> u8 {
        match self {
            PingStatus::NoChanges => 1,
            PingStatus::ChangesAvailable => 2,
            PingStatus::MissingParameters => 3,
            PingStatus::ProtocolError => 4,
            PingStatus::HeartbeatOutOfBounds => 5,
            PingStatus::TooManyFolders => 6,
            PingStatus::FolderSyncRequired => 7,
            PingStatus::ServerError => 8,
        }
    }

    /// Parses a wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => PingStatus::NoChanges,
            2 => PingStatus::ChangesAvailable,
            3 => PingStatus::MissingParameters,
            4 => PingStatus::ProtocolError,
            5 => PingStatus::HeartbeatOutOfBounds,
            6 => PingStatus::TooManyFolders,
            7 => PingStatus::FolderSyncRequired,
            8 => PingStatus::ServerError,
            _ => return None,
        })
    }
}

/// Status codes of the FOLDERSYNC command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderSyncStatus {
    /// The exchange succeeded.
    Success,
    /// The server could not complete the request.
    ServerError,
    /// The synckey is invalid or stale.
    KeyMismatch,
    /// The request is malformed.
    FormatError,
}

impl FolderSyncStatus {
    /// Returns the wire value.
    pub fn code(self) -> u8 {
        match self {
            FolderSyncStatus::Success => 1,
            FolderSyncStatus::ServerError => 6,
            FolderSyncStatus::KeyMismatch => 9,
            FolderSyncStatus::FormatError => 10,
        }
    }

    /// Parses a wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => FolderSyncStatus::Success,
            6 => FolderSyncStatus::ServerError,
            9 => FolderSyncStatus::KeyMismatch,
            10 => FolderSyncStatus::FormatError,
            _ => return None,
        })
    }
}

macro_rules! display_code {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.code())
            }
        })*
    };
}

display_code!(SyncStatus, PingStatus, FolderSyncStatus);
