//! Element tags used by the SYNC, PING and FOLDERSYNC commands.
//!
//! Tags are grouped by the WBXML code page they live in. The binary token
//! values are the wire codec's business; here a tag is only an identity plus
//! the XML element name used in logs.

use std::fmt;

/// WBXML code pages referenced by the synchronization commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodePage {
    /// `AirSync:` (page 0).
    AirSync,
    /// `FolderHierarchy:` (page 7).
    FolderHierarchy,
    /// `Ping:` (page 13).
    Ping,
    /// `AirSyncBase:` (page 17).
    AirSyncBase,
}

impl CodePage {
    /// Returns the numeric code page.
    pub fn number(self) -> u8 {
        match self {
            CodePage::AirSync => 0,
            CodePage::FolderHierarchy => 7,
            CodePage::Ping => 13,
            CodePage::AirSyncBase => 17,
        }
    }

    /// Returns the XML namespace prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            CodePage::AirSync => "AirSync",
            CodePage::FolderHierarchy => "FolderHierarchy",
            CodePage::Ping => "Ping",
            CodePage::AirSyncBase => "AirSyncBase",
        }
    }
}

/// A protocol element tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    // AirSync
    /// `Sync`
    Synchronize,
    /// `Responses` (called `Replies` before 12.1 servers renamed it)
    Replies,
    /// `Add`
    Add,
    /// `Change`
    Modify,
    /// `Delete`
    Remove,
    /// `Fetch`
    Fetch,
    /// `SyncKey`
    SyncKey,
    /// `ClientId`
    ClientEntryId,
    /// `ServerId`
    ServerEntryId,
    /// `Status`
    Status,
    /// `Collection`
    Folder,
    /// `Class`
    FolderType,
    /// `CollectionId`
    FolderId,
    /// `GetChanges`
    GetChanges,
    /// `MoreAvailable`
    MoreAvailable,
    /// `WindowSize`
    WindowSize,
    /// `Commands`
    Commands,
    /// `Options`
    Options,
    /// `FilterType`
    FilterType,
    /// `Truncation`
    Truncation,
    /// `RtfTruncation`
    RtfTruncation,
    /// `Conflict`
    Conflict,
    /// `Collections`
    Folders,
    /// `ApplicationData`
    Data,
    /// `DeletesAsMoves`
    DeletesAsMoves,
    /// `Supported`
    Supported,
    /// `MIMESupport`
    MimeSupport,
    /// `MIMETruncation`
    MimeTruncation,
    /// `Wait`
    Wait,
    /// `Limit`
    Limit,
    /// `Partial`
    Partial,
    /// `HeartbeatInterval`
    HeartbeatInterval,
    /// `Read` (flag-only change carried inside ApplicationData)
    Read,

    // AirSyncBase
    /// `BodyPreference`
    BodyPreference,
    /// `Type`
    BodyPreferenceType,
    /// `TruncationSize`
    TruncationSize,
    /// `AllOrNone`
    AllOrNone,

    // FolderHierarchy
    /// `FolderSync`
    FolderSync,
    /// `Status`
    HierarchyStatus,
    /// `SyncKey`
    HierarchySyncKey,
    /// `Changes`
    HierarchyChanges,
    /// `Count`
    HierarchyCount,
    /// `Add`
    HierarchyAdd,
    /// `Update`
    HierarchyUpdate,
    /// `Delete`
    HierarchyDelete,
    /// `ServerId`
    HierarchyServerId,
    /// `ParentId`
    HierarchyParentId,
    /// `DisplayName`
    HierarchyDisplayName,
    /// `Type`
    HierarchyType,

    // Ping
    /// `Ping`
    Ping,
    /// `Status`
    PingStatus,
    /// `HeartbeatInterval`
    PingHeartbeatInterval,
    /// `Folders`
    PingFolders,
    /// `Folder`
    PingFolder,
    /// `Id`
    PingId,
    /// `Class`
    PingClass,
    /// `MaxFolders`
    PingMaxFolders,
}

impl Tag {
    /// Returns the code page this tag belongs to.
    pub fn code_page(self) -> CodePage {
        use Tag::*;
        match self {
            BodyPreference | BodyPreferenceType | TruncationSize | AllOrNone => {
                CodePage::AirSyncBase
            }
            FolderSync | HierarchyStatus | HierarchySyncKey | HierarchyChanges
            | HierarchyCount | HierarchyAdd | HierarchyUpdate | HierarchyDelete
            | HierarchyServerId | HierarchyParentId | HierarchyDisplayName | HierarchyType => {
                CodePage::FolderHierarchy
            }
            Ping | PingStatus | PingHeartbeatInterval | PingFolders | PingFolder | PingId
            | PingClass | PingMaxFolders => CodePage::Ping,
            _ => CodePage::AirSync,
        }
    }

    /// Returns the XML element name (without namespace prefix).
    pub fn name(self) -> &'static str {
        use Tag::*;
        match self {
            Synchronize => "Sync",
            Replies => "Responses",
            Add | HierarchyAdd => "Add",
            Modify => "Change",
            Remove | HierarchyDelete => "Delete",
            Fetch => "Fetch",
            SyncKey | HierarchySyncKey => "SyncKey",
            ClientEntryId => "ClientId",
            ServerEntryId | HierarchyServerId => "ServerId",
            Status | HierarchyStatus | PingStatus => "Status",
            Folder => "Collection",
            FolderType | PingClass => "Class",
            FolderId => "CollectionId",
            GetChanges => "GetChanges",
            MoreAvailable => "MoreAvailable",
            WindowSize => "WindowSize",
            Commands => "Commands",
            Options => "Options",
            FilterType => "FilterType",
            Truncation => "Truncation",
            RtfTruncation => "RTFTruncation",
            Conflict => "Conflict",
            Folders => "Collections",
            Data => "ApplicationData",
            DeletesAsMoves => "DeletesAsMoves",
            Supported => "Supported",
            MimeSupport => "MIMESupport",
            MimeTruncation => "MIMETruncation",
            Wait => "Wait",
            Limit => "Limit",
            Partial => "Partial",
            HeartbeatInterval | PingHeartbeatInterval => "HeartbeatInterval",
            Read => "Read",
            BodyPreference => "BodyPreference",
            BodyPreferenceType | HierarchyType => "Type",
            TruncationSize => "TruncationSize",
            AllOrNone => "AllOrNone",
            FolderSync => "FolderSync",
            HierarchyChanges => "Changes",
            HierarchyCount => "Count",
            HierarchyUpdate => "Update",
            HierarchyParentId => "ParentId",
            HierarchyDisplayName => "DisplayName",
            Ping => "Ping",
            PingFolders => "Folders",
            PingFolder => "Folder",
            PingId => "Id",
            PingMaxFolders => "MaxFolders",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code_page().prefix(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_names_are_namespaced() {
        assert_eq!(Tag::Status.to_string(), "AirSync:Status");
        assert_eq!(Tag::PingStatus.to_string(), "Ping:Status");
        assert_eq!(Tag::HierarchyStatus.to_string(), "FolderHierarchy:Status");
    }

    #[test]
    fn code_pages() {
        assert_eq!(Tag::BodyPreference.code_page().number(), 17);
        assert_eq!(Tag::PingFolder.code_page().number(), 13);
        assert_eq!(Tag::HierarchyAdd.code_page().number(), 7);
        assert_eq!(Tag::Synchronize.code_page().number(), 0);
    }
}
