//! Collections as requested by a device.

use crate::conflict::ConflictPolicy;
use crate::synckey::SyncKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Window size used when the device sends none or an invalid one.
pub const DEFAULT_WINDOW_SIZE: u32 = 100;

/// Largest window size a device may request.
pub const MAX_WINDOW_SIZE: u32 = 512;

/// `Truncation` value meaning "do not truncate".
pub const TRUNCATION_ALL: u8 = 9;

/// `MIMESupport` value meaning "never send MIME".
pub const MIME_SUPPORT_NONE: u8 = 0;

/// `MIMETruncation` value meaning "do not truncate".
pub const MIME_TRUNCATION_ALL: u8 = 8;

/// Clamps a requested window size.
///
/// Values in `1..=512` are kept; anything else falls back to the default
/// of 100.
pub fn clamp_window_size(requested: i64) -> u32 {
    if (1..=i64::from(MAX_WINDOW_SIZE)).contains(&requested) {
        requested as u32
    } else {
        DEFAULT_WINDOW_SIZE
    }
}

/// The kind of data a collection holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionClass {
    /// Mail folders.
    Email,
    /// Address books.
    Contacts,
    /// Calendars.
    Calendar,
    /// Task lists.
    Tasks,
    /// Notes.
    Notes,
}

impl CollectionClass {
    /// Returns the wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionClass::Email => "Email",
            CollectionClass::Contacts => "Contacts",
            CollectionClass::Calendar => "Calendar",
            CollectionClass::Tasks => "Tasks",
            CollectionClass::Notes => "Notes",
        }
    }
}

impl FromStr for CollectionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Email" => Ok(CollectionClass::Email),
            "Contacts" => Ok(CollectionClass::Contacts),
            "Calendar" => Ok(CollectionClass::Calendar),
            "Tasks" => Ok(CollectionClass::Tasks),
            "Notes" => Ok(CollectionClass::Notes),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for CollectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `BodyPreference` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPreference {
    /// Body type (1 plain, 2 HTML, 3 RTF, 4 MIME).
    pub body_type: u8,
    /// Truncation size in bytes, if requested.
    pub truncation_size: Option<u32>,
    /// Send nothing rather than a truncated body.
    pub all_or_none: bool,
}

/// Per-collection options.
///
/// Every field is optional so that an abbreviated request can be completed
/// from the sync cache with [`CollectionSettings::fill_missing`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSettings {
    /// `FilterType` (0 = no filter).
    pub filter_type: Option<u8>,
    /// `Truncation`.
    pub truncation: Option<u8>,
    /// `RTFTruncation`.
    pub rtf_truncation: Option<u8>,
    /// `MIMESupport`.
    pub mime_support: Option<u8>,
    /// `MIMETruncation`.
    pub mime_truncation: Option<u8>,
    /// `Conflict`.
    pub conflict: Option<ConflictPolicy>,
    /// Body preferences; empty when none were sent.
    pub body_prefs: Vec<BodyPreference>,
    /// `WindowSize`, already clamped.
    pub window_size: Option<u32>,
    /// `DeletesAsMoves`.
    pub deletes_as_moves: Option<bool>,
}

impl CollectionSettings {
    /// Fills every unset field from `cached`.
    pub fn fill_missing(&mut self, cached: &CollectionSettings) {
        self.filter_type = self.filter_type.or(cached.filter_type);
        self.truncation = self.truncation.or(cached.truncation);
        self.rtf_truncation = self.rtf_truncation.or(cached.rtf_truncation);
        self.mime_support = self.mime_support.or(cached.mime_support);
        self.mime_truncation = self.mime_truncation.or(cached.mime_truncation);
        self.conflict = self.conflict.or(cached.conflict);
        self.window_size = self.window_size.or(cached.window_size);
        self.deletes_as_moves = self.deletes_as_moves.or(cached.deletes_as_moves);
        if self.body_prefs.is_empty() {
            self.body_prefs = cached.body_prefs.clone();
        }
    }

    /// Fills the remaining gaps with protocol defaults.
    pub fn apply_defaults(&mut self) {
        self.truncation.get_or_insert(TRUNCATION_ALL);
        self.mime_support.get_or_insert(MIME_SUPPORT_NONE);
        self.mime_truncation.get_or_insert(MIME_TRUNCATION_ALL);
        self.conflict.get_or_insert(ConflictPolicy::default());
        self.window_size.get_or_insert(DEFAULT_WINDOW_SIZE);
    }

    /// Returns the window size in effect.
    pub fn window_size(&self) -> u32 {
        self.window_size.unwrap_or(DEFAULT_WINDOW_SIZE)
    }

    /// Returns the conflict policy in effect.
    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict.unwrap_or_default()
    }

    /// Returns true if deletes must be turned into moves to the wastebasket.
    pub fn deletes_as_moves(&self) -> bool {
        self.deletes_as_moves.unwrap_or(false)
    }
}

/// A change the device submits in `Commands`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// A new item, identified by the device's temporary id.
    Add {
        /// Device-assigned id echoed back in the response.
        client_id: String,
        /// Opaque item payload.
        data: Vec<u8>,
    },
    /// A change to an existing item.
    Modify {
        /// Server id of the item.
        server_id: String,
        /// Opaque item payload.
        data: Vec<u8>,
    },
    /// A change that only sets the read flag.
    ReadFlag {
        /// Server id of the item.
        server_id: String,
        /// New flag.
        read: bool,
    },
    /// A deletion.
    Remove {
        /// Server id of the item.
        server_id: String,
    },
    /// A request for the full item.
    Fetch {
        /// Server id of the item.
        server_id: String,
    },
}

impl ClientCommand {
    /// Returns true for commands that change server data.
    pub fn is_import(&self) -> bool {
        !matches!(self, ClientCommand::Fetch { .. })
    }
}

/// One collection of a SYNC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCollection {
    /// Server folder id (`CollectionId`).
    pub id: String,
    /// Collection class, if sent or known from the cache.
    pub class: Option<CollectionClass>,
    /// The synckey the device presented.
    pub synckey: SyncKey,
    /// Options sent with the collection.
    pub settings: CollectionSettings,
    /// Explicit `GetChanges`, if sent.
    pub get_changes: Option<bool>,
    /// Commands in document order.
    pub commands: Vec<ClientCommand>,
    /// `Supported` field names, if sent.
    pub supported: Option<Vec<String>>,
}

impl SyncCollection {
    /// Creates a collection with no options or commands.
    pub fn new(id: impl Into<String>, synckey: SyncKey) -> Self {
        Self {
            id: id.into(),
            class: None,
            synckey,
            settings: CollectionSettings::default(),
            get_changes: None,
            commands: Vec::new(),
            supported: None,
        }
    }

    /// Sets the class.
    pub fn with_class(mut self, class: CollectionClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Sets the options.
    pub fn with_settings(mut self, settings: CollectionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Whether server changes should be returned.
    ///
    /// Without an explicit `GetChanges`, changes are returned for every key
    /// except the initial one.
    pub fn wants_changes(&self) -> bool {
        self.get_changes.unwrap_or(!self.synckey.is_initial())
    }

    /// Returns true if any command changes server data.
    pub fn has_imports(&self) -> bool {
        self.commands.iter().any(ClientCommand::is_import)
    }
}
