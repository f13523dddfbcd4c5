//! Persisted record types.

use easync_protocol::{
    CollectionClass, CollectionSettings, Folder, ItemChange, ProtocolVersion, SyncCollection,
    SyncKey,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What a synchronization state row tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateScope {
    /// The folder hierarchy (FOLDERSYNC).
    Hierarchy,
    /// One collection (SYNC).
    Collection(String),
}

impl StateScope {
    /// Creates a collection scope.
    pub fn collection(id: impl Into<String>) -> Self {
        StateScope::Collection(id.into())
    }

    /// Returns the collection id, if any.
    pub fn collection_id(&self) -> Option<&str> {
        match self {
            StateScope::Hierarchy => None,
            StateScope::Collection(id) => Some(id),
        }
    }
}

impl fmt::Display for StateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateScope::Hierarchy => f.write_str("hierarchy"),
            StateScope::Collection(id) => write!(f, "collection:{id}"),
        }
    }
}

/// Synchronization state for one (device, user, scope).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateRecord {
    /// Device id.
    pub device_id: String,
    /// User name.
    pub user: String,
    /// What the state tracks.
    pub scope: StateScope,
    /// The latest synckey issued for this scope.
    pub synckey: SyncKey,
    /// Backend continuation token; `None` before the first export.
    pub watermark: Option<String>,
    /// Server changes computed but not yet sent to the device.
    pub pending: Vec<ItemChange>,
    /// Items the device changed during the current exchange, with the
    /// backend stamp after the change. Used to avoid echoing them back.
    pub device_changes: BTreeMap<String, u64>,
    /// Folders the device knows about (hierarchy scope only).
    pub folders: Vec<Folder>,
    /// Unix time of the last save.
    pub last_sync: u64,
}

impl SyncStateRecord {
    /// Creates an empty state at synckey `0`.
    pub fn new(device_id: impl Into<String>, user: impl Into<String>, scope: StateScope) -> Self {
        Self {
            device_id: device_id.into(),
            user: user.into(),
            scope,
            synckey: SyncKey::Initial,
            watermark: None,
            pending: Vec::new(),
            device_changes: BTreeMap::new(),
            folders: Vec::new(),
            last_sync: 0,
        }
    }

    /// Replaces the known folder list, keeping it sorted by server id.
    pub fn set_folder_data(&mut self, mut folders: Vec<Folder>) {
        folders.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        self.folders = folders;
    }
}

/// The persistent projection of a collection in the sync cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCollection {
    /// Server folder id.
    pub id: String,
    /// Collection class, once known.
    pub class: Option<CollectionClass>,
    /// Latest synckey the device was given.
    pub synckey: Option<SyncKey>,
    /// Options last sent by the device.
    pub settings: CollectionSettings,
    /// Whether PING monitors this collection.
    pub pingable: bool,
}

impl CachedCollection {
    /// Creates a cache entry from a request collection.
    pub fn from_request(collection: &SyncCollection) -> Self {
        Self {
            id: collection.id.clone(),
            class: collection.class,
            synckey: Some(collection.synckey),
            settings: collection.settings.clone(),
            pingable: false,
        }
    }

    /// Returns the cached synckey, if it is an issued one.
    pub fn issued_key(&self) -> Option<SyncKey> {
        self.synckey.filter(|k| !k.is_initial())
    }

    /// Rebuilds a request collection from the cached settings.
    pub fn to_request(&self) -> SyncCollection {
        let mut collection =
            SyncCollection::new(self.id.clone(), self.synckey.unwrap_or(SyncKey::Initial))
                .with_settings(self.settings.clone());
        collection.class = self.class;
        collection
    }
}

/// Device-scoped snapshot of request context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCacheRecord {
    /// Device id.
    pub device_id: String,
    /// User name.
    pub user: String,
    /// Cached collections by id.
    pub collections: BTreeMap<String, CachedCollection>,
    /// Folder cache by server id.
    pub folders: BTreeMap<String, Folder>,
    /// Synckeys issued but not yet presented back by the device.
    pub confirmed_synckeys: BTreeSet<String>,
    /// Latest hierarchy synckey.
    pub hierarchy: Option<SyncKey>,
    /// SYNC `Wait`, in minutes.
    pub wait: Option<u32>,
    /// SYNC `HeartbeatInterval`, in seconds.
    pub hbinterval: Option<u32>,
    /// Last PING heartbeat, in seconds.
    pub ping_heartbeat: Option<u32>,
    /// Deadline of the last looping request.
    pub last_until: Option<u64>,
    /// Start of the last looping SYNC.
    pub last_hb_sync_started: Option<u64>,
    /// Normal end of the last looping SYNC.
    pub last_sync_end_normal: Option<u64>,
    /// Consecutive failed exchanges per collection, on the key presented.
    #[serde(default)]
    pub loop_counters: BTreeMap<String, LoopCounter>,
    /// Unix time of the last save.
    pub timestamp: u64,
    /// Incremented on every successful save.
    pub generation: u64,
}

impl SyncCacheRecord {
    /// Creates an empty cache record.
    pub fn new(device_id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user: user.into(),
            ..Default::default()
        }
    }
}

/// How often a collection's exchange failed on the same synckey in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCounter {
    /// The key the device kept presenting.
    pub synckey: SyncKey,
    /// Failed exchanges on that key.
    pub count: u32,
}

/// Remote wipe state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteWipeStatus {
    /// No wipe requested.
    Ok,
    /// A wipe was requested and not yet acknowledged.
    Pending,
    /// The device acknowledged the wipe.
    Wiped,
}

impl RemoteWipeStatus {
    /// Returns true if the device must not synchronize.
    pub fn blocks_sync(self) -> bool {
        !matches!(self, RemoteWipeStatus::Ok)
    }
}

/// A device paired with a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device id.
    pub id: String,
    /// User name.
    pub user: String,
    /// Device type string sent by the client.
    pub device_type: String,
    /// Protocol version last used.
    pub version: ProtocolVersion,
    /// Provisioning policy key.
    pub policy_key: u32,
    /// Remote wipe state.
    pub rw_status: RemoteWipeStatus,
    /// `Supported` field lists by collection class.
    pub supported: BTreeMap<String, Vec<String>>,
    /// Unix time of first contact.
    pub first_seen: u64,
    /// Unix time of the latest request.
    pub last_seen: u64,
}

impl DeviceRecord {
    /// Creates a device record on first contact.
    pub fn new(id: impl Into<String>, user: impl Into<String>, now: u64) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            device_type: String::new(),
            version: ProtocolVersion::default(),
            policy_key: 0,
            rw_status: RemoteWipeStatus::Ok,
            supported: BTreeMap::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Sets the device type.
    pub fn with_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }
}

/// Selects synchronization state rows for removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFilter {
    /// Only rows of this device.
    pub device_id: Option<String>,
    /// Only rows of this user.
    pub user: Option<String>,
    /// Only rows of this scope.
    pub scope: Option<StateScope>,
    /// Only rows at this synckey.
    pub synckey: Option<SyncKey>,
}

impl StateFilter {
    /// Matches every row of a device.
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Default::default()
        }
    }

    /// Matches the row holding a synckey.
    pub fn synckey(key: SyncKey) -> Self {
        Self {
            synckey: Some(key),
            ..Default::default()
        }
    }

    /// Restricts the filter to a user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Restricts the filter to a scope.
    pub fn with_scope(mut self, scope: StateScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Returns true if the record matches every set criterion.
    pub fn matches(&self, record: &SyncStateRecord) -> bool {
        self.device_id.as_ref().map_or(true, |d| *d == record.device_id)
            && self.user.as_ref().map_or(true, |u| *u == record.user)
            && self.scope.as_ref().map_or(true, |s| *s == record.scope)
            && self.synckey.as_ref().map_or(true, |k| *k == record.synckey)
    }
}
