//! Backend data store interface.

use crate::config::HeartbeatConfig;
use crate::error::EngineResult;
use crate::notify::ChangeNotifier;
use easync_protocol::{
    CollectionClass, CollectionSettings, ConflictPolicy, Folder, FolderType, ItemChange, ItemStat,
};
use std::sync::Arc;

/// Server changes since a watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerChanges {
    /// Changes in the order they should reach the device.
    pub changes: Vec<ItemChange>,
    /// Watermark to pass as `since` next time.
    pub watermark: String,
}

/// A backend data store.
///
/// The engine never looks inside item payloads; they are moved between the
/// driver and the wire codec as opaque bytes.
///
/// # Thread Safety
///
/// One driver instance serves every request, so implementations must be
/// `Send + Sync`.
pub trait Driver: Send + Sync {
    /// Long-poll timing bounds.
    fn heartbeat_config(&self) -> HeartbeatConfig;

    /// Every folder the user can synchronize.
    fn folder_list(&self) -> EngineResult<Vec<Folder>>;

    /// Looks up one folder; `None` if it no longer exists.
    fn stat_folder(&self, id: &str) -> EngineResult<Option<Folder>>;

    /// Creates a folder on behalf of the device.
    fn create_folder(
        &self,
        parent_id: &str,
        display_name: &str,
        folder_type: FolderType,
    ) -> EngineResult<Folder>;

    /// Renames or moves a folder on behalf of the device.
    fn rename_folder(&self, id: &str, parent_id: &str, display_name: &str)
        -> EngineResult<Folder>;

    /// Deletes a folder on behalf of the device.
    fn delete_folder(&self, id: &str) -> EngineResult<()>;

    /// Changes to a folder since `since`; everything in the folder when
    /// `since` is `None`.
    fn server_changes(
        &self,
        folder: &str,
        since: Option<&str>,
        filter_type: Option<u8>,
    ) -> EngineResult<ServerChanges>;

    /// The payload of an item; `None` if it vanished.
    fn fetch_item(
        &self,
        folder: &str,
        id: &str,
        settings: &CollectionSettings,
    ) -> EngineResult<Option<Vec<u8>>>;

    /// Stores a new item.
    fn add_item(&self, folder: &str, data: &[u8]) -> EngineResult<ItemStat>;

    /// Replaces an item. `since` is the watermark the device synchronized
    /// through, used with `conflict` to decide who wins.
    fn change_item(
        &self,
        folder: &str,
        id: &str,
        data: &[u8],
        conflict: ConflictPolicy,
        since: Option<&str>,
    ) -> EngineResult<ItemStat>;

    /// Sets the read flag of a mail item.
    fn set_read_flag(&self, folder: &str, id: &str, read: bool) -> EngineResult<ItemStat>;

    /// Deletes an item.
    fn delete_item(&self, folder: &str, id: &str) -> EngineResult<()>;

    /// Moves an item to another folder.
    fn move_item(&self, folder: &str, id: &str, destination: &str) -> EngineResult<ItemStat>;

    /// The folder deleted items of `class` are moved to, if any.
    fn waste_basket(&self, class: CollectionClass) -> Option<String>;

    /// Notifier signalled per folder on item changes, if the backend provides
    /// one.
    fn change_notifier(&self) -> Option<Arc<ChangeNotifier>> {
        None
    }
}
