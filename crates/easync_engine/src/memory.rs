//! In-memory reference driver.

use crate::config::HeartbeatConfig;
use crate::driver::{Driver, ServerChanges};
use crate::error::{EngineError, EngineResult};
use crate::notify::ChangeNotifier;
use easync_protocol::{
    ChangeKind, CollectionClass, CollectionSettings, ConflictPolicy, Folder, FolderType,
    ItemChange, ItemStat,
};
use easync_state::StateError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Item {
    data: Vec<u8>,
    stamp: u64,
    read: bool,
}

#[derive(Debug)]
struct LogEntry {
    folder: String,
    change: ItemChange,
}

#[derive(Debug, Default)]
struct Inner {
    folders: BTreeMap<String, Folder>,
    items: BTreeMap<String, BTreeMap<String, Item>>,
    log: Vec<LogEntry>,
    seq: u64,
    next_id: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn record(&mut self, folder: &str, id: &str, kind: ChangeKind) -> u64 {
        let seq = self.bump();
        self.log.push(LogEntry {
            folder: folder.to_string(),
            change: ItemChange::new(id, kind, seq),
        });
        seq
    }

    fn folder_items(&mut self, folder: &str) -> EngineResult<&mut BTreeMap<String, Item>> {
        self.items
            .get_mut(folder)
            .ok_or_else(|| StateError::FolderGone(folder.to_string()).into())
    }
}

/// An in-memory driver.
///
/// Folders hold items keyed by id. Every item mutation is appended to a log
/// under a global sequence number; the watermark handed to devices is the
/// sequence number of the last change they saw. Item mutations signal their
/// folder on the driver's [`ChangeNotifier`]; folder list changes signal
/// every waiter.
///
/// # Example
///
/// ```rust
/// use easync_engine::{Driver, MemoryDriver};
/// use easync_protocol::{Folder, FolderType};
///
/// let driver = MemoryDriver::new();
/// driver.add_folder(Folder::new("INBOX", "Inbox", FolderType::INBOX));
/// driver.put_item("INBOX", "1", b"hello").unwrap();
///
/// let changes = driver.server_changes("INBOX", None, None).unwrap();
/// assert_eq!(changes.changes.len(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryDriver {
    inner: RwLock<Inner>,
    notifier: Arc<ChangeNotifier>,
    config: HeartbeatConfig,
    failing: AtomicBool,
}

impl MemoryDriver {
    /// Creates a driver with no folders and the default heartbeat bounds.
    pub fn new() -> Self {
        Self::with_config(HeartbeatConfig::default())
    }

    /// Creates a driver with the given heartbeat bounds.
    pub fn with_config(config: HeartbeatConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            notifier: Arc::new(ChangeNotifier::new()),
            config,
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every later call fail with a driver error, or stop failing.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> EngineResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(EngineError::driver("backend unavailable"))
        } else {
            Ok(())
        }
    }

    /// Adds or replaces a folder.
    pub fn add_folder(&self, folder: Folder) {
        let mut inner = self.inner.write();
        inner.items.entry(folder.server_id.clone()).or_default();
        inner.folders.insert(folder.server_id.clone(), folder);
        inner.bump();
        drop(inner);
        self.notifier.notify();
    }

    /// Removes a folder and its items.
    pub fn remove_folder(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let existed = inner.folders.remove(id).is_some();
        inner.items.remove(id);
        inner.log.retain(|entry| entry.folder != id);
        inner.bump();
        drop(inner);
        self.notifier.notify();
        existed
    }

    /// Creates or replaces an item with a server-side change. Returns the
    /// new stamp.
    ///
    /// # Errors
    ///
    /// Fails if the folder does not exist.
    pub fn put_item(&self, folder: &str, id: &str, data: &[u8]) -> EngineResult<u64> {
        let mut inner = self.inner.write();
        let existed = inner.folder_items(folder)?.contains_key(id);
        let kind = if existed { ChangeKind::Modify } else { ChangeKind::Add };
        let stamp = inner.record(folder, id, kind);
        let items = inner.folder_items(folder)?;
        let read = items.get(id).is_some_and(|item| item.read);
        items.insert(
            id.to_string(),
            Item {
                data: data.to_vec(),
                stamp,
                read,
            },
        );
        drop(inner);
        self.notifier.notify_folder(folder);
        Ok(stamp)
    }

    /// Deletes an item with a server-side change.
    ///
    /// # Errors
    ///
    /// Fails if the item does not exist.
    pub fn remove_item(&self, folder: &str, id: &str) -> EngineResult<()> {
        self.delete_item(folder, id)
    }

    /// Sets the read flag with a server-side change.
    ///
    /// # Errors
    ///
    /// Fails if the item does not exist.
    pub fn set_read(&self, folder: &str, id: &str, read: bool) -> EngineResult<u64> {
        self.set_read_flag(folder, id, read).map(|stat| stat.stamp)
    }

    /// The payload of an item.
    pub fn item(&self, folder: &str, id: &str) -> Option<Vec<u8>> {
        self.inner
            .read()
            .items
            .get(folder)
            .and_then(|items| items.get(id))
            .map(|item| item.data.clone())
    }

    /// Number of items in a folder.
    pub fn item_count(&self, folder: &str) -> usize {
        self.inner.read().items.get(folder).map_or(0, BTreeMap::len)
    }

    fn parse_watermark(since: Option<&str>) -> EngineResult<Option<u64>> {
        since
            .map(|w| {
                w.parse::<u64>()
                    .map_err(|_| EngineError::driver(format!("invalid watermark {w:?}")))
            })
            .transpose()
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MemoryDriver {
    fn heartbeat_config(&self) -> HeartbeatConfig {
        self.config.clone()
    }

    fn folder_list(&self) -> EngineResult<Vec<Folder>> {
        self.check()?;
        Ok(self.inner.read().folders.values().cloned().collect())
    }

    fn stat_folder(&self, id: &str) -> EngineResult<Option<Folder>> {
        self.check()?;
        Ok(self.inner.read().folders.get(id).cloned())
    }

    fn create_folder(
        &self,
        parent_id: &str,
        display_name: &str,
        folder_type: FolderType,
    ) -> EngineResult<Folder> {
        self.check()?;
        let folder = {
            let mut inner = self.inner.write();
            inner.next_id += 1;
            let folder = Folder::new(format!("f{}", inner.next_id), display_name, folder_type)
                .with_parent(parent_id);
            inner.items.insert(folder.server_id.clone(), BTreeMap::new());
            inner.folders.insert(folder.server_id.clone(), folder.clone());
            folder
        };
        self.notifier.notify();
        Ok(folder)
    }

    fn rename_folder(
        &self,
        id: &str,
        parent_id: &str,
        display_name: &str,
    ) -> EngineResult<Folder> {
        self.check()?;
        let folder = {
            let mut inner = self.inner.write();
            let folder = inner
                .folders
                .get_mut(id)
                .ok_or_else(|| EngineError::from(StateError::FolderGone(id.to_string())))?;
            folder.parent_id = parent_id.to_string();
            folder.display_name = display_name.to_string();
            folder.clone()
        };
        self.notifier.notify();
        Ok(folder)
    }

    fn delete_folder(&self, id: &str) -> EngineResult<()> {
        self.check()?;
        if self.remove_folder(id) {
            Ok(())
        } else {
            Err(StateError::FolderGone(id.to_string()).into())
        }
    }

    fn server_changes(
        &self,
        folder: &str,
        since: Option<&str>,
        _filter_type: Option<u8>,
    ) -> EngineResult<ServerChanges> {
        self.check()?;
        let since = Self::parse_watermark(since)?;
        let inner = self.inner.read();
        let items = inner
            .items
            .get(folder)
            .ok_or_else(|| EngineError::from(StateError::FolderGone(folder.to_string())))?;

        let changes: Vec<ItemChange> = match since {
            None => items
                .iter()
                .map(|(id, item)| ItemChange::new(id.clone(), ChangeKind::Add, item.stamp))
                .collect(),
            Some(since) => {
                // Collapse the log to one change per item. A content change
                // outweighs a later read flag change.
                let mut collapsed: BTreeMap<&str, (ChangeKind, bool, ItemChange)> =
                    BTreeMap::new();
                for entry in inner
                    .log
                    .iter()
                    .filter(|e| e.folder == folder && e.change.stamp > since)
                {
                    let id = entry.change.id.as_str();
                    let content = matches!(entry.change.kind, ChangeKind::Add | ChangeKind::Modify);
                    match collapsed.get_mut(id) {
                        Some((_, changed, last)) => {
                            *changed |= content;
                            *last = entry.change.clone();
                        }
                        None => {
                            collapsed
                                .insert(id, (entry.change.kind, content, entry.change.clone()));
                        }
                    }
                }
                let mut changes: Vec<ItemChange> = collapsed
                    .into_values()
                    .filter_map(|(first, changed, mut last)| match (first, last.kind) {
                        (ChangeKind::Add, ChangeKind::Delete) => None,
                        (ChangeKind::Add, _) => {
                            last.kind = ChangeKind::Add;
                            Some(last)
                        }
                        (_, ChangeKind::ReadFlag(_)) if changed => {
                            last.kind = ChangeKind::Modify;
                            Some(last)
                        }
                        _ => Some(last),
                    })
                    .collect();
                changes.sort_by_key(|c| c.stamp);
                changes
            }
        };

        Ok(ServerChanges {
            changes,
            watermark: inner.seq.to_string(),
        })
    }

    fn fetch_item(
        &self,
        folder: &str,
        id: &str,
        _settings: &CollectionSettings,
    ) -> EngineResult<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.item(folder, id))
    }

    fn add_item(&self, folder: &str, data: &[u8]) -> EngineResult<ItemStat> {
        self.check()?;
        let stat = {
            let mut inner = self.inner.write();
            inner.folder_items(folder)?;
            inner.next_id += 1;
            let id = format!("{}:{}", folder, inner.next_id);
            let stamp = inner.record(folder, &id, ChangeKind::Add);
            inner.folder_items(folder)?.insert(
                id.clone(),
                Item {
                    data: data.to_vec(),
                    stamp,
                    read: false,
                },
            );
            ItemStat { id, stamp }
        };
        self.notifier.notify_folder(folder);
        Ok(stat)
    }

    fn change_item(
        &self,
        folder: &str,
        id: &str,
        data: &[u8],
        conflict: ConflictPolicy,
        since: Option<&str>,
    ) -> EngineResult<ItemStat> {
        self.check()?;
        let since = Self::parse_watermark(since)?;
        let stat = {
            let mut inner = self.inner.write();
            let current = inner
                .folder_items(folder)?
                .get(id)
                .map(|item| item.stamp)
                .ok_or_else(|| EngineError::not_found(folder, id))?;
            if conflict.server_keeps(current, since) {
                return Ok(ItemStat {
                    id: id.to_string(),
                    stamp: current,
                });
            }
            let stamp = inner.record(folder, id, ChangeKind::Modify);
            if let Some(item) = inner.folder_items(folder)?.get_mut(id) {
                item.data = data.to_vec();
                item.stamp = stamp;
            }
            ItemStat {
                id: id.to_string(),
                stamp,
            }
        };
        self.notifier.notify_folder(folder);
        Ok(stat)
    }

    fn set_read_flag(&self, folder: &str, id: &str, read: bool) -> EngineResult<ItemStat> {
        self.check()?;
        let stat = {
            let mut inner = self.inner.write();
            if !inner.folder_items(folder)?.contains_key(id) {
                return Err(EngineError::not_found(folder, id));
            }
            let stamp = inner.record(folder, id, ChangeKind::ReadFlag(read));
            if let Some(item) = inner.folder_items(folder)?.get_mut(id) {
                item.read = read;
                item.stamp = stamp;
            }
            ItemStat {
                id: id.to_string(),
                stamp,
            }
        };
        self.notifier.notify_folder(folder);
        Ok(stat)
    }

    fn delete_item(&self, folder: &str, id: &str) -> EngineResult<()> {
        self.check()?;
        {
            let mut inner = self.inner.write();
            if inner.folder_items(folder)?.remove(id).is_none() {
                return Err(EngineError::not_found(folder, id));
            }
            inner.record(folder, id, ChangeKind::Delete);
        }
        self.notifier.notify_folder(folder);
        Ok(())
    }

    fn move_item(&self, folder: &str, id: &str, destination: &str) -> EngineResult<ItemStat> {
        self.check()?;
        let stat = {
            let mut inner = self.inner.write();
            inner.folder_items(destination)?;
            let mut item = inner
                .folder_items(folder)?
                .remove(id)
                .ok_or_else(|| EngineError::not_found(folder, id))?;
            inner.record(folder, id, ChangeKind::Delete);
            let stamp = inner.record(destination, id, ChangeKind::Add);
            item.stamp = stamp;
            inner.folder_items(destination)?.insert(id.to_string(), item);
            ItemStat {
                id: id.to_string(),
                stamp,
            }
        };
        self.notifier.notify_folder(folder);
        self.notifier.notify_folder(destination);
        Ok(stat)
    }

    fn waste_basket(&self, class: CollectionClass) -> Option<String> {
        if class != CollectionClass::Email {
            return None;
        }
        self.inner
            .read()
            .folders
            .values()
            .find(|f| f.folder_type == FolderType::WASTEBASKET)
            .map(|f| f.server_id.clone())
    }

    fn change_notifier(&self) -> Option<Arc<ChangeNotifier>> {
        Some(Arc::clone(&self.notifier))
    }
}
