//! Computes and emits server changes.

use crate::driver::Driver;
use crate::error::EngineResult;
use crate::exporter::ExportSink;
use easync_protocol::{
    diff_folders, ChangeKind, CollectionSettings, Folder, FolderChange, ItemChange,
};
use easync_state::SyncStateRecord;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Server changes of one collection for one exchange.
///
/// Changes live in the state's pending list: whatever a window-size bounded
/// export leaves behind is persisted with the next key and picked up again by
/// the next exchange before the driver is asked for anything new.
pub struct Synchronizer<'a> {
    driver: &'a dyn Driver,
    state: &'a mut SyncStateRecord,
    folder: String,
    settings: CollectionSettings,
}

impl<'a> Synchronizer<'a> {
    /// Prepares the pending changes of a collection.
    ///
    /// With `looping` set the call only counts changes for a long-poll
    /// iteration and leaves the device's own changes on record.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver fails.
    pub fn init(
        state: &'a mut SyncStateRecord,
        driver: &'a dyn Driver,
        settings: &CollectionSettings,
        looping: bool,
    ) -> EngineResult<Self> {
        let folder = state
            .scope
            .collection_id()
            .unwrap_or_default()
            .to_string();

        let queried = state.pending.is_empty();
        if queried {
            let server = driver.server_changes(
                &folder,
                state.watermark.as_deref(),
                settings.filter_type,
            )?;
            state.pending = server.changes;
            state.watermark = Some(server.watermark);
        }

        let before = state.pending.len();
        let device_changes = &state.device_changes;
        state.pending.retain(|change| !is_echo(change, device_changes));
        // Stamps stay on record until a query past them has been filtered.
        if !looping && queried {
            state.device_changes.clear();
        }
        debug!(
            collection = %folder,
            pending = state.pending.len(),
            echoes = before - state.pending.len(),
            looping,
            "synchronizer initialized"
        );

        Ok(Self {
            driver,
            state,
            folder,
            settings: settings.clone(),
        })
    }

    /// Number of changes left to send.
    pub fn change_count(&self) -> usize {
        self.state.pending.len()
    }

    /// Emits the next change. Returns `None` once nothing is left.
    ///
    /// Items that vanished since the change was recorded are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver or the sink fails; the change stays
    /// pending.
    pub fn synchronize(&mut self, sink: &mut dyn ExportSink) -> EngineResult<Option<ItemChange>> {
        while let Some(change) = self.state.pending.first().cloned() {
            match change.kind {
                ChangeKind::Add | ChangeKind::Modify => {
                    match self
                        .driver
                        .fetch_item(&self.folder, &change.id, &self.settings)?
                    {
                        Some(data) => {
                            sink.item_change(&change.id, &data, change.kind == ChangeKind::Add)?
                        }
                        None => {
                            debug!(collection = %self.folder, id = %change.id, "item vanished");
                            self.state.pending.remove(0);
                            continue;
                        }
                    }
                }
                ChangeKind::Delete => sink.item_deletion(&change.id)?,
                ChangeKind::ReadFlag(read) => sink.item_read_flag(&change.id, read)?,
            }
            self.state.pending.remove(0);
            return Ok(Some(change));
        }
        Ok(None)
    }
}

fn is_echo(change: &ItemChange, device_changes: &BTreeMap<String, u64>) -> bool {
    device_changes
        .get(&change.id)
        .is_some_and(|stamp| change.stamp <= *stamp)
}

/// Folder hierarchy changes for one exchange.
pub struct HierarchySynchronizer {
    current: Vec<Folder>,
    changes: VecDeque<FolderChange>,
}

impl HierarchySynchronizer {
    /// Diffs the folders the device knows against the driver's folder list.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver fails.
    pub fn init(driver: &dyn Driver, known: &[Folder]) -> EngineResult<Self> {
        let mut current = driver.folder_list()?;
        current.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        let changes: VecDeque<FolderChange> = diff_folders(known, &current).into();
        debug!(
            known = known.len(),
            current = current.len(),
            changes = changes.len(),
            "hierarchy synchronizer initialized"
        );
        Ok(Self { current, changes })
    }

    /// The driver's folders, sorted by id.
    pub fn current_folders(&self) -> &[Folder] {
        &self.current
    }

    /// Number of changes left to send.
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Drops changes that fail `keep`.
    pub fn retain(&mut self, keep: impl FnMut(&FolderChange) -> bool) {
        self.changes.retain(keep);
    }

    /// Emits the next change. Returns `None` once nothing is left.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink fails.
    pub fn synchronize(&mut self, sink: &mut dyn ExportSink) -> EngineResult<Option<FolderChange>> {
        let Some(change) = self.changes.pop_front() else {
            return Ok(None);
        };
        match &change {
            FolderChange::Add(folder) => sink.folder_change(folder, true)?,
            FolderChange::Update(folder) => sink.folder_change(folder, false)?,
            FolderChange::Remove(id) => sink.folder_deletion(id)?,
        }
        Ok(Some(change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{ChangeSet, ExportedChange};
    use crate::memory::MemoryDriver;
    use easync_protocol::FolderType;
    use easync_state::StateScope;

    fn setup() -> (MemoryDriver, SyncStateRecord) {
        let driver = MemoryDriver::new();
        driver.add_folder(Folder::new("INBOX", "Inbox", FolderType::INBOX));
        let state = SyncStateRecord::new("dev1", "alice", StateScope::collection("INBOX"));
        (driver, state)
    }

    #[test]
    fn window_bounded_export_leaves_pending() {
        let (driver, mut state) = setup();
        for i in 0..5 {
            driver.put_item("INBOX", &i.to_string(), b"x").unwrap();
        }
        let settings = CollectionSettings::default();
        let mut sync = Synchronizer::init(&mut state, &driver, &settings, false).unwrap();
        assert_eq!(sync.change_count(), 5);

        let mut set = ChangeSet::new();
        for _ in 0..2 {
            sync.synchronize(&mut set).unwrap();
        }
        assert_eq!(sync.change_count(), 3);
        assert_eq!(set.count(), 2);
        assert_eq!(state.pending.len(), 3);

        // New server changes wait until the backlog is sent.
        driver.put_item("INBOX", "late", b"y").unwrap();
        let sync = Synchronizer::init(&mut state, &driver, &settings, false).unwrap();
        assert_eq!(sync.change_count(), 3);
    }

    #[test]
    fn device_changes_are_not_echoed() {
        let (driver, mut state) = setup();
        let settings = CollectionSettings::default();
        Synchronizer::init(&mut state, &driver, &settings, false).unwrap();

        let id = crate::importer::Importer::new(
            &driver,
            &mut state,
            "INBOX",
            easync_protocol::ConflictPolicy::ServerWins,
        )
        .import_add(b"from device")
        .unwrap();
        driver.put_item("INBOX", "server", b"from server").unwrap();

        let sync = Synchronizer::init(&mut state, &driver, &settings, true).unwrap();
        assert_eq!(sync.change_count(), 1);
        assert!(state.device_changes.contains_key(&id));

        let mut sync = Synchronizer::init(&mut state, &driver, &settings, false).unwrap();
        assert_eq!(sync.change_count(), 1);
        assert!(state.device_changes.contains_key(&id));

        let mut set = ChangeSet::new();
        while sync.synchronize(&mut set).unwrap().is_some() {}
        let sync = Synchronizer::init(&mut state, &driver, &settings, false).unwrap();
        assert_eq!(sync.change_count(), 0);
        assert!(state.device_changes.is_empty());
    }

    #[test]
    fn device_add_during_backlog_is_not_echoed() {
        let (driver, mut state) = setup();
        for id in ["a", "b", "c"] {
            driver.put_item("INBOX", id, b"x").unwrap();
        }
        let settings = CollectionSettings::default();
        let mut exported = Vec::new();

        let mut sync = Synchronizer::init(&mut state, &driver, &settings, false).unwrap();
        let mut set = ChangeSet::new();
        exported.push(sync.synchronize(&mut set).unwrap().unwrap().id);

        let id = crate::importer::Importer::new(
            &driver,
            &mut state,
            "INBOX",
            easync_protocol::ConflictPolicy::ServerWins,
        )
        .import_add(b"from device")
        .unwrap();

        for _ in 0..4 {
            let mut sync = Synchronizer::init(&mut state, &driver, &settings, false).unwrap();
            let mut set = ChangeSet::new();
            if let Some(change) = sync.synchronize(&mut set).unwrap() {
                exported.push(change.id);
            }
        }
        assert_eq!(exported, vec!["a", "b", "c"]);
        assert!(!exported.contains(&id));
        assert!(state.device_changes.is_empty());
    }

    #[test]
    fn vanished_items_are_skipped() {
        let (driver, mut state) = setup();
        driver.put_item("INBOX", "a", b"x").unwrap();
        driver.put_item("INBOX", "b", b"y").unwrap();
        let settings = CollectionSettings::default();
        let mut sync = Synchronizer::init(&mut state, &driver, &settings, false).unwrap();
        driver.remove_item("INBOX", "a").unwrap();

        let mut set = ChangeSet::new();
        let emitted = sync.synchronize(&mut set).unwrap().unwrap();
        assert_eq!(emitted.id, "b");
        assert!(sync.synchronize(&mut set).unwrap().is_none());
    }

    #[test]
    fn hierarchy_diff() {
        let driver = MemoryDriver::new();
        driver.add_folder(Folder::new("INBOX", "Inbox", FolderType::INBOX));
        driver.add_folder(Folder::new("b", "Renamed", FolderType::USER_MAIL));
        let known = vec![
            Folder::new("a", "Gone", FolderType::USER_MAIL),
            Folder::new("b", "Old", FolderType::USER_MAIL),
        ];

        let mut sync = HierarchySynchronizer::init(&driver, &known).unwrap();
        assert_eq!(sync.change_count(), 3);
        sync.retain(|c| !matches!(c, FolderChange::Remove(_)));

        let mut set = ChangeSet::new();
        while sync.synchronize(&mut set).unwrap().is_some() {}
        assert_eq!(set.count(), 2);
        assert!(set.changes().iter().any(|c| matches!(
            c,
            ExportedChange::Folder { folder, is_new: false } if folder.display_name == "Renamed"
        )));
        assert_eq!(sync.current_folders().len(), 2);
    }
}
