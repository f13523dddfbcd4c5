//! The synckey contract on top of a [`StateBackend`].

use crate::backend::StateBackend;
use crate::error::{StateError, StateResult};
use crate::records::{DeviceRecord, RemoteWipeStatus, StateFilter, StateScope, SyncStateRecord};
use easync_protocol::{Folder, SyncKey};
use std::sync::Arc;
use tracing::debug;

/// Loads, advances and removes synchronization state.
///
/// A synckey is valid only if it equals the key most recently issued for the
/// exact (device, user, scope). Presenting the initial key resets the scope.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
}

impl StateStore {
    /// Creates a store over a backend.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Loads the state a device refers to with `synckey`.
    ///
    /// The initial key removes whatever was on file for the scope and returns
    /// a fresh state.
    ///
    /// # Errors
    ///
    /// - `StateGone` if nothing is on file for a non-initial key
    /// - `KeyMismatch` if the key is not the latest one issued
    pub fn load_state(
        &self,
        device_id: &str,
        user: &str,
        scope: &StateScope,
        synckey: &SyncKey,
    ) -> StateResult<SyncStateRecord> {
        if synckey.is_initial() {
            let removed = self.backend.remove_sync_states(
                &StateFilter::device(device_id)
                    .with_user(user)
                    .with_scope(scope.clone()),
            )?;
            debug!(device = device_id, %scope, removed, "resetting state for initial synckey");
            return Ok(SyncStateRecord::new(device_id, user, scope.clone()));
        }

        match self.backend.latest_sync_state(device_id, user, scope)? {
            None => Err(StateError::StateGone {
                scope: scope.to_string(),
                synckey: synckey.to_string(),
            }),
            Some(record) if record.synckey == *synckey => Ok(record),
            Some(record) => Err(StateError::KeyMismatch {
                scope: scope.to_string(),
                expected: record.synckey.to_string(),
                actual: synckey.to_string(),
            }),
        }
    }

    /// Returns the key that replaces `old`. Never reuses a key.
    pub fn new_sync_key(old: &SyncKey) -> SyncKey {
        old.next()
    }

    /// Persists `record`, which carries a newly issued key advancing from
    /// `previous`, and stamps it with `now`.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentWrite` if another request advanced the scope first.
    pub fn save(
        &self,
        record: &mut SyncStateRecord,
        previous: &SyncKey,
        now: u64,
    ) -> StateResult<()> {
        record.last_sync = now;
        self.backend.save_sync_state(record, previous)?;
        debug!(
            device = %record.device_id,
            scope = %record.scope,
            synckey = %record.synckey,
            pending = record.pending.len(),
            "saved state"
        );
        Ok(())
    }

    /// Removes every state row matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn remove_state(&self, filter: &StateFilter) -> StateResult<usize> {
        self.backend.remove_sync_states(filter)
    }

    /// Returns the folders the device was last told about.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn known_folders(&self, device_id: &str, user: &str) -> StateResult<Vec<Folder>> {
        Ok(self
            .backend
            .latest_sync_state(device_id, user, &StateScope::Hierarchy)?
            .map(|record| record.folders)
            .unwrap_or_default())
    }

    /// Loads a device record.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn load_device(&self, device_id: &str, user: &str) -> StateResult<Option<DeviceRecord>> {
        self.backend.load_device(device_id, user)
    }

    /// Stores a device record.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn save_device(&self, record: &DeviceRecord) -> StateResult<()> {
        self.backend.save_device(record)
    }

    /// Reads, changes and stores a device record without interleaving with
    /// other device writes. See [`StateBackend::update_device`].
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn update_device(
        &self,
        device_id: &str,
        user: &str,
        mut update: impl FnMut(Option<DeviceRecord>) -> Option<DeviceRecord>,
    ) -> StateResult<Option<DeviceRecord>> {
        self.backend.update_device(device_id, user, &mut update)
    }

    /// Returns the remote wipe status of a device.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` for unknown devices.
    pub fn device_rw_status(&self, device_id: &str, user: &str) -> StateResult<RemoteWipeStatus> {
        self.backend
            .load_device(device_id, user)?
            .map(|device| device.rw_status)
            .ok_or_else(|| StateError::DeviceNotFound(device_id.to_string()))
    }

    /// Sets the remote wipe status of a device.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` for unknown devices.
    pub fn set_device_rw_status(
        &self,
        device_id: &str,
        user: &str,
        status: RemoteWipeStatus,
    ) -> StateResult<()> {
        self.update_device(device_id, user, |device| {
            device.map(|mut device| {
                device.rw_status = status;
                device
            })
        })?
        .map(|_| ())
        .ok_or_else(|| StateError::DeviceNotFound(device_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use easync_protocol::FolderType;

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryBackend::new()))
    }

    fn inbox() -> StateScope {
        StateScope::collection("INBOX")
    }

    #[test]
    fn initial_key_returns_fresh_state() {
        let store = store();
        let state = store
            .load_state("dev1", "alice", &inbox(), &SyncKey::Initial)
            .unwrap();
        assert!(state.synckey.is_initial());
        assert!(state.watermark.is_none());
    }

    #[test]
    fn issued_key_round_trip() {
        let store = store();
        let mut state = store
            .load_state("dev1", "alice", &inbox(), &SyncKey::Initial)
            .unwrap();
        let key = StateStore::new_sync_key(&state.synckey);
        state.synckey = key;
        state.watermark = Some("7".into());
        store.save(&mut state, &SyncKey::Initial, 100).unwrap();

        let loaded = store.load_state("dev1", "alice", &inbox(), &key).unwrap();
        assert_eq!(loaded.watermark.as_deref(), Some("7"));
        assert_eq!(loaded.last_sync, 100);
    }

    #[test]
    fn replayed_key_is_a_mismatch() {
        let store = store();
        let mut state = SyncStateRecord::new("dev1", "alice", inbox());
        let k1 = SyncKey::Initial.next();
        state.synckey = k1;
        store.save(&mut state, &SyncKey::Initial, 1).unwrap();
        let k2 = k1.next();
        state.synckey = k2;
        store.save(&mut state, &k1, 2).unwrap();

        let err = store.load_state("dev1", "alice", &inbox(), &k1).unwrap_err();
        assert!(matches!(err, StateError::KeyMismatch { .. }));
        assert!(err.requires_resync());

        let foreign = SyncKey::Initial.next();
        assert!(matches!(
            store.load_state("dev1", "alice", &inbox(), &foreign),
            Err(StateError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn unknown_scope_is_gone() {
        let store = store();
        let err = store
            .load_state("dev1", "alice", &inbox(), &SyncKey::Initial.next())
            .unwrap_err();
        assert!(matches!(err, StateError::StateGone { .. }));
    }

    #[test]
    fn initial_key_discards_previous_series() {
        let store = store();
        let mut state = SyncStateRecord::new("dev1", "alice", inbox());
        let k1 = SyncKey::Initial.next();
        state.synckey = k1;
        store.save(&mut state, &SyncKey::Initial, 1).unwrap();

        store
            .load_state("dev1", "alice", &inbox(), &SyncKey::Initial)
            .unwrap();
        assert!(matches!(
            store.load_state("dev1", "alice", &inbox(), &k1),
            Err(StateError::StateGone { .. })
        ));
    }

    #[test]
    fn known_folders_come_from_hierarchy_state() {
        let store = store();
        assert!(store.known_folders("dev1", "alice").unwrap().is_empty());

        let mut state = SyncStateRecord::new("dev1", "alice", StateScope::Hierarchy);
        state.synckey = SyncKey::Initial.next();
        state.set_folder_data(vec![Folder::new("INBOX", "Inbox", FolderType::INBOX)]);
        store.save(&mut state, &SyncKey::Initial, 1).unwrap();

        assert_eq!(store.known_folders("dev1", "alice").unwrap().len(), 1);
    }

    #[test]
    fn remote_wipe_status() {
        let store = store();
        assert!(matches!(
            store.device_rw_status("dev1", "alice"),
            Err(StateError::DeviceNotFound(_))
        ));
        store.save_device(&DeviceRecord::new("dev1", "alice", 0)).unwrap();
        store
            .set_device_rw_status("dev1", "alice", RemoteWipeStatus::Pending)
            .unwrap();
        assert!(store.device_rw_status("dev1", "alice").unwrap().blocks_sync());
    }
}
