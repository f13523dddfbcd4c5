//! State loading that knows about the backend.

use crate::driver::Driver;
use crate::error::EngineResult;
use easync_protocol::{Folder, SyncKey};
use easync_state::{
    RemoteWipeStatus, StateError, StateFilter, StateScope, StateStore, SyncStateRecord,
};
use std::sync::Arc;
use tracing::debug;

/// Combines the [`StateStore`] with the driver.
///
/// Loading a collection state first checks that the backend still has the
/// folder, so a device syncing a deleted folder is told to re-run
/// FOLDERSYNC rather than to resynchronize the collection.
#[derive(Clone)]
pub struct StateManager {
    store: StateStore,
    driver: Arc<dyn Driver>,
}

impl StateManager {
    /// Creates a state manager.
    pub fn new(store: StateStore, driver: Arc<dyn Driver>) -> Self {
        Self { store, driver }
    }

    /// The state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The driver.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Loads the state a device refers to with `synckey`.
    ///
    /// # Errors
    ///
    /// Returns `FolderGone` if the collection no longer exists in the
    /// backend, otherwise whatever [`StateStore::load_state`] returns.
    pub fn load_state(
        &self,
        device_id: &str,
        user: &str,
        scope: &StateScope,
        synckey: &SyncKey,
    ) -> EngineResult<SyncStateRecord> {
        if let Some(id) = scope.collection_id() {
            if self.driver.stat_folder(id)?.is_none() {
                debug!(device = device_id, collection = id, "folder gone");
                return Err(StateError::FolderGone(id.to_string()).into());
            }
        }
        Ok(self.store.load_state(device_id, user, scope, synckey)?)
    }

    /// Persists a state advancing from `previous`.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentWrite` if another request advanced it first.
    pub fn save(
        &self,
        record: &mut SyncStateRecord,
        previous: &SyncKey,
        now: u64,
    ) -> EngineResult<()> {
        Ok(self.store.save(record, previous, now)?)
    }

    /// Removes the state of one scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn reset(&self, device_id: &str, user: &str, scope: StateScope) -> EngineResult<usize> {
        Ok(self
            .store
            .remove_state(&StateFilter::device(device_id).with_user(user).with_scope(scope))?)
    }

    /// Folders the device was last told about.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn known_folders(&self, device_id: &str, user: &str) -> EngineResult<Vec<Folder>> {
        Ok(self.store.known_folders(device_id, user)?)
    }

    /// Remote wipe status; unknown devices count as not wiped.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn rw_status(&self, device_id: &str, user: &str) -> EngineResult<RemoteWipeStatus> {
        match self.store.device_rw_status(device_id, user) {
            Ok(status) => Ok(status),
            Err(StateError::DeviceNotFound(_)) => Ok(RemoteWipeStatus::Ok),
            Err(e) => Err(e.into()),
        }
    }
}
