//! State backend trait definition.

use crate::error::{StateError, StateResult};
use crate::records::{DeviceRecord, StateFilter, StateScope, SyncCacheRecord, SyncStateRecord};
use easync_protocol::SyncKey;

/// Outcome of a sync cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    /// The record was written with the given generation.
    Saved(u64),
    /// Another writer got there first; the persisted generation is returned
    /// and nothing was written.
    Superseded(u64),
}

/// Persistence for synchronization state, sync caches and devices.
///
/// Backends store records; they do not interpret synckeys beyond the
/// compare-and-swap checks below.
///
/// # Invariants
///
/// - At most one sync state row exists per (device, user, scope)
/// - `save_sync_state` is atomic with respect to other writers of the same
///   scope: a writer advancing from a key that is no longer the latest fails
/// - `save_sync_cache` only writes if the persisted generation equals the
///   expected one, and bumps it by one
/// - Backends must be `Send + Sync`; one instance serves every request
///
/// # Implementors
///
/// - [`super::MemoryBackend`] - For testing and embedding
/// - [`super::FileBackend`] - For persistent storage
pub trait StateBackend: Send + Sync {
    /// Returns the state row of a scope, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be read.
    fn latest_sync_state(
        &self,
        device_id: &str,
        user: &str,
        scope: &StateScope,
    ) -> StateResult<Option<SyncStateRecord>>;

    /// Stores `record`, replacing the row of its scope.
    ///
    /// `previous` is the key the record advances from. The write succeeds
    /// only if the row on file carries that key, or if `previous` is the
    /// initial key and no row exists.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentWrite` if another writer advanced the scope first.
    fn save_sync_state(&self, record: &SyncStateRecord, previous: &SyncKey) -> StateResult<()>;

    /// Removes every row matching `filter` and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be rewritten.
    fn remove_sync_states(&self, filter: &StateFilter) -> StateResult<usize>;

    /// Lists every row of a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be read.
    fn list_sync_states(&self, device_id: &str) -> StateResult<Vec<SyncStateRecord>>;

    /// Loads the sync cache of a device and user.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    fn load_sync_cache(&self, device_id: &str, user: &str) -> StateResult<Option<SyncCacheRecord>>;

    /// Writes the sync cache if the persisted generation is `expected`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be written.
    fn save_sync_cache(
        &self,
        record: &SyncCacheRecord,
        expected_generation: u64,
    ) -> StateResult<CacheWrite>;

    /// Returns the persisted cache generation, 0 if there is no cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    fn cache_generation(&self, device_id: &str, user: &str) -> StateResult<u64> {
        Ok(self
            .load_sync_cache(device_id, user)?
            .map_or(0, |record| record.generation))
    }

    /// Deletes the sync cache of a device and user.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be removed.
    fn delete_sync_cache(&self, device_id: &str, user: &str) -> StateResult<()>;

    /// Loads a device record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    fn load_device(&self, device_id: &str, user: &str) -> StateResult<Option<DeviceRecord>>;

    /// Stores a device record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn save_device(&self, record: &DeviceRecord) -> StateResult<()>;

    /// Reads, changes and stores a device record as one step.
    ///
    /// `update` receives the record on file, if any, and returns the record
    /// to store; `None` leaves the backend unchanged. No other write to the
    /// device can interleave. Returns what `update` returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or written.
    fn update_device(
        &self,
        device_id: &str,
        user: &str,
        update: &mut dyn FnMut(Option<DeviceRecord>) -> Option<DeviceRecord>,
    ) -> StateResult<Option<DeviceRecord>>;

    /// Lists every device record.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    fn list_devices(&self) -> StateResult<Vec<DeviceRecord>>;

    /// Removes a device record together with its state rows and cache.
    /// Returns false if the device was unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be removed.
    fn remove_device(&self, device_id: &str, user: &str) -> StateResult<bool>;
}

/// Checks the compare-and-swap precondition shared by every backend.
pub(crate) fn check_previous(
    current: Option<&SyncStateRecord>,
    record: &SyncStateRecord,
    previous: &SyncKey,
) -> StateResult<()> {
    let ok = match current {
        Some(on_file) => on_file.synckey == *previous,
        None => previous.is_initial(),
    };
    if ok {
        Ok(())
    } else {
        Err(StateError::ConcurrentWrite {
            scope: record.scope.to_string(),
            expected: previous.to_string(),
            found: current.map_or_else(|| "none".to_string(), |r| r.synckey.to_string()),
        })
    }
}
