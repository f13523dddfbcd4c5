//! In-memory state backend.

use crate::backend::{check_previous, CacheWrite, StateBackend};
use crate::error::StateResult;
use crate::records::{DeviceRecord, StateFilter, StateScope, SyncCacheRecord, SyncStateRecord};
use easync_protocol::SyncKey;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type StateKey = (String, String, StateScope);
type DeviceKey = (String, String);

/// An in-memory state backend.
///
/// Suitable for unit and integration tests and for servers that do not need
/// state to survive a restart.
///
/// # Thread Safety
///
/// Every operation takes the relevant lock for its whole duration, so the
/// compare-and-swap checks are atomic.
///
/// # Example
///
/// ```rust
/// use easync_state::{MemoryBackend, StateBackend, StateScope, SyncStateRecord};
/// use easync_protocol::SyncKey;
///
/// let backend = MemoryBackend::new();
/// let mut record = SyncStateRecord::new("dev", "alice", StateScope::collection("INBOX"));
/// record.synckey = SyncKey::Initial.next();
/// backend.save_sync_state(&record, &SyncKey::Initial).unwrap();
/// assert!(backend.save_sync_state(&record, &SyncKey::Initial).is_err());
/// ```
#[derive(Debug, Default)]
pub struct MemoryBackend {
    states: RwLock<BTreeMap<StateKey, SyncStateRecord>>,
    caches: RwLock<BTreeMap<DeviceKey, SyncCacheRecord>>,
    devices: RwLock<BTreeMap<DeviceKey, DeviceRecord>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of state rows.
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.read().len()
    }
}

fn state_key(device_id: &str, user: &str, scope: &StateScope) -> StateKey {
    (device_id.to_string(), user.to_string(), scope.clone())
}

fn device_key(device_id: &str, user: &str) -> DeviceKey {
    (device_id.to_string(), user.to_string())
}

impl StateBackend for MemoryBackend {
    fn latest_sync_state(
        &self,
        device_id: &str,
        user: &str,
        scope: &StateScope,
    ) -> StateResult<Option<SyncStateRecord>> {
        Ok(self
            .states
            .read()
            .get(&state_key(device_id, user, scope))
            .cloned())
    }

    fn save_sync_state(&self, record: &SyncStateRecord, previous: &SyncKey) -> StateResult<()> {
        let mut states = self.states.write();
        let key = state_key(&record.device_id, &record.user, &record.scope);
        check_previous(states.get(&key), record, previous)?;
        states.insert(key, record.clone());
        Ok(())
    }

    fn remove_sync_states(&self, filter: &StateFilter) -> StateResult<usize> {
        let mut states = self.states.write();
        let before = states.len();
        states.retain(|_, record| !filter.matches(record));
        Ok(before - states.len())
    }

    fn list_sync_states(&self, device_id: &str) -> StateResult<Vec<SyncStateRecord>> {
        Ok(self
            .states
            .read()
            .values()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect())
    }

    fn load_sync_cache(&self, device_id: &str, user: &str) -> StateResult<Option<SyncCacheRecord>> {
        Ok(self.caches.read().get(&device_key(device_id, user)).cloned())
    }

    fn save_sync_cache(
        &self,
        record: &SyncCacheRecord,
        expected_generation: u64,
    ) -> StateResult<CacheWrite> {
        let mut caches = self.caches.write();
        let key = device_key(&record.device_id, &record.user);
        let current = caches.get(&key).map_or(0, |r| r.generation);
        if current != expected_generation {
            return Ok(CacheWrite::Superseded(current));
        }
        let mut stored = record.clone();
        stored.generation = expected_generation + 1;
        caches.insert(key, stored);
        Ok(CacheWrite::Saved(expected_generation + 1))
    }

    fn delete_sync_cache(&self, device_id: &str, user: &str) -> StateResult<()> {
        self.caches.write().remove(&device_key(device_id, user));
        Ok(())
    }

    fn load_device(&self, device_id: &str, user: &str) -> StateResult<Option<DeviceRecord>> {
        Ok(self.devices.read().get(&device_key(device_id, user)).cloned())
    }

    fn save_device(&self, record: &DeviceRecord) -> StateResult<()> {
        self.devices
            .write()
            .insert(device_key(&record.id, &record.user), record.clone());
        Ok(())
    }

    fn update_device(
        &self,
        device_id: &str,
        user: &str,
        update: &mut dyn FnMut(Option<DeviceRecord>) -> Option<DeviceRecord>,
    ) -> StateResult<Option<DeviceRecord>> {
        let mut devices = self.devices.write();
        let key = device_key(device_id, user);
        let updated = update(devices.get(&key).cloned());
        if let Some(record) = &updated {
            devices.insert(key, record.clone());
        }
        Ok(updated)
    }

    fn list_devices(&self) -> StateResult<Vec<DeviceRecord>> {
        Ok(self.devices.read().values().cloned().collect())
    }

    fn remove_device(&self, device_id: &str, user: &str) -> StateResult<bool> {
        let existed = self
            .devices
            .write()
            .remove(&device_key(device_id, user))
            .is_some();
        self.remove_sync_states(&StateFilter::device(device_id).with_user(user))?;
        self.delete_sync_cache(device_id, user)?;
        Ok(existed)
    }
}
