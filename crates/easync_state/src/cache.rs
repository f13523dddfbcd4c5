//! The device-scoped sync cache.
//!
//! Devices may send abbreviated requests (no body, partial collection lists,
//! missing options). The sync cache keeps what the device sent before so a
//! handler can rebuild the full request. It is loaded at the start of a
//! request and saved at the end, guarded by a generation counter so that a
//! request which lost a race against a newer one does not overwrite it.

use crate::backend::{CacheWrite, StateBackend};
use crate::error::StateResult;
use crate::records::{CachedCollection, LoopCounter, SyncCacheRecord};
use easync_protocol::{clamp_window_size, Folder, SyncCollection, SyncKey, DEFAULT_WINDOW_SIZE};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of [`SyncCache::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The cache was written.
    Saved,
    /// Another request saved a newer cache; local changes were discarded.
    Superseded,
}

/// A loaded sync cache together with the generation it was loaded at.
pub struct SyncCache {
    backend: Arc<dyn StateBackend>,
    record: SyncCacheRecord,
    generation: u64,
}

impl SyncCache {
    /// Loads the cache of a device and user; an empty cache if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn load(backend: Arc<dyn StateBackend>, device_id: &str, user: &str) -> StateResult<Self> {
        let record = backend
            .load_sync_cache(device_id, user)?
            .unwrap_or_else(|| SyncCacheRecord::new(device_id, user));
        let generation = record.generation;
        debug!(
            device = device_id,
            generation,
            collections = record.collections.len(),
            "loaded sync cache"
        );
        Ok(Self {
            backend,
            record,
            generation,
        })
    }

    /// Device id.
    pub fn device_id(&self) -> &str {
        &self.record.device_id
    }

    /// User name.
    pub fn user(&self) -> &str {
        &self.record.user
    }

    /// The generation this instance loaded or last saved.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The underlying record.
    pub fn record(&self) -> &SyncCacheRecord {
        &self.record
    }

    // Collections

    /// Returns the cached collections, optionally only those holding an
    /// issued synckey.
    pub fn collections(&self, require_key: bool) -> Vec<&CachedCollection> {
        self.record
            .collections
            .values()
            .filter(|c| !require_key || c.issued_key().is_some())
            .collect()
    }

    /// Returns one cached collection.
    pub fn collection(&self, id: &str) -> Option<&CachedCollection> {
        self.record.collections.get(id)
    }

    /// Number of cached collections.
    pub fn count_collections(&self) -> usize {
        self.record.collections.len()
    }

    /// Returns true if the collection is cached.
    pub fn collection_exists(&self, id: &str) -> bool {
        self.record.collections.contains_key(id)
    }

    /// Caches a request collection, keeping its pingable flag if it was
    /// already cached.
    pub fn add_collection(&mut self, collection: &SyncCollection) {
        let pingable = self.collection_is_pingable(&collection.id);
        let mut cached = CachedCollection::from_request(collection);
        cached.pingable = pingable;
        self.record.collections.insert(collection.id.clone(), cached);
    }

    /// Stores the options of a request collection and, if given, the key
    /// just issued for it.
    pub fn update_collection(&mut self, collection: &SyncCollection, new_synckey: Option<SyncKey>) {
        let entry = self
            .record
            .collections
            .entry(collection.id.clone())
            .or_insert_with(|| CachedCollection::from_request(collection));
        if collection.class.is_some() {
            entry.class = collection.class;
        }
        entry.settings = collection.settings.clone();
        entry.synckey = Some(new_synckey.unwrap_or(collection.synckey));
    }

    /// Removes a collection and its loop counter. Returns false if it was
    /// not cached.
    pub fn remove_collection(&mut self, id: &str) -> bool {
        self.record.loop_counters.remove(id);
        self.record.collections.remove(id).is_some()
    }

    /// Removes every collection.
    pub fn clear_collections(&mut self) {
        self.record.collections.clear();
    }

    /// Forgets the synckey of every collection, keeping the options.
    pub fn clear_collection_keys(&mut self) {
        for collection in self.record.collections.values_mut() {
            collection.synckey = None;
        }
    }

    /// Completes an abbreviated request collection from the cache.
    ///
    /// The class comes from the cached collection or the folder cache and
    /// unset options from the cached options. A request presenting the
    /// initial key for a collection cached with an issued key drops the
    /// cached key.
    pub fn fill_from_cache(&mut self, collection: &mut SyncCollection) {
        let folder_class = self.record.folders.get(&collection.id).map(Folder::class);
        if let Some(cached) = self.record.collections.get_mut(&collection.id) {
            if collection.class.is_none() {
                collection.class = cached.class.or(folder_class);
            }
            collection.settings.fill_missing(&cached.settings);
            if collection.synckey.is_initial() && cached.issued_key().is_some() {
                debug!(collection = %collection.id, "initial synckey, dropping cached key");
                cached.synckey = None;
            }
        } else if collection.class.is_none() {
            collection.class = folder_class;
        }

        let window = match collection.settings.window_size {
            Some(size) => {
                let clamped = clamp_window_size(i64::from(size));
                if clamped != size {
                    debug!(collection = %collection.id, size, "window size out of range");
                }
                clamped
            }
            None => DEFAULT_WINDOW_SIZE,
        };
        collection.settings.window_size = Some(window);
    }

    // Confirmed synckeys

    /// Records a key the device has been given but not yet presented back.
    pub fn add_confirmed_key(&mut self, key: &SyncKey) {
        self.record.confirmed_synckeys.insert(key.to_string());
    }

    /// Removes a key the device presented. Returns false if it was not
    /// outstanding.
    pub fn remove_confirmed_key(&mut self, key: &SyncKey) -> bool {
        self.record.confirmed_synckeys.remove(&key.to_string())
    }

    /// Outstanding keys.
    pub fn confirmed_keys(&self) -> impl Iterator<Item = &str> {
        self.record.confirmed_synckeys.iter().map(String::as_str)
    }

    /// Returns true if some issued key was never presented back.
    pub fn has_unconfirmed_keys(&self) -> bool {
        !self.record.confirmed_synckeys.is_empty()
    }

    /// Empties the ledger.
    pub fn clear_confirmed_keys(&mut self) {
        self.record.confirmed_synckeys.clear();
    }

    // Loop counters

    /// Records a failed exchange of collection `id` on `synckey` and returns
    /// how many failed in a row on that key. A different key starts over.
    pub fn increment_loop_counter(&mut self, id: &str, synckey: &SyncKey) -> u32 {
        let counter = self
            .record
            .loop_counters
            .entry(id.to_string())
            .or_insert(LoopCounter {
                synckey: *synckey,
                count: 0,
            });
        if counter.synckey != *synckey {
            *counter = LoopCounter {
                synckey: *synckey,
                count: 0,
            };
        }
        counter.count += 1;
        counter.count
    }

    /// Failed exchanges of collection `id` in a row on `synckey`.
    pub fn loop_count(&self, id: &str, synckey: &SyncKey) -> u32 {
        self.record
            .loop_counters
            .get(id)
            .filter(|counter| counter.synckey == *synckey)
            .map_or(0, |counter| counter.count)
    }

    /// Forgets the loop counter of a collection.
    pub fn clear_loop_counter(&mut self, id: &str) {
        self.record.loop_counters.remove(id);
    }

    // Pingable flags

    /// Marks a cached collection as monitored by PING. Returns false if the
    /// collection is not cached.
    pub fn set_pingable(&mut self, id: &str, pingable: bool) -> bool {
        match self.record.collections.get_mut(id) {
            Some(collection) => {
                collection.pingable = pingable;
                true
            }
            None => false,
        }
    }

    /// Returns true if PING monitors the collection.
    pub fn collection_is_pingable(&self, id: &str) -> bool {
        self.record.collections.get(id).is_some_and(|c| c.pingable)
    }

    /// Returns true if PING monitors at least one collection.
    pub fn have_pingable_collections(&self) -> bool {
        self.record.collections.values().any(|c| c.pingable)
    }

    /// Ids of the collections PING monitors.
    pub fn pingable_collections(&self) -> Vec<String> {
        self.record
            .collections
            .values()
            .filter(|c| c.pingable)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Clears every pingable flag.
    pub fn clear_pingable(&mut self) {
        for collection in self.record.collections.values_mut() {
            collection.pingable = false;
        }
    }

    /// Makes exactly `ids` pingable. Ids that are not cached are ignored.
    pub fn update_pingable_flags(&mut self, ids: &[String]) {
        self.clear_pingable();
        for id in ids {
            self.set_pingable(id, true);
        }
    }

    // Folder cache

    /// Cached folders by server id.
    pub fn folders(&self) -> &BTreeMap<String, Folder> {
        &self.record.folders
    }

    /// One cached folder.
    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.record.folders.get(id)
    }

    /// Adds or replaces a cached folder.
    pub fn update_folder(&mut self, folder: Folder) {
        self.record.folders.insert(folder.server_id.clone(), folder);
    }

    /// Removes a folder and the collection synchronizing it.
    pub fn delete_folder(&mut self, id: &str) {
        self.record.folders.remove(id);
        self.record.collections.remove(id);
    }

    /// Removes every cached folder.
    pub fn clear_folders(&mut self) {
        self.record.folders.clear();
    }

    /// Returns true if `folder` is cached with the same parent, name and
    /// type.
    pub fn folder_matches(&self, folder: &Folder) -> bool {
        self.record.folders.get(&folder.server_id) == Some(folder)
    }

    // Heartbeat fields

    /// Latest hierarchy synckey.
    pub fn hierarchy(&self) -> Option<SyncKey> {
        self.record.hierarchy
    }

    /// Sets the hierarchy synckey.
    pub fn set_hierarchy(&mut self, key: Option<SyncKey>) {
        self.record.hierarchy = key;
    }

    /// SYNC `Wait`, in minutes.
    pub fn wait(&self) -> Option<u32> {
        self.record.wait
    }

    /// Sets the SYNC `Wait`.
    pub fn set_wait(&mut self, minutes: Option<u32>) {
        self.record.wait = minutes;
    }

    /// SYNC `HeartbeatInterval`, in seconds.
    pub fn hbinterval(&self) -> Option<u32> {
        self.record.hbinterval
    }

    /// Sets the SYNC `HeartbeatInterval`.
    pub fn set_hbinterval(&mut self, seconds: Option<u32>) {
        self.record.hbinterval = seconds;
    }

    /// Last PING heartbeat, in seconds.
    pub fn ping_heartbeat(&self) -> Option<u32> {
        self.record.ping_heartbeat
    }

    /// Sets the PING heartbeat.
    pub fn set_ping_heartbeat(&mut self, seconds: Option<u32>) {
        self.record.ping_heartbeat = seconds;
    }

    /// Deadline of the last looping request.
    pub fn last_until(&self) -> Option<u64> {
        self.record.last_until
    }

    /// Sets the looping deadline.
    pub fn set_last_until(&mut self, until: Option<u64>) {
        self.record.last_until = until;
    }

    /// Start of the last looping SYNC.
    pub fn last_hb_sync_started(&self) -> Option<u64> {
        self.record.last_hb_sync_started
    }

    /// Records the start of a looping SYNC.
    pub fn set_last_hb_sync_started(&mut self, at: Option<u64>) {
        self.record.last_hb_sync_started = at;
    }

    /// Normal end of the last looping SYNC.
    pub fn last_sync_end_normal(&self) -> Option<u64> {
        self.record.last_sync_end_normal
    }

    /// Records the normal end of a looping SYNC.
    pub fn set_last_sync_end_normal(&mut self, at: Option<u64>) {
        self.record.last_sync_end_normal = at;
    }

    // Consistency

    /// Returns false if another request saved the cache after this instance
    /// loaded or saved it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn validate_cache(&self) -> StateResult<bool> {
        let persisted = self
            .backend
            .cache_generation(&self.record.device_id, &self.record.user)?;
        if persisted != self.generation {
            debug!(
                device = %self.record.device_id,
                loaded = self.generation,
                persisted,
                "sync cache changed underneath"
            );
        }
        Ok(persisted == self.generation)
    }

    /// Returns false if a looping SYNC started without ending normally, or
    /// if the deadline of a previous looping request is still ahead.
    pub fn validate_timestamps(&self, now: u64) -> bool {
        let unfinished = match (self.record.last_hb_sync_started, self.record.last_sync_end_normal) {
            (Some(started), Some(ended)) => started > ended,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let running = self.record.last_until.is_some_and(|until| now < until);
        !(unfinished || running)
    }

    /// Replaces the cached collections with the ones on file.
    ///
    /// The generation is left untouched, so a later [`save`](Self::save)
    /// still detects the concurrent writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn refresh_collections(&mut self) -> StateResult<()> {
        if let Some(persisted) = self
            .backend
            .load_sync_cache(&self.record.device_id, &self.record.user)?
        {
            self.record.collections = persisted.collections;
        }
        Ok(())
    }

    /// Persists the cache unless another request saved it first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn save(&mut self, now: u64) -> StateResult<SaveOutcome> {
        self.record.timestamp = now;
        match self.backend.save_sync_cache(&self.record, self.generation)? {
            CacheWrite::Saved(generation) => {
                self.generation = generation;
                self.record.generation = generation;
                debug!(device = %self.record.device_id, generation, "saved sync cache");
                Ok(SaveOutcome::Saved)
            }
            CacheWrite::Superseded(current) => {
                warn!(
                    device = %self.record.device_id,
                    ours = self.generation,
                    current,
                    "sync cache superseded, discarding local changes"
                );
                Ok(SaveOutcome::Superseded)
            }
        }
    }

    /// Deletes the persisted cache and empties this instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn delete(&mut self) -> StateResult<()> {
        self.backend
            .delete_sync_cache(&self.record.device_id, &self.record.user)?;
        self.record = SyncCacheRecord::new(self.record.device_id.clone(), self.record.user.clone());
        self.generation = 0;
        Ok(())
    }
}

impl std::fmt::Debug for SyncCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCache")
            .field("device_id", &self.record.device_id)
            .field("user", &self.record.user)
            .field("generation", &self.generation)
            .field("collections", &self.record.collections.len())
            .finish()
    }
}
