//! The collections of one request and the long-poll loop.

use crate::clock::Clock;
use crate::error::EngineResult;
use crate::state::StateManager;
use crate::synchronizer::Synchronizer;
use easync_protocol::{SyncCollection, SyncKey};
use easync_state::{SaveOutcome, StateScope, SyncCache};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Which request is polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// A looping SYNC: every request collection is polled and the loop's
    /// start and deadline are recorded in the cache.
    Sync,
    /// A PING: only pingable collections are polled.
    Ping,
}

/// How a long poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// These collections have changes.
    DataAvailable(Vec<String>),
    /// The deadline passed without changes.
    NoChanges,
    /// Another request changed the sync cache; this one must step aside.
    Stale,
    /// A folder disappeared or a remote wipe is pending.
    FolderSyncRequired,
    /// There is nothing to poll.
    SyncRequired,
    /// The backend failed.
    ServerError,
}

/// The collections of one request together with the sync cache.
pub struct Collections {
    cache: SyncCache,
    states: StateManager,
    clock: Arc<dyn Clock>,
    collections: Vec<SyncCollection>,
    check_wipe: bool,
    imported_changes: bool,
}

impl Collections {
    /// Creates an empty request context around a loaded cache.
    pub fn new(cache: SyncCache, states: StateManager, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            states,
            clock,
            collections: Vec::new(),
            check_wipe: true,
            imported_changes: false,
        }
    }

    /// Whether the poll loop checks the remote wipe status.
    pub fn with_wipe_check(mut self, enabled: bool) -> Self {
        self.check_wipe = enabled;
        self
    }

    /// The sync cache.
    pub fn cache(&self) -> &SyncCache {
        &self.cache
    }

    /// The sync cache, mutably.
    pub fn cache_mut(&mut self) -> &mut SyncCache {
        &mut self.cache
    }

    /// The state manager.
    pub fn states(&self) -> &StateManager {
        &self.states
    }

    /// The clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Adds a collection, replacing one with the same id.
    pub fn add(&mut self, collection: SyncCollection) {
        match self.collections.iter_mut().find(|c| c.id == collection.id) {
            Some(existing) => *existing = collection,
            None => self.collections.push(collection),
        }
    }

    /// Removes a collection.
    pub fn remove(&mut self, id: &str) -> Option<SyncCollection> {
        let index = self.collections.iter().position(|c| c.id == id)?;
        Some(self.collections.remove(index))
    }

    /// One collection.
    pub fn get(&self, id: &str) -> Option<&SyncCollection> {
        self.collections.iter().find(|c| c.id == id)
    }

    /// One collection, mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut SyncCollection> {
        self.collections.iter_mut().find(|c| c.id == id)
    }

    /// Every collection in request order.
    pub fn iter(&self) -> impl Iterator<Item = &SyncCollection> {
        self.collections.iter()
    }

    /// Every collection, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SyncCollection> {
        self.collections.iter_mut()
    }

    /// Collection ids in request order.
    pub fn ids(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.id.clone()).collect()
    }

    /// Number of collections.
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    /// Returns true if there are no collections.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Records that device changes were imported.
    pub fn set_imported_changes(&mut self) {
        self.imported_changes = true;
    }

    /// Returns true if device changes were imported.
    pub fn imported_changes(&self) -> bool {
        self.imported_changes
    }

    /// Adds every cached collection holding an issued key that is not part
    /// of the request yet; with `pingable_only` only pingable ones.
    ///
    /// Returns the number of collections added.
    pub fn load_from_cache(&mut self, pingable_only: bool) -> usize {
        let missing: Vec<SyncCollection> = self
            .cache
            .collections(true)
            .into_iter()
            .filter(|c| !pingable_only || c.pingable)
            .filter(|c| self.get(&c.id).is_none())
            .map(|c| c.to_request())
            .collect();
        let added = missing.len();
        self.collections.extend(missing);
        added
    }

    /// Stores every collection's options and current key in the cache.
    pub fn update_cache(&mut self) {
        for collection in &self.collections {
            self.cache.update_collection(collection, None);
        }
    }

    /// Replaces each collection's key with the one cached, for collections
    /// the cache holds an issued key for.
    fn refresh_keys(&mut self) -> EngineResult<()> {
        self.cache.refresh_collections()?;
        for collection in &mut self.collections {
            if let Some(key) = self.cache.collection(&collection.id).and_then(|c| c.issued_key()) {
                collection.synckey = key;
            }
        }
        Ok(())
    }

    /// Waits up to `heartbeat` seconds for server changes in the request's
    /// collections, polling every `interval`.
    ///
    /// Each iteration checks that no other request changed the sync cache
    /// and that no remote wipe is pending, then counts each collection's
    /// changes. Between iterations the loop waits on the driver's change
    /// notifier, if it has one, waking only for the polled folders. The last
    /// wait is shortened so the deadline is never exceeded.
    ///
    /// # Errors
    ///
    /// Returns an error only if the sync cache cannot be read or written;
    /// backend failures are reported as [`PollOutcome::ServerError`].
    pub fn poll_for_changes(
        &mut self,
        heartbeat: u64,
        interval: Duration,
        mode: PollMode,
    ) -> EngineResult<PollOutcome> {
        let started = self.clock.now();
        let until = started + heartbeat;
        let mut interval = interval.as_secs().max(1);
        let device = self.cache.device_id().to_string();
        let user = self.cache.user().to_string();
        let notifier = self.states.driver().change_notifier();

        info!(device = %device, heartbeat, interval, ?mode, "waiting for changes");

        if mode == PollMode::Sync {
            self.cache.set_last_hb_sync_started(Some(started));
            self.cache.set_last_until(Some(until));
            if self.cache.save(started)? == SaveOutcome::Superseded {
                return Ok(PollOutcome::Stale);
            }
        }

        let mut changed: Vec<String> = Vec::new();
        loop {
            let now = self.clock.now();
            if now >= until {
                break;
            }
            interval = interval.min(until - now);

            if !self.cache.validate_cache()? {
                debug!(device = %device, "stale request");
                return Ok(PollOutcome::Stale);
            }

            if self.collections.is_empty() {
                error!(device = %device, "no collections to poll");
                return Ok(PollOutcome::SyncRequired);
            }

            if self.check_wipe {
                match self.states.rw_status(&device, &user) {
                    Ok(status) if status.blocks_sync() => {
                        info!(device = %device, "remote wipe pending during poll");
                        return Ok(PollOutcome::FolderSyncRequired);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(device = %device, error = %e, "cannot read wipe status");
                        return Ok(PollOutcome::ServerError);
                    }
                }
            }

            let watched: Vec<String> = self
                .collections
                .iter()
                .filter(|c| mode == PollMode::Sync || self.cache.collection_is_pingable(&c.id))
                .map(|c| c.id.clone())
                .collect();
            let watch = notifier.as_deref().map(|n| n.watch(&watched));
            for index in 0..self.collections.len() {
                let id = self.collections[index].id.clone();
                if mode == PollMode::Ping && !self.cache.collection_is_pingable(&id) {
                    continue;
                }
                match self.change_count(&device, &user, index) {
                    Ok(0) => {}
                    Ok(count) => {
                        debug!(device = %device, collection = %id, count, "changes found");
                        changed.push(id);
                    }
                    Err(e) if e.requires_resync() => {
                        // The next SYNC tells the device to start over.
                        debug!(device = %device, collection = %id, error = %e, "state gone");
                        changed.push(id);
                    }
                    Err(e) if e.is_folder_gone() => {
                        info!(device = %device, collection = %id, "folder gone during poll");
                        return Ok(PollOutcome::FolderSyncRequired);
                    }
                    Err(e) => {
                        error!(device = %device, collection = %id, error = %e, "poll failed");
                        return Ok(PollOutcome::ServerError);
                    }
                }
            }

            if !changed.is_empty() {
                break;
            }

            debug!(device = %device, interval, "sleeping");
            self.clock.wait(Duration::from_secs(interval), watch.as_ref());
            self.refresh_keys()?;
        }

        if !self.cache.validate_cache()? {
            debug!(device = %device, "cache changed during poll");
            return Ok(PollOutcome::Stale);
        }

        for id in &changed {
            if let Some(collection) = self.get_mut(id) {
                collection.get_changes = Some(true);
            }
        }

        info!(
            device = %device,
            elapsed = self.clock.now() - started,
            changed = changed.len(),
            "poll finished"
        );
        Ok(if changed.is_empty() {
            PollOutcome::NoChanges
        } else {
            PollOutcome::DataAvailable(changed)
        })
    }

    fn change_count(&self, device: &str, user: &str, index: usize) -> EngineResult<usize> {
        let collection = &self.collections[index];
        if collection.synckey.is_initial() {
            return Ok(0);
        }
        let mut state = self.states.load_state(
            device,
            user,
            &StateScope::collection(collection.id.clone()),
            &collection.synckey,
        )?;
        let sync = Synchronizer::init(
            &mut state,
            self.states.driver().as_ref(),
            &collection.settings,
            true,
        )?;
        Ok(sync.change_count())
    }

    /// Consumes the context, returning the cache.
    pub fn into_cache(self) -> SyncCache {
        self.cache
    }

    /// The key of a collection, `0` if it is not part of the request.
    pub fn synckey(&self, id: &str) -> SyncKey {
        self.get(id).map_or(SyncKey::Initial, |c| c.synckey)
    }
}
