//! Reset command implementation.

use super::{emit, Format};
use easync_state::{CacheWrite, StateBackend, StateFilter, StateScope};
use serde::Serialize;
use tracing::info;

/// What a reset removed.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ResetResult {
    /// State rows removed.
    pub states_removed: usize,
    /// Whether the sync cache was deleted or the collection dropped from it.
    pub cache_updated: bool,
}

/// Removes synchronization state of a device and user.
///
/// With a collection, only that collection's row is removed and the
/// collection is dropped from the sync cache. Without one, every row and
/// the cache go.
pub fn execute(
    backend: &dyn StateBackend,
    device: &str,
    user: &str,
    collection: Option<&str>,
) -> Result<ResetResult, Box<dyn std::error::Error>> {
    let mut filter = StateFilter::device(device).with_user(user);
    let Some(id) = collection else {
        let states_removed = backend.remove_sync_states(&filter)?;
        let cache_updated = backend.load_sync_cache(device, user)?.is_some();
        backend.delete_sync_cache(device, user)?;
        info!(device, user, states_removed, "device state reset");
        return Ok(ResetResult {
            states_removed,
            cache_updated,
        });
    };

    filter = filter.with_scope(StateScope::collection(id));
    let states_removed = backend.remove_sync_states(&filter)?;
    let mut cache_updated = false;
    if let Some(mut record) = backend.load_sync_cache(device, user)? {
        if record.collections.remove(id).is_some() {
            let generation = record.generation;
            if let CacheWrite::Superseded(_) = backend.save_sync_cache(&record, generation)? {
                return Err("Sync cache changed while resetting; retry".into());
            }
            cache_updated = true;
        }
    }
    info!(device, user, collection = id, states_removed, "collection state reset");
    Ok(ResetResult {
        states_removed,
        cache_updated,
    })
}

/// Runs the reset command.
pub fn run(
    backend: &dyn StateBackend,
    device: &str,
    user: &str,
    collection: Option<&str>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = execute(backend, device, user, collection)?;
    emit(&result, format, |r| {
        println!(
            "Removed {} state row(s){}",
            r.states_removed,
            if r.cache_updated { ", sync cache updated" } else { "" }
        );
    })
}
