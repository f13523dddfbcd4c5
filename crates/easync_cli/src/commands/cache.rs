//! Cache command implementation.

use super::{emit, or_dash, Format};
use easync_state::{StateBackend, SyncCacheRecord};

/// Loads the sync cache of a device.
pub fn collect(
    backend: &dyn StateBackend,
    device: &str,
    user: &str,
) -> Result<SyncCacheRecord, Box<dyn std::error::Error>> {
    backend
        .load_sync_cache(device, user)?
        .ok_or_else(|| format!("No sync cache for device {device} and user {user}").into())
}

/// Runs the cache command.
pub fn run(
    backend: &dyn StateBackend,
    device: &str,
    user: &str,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = collect(backend, device, user)?;
    emit(&cache, format, print_text_output)
}

fn print_text_output(cache: &SyncCacheRecord) {
    println!("Sync cache of {} ({})", cache.device_id, cache.user);
    println!("==========================");
    println!();
    println!("Generation:      {}", cache.generation);
    println!("Saved at:        {}", cache.timestamp);
    println!("Hierarchy key:   {}", or_dash(cache.hierarchy));
    println!("Wait:            {}", or_dash(cache.wait));
    println!("Heartbeat:       {}", or_dash(cache.hbinterval));
    println!("Ping heartbeat:  {}", or_dash(cache.ping_heartbeat));
    println!("Last deadline:   {}", or_dash(cache.last_until));
    println!(
        "Unconfirmed:     {}",
        cache
            .confirmed_synckeys
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );

    println!();
    println!("Collections:");
    for collection in cache.collections.values() {
        println!(
            "  [{}] {} key {}{}",
            collection.id,
            or_dash(collection.class),
            or_dash(collection.synckey),
            if collection.pingable { " (pingable)" } else { "" }
        );
    }

    println!();
    println!("Folders:");
    for folder in cache.folders.values() {
        println!(
            "  [{}] {} parent {} type {}",
            folder.server_id, folder.display_name, folder.parent_id, folder.folder_type.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easync_state::MemoryBackend;

    #[test]
    fn missing_cache_is_an_error() {
        let backend = MemoryBackend::new();
        let err = collect(&backend, "dev1", "alice").unwrap_err();
        assert!(err.to_string().contains("dev1"));
    }

    #[test]
    fn loads_saved_cache() {
        let backend = MemoryBackend::new();
        let mut record = SyncCacheRecord::new("dev1", "alice");
        record.ping_heartbeat = Some(480);
        backend.save_sync_cache(&record, 0).unwrap();

        let cache = collect(&backend, "dev1", "alice").unwrap();
        assert_eq!(cache.ping_heartbeat, Some(480));
    }
}
