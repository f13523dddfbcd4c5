//! States command implementation.

use super::{emit, or_dash, Format};
use easync_state::StateBackend;
use serde::Serialize;

/// One synchronization state row.
#[derive(Debug, Serialize)]
pub struct StateSummary {
    /// User name.
    pub user: String,
    /// Scope, `hierarchy` or `collection:<id>`.
    pub scope: String,
    /// Latest synckey issued.
    pub synckey: String,
    /// Backend watermark.
    pub watermark: Option<String>,
    /// Changes not yet sent.
    pub pending: usize,
    /// Known folders (hierarchy rows).
    pub folders: usize,
    /// Unix time of the last save.
    pub last_sync: u64,
}

/// Lists the state rows of a device, ordered by user and scope.
pub fn collect(
    backend: &dyn StateBackend,
    device: &str,
) -> Result<Vec<StateSummary>, Box<dyn std::error::Error>> {
    let mut records = backend.list_sync_states(device)?;
    records.sort_by(|a, b| (&a.user, &a.scope).cmp(&(&b.user, &b.scope)));
    Ok(records
        .into_iter()
        .map(|record| StateSummary {
            user: record.user,
            scope: record.scope.to_string(),
            synckey: record.synckey.to_string(),
            watermark: record.watermark,
            pending: record.pending.len(),
            folders: record.folders.len(),
            last_sync: record.last_sync,
        })
        .collect())
}

/// Runs the states command.
pub fn run(
    backend: &dyn StateBackend,
    device: &str,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let states = collect(backend, device)?;
    emit(&states, format, |states| {
        if states.is_empty() {
            println!("No synchronization state for device {device}.");
            return;
        }
        for s in states {
            println!(
                "{:<16} {:<24} {:<42} pending {:<5} watermark {}",
                s.user,
                s.scope,
                s.synckey,
                s.pending,
                or_dash(s.watermark.as_deref())
            );
        }
    })
}
