//! Wipe command implementation.

use super::{emit, Format};
use easync_state::{RemoteWipeStatus, StateBackend};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
struct WipeResult<'a> {
    device: &'a str,
    user: &'a str,
    rw_status: RemoteWipeStatus,
}

/// Marks a remote wipe as pending. The device is refused SYNC and PING
/// until it provisions again.
pub fn execute(
    backend: &dyn StateBackend,
    device: &str,
    user: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    backend
        .update_device(device, user, &mut |record| {
            record.map(|mut record| {
                record.rw_status = RemoteWipeStatus::Pending;
                record
            })
        })?
        .ok_or_else(|| format!("Unknown device {device} for user {user}"))?;
    info!(device, user, "remote wipe requested");
    Ok(())
}

/// Runs the wipe command.
pub fn run(
    backend: &dyn StateBackend,
    device: &str,
    user: &str,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    execute(backend, device, user)?;
    let result = WipeResult {
        device,
        user,
        rw_status: RemoteWipeStatus::Pending,
    };
    emit(&result, format, |r| {
        println!("Remote wipe pending for {} ({})", r.device, r.user);
    })
}
