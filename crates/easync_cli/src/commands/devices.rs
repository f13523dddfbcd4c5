//! Devices command implementation.

use super::{emit, Format};
use easync_state::{DeviceRecord, RemoteWipeStatus, StateBackend};
use serde::Serialize;

/// One row of the device listing.
#[derive(Debug, Serialize)]
pub struct DeviceSummary {
    /// Device id.
    pub id: String,
    /// User name.
    pub user: String,
    /// Device type.
    pub device_type: String,
    /// Protocol version last used.
    pub version: String,
    /// Remote wipe state.
    pub rw_status: RemoteWipeStatus,
    /// Unix time of the latest request.
    pub last_seen: u64,
}

impl From<DeviceRecord> for DeviceSummary {
    fn from(device: DeviceRecord) -> Self {
        Self {
            id: device.id,
            user: device.user,
            device_type: device.device_type,
            version: device.version.to_string(),
            rw_status: device.rw_status,
            last_seen: device.last_seen,
        }
    }
}

/// Lists every device, ordered by id and user.
pub fn collect(backend: &dyn StateBackend) -> Result<Vec<DeviceSummary>, Box<dyn std::error::Error>> {
    let mut devices: Vec<DeviceSummary> = backend
        .list_devices()?
        .into_iter()
        .map(DeviceSummary::from)
        .collect();
    devices.sort_by(|a, b| (&a.id, &a.user).cmp(&(&b.id, &b.user)));
    Ok(devices)
}

/// Runs the devices command.
pub fn run(backend: &dyn StateBackend, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let devices = collect(backend)?;
    emit(&devices, format, |devices| {
        if devices.is_empty() {
            println!("No devices.");
            return;
        }
        println!(
            "{:<24} {:<16} {:<12} {:<8} {:<8} {}",
            "DEVICE", "USER", "TYPE", "VERSION", "WIPE", "LAST SEEN"
        );
        for d in devices {
            println!(
                "{:<24} {:<16} {:<12} {:<8} {:<8} {}",
                d.id,
                d.user,
                d.device_type,
                d.version,
                format!("{:?}", d.rw_status),
                d.last_seen
            );
        }
    })
}
