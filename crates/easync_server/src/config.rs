//! Server configuration.

use easync_protocol::DEFAULT_WINDOW_SIZE;

/// Configuration for the request handlers.
///
/// Long-poll timing lives in the driver's
/// [`HeartbeatConfig`](easync_engine::HeartbeatConfig).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Most folders a single PING may monitor.
    pub max_ping_folders: usize,
    /// Whether the remote wipe status of a device is enforced.
    pub provisioning: bool,
    /// Window size for collections that send none and have none cached.
    pub default_window_size: u32,
    /// Failed SYNC exchanges in a row on one synckey before the collection
    /// is reset.
    pub max_synckey_repeats: u32,
}

impl ServerConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            max_ping_folders: 300,
            provisioning: true,
            default_window_size: DEFAULT_WINDOW_SIZE,
            max_synckey_repeats: 50,
        }
    }

    /// Sets the PING folder limit.
    pub fn with_max_ping_folders(mut self, max: usize) -> Self {
        self.max_ping_folders = max;
        self
    }

    /// Enables or disables remote wipe enforcement.
    pub fn with_provisioning(mut self, enabled: bool) -> Self {
        self.provisioning = enabled;
        self
    }

    /// Sets how many failed exchanges on one synckey are tolerated.
    pub fn with_max_synckey_repeats(mut self, max: u32) -> Self {
        self.max_synckey_repeats = max.max(1);
        self
    }

    /// Sets the fallback window size. Out-of-range values fall back to the
    /// protocol default.
    pub fn with_default_window_size(mut self, size: u32) -> Self {
        self.default_window_size = easync_protocol::clamp_window_size(i64::from(size));
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
