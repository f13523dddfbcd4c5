//! Long-poll configuration.

use std::time::Duration;

/// Hard upper bound for any heartbeat, in seconds.
pub const HEARTBEAT_CEILING: u32 = 3540;

/// Timing bounds for PING and looping SYNC requests.
///
/// All heartbeat values are in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between two polls of the backend.
    pub wait_interval: Duration,
    /// Shortest heartbeat a device may request.
    pub heartbeat_min: u32,
    /// Longest heartbeat a device may request.
    pub heartbeat_max: u32,
    /// Heartbeat used when the device sends none.
    pub heartbeat_default: u32,
    /// Heartbeat imposed on every PING regardless of the request.
    pub forced_heartbeat: Option<u32>,
}

impl HeartbeatConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            wait_interval: Duration::from_secs(10),
            heartbeat_min: 60,
            heartbeat_max: 2700,
            heartbeat_default: 480,
            forced_heartbeat: None,
        }
    }

    /// Sets the poll interval.
    pub fn with_wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    /// Sets the heartbeat bounds. The maximum is capped at
    /// [`HEARTBEAT_CEILING`].
    pub fn with_bounds(mut self, min: u32, max: u32) -> Self {
        self.heartbeat_min = min;
        self.heartbeat_max = max.min(HEARTBEAT_CEILING);
        self
    }

    /// Sets the default heartbeat.
    pub fn with_default(mut self, heartbeat: u32) -> Self {
        self.heartbeat_default = heartbeat;
        self
    }

    /// Forces a heartbeat on every PING.
    pub fn with_forced(mut self, heartbeat: u32) -> Self {
        self.forced_heartbeat = Some(heartbeat);
        self
    }

    /// Returns true if `seconds` lies within the heartbeat bounds.
    pub fn in_bounds(&self, seconds: u32) -> bool {
        (self.heartbeat_min..=self.heartbeat_max.min(HEARTBEAT_CEILING)).contains(&seconds)
    }

    /// Clamps `seconds` into the heartbeat bounds.
    pub fn clamp(&self, seconds: u32) -> u32 {
        seconds.clamp(
            self.heartbeat_min,
            self.heartbeat_max.min(HEARTBEAT_CEILING).max(self.heartbeat_min),
        )
    }

    /// Poll interval in whole seconds, at least one.
    pub fn interval_secs(&self) -> u64 {
        self.wait_interval.as_secs().max(1)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new()
    }
}
