//! Per-request handler context.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use easync_engine::{Clock, Collections, Driver, HeartbeatConfig, StateManager};
use easync_protocol::ProtocolVersion;
use easync_state::{DeviceRecord, StateBackend, StateError, StateStore, SyncCache};
use std::sync::Arc;

/// Everything a command handler needs for one request.
///
/// Built by [`ActiveSyncServer`](crate::ActiveSyncServer) after the device
/// record was loaded or created.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// The requesting device, as loaded at the start of the request.
    pub device: DeviceRecord,
    /// Negotiated protocol version.
    pub version: ProtocolVersion,
    backend: Arc<dyn StateBackend>,
    states: StateManager,
    clock: Arc<dyn Clock>,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn StateBackend>,
        driver: Arc<dyn Driver>,
        clock: Arc<dyn Clock>,
        device: DeviceRecord,
        version: ProtocolVersion,
    ) -> Self {
        let states = StateManager::new(StateStore::new(backend.clone()), driver);
        Self {
            config,
            device,
            version,
            backend,
            states,
            clock,
        }
    }

    /// Device id.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Authenticated user.
    pub fn user(&self) -> &str {
        &self.device.user
    }

    /// State manager.
    pub fn states(&self) -> &StateManager {
        &self.states
    }

    /// Backend driver.
    pub fn driver(&self) -> &dyn Driver {
        self.states.driver().as_ref()
    }

    /// Long-poll timing of the driver.
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        self.driver().heartbeat_config()
    }

    /// Current time in seconds.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// True if a remote wipe blocks synchronization for this device.
    pub fn wipe_pending(&self) -> bool {
        self.config.provisioning && self.device.rw_status.blocks_sync()
    }

    /// Loads the device's sync cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    pub fn load_cache(&self) -> ServerResult<SyncCache> {
        Ok(SyncCache::load(
            self.backend.clone(),
            &self.device.id,
            &self.device.user,
        )?)
    }

    /// Wraps a loaded cache into the request's collection set.
    pub fn collections(&self, cache: SyncCache) -> Collections {
        Collections::new(cache, self.states.clone(), self.clock.clone())
            .with_wipe_check(self.config.provisioning)
    }

    /// Applies `update` to the stored device record and refreshes
    /// [`Self::device`] with the result. Fields other requests changed in the
    /// meantime, such as the remote wipe status, are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the device was removed.
    pub fn update_device(&mut self, mut update: impl FnMut(&mut DeviceRecord)) -> ServerResult<()> {
        let updated = self.states.store().update_device(
            &self.device.id,
            &self.device.user,
            |current| {
                current.map(|mut device| {
                    update(&mut device);
                    device
                })
            },
        )?;
        self.device = updated.ok_or_else(|| StateError::DeviceNotFound(self.device.id.clone()))?;
        Ok(())
    }
}
