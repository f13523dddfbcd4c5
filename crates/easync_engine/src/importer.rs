//! Applies device changes to the backend.

use crate::driver::Driver;
use crate::error::EngineResult;
use easync_protocol::{ConflictPolicy, ItemStat};
use easync_state::SyncStateRecord;
use tracing::debug;

/// Stamp recorded for items the device deleted; suppresses every later echo
/// within the exchange.
const DELETED: u64 = u64::MAX;

/// Applies the commands of one collection.
///
/// Every change is sent to the driver immediately. The stamps the driver
/// returns are recorded in the state so the next export does not echo the
/// device's own changes back to it.
pub struct Importer<'a> {
    driver: &'a dyn Driver,
    state: &'a mut SyncStateRecord,
    folder: String,
    conflict: ConflictPolicy,
    waste_basket: Option<String>,
}

impl<'a> Importer<'a> {
    /// Binds an importer to a collection state.
    pub fn new(
        driver: &'a dyn Driver,
        state: &'a mut SyncStateRecord,
        folder: impl Into<String>,
        conflict: ConflictPolicy,
    ) -> Self {
        Self {
            driver,
            state,
            folder: folder.into(),
            conflict,
            waste_basket: None,
        }
    }

    /// Turns deletions into moves to `folder`.
    pub fn with_deletes_as_moves(mut self, folder: Option<String>) -> Self {
        self.waste_basket = folder.filter(|f| *f != self.folder);
        self
    }

    fn remember(&mut self, stat: &ItemStat) {
        self.state.device_changes.insert(stat.id.clone(), stat.stamp);
    }

    /// Adds an item and returns its server id.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver rejects the item.
    pub fn import_add(&mut self, data: &[u8]) -> EngineResult<String> {
        let stat = self.driver.add_item(&self.folder, data)?;
        debug!(collection = %self.folder, id = %stat.id, "imported add");
        self.remember(&stat);
        Ok(stat.id)
    }

    /// Replaces an item.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item does not exist.
    pub fn import_change(&mut self, id: &str, data: &[u8]) -> EngineResult<ItemStat> {
        let since = self.state.watermark.clone();
        let stat = self
            .driver
            .change_item(&self.folder, id, data, self.conflict, since.as_deref())?;
        debug!(collection = %self.folder, id, "imported change");
        self.remember(&stat);
        Ok(stat)
    }

    /// Sets the read flag of an item.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item does not exist.
    pub fn import_read_flag(&mut self, id: &str, read: bool) -> EngineResult<ItemStat> {
        let stat = self.driver.set_read_flag(&self.folder, id, read)?;
        self.remember(&stat);
        Ok(stat)
    }

    /// Deletes an item, or moves it to the waste basket.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item does not exist.
    pub fn import_delete(&mut self, id: &str) -> EngineResult<()> {
        match self.waste_basket.clone() {
            Some(trash) => {
                self.driver.move_item(&self.folder, id, &trash)?;
                debug!(collection = %self.folder, id, %trash, "imported delete as move");
            }
            None => {
                self.driver.delete_item(&self.folder, id)?;
                debug!(collection = %self.folder, id, "imported delete");
            }
        }
        self.state.device_changes.insert(id.to_string(), DELETED);
        Ok(())
    }

    /// Moves an item to another folder.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the item does not exist.
    pub fn import_move(&mut self, id: &str, destination: &str) -> EngineResult<ItemStat> {
        let stat = self.driver.move_item(&self.folder, id, destination)?;
        self.state.device_changes.insert(id.to_string(), DELETED);
        Ok(stat)
    }
}
