//! Destinations for server changes.

use crate::error::EngineResult;
use easync_protocol::{Encoder, Folder, Tag};

/// Receives server changes one at a time.
pub trait ExportSink {
    /// An item the device does not have yet (`is_new`) or has in an older
    /// version.
    fn item_change(&mut self, id: &str, data: &[u8], is_new: bool) -> EngineResult<()>;

    /// An item that disappeared from the collection.
    fn item_deletion(&mut self, id: &str) -> EngineResult<()>;

    /// An item whose read flag changed.
    fn item_read_flag(&mut self, id: &str, read: bool) -> EngineResult<()>;

    /// A folder the device does not know yet (`is_new`) or knows in an older
    /// version.
    fn folder_change(&mut self, folder: &Folder, is_new: bool) -> EngineResult<()>;

    /// A folder that no longer exists.
    fn folder_deletion(&mut self, id: &str) -> EngineResult<()>;
}

/// One exported change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportedChange {
    /// See [`ExportSink::item_change`].
    Item {
        /// Server id.
        id: String,
        /// Payload.
        data: Vec<u8>,
        /// True for adds.
        is_new: bool,
    },
    /// See [`ExportSink::item_deletion`].
    ItemDeleted(String),
    /// See [`ExportSink::item_read_flag`].
    ReadFlag {
        /// Server id.
        id: String,
        /// New flag.
        read: bool,
    },
    /// See [`ExportSink::folder_change`].
    Folder {
        /// The folder.
        folder: Folder,
        /// True for adds.
        is_new: bool,
    },
    /// See [`ExportSink::folder_deletion`].
    FolderDeleted(String),
}

/// Collects changes in memory.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<ExportedChange>,
}

impl ChangeSet {
    /// Creates an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collected changes.
    pub fn count(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// The collected changes in order.
    pub fn changes(&self) -> &[ExportedChange] {
        &self.changes
    }

    /// Replays the collected changes into another sink.
    ///
    /// # Errors
    ///
    /// Returns the first error of `sink`.
    pub fn replay(&self, sink: &mut dyn ExportSink) -> EngineResult<()> {
        for change in &self.changes {
            match change {
                ExportedChange::Item { id, data, is_new } => sink.item_change(id, data, *is_new)?,
                ExportedChange::ItemDeleted(id) => sink.item_deletion(id)?,
                ExportedChange::ReadFlag { id, read } => sink.item_read_flag(id, *read)?,
                ExportedChange::Folder { folder, is_new } => sink.folder_change(folder, *is_new)?,
                ExportedChange::FolderDeleted(id) => sink.folder_deletion(id)?,
            }
        }
        Ok(())
    }
}

impl ExportSink for ChangeSet {
    fn item_change(&mut self, id: &str, data: &[u8], is_new: bool) -> EngineResult<()> {
        self.changes.push(ExportedChange::Item {
            id: id.to_string(),
            data: data.to_vec(),
            is_new,
        });
        Ok(())
    }

    fn item_deletion(&mut self, id: &str) -> EngineResult<()> {
        self.changes.push(ExportedChange::ItemDeleted(id.to_string()));
        Ok(())
    }

    fn item_read_flag(&mut self, id: &str, read: bool) -> EngineResult<()> {
        self.changes.push(ExportedChange::ReadFlag {
            id: id.to_string(),
            read,
        });
        Ok(())
    }

    fn folder_change(&mut self, folder: &Folder, is_new: bool) -> EngineResult<()> {
        self.changes.push(ExportedChange::Folder {
            folder: folder.clone(),
            is_new,
        });
        Ok(())
    }

    fn folder_deletion(&mut self, id: &str) -> EngineResult<()> {
        self.changes.push(ExportedChange::FolderDeleted(id.to_string()));
        Ok(())
    }
}

/// Writes changes as response elements.
///
/// Items become `Add`/`Change`/`Delete` elements carrying the payload as
/// opaque `ApplicationData`; folders become FolderHierarchy
/// `Add`/`Update`/`Delete` elements.
pub struct EncoderExporter<'a, E: Encoder + ?Sized> {
    encoder: &'a mut E,
}

impl<'a, E: Encoder + ?Sized> EncoderExporter<'a, E> {
    /// Wraps an encoder.
    pub fn new(encoder: &'a mut E) -> Self {
        Self { encoder }
    }
}

impl<E: Encoder + ?Sized> ExportSink for EncoderExporter<'_, E> {
    fn item_change(&mut self, id: &str, data: &[u8], is_new: bool) -> EngineResult<()> {
        self.encoder
            .start_tag(if is_new { Tag::Add } else { Tag::Modify });
        self.encoder.element(Tag::ServerEntryId, id);
        self.encoder.start_tag(Tag::Data);
        self.encoder.opaque(data);
        self.encoder.end_tag();
        self.encoder.end_tag();
        Ok(())
    }

    fn item_deletion(&mut self, id: &str) -> EngineResult<()> {
        self.encoder.start_tag(Tag::Remove);
        self.encoder.element(Tag::ServerEntryId, id);
        self.encoder.end_tag();
        Ok(())
    }

    fn item_read_flag(&mut self, id: &str, read: bool) -> EngineResult<()> {
        self.encoder.start_tag(Tag::Modify);
        self.encoder.element(Tag::ServerEntryId, id);
        self.encoder.start_tag(Tag::Data);
        self.encoder.element(Tag::Read, if read { "1" } else { "0" });
        self.encoder.end_tag();
        self.encoder.end_tag();
        Ok(())
    }

    fn folder_change(&mut self, folder: &Folder, is_new: bool) -> EngineResult<()> {
        self.encoder.start_tag(if is_new {
            Tag::HierarchyAdd
        } else {
            Tag::HierarchyUpdate
        });
        self.encoder
            .element(Tag::HierarchyServerId, &folder.server_id);
        self.encoder
            .element(Tag::HierarchyParentId, &folder.parent_id);
        self.encoder
            .element(Tag::HierarchyDisplayName, &folder.display_name);
        self.encoder
            .element(Tag::HierarchyType, &folder.folder_type.0.to_string());
        self.encoder.end_tag();
        Ok(())
    }

    fn folder_deletion(&mut self, id: &str) -> EngineResult<()> {
        self.encoder.start_tag(Tag::HierarchyDelete);
        self.encoder.element(Tag::HierarchyServerId, id);
        self.encoder.end_tag();
        Ok(())
    }
}
