//! Folder hierarchy types.

use crate::collection::CollectionClass;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A folder `Type` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderType(pub u8);

impl FolderType {
    /// User-created generic folder.
    pub const GENERIC: FolderType = FolderType(1);
    /// Default inbox.
    pub const INBOX: FolderType = FolderType(2);
    /// Default drafts folder.
    pub const DRAFTS: FolderType = FolderType(3);
    /// Default deleted items folder.
    pub const WASTEBASKET: FolderType = FolderType(4);
    /// Default sent items folder.
    pub const SENT: FolderType = FolderType(5);
    /// Default tasks folder.
    pub const TASKS: FolderType = FolderType(7);
    /// Default calendar.
    pub const CALENDAR: FolderType = FolderType(8);
    /// Default contacts folder.
    pub const CONTACTS: FolderType = FolderType(9);
    /// Default notes folder.
    pub const NOTES: FolderType = FolderType(10);
    /// User-created mail folder.
    pub const USER_MAIL: FolderType = FolderType(12);

    /// Returns the collection class of folders of this type.
    pub fn class(self) -> CollectionClass {
        match self.0 {
            7 | 15 => CollectionClass::Tasks,
            8 | 13 => CollectionClass::Calendar,
            9 | 14 => CollectionClass::Contacts,
            10 | 17 => CollectionClass::Notes,
            _ => CollectionClass::Email,
        }
    }
}

/// A folder as announced to the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Folder {
    /// Server id.
    pub server_id: String,
    /// Parent server id, `"0"` for top-level folders.
    pub parent_id: String,
    /// Display name.
    pub display_name: String,
    /// Folder type.
    pub folder_type: FolderType,
}

impl Folder {
    /// Creates a top-level folder.
    pub fn new(
        server_id: impl Into<String>,
        display_name: impl Into<String>,
        folder_type: FolderType,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            parent_id: "0".to_string(),
            display_name: display_name.into(),
            folder_type,
        }
    }

    /// Sets the parent folder.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }

    /// Returns the collection class of this folder.
    pub fn class(&self) -> CollectionClass {
        self.folder_type.class()
    }
}

/// A change to the folder hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderChange {
    /// A folder the device does not know yet.
    Add(Folder),
    /// A known folder that was renamed, moved or retyped.
    Update(Folder),
    /// A known folder that no longer exists.
    Remove(String),
}

impl FolderChange {
    /// Returns the server id the change applies to.
    pub fn server_id(&self) -> &str {
        match self {
            FolderChange::Add(f) | FolderChange::Update(f) => &f.server_id,
            FolderChange::Remove(id) => id,
        }
    }
}

/// Computes the changes that turn `known` into `current`.
///
/// Both lists are sorted by server id and merged: ids only in `current` are
/// adds, ids only in `known` are removals, and ids in both whose parent,
/// name or type differ are updates.
pub fn diff_folders(known: &[Folder], current: &[Folder]) -> Vec<FolderChange> {
    let mut old: Vec<&Folder> = known.iter().collect();
    let mut new: Vec<&Folder> = current.iter().collect();
    old.sort_by(|a, b| a.server_id.cmp(&b.server_id));
    new.sort_by(|a, b| a.server_id.cmp(&b.server_id));

    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match old[i].server_id.cmp(&new[j].server_id) {
            Ordering::Equal => {
                if old[i] != new[j] {
                    changes.push(FolderChange::Update(new[j].clone()));
                }
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                changes.push(FolderChange::Remove(old[i].server_id.clone()));
                i += 1;
            }
            Ordering::Greater => {
                changes.push(FolderChange::Add(new[j].clone()));
                j += 1;
            }
        }
    }
    changes.extend(old[i..].iter().map(|f| FolderChange::Remove(f.server_id.clone())));
    changes.extend(new[j..].iter().map(|f| FolderChange::Add((*f).clone())));
    changes
}
