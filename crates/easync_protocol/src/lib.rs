//! # easync protocol
//!
//! ActiveSync protocol vocabulary shared by the state store, the engine and
//! the request handlers.
//!
//! This crate provides:
//! - [`Tag`] and the element-event codec traits ([`Decoder`], [`Encoder`])
//!   with in-memory implementations
//! - Status codes for SYNC, PING and FOLDERSYNC
//! - [`SyncKey`] parsing and sequencing
//! - Collection, folder and change types
//!
//! This is a pure protocol crate with no I/O operations. The binary WBXML
//! codec is expected to implement [`Decoder`] and [`Encoder`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod codec;
mod collection;
mod conflict;
mod error;
mod folder;
mod status;
mod synckey;
mod tags;
mod tree;
mod version;

pub use change::{ChangeKind, ItemChange, ItemStat};
pub use codec::{Decoder, Element, Encoder, EventReader, EventWriter, StartTag};
pub use collection::{
    clamp_window_size, BodyPreference, ClientCommand, CollectionClass, CollectionSettings,
    SyncCollection, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE, MIME_SUPPORT_NONE, MIME_TRUNCATION_ALL,
    TRUNCATION_ALL,
};
pub use conflict::ConflictPolicy;
pub use error::{ProtocolError, ProtocolResult};
pub use folder::{diff_folders, Folder, FolderChange, FolderType};
pub use status::{FolderSyncStatus, PingStatus, SyncStatus};
pub use synckey::SyncKey;
pub use tags::{CodePage, Tag};
pub use tree::{render, Node};
pub use version::ProtocolVersion;
