//! Error types for the engine.

use easync_protocol::ProtocolError;
use easync_state::StateError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while synchronizing a collection.
#[derive(Error, Debug)]
pub enum EngineError {
    /// State store error.
    #[error(transparent)]
    State(#[from] StateError),

    /// Malformed protocol data.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The backend failed.
    #[error("driver error: {0}")]
    Driver(String),

    /// The backend has no such item.
    #[error("item {id} not found in {folder}")]
    NotFound {
        /// Folder id.
        folder: String,
        /// Item id.
        id: String,
    },

    /// A collection is not part of the request or the cache.
    #[error("collection {0} is not known")]
    MissingCollection(String),
}

impl EngineError {
    /// Creates a driver error.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver(message.into())
    }

    /// Creates a not-found error.
    pub fn not_found(folder: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            folder: folder.into(),
            id: id.into(),
        }
    }

    /// Returns true if the backend itself failed, as opposed to a condition
    /// the device can recover from.
    pub fn is_backend_failure(&self) -> bool {
        match self {
            EngineError::Driver(_) => true,
            EngineError::State(e) => matches!(
                e,
                StateError::Io(_) | StateError::Codec(_) | StateError::Corrupted(_)
            ),
            _ => false,
        }
    }

    /// Returns true if the device must start the collection over.
    pub fn requires_resync(&self) -> bool {
        matches!(self, EngineError::State(e) if e.requires_resync())
    }

    /// Returns true if the folder disappeared from the backend.
    pub fn is_folder_gone(&self) -> bool {
        matches!(self, EngineError::State(StateError::FolderGone(_)))
    }
}
