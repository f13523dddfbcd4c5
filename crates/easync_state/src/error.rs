//! Error types for state operations.

use std::io;
use thiserror::Error;

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while loading or saving synchronization state.
#[derive(Debug, Error)]
pub enum StateError {
    /// No state is on file for a non-initial synckey.
    #[error("no state for {scope} (synckey {synckey})")]
    StateGone {
        /// The state scope.
        scope: String,
        /// The synckey the device presented.
        synckey: String,
    },

    /// The presented synckey is not the one most recently issued.
    #[error("synckey mismatch for {scope}: expected {expected}, got {actual}")]
    KeyMismatch {
        /// The state scope.
        scope: String,
        /// The latest issued key.
        expected: String,
        /// The key the device presented.
        actual: String,
    },

    /// The collection no longer exists on the backend.
    #[error("folder {0} no longer exists")]
    FolderGone(String),

    /// The backend invalidated the state (for example, a reset watermark).
    #[error("stale state: {0}")]
    StaleState(String),

    /// Another request advanced the state first.
    #[error("concurrent write to {scope}: expected {expected}, found {found}")]
    ConcurrentWrite {
        /// The state scope.
        scope: String,
        /// The key this writer advanced from.
        expected: String,
        /// The key found on file.
        found: String,
    },

    /// The device is unknown.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Persisted state is inconsistent.
    #[error("state corrupted: {0}")]
    Corrupted(String),
}

impl StateError {
    /// Returns true if the device must restart the collection from synckey `0`.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            StateError::StateGone { .. }
                | StateError::KeyMismatch { .. }
                | StateError::StaleState(_)
                | StateError::ConcurrentWrite { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resync_classification() {
        let err = StateError::KeyMismatch {
            scope: "collection:INBOX".into(),
            expected: "{a}2".into(),
            actual: "{a}1".into(),
        };
        assert!(err.requires_resync());
        assert!(err.to_string().contains("{a}2"));
        assert!(!StateError::FolderGone("INBOX".into()).requires_resync());
        assert!(!StateError::Codec("bad".into()).requires_resync());
    }
}
