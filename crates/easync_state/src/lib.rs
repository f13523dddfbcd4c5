//! # easync State
//!
//! Synchronization state and sync cache persistence for easync.
//!
//! Two kinds of device state survive between requests:
//!
//! - **Sync state**: one row per (device, user, scope) holding the latest
//!   synckey issued for the scope, the backend watermark and the changes not
//!   yet sent. Rows are replaced with a compare-and-swap on the previous key.
//! - **Sync cache**: one record per (device, user) holding what the device
//!   sent in earlier requests, so abbreviated requests can be completed. It
//!   is saved with an optimistic generation check.
//!
//! ## Available Backends
//!
//! - [`MemoryBackend`] - For testing and embedding
//! - [`FileBackend`] - CBOR files guarded by advisory locks
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use easync_protocol::SyncKey;
//! use easync_state::{MemoryBackend, StateScope, StateStore};
//!
//! let store = StateStore::new(Arc::new(MemoryBackend::new()));
//! let scope = StateScope::collection("INBOX");
//! let mut state = store.load_state("dev", "alice", &scope, &SyncKey::Initial).unwrap();
//! let previous = state.synckey;
//! state.synckey = StateStore::new_sync_key(&previous);
//! store.save(&mut state, &previous, 0).unwrap();
//! assert!(store.load_state("dev", "alice", &scope, &state.synckey).is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod cache;
mod error;
mod file;
mod memory;
mod records;
mod store;

pub use backend::{CacheWrite, StateBackend};
pub use cache::{SaveOutcome, SyncCache};
pub use error::{StateError, StateResult};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use records::{
    CachedCollection, DeviceRecord, LoopCounter, RemoteWipeStatus, StateFilter, StateScope,
    SyncCacheRecord, SyncStateRecord,
};
pub use store::StateStore;
