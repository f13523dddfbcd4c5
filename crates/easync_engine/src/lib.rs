//! # easync Engine
//!
//! Synchronization engine for easync.
//!
//! This crate provides:
//! - The [`Driver`] trait the backend data store implements, and the
//!   in-memory [`MemoryDriver`]
//! - [`StateManager`], which checks folders against the backend before
//!   loading their state
//! - [`Importer`] for device changes and [`Synchronizer`] /
//!   [`HierarchySynchronizer`] for server changes, emitted through an
//!   [`ExportSink`]
//! - [`Collections`], the per-request view of the collections with the
//!   long-poll loop used by PING and looping SYNC
//!
//! ## Exchange model
//!
//! 1. Device changes are applied to the backend first
//! 2. Server changes since the state's watermark become the pending list,
//!    minus the device's own changes
//! 3. At most a window's worth of pending changes is sent; the rest is
//!    persisted with the next synckey
//!
//! ## Key Invariants
//!
//! - A long poll never runs past its deadline
//! - A request that lost a race on the sync cache stops without writing
//! - Payloads are opaque to the engine

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod collections;
mod config;
mod driver;
mod error;
mod exporter;
mod importer;
mod memory;
mod notify;
mod state;
mod synchronizer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collections::{Collections, PollMode, PollOutcome};
pub use config::{HeartbeatConfig, HEARTBEAT_CEILING};
pub use driver::{Driver, ServerChanges};
pub use error::{EngineError, EngineResult};
pub use exporter::{ChangeSet, EncoderExporter, ExportSink, ExportedChange};
pub use importer::Importer;
pub use memory::MemoryDriver;
pub use notify::{ChangeNotifier, ChangeWatch};
pub use state::StateManager;
pub use synchronizer::{HierarchySynchronizer, Synchronizer};
