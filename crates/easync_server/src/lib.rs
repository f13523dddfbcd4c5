//! # easync server
//!
//! Request handling for the ActiveSync SYNC, PING and FOLDERSYNC commands.
//!
//! This crate provides:
//! - The SYNC state machine: partial requests, command imports, the
//!   looping wait and windowed export
//! - The PING long poll over the device's pingable collections
//! - FOLDERSYNC hierarchy synchronization
//! - [`ActiveSyncServer`], which loads the device record and dispatches a
//!   decoded request to its handler
//!
//! # Architecture
//!
//! Handlers are stateless. Each request loads the device's sync cache and
//! the synchronization states it refers to from the
//! [`StateBackend`](easync_state::StateBackend), talks to the mail store
//! through a [`Driver`](easync_engine::Driver) and persists what changed
//! before answering. Concurrent requests of one device are reconciled by
//! the cache generation and the compare-and-set on synckeys: the older
//! request steps aside.
//!
//! Protocol conditions (bad synckeys, missing folders, out-of-range
//! heartbeats) are answered with in-band status codes. Only failures the
//! protocol has no status for surface as [`ServerError`].
//!
//! # Transport
//!
//! The transport decodes WBXML into [`Element`](easync_protocol::Element)
//! events, builds a [`CommandRequest`] and encodes the response body. A
//! response with `handled == false` is dropped without a body.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Request handling must not panic: every failure is a status or an error.
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod request;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::HandlerContext;
pub use server::{ActiveSyncServer, Command, CommandRequest, CommandResponse};
