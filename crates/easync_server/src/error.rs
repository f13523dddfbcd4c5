//! Error types for the request handlers.

use easync_engine::EngineError;
use easync_protocol::ProtocolError;
use easync_state::StateError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that escape a request.
///
/// Protocol conditions are answered in-band with status codes; only what
/// the handlers cannot answer ends up here.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The request cannot be dispatched (unknown command, missing device id).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed protocol input outside a command body.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// State storage failed.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// The engine or the backend failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self, ServerError::InvalidRequest(_) | ServerError::Protocol(_))
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ServerError::State(_) | ServerError::Engine(_) | ServerError::Internal(_)
        )
    }
}
