//! Error types for protocol parsing.

use crate::tags::Tag;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while reading or validating protocol elements.
///
/// These are ordinary control flow: request handlers translate them into
/// in-band status codes rather than failing the HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A required element was not found at the current position.
    #[error("missing element {0:?}")]
    MissingElement(Tag),

    /// The closing tag for an element was not where it should be.
    #[error("missing end tag for {0:?}")]
    MissingEndTag(Tag),

    /// An element appeared where it is not allowed.
    #[error("unexpected element {found:?} inside {context:?}")]
    UnexpectedElement {
        /// The enclosing element.
        context: Tag,
        /// The element that was found.
        found: Tag,
    },

    /// The element stream ended before the request was complete.
    #[error("unexpected end of request")]
    UnexpectedEnd,

    /// An element carried a value that cannot be interpreted.
    #[error("invalid value {value:?} for {tag:?}")]
    InvalidValue {
        /// The element carrying the value.
        tag: Tag,
        /// The raw value.
        value: String,
    },

    /// A synckey did not match the `{uuid}counter` format.
    #[error("invalid synckey: {0:?}")]
    InvalidSyncKey(String),

    /// An unknown protocol version string.
    #[error("unsupported protocol version: {0:?}")]
    UnsupportedVersion(String),

    /// An element that may only appear once was repeated or combined with
    /// an incompatible sibling.
    #[error("conflicting elements {first:?} and {second:?}")]
    Conflicting {
        /// The element seen first.
        first: Tag,
        /// The element that conflicts with it.
        second: Tag,
    },
}

impl ProtocolError {
    /// Creates an [`ProtocolError::InvalidValue`] error.
    pub fn invalid_value(tag: Tag, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            tag,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::invalid_value(Tag::WindowSize, "abc");
        let msg = err.to_string();
        assert!(msg.contains("WindowSize"));
        assert!(msg.contains("abc"));

        let err = ProtocolError::InvalidSyncKey("{x}".into());
        assert!(err.to_string().contains("{x}"));
    }
}
