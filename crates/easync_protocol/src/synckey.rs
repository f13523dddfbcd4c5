//! Synchronization keys.
//!
//! A synckey is `0` for a collection that has never been synchronized and
//! `{series}counter` afterwards. The series is a random UUID chosen whenever
//! a collection starts over from `0`; the counter starts at 1 and advances by
//! one with every issued key.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A synchronization key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SyncKey {
    /// The initial key `0`.
    Initial,
    /// A key issued by the server.
    Issued {
        /// Series identifier, new for every reset.
        series: Uuid,
        /// Position within the series, starting at 1.
        counter: u64,
    },
}

impl SyncKey {
    /// Parses the wire form. A leading `s` before the brace is accepted.
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        let raw = raw.trim();
        if raw == "0" {
            return Ok(SyncKey::Initial);
        }
        let invalid = || ProtocolError::InvalidSyncKey(raw.to_string());

        let body = raw.strip_prefix('s').unwrap_or(raw);
        let body = body.strip_prefix('{').ok_or_else(invalid)?;
        let (series, counter) = body.split_once('}').ok_or_else(invalid)?;

        if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let series = Uuid::parse_str(series).map_err(|_| invalid())?;
        let counter: u64 = counter.parse().map_err(|_| invalid())?;
        if counter == 0 {
            return Err(invalid());
        }

        Ok(SyncKey::Issued { series, counter })
    }

    /// Returns the key that follows this one.
    ///
    /// The initial key starts a fresh series at 1; issued keys advance the
    /// counter within their series.
    #[must_use]
    pub fn next(&self) -> SyncKey {
        match self {
            SyncKey::Initial => SyncKey::Issued {
                series: Uuid::new_v4(),
                counter: 1,
            },
            SyncKey::Issued { series, counter } => SyncKey::Issued {
                series: *series,
                counter: counter + 1,
            },
        }
    }

    /// Returns true for the initial key `0`.
    pub fn is_initial(&self) -> bool {
        matches!(self, SyncKey::Initial)
    }

    /// Returns the counter, 0 for the initial key.
    pub fn counter(&self) -> u64 {
        match self {
            SyncKey::Initial => 0,
            SyncKey::Issued { counter, .. } => *counter,
        }
    }

    /// Returns the series, if issued.
    pub fn series(&self) -> Option<Uuid> {
        match self {
            SyncKey::Initial => None,
            SyncKey::Issued { series, .. } => Some(*series),
        }
    }
}

impl Default for SyncKey {
    fn default() -> Self {
        SyncKey::Initial
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncKey::Initial => write!(f, "0"),
            SyncKey::Issued { series, counter } => write!(f, "{{{series}}}{counter}"),
        }
    }
}

impl FromStr for SyncKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncKey::parse(s)
    }
}

impl TryFrom<String> for SyncKey {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SyncKey::parse(&value)
    }
}

impl From<SyncKey> for String {
    fn from(key: SyncKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn initial_key() {
        let key = SyncKey::parse("0").unwrap();
        assert!(key.is_initial());
        assert_eq!(key.counter(), 0);
        assert_eq!(key.to_string(), "0");
    }

    #[test]
    fn next_starts_series_at_one() {
        let first = SyncKey::Initial.next();
        assert_eq!(first.counter(), 1);
        let second = first.next();
        assert_eq!(second.counter(), 2);
        assert_eq!(first.series(), second.series());

        let other = SyncKey::Initial.next();
        assert_ne!(first.series(), other.series());
    }

    #[test]
    fn parses_wire_form() {
        let raw = "{0b8a2c6e-2f3b-4c1d-9a57-3c1f2e6d7b90}17";
        let key = SyncKey::parse(raw).unwrap();
        assert_eq!(key.counter(), 17);
        assert_eq!(key.to_string(), raw);

        let prefixed = SyncKey::parse("s{0b8a2c6e-2f3b-4c1d-9a57-3c1f2e6d7b90}17").unwrap();
        assert_eq!(prefixed, key);
    }

    #[test]
    fn rejects_malformed_keys() {
        for raw in [
            "",
            "1",
            "{}1",
            "{0b8a2c6e-2f3b-4c1d-9a57-3c1f2e6d7b90}",
            "{0b8a2c6e-2f3b-4c1d-9a57-3c1f2e6d7b90}0",
            "{0b8a2c6e-2f3b-4c1d-9a57-3c1f2e6d7b90}x1",
            "{not a uuid}3",
            "0b8a2c6e-2f3b-4c1d-9a57-3c1f2e6d7b90}3",
        ] {
            assert!(SyncKey::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn serializes_as_string() {
        let key = SyncKey::Initial.next();
        let text: String = key.into();
        assert_eq!(SyncKey::try_from(text).unwrap(), key);
    }

    proptest! {
        #[test]
        fn successive_keys_are_strictly_increasing(steps in 1usize..64) {
            let mut key = SyncKey::Initial.next();
            let series = key.series();
            for _ in 0..steps {
                let next = key.next();
                prop_assert_eq!(next.counter(), key.counter() + 1);
                prop_assert_eq!(next.series(), series);
                prop_assert_ne!(next, key);
                key = next;
            }
            prop_assert_eq!(key.counter(), steps as u64 + 1);
        }
    }
}
