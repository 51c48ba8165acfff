#[cfg(test)]
#[path = "tests/space.rs"]
mod tests;

use std::fmt;
use std::io;
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a space.
///
/// Space ids double as directory names under the storage root, so the set of
/// accepted characters is restricted: no path separators, no `..`, and no
/// leading `.` (hidden names are reserved for staging directories).
#[derive(
    Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize, BorshSerialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct SpaceId(String);

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("invalid space id: {0}")]
pub struct InvalidSpaceId(&'static str);

impl SpaceId {
    pub const MAX_LENGTH: usize = 255;

    pub fn new(id: String) -> Result<Self, InvalidSpaceId> {
        if id.is_empty() {
            return Err(InvalidSpaceId("empty"));
        }

        if id.len() > Self::MAX_LENGTH {
            return Err(InvalidSpaceId("exceeds maximum length of 255 bytes"));
        }

        if id.starts_with('.') {
            return Err(InvalidSpaceId("must not start with `.`"));
        }

        if id.contains("..") {
            return Err(InvalidSpaceId("must not contain `..`"));
        }

        if !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
        {
            return Err(InvalidSpaceId(
                "only ascii alphanumerics, `.`, `-` and `_` are allowed",
            ));
        }

        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SpaceId {
    type Err = InvalidSpaceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_owned())
    }
}

impl TryFrom<String> for SpaceId {
    type Error = InvalidSpaceId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SpaceId> for String {
    fn from(id: SpaceId) -> Self {
        id.0
    }
}

impl AsRef<str> for SpaceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl BorshDeserialize for SpaceId {
    fn deserialize_reader<R: io::Read>(reader: &mut R) -> io::Result<Self> {
        let raw = String::deserialize_reader(reader)?;

        Self::new(raw).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// Identifier of a remote node, as understood by the transport.
#[derive(
    Clone,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Deserialize,
    Serialize,
    BorshSerialize,
    BorshDeserialize,
)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
