#[cfg(test)]
#[path = "tests/hash.rs"]
mod tests;

use core::ops::{BitXor, BitXorAssign, Deref};
use std::fmt;
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const BYTES_LEN: usize = 32;

/// A SHA-256 digest.
///
/// Used both as a space's head (the summary of its persisted state) and as
/// the fingerprint of range-diff elements, where aggregates are built with XOR.
#[derive(
    Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, BorshSerialize, BorshDeserialize,
)]
pub struct Hash {
    bytes: [u8; BYTES_LEN],
}

impl Hash {
    /// The all-zero hash. Also the aggregate of an empty set.
    pub const ZERO: Self = Self {
        bytes: [0; BYTES_LEN],
    };

    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self {
            bytes: Sha256::digest(data).into(),
        }
    }

    /// Hashes several byte strings as one message, each prefixed with its length
    /// so that `["ab", "c"]` and `["a", "bc"]` produce different digests.
    #[must_use]
    pub fn of_parts<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = Sha256::default();

        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }

        Self {
            bytes: hasher.finalize().into(),
        }
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BYTES_LEN] {
        &self.bytes
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.bytes == [0; BYTES_LEN]
    }

    #[must_use]
    pub fn to_bs58(&self) -> String {
        bs58::encode(&self.bytes).into_string()
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; BYTES_LEN] = slice.try_into().map_err(|_| Error::InvalidLength)?;

        Ok(Self { bytes })
    }
}

impl From<[u8; BYTES_LEN]> for Hash {
    fn from(bytes: [u8; BYTES_LEN]) -> Self {
        Self { bytes }
    }
}

impl From<Hash> for [u8; BYTES_LEN] {
    fn from(hash: Hash) -> Self {
        hash.bytes
    }
}

impl Deref for Hash {
    type Target = [u8; BYTES_LEN];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl BitXorAssign for Hash {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.bytes.iter_mut().zip(rhs.bytes.iter()) {
            *a ^= b;
        }
    }
}

impl BitXor for Hash {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self::Output {
        self ^= rhs;
        self
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.to_bs58())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_bs58()).finish()
    }
}

#[derive(Clone, Copy, Debug, Error)]
pub enum Error {
    #[error("invalid hash length")]
    InvalidLength,

    #[error("invalid base58")]
    DecodeError(#[from] bs58::decode::Error),
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; BYTES_LEN];

        match bs58::decode(s).onto(&mut bytes) {
            Ok(len) if len == BYTES_LEN => Ok(Self { bytes }),
            Ok(_) => Err(Error::InvalidLength),
            Err(bs58::decode::Error::BufferTooSmall) => Err(Error::InvalidLength),
            Err(err) => Err(Error::DecodeError(err)),
        }
    }
}

impl serde::Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_bs58())
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HashVisitor;

        impl serde::de::Visitor<'_> for HashVisitor {
            type Value = Hash;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a base58 encoded hash")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match Hash::from_str(v) {
                    Ok(hash) => Ok(hash),
                    Err(Error::InvalidLength) => Err(E::invalid_length(v.len(), &self)),
                    Err(err) => Err(E::custom(err)),
                }
            }
        }

        deserializer.deserialize_str(HashVisitor)
    }
}
