//! Range queries over a hashed key domain.
//!
//! Keys are 64-bit; a [`Range`] is inclusive on both ends. Answering a range
//! yields its aggregate hash and element count, plus the elements themselves
//! when the count is small enough for the caller to stop recursing.

use borsh::{BorshDeserialize, BorshSerialize};
use spacesync_primitives::Hash;

#[derive(Clone, Copy, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Range {
    pub from: u64,
    pub to: u64,
    pub limit: u32,
}

impl Range {
    /// The entire key domain with a limit of one: the "are we in sync" probe.
    pub const WHOLE: Self = Self {
        from: 0,
        to: u64::MAX,
        limit: 1,
    };

    #[must_use]
    pub const fn new(from: u64, to: u64, limit: u32) -> Self {
        Self { from, to, limit }
    }

    #[must_use]
    pub const fn contains(&self, key: u64) -> bool {
        self.from <= key && key <= self.to
    }

    #[must_use]
    pub const fn is_whole(&self) -> bool {
        self.from == 0 && self.to == u64::MAX
    }

    /// Splits the range into two halves, or returns `None` for a single key.
    #[must_use]
    pub const fn split(&self) -> Option<(Self, Self)> {
        if self.from >= self.to {
            return None;
        }

        let mid = self.from + (self.to - self.from) / 2;

        Some((
            Self::new(self.from, mid, self.limit),
            Self::new(mid + 1, self.to, self.limit),
        ))
    }
}

/// An `{id, head}` leaf returned in place of an aggregate.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, BorshSerialize, BorshDeserialize)]
pub struct Element {
    pub id: String,
    pub head: Hash,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct RangeResult {
    pub hash: Hash,
    pub count: u32,
    pub elements: Vec<Element>,
}

impl RangeResult {
    /// The result for a range with nothing in it.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            hash: Hash::ZERO,
            count: 0,
            elements: Vec::new(),
        }
    }
}

/// How a range result set was produced.
///
/// A `Precalculated` answer carries the partition-wide hash cached ahead of
/// time instead of a freshly computed range; it has no elements even when
/// the count is one, and comparison logic must not treat it as a leaf.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum DiffType {
    #[default]
    Initial,
    Precalculated,
}
