//! Bucketed range-hash structure over `{id, head}` leaves.
//!
//! Every id maps to a 64-bit key (the first eight bytes of its SHA-256). A
//! leaf's fingerprint is the hash of its id and head, and the aggregate of a
//! range is the XOR of the fingerprints inside it, so it can be maintained
//! incrementally and does not depend on insertion order.
//!
//! The key domain is cut into `2^bucket_bits` equal buckets, each caching its
//! own aggregate and count. A range query reads whole buckets from the cache
//! and only scans the leaves of the (at most two) buckets it cuts through.

use std::collections::BTreeMap;
use std::ops::Bound;

use sha2::{Digest, Sha256};
use spacesync_primitives::Hash;
use spacesync_sync_primitives::{Element, Range, RangeResult};

pub const MAX_BUCKET_BITS: u8 = 16;

/// Position of `id` in the key domain.
#[must_use]
pub fn key_of(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());

    let mut prefix = [0; 8];
    prefix.copy_from_slice(&digest[..8]);

    u64::from_be_bytes(prefix)
}

fn fingerprint(id: &str, head: &Hash) -> Hash {
    Hash::of_parts([id.as_bytes(), &head.as_bytes()[..]])
}

#[derive(Debug, Default)]
struct Bucket {
    leaves: BTreeMap<(u64, String), Hash>,
    hash: Hash,
}

#[derive(Debug)]
pub struct RangeDiff {
    shift: u32,
    buckets: Vec<Bucket>,
    hash: Hash,
    len: usize,
}

impl RangeDiff {
    /// `bucket_bits` is clamped to `1..=MAX_BUCKET_BITS`.
    #[must_use]
    pub fn new(bucket_bits: u8) -> Self {
        let bits = bucket_bits.clamp(1, MAX_BUCKET_BITS);

        Self {
            shift: 64 - u32::from(bits),
            buckets: (0..1_usize << bits).map(|_| Bucket::default()).collect(),
            hash: Hash::ZERO,
            len: 0,
        }
    }

    /// Upserts a leaf. Returns the head it replaced, if any.
    pub fn set(&mut self, id: &str, head: Hash) -> Option<Hash> {
        let key = key_of(id);
        let index = self.bucket_index(key);
        let bucket = &mut self.buckets[index];

        let previous = bucket.leaves.insert((key, id.to_owned()), head);

        match previous {
            Some(previous) if previous == head => return Some(previous),
            Some(previous) => {
                let stale = fingerprint(id, &previous);
                bucket.hash ^= stale;
                self.hash ^= stale;
            }
            None => self.len += 1,
        }

        let fresh = fingerprint(id, &head);
        bucket.hash ^= fresh;
        self.hash ^= fresh;

        previous
    }

    #[must_use]
    pub fn element(&self, id: &str) -> Option<Hash> {
        let key = key_of(id);

        self.buckets[self.bucket_index(key)]
            .leaves
            .get(&(key, id.to_owned()))
            .copied()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Aggregate over the whole key domain.
    #[must_use]
    pub const fn hash(&self) -> Hash {
        self.hash
    }

    #[must_use]
    pub fn ranges(&self, ranges: &[Range]) -> Vec<RangeResult> {
        let mut results = Vec::with_capacity(ranges.len());
        self.ranges_into(ranges, &mut results);
        results
    }

    /// Answers `ranges` in order, appending one result per range to `results`.
    pub fn ranges_into(&self, ranges: &[Range], results: &mut Vec<RangeResult>) {
        results.extend(ranges.iter().map(|range| self.range(range)));
    }

    fn range(&self, range: &Range) -> RangeResult {
        if range.from > range.to || self.len == 0 {
            return RangeResult::empty();
        }

        let first = self.bucket_index(range.from);
        let last = self.bucket_index(range.to);

        let mut hash = Hash::ZERO;
        let mut count = 0_usize;

        for index in first..=last {
            let bucket = &self.buckets[index];

            if bucket.leaves.is_empty() {
                continue;
            }

            if self.covers(range, index) {
                hash ^= bucket.hash;
                count += bucket.leaves.len();
                continue;
            }

            for ((_, id), head) in Self::scan(bucket, range) {
                hash ^= fingerprint(id, head);
                count += 1;
            }
        }

        let elements = if count > 0 && count <= range.limit as usize {
            (first..=last)
                .flat_map(|index| Self::scan(&self.buckets[index], range))
                .map(|((_, id), head)| Element {
                    id: id.clone(),
                    head: *head,
                })
                .collect()
        } else {
            Vec::new()
        };

        RangeResult {
            hash,
            count: u32::try_from(count).unwrap_or(u32::MAX),
            elements,
        }
    }

    fn scan<'a>(
        bucket: &'a Bucket,
        range: &Range,
    ) -> impl Iterator<Item = (&'a (u64, String), &'a Hash)> + 'a {
        let to = range.to;

        bucket
            .leaves
            .range((Bound::Included((range.from, String::new())), Bound::Unbounded))
            .take_while(move |((key, _), _)| *key <= to)
    }

    fn covers(&self, range: &Range, index: usize) -> bool {
        let start = (index as u64) << self.shift;
        let end = start | (u64::MAX >> (64 - self.shift));

        range.from <= start && end <= range.to
    }

    #[expect(clippy::cast_possible_truncation, reason = "at most MAX_BUCKET_BITS wide")]
    const fn bucket_index(&self, key: u64) -> usize {
        (key >> self.shift) as usize
    }
}
