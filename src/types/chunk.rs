// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Chunks: contiguous half-open ranges of the shard-key space, each owned by
//! exactly one node, versioned per collection.

use crate::types::shard_key::{ShardKey, ShardKeyPattern};
use crate::types::NodeId;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Per-collection chunk version.
///
/// Strictly increasing across every mutation of the collection's ownership
/// map: the major component bumps when a chunk moves between nodes, the
/// minor component on donor-side reshuffles.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChunkVersion {
    /// Bumped on cross-node ownership moves.
    pub major: u64,
    /// Bumped on donor-side reshuffles.
    pub minor: u64,
}

impl ChunkVersion {
    /// A version with the given components.
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// The zero version, ordered below every set version.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Whether this version has ever been set.
    pub fn is_set(&self) -> bool {
        *self != Self::zero()
    }

    /// The next major version: `(major + 1, 0)`.
    pub fn inc_major(&self) -> Self {
        Self::new(self.major + 1, 0)
    }

    /// The next minor version: `(major, minor + 1)`.
    pub fn inc_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1)
    }
}

impl Display for ChunkVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.major, self.minor)
    }
}

/// A half-open `[min, max)` interval over a collection's shard-key space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// Inclusive lower bound.
    pub min: ShardKey,
    /// Exclusive upper bound.
    pub max: ShardKey,
}

impl ChunkRange {
    /// A range with the given bounds.
    pub fn new(min: ShardKey, max: ShardKey) -> Self {
        Self { min, max }
    }

    /// The range covering the whole key space of `pattern`.
    pub fn full(pattern: &ShardKeyPattern) -> Self {
        Self::new(pattern.global_min(), pattern.global_max())
    }

    /// Whether `key` falls within this range under `pattern`'s order.
    pub fn contains(&self, key: &ShardKey, pattern: &ShardKeyPattern) -> bool {
        pattern.key_in_range(key, &self.min, &self.max)
    }
}

impl Display for ChunkRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{} -> {})", self.min, self.max)
    }
}

/// Identifier of a chunk record in the config store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub String);

impl Display for ChunkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChunkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One chunk record, as persisted in the config store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Record id.
    pub id: ChunkId,
    /// The collection namespace this chunk belongs to.
    pub ns: String,
    /// The chunk's key range.
    pub range: ChunkRange,
    /// The owning node.
    pub shard: NodeId,
    /// Last modification version; the maximum across a collection's records
    /// is the collection version.
    pub lastmod: ChunkVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_order_is_major_then_minor() {
        assert!(ChunkVersion::new(2, 0) > ChunkVersion::new(1, 9));
        assert!(ChunkVersion::new(2, 1) > ChunkVersion::new(2, 0));
        assert!(ChunkVersion::new(1, 0) > ChunkVersion::zero());
    }

    #[test]
    fn bumps() {
        let v = ChunkVersion::new(3, 7);
        assert_eq!(v.inc_major(), ChunkVersion::new(4, 0));
        assert_eq!(v.inc_minor(), ChunkVersion::new(3, 8));
    }
}
