// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The config store seam.
//!
//! The migration core coordinates ownership through a small, strongly
//! consistent metadata service holding one record per chunk, a changelog, and
//! a lease-based distributed lock per collection namespace. [`ConfigStore`]
//! is the contract; [`memory`] implements it in-process.

pub mod memory;

mod errors;

pub use errors::{Error, Result};

use crate::types::{ChunkId, ChunkRecord, ChunkVersion, NodeId, ShardKeyPattern};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Proof of holding a namespace lock. Lock operations take the token back so
/// that a holder whose lease expired (and was re-acquired by someone else)
/// cannot release or pass the newer holder's lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    /// The locked namespace.
    pub ns: String,
    /// Holder identity, surfaced to contenders.
    pub holder: String,
    /// Acquisition epoch, unique per successful acquire.
    pub epoch: u64,
}

/// One changelog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Event name, e.g. `moveChunk.commit`.
    pub event: String,
    /// Collection namespace.
    pub ns: String,
    /// Structured event details.
    pub details: Value,
}

/// The metadata service contract required by the migration core.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Register `ns` as sharded by `pattern`.
    async fn create_collection(&self, ns: &str, pattern: ShardKeyPattern) -> Result<()>;

    /// The shard-key pattern of `ns`.
    async fn shard_key_pattern(&self, ns: &str) -> Result<ShardKeyPattern>;

    /// Insert a chunk record.
    async fn insert_chunk(&self, record: ChunkRecord) -> Result<()>;

    /// Fetch a chunk record by id.
    async fn chunk(&self, id: &ChunkId) -> Result<ChunkRecord>;

    /// The highest `lastmod` across the collection's chunk records: the
    /// collection version.
    async fn collection_version(&self, ns: &str) -> Result<ChunkVersion>;

    /// All chunk records of `ns` owned by `shard`, ordered by descending
    /// `lastmod`.
    async fn chunks_for_shard(&self, ns: &str, shard: &NodeId) -> Result<Vec<ChunkRecord>>;

    /// Conditionally update a chunk record's owner and version. Fails with
    /// [`Error::StaleUpdate`] unless the record's `lastmod` still equals
    /// `expected`.
    async fn update_chunk(
        &self,
        id: &ChunkId,
        expected: ChunkVersion,
        shard: NodeId,
        lastmod: ChunkVersion,
    ) -> Result<()>;

    /// Append a changelog record.
    async fn log_change(&self, event: &str, ns: &str, details: Value) -> Result<()>;

    /// The changelog records for `ns`, in append order.
    async fn changelog(&self, ns: &str) -> Result<Vec<ChangeLogEntry>>;

    /// Acquire the namespace lock for `lease`, or fail with
    /// [`Error::LockBusy`] naming the current holder. A lock whose lease has
    /// expired counts as free.
    async fn acquire_lock(&self, ns: &str, holder: &str, lease: Duration) -> Result<LockToken>;

    /// Whether `token` still holds its lock (not released, expired, or taken
    /// over).
    async fn still_held(&self, token: &LockToken) -> Result<bool>;

    /// Release the lock held by `token`.
    async fn release_lock(&self, token: &LockToken) -> Result<()>;
}
