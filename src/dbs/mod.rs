// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The local storage engine seam.
//!
//! The migration core does not own a storage engine; it requires the small
//! contract expressed by [`CollectionStore`]: point reads by `_id`, range
//! scans by shard-key index, upserts, ranged deletes, index listing, and a
//! write-observer hookpoint invoked synchronously under the collection write
//! lock. The in-memory backend in [`memory`] implements the contract for
//! single-process deployments and tests.

pub mod cursors;
pub mod memory;
pub mod remove_saver;

mod errors;

pub use errors::{Error, Result};
pub use remove_saver::RemoveSaver;

use crate::types::{ChunkRange, DocId, Direction, Document, ShardKeyPattern};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// A document was created.
    Insert,
    /// An existing document was replaced.
    Update,
    /// A document was removed.
    Delete,
}

/// Who issued a write.
///
/// Migration-cleanup deletions must not feed back into a later migration's
/// delta buffer, so the origin is carried through the write call path and
/// tested by the tap, rather than inferred from thread identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A client write routed to this node.
    User,
    /// The deferred-cleanup worker removing donated data.
    Cleanup,
    /// A migration recipient applying cloned data or deltas.
    Replication,
}

/// The document-or-id payload reported for a write.
#[derive(Debug, Clone)]
pub enum WritePayload {
    /// Full document (inserts).
    Doc(Document),
    /// Document id (deletes, and the filter id of updates).
    Id(DocId),
}

/// One committed write, reported to observers under the collection write
/// lock, exactly once.
#[derive(Debug, Clone)]
pub struct WriteOp {
    /// What happened.
    pub kind: WriteKind,
    /// The collection written to.
    pub ns: String,
    /// The document (inserts) or id (updates, deletes).
    pub payload: WritePayload,
    /// Who issued the write.
    pub origin: WriteOrigin,
}

/// Read-only view of a collection, usable from inside a write observer while
/// the write lock is held.
pub trait CollectionRead {
    /// Point read by `_id`.
    fn read_by_id(&self, id: &DocId) -> Option<Document>;
}

/// Synchronous observer of committed writes. Invoked under the collection
/// write lock, so implementations must not block or re-enter the store.
pub trait WriteObserver: Send + Sync {
    /// Called once per committed write.
    fn on_write(&self, op: &WriteOp, coll: &dyn CollectionRead);
}

/// One index of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name.
    pub name: String,
    /// Indexed field paths and directions.
    pub key: Vec<(String, Direction)>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

impl IndexSpec {
    /// The implicit unique `_id` index every collection carries.
    pub fn id_index() -> Self {
        Self {
            name: "_id_".to_string(),
            key: vec![("_id".to_string(), Direction::Asc)],
            unique: true,
        }
    }
}

/// The storage engine contract required by the migration core.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Point read by `_id`.
    async fn find_by_id(&self, ns: &str, id: &DocId) -> Result<Option<Document>>;

    /// Ids of all documents whose shard key falls in `range`, in index
    /// order under `pattern`.
    async fn scan_range(
        &self,
        ns: &str,
        range: &ChunkRange,
        pattern: &ShardKeyPattern,
    ) -> Result<Vec<DocId>>;

    /// Insert or replace by `_id`.
    async fn upsert(&self, ns: &str, doc: Document, origin: WriteOrigin) -> Result<()>;

    /// Delete one document by `_id`. Returns whether anything was removed.
    /// When a saver is given, the removed document is side-copied first.
    async fn delete_by_id(
        &self,
        ns: &str,
        id: &DocId,
        origin: WriteOrigin,
        saver: Option<&RemoveSaver>,
    ) -> Result<bool>;

    /// Delete every document whose shard key falls in `range`. Returns the
    /// number removed.
    async fn remove_range(
        &self,
        ns: &str,
        range: &ChunkRange,
        pattern: &ShardKeyPattern,
        origin: WriteOrigin,
        saver: Option<&RemoveSaver>,
    ) -> Result<u64>;

    /// Number of documents whose shard key falls in `range`.
    async fn count_range(
        &self,
        ns: &str,
        range: &ChunkRange,
        pattern: &ShardKeyPattern,
    ) -> Result<u64>;

    /// Total number of documents in the collection.
    async fn count(&self, ns: &str) -> Result<u64>;

    /// The collection's indexes.
    async fn list_indexes(&self, ns: &str) -> Result<Vec<IndexSpec>>;

    /// Create `spec` if no index of that name exists yet.
    async fn ensure_index(&self, ns: &str, spec: IndexSpec) -> Result<()>;

    /// Register a write observer. Observers see every subsequent committed
    /// write on every collection of this store.
    fn register_observer(&self, observer: Arc<dyn WriteObserver>);
}
