// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! In-memory storage backend: one ordered map per collection behind a
//! `tokio::sync::RwLock`, with observer dispatch under the write guard.

use super::{
    CollectionRead, CollectionStore, Error, IndexSpec, RemoveSaver, Result, WriteKind, WriteOp,
    WriteObserver, WriteOrigin, WritePayload,
};
use crate::types::{ChunkRange, DocId, Document, ShardKeyPattern};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;

/// A single-process storage engine implementing [`CollectionStore`].
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, Arc<RwLock<CollectionData>>>,
    // read on every committed write, written only at node construction
    observers: StdRwLock<Vec<Arc<dyn WriteObserver>>>,
}

#[derive(Default)]
struct CollectionData {
    docs: BTreeMap<DocId, Document>,
    indexes: Vec<IndexSpec>,
}

impl CollectionRead for CollectionData {
    fn read_by_id(&self, id: &DocId) -> Option<Document> {
        self.docs.get(id).cloned()
    }
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, ns: &str) -> Arc<RwLock<CollectionData>> {
        self.collections
            .entry(ns.to_string())
            .or_insert_with(|| {
                let mut data = CollectionData::default();
                data.indexes.push(IndexSpec::id_index());
                Arc::new(RwLock::new(data))
            })
            .clone()
    }

    fn notify(&self, op: &WriteOp, coll: &CollectionData) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for observer in observers.iter() {
            observer.on_write(op, coll);
        }
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn find_by_id(&self, ns: &str, id: &DocId) -> Result<Option<Document>> {
        let coll = self.collection(ns);
        let data = coll.read().await;
        Ok(data.docs.get(id).cloned())
    }

    async fn scan_range(
        &self,
        ns: &str,
        range: &ChunkRange,
        pattern: &ShardKeyPattern,
    ) -> Result<Vec<DocId>> {
        let coll = self.collection(ns);
        let data = coll.read().await;

        let mut hits: Vec<_> = data
            .docs
            .iter()
            .filter_map(|(id, doc)| {
                let key = pattern.project(doc);
                range.contains(&key, pattern).then(|| (key, id.clone()))
            })
            .collect();
        // walk order is the shard-key index order
        hits.sort_by(|(a, _), (b, _)| pattern.compare(a, b));

        Ok(hits.into_iter().map(|(_, id)| id).collect())
    }

    async fn upsert(&self, ns: &str, doc: Document, origin: WriteOrigin) -> Result<()> {
        let id = doc.id().ok_or(Error::DocMissingId)?;
        let coll = self.collection(ns);
        let mut data = coll.write().await;

        let existed = data.docs.insert(id.clone(), doc.clone()).is_some();
        let op = if existed {
            WriteOp {
                kind: WriteKind::Update,
                ns: ns.to_string(),
                payload: WritePayload::Id(id),
                origin,
            }
        } else {
            WriteOp {
                kind: WriteKind::Insert,
                ns: ns.to_string(),
                payload: WritePayload::Doc(doc),
                origin,
            }
        };
        self.notify(&op, &data);

        Ok(())
    }

    async fn delete_by_id(
        &self,
        ns: &str,
        id: &DocId,
        origin: WriteOrigin,
        saver: Option<&RemoveSaver>,
    ) -> Result<bool> {
        let coll = self.collection(ns);
        let mut data = coll.write().await;

        let removed = match data.docs.remove(id) {
            Some(doc) => {
                if let Some(saver) = saver {
                    saver.going_to_delete(&doc)?;
                }
                true
            }
            None => false,
        };
        if removed {
            let op = WriteOp {
                kind: WriteKind::Delete,
                ns: ns.to_string(),
                payload: WritePayload::Id(id.clone()),
                origin,
            };
            self.notify(&op, &data);
        }

        Ok(removed)
    }

    async fn remove_range(
        &self,
        ns: &str,
        range: &ChunkRange,
        pattern: &ShardKeyPattern,
        origin: WriteOrigin,
        saver: Option<&RemoveSaver>,
    ) -> Result<u64> {
        let coll = self.collection(ns);
        let mut data = coll.write().await;

        let doomed: Vec<DocId> = data
            .docs
            .iter()
            .filter(|(_, doc)| range.contains(&pattern.project(doc), pattern))
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0u64;
        for id in doomed {
            if let Some(doc) = data.docs.remove(&id) {
                if let Some(saver) = saver {
                    saver.going_to_delete(&doc)?;
                }
                removed += 1;
                let op = WriteOp {
                    kind: WriteKind::Delete,
                    ns: ns.to_string(),
                    payload: WritePayload::Id(id),
                    origin,
                };
                self.notify(&op, &data);
            }
        }

        Ok(removed)
    }

    async fn count_range(
        &self,
        ns: &str,
        range: &ChunkRange,
        pattern: &ShardKeyPattern,
    ) -> Result<u64> {
        let coll = self.collection(ns);
        let data = coll.read().await;
        Ok(data
            .docs
            .values()
            .filter(|doc| range.contains(&pattern.project(doc), pattern))
            .count() as u64)
    }

    async fn count(&self, ns: &str) -> Result<u64> {
        let coll = self.collection(ns);
        let data = coll.read().await;
        Ok(data.docs.len() as u64)
    }

    async fn list_indexes(&self, ns: &str) -> Result<Vec<IndexSpec>> {
        let coll = self.collection(ns);
        let data = coll.read().await;
        Ok(data.indexes.clone())
    }

    async fn ensure_index(&self, ns: &str, spec: IndexSpec) -> Result<()> {
        let coll = self.collection(ns);
        let mut data = coll.write().await;
        if !data.indexes.iter().any(|existing| existing.name == spec.name) {
            data.indexes.push(spec);
        }
        Ok(())
    }

    fn register_observer(&self, observer: Arc<dyn WriteObserver>) {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.push(observer);
    }
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("collections", &self.collections.len())
            .finish()
    }
}
