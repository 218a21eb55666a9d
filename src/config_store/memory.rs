// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! In-process config store for single-process deployments and tests.

use super::{ChangeLogEntry, ConfigStore, Error, LockToken, Result};
use crate::types::{ChunkId, ChunkRecord, ChunkVersion, NodeId, ShardKeyPattern};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A [`ConfigStore`] holding everything in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<String, ShardKeyPattern>,
    chunks: BTreeMap<ChunkId, ChunkRecord>,
    locks: BTreeMap<String, LockState>,
    changelog: Vec<ChangeLogEntry>,
    next_epoch: u64,
}

#[derive(Debug)]
struct LockState {
    holder: String,
    epoch: u64,
    expires_at: Instant,
}

impl MemoryConfigStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn live_lock(&self, ns: &str) -> Option<&LockState> {
        self.locks
            .get(ns)
            .filter(|state| state.expires_at > Instant::now())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn create_collection(&self, ns: &str, pattern: ShardKeyPattern) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let _ = inner.collections.insert(ns.to_string(), pattern);
        Ok(())
    }

    async fn shard_key_pattern(&self, ns: &str) -> Result<ShardKeyPattern> {
        let inner = self.inner.lock().await;
        inner
            .collections
            .get(ns)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(ns.to_string()))
    }

    async fn insert_chunk(&self, record: ChunkRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let _ = inner.chunks.insert(record.id.clone(), record);
        Ok(())
    }

    async fn chunk(&self, id: &ChunkId) -> Result<ChunkRecord> {
        let inner = self.inner.lock().await;
        inner
            .chunks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ChunkNotFound(id.clone()))
    }

    async fn collection_version(&self, ns: &str) -> Result<ChunkVersion> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chunks
            .values()
            .filter(|record| record.ns == ns)
            .map(|record| record.lastmod)
            .max()
            .unwrap_or_else(ChunkVersion::zero))
    }

    async fn chunks_for_shard(&self, ns: &str, shard: &NodeId) -> Result<Vec<ChunkRecord>> {
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner
            .chunks
            .values()
            .filter(|record| record.ns == ns && &record.shard == shard)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.lastmod.cmp(&a.lastmod));
        Ok(records)
    }

    async fn update_chunk(
        &self,
        id: &ChunkId,
        expected: ChunkVersion,
        shard: NodeId,
        lastmod: ChunkVersion,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .chunks
            .get_mut(id)
            .ok_or_else(|| Error::ChunkNotFound(id.clone()))?;
        if record.lastmod != expected {
            return Err(Error::StaleUpdate {
                expected,
                found: record.lastmod,
            });
        }
        record.shard = shard;
        record.lastmod = lastmod;
        Ok(())
    }

    async fn log_change(&self, event: &str, ns: &str, details: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.changelog.push(ChangeLogEntry {
            event: event.to_string(),
            ns: ns.to_string(),
            details,
        });
        Ok(())
    }

    async fn changelog(&self, ns: &str) -> Result<Vec<ChangeLogEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .changelog
            .iter()
            .filter(|entry| entry.ns == ns)
            .cloned()
            .collect())
    }

    async fn acquire_lock(&self, ns: &str, holder: &str, lease: Duration) -> Result<LockToken> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.live_lock(ns) {
            return Err(Error::LockBusy {
                ns: ns.to_string(),
                holder: state.holder.clone(),
            });
        }
        inner.next_epoch += 1;
        let epoch = inner.next_epoch;
        let _ = inner.locks.insert(
            ns.to_string(),
            LockState {
                holder: holder.to_string(),
                epoch,
                expires_at: Instant::now() + lease,
            },
        );
        Ok(LockToken {
            ns: ns.to_string(),
            holder: holder.to_string(),
            epoch,
        })
    }

    async fn still_held(&self, token: &LockToken) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .live_lock(&token.ns)
            .map(|state| state.epoch == token.epoch)
            .unwrap_or(false))
    }

    async fn release_lock(&self, token: &LockToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.locks.get(&token.ns) {
            Some(state) if state.epoch == token.epoch => {
                let _ = inner.locks.remove(&token.ns);
                Ok(())
            }
            _ => Err(Error::LockNotHeld {
                ns: token.ns.clone(),
            }),
        }
    }
}
