// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-collection chunk-version tracking: what this node believes it owns,
//! at what version, and whether an incoming write is still ours to take.

use crate::config_store::ConfigStore;
use crate::node::error::Result;
use crate::types::{ChunkRange, ChunkVersion, NodeId, ShardKey, ShardKeyPattern};

use dashmap::DashMap;

/// Outcome of checking an incoming write against the ownership map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCheck {
    /// This node owns the key; the write may proceed.
    Ok,
    /// The key belongs to a chunk this node no longer owns. The router must
    /// refresh its map; the carried version is what this node advertises.
    StaleConfig(ChunkVersion),
    /// This node owns no chunk of the collection at all.
    NotOwner,
}

#[derive(Debug, Default)]
struct CollectionVersionState {
    version: ChunkVersion,
    owned: Vec<ChunkRange>,
}

/// Tracks `(version, owned ranges)` per collection.
///
/// Collections this node has never been told about are not tracked; writes to
/// them pass the check, since an unsharded collection has no ownership map to
/// consult.
#[derive(Debug, Default)]
pub struct VersionManager {
    collections: DashMap<String, CollectionVersionState>,
}

impl VersionManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// This node's version for `ns`. Zero when untracked.
    pub fn get_version(&self, ns: &str) -> ChunkVersion {
        self.collections
            .get(ns)
            .map(|state| state.version)
            .unwrap_or_else(ChunkVersion::zero)
    }

    /// Refresh version and owned ranges from the config store. Returns the
    /// refreshed version.
    pub async fn try_set_version(
        &self,
        ns: &str,
        me: &NodeId,
        config: &dyn ConfigStore,
    ) -> Result<ChunkVersion> {
        let records = config.chunks_for_shard(ns, me).await?;
        let version = records
            .iter()
            .map(|record| record.lastmod)
            .max()
            .unwrap_or_else(ChunkVersion::zero);
        let owned = records.into_iter().map(|record| record.range).collect();

        let mut state = self.collections.entry(ns.to_string()).or_default();
        state.version = version;
        state.owned = owned;
        debug!("refreshed {:?} to version {}", ns, version);

        Ok(version)
    }

    /// Remove `[min, max)` from the owned set, atomically with bumping the
    /// stored version to `new_version`.
    pub fn donate_chunk(&self, ns: &str, range: &ChunkRange, new_version: ChunkVersion) {
        let mut state = self.collections.entry(ns.to_string()).or_default();
        state.owned.retain(|owned| owned != range);
        state.version = new_version;
    }

    /// Restore a donated range and the pre-donation version. Exact inverse
    /// of [`Self::donate_chunk`].
    pub fn undo_donate(&self, ns: &str, range: &ChunkRange, old_version: ChunkVersion) {
        let mut state = self.collections.entry(ns.to_string()).or_default();
        if !state.owned.contains(range) {
            state.owned.push(range.clone());
        }
        state.version = old_version;
    }

    /// Overwrite the stored version, leaving the owned set alone.
    pub fn set_version(&self, ns: &str, version: ChunkVersion) {
        let mut state = self.collections.entry(ns.to_string()).or_default();
        state.version = version;
    }

    /// Check whether this node may take a write for `key`.
    pub fn check_write(
        &self,
        ns: &str,
        key: &ShardKey,
        pattern: &ShardKeyPattern,
    ) -> WriteCheck {
        match self.collections.get(ns) {
            // untracked collection: nothing to refuse on
            None => WriteCheck::Ok,
            Some(state) => {
                if state.owned.iter().any(|range| range.contains(key, pattern)) {
                    WriteCheck::Ok
                } else if state.version.is_set() {
                    // we owned something once; the router's map is stale
                    WriteCheck::StaleConfig(state.version)
                } else {
                    WriteCheck::NotOwner
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::memory::MemoryConfigStore;
    use crate::types::{ChunkId, ChunkRecord, KeyValue};
    use eyre::Result;

    fn num_key(n: f64) -> ShardKey {
        ShardKey(vec![KeyValue::Number(n)])
    }

    fn range(min: f64, max: f64) -> ChunkRange {
        ChunkRange::new(num_key(min), num_key(max))
    }

    #[test]
    fn donate_and_undo_restore_state_exactly() {
        let versions = VersionManager::new();
        let pattern = ShardKeyPattern::ascending("x");
        let r = range(0.0, 100.0);
        versions.undo_donate("test.docs", &r, ChunkVersion::new(1, 0));

        let before_version = versions.get_version("test.docs");
        assert_eq!(
            versions.check_write("test.docs", &num_key(50.0), &pattern),
            WriteCheck::Ok
        );

        versions.donate_chunk("test.docs", &r, ChunkVersion::new(2, 0));
        assert_eq!(versions.get_version("test.docs"), ChunkVersion::new(2, 0));
        assert_eq!(
            versions.check_write("test.docs", &num_key(50.0), &pattern),
            WriteCheck::StaleConfig(ChunkVersion::new(2, 0))
        );

        versions.undo_donate("test.docs", &r, ChunkVersion::new(1, 0));
        assert_eq!(versions.get_version("test.docs"), before_version);
        assert_eq!(
            versions.check_write("test.docs", &num_key(50.0), &pattern),
            WriteCheck::Ok
        );
    }

    #[test]
    fn donated_range_turns_writes_stale() {
        let versions = VersionManager::new();
        let pattern = ShardKeyPattern::ascending("x");
        versions.undo_donate("test.docs", &range(0.0, 100.0), ChunkVersion::new(1, 0));
        versions.undo_donate("test.docs", &range(100.0, 200.0), ChunkVersion::new(1, 1));

        versions.donate_chunk("test.docs", &range(0.0, 100.0), ChunkVersion::new(2, 0));

        // the donated half bounces, the kept half still writes
        assert_eq!(
            versions.check_write("test.docs", &num_key(50.0), &pattern),
            WriteCheck::StaleConfig(ChunkVersion::new(2, 0))
        );
        assert_eq!(
            versions.check_write("test.docs", &num_key(150.0), &pattern),
            WriteCheck::Ok
        );
    }

    #[tokio::test]
    async fn refresh_pulls_owned_ranges_from_config() -> Result<()> {
        let config = MemoryConfigStore::new();
        let pattern = ShardKeyPattern::ascending("x");
        let me = NodeId::from("shard-a");
        config
            .insert_chunk(ChunkRecord {
                id: ChunkId::from("c1"),
                ns: "test.docs".to_string(),
                range: range(0.0, 100.0),
                shard: me.clone(),
                lastmod: ChunkVersion::new(3, 1),
            })
            .await?;
        config
            .insert_chunk(ChunkRecord {
                id: ChunkId::from("c2"),
                ns: "test.docs".to_string(),
                range: range(100.0, 200.0),
                shard: NodeId::from("shard-b"),
                lastmod: ChunkVersion::new(3, 0),
            })
            .await?;

        let versions = VersionManager::new();
        let v = versions.try_set_version("test.docs", &me, &config).await?;
        assert_eq!(v, ChunkVersion::new(3, 1));
        assert_eq!(
            versions.check_write("test.docs", &num_key(50.0), &pattern),
            WriteCheck::Ok
        );
        assert_eq!(
            versions.check_write("test.docs", &num_key(150.0), &pattern),
            WriteCheck::StaleConfig(ChunkVersion::new(3, 1))
        );

        // a node that owns nothing of the collection is not a stale owner,
        // it is no owner at all
        let empty = VersionManager::new();
        let _ = empty
            .try_set_version("test.docs", &NodeId::from("shard-c"), &config)
            .await?;
        assert_eq!(
            empty.check_write("test.docs", &num_key(50.0), &pattern),
            WriteCheck::NotOwner
        );
        Ok(())
    }
}
