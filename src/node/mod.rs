// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The data-bearing node of the sharded store, as far as migrations are
//! concerned: command dispatch, the client write path with its ownership
//! gate, and the donor/recipient machinery.

/// Writeback capture of writes that arrived after ownership moved.
pub mod writeback;

mod cleanup;
mod config;
mod donor;
mod error;
mod recipient;
mod tap;
mod timing;
mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use version::{VersionManager, WriteCheck};

use self::error::convert_to_error_msg;
use self::recipient::RecipientSlot;
use self::tap::{DonorSlot, MutationTap};
use self::writeback::{WritebackOp, WritebackQueue};
use crate::comm::PeerChannel;
use crate::config_store::{ConfigStore, Error as ConfigError};
use crate::dbs::cursors::CursorRegistry;
use crate::dbs::{CollectionStore, RemoveSaver, WriteOrigin};
use crate::messaging::{MigrationCmd, MigrationRsp};
use crate::types::log_markers::LogMarker;
use crate::types::{ChunkVersion, DocId, Document, NodeId};

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One data-bearing node.
///
/// Owns the migration slots (at most one donation and one receive in flight
/// per node), the per-collection version map, and the seams to the local
/// store, the config store and the peer channel. RPC handlers and client
/// writes all come through here.
pub struct Node {
    id: NodeId,
    config: Config,
    store: Arc<dyn CollectionStore>,
    config_store: Arc<dyn ConfigStore>,
    peers: Arc<dyn PeerChannel>,
    versions: VersionManager,
    donor: DonorSlot,
    recipient: RecipientSlot,
    writebacks: WritebackQueue,
    cursors: Arc<CursorRegistry>,
    interrupted: AtomicBool,
}

impl Node {
    /// Construct a node and hook its mutation tap into the store.
    pub fn new(
        id: NodeId,
        config: Config,
        store: Arc<dyn CollectionStore>,
        config_store: Arc<dyn ConfigStore>,
        peers: Arc<dyn PeerChannel>,
    ) -> Arc<Self> {
        let donor = DonorSlot::new();
        store.register_observer(Arc::new(MutationTap::new(donor.clone())));

        Arc::new(Self {
            id,
            config,
            store,
            config_store,
            peers,
            versions: VersionManager::new(),
            donor,
            recipient: RecipientSlot::new(),
            writebacks: WritebackQueue::new(),
            cursors: Arc::new(CursorRegistry::new()),
            interrupted: AtomicBool::new(false),
        })
    }

    /// This node's identity.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The local storage engine.
    pub fn store(&self) -> &Arc<dyn CollectionStore> {
        &self.store
    }

    /// The config store handle.
    pub fn config_store(&self) -> &Arc<dyn ConfigStore> {
        &self.config_store
    }

    /// The client cursor registry.
    pub fn cursors(&self) -> &Arc<CursorRegistry> {
        &self.cursors
    }

    /// The per-collection version map.
    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    /// Migration tunables.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn peers(&self) -> &Arc<dyn PeerChannel> {
        &self.peers
    }

    pub(crate) fn donor(&self) -> &DonorSlot {
        &self.donor
    }

    pub(crate) fn recipient(&self) -> &RecipientSlot {
        &self.recipient
    }

    pub(crate) fn writebacks(&self) -> &WritebackQueue {
        &self.writebacks
    }

    pub(crate) fn paranoia_saver(&self, ns: &str, why: &str) -> Option<RemoveSaver> {
        cleanup::paranoia_saver(
            self.config.move_paranoia,
            &self.config.paranoia_dir,
            ns,
            why,
        )
    }

    /// Request cooperative cancellation of an in-flight donation. Checked at
    /// every poll boundary and phase transition.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Whether a donation is in flight on this node.
    pub fn migration_active(&self) -> bool {
        self.donor.is_active()
    }

    /// Refresh this node's version and owned ranges of `ns` from the config
    /// store.
    pub async fn refresh_version(&self, ns: &str) -> Result<ChunkVersion> {
        self.versions
            .try_set_version(ns, &self.id, self.config_store.as_ref())
            .await
    }

    /// Handle one protocol command, turning any internal error into a
    /// structured failure response.
    pub async fn handle_cmd(self: Arc<Self>, cmd: MigrationCmd) -> MigrationRsp {
        match self.dispatch(cmd).await {
            Ok(rsp) => rsp,
            Err(error) => MigrationRsp::Failure(convert_to_error_msg(error)),
        }
    }

    async fn dispatch(self: Arc<Self>, cmd: MigrationCmd) -> Result<MigrationRsp> {
        match cmd {
            MigrationCmd::MoveChunk(req) => {
                let version = self.clone().move_chunk(req).await?;
                Ok(MigrationRsp::Moved { version })
            }
            MigrationCmd::RecvChunkStart {
                ns,
                from,
                range,
                pattern,
            } => {
                self.start_receive(&ns, from, range, pattern)?;
                Ok(MigrationRsp::Started)
            }
            MigrationCmd::RecvChunkStatus => self
                .recipient
                .status()
                .map(MigrationRsp::Status)
                .ok_or(Error::NoActiveMigration),
            MigrationCmd::RecvChunkCommit => {
                let (state, ok) = self.start_commit().await;
                Ok(MigrationRsp::CommitAck { state, ok })
            }
            MigrationCmd::RecvChunkAbort => {
                let state = self.recipient.abort().ok_or(Error::NoActiveMigration)?;
                Ok(MigrationRsp::AbortAck { state })
            }
            MigrationCmd::MigrateClone => {
                let (objects, size) = self.bulk_clone().await?;
                Ok(MigrationRsp::CloneBatch { objects, size })
            }
            MigrationCmd::TransferMods => Ok(MigrationRsp::Mods(self.transfer_mods().await?)),
            MigrationCmd::ListIndexes { ns } => {
                Ok(MigrationRsp::Indexes(self.store.list_indexes(&ns).await?))
            }
            MigrationCmd::FetchWritebacks => {
                Ok(MigrationRsp::Writebacks(self.writebacks.drain()))
            }
            MigrationCmd::Ping => Ok(MigrationRsp::Pong),
        }
    }

    /// Client-facing upsert. Consults the ownership gate first; a write for
    /// a range this node has ceded is captured as a writeback and refused
    /// with the version the router needs to see.
    pub async fn client_upsert(&self, ns: &str, doc: Document) -> Result<()> {
        let pattern = match self.config_store.shard_key_pattern(ns).await {
            Ok(pattern) => pattern,
            // unsharded collection, nothing to gate on
            Err(ConfigError::CollectionNotFound(_)) => {
                return Ok(self.store.upsert(ns, doc, WriteOrigin::User).await?);
            }
            Err(error) => return Err(error.into()),
        };
        let key = pattern.project(&doc);

        self.gate_write(ns, &key, &pattern, || WritebackOp::Upsert(doc.clone()))?;
        self.store.upsert(ns, doc.clone(), WriteOrigin::User).await?;

        // ownership may have flipped while the write was in flight; if it
        // did, the final delta drain may already be over, so take the write
        // back out and hand it to the writeback queue instead
        if self.flipped_in_flight(ns, &key, &pattern) {
            if let Some(id) = doc.id() {
                let _ = self
                    .store
                    .delete_by_id(ns, &id, WriteOrigin::Cleanup, None)
                    .await;
            }
            let version = self.versions.get_version(ns);
            let wb = self.writebacks.capture(ns, WritebackOp::Upsert(doc));
            info!(
                "{:?}: in-flight write to {} captured as writeback {:x}",
                LogMarker::WritebackCaptured,
                ns,
                wb,
            );
            return Err(Error::StaleConfig { version });
        }
        Ok(())
    }

    /// Client-facing delete by id.
    pub async fn client_delete(&self, ns: &str, id: &DocId) -> Result<bool> {
        let pattern = match self.config_store.shard_key_pattern(ns).await {
            Ok(pattern) => pattern,
            Err(ConfigError::CollectionNotFound(_)) => {
                return Ok(self
                    .store
                    .delete_by_id(ns, id, WriteOrigin::User, None)
                    .await?);
            }
            Err(error) => return Err(error.into()),
        };

        let key = match self.store.find_by_id(ns, id).await? {
            Some(current) => {
                let key = pattern.project(&current);
                self.gate_write(ns, &key, &pattern, || WritebackOp::Delete(id.clone()))?;
                Some(key)
            }
            None => None,
        };
        let removed = self
            .store
            .delete_by_id(ns, id, WriteOrigin::User, None)
            .await?;

        // same in-flight check as for upserts: a delete that slipped past
        // the handoff must be replayed against the new owner
        if let Some(key) = key {
            if self.flipped_in_flight(ns, &key, &pattern) {
                let version = self.versions.get_version(ns);
                let wb = self.writebacks.capture(ns, WritebackOp::Delete(id.clone()));
                info!(
                    "{:?}: in-flight delete on {} captured as writeback {:x}",
                    LogMarker::WritebackCaptured,
                    ns,
                    wb,
                );
                return Err(Error::StaleConfig { version });
            }
        }
        Ok(removed)
    }

    /// Whether ownership of `key` moved away between a write passing the
    /// gate and its commit landing.
    fn flipped_in_flight(
        &self,
        ns: &str,
        key: &crate::types::ShardKey,
        pattern: &crate::types::ShardKeyPattern,
    ) -> bool {
        self.donor.refuses_write(ns, key)
            || matches!(
                self.versions.check_write(ns, key, pattern),
                WriteCheck::StaleConfig(_)
            )
    }

    fn gate_write(
        &self,
        ns: &str,
        key: &crate::types::ShardKey,
        pattern: &crate::types::ShardKeyPattern,
        op: impl FnOnce() -> WritebackOp,
    ) -> Result<()> {
        // the critical section refuses before the local donation lands
        if self.donor.refuses_write(ns, key) {
            let version = self.versions.get_version(ns);
            let wb = self.writebacks.capture(ns, op());
            info!(
                "{:?}: write to {} captured as writeback {:x}",
                LogMarker::WritebackCaptured,
                ns,
                wb,
            );
            return Err(Error::StaleConfig { version });
        }

        match self.versions.check_write(ns, key, pattern) {
            WriteCheck::Ok => Ok(()),
            WriteCheck::StaleConfig(version) => {
                let wb = self.writebacks.capture(ns, op());
                info!(
                    "{:?}: stale write to {} captured as writeback {:x}",
                    LogMarker::WriteRefusedStaleOwner,
                    ns,
                    wb,
                );
                Err(Error::StaleConfig { version })
            }
            WriteCheck::NotOwner => Err(Error::KeyNotOwned),
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("donating", &self.donor.is_active())
            .finish()
    }
}
