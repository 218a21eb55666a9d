// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The donor side of a migration: the `moveChunk` driver and the data
//! commands it serves to the pulling recipient.
//!
//! The driver runs seven ordered phases; any failure unwinds whatever the
//! earlier phases set up before returning. Ownership linearises at exactly
//! one point: the conditional update of the donated chunk record in the
//! config store. Everything before it is undoable, everything after it is
//! cleanup.

use crate::config_store::{Error as ConfigError, LockToken};
use crate::messaging::{MigrateCounts, MigratePhase, MigrationCmd, MigrationRsp, ModBatch, MoveChunk};
use crate::node::error::{Error, Result};
use crate::node::timing::MoveTiming;
use crate::node::Node;
use crate::types::log_markers::LogMarker;
use crate::types::{ChunkRecord, ChunkVersion, Document, NodeId};

use serde_json::json;
use std::sync::Arc;
use tokio::time::sleep;

/// Per-document overhead assumed when sizing a clone batch against the
/// payload cap. Consumers must not depend on observed batch sizes.
const CLONE_ITEM_OVERHEAD: u64 = 64;

/// How many clone ids to take off the slot per store round trip.
const CLONE_FETCH_CHUNK: usize = 64;

impl Node {
    /// Move one chunk of `ns` to another node, while client writes continue.
    ///
    /// Returns the version the donated chunk record was committed at. On
    /// failure nothing has moved: local ownership, the recipient and the
    /// config store are unwound to where they started.
    pub async fn move_chunk(self: Arc<Self>, req: MoveChunk) -> Result<ChunkVersion> {
        // 1. check the options
        if req.ns.is_empty() {
            return Err(Error::InvalidArgument("ns"));
        }
        if req.range.min.0.is_empty() {
            return Err(Error::InvalidArgument("min"));
        }
        if req.range.max.0.is_empty() {
            return Err(Error::InvalidArgument("max"));
        }
        if req.from.0.is_empty() {
            return Err(Error::InvalidArgument("from"));
        }
        if req.to.0.is_empty() {
            return Err(Error::InvalidArgument("to"));
        }
        if req.chunk_id.0.is_empty() {
            return Err(Error::InvalidArgument("chunkId"));
        }
        if self.is_interrupted() {
            return Err(Error::Interrupted);
        }
        info!(
            "{:?}: received moveChunk request {} {} -> {}, range {}",
            LogMarker::MoveChunkRequestReceived,
            req.ns,
            req.from,
            req.to,
            req.range,
        );

        let mut timing =
            MoveTiming::new("from", &req.ns, &req.range).with_endpoints(&req.from, &req.to);
        timing.done(1);

        // 2. take the collection's distributed lock; everything up to the
        // final cleanup happens under it
        let holder = format!("migrate-{}", req.range.min);
        let lock = match self
            .config_store()
            .acquire_lock(&req.ns, &holder, self.config().lock_lease)
            .await
        {
            Ok(lock) => lock,
            Err(ConfigError::LockBusy { holder, .. }) => {
                return Err(Error::LockBusy { holder });
            }
            Err(error) => return Err(error.into()),
        };

        let result = self
            .clone()
            .move_chunk_locked(&req, &lock, &mut timing)
            .await;

        if let Err(error) = self.config_store().release_lock(&lock).await {
            warn!("couldn't release the lock on {}: {}", req.ns, error);
        }
        if let Err(error) = &result {
            timing.note(&error.to_string());
        }
        timing.commit(self.config_store().as_ref()).await;

        result
    }

    async fn move_chunk_locked(
        self: Arc<Self>,
        req: &MoveChunk,
        lock: &LockToken,
        timing: &mut MoveTiming,
    ) -> Result<ChunkVersion> {
        // 2. (cont.) make sure our view is complete and current
        let chunk = self.config_store().chunk(&req.chunk_id).await?;
        if chunk.range != req.range {
            return Err(Error::StaleBounds {
                curr: chunk.range,
                requested: req.range.clone(),
            });
        }
        if chunk.shard != req.from {
            return Err(Error::NotOwner {
                claimed: req.from.clone(),
                official: chunk.shard,
            });
        }
        let max_version = self.config_store().collection_version(&req.ns).await?;
        let local = self.versions().get_version(&req.ns);
        if max_version < local {
            // resync and bail; the caller refreshes and retries
            let _ = self
                .versions()
                .try_set_version(&req.ns, self.id(), self.config_store().as_ref())
                .await;
            return Err(Error::OwnershipInconsistency {
                local,
                official: max_version,
            });
        }
        let shard_version = self
            .versions()
            .try_set_version(&req.ns, self.id(), self.config_store().as_ref())
            .await?;
        let pattern = self.config_store().shard_key_pattern(&req.ns).await?;
        info!(
            "{:?}: moveChunk request accepted at version {}",
            LogMarker::MoveChunkRequestAccepted,
            shard_version,
        );
        if let Err(error) = self
            .config_store()
            .log_change(
                "moveChunk.start",
                &req.ns,
                json!({
                    "min": req.range.min.to_string(),
                    "max": req.range.max.to_string(),
                    "from": req.from.to_string(),
                    "to": req.to.to_string(),
                }),
            )
            .await
        {
            warn!("couldn't append moveChunk.start to the changelog: {}", error);
        }
        timing.done(2);

        // 3..5 run with the donor slot occupied; unwind it on any failure
        self.donor().start(&req.ns, req.range.clone(), pattern.clone())?;
        let result = self
            .clone()
            .run_transfer(req, &chunk, max_version, lock, timing)
            .await;
        self.donor().done();
        let version = result?;

        // 6. wait for cursors opened before the handoff, then remove the
        // donated data; callers don't wait for either
        let cleanup = crate::node::cleanup::OldDataCleanup {
            ns: req.ns.clone(),
            range: req.range.clone(),
            initial_cursors: self.cursors().find(&req.ns),
        };
        if cleanup.initial_cursors.is_empty() {
            debug!("doing delete inline");
            // 7. remove the data locally
            if let Err(error) = cleanup.do_remove(&self).await {
                error!("error cleaning old data on {}: {}", req.ns, error);
            }
        } else {
            debug!("forking for cleaning up chunk data");
            let node = self.clone();
            let _ = tokio::spawn(async move {
                cleanup.run(node).await;
            });
        }
        timing.done(6);

        Ok(version)
    }

    /// Phases 3 to 5: snapshot, recipient hand-holding, critical section and
    /// the ownership commit. The donor slot is occupied throughout.
    async fn run_transfer(
        self: Arc<Self>,
        req: &MoveChunk,
        chunk: &ChunkRecord,
        max_version: ChunkVersion,
        lock: &LockToken,
        timing: &mut MoveTiming,
    ) -> Result<ChunkVersion> {
        let ns = &req.ns;
        let pattern = self.config_store().shard_key_pattern(ns).await?;

        // 3. snapshot the range, then open the recipient. The snapshot is
        // taken under the collection's read lock; anything written after it
        // reaches the recipient through the tap buffers instead.
        let ids = self.store().scan_range(ns, &req.range, &pattern).await?;
        info!(
            "{:?}: moveChunk number of documents: {}",
            LogMarker::SnapshotTakenForMigration,
            ids.len(),
        );
        self.donor().store_clone_locs(ids)?;

        let start = MigrationCmd::RecvChunkStart {
            ns: ns.clone(),
            from: req.from.clone(),
            range: req.range.clone(),
            pattern: pattern.clone(),
        };
        match self.peers().send(&req.to, start).await? {
            MigrationRsp::Started => {}
            MigrationRsp::Failure(cause) => {
                return Err(Error::PeerFailed {
                    cmd: "_recvChunkStart",
                    peer: req.to.clone(),
                    cause,
                });
            }
            other => return Err(unexpected("_recvChunkStart", &req.to, other)),
        }
        timing.done(3);

        // 4. pause till the migrate has caught up
        let mut counts = MigrateCounts::default();
        let mut steady = false;
        for _ in 0..self.config().max_status_polls {
            sleep(self.config().status_poll_interval).await;
            if self.is_interrupted() {
                self.abort_recipient(&req.to).await;
                return Err(Error::Interrupted);
            }

            let status = match self.peers().send(&req.to, MigrationCmd::RecvChunkStatus).await {
                Ok(MigrationRsp::Status(status)) => status,
                Ok(MigrationRsp::Failure(cause)) => {
                    return Err(Error::PeerFailed {
                        cmd: "_recvChunkStatus",
                        peer: req.to.clone(),
                        cause,
                    });
                }
                Ok(other) => return Err(unexpected("_recvChunkStatus", &req.to, other)),
                Err(error) => {
                    self.abort_recipient(&req.to).await;
                    return Err(error.into());
                }
            };
            debug!(
                "_recvChunkStatus: {:?} {:?}, my mem used: {}",
                status.state,
                status.counts,
                self.donor().bytes_buffered(),
            );

            match status.state {
                MigratePhase::Fail | MigratePhase::Abort => {
                    return Err(Error::PeerFailed {
                        cmd: "_recvChunkStatus",
                        peer: req.to.clone(),
                        cause: crate::messaging::Error::Internal(
                            status.errmsg.unwrap_or_else(|| "migrate failed".to_string()),
                        ),
                    });
                }
                MigratePhase::Steady => {
                    counts = status.counts;
                    steady = true;
                    break;
                }
                _ => {}
            }

            let bytes_buffered = self.donor().bytes_buffered();
            if bytes_buffered > self.config().max_buffer_bytes {
                // too much memory for one move; abort and advise a split
                self.abort_recipient(&req.to).await;
                error!(
                    "{:?}: aborting migrate because too much memory used, {} bytes",
                    LogMarker::MigrationAborted,
                    bytes_buffered,
                );
                return Err(Error::TooMuchMemory { bytes_buffered });
            }
        }
        if !steady {
            self.abort_recipient(&req.to).await;
            return Err(Error::Timeout("the migrate to reach steady state"));
        }
        info!(
            "{:?}: recipient steady after cloning {} documents",
            LogMarker::RecipientSteady,
            counts.cloned,
        );
        timing.done(4);

        // 5. the critical section: new client writes to the range bounce to
        // the router from here on; what is already committed drains through
        // the tap while the recipient flushes
        self.donor().set_critical_section(true);
        info!("{:?}: {} range {}", LogMarker::CriticalSectionEntered, ns, req.range);

        let my_version = max_version.inc_major();
        self.versions().donate_chunk(ns, &req.range, my_version);
        info!(
            "{:?}: moveChunk setting version to {}",
            LogMarker::ChunkDonated,
            my_version,
        );

        // 5.b tell the recipient to flush and finish; undo the donation if
        // it cannot
        let commit_failed = |cause| Error::PeerFailed {
            cmd: "_recvChunkCommit",
            peer: req.to.clone(),
            cause,
        };
        let commit = self.peers().send(&req.to, MigrationCmd::RecvChunkCommit).await;
        match commit {
            Ok(MigrationRsp::CommitAck { state, ok }) if ok => {
                debug!("moveChunk commit result: {}", state);
            }
            Ok(MigrationRsp::CommitAck { state, .. }) => {
                self.undo_donation(ns, req, max_version);
                return Err(commit_failed(crate::messaging::Error::Internal(format!(
                    "recipient finished in state {}",
                    state
                ))));
            }
            Ok(MigrationRsp::Failure(cause)) => {
                self.undo_donation(ns, req, max_version);
                return Err(commit_failed(cause));
            }
            Ok(other) => {
                self.undo_donation(ns, req, max_version);
                return Err(unexpected("_recvChunkCommit", &req.to, other));
            }
            Err(error) => {
                self.undo_donation(ns, req, max_version);
                return Err(error.into());
            }
        }

        // 5.c the ownership commit. The lease could have run out while we
        // were waiting; re-verify before touching the config store.
        match self.config_store().still_held(lock).await {
            Ok(true) => {}
            _ => {
                self.undo_donation(ns, req, max_version);
                return Err(Error::LockLost);
            }
        }
        if let Err(error) = self
            .config_store()
            .update_chunk(&chunk.id, chunk.lastmod, req.to.clone(), my_version)
            .await
        {
            // nothing was written; ownership is still ours
            self.undo_donation(ns, req, max_version);
            return Err(error.into());
        }

        // ownership has moved; everything from here is best effort
        match self.config_store().chunks_for_shard(ns, self.id()).await {
            Ok(remaining) if !remaining.is_empty() => {
                // bump one stay-behind chunk so this node also advertises a
                // version newer than anything the routers saw pre-migration
                let top = &remaining[0];
                let bumped = my_version.inc_minor();
                match self
                    .config_store()
                    .update_chunk(&top.id, top.lastmod, self.id().clone(), bumped)
                    .await
                {
                    Ok(()) => {
                        self.versions().set_version(ns, bumped);
                        debug!("moveChunk updating self to {} through {}", bumped, top.id);
                    }
                    Err(error) => {
                        warn!("couldn't bump the stay-behind chunk version: {}", error);
                    }
                }
            }
            Ok(_) => debug!("moveChunk: no chunks left for collection {}", ns),
            Err(error) => warn!("couldn't list the stay-behind chunks: {}", error),
        }

        // 5.d log the handoff
        if let Err(error) = self
            .config_store()
            .log_change(
                "moveChunk.commit",
                ns,
                json!({
                    "min": req.range.min.to_string(),
                    "max": req.range.max.to_string(),
                    "from": req.from.to_string(),
                    "to": req.to.to_string(),
                    "version": my_version.to_string(),
                }),
            )
            .await
        {
            warn!("couldn't append moveChunk.commit to the changelog: {}", error);
        }
        info!(
            "{:?}: {} range {} now owned by {} at {}",
            LogMarker::MoveChunkCommitted,
            ns,
            req.range,
            req.to,
            my_version,
        );
        self.donor().set_critical_section(false);
        timing.done(5);

        Ok(my_version)
    }

    fn undo_donation(&self, ns: &str, req: &MoveChunk, old_version: ChunkVersion) {
        self.versions().undo_donate(ns, &req.range, old_version);
        self.donor().set_critical_section(false);
        warn!(
            "{:?}: resetting shard version of {} to {}",
            LogMarker::ChunkDonationUndone,
            ns,
            old_version,
        );
    }

    async fn abort_recipient(&self, to: &NodeId) {
        match self.peers().send(to, MigrationCmd::RecvChunkAbort).await {
            Ok(rsp) => debug!("_recvChunkAbort result: {:?}", rsp),
            Err(error) => warn!("couldn't abort the recipient on {}: {}", to, error),
        }
    }

    /// Serve one `_migrateClone` pull: the next batch of whole documents
    /// from the clone snapshot, sized under the batch cap. An empty batch
    /// means the snapshot is drained.
    pub(crate) async fn bulk_clone(&self) -> Result<(Vec<Document>, u64)> {
        let ns = self.donor().active_ns()?;
        let cap = self.config().clone_batch_bytes;
        let mut objects = vec![];
        let mut size = 0u64;

        'filling: loop {
            let ids = self.donor().take_clone_locs(CLONE_FETCH_CHUNK)?;
            if ids.is_empty() {
                break;
            }
            let mut iter = ids.into_iter();
            while let Some(id) = iter.next() {
                match self.store().find_by_id(&ns, &id).await? {
                    Some(doc) => {
                        let doc_bytes = doc.byte_size() as u64 + CLONE_ITEM_OVERHEAD;
                        if !objects.is_empty() && size + doc_bytes > cap {
                            // no room; put the rest back for the next pull
                            let mut leftover = vec![id];
                            leftover.extend(iter);
                            self.donor().return_clone_locs(leftover);
                            break 'filling;
                        }
                        size += doc_bytes;
                        objects.push(doc);
                    }
                    // deleted while waiting to be cloned; the tap recorded
                    // the delete already
                    None => {}
                }
            }
        }

        Ok((objects, size))
    }

    /// Serve one `_transferMods` pull: buffered deletes first, then current
    /// documents for buffered reload ids. `size == 0` means the buffers were
    /// empty.
    pub(crate) async fn transfer_mods(&self) -> Result<ModBatch> {
        let (ns, range, pattern) = self.donor().range_and_pattern()?;
        let (deleted, reload_ids, mut size) = self
            .donor()
            .drain_deltas(self.config().mods_batch_bytes)?;

        let mut reload = vec![];
        for id in reload_ids {
            match self.store().find_by_id(&ns, &id).await? {
                Some(doc) if pattern.in_range(&doc, &range.min, &range.max) => {
                    size += doc.byte_size() as u64;
                    reload.push(doc);
                }
                // vanished or no longer in range; if a delete did it, the
                // deleted list carries it separately
                _ => {}
            }
        }

        Ok(ModBatch {
            deleted,
            reload,
            size,
        })
    }
}

fn unexpected(cmd: &'static str, peer: &NodeId, rsp: MigrationRsp) -> Error {
    Error::PeerFailed {
        cmd,
        peer: peer.clone(),
        cause: crate::messaging::Error::Internal(format!("unexpected response: {:?}", rsp)),
    }
}
