// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The recipient side of a migration: a single-slot state machine driven by
//! the donor's control commands and a worker task that pulls the data.
//!
//! `ready -> clone -> catchup -> steady -> commitStart -> done`, with `fail`
//! and `abort` terminal. Steady state does not mean the buffer is empty, only
//! that it drains faster than it fills; the final flush happens under the
//! donor's critical section, when nothing can fill it any more.

use crate::dbs::WriteOrigin;
use crate::messaging::{
    Error as ErrorMsg, MigrateCounts, MigratePhase, MigrationCmd, MigrationRsp, ModBatch,
    RecipientStatus,
};
use crate::node::error::{Error, Result};
use crate::node::timing::MoveTiming;
use crate::node::Node;
use crate::types::log_markers::LogMarker;
use crate::types::{ChunkRange, NodeId, ShardKeyPattern};

use backoff::{backoff::Backoff, ExponentialBackoff};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug, Clone)]
struct RecipientState {
    active: bool,
    phase: MigratePhase,
    ns: String,
    from: NodeId,
    range: ChunkRange,
    pattern: ShardKeyPattern,
    counts: MigrateCounts,
    errmsg: Option<String>,
}

/// The recipient's single-slot migration record. At most one receive is in
/// flight per node; terminal state stays queryable until the next receive.
#[derive(Debug, Default)]
pub(crate) struct RecipientSlot {
    state: Mutex<Option<RecipientState>>,
}

impl RecipientSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RecipientState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Occupy the slot for a new receive. Fails while a worker is running.
    pub(crate) fn prepare(
        &self,
        ns: &str,
        from: NodeId,
        range: ChunkRange,
        pattern: ShardKeyPattern,
    ) -> Result<()> {
        let mut guard = self.lock();
        if guard.as_ref().map(|state| state.active).unwrap_or(false) {
            return Err(Error::MigrationActive);
        }
        *guard = Some(RecipientState {
            active: true,
            phase: MigratePhase::Ready,
            ns: ns.to_string(),
            from,
            range,
            pattern,
            counts: MigrateCounts::default(),
            errmsg: None,
        });
        Ok(())
    }

    pub(crate) fn phase(&self) -> Option<MigratePhase> {
        self.lock().as_ref().map(|state| state.phase)
    }

    fn set_phase(&self, phase: MigratePhase) {
        if let Some(state) = self.lock().as_mut() {
            state.phase = phase;
        }
    }

    fn fail(&self, errmsg: String) {
        if let Some(state) = self.lock().as_mut() {
            state.phase = MigratePhase::Fail;
            state.errmsg = Some(errmsg);
        }
    }

    fn deactivate(&self) {
        if let Some(state) = self.lock().as_mut() {
            state.active = false;
        }
    }

    /// Flip to abort. The worker notices between operations.
    pub(crate) fn abort(&self) -> Option<MigratePhase> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(state) => {
                state.phase = MigratePhase::Abort;
                state.errmsg = Some("aborted".to_string());
                Some(state.phase)
            }
            None => None,
        }
    }

    fn add_cloned(&self, docs: u64, bytes: u64) {
        if let Some(state) = self.lock().as_mut() {
            state.counts.cloned += docs;
            state.counts.cloned_bytes += bytes;
        }
    }

    fn add_catchup(&self, mutations: u64) {
        if let Some(state) = self.lock().as_mut() {
            state.counts.catchup += mutations;
        }
    }

    fn add_steady(&self, mutations: u64) {
        if let Some(state) = self.lock().as_mut() {
            state.counts.steady += mutations;
        }
    }

    /// Snapshot for `_recvChunkStatus`.
    pub(crate) fn status(&self) -> Option<RecipientStatus> {
        self.lock().as_ref().map(|state| RecipientStatus {
            active: state.active,
            ns: state.ns.clone(),
            from: state.from.clone(),
            range: state.range.clone(),
            state: state.phase,
            counts: state.counts,
            errmsg: state.errmsg.clone(),
        })
    }

    fn details(&self) -> Option<(String, NodeId, ChunkRange, ShardKeyPattern)> {
        self.lock().as_ref().map(|state| {
            (
                state.ns.clone(),
                state.from.clone(),
                state.range.clone(),
                state.pattern.clone(),
            )
        })
    }
}

impl Node {
    /// Handle `_recvChunkStart`: occupy the slot and dispatch the worker.
    pub(crate) fn start_receive(
        self: Arc<Self>,
        ns: &str,
        from: NodeId,
        range: ChunkRange,
        pattern: ShardKeyPattern,
    ) -> Result<()> {
        info!(
            "{:?}: receiving chunk {} of {} from {}",
            LogMarker::ReceiveChunkStarted,
            range,
            ns,
            from,
        );
        self.recipient().prepare(ns, from, range, pattern)?;

        let _ = tokio::spawn(async move {
            migrate_worker(self).await;
        });
        Ok(())
    }

    /// Handle `_recvChunkCommit`: stop taking deltas and wait for the final
    /// flush to finish.
    pub(crate) async fn start_commit(&self) -> (MigratePhase, bool) {
        {
            let mut guard = self.recipient().lock();
            match guard.as_mut() {
                Some(state) if state.phase == MigratePhase::Steady => {
                    state.phase = MigratePhase::CommitStart;
                }
                Some(state) => return (state.phase, false),
                None => return (MigratePhase::Fail, false),
            }
        }

        let deadline = Instant::now() + self.config().commit_wait;
        while Instant::now() < deadline {
            sleep(Duration::from_millis(1)).await;
            match self.recipient().phase() {
                Some(MigratePhase::Done) => return (MigratePhase::Done, true),
                Some(phase) if phase.is_terminal() => return (phase, false),
                _ => {}
            }
        }
        warn!("startCommit never finished");
        let phase = self.recipient().phase().unwrap_or(MigratePhase::Fail);
        (phase, false)
    }
}

/// The worker task: runs the receive to a terminal state and reports it.
async fn migrate_worker(node: Arc<Node>) {
    let (ns, range) = match node.recipient().details() {
        Some((ns, _, range, _)) => (ns, range),
        None => return,
    };
    let mut timing = MoveTiming::new("to", &ns, &range);

    match receive_chunk(&node, &mut timing).await {
        Ok(()) => match node.recipient().phase() {
            Some(MigratePhase::Abort) => {
                timing.note("aborted");
                info!("{:?}: receive aborted", LogMarker::MigrationAborted);
            }
            _ => {
                node.recipient().set_phase(MigratePhase::Done);
                info!("{:?}: receive complete", LogMarker::ReceiveChunkDone);
            }
        },
        Err(error) => {
            error!("{:?}: migrate failed: {}", LogMarker::ReceiveChunkFailed, error);
            node.recipient().fail(error.to_string());
        }
    }

    node.recipient().deactivate();
    timing.commit(node.config_store().as_ref()).await;
}

async fn receive_chunk(node: &Arc<Node>, timing: &mut MoveTiming) -> Result<()> {
    let (ns, from, range, pattern) = node
        .recipient()
        .details()
        .ok_or(Error::NoActiveMigration)?;

    // just test the connection
    let _ = request(node, &from, MigrationCmd::Ping).await?;

    // 1. copy indexes from the donor
    let indexes = match request(node, &from, MigrationCmd::ListIndexes { ns: ns.clone() }).await? {
        MigrationRsp::Indexes(indexes) => indexes,
        other => return Err(unexpected("_listIndexes", &from, other)),
    };
    for spec in indexes {
        node.store().ensure_index(&ns, spec).await?;
    }
    timing.done(1);

    // 2. delete any data already in range, left over from an aborted earlier
    // attempt
    let saver = node.paranoia_saver(&ns, "pre-cleanup");
    let removed = node
        .store()
        .remove_range(&ns, &range, &pattern, WriteOrigin::Replication, saver.as_ref())
        .await?;
    if removed > 0 {
        warn!(
            "{:?}: deleted {} documents already in {} of {}",
            LogMarker::PreExistingRangeDataRemoved,
            removed,
            range,
            ns,
        );
    }
    timing.done(2);

    // 3. initial bulk clone
    node.recipient().set_phase(MigratePhase::Clone);
    loop {
        if aborted(node) {
            return Ok(());
        }
        let (objects, _size) = match request(node, &from, MigrationCmd::MigrateClone).await? {
            MigrationRsp::CloneBatch { objects, size } => (objects, size),
            other => return Err(unexpected("_migrateClone", &from, other)),
        };
        if objects.is_empty() {
            break;
        }
        let mut batch_bytes = 0u64;
        let batch_len = objects.len() as u64;
        for doc in objects {
            batch_bytes += doc.byte_size() as u64;
            node.store()
                .upsert(&ns, doc, WriteOrigin::Replication)
                .await?;
        }
        node.recipient().add_cloned(batch_len, batch_bytes);
    }
    info!("{:?}: bulk clone of {} finished", LogMarker::BulkCloneComplete, ns);
    timing.done(3);

    // 4. do the bulk of the buffered mods
    node.recipient().set_phase(MigratePhase::Catchup);
    loop {
        if aborted(node) {
            return Ok(());
        }
        let batch = match request(node, &from, MigrationCmd::TransferMods).await? {
            MigrationRsp::Mods(batch) => batch,
            other => return Err(unexpected("_transferMods", &from, other)),
        };
        if batch.size == 0 {
            break;
        }
        let applied = apply_mods(node, &ns, &range, &pattern, batch).await?;
        node.recipient().add_catchup(applied);
    }
    info!("{:?}: catchup on {} finished", LogMarker::CatchupComplete, ns);
    timing.done(4);

    // 5. keep pace with the buffer until the donor commits; the commit flip
    // happens in `start_commit`, we just keep draining
    node.recipient().set_phase(MigratePhase::Steady);
    let commit_deadline = Instant::now() + node.config().commit_wait;
    loop {
        let phase = match node.recipient().phase() {
            Some(phase) => phase,
            None => return Err(Error::NoActiveMigration),
        };
        match phase {
            MigratePhase::Abort => return Ok(()),
            MigratePhase::Steady | MigratePhase::CommitStart => {}
            other => {
                return Err(Error::PeerFailed {
                    cmd: "_transferMods",
                    peer: from.clone(),
                    cause: ErrorMsg::Internal(format!("unexpected phase {}", other)),
                })
            }
        }

        let batch = match request(node, &from, MigrationCmd::TransferMods).await? {
            MigrationRsp::Mods(batch) => batch,
            other => return Err(unexpected("_transferMods", &from, other)),
        };
        if batch.size > 0 {
            let applied = apply_mods(node, &ns, &range, &pattern, batch).await?;
            node.recipient().add_steady(applied);
            continue;
        }

        if phase == MigratePhase::CommitStart {
            break;
        }
        if Instant::now() >= commit_deadline {
            return Err(Error::Timeout("commit"));
        }
        sleep(node.config().steady_drain_interval).await;
    }
    timing.done(5);

    Ok(())
}

/// Apply one `_transferMods` batch: deletes first, then re-uploads. Returns
/// the number of mutations applied.
async fn apply_mods(
    node: &Arc<Node>,
    ns: &str,
    range: &ChunkRange,
    pattern: &ShardKeyPattern,
    batch: ModBatch,
) -> Result<u64> {
    let mut applied = 0u64;

    let saver = node.paranoia_saver(ns, "removed-during");
    for id in batch.deleted {
        // do not apply deletes that do not belong to the migrating range
        if let Some(current) = node.store().find_by_id(ns, &id).await? {
            if !pattern.in_range(&current, &range.min, &range.max) {
                info!("not applying out of range deletion: {}", id);
                continue;
            }
        }
        let _ = node
            .store()
            .delete_by_id(ns, &id, WriteOrigin::Replication, saver.as_ref())
            .await?;
        applied += 1;
    }

    for doc in batch.reload {
        node.store()
            .upsert(ns, doc, WriteOrigin::Replication)
            .await?;
        applied += 1;
    }

    Ok(applied)
}

fn aborted(node: &Arc<Node>) -> bool {
    matches!(node.recipient().phase(), Some(MigratePhase::Abort))
}

/// Issue `cmd` at the donor, retrying transient transport failures with the
/// usual backoff. A structured failure from the peer is returned as an error
/// immediately; it will not get better by asking again.
async fn request(node: &Arc<Node>, to: &NodeId, cmd: MigrationCmd) -> Result<MigrationRsp> {
    let cmd_name = cmd.name();
    let mut backoff = ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(30)),
        ..ExponentialBackoff::default()
    };
    loop {
        match node.peers().send(to, cmd.clone()).await {
            Ok(MigrationRsp::Failure(cause)) => {
                return Err(Error::PeerFailed {
                    cmd: cmd_name,
                    peer: to.clone(),
                    cause,
                })
            }
            Ok(rsp) => return Ok(rsp),
            Err(error) => match backoff.next_backoff() {
                Some(wait) => {
                    warn!("{} to {} failed ({}), retrying", cmd_name, to, error);
                    sleep(wait).await;
                }
                None => return Err(error.into()),
            },
        }
    }
}

fn unexpected(cmd: &'static str, peer: &NodeId, rsp: MigrationRsp) -> Error {
    Error::PeerFailed {
        cmd,
        peer: peer.clone(),
        cause: ErrorMsg::Internal(format!("unexpected response: {:?}", rsp)),
    }
}
