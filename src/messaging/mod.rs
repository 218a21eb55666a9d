// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The typed commands and responses exchanged between routers, donors and
//! recipients during a chunk migration. Everything here is a plain
//! serialisable document: the transport underneath is whatever the deployment
//! provides.

mod errors;

pub use errors::Error;

use crate::node::writeback::WritebackNote;
use crate::types::{ChunkId, ChunkRange, DocId, Document, NodeId, ShardKeyPattern};

use serde::{Deserialize, Serialize};
use strum_macros::Display as StrumDisplay;

/// Request to move one chunk of `ns` from `from` to `to`. Issued by a router
/// or the balancer, handled by the donor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveChunk {
    /// Collection namespace.
    pub ns: String,
    /// The chunk's key range.
    pub range: ChunkRange,
    /// The donor (the caller's belief of the current owner).
    pub from: NodeId,
    /// The destination node.
    pub to: NodeId,
    /// Config-store id of the chunk record.
    pub chunk_id: ChunkId,
}

/// Commands of the migration protocol.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MigrationCmd {
    /// Router/balancer to donor: move a chunk.
    MoveChunk(MoveChunk),
    /// Donor to recipient: start receiving the given range.
    RecvChunkStart {
        /// Collection namespace.
        ns: String,
        /// The donor to pull data from.
        from: NodeId,
        /// The migrating range.
        range: ChunkRange,
        /// The collection's shard-key pattern.
        pattern: ShardKeyPattern,
    },
    /// Donor to recipient: report migration state and counts.
    RecvChunkStatus,
    /// Donor to recipient: stop accepting deltas and finish.
    RecvChunkCommit,
    /// Donor to recipient: abandon the migration.
    RecvChunkAbort,
    /// Recipient to donor: pull the next bulk-clone batch.
    MigrateClone,
    /// Recipient to donor: drain buffered mutations.
    TransferMods,
    /// Recipient to donor: list the collection's indexes.
    ListIndexes {
        /// Collection namespace.
        ns: String,
    },
    /// Router to node: drain captured writebacks for replay.
    FetchWritebacks,
    /// Connection sanity check.
    Ping,
}

impl MigrationCmd {
    /// Wire name of the command, used in peer-failure reports and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MoveChunk(_) => "moveChunk",
            Self::RecvChunkStart { .. } => "_recvChunkStart",
            Self::RecvChunkStatus => "_recvChunkStatus",
            Self::RecvChunkCommit => "_recvChunkCommit",
            Self::RecvChunkAbort => "_recvChunkAbort",
            Self::MigrateClone => "_migrateClone",
            Self::TransferMods => "_transferMods",
            Self::ListIndexes { .. } => "_listIndexes",
            Self::FetchWritebacks => "_fetchWritebacks",
            Self::Ping => "_ping",
        }
    }
}

/// Phase of the recipient state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay)]
#[strum(serialize_all = "mixed_case")]
pub enum MigratePhase {
    /// Start command received, worker dispatched.
    Ready,
    /// Bulk-cloning documents from the donor.
    Clone,
    /// Draining buffered mutations until the buffer first runs dry.
    Catchup,
    /// Keeping pace with the donor's buffer, waiting for commit.
    Steady,
    /// Commit received, draining the final deltas.
    CommitStart,
    /// Migration complete.
    Done,
    /// Terminal failure.
    Fail,
    /// Terminal abort.
    Abort,
}

impl MigratePhase {
    /// Whether the worker has exited.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Fail | Self::Abort)
    }
}

/// Progress counters reported by the recipient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateCounts {
    /// Documents applied during bulk clone.
    pub cloned: u64,
    /// Bytes applied during bulk clone.
    pub cloned_bytes: u64,
    /// Mutations applied during catchup.
    pub catchup: u64,
    /// Mutations applied during steady state.
    pub steady: u64,
}

/// Snapshot of the recipient state machine, returned by `_recvChunkStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientStatus {
    /// Whether the worker is still running.
    pub active: bool,
    /// Collection namespace.
    pub ns: String,
    /// The donor.
    pub from: NodeId,
    /// The migrating range.
    pub range: ChunkRange,
    /// Current phase.
    pub state: MigratePhase,
    /// Progress counters.
    pub counts: MigrateCounts,
    /// Failure cause, when `state` is `fail`.
    pub errmsg: Option<String>,
}

/// One `_transferMods` batch: deletes first, then documents to re-apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModBatch {
    /// Ids deleted on the donor during the migration.
    pub deleted: Vec<DocId>,
    /// Current full documents for ids that were inserted or updated.
    pub reload: Vec<Document>,
    /// Total payload bytes in this batch; zero means the buffer was empty.
    pub size: u64,
}

/// Responses of the migration protocol.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MigrationRsp {
    /// `moveChunk` succeeded; the chunk is now at this version.
    Moved {
        /// Version the donated chunk record was committed at.
        version: crate::types::ChunkVersion,
    },
    /// `_recvChunkStart` accepted; the worker is running.
    Started,
    /// `_recvChunkStatus` payload.
    Status(RecipientStatus),
    /// `_recvChunkCommit` outcome.
    CommitAck {
        /// Recipient phase after the commit attempt.
        state: MigratePhase,
        /// Whether the recipient reached `done`.
        ok: bool,
    },
    /// `_recvChunkAbort` acknowledged.
    AbortAck {
        /// Recipient phase after the abort.
        state: MigratePhase,
    },
    /// `_migrateClone` payload. An empty batch ends the clone phase.
    CloneBatch {
        /// Whole documents of the migrating range.
        objects: Vec<Document>,
        /// Total payload bytes in this batch.
        size: u64,
    },
    /// `_transferMods` payload.
    Mods(ModBatch),
    /// `_listIndexes` payload.
    Indexes(Vec<crate::dbs::IndexSpec>),
    /// `_fetchWritebacks` payload: captured writes to replay, in capture
    /// order.
    Writebacks(Vec<WritebackNote>),
    /// `_ping` reply.
    Pong,
    /// The command failed.
    Failure(Error),
}

impl MigrationRsp {
    /// The failure carried by this response, if it is one.
    pub fn failure(&self) -> Option<&Error> {
        match self {
            Self::Failure(error) => Some(error),
            _ => None,
        }
    }
}
