// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::{ChunkRange, ChunkVersion, NodeId};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured failure carried in a command response.
///
/// Peers embed each other's errors as `cause`, so a `moveChunk` caller can
/// see exactly what the recipient reported. A caller that observes
/// [`Error::split_advised`] should split the chunk before retrying the move.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Error {
    /// A required command field was missing or malformed.
    #[error("need to specify {field} in command")]
    InvalidArgument {
        /// Name of the offending field.
        field: String,
    },
    /// The caller's chunk bounds disagree with the config store, most likely
    /// because a split happened since the caller refreshed.
    #[error("chunk boundaries are outdated (likely a split occurred)")]
    StaleBounds {
        /// Bounds currently recorded in the config store.
        curr: ChunkRange,
        /// Bounds the caller asked for.
        requested: ChunkRange,
    },
    /// The declared owner disagrees with the config store.
    #[error("out of date: config store says {official} owns the chunk, not {claimed}")]
    NotOwner {
        /// Owner as declared by the caller.
        claimed: NodeId,
        /// Owner as recorded in the config store.
        official: NodeId,
    },
    /// The collection's distributed metadata lock is held elsewhere.
    #[error("the collection's metadata lock is taken by {holder}")]
    LockBusy {
        /// Identity of the current holder.
        holder: String,
    },
    /// The distributed lock lease was lost before the ownership commit.
    #[error("the collection's metadata lock lease was lost before commit")]
    LockLost,
    /// A command issued to a peer returned a failure.
    #[error("{cmd} failed on {peer}")]
    PeerFailed {
        /// The command that failed.
        cmd: String,
        /// The peer it was sent to.
        peer: NodeId,
        /// The peer's own error, verbatim.
        cause: Box<Error>,
    },
    /// A peer could not be reached at all.
    #[error("could not reach {peer}: {reason}")]
    PeerUnreachable {
        /// The unreachable peer.
        peer: NodeId,
        /// Transport-level reason.
        reason: String,
    },
    /// The donor's delta buffer exceeded its ceiling.
    #[error("aborting migrate because too much memory used")]
    TooMuchMemory {
        /// Bytes buffered when the ceiling was hit.
        bytes_buffered: u64,
    },
    /// A polling loop exhausted its ceiling.
    #[error("timed out waiting for {waiting_for}")]
    Timeout {
        /// What the loop was waiting for.
        waiting_for: String,
    },
    /// The operation was cooperatively cancelled.
    #[error("operation interrupted")]
    Interrupted,
    /// The node's local ownership belief was ahead of the config store.
    #[error("official version {official} less than local {local}?")]
    OwnershipInconsistency {
        /// The node's local collection version.
        local: ChunkVersion,
        /// The version recorded in the config store.
        official: ChunkVersion,
    },
    /// A write was routed to a node that no longer owns the key. The router
    /// should refresh its ownership map and retry elsewhere.
    #[error("stale config: this node's collection version is {version}")]
    StaleConfig {
        /// The refusing node's current collection version.
        version: ChunkVersion,
    },
    /// A migration slot is already occupied on this node.
    #[error("migrate already in progress")]
    MigrationActive,
    /// A data-transfer command arrived with no migration in progress.
    #[error("no active migration")]
    NoActiveMigration,
    /// Catch-all for unexpected internal failures.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure advises the caller to split the chunk before
    /// retrying.
    pub fn split_advised(&self) -> bool {
        matches!(self, Self::TooMuchMemory { .. })
    }
}
