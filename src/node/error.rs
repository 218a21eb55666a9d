// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::messaging::Error as ErrorMsg;
use crate::types::{ChunkRange, ChunkVersion, NodeId};

use thiserror::Error;

/// The type returned by the migration core's methods.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal error.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required command field was missing or malformed.
    #[error("need to specify {0} in command")]
    InvalidArgument(&'static str),
    /// The collection's distributed metadata lock is taken.
    #[error("the collection's metadata lock is taken by {holder}")]
    LockBusy {
        /// Identity of the current holder.
        holder: String,
    },
    /// The lock lease was lost before the ownership commit.
    #[error("the collection's metadata lock lease was lost before commit")]
    LockLost,
    /// The requested bounds disagree with the config store.
    #[error("chunk boundaries are outdated (likely a split occurred)")]
    StaleBounds {
        /// Bounds recorded in the config store.
        curr: ChunkRange,
        /// Bounds the caller asked for.
        requested: ChunkRange,
    },
    /// The declared owner disagrees with the config store.
    #[error("out of date: config store says {official} owns the chunk, not {claimed}")]
    NotOwner {
        /// Owner declared by the caller.
        claimed: NodeId,
        /// Owner recorded in the config store.
        official: NodeId,
    },
    /// The local ownership belief was ahead of the config store.
    #[error("official version {official} less than local {local}?")]
    OwnershipInconsistency {
        /// Local collection version.
        local: ChunkVersion,
        /// Version recorded in the config store.
        official: ChunkVersion,
    },
    /// A command issued at a peer returned a failure.
    #[error("{cmd} failed on {peer}: {cause}")]
    PeerFailed {
        /// The command that failed.
        cmd: &'static str,
        /// The peer it was sent to.
        peer: NodeId,
        /// The peer's error, verbatim.
        cause: ErrorMsg,
    },
    /// The donor's delta buffer exceeded its ceiling.
    #[error("aborting migrate because too much memory used ({bytes_buffered} bytes)")]
    TooMuchMemory {
        /// Bytes buffered when the ceiling was hit.
        bytes_buffered: u64,
    },
    /// A polling loop exhausted its ceiling.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// Cooperative cancellation.
    #[error("operation interrupted")]
    Interrupted,
    /// A migration slot on this node is already occupied.
    #[error("migrate already in progress")]
    MigrationActive,
    /// A data-transfer command arrived with no migration in progress.
    #[error("no active migration")]
    NoActiveMigration,
    /// A write arrived for a range this node no longer owns; the router
    /// should refresh and retry elsewhere.
    #[error("stale config: this node's collection version is {version}")]
    StaleConfig {
        /// This node's current collection version.
        version: ChunkVersion,
    },
    /// A write arrived for a key this node has never owned.
    #[error("this node owns no chunk containing the key")]
    KeyNotOwned,
    /// Peer channel error.
    #[error("Peer channel error: {0}")]
    Comm(#[from] crate::comm::Error),
    /// Storage engine error.
    #[error("Database error:: {0}")]
    Database(#[from] crate::dbs::Error),
    /// Config store error.
    #[error("Config store error:: {0}")]
    ConfigStore(#[from] crate::config_store::Error),
    /// JSON serialisation error.
    #[error("JSON serialisation error:: {0}")]
    JsonSerialisation(#[from] serde_json::Error),
}

/// Convert an internal error into its wire form, preserving structure where
/// the caller can act on it.
pub(crate) fn convert_to_error_msg(error: Error) -> ErrorMsg {
    match error {
        Error::InvalidArgument(field) => ErrorMsg::InvalidArgument {
            field: field.to_string(),
        },
        Error::LockBusy { holder } => ErrorMsg::LockBusy { holder },
        Error::LockLost => ErrorMsg::LockLost,
        Error::StaleBounds { curr, requested } => ErrorMsg::StaleBounds { curr, requested },
        Error::NotOwner { claimed, official } => ErrorMsg::NotOwner { claimed, official },
        Error::OwnershipInconsistency { local, official } => {
            ErrorMsg::OwnershipInconsistency { local, official }
        }
        Error::PeerFailed { cmd, peer, cause } => ErrorMsg::PeerFailed {
            cmd: cmd.to_string(),
            peer,
            cause: Box::new(cause),
        },
        Error::TooMuchMemory { bytes_buffered } => ErrorMsg::TooMuchMemory { bytes_buffered },
        Error::Timeout(waiting_for) => ErrorMsg::Timeout {
            waiting_for: waiting_for.to_string(),
        },
        Error::Interrupted => ErrorMsg::Interrupted,
        Error::MigrationActive => ErrorMsg::MigrationActive,
        Error::NoActiveMigration => ErrorMsg::NoActiveMigration,
        Error::StaleConfig { version } => ErrorMsg::StaleConfig { version },
        Error::Comm(error) => match error {
            crate::comm::Error::UnknownPeer(peer) => ErrorMsg::PeerUnreachable {
                peer,
                reason: "unknown peer".to_string(),
            },
            crate::comm::Error::FailedSend(peer, reason) => {
                ErrorMsg::PeerUnreachable { peer, reason }
            }
            other => ErrorMsg::Internal(format!("{:?}", other)),
        },
        other => ErrorMsg::Internal(format!("Failed to perform operation: {:?}", other)),
    }
}
