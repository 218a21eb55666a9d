// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::{ChunkId, ChunkVersion};

use thiserror::Error;

/// Specialisation of `std::Result` for the config store.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Config store error variants.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No chunk record with the given id.
    #[error("No such chunk record: {0}")]
    ChunkNotFound(ChunkId),
    /// No sharding metadata for the collection.
    #[error("Collection is not sharded: {0:?}")]
    CollectionNotFound(String),
    /// The namespace lock is held by someone else.
    #[error("Lock on {ns:?} is held by {holder:?}")]
    LockBusy {
        /// Locked namespace.
        ns: String,
        /// Identity of the current holder.
        holder: String,
    },
    /// A lock operation was attempted with a token that no longer holds the
    /// lock (released, expired, or taken over).
    #[error("Lock on {ns:?} is not held by this token")]
    LockNotHeld {
        /// Locked namespace.
        ns: String,
    },
    /// A conditional chunk update found a different version than expected.
    #[error("Chunk record moved on: expected lastmod {expected}, found {found}")]
    StaleUpdate {
        /// The version the caller expected.
        expected: ChunkVersion,
        /// The version actually recorded.
        found: ChunkVersion,
    },
    /// The store could not be reached.
    #[error("Config store unreachable: {0}")]
    Unreachable(String),
}
