// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Domain types of the sharded store.

/// Log markers for grep-able protocol milestones.
pub mod log_markers;

mod chunk;
mod document;
mod shard_key;

pub use chunk::{ChunkId, ChunkRange, ChunkRecord, ChunkVersion};
pub use document::{DocId, Document};
pub use shard_key::{Direction, KeyValue, ShardKey, ShardKeyPattern};

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Identity of a data-bearing node, as routers and the config store address
/// it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
pub(crate) fn doc(fields: &[(&str, serde_json::Value)]) -> Document {
    let mut map = serde_json::Map::new();
    for (name, value) in fields {
        let _ = map.insert((*name).to_string(), value.clone());
    }
    Document::from(map)
}
