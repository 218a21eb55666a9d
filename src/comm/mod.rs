// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The request/reply seam between nodes.
//!
//! The migration core issues typed commands at peers and expects typed
//! responses back; the transport underneath is the deployment's business.
//! [`LoopbackMesh`] dispatches in-process, for single-process deployments and
//! tests.

use crate::messaging::{MigrationCmd, MigrationRsp};
use crate::node::Node;
use crate::types::NodeId;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Specialisation of `std::Result` for the peer channel.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transport-level failure of a single request. Recoverable: the protocol
/// retries or unwinds, it never wedges on a failed send.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No route to the peer.
    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),
    /// The request could not be delivered.
    #[error("Failed to send to {0}: {1}")]
    FailedSend(NodeId, String),
}

/// Typed request/reply channel to peer nodes.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Send `cmd` to `to` and await its response.
    async fn send(&self, to: &NodeId, cmd: MigrationCmd) -> Result<MigrationRsp>;
}

/// An in-process mesh of nodes, keyed by node id.
#[derive(Default)]
pub struct LoopbackMesh {
    nodes: RwLock<BTreeMap<NodeId, Arc<Node>>>,
}

impl LoopbackMesh {
    /// An empty mesh.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `node` reachable under its id.
    pub fn register(&self, node: Arc<Node>) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let _ = nodes.insert(node.id().clone(), node);
    }
}

#[async_trait]
impl PeerChannel for LoopbackMesh {
    async fn send(&self, to: &NodeId, cmd: MigrationCmd) -> Result<MigrationRsp> {
        let node = {
            let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
            nodes
                .get(to)
                .cloned()
                .ok_or_else(|| Error::UnknownPeer(to.clone()))?
        };
        trace!("loopback {} -> {}", cmd.name(), to);
        Ok(node.handle_cmd(cmd).await)
    }
}

impl Debug for LoopbackMesh {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("LoopbackMesh")
            .field("nodes", &nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}
