// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Deferred cleanup of donated data.
//!
//! Once ownership has moved, the donor's copy of the range is garbage, but
//! client cursors opened before the handoff may still be walking it. Cleanup
//! waits for those cursors to close (with a ceiling), then range-deletes the
//! donated data with the cleanup write origin, which the mutation tap
//! suppresses so a parallel migration's buffer is never polluted.

use crate::dbs::cursors::CursorId;
use crate::dbs::{RemoveSaver, WriteOrigin};
use crate::node::error::Result;
use crate::node::Node;
use crate::types::log_markers::LogMarker;
use crate::types::ChunkRange;

use itertools::Itertools;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;

/// One pending cleanup of a donated range.
#[derive(Debug)]
pub(crate) struct OldDataCleanup {
    pub(crate) ns: String,
    pub(crate) range: ChunkRange,
    /// Cursors open on the collection when ownership ceded. Cleanup waits
    /// until none of them remains open; cursors opened later see the
    /// post-migration ownership and are irrelevant.
    pub(crate) initial_cursors: BTreeSet<CursorId>,
}

impl OldDataCleanup {
    /// Wait out the initial cursors, then delete the range. Errors are
    /// logged, never surfaced: cleanup is off the critical path, and a
    /// missed delete just leaves data the next migration removes.
    pub(crate) async fn run(self, node: Arc<Node>) {
        info!(
            "{:?}: waiting to cleanup {} from {}, # cursors remaining: {}",
            LogMarker::CleanupWaitingOnCursors,
            self.ns,
            self.range,
            self.initial_cursors.len(),
        );

        let deadline = Instant::now() + node.config().cursor_wait;
        let mut remaining = self.initial_cursors.clone();
        let mut loops = 0u64;
        while !remaining.is_empty() {
            if Instant::now() >= deadline {
                warn!(
                    "cursors still open on {} after the cleanup ceiling, removing anyway: {}",
                    self.ns,
                    remaining.iter().join(" "),
                );
                break;
            }
            sleep(node.config().cursor_poll_interval).await;

            let now_open = node.cursors().find(&self.ns);
            remaining = remaining.intersection(&now_open).copied().collect();

            loops += 1;
            if loops % 200 == 0 {
                info!(
                    "(looping {}) waiting to cleanup {} from {}, # cursors remaining: {}",
                    loops,
                    self.ns,
                    self.range,
                    remaining.len(),
                );
            }
        }

        if let Err(error) = self.do_remove(&node).await {
            error!("error cleaning old data on {}: {}", self.ns, error);
        }
    }

    /// The ranged delete itself. Idempotent: re-running it over an already
    /// empty range removes nothing.
    pub(crate) async fn do_remove(&self, node: &Node) -> Result<u64> {
        let pattern = node.config_store().shard_key_pattern(&self.ns).await?;
        let saver = node.paranoia_saver(&self.ns, "post-cleanup");
        let removed = node
            .store()
            .remove_range(
                &self.ns,
                &self.range,
                &pattern,
                WriteOrigin::Cleanup,
                saver.as_ref(),
            )
            .await?;
        info!(
            "{:?}: moveChunk deleted {} documents of {} from {}",
            LogMarker::DonatedRangeRemoved,
            removed,
            self.ns,
            self.range,
        );
        Ok(removed)
    }
}

/// Helper for the paranoia tunable: the saver only exists when it is on.
pub(crate) fn paranoia_saver(
    enabled: bool,
    dir: &std::path::Path,
    ns: &str,
    why: &str,
) -> Option<RemoveSaver> {
    enabled.then(|| RemoveSaver::new(dir, ns, why))
}
