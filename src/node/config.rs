// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::path::PathBuf;
use std::time::Duration;

/// Migration tunables.
///
/// The ceilings and intervals are defensive defaults, not protocol
/// requirements; tests shrink them and deployments may retune them without
/// affecting correctness.
#[derive(Debug, Clone)]
pub struct Config {
    /// Keep side copies of documents deleted by migrations, on both ends.
    pub move_paranoia: bool,
    /// Where paranoia side copies are written.
    pub paranoia_dir: PathBuf,
    /// Ceiling on the donor's delta buffer; beyond it the migration is
    /// aborted and the caller advised to split.
    pub max_buffer_bytes: u64,
    /// How often the donor polls the recipient for status.
    pub status_poll_interval: Duration,
    /// How many status polls before the donor gives up on the recipient
    /// reaching steady state.
    pub max_status_polls: u32,
    /// How long the recipient waits for the commit to arrive once steady,
    /// and the donor's commit call waits for `done`.
    pub commit_wait: Duration,
    /// Pause between steady-state delta drains on the recipient.
    pub steady_drain_interval: Duration,
    /// Pause between open-cursor polls during deferred cleanup.
    pub cursor_poll_interval: Duration,
    /// Ceiling on the cursor-quiescence wait; after it the donated range is
    /// deleted regardless.
    pub cursor_wait: Duration,
    /// Lease requested on the namespace's distributed lock.
    pub lock_lease: Duration,
    /// Payload cap of one bulk-clone batch.
    pub clone_batch_bytes: u64,
    /// Payload cap of one delta-drain batch.
    pub mods_batch_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            move_paranoia: false,
            paranoia_dir: PathBuf::from("."),
            max_buffer_bytes: 500 * 1024 * 1024,
            status_poll_interval: Duration::from_secs(1),
            max_status_polls: 86_400,
            commit_wait: Duration::from_secs(86_400),
            steady_drain_interval: Duration::from_millis(10),
            cursor_poll_interval: Duration::from_millis(20),
            cursor_wait: Duration::from_secs(900),
            lock_lease: Duration::from_secs(60),
            clone_batch_bytes: 16 * 1024 * 1024,
            mods_batch_bytes: 1024 * 1024,
        }
    }
}
