// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::config_store::ConfigStore;
use crate::types::{ChunkRange, NodeId};

use serde_json::{json, Value};
use std::time::Instant;

/// Records per-step durations of a migration for the config changelog.
///
/// Both sides keep one of these; the finished record lands in the changelog
/// as `moveChunk.<where>` with `step1..stepN` millisecond fields, so slow
/// moves can be broken down after the fact.
#[derive(Debug)]
pub(crate) struct MoveTiming {
    side: &'static str,
    ns: String,
    details: serde_json::Map<String, Value>,
    next_step: u32,
    note_count: u32,
    started: Instant,
}

impl MoveTiming {
    pub(crate) fn new(side: &'static str, ns: &str, range: &ChunkRange) -> Self {
        let mut details = serde_json::Map::new();
        let _ = details.insert("min".to_string(), json!(range.min.to_string()));
        let _ = details.insert("max".to_string(), json!(range.max.to_string()));
        Self {
            side,
            ns: ns.to_string(),
            details,
            next_step: 1,
            note_count: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn with_endpoints(mut self, from: &NodeId, to: &NodeId) -> Self {
        let _ = self
            .details
            .insert("from".to_string(), json!(from.to_string()));
        let _ = self.details.insert("to".to_string(), json!(to.to_string()));
        self
    }

    /// Close step `step`, recording its duration. Steps must be closed in
    /// order.
    pub(crate) fn done(&mut self, step: u32) {
        debug_assert_eq!(step, self.next_step, "migration steps closed out of order");
        self.next_step = step + 1;
        let elapsed = self.started.elapsed().as_millis() as u64;
        let _ = self
            .details
            .insert(format!("step{}", step), json!(elapsed));
        self.started = Instant::now();
    }

    /// Attach a free-form note, e.g. the reason a move unwound.
    pub(crate) fn note(&mut self, note: &str) {
        let field = if self.note_count == 0 {
            "note".to_string()
        } else {
            format!("note{}", self.note_count)
        };
        self.note_count += 1;
        let _ = self.details.insert(field, json!(note));
    }

    /// Append the record to the config changelog. Best effort: a changelog
    /// miss never fails a migration.
    pub(crate) async fn commit(self, config: &dyn ConfigStore) {
        let event = format!("moveChunk.{}", self.side);
        if let Err(error) = config
            .log_change(&event, &self.ns, Value::Object(self.details))
            .await
        {
            warn!("couldn't append {} to the changelog: {}", event, error);
        }
    }
}
