// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Writebacks: client writes that reached this node after it stopped owning
//! the target range.
//!
//! Such a write is refused, but never dropped: it is captured here with a
//! correlation id, and the router drains the queue and replays each note
//! against the owner its refreshed map points at. The cost of a migration's
//! critical section is therefore latency, not loss.

use crate::types::{DocId, Document};

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// The refused operation, verbatim.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WritebackOp {
    /// An insert or replace.
    Upsert(Document),
    /// A delete by id.
    Delete(DocId),
}

/// One captured write awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritebackNote {
    /// Correlation id, so routers can wait for a specific replay.
    pub id: u64,
    /// The collection the write was aimed at.
    pub ns: String,
    /// The operation to replay.
    pub op: WritebackOp,
}

/// Queue of captured writes, drained by `_fetchWritebacks`.
#[derive(Debug, Default)]
pub(crate) struct WritebackQueue {
    notes: Mutex<Vec<WritebackNote>>,
}

impl WritebackQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Capture a refused write. Returns its correlation id.
    pub(crate) fn capture(&self, ns: &str, op: WritebackOp) -> u64 {
        let id = rand::random::<u64>();
        let mut notes = self.notes.lock().unwrap_or_else(|e| e.into_inner());
        notes.push(WritebackNote {
            id,
            ns: ns.to_string(),
            op,
        });
        id
    }

    /// Take every captured note, in capture order.
    pub(crate) fn drain(&self) -> Vec<WritebackNote> {
        let mut notes = self.notes.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *notes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{doc, KeyValue};

    #[test]
    fn captured_notes_drain_in_order() {
        let queue = WritebackQueue::new();
        let first = queue.capture(
            "test.docs",
            WritebackOp::Upsert(doc(&[("_id", 1.into()), ("x", 10.into())])),
        );
        let second = queue.capture(
            "test.docs",
            WritebackOp::Delete(DocId(KeyValue::Number(2.0))),
        );

        let notes = queue.drain();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].id, first);
        assert_eq!(notes[1].id, second);
        assert!(queue.drain().is_empty());
    }
}
