// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The mutation tap and the donor-side migration state it feeds.
//!
//! While a migration is active, every write committed to the migrating
//! collection is observed under the collection write lock and distilled to an
//! id-level delta: deletes go to the `deleted` list, inserts and updates that
//! land in the migrating range go to the `reload` list. The recipient drains
//! both by polling; whole documents are re-fetched at drain time, so a
//! document rewritten ten times ships once.

use crate::dbs::{CollectionRead, WriteKind, WriteOp, WriteObserver, WriteOrigin, WritePayload};
use crate::node::error::{Error, Result};
use crate::types::{ChunkRange, DocId, ShardKey, ShardKeyPattern};

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Fixed bookkeeping cost accounted per buffered id, on top of the id bytes.
pub(crate) const TAP_ENTRY_OVERHEAD: u64 = 16;

/// The donor's single-slot migration record.
///
/// Created when the donor driver snapshots the range, cleared on completion
/// or failure. At most one exists per node.
#[derive(custom_debug::Debug)]
pub(crate) struct DonorState {
    pub(crate) ns: String,
    pub(crate) range: ChunkRange,
    pub(crate) pattern: ShardKeyPattern,
    pub(crate) in_critical_section: bool,
    /// Ids captured by the range snapshot, not yet pulled by the recipient.
    #[debug(skip)]
    clone_locs: BTreeSet<DocId>,
    /// Ids whose current document must be re-copied to the recipient.
    #[debug(skip)]
    reload: VecDeque<DocId>,
    /// Ids deleted on the donor during the migration.
    #[debug(skip)]
    deleted: VecDeque<DocId>,
    bytes_buffered: u64,
}

impl DonorState {
    fn entry_bytes(id: &DocId) -> u64 {
        id.byte_size() as u64 + TAP_ENTRY_OVERHEAD
    }

    fn record_deleted(&mut self, id: DocId) {
        self.bytes_buffered += Self::entry_bytes(&id);
        self.deleted.push_back(id);
    }

    fn record_reload(&mut self, id: DocId) {
        self.bytes_buffered += Self::entry_bytes(&id);
        self.reload.push_back(id);
    }
}

/// Shared handle to the donor slot. Cloned into the tap and the driver.
#[derive(Debug, Clone, Default)]
pub(crate) struct DonorSlot {
    inner: Arc<Mutex<Option<DonorState>>>,
}

impl DonorSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<DonorState>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Occupy the slot. Fails if a migration is already in flight.
    pub(crate) fn start(
        &self,
        ns: &str,
        range: ChunkRange,
        pattern: ShardKeyPattern,
    ) -> Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(Error::MigrationActive);
        }
        *guard = Some(DonorState {
            ns: ns.to_string(),
            range,
            pattern,
            in_critical_section: false,
            clone_locs: BTreeSet::new(),
            reload: VecDeque::new(),
            deleted: VecDeque::new(),
            bytes_buffered: 0,
        });
        Ok(())
    }

    /// Clear the slot, dropping any remaining buffers.
    pub(crate) fn done(&self) {
        let mut guard = self.lock();
        *guard = None;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// The migrating namespace, or `NoActiveMigration`.
    pub(crate) fn active_ns(&self) -> Result<String> {
        self.lock()
            .as_ref()
            .map(|state| state.ns.clone())
            .ok_or(Error::NoActiveMigration)
    }

    pub(crate) fn set_critical_section(&self, value: bool) {
        if let Some(state) = self.lock().as_mut() {
            state.in_critical_section = value;
        }
    }

    pub(crate) fn bytes_buffered(&self) -> u64 {
        self.lock()
            .as_ref()
            .map(|state| state.bytes_buffered)
            .unwrap_or(0)
    }

    /// Whether a client write for `key` on `ns` must bounce back to the
    /// router: the migrating range stops taking writes once the donor enters
    /// its critical section.
    pub(crate) fn refuses_write(&self, ns: &str, key: &ShardKey) -> bool {
        self.lock()
            .as_ref()
            .map(|state| {
                state.in_critical_section
                    && state.ns == ns
                    && state.range.contains(key, &state.pattern)
            })
            .unwrap_or(false)
    }

    /// Seed the clone set with the snapshot of the range.
    pub(crate) fn store_clone_locs(&self, ids: Vec<DocId>) -> Result<()> {
        let mut guard = self.lock();
        let state = guard.as_mut().ok_or(Error::NoActiveMigration)?;
        state.clone_locs.extend(ids);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn clone_locs_remaining(&self) -> usize {
        self.lock()
            .as_ref()
            .map(|state| state.clone_locs.len())
            .unwrap_or(0)
    }

    /// Pop up to `limit` ids from the clone set.
    pub(crate) fn take_clone_locs(&self, limit: usize) -> Result<Vec<DocId>> {
        let mut guard = self.lock();
        let state = guard.as_mut().ok_or(Error::NoActiveMigration)?;
        let mut taken = Vec::with_capacity(limit.min(state.clone_locs.len()));
        while taken.len() < limit {
            match state.clone_locs.iter().next().cloned() {
                Some(id) => {
                    let _ = state.clone_locs.remove(&id);
                    taken.push(id);
                }
                None => break,
            }
        }
        Ok(taken)
    }

    /// Put back ids a clone batch did not have room for.
    pub(crate) fn return_clone_locs(&self, ids: Vec<DocId>) {
        if let Some(state) = self.lock().as_mut() {
            state.clone_locs.extend(ids);
        }
    }

    /// Drain buffered deltas up to `max_bytes` of accounted id bytes:
    /// deletes first, then reload ids. Returns `(deleted, reload, size)`,
    /// where `size` counts the drained entries and is zero only when both
    /// buffers were empty.
    pub(crate) fn drain_deltas(&self, max_bytes: u64) -> Result<(Vec<DocId>, Vec<DocId>, u64)> {
        let mut guard = self.lock();
        let state = guard.as_mut().ok_or(Error::NoActiveMigration)?;

        let mut size = 0u64;
        let mut deleted = vec![];
        let mut reload = vec![];

        while size < max_bytes {
            match state.deleted.pop_front() {
                Some(id) => {
                    let entry = DonorState::entry_bytes(&id);
                    size += entry;
                    state.bytes_buffered = state.bytes_buffered.saturating_sub(entry);
                    deleted.push(id);
                }
                None => break,
            }
        }
        while size < max_bytes {
            match state.reload.pop_front() {
                Some(id) => {
                    let entry = DonorState::entry_bytes(&id);
                    size += entry;
                    state.bytes_buffered = state.bytes_buffered.saturating_sub(entry);
                    reload.push(id);
                }
                None => break,
            }
        }

        Ok((deleted, reload, size))
    }

    /// The migrating range and pattern, for drain-time range tests.
    pub(crate) fn range_and_pattern(&self) -> Result<(String, ChunkRange, ShardKeyPattern)> {
        self.lock()
            .as_ref()
            .map(|state| (state.ns.clone(), state.range.clone(), state.pattern.clone()))
            .ok_or(Error::NoActiveMigration)
    }
}

/// The write observer feeding the donor slot. Registered with the local
/// store at node construction; a no-op whenever the slot is empty.
#[derive(Debug, Clone)]
pub(crate) struct MutationTap {
    slot: DonorSlot,
}

impl MutationTap {
    pub(crate) fn new(slot: DonorSlot) -> Self {
        Self { slot }
    }
}

impl WriteObserver for MutationTap {
    fn on_write(&self, op: &WriteOp, coll: &dyn CollectionRead) {
        let mut guard = self.slot.lock();
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return,
        };
        if state.ns != op.ns {
            return;
        }

        match op.kind {
            WriteKind::Delete => {
                let id = match &op.payload {
                    WritePayload::Id(id) => id.clone(),
                    WritePayload::Doc(doc) => match doc.id() {
                        Some(id) => id,
                        None => return,
                    },
                };
                // the document is gone either way, never clone it
                let _ = state.clone_locs.remove(&id);

                if op.origin == WriteOrigin::Cleanup {
                    // we don't want to xfer things we're cleaning, as then
                    // they'd be deleted on the recipient too
                    return;
                }
                // can't range-test a delete, the body is gone
                state.record_deleted(id);
            }
            WriteKind::Insert => {
                let doc = match &op.payload {
                    WritePayload::Doc(doc) => doc,
                    WritePayload::Id(_) => return,
                };
                if !state.pattern.in_range(doc, &state.range.min, &state.range.max) {
                    return;
                }
                match doc.id() {
                    Some(id) => state.record_reload(id),
                    None => warn!("tap got insert with no _id, ignoring"),
                }
            }
            WriteKind::Update => {
                let id = match &op.payload {
                    WritePayload::Id(id) => id.clone(),
                    WritePayload::Doc(doc) => match doc.id() {
                        Some(id) => id,
                        None => return,
                    },
                };
                // re-read the post-update document; deltas carry ids only
                let post = match coll.read_by_id(&id) {
                    Some(doc) => doc,
                    None => {
                        warn!("tap couldn't find {} even though it should have", id);
                        return;
                    }
                };
                if state
                    .pattern
                    .in_range(&post, &state.range.min, &state.range.max)
                {
                    state.record_reload(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{doc, Document, KeyValue};
    use std::collections::BTreeMap;

    struct FakeColl(BTreeMap<DocId, Document>);

    impl CollectionRead for FakeColl {
        fn read_by_id(&self, id: &DocId) -> Option<Document> {
            self.0.get(id).cloned()
        }
    }

    fn active_slot() -> DonorSlot {
        let slot = DonorSlot::new();
        let pattern = ShardKeyPattern::ascending("x");
        let range = ChunkRange::new(
            ShardKey(vec![KeyValue::Number(0.0)]),
            ShardKey(vec![KeyValue::Number(100.0)]),
        );
        slot.start("test.docs", range, pattern).expect("slot was free");
        slot
    }

    fn insert_op(ns: &str, d: Document, origin: WriteOrigin) -> WriteOp {
        WriteOp {
            kind: WriteKind::Insert,
            ns: ns.to_string(),
            payload: WritePayload::Doc(d),
            origin,
        }
    }

    fn delete_op(ns: &str, id: DocId, origin: WriteOrigin) -> WriteOp {
        WriteOp {
            kind: WriteKind::Delete,
            ns: ns.to_string(),
            payload: WritePayload::Id(id),
            origin,
        }
    }

    fn update_op(ns: &str, id: DocId) -> WriteOp {
        WriteOp {
            kind: WriteKind::Update,
            ns: ns.to_string(),
            payload: WritePayload::Id(id),
            origin: WriteOrigin::User,
        }
    }

    #[test]
    fn inactive_slot_records_nothing() {
        crate::init_test_logger();
        let slot = DonorSlot::new();
        let tap = MutationTap::new(slot.clone());
        let coll = FakeColl(BTreeMap::new());

        tap.on_write(
            &insert_op(
                "test.docs",
                doc(&[("_id", 1.into()), ("x", 5.into())]),
                WriteOrigin::User,
            ),
            &coll,
        );
        assert_eq!(slot.bytes_buffered(), 0);
    }

    #[test]
    fn in_range_inserts_are_buffered_for_reload() {
        let slot = active_slot();
        let tap = MutationTap::new(slot.clone());
        let coll = FakeColl(BTreeMap::new());

        tap.on_write(
            &insert_op(
                "test.docs",
                doc(&[("_id", 1.into()), ("x", 5.into())]),
                WriteOrigin::User,
            ),
            &coll,
        );
        tap.on_write(
            &insert_op(
                "test.docs",
                doc(&[("_id", 2.into()), ("x", 500.into())]),
                WriteOrigin::User,
            ),
            &coll,
        );
        // other collections are of no interest
        tap.on_write(
            &insert_op(
                "other.docs",
                doc(&[("_id", 3.into()), ("x", 5.into())]),
                WriteOrigin::User,
            ),
            &coll,
        );

        let (deleted, reload, size) = slot.drain_deltas(1024 * 1024).expect("slot is active");
        assert!(deleted.is_empty());
        assert_eq!(reload, vec![DocId(KeyValue::Number(1.0))]);
        assert!(size > 0);
        assert_eq!(slot.bytes_buffered(), 0);
    }

    #[test]
    fn deletes_are_recorded_unconditionally_but_not_for_cleanup() {
        let slot = active_slot();
        let tap = MutationTap::new(slot.clone());
        let coll = FakeColl(BTreeMap::new());

        tap.on_write(
            &delete_op("test.docs", DocId(KeyValue::Number(7.0)), WriteOrigin::User),
            &coll,
        );
        tap.on_write(
            &delete_op(
                "test.docs",
                DocId(KeyValue::Number(8.0)),
                WriteOrigin::Cleanup,
            ),
            &coll,
        );

        let (deleted, _, _) = slot.drain_deltas(1024 * 1024).expect("slot is active");
        assert_eq!(deleted, vec![DocId(KeyValue::Number(7.0))]);
    }

    #[test]
    fn deletes_strip_the_clone_set() {
        let slot = active_slot();
        let tap = MutationTap::new(slot.clone());
        let coll = FakeColl(BTreeMap::new());
        let id = DocId(KeyValue::Number(1.0));
        slot.store_clone_locs(vec![id.clone()]).expect("slot is active");

        tap.on_write(&delete_op("test.docs", id, WriteOrigin::User), &coll);
        assert_eq!(slot.clone_locs_remaining(), 0);
    }

    #[test]
    fn updates_reread_the_post_image() {
        let slot = active_slot();
        let tap = MutationTap::new(slot.clone());

        let in_range = DocId(KeyValue::Number(1.0));
        let moved_out = DocId(KeyValue::Number(2.0));
        let mut docs = BTreeMap::new();
        let _ = docs.insert(in_range.clone(), doc(&[("_id", 1.into()), ("x", 50.into())]));
        let _ = docs.insert(moved_out.clone(), doc(&[("_id", 2.into()), ("x", 150.into())]));
        let coll = FakeColl(docs);

        tap.on_write(&update_op("test.docs", in_range.clone()), &coll);
        tap.on_write(&update_op("test.docs", moved_out), &coll);

        let (_, reload, _) = slot.drain_deltas(1024 * 1024).expect("slot is active");
        assert_eq!(reload, vec![in_range]);
    }

    #[test]
    fn drain_respects_the_byte_cap() {
        let slot = active_slot();
        let tap = MutationTap::new(slot.clone());
        let coll = FakeColl(BTreeMap::new());

        for i in 0..100 {
            tap.on_write(
                &delete_op(
                    "test.docs",
                    DocId(KeyValue::Number(i as f64)),
                    WriteOrigin::User,
                ),
                &coll,
            );
        }

        let before = slot.bytes_buffered();
        let (first, _, size) = slot.drain_deltas(10 * (8 + TAP_ENTRY_OVERHEAD)).expect("active");
        assert!(first.len() < 100);
        assert!(size >= 10 * (8 + TAP_ENTRY_OVERHEAD));
        assert_eq!(slot.bytes_buffered(), before - size);

        // draining with no cap empties the rest
        let (rest, _, _) = slot.drain_deltas(u64::MAX).expect("active");
        assert_eq!(first.len() + rest.len(), 100);
        assert_eq!(slot.bytes_buffered(), 0);
    }

    #[test]
    fn second_migration_cannot_start() {
        let slot = active_slot();
        let pattern = ShardKeyPattern::ascending("x");
        let range = ChunkRange::full(&pattern);
        assert!(matches!(
            slot.start("another.docs", range, pattern),
            Err(Error::MigrationActive)
        ));
    }
}
