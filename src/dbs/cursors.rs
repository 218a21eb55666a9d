// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Identifier of an open client cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorId(pub u64);

impl Display for CursorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry of open client cursors, per namespace.
///
/// After a chunk is donated, the deferred-cleanup worker must not delete the
/// donated range while cursors that predate the handoff are still open on the
/// collection; it snapshots this registry at cutover and waits for the
/// intersection to drain.
#[derive(Debug, Default)]
pub struct CursorRegistry {
    next: AtomicU64,
    open: Mutex<BTreeMap<String, BTreeSet<CursorId>>>,
}

impl CursorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new open cursor on `ns`.
    pub fn open(&self, ns: &str) -> CursorId {
        let id = CursorId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        let _ = open.entry(ns.to_string()).or_default().insert(id);
        id
    }

    /// Close a cursor.
    pub fn close(&self, ns: &str, id: CursorId) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cursors) = open.get_mut(ns) {
            let _ = cursors.remove(&id);
            if cursors.is_empty() {
                let _ = open.remove(ns);
            }
        }
    }

    /// The ids currently open on `ns`.
    pub fn find(&self, ns: &str) -> BTreeSet<CursorId> {
        let open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        open.get(ns).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_find() {
        let registry = CursorRegistry::new();
        let a = registry.open("test.docs");
        let b = registry.open("test.docs");
        let other = registry.open("other.docs");

        assert_eq!(registry.find("test.docs").len(), 2);
        registry.close("test.docs", a);
        assert_eq!(registry.find("test.docs"), [b].into_iter().collect());
        registry.close("test.docs", b);
        assert!(registry.find("test.docs").is_empty());
        assert_eq!(registry.find("other.docs"), [other].into_iter().collect());
    }
}
