// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::Result;
use crate::types::Document;

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Side-copies documents about to be deleted by a migration, when the
/// `move_paranoia` tunable is on.
///
/// Each saver appends bincode-framed documents to one file under
/// `<root>/moveChunk/`, named after the collection and the reason for the
/// delete (`pre-cleanup`, `removed-during`, `post-cleanup`). The file is only
/// created once something is actually deleted.
pub struct RemoveSaver {
    path: PathBuf,
    file: Mutex<Option<BufWriter<File>>>,
}

impl RemoveSaver {
    /// A saver writing under `root` for the given collection and reason.
    pub fn new(root: &Path, ns: &str, why: &str) -> Self {
        let mut path = root.join("moveChunk");
        path.push(format!("{}.{}.bin", ns.replace('.', "_"), why));
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    /// Append a side copy of `doc`.
    pub fn going_to_delete(&self, doc: &Document) -> Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let file = File::options().create(true).append(true).open(&self.path)?;
            *guard = Some(BufWriter::new(file));
        }
        if let Some(writer) = guard.as_mut() {
            bincode::serialize_into(writer, doc)?;
        }
        Ok(())
    }

    /// Where the side copies end up.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RemoveSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoveSaver").field("path", &self.path).finish()
    }
}
