// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::shard_key::KeyValue;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};

/// The `_id` of a document. Ids are scalar values with a total order, so
/// they can live in the ordered id-sets the migration buffers are made of.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(pub KeyValue);

impl DocId {
    /// Serialised byte size of the id, used for tap buffer accounting.
    pub fn byte_size(&self) -> usize {
        self.0.byte_size()
    }
}

impl Display for DocId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<KeyValue> for DocId {
    fn from(value: KeyValue) -> Self {
        Self(value)
    }
}

/// A document: an ordered map of field names to JSON values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// An empty document.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// The document's `_id`, if it has one.
    pub fn id(&self) -> Option<DocId> {
        self.0.get("_id").map(|v| DocId(KeyValue::from_value(v)))
    }

    /// Get a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Get a field by dotted path, walking into sub-documents.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Set a top-level field, returning `self` for chaining.
    pub fn with(mut self, field: &str, value: Value) -> Self {
        let _ = self.0.insert(field.to_string(), value);
        self
    }

    /// Serialised byte size of the document.
    pub fn byte_size(&self) -> usize {
        serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(0)
    }

    /// The underlying field map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::doc;

    #[test]
    fn id_projects_to_a_scalar() {
        let d = doc(&[("_id", 42.into()), ("x", "hello".into())]);
        assert_eq!(d.id(), Some(DocId(KeyValue::Number(42.0))));
    }

    #[test]
    fn missing_id_is_none() {
        let d = doc(&[("x", 1.into())]);
        assert_eq!(d.id(), None);
    }

    #[test]
    fn dotted_path_lookup() {
        let d = doc(&[("a", serde_json::json!({ "b": { "c": 3 } }))]);
        assert_eq!(d.get_path("a.b.c"), Some(&serde_json::json!(3)));
        assert_eq!(d.get_path("a.b.missing"), None);
    }
}
