// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Shard keys: the per-collection field pattern, key projection and the
//! `[min, max)` range predicate that chunk membership is decided by.

use crate::types::Document;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

/// A single shard-key value.
///
/// The variants carry a total order with `MinKey` and `MaxKey` sentinels at
/// the extremes, so a chunk covering the whole key space is simply
/// `[MinKey, MaxKey)`. A field that is missing from a document projects to
/// `Null`. Composite values (arrays, sub-documents) are not supported as
/// shard keys and project to `Null` as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyValue {
    /// Sentinel ordered below every other value.
    MinKey,
    /// The null / missing-field sentinel.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Numeric value. All numbers compare as doubles.
    Number(f64),
    /// String value.
    String(String),
    /// Sentinel ordered above every other value.
    MaxKey,
}

impl KeyValue {
    /// Project a document field value to a key value.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s.clone()),
            // arrays and sub-documents are not valid shard-key values
            Value::Array(_) | Value::Object(_) => Self::Null,
        }
    }

    // Rank used to order values of distinct variants.
    fn type_rank(&self) -> u8 {
        match self {
            Self::MinKey => 0,
            Self::Null => 1,
            Self::Bool(_) => 2,
            Self::Number(_) => 3,
            Self::String(_) => 4,
            Self::MaxKey => 5,
        }
    }

    /// Serialised byte size of this value, used for tap buffer accounting.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::MinKey | Self::MaxKey | Self::Null => 1,
            Self::Bool(_) => 1,
            Self::Number(_) => 8,
            Self::String(s) => s.len(),
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            // `total_cmp` keeps the order total even in the face of NaN
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinKey => write!(f, "MinKey"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "\"{}\"", s),
            Self::MaxKey => write!(f, "MaxKey"),
        }
    }
}

/// A projected shard key: one [`KeyValue`] per field of the pattern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<KeyValue>);

impl ShardKey {
    /// Serialised byte size, used for tap buffer accounting.
    pub fn byte_size(&self) -> usize {
        self.0.iter().map(KeyValue::byte_size).sum()
    }
}

impl Display for ShardKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, " }}")
    }
}

/// Sort direction of one shard-key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// The ordered list of field paths (and directions) that a collection is
/// sharded by. The pattern defines both the projection of a document to its
/// shard key and the sort order used for range membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<(String, Direction)>,
}

impl ShardKeyPattern {
    /// A pattern over the given `(field path, direction)` pairs. Field paths
    /// may be dotted to reach into sub-documents.
    pub fn new(fields: Vec<(String, Direction)>) -> Self {
        Self { fields }
    }

    /// Convenience constructor for the common single-field ascending pattern.
    pub fn ascending(field: &str) -> Self {
        Self::new(vec![(field.to_string(), Direction::Asc)])
    }

    /// The field paths and directions of this pattern.
    pub fn fields(&self) -> &[(String, Direction)] {
        &self.fields
    }

    /// Project `doc` by this pattern. A missing field projects to `Null`.
    pub fn project(&self, doc: &Document) -> ShardKey {
        ShardKey(
            self.fields
                .iter()
                .map(|(path, _)| {
                    doc.get_path(path)
                        .map(KeyValue::from_value)
                        .unwrap_or(KeyValue::Null)
                })
                .collect(),
        )
    }

    /// The key ordered below every document key under this pattern.
    pub fn global_min(&self) -> ShardKey {
        ShardKey(self.fields.iter().map(|_| KeyValue::MinKey).collect())
    }

    /// The key ordered above every document key under this pattern.
    pub fn global_max(&self) -> ShardKey {
        ShardKey(self.fields.iter().map(|_| KeyValue::MaxKey).collect())
    }

    /// Compare two keys under this pattern, honouring per-field directions.
    ///
    /// Keys shorter than the pattern compare as if padded with `Null`.
    pub fn compare(&self, a: &ShardKey, b: &ShardKey) -> Ordering {
        for (i, (_, direction)) in self.fields.iter().enumerate() {
            let left = a.0.get(i).unwrap_or(&KeyValue::Null);
            let right = b.0.get(i).unwrap_or(&KeyValue::Null);
            let ord = match direction {
                Direction::Asc => left.cmp(right),
                Direction::Desc => right.cmp(left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Whether `doc`'s projected key falls within `[min, max)`.
    ///
    /// A key equal to `min` is in range, one equal to `max` is not, and an
    /// empty interval (`min == max`) matches nothing.
    pub fn in_range(&self, doc: &Document, min: &ShardKey, max: &ShardKey) -> bool {
        let key = self.project(doc);
        self.key_in_range(&key, min, max)
    }

    /// Range membership for an already-projected key.
    pub fn key_in_range(&self, key: &ShardKey, min: &ShardKey, max: &ShardKey) -> bool {
        self.compare(key, min) != Ordering::Less && self.compare(key, max) == Ordering::Less
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::doc;
    use proptest::prelude::*;

    fn key(values: Vec<KeyValue>) -> ShardKey {
        ShardKey(values)
    }

    fn num(n: f64) -> ShardKey {
        key(vec![KeyValue::Number(n)])
    }

    #[test]
    fn half_open_interval_membership() {
        let pattern = ShardKeyPattern::ascending("x");
        let min = num(1.0);
        let max = num(5.0);

        assert!(!pattern.in_range(&doc(&[("x", 0.into())]), &min, &max));
        assert!(pattern.in_range(&doc(&[("x", 1.into())]), &min, &max));
        assert!(pattern.in_range(&doc(&[("x", 3.into())]), &min, &max));
        assert!(pattern.in_range(&doc(&[("x", 4.into())]), &min, &max));
        assert!(!pattern.in_range(&doc(&[("x", 5.into())]), &min, &max));
        assert!(!pattern.in_range(&doc(&[("x", 6.into())]), &min, &max));
    }

    #[test]
    fn sentinels_cover_every_key() {
        let pattern = ShardKeyPattern::ascending("x");
        let min = pattern.global_min();
        let max = pattern.global_max();

        assert!(pattern.in_range(&doc(&[("x", 0.into())]), &min, &max));
        assert!(pattern.in_range(&doc(&[("x", "zebra".into())]), &min, &max));
        // a missing shard-key field projects to null, which is still in range
        assert!(pattern.in_range(&doc(&[("y", 1.into())]), &min, &max));
    }

    #[test]
    fn descending_field_reverses_order() {
        let pattern = ShardKeyPattern::new(vec![("x".to_string(), Direction::Desc)]);
        // under a descending pattern, 5 sorts before 1
        let min = num(5.0);
        let max = num(1.0);

        assert!(pattern.in_range(&doc(&[("x", 5.into())]), &min, &max));
        assert!(pattern.in_range(&doc(&[("x", 3.into())]), &min, &max));
        assert!(!pattern.in_range(&doc(&[("x", 1.into())]), &min, &max));
        assert!(!pattern.in_range(&doc(&[("x", 7.into())]), &min, &max));
    }

    #[test]
    fn compound_keys_compare_lexicographically() {
        let pattern = ShardKeyPattern::new(vec![
            ("a".to_string(), Direction::Asc),
            ("b".to_string(), Direction::Asc),
        ]);
        let min = key(vec![KeyValue::Number(1.0), KeyValue::Number(10.0)]);
        let max = key(vec![KeyValue::Number(2.0), KeyValue::Number(0.0)]);

        assert!(pattern.in_range(&doc(&[("a", 1.into()), ("b", 10.into())]), &min, &max));
        assert!(pattern.in_range(&doc(&[("a", 1.into()), ("b", 999.into())]), &min, &max));
        assert!(!pattern.in_range(&doc(&[("a", 2.into()), ("b", 0.into())]), &min, &max));
        assert!(!pattern.in_range(&doc(&[("a", 0.into()), ("b", 50.into())]), &min, &max));
    }

    #[test]
    fn dotted_paths_reach_into_subdocuments() {
        let pattern = ShardKeyPattern::ascending("user.id");
        let document = doc(&[("user", serde_json::json!({ "id": 7 }))]);
        assert_eq!(
            pattern.project(&document),
            key(vec![KeyValue::Number(7.0)])
        );
    }

    proptest! {
        #[test]
        fn empty_intervals_never_match(x in any::<f64>(), bound in -1000i64..1000) {
            let pattern = ShardKeyPattern::ascending("x");
            let b = num(bound as f64);
            let document = doc(&[("x", serde_json::json!(x))]);
            prop_assert!(!pattern.in_range(&document, &b, &b));
        }

        #[test]
        fn membership_is_exclusive_between_neighbours(
            x in -1000i64..1000,
            split in -1000i64..1000,
        ) {
            // a key is in exactly one of two chunks that share a boundary
            let pattern = ShardKeyPattern::ascending("x");
            let min = pattern.global_min();
            let max = pattern.global_max();
            let mid = num(split as f64);
            let document = doc(&[("x", serde_json::json!(x))]);

            let in_low = pattern.in_range(&document, &min, &mid);
            let in_high = pattern.in_range(&document, &mid, &max);
            prop_assert!(in_low ^ in_high);
        }
    }
}
