//! Rows and fragments
//!
//! A [`Row`] is the persisted shape of one table entry for one node. A
//! [`Fragment`] is the in-memory copy a persistence context holds for that
//! row, together with its lifecycle state and the last values known to be
//! in the store (used to elide no-op UPDATEs).

use super::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Table name + owning node id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId {
    pub table: String,
    pub id: NodeId,
}

impl RowId {
    pub fn new(table: impl Into<String>, id: NodeId) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// Payload of a row
///
/// Simple rows map column names to scalar values; collection rows hold an
/// ordered array (one element per position in the collection table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowData {
    Collection(Vec<Value>),
    Simple(BTreeMap<String, Value>),
}

impl RowData {
    pub fn empty_simple() -> Self {
        RowData::Simple(BTreeMap::new())
    }

    pub fn empty_collection() -> Self {
        RowData::Collection(Vec::new())
    }

    /// Value of a simple column, `Null` when unset or when this is a collection
    pub fn get(&self, column: &str) -> &Value {
        match self {
            RowData::Simple(map) => map.get(column).unwrap_or(&Value::Null),
            RowData::Collection(_) => &Value::Null,
        }
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).as_str()
    }

    pub fn get_bool(&self, column: &str) -> bool {
        self.get(column).as_bool().unwrap_or(false)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).as_i64()
    }

    pub fn get_id(&self, column: &str) -> Option<NodeId> {
        self.get_str(column).map(NodeId::from)
    }

    pub fn values(&self) -> &[Value] {
        match self {
            RowData::Collection(values) => values,
            RowData::Simple(_) => &[],
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, RowData::Collection(_))
    }

    /// Columns whose value differs from `other`
    ///
    /// For collection rows the whole array is a single unit: any difference
    /// yields the pseudo-column `"*"`.
    pub fn changed_columns(&self, other: &RowData) -> BTreeSet<String> {
        match (self, other) {
            (RowData::Simple(new), RowData::Simple(old)) => {
                let mut changed = BTreeSet::new();
                for (key, value) in new {
                    if old.get(key).unwrap_or(&Value::Null) != value {
                        changed.insert(key.clone());
                    }
                }
                for key in old.keys() {
                    if !new.contains_key(key) && old[key] != Value::Null {
                        changed.insert(key.clone());
                    }
                }
                changed
            }
            (new, old) if new == old => BTreeSet::new(),
            _ => BTreeSet::from(["*".to_string()]),
        }
    }
}

/// A persisted row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub table: String,
    pub id: NodeId,
    pub data: RowData,
}

impl Row {
    pub fn new(table: impl Into<String>, id: NodeId, data: RowData) -> Self {
        Self {
            table: table.into(),
            id,
            data,
        }
    }

    pub fn row_id(&self) -> RowId {
        RowId::new(self.table.clone(), self.id.clone())
    }
}

/// One UPDATE entry sent to the row store
#[derive(Debug, Clone, PartialEq)]
pub enum RowUpdate {
    /// Only the listed simple columns are written
    Columns {
        id: NodeId,
        values: BTreeMap<String, Value>,
    },
    /// The whole collection is rewritten
    Collection { id: NodeId, values: Vec<Value> },
}

impl RowUpdate {
    pub fn id(&self) -> &NodeId {
        match self {
            RowUpdate::Columns { id, .. } | RowUpdate::Collection { id, .. } => id,
        }
    }
}

/// Lifecycle state of a fragment within one persistence context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentState {
    /// Known not to exist in the store
    Absent,
    /// Loaded and equal to the store
    Pristine,
    /// Loaded and changed locally
    Modified,
    /// New, not yet persisted
    Created,
    /// Marked for removal at next save
    Deleted,
}

/// Rejected fragment state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: FragmentState,
    pub to: FragmentState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal fragment transition {:?} -> {:?}", self.from, self.to)
    }
}

impl FragmentState {
    /// Whether the fragment has changes that `save()` must write
    pub fn is_dirty(self) -> bool {
        matches!(
            self,
            FragmentState::Modified | FragmentState::Created | FragmentState::Deleted
        )
    }

    /// State after marking the fragment as `to`
    ///
    /// `Ok(None)` means the fragment simply disappears from the context
    /// (deleting something that was never persisted).
    pub fn transition(self, to: FragmentState) -> Result<Option<FragmentState>, InvalidTransition> {
        use FragmentState::*;
        match (self, to) {
            (Absent, Modified) | (Absent, Created) => Ok(Some(Created)),
            (Pristine, Modified) | (Modified, Modified) => Ok(Some(Modified)),
            (Created, Modified) | (Created, Created) => Ok(Some(Created)),
            (Pristine, Deleted) | (Modified, Deleted) => Ok(Some(Deleted)),
            (Created, Deleted) | (Absent, Deleted) => Ok(None),
            (Deleted, Created) => Ok(Some(Modified)),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }
}

/// In-memory copy of a row
#[derive(Debug, Clone)]
pub struct Fragment {
    pub row_id: RowId,
    pub state: FragmentState,
    pub data: RowData,
    /// Last values known to be persisted; `None` when unknown (new row, or a
    /// remote invalidation arrived while the fragment was dirty).
    pub persisted: Option<RowData>,
}

impl Fragment {
    pub fn pristine(row: Row) -> Self {
        Self {
            row_id: RowId::new(row.table, row.id),
            state: FragmentState::Pristine,
            persisted: Some(row.data.clone()),
            data: row.data,
        }
    }

    pub fn absent(row_id: RowId, data: RowData) -> Self {
        Self {
            row_id,
            state: FragmentState::Absent,
            data,
            persisted: None,
        }
    }

    pub fn created(row_id: RowId, data: RowData) -> Self {
        Self {
            row_id,
            state: FragmentState::Created,
            data,
            persisted: None,
        }
    }

    pub fn to_row(&self) -> Row {
        Row::new(self.row_id.table.clone(), self.row_id.id.clone(), self.data.clone())
    }

    /// Apply a state change, failing on illegal transitions
    pub fn mark(&mut self, to: FragmentState) -> Result<bool, InvalidTransition> {
        match self.state.transition(to)? {
            Some(next) => {
                self.state = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transitions() {
        use FragmentState::*;
        assert_eq!(Absent.transition(Modified), Ok(Some(Created)));
        assert_eq!(Pristine.transition(Modified), Ok(Some(Modified)));
        assert_eq!(Created.transition(Modified), Ok(Some(Created)));
        assert_eq!(Modified.transition(Deleted), Ok(Some(Deleted)));
        assert_eq!(Created.transition(Deleted), Ok(None));
        assert!(Deleted.transition(Modified).is_err());
        assert!(Deleted.transition(Deleted).is_err());
    }

    #[test]
    fn test_changed_columns_includes_explicit_null() {
        let mut old = BTreeMap::new();
        old.insert("title".to_string(), json!("a"));
        old.insert("date".to_string(), json!("2024-01-01"));
        let mut new = old.clone();
        new.insert("date".to_string(), Value::Null);

        let changed = RowData::Simple(new).changed_columns(&RowData::Simple(old));
        assert_eq!(changed, BTreeSet::from(["date".to_string()]));
    }

    #[test]
    fn test_changed_columns_collection() {
        let a = RowData::Collection(vec![json!("x")]);
        let b = RowData::Collection(vec![json!("x"), json!("y")]);
        assert!(a.changed_columns(&a.clone()).is_empty());
        assert_eq!(a.changed_columns(&b).len(), 1);
    }
}
