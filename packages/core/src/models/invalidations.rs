//! Invalidation batches
//!
//! A batch lists the rows a save touched, split into modified and deleted,
//! plus selection keys (pseudo rows) for the cached child lists, version
//! series and proxy indices that changed membership.

use super::{NodeId, RowId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Pseudo table for the non-complex children of a parent
pub const SEL_CHILDREN: &str = "__children__";
/// Pseudo table for the complex-property children of a parent
pub const SEL_COMPLEX_CHILDREN: &str = "__complex_children__";
/// Pseudo table for the versions of a series
pub const SEL_SERIES_VERSIONS: &str = "__series_versions__";
/// Pseudo table for the proxies of a series
pub const SEL_SERIES_PROXIES: &str = "__series_proxies__";
/// Pseudo table for the proxies pointing at one target
pub const SEL_TARGET_PROXIES: &str = "__target_proxies__";

/// Invalidation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationKind {
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invalidations {
    pub modified: BTreeSet<RowId>,
    pub deleted: BTreeSet<RowId>,
}

impl Invalidations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modified.len() + self.deleted.len()
    }

    pub fn add(&mut self, row_id: RowId, kind: InvalidationKind) {
        match kind {
            InvalidationKind::Modified => {
                self.modified.insert(row_id);
            }
            InvalidationKind::Deleted => {
                self.deleted.insert(row_id);
            }
        }
    }

    pub fn add_modified(&mut self, table: &str, id: &NodeId) {
        self.modified.insert(RowId::new(table, id.clone()));
    }

    pub fn add_deleted(&mut self, table: &str, id: &NodeId) {
        self.deleted.insert(RowId::new(table, id.clone()));
    }

    pub fn merge(&mut self, other: Invalidations) {
        self.modified.extend(other.modified);
        self.deleted.extend(other.deleted);
    }

    /// `(table, id, kind)` triples, modified first
    pub fn entries(&self) -> impl Iterator<Item = (&RowId, InvalidationKind)> {
        self.modified
            .iter()
            .map(|r| (r, InvalidationKind::Modified))
            .chain(self.deleted.iter().map(|r| (r, InvalidationKind::Deleted)))
    }

    pub fn is_selection_table(table: &str) -> bool {
        matches!(
            table,
            SEL_CHILDREN
                | SEL_COMPLEX_CHILDREN
                | SEL_SERIES_VERSIONS
                | SEL_SERIES_PROXIES
                | SEL_TARGET_PROXIES
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_and_roundtrip_json() {
        let mut a = Invalidations::new();
        a.add_modified("hierarchy", &NodeId::from("1"));
        let mut b = Invalidations::new();
        b.add_deleted("hierarchy", &NodeId::from("2"));
        b.add_modified(SEL_CHILDREN, &NodeId::from("0"));
        a.merge(b);
        assert_eq!(a.len(), 3);

        let json = serde_json::to_string(&a).unwrap();
        let back: Invalidations = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert!(Invalidations::is_selection_table(SEL_CHILDREN));
        assert!(!Invalidations::is_selection_table("hierarchy"));
    }
}
