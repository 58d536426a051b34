//! Selection Cache
//!
//! Per-session cache of id lists keyed by a parent, a version series or a
//! proxy target: the children cache and its sibling indices.
//!
//! # Architecture
//!
//! Two tiers:
//!
//! - **hard**: selections with local additions/removals since the last save,
//!   or pinned because a listed node has pending writes. Never evicted.
//! - **soft**: everything else, in a bounded LRU.
//!
//! A selection is either *complete* (every member is known, in store order)
//! or *partial* (only ids discovered through name lookups).

use crate::models::{
    NodeId, SEL_CHILDREN, SEL_COMPLEX_CHILDREN, SEL_SERIES_PROXIES, SEL_SERIES_VERSIONS,
    SEL_TARGET_PROXIES,
};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

/// Which index a selection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionKind {
    Children,
    ComplexChildren,
    SeriesVersions,
    SeriesProxies,
    TargetProxies,
}

impl SelectionKind {
    pub const ALL: [SelectionKind; 5] = [
        SelectionKind::Children,
        SelectionKind::ComplexChildren,
        SelectionKind::SeriesVersions,
        SelectionKind::SeriesProxies,
        SelectionKind::TargetProxies,
    ];

    pub fn children(complex: bool) -> Self {
        if complex {
            SelectionKind::ComplexChildren
        } else {
            SelectionKind::Children
        }
    }

    /// Pseudo table used in invalidation batches
    pub fn table(self) -> &'static str {
        match self {
            SelectionKind::Children => SEL_CHILDREN,
            SelectionKind::ComplexChildren => SEL_COMPLEX_CHILDREN,
            SelectionKind::SeriesVersions => SEL_SERIES_VERSIONS,
            SelectionKind::SeriesProxies => SEL_SERIES_PROXIES,
            SelectionKind::TargetProxies => SEL_TARGET_PROXIES,
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table() == table)
    }
}

#[derive(Debug, Clone, Default)]
struct Selection {
    /// Ids known from the store
    existing: Vec<NodeId>,
    /// Added locally since the last save
    created: Vec<NodeId>,
    /// Removed locally since the last save
    removed: HashSet<NodeId>,
    complete: bool,
    pinned: bool,
}

impl Selection {
    fn is_hard(&self) -> bool {
        self.pinned || !self.created.is_empty() || !self.removed.is_empty()
    }

    fn ids(&self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.existing
            .iter()
            .chain(self.created.iter())
            .filter(|id| !self.removed.contains(*id))
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }
}

/// One index of selections
#[derive(Debug)]
pub struct SelectionContext {
    kind: SelectionKind,
    hard: HashMap<NodeId, Selection>,
    soft: LruCache<NodeId, Selection>,
}

impl SelectionContext {
    pub fn new(kind: SelectionKind, capacity: NonZeroUsize) -> Self {
        Self {
            kind,
            hard: HashMap::new(),
            soft: LruCache::new(capacity),
        }
    }

    pub fn kind(&self) -> SelectionKind {
        self.kind
    }

    fn take(&mut self, key: &NodeId) -> Option<Selection> {
        self.hard.remove(key).or_else(|| self.soft.pop(key))
    }

    fn put(&mut self, key: NodeId, selection: Selection) {
        if selection.is_hard() {
            self.hard.insert(key, selection);
        } else {
            self.soft.put(key, selection);
        }
    }

    fn peek(&mut self, key: &NodeId) -> Option<&Selection> {
        if self.hard.contains_key(key) {
            return self.hard.get(key);
        }
        self.soft.get(key)
    }

    /// Members if the selection is complete
    pub fn get_complete(&mut self, key: &NodeId) -> Option<Vec<NodeId>> {
        self.peek(key).filter(|s| s.complete).map(Selection::ids)
    }

    /// Members known so far (complete or not), plus the completeness flag
    pub fn known(&mut self, key: &NodeId) -> (Vec<NodeId>, bool) {
        self.peek(key)
            .map(|s| (s.ids(), s.complete))
            .unwrap_or_default()
    }

    pub fn is_removed(&mut self, key: &NodeId, id: &NodeId) -> bool {
        self.peek(key).map(|s| s.removed.contains(id)).unwrap_or(false)
    }

    /// Install the full member list read from the store, keeping local changes
    pub fn set_complete(&mut self, key: NodeId, store_ids: Vec<NodeId>) {
        let mut selection = self.take(&key).unwrap_or_default();
        selection.existing = store_ids;
        selection.complete = true;
        self.put(key, selection);
    }

    /// Remember a member discovered by a point lookup
    pub fn record_existing(&mut self, key: NodeId, id: NodeId) {
        let mut selection = self.take(&key).unwrap_or_default();
        if !selection.existing.contains(&id) {
            selection.existing.push(id);
        }
        self.put(key, selection);
    }

    pub fn record_created(&mut self, key: NodeId, id: NodeId) {
        let mut selection = self.take(&key).unwrap_or_default();
        selection.removed.remove(&id);
        if !selection.created.contains(&id) {
            selection.created.push(id);
        }
        self.put(key, selection);
    }

    pub fn record_removed(&mut self, key: NodeId, id: NodeId) {
        let mut selection = self.take(&key).unwrap_or_default();
        if let Some(pos) = selection.created.iter().position(|c| *c == id) {
            selection.created.remove(pos);
            if selection.existing.contains(&id) {
                selection.removed.insert(id);
            }
        } else {
            selection.removed.insert(id);
        }
        self.put(key, selection);
    }

    /// Keep a selection in the hard tier until the next save
    pub fn pin(&mut self, key: &NodeId) {
        if let Some(mut selection) = self.take(key) {
            selection.pinned = true;
            self.put(key.clone(), selection);
        }
    }

    /// Forget what the store said; local changes survive
    pub fn invalidate(&mut self, key: &NodeId) {
        if let Some(selection) = self.hard.get_mut(key) {
            selection.existing.clear();
            selection.complete = false;
        } else {
            self.soft.pop(key);
        }
    }

    /// Fold local changes into the stored view and release hard entries
    pub fn post_save(&mut self) {
        let hard: Vec<(NodeId, Selection)> = self.hard.drain().collect();
        for (key, selection) in hard {
            let merged = Selection {
                existing: selection.ids(),
                complete: selection.complete,
                ..Default::default()
            };
            self.soft.put(key, merged);
        }
    }

    /// Drop the evictable tier
    pub fn clear_soft(&mut self) {
        self.soft.clear();
    }

    pub fn clear(&mut self) {
        self.hard.clear();
        self.soft.clear();
    }

    pub fn hard_len(&self) -> usize {
        self.hard.len()
    }

    pub fn soft_len(&self) -> usize {
        self.soft.len()
    }
}
