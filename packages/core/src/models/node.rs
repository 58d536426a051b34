//! Node identity and snapshot handle
//!
//! A [`Node`] is what the session hands out to callers: the node's stable id
//! plus a snapshot of its hierarchy columns taken when the handle was built.
//! The session never reads state back out of a handle except its id, so a
//! stale handle (e.g. after a move in the same session) stays usable; call
//! `Session::get_node_by_id` to refresh the snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque document identifier
///
/// Depending on the repository id strategy this wraps either a UUID string or
/// a decimal sequence value. Ids never change once allocated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Snapshot of a document-tree entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub pos: Option<i64>,
    pub primary_type: String,
    pub mixin_types: Vec<String>,
    /// Complex-property child (e.g. one entry of a list of complex values)
    pub is_complex: bool,
    pub is_version: bool,
    pub is_proxy: bool,
    pub is_checked_in: bool,
    pub base_version_id: Option<NodeId>,
    /// Series this node belongs to: own id for live documents, the live
    /// document id for versions and proxies.
    pub version_series_id: Option<NodeId>,
    /// Proxy target (a version or a live document)
    pub target_id: Option<NodeId>,
}

impl Node {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none() && !self.is_version
    }

    pub fn has_mixin(&self, mixin: &str) -> bool {
        self.mixin_types.iter().any(|m| m == mixin)
    }
}
