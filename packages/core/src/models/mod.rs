//! Data Models
//!
//! In-memory representations shared by the persistence context, the row
//! store boundary and the session API:
//!
//! - [`Node`] / [`NodeId`] - document-tree entries and their identity
//! - [`Row`], [`Fragment`] - persisted rows and their per-session copies
//! - [`Invalidations`] - cross-session change notices
//! - [`Lock`], [`AclEntry`] - locking and security values

mod acl;
mod fragment;
mod invalidations;
mod lock;
mod node;

pub use acl::{AclEntry, BROWSE, EVERYONE, EVERYTHING, READ, READ_WRITE};
pub use fragment::{Fragment, FragmentState, InvalidTransition, Row, RowData, RowId, RowUpdate};
pub use invalidations::{
    InvalidationKind, Invalidations, SEL_CHILDREN, SEL_COMPLEX_CHILDREN, SEL_SERIES_PROXIES,
    SEL_SERIES_VERSIONS, SEL_TARGET_PROXIES,
};
pub use lock::Lock;
pub use node::{Node, NodeId};
