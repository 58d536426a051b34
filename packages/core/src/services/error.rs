//! Storage Error Types
//!
//! Error taxonomy of the session/storage core:
//!
//! - usage errors (`InvalidType`, `InvalidState`, `IllegalProperty`,
//!   `IllegalArgument`) raised synchronously at the offending call
//! - structural conflicts (`CannotMoveUnderItself`, `NameExists`)
//! - resource exhaustion (`PoolTimeout`)
//! - fatal store errors, propagated unchanged in `Store`

use crate::db::StoreError;
use crate::models::{InvalidTransition, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Document type is not registered in the model
    #[error("Invalid type: {0}")]
    InvalidType(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Property not legal for the node's type and mixins
    #[error("Illegal property '{key}' for type {type_name}")]
    IllegalProperty { key: String, type_name: String },

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Cannot move under itself: {0}")]
    CannotMoveUnderItself(NodeId),

    /// Destination already holds a child with this name
    #[error("Destination name already exists: {0}")]
    NameExists(String),

    #[error("Node not found: {0}")]
    NotFound(NodeId),

    /// Connection pool exhausted for longer than the blocking timeout
    #[error("Connection pool timeout after {timeout_ms} ms")]
    PoolTimeout { timeout_ms: u64 },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Proxies are disabled for this repository")]
    ProxiesDisabled,

    #[error("Binaries are not configured for this repository")]
    BinariesDisabled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn invalid_type(name: impl Into<String>) -> Self {
        Self::InvalidType(name.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn illegal_property(key: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::IllegalProperty {
            key: key.into(),
            type_name: type_name.into(),
        }
    }

    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(msg.into())
    }

    pub fn name_exists(name: impl Into<String>) -> Self {
        Self::NameExists(name.into())
    }

    pub fn not_found(id: &NodeId) -> Self {
        Self::NotFound(id.clone())
    }
}

impl From<InvalidTransition> for StorageError {
    fn from(e: InvalidTransition) -> Self {
        Self::InvalidState(e.to_string())
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
