//! Access control entries

use serde::{Deserialize, Serialize};

pub const EVERYONE: &str = "Everyone";
pub const EVERYTHING: &str = "Everything";
pub const READ: &str = "Read";
pub const BROWSE: &str = "Browse";
pub const READ_WRITE: &str = "ReadWrite";

/// One ACE, stored as an element of the `acls` collection fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// Named ACL the entry belongs to (e.g. "local")
    pub acl: String,
    pub grant: bool,
    pub permission: String,
    pub user: String,
}

impl AclEntry {
    pub fn grant(user: impl Into<String>, permission: impl Into<String>) -> Self {
        Self {
            acl: "local".to_string(),
            grant: true,
            permission: permission.into(),
            user: user.into(),
        }
    }

    pub fn deny(user: impl Into<String>, permission: impl Into<String>) -> Self {
        Self {
            acl: "local".to_string(),
            grant: false,
            permission: permission.into(),
            user: user.into(),
        }
    }

    /// Whether this entry grants read access
    pub fn grants_read(&self) -> bool {
        self.grant && matches!(self.permission.as_str(), READ | BROWSE | READ_WRITE | EVERYTHING)
    }

    /// Deny-everything-to-everyone stops inheritance from ancestors
    pub fn blocks_inheritance(&self) -> bool {
        !self.grant && self.user == EVERYONE && self.permission == EVERYTHING
    }
}
