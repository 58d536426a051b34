//! Document locks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lock held on a document
///
/// `failed` is only ever set on values returned from a removal attempt that
/// was denied because the caller was not the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub owner: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub failed: bool,
}

impl Lock {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            created: Utc::now(),
            failed: false,
        }
    }

    pub fn with_created(owner: Option<String>, created: DateTime<Utc>) -> Self {
        Self {
            owner,
            created,
            failed: false,
        }
    }

    /// Copy of this lock flagged as a denied removal
    pub fn into_failed(self) -> Self {
        Self {
            failed: true,
            ..self
        }
    }

    /// Removal is allowed when either side has no owner or both owners match
    pub fn can_be_removed_by(&self, owner: Option<&str>) -> bool {
        match (self.owner.as_deref(), owner) {
            (None, _) | (_, None) => true,
            (Some(held), Some(asking)) => held == asking,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_be_removed_by() {
        let lock = Lock::new("bob");
        assert!(lock.can_be_removed_by(Some("bob")));
        assert!(lock.can_be_removed_by(None));
        assert!(!lock.can_be_removed_by(Some("alice")));

        let anonymous = Lock::with_created(None, Utc::now());
        assert!(anonymous.can_be_removed_by(Some("alice")));
    }

    #[test]
    fn test_into_failed_keeps_owner() {
        let lock = Lock::new("bob").into_failed();
        assert!(lock.failed);
        assert_eq!(lock.owner.as_deref(), Some("bob"));
    }
}
