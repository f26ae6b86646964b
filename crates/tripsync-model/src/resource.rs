//! Versioned resources guarded by compare-and-swap.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Resource version. Starts at 1 and grows by exactly 1 per accepted write.
pub type Version = u64;

/// A pure change to a resource payload.
///
/// Implementations must not have side effects: the same change is applied
/// once to the client's cached copy and once by the store.
pub trait Change<T> {
    fn apply(&self, current: &T) -> Result<T>;
}

/// A store-owned resource with an optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedResource<T> {
    pub id: String,
    pub scope_id: String,
    pub version: Version,
    pub payload: T,
}

impl<T> VersionedResource<T> {
    /// Create a resource at version 1.
    pub fn new(id: impl Into<String>, scope_id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            scope_id: scope_id.into(),
            version: 1,
            payload,
        }
    }

    /// Create a resource at an explicit version.
    pub fn with_version(
        id: impl Into<String>,
        scope_id: impl Into<String>,
        version: Version,
        payload: T,
    ) -> Result<Self> {
        if version == 0 {
            return Err(ModelError::InvalidVersion(version));
        }
        Ok(Self {
            id: id.into(),
            scope_id: scope_id.into(),
            version,
            payload,
        })
    }

    /// Whether a write expecting `expected` would be accepted.
    pub fn accepts(&self, expected: Version) -> bool {
        self.version == expected
    }

    /// Apply a change, producing the successor at `version + 1`.
    pub fn apply<C: Change<T>>(&self, change: &C) -> Result<Self> {
        Ok(Self {
            id: self.id.clone(),
            scope_id: self.scope_id.clone(),
            version: self.version + 1,
            payload: change.apply(&self.payload)?,
        })
    }
}
