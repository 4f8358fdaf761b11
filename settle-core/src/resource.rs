//! Resource - Identifiers and lifecycle states of remote resources

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a resource being managed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    /// Resource type (e.g., "is_image", "is_share")
    pub resource_type: String,
    /// Resource name (identifier specified in configuration)
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// Lifecycle state reported by the remote system (e.g., "pending", "stable")
///
/// The value is opaque: its meaning comes entirely from the state sets of a
/// [`PollSpec`](crate::lifecycle::PollSpec).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LifecycleState(String);

impl LifecycleState {
    pub fn new(state: impl Into<String>) -> Self {
        Self(state.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LifecycleState {
    fn from(state: &str) -> Self {
        Self(state.to_string())
    }
}

impl From<String> for LifecycleState {
    fn from(state: String) -> Self {
        Self(state)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
