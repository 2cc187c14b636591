//! Core locator types: identities, endpoint sets, query keys and errors.
//!
//! This module contains the data model shared by every other module:
//!
//! - **Identities**: [`Identity`] names a well-known remote object
//! - **Endpoints**: [`Endpoints`] is the unordered set of connection descriptors
//!   an adapter, replica group or directory service can be reached on
//! - **Query keys**: [`QueryKey`] is what the pending query table is indexed by
//! - **Rounds**: [`RequestId`] tags a single broadcast round
//! - **Errors**: [`DiscoveryError`] is the only failure surface callers see, and
//!   [`RpcError`] classifies failures coming back from the RPC transport

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identities & Endpoints
// ============================================================================

/// Identity of a well-known remote object.
///
/// The `category` groups related objects. For directory services the category
/// doubles as the instance name that distinguishes co-existing deployments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Object name, unique within its category.
    pub name: String,
    /// Optional category; empty when the object is uncategorised.
    pub category: String,
}

impl Identity {
    /// Create an identity without a category.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    /// Create an identity inside a category.
    pub fn with_category(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// An unordered set of connection descriptors such as `tcp://10.0.0.1:4000`.
///
/// The locator never interprets the descriptors. Merging two sets is a plain
/// union, so merging the same set twice is the same as merging it once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoints(BTreeSet<String>);

impl Endpoints {
    /// Create an empty endpoint set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single descriptor.
    pub fn insert(&mut self, endpoint: impl Into<String>) -> bool {
        self.0.insert(endpoint.into())
    }

    /// Union another set into this one.
    pub fn merge(&mut self, other: &Endpoints) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Return the union of `self` and `other` without mutating either.
    pub fn union(&self, other: &Endpoints) -> Endpoints {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.0.contains(endpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Endpoints {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "[{}]", joined.join(", "))
    }
}

/// The resolved location of a directory (registry) service.
///
/// Several directory services can share one broadcast domain; they are told
/// apart by `instance_name`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryReference {
    pub instance_name: String,
    pub endpoints: Endpoints,
}

impl DirectoryReference {
    pub fn new(instance_name: impl Into<String>, endpoints: Endpoints) -> Self {
        Self {
            instance_name: instance_name.into(),
            endpoints,
        }
    }
}

// ============================================================================
// Query Keys & Rounds
// ============================================================================

/// What a pending query resolves.
///
/// Keys compare by value; the pending query table keeps at most one live
/// query per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKey {
    /// A well-known object.
    Entity(Identity),
    /// A named adapter or replica group.
    Adapter(String),
    /// A directory service instance. The empty string matches any instance.
    Directory(String),
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::Entity(id) => write!(f, "entity `{id}`"),
            QueryKey::Adapter(name) => write!(f, "adapter `{name}`"),
            QueryKey::Directory(name) if name.is_empty() => write!(f, "any directory service"),
            QueryKey::Directory(name) => write!(f, "directory service `{name}`"),
        }
    }
}

/// Token identifying one broadcast round of a query.
///
/// A fresh id is generated on every (re)broadcast so replies to a superseded
/// round can be recognised and dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by the RPC transport.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum RpcError {
    /// The target no longer hosts the requested object.
    #[error("object does not exist")]
    ObjectNotExist,
    /// The target could not be reached at all.
    #[error("target unreachable: {0}")]
    Unreachable(String),
    /// The target does not implement the requested operation.
    #[error("operation `{0}` does not exist")]
    OperationNotExist(String),
    /// The request could not be decoded or was rejected as invalid.
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Whether the failure means the reference we hold has gone stale and a
    /// fresh resolution may succeed. Structural errors are never stale.
    pub fn is_stale(&self) -> bool {
        matches!(self, RpcError::ObjectNotExist | RpcError::Unreachable(_))
    }
}

/// The outcome surface of every discovery operation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    /// Every round timed out without an acceptable answer.
    #[error("{0} not found")]
    NotFound(QueryKey),
    /// No channel could send the query.
    #[error("{0} not found: no usable network path")]
    NoNetworkPath(QueryKey),
    /// The owning service shut down while the query was pending.
    #[error("locator shut down")]
    Shutdown,
    /// A bounded wait elapsed before the query completed.
    #[error("wait budget exceeded")]
    WaitBudgetExceeded,
    /// A structural error returned by a directory service.
    #[error("remote error: {0}")]
    Remote(RpcError),
}

impl DiscoveryError {
    /// Both "no answer" and "no network path" read as "not found" to callers.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DiscoveryError::NotFound(_) | DiscoveryError::NoNetworkPath(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merging_the_same_endpoints_twice_is_idempotent() {
        let a: Endpoints = ["tcp://10.0.0.1:4000", "udp://10.0.0.1:4001"]
            .into_iter()
            .collect();
        let b: Endpoints = ["tcp://10.0.0.2:4000"].into_iter().collect();

        let once = a.union(&b);
        let twice = once.union(&b);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn identity_display_includes_category() {
        assert_eq!(Identity::new("hello").to_string(), "hello");
        assert_eq!(
            Identity::with_category("Grid", "Locator").to_string(),
            "Grid/Locator"
        );
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn only_liveness_failures_are_stale() {
        assert!(RpcError::ObjectNotExist.is_stale());
        assert!(RpcError::Unreachable("reset".into()).is_stale());
        assert!(!RpcError::OperationNotExist("findAdapter".into()).is_stale());
        assert!(!RpcError::Malformed("bad".into()).is_stale());
    }

    #[test]
    fn not_found_groups_both_failure_surfaces() {
        let key = QueryKey::Adapter("A1".into());
        assert!(DiscoveryError::NotFound(key.clone()).is_not_found());
        assert!(DiscoveryError::NoNetworkPath(key).is_not_found());
        assert!(!DiscoveryError::Shutdown.is_not_found());
    }
}
