//! Cluster members and membership events

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identity of one cluster participant
///
/// Members are immutable once constructed and compare by `id` only, so the
/// same process reported twice with a different address or property set is
/// still the same member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Unique member identifier
    id: String,
    /// Host name or IP address
    host: String,
    /// Port the member accepts peer traffic on
    port: u16,
    /// Opaque properties (role tags, capabilities)
    properties: BTreeMap<String, String>,
}

impl ClusterMember {
    /// Create a member without properties
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            properties: BTreeMap::new(),
        }
    }

    /// Create a member from an id and a `host:port` address
    pub fn from_address(id: impl Into<String>, address: &str) -> Option<Self> {
        let (host, port) = address.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(id, host, port))
    }

    /// Attach properties, consuming the member
    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Look up a single property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Network address as `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for ClusterMember {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClusterMember {}

impl Hash for ClusterMember {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.id, self.host, self.port)
    }
}

/// Kind of membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Removed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Added => write!(f, "ADDED"),
            EventKind::Removed => write!(f, "REMOVED"),
        }
    }
}

/// A membership change, handed to listeners by value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub kind: EventKind,
    pub member: ClusterMember,
}

impl MembershipEvent {
    pub fn added(member: ClusterMember) -> Self {
        Self {
            kind: EventKind::Added,
            member,
        }
    }

    pub fn removed(member: ClusterMember) -> Self {
        Self {
            kind: EventKind::Removed,
            member,
        }
    }
}
