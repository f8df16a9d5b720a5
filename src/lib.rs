//! WolfCluster - Cluster Membership and Message Replication
//!
//! A cluster coordinator that tracks which nodes are members of a cluster
//! and makes sure every member sees every broadcast message, including
//! members that join after the message was sent.
//!
//! # Architecture
//!
//! Membership discovery is delegated to a pluggable [`MembershipScheme`]
//! (well-known addresses, UDP broadcast beacons, tag-filtered instance
//! directories, or an in-process hub for tests). The [`Coordinator`] keeps
//! the authoritative member list, fans membership changes out to listeners,
//! and buffers recent messages so that a newly joined member receives
//! everything it missed, in order, after a grace period.
//!
//! # Features
//!
//! - Exactly-once delivery of buffered messages across the join race
//! - Bounded replay retries with exponential backoff and jitter
//! - Listener failure isolation
//! - Length-prefixed, checksummed peer transport over TCP
//! - HTTP API for status and broadcast ingress
//!
//! [`MembershipScheme`]: scheme::MembershipScheme

pub mod api;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod replay;
pub mod scheme;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::WolfClusterConfig;
pub use coordinator::Coordinator;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{
        ClusterMember, ClusterMessage, FnListener, MembershipEvent, MembershipListener,
    };
    pub use crate::config::WolfClusterConfig;
    pub use crate::coordinator::{BroadcastReceipt, Coordinator};
    pub use crate::error::{Error, Result};
    pub use crate::scheme::{MembershipScheme, SchemeRegistry};
}
