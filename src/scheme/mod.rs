//! Membership Schemes
//!
//! A scheme wraps one discovery mechanism and reports peers joining and
//! leaving. The coordinator only talks to the `MembershipScheme` trait, so
//! discovery can be swapped without touching coordination logic.

pub mod broadcast;
pub mod memory;
mod params;
mod peer;
mod registry;
pub mod tag;
mod tracker;
pub mod wka;

pub use params::{CommonSettings, SchemeParameters};
pub use registry::{SchemeFactory, SchemeRegistry};
pub use tracker::{PeerTracker, SchemeHandlers};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::{ClusterMember, ClusterMessage};
use crate::error::Result;

/// Callback for a peer joining or leaving
pub type MemberHandler = Arc<dyn Fn(ClusterMember) + Send + Sync>;

/// Callback for a message received from a peer
pub type MessageHandler = Arc<dyn Fn(ClusterMessage) + Send + Sync>;

/// Everything a scheme needs to know about the local process
#[derive(Debug, Clone)]
pub struct SchemeContext {
    /// The member this process announces
    pub local_member: ClusterMember,
    /// Cluster domain; peers from other domains are ignored
    pub domain: String,
    /// Address to accept peer traffic on
    pub bind_address: String,
    /// Scheme-specific parameters
    pub parameters: HashMap<String, String>,
}

impl SchemeContext {
    pub fn params(&self) -> SchemeParameters<'_> {
        SchemeParameters::new(&self.parameters)
    }
}

/// Capability interface every discovery mechanism implements
///
/// Handlers may be invoked from any task and concurrently for different
/// peers. Schemes never serialize them.
#[async_trait]
pub trait MembershipScheme: Send + Sync {
    /// Registry name of the scheme
    fn name(&self) -> &str;

    /// Validate and apply configuration. Fails fast on missing or malformed
    /// parameters.
    async fn initialize(&self, ctx: &SchemeContext) -> Result<()>;

    /// Start listening for peers and register the local process
    async fn join_cluster(&self) -> Result<()>;

    /// Deregister and stop all background work
    async fn leave_cluster(&self) -> Result<()>;

    fn on_member_joined(&self, handler: MemberHandler);

    fn on_member_left(&self, handler: MemberHandler);

    fn on_message(&self, handler: MessageHandler);

    /// Point-to-point delivery, used for replay
    ///
    /// Returns once the peer has accepted the message.
    async fn send_to(&self, member: &ClusterMember, message: &ClusterMessage) -> Result<()>;

    /// Live delivery of a broadcast to the given recipients
    async fn publish(&self, recipients: &[ClusterMember], message: &ClusterMessage) -> Result<()>;

    /// How long to wait after a join before the first replay attempt
    fn grace_period(&self) -> Duration;

    /// Worst-case time between a peer starting and the scheme reporting it
    fn join_latency(&self) -> Duration;
}
