//! Cluster State Module
//!
//! Members, membership events and listeners, the process-local cluster
//! context, and the message history used for replay.

pub mod buffer;
mod context;
mod listener;
mod member;
mod received;

pub use buffer::{BufferStats, ClusterMessage, MessageBuffer, Sequence};
pub use context::{ClusterContext, ClusterSummary, MemberInfo};
pub use listener::{FnListener, ListenerId, MembershipListener};
pub use member::{ClusterMember, EventKind, MembershipEvent};
pub use received::ReceivedMessages;
