//! In-process membership
//!
//! A `MemoryNetwork` hub connects any number of `InMemoryScheme`s living in
//! the same process. Joining the hub reports every existing member of the
//! same domain to the newcomer and the newcomer to them. Deliveries are
//! direct handler calls, with per-member fault injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::tracker::SchemeHandlers;
use super::{MemberHandler, MembershipScheme, MessageHandler, SchemeContext};
use crate::cluster::{ClusterMember, ClusterMessage, Sequence};
use crate::error::{Error, Result};

/// Fault switches for one member
#[derive(Debug, Default)]
pub struct Faults {
    unreachable: AtomicBool,
    fail_next: AtomicU32,
}

impl Faults {
    /// Refuse every delivery while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Refuse the next `count` deliveries
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        if self.unreachable.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// One accepted delivery, as recorded by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: String,
    pub uuid: Uuid,
    pub sequence: Sequence,
    pub replay: bool,
}

struct Node {
    member: ClusterMember,
    domain: String,
    handlers: Arc<SchemeHandlers>,
    faults: Arc<Faults>,
}

#[derive(Default)]
struct Hub {
    nodes: HashMap<String, Node>,
    deliveries: Vec<Delivery>,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, node: Node) -> Result<()> {
        let member = node.member.clone();
        let handlers = Arc::clone(&node.handlers);

        let existing: Vec<(ClusterMember, Arc<SchemeHandlers>)> = {
            let mut hub = self.lock();
            if hub.nodes.contains_key(member.id()) {
                return Err(Error::Join(format!("{} is already on the network", member.id())));
            }
            let peers = hub
                .nodes
                .values()
                .filter(|n| n.domain == node.domain)
                .map(|n| (n.member.clone(), Arc::clone(&n.handlers)))
                .collect();
            hub.nodes.insert(member.id().to_string(), node);
            peers
        };

        for (peer, peer_handlers) in existing {
            peer_handlers.member_joined(member.clone());
            handlers.member_joined(peer);
        }
        Ok(())
    }

    fn leave(&self, id: &str) {
        let (member, peers) = {
            let mut hub = self.lock();
            let Some(node) = hub.nodes.remove(id) else {
                return;
            };
            let peers: Vec<Arc<SchemeHandlers>> = hub
                .nodes
                .values()
                .filter(|n| n.domain == node.domain)
                .map(|n| Arc::clone(&n.handlers))
                .collect();
            (node.member, peers)
        };

        for handlers in peers {
            handlers.member_left(member.clone());
        }
    }

    fn deliver(&self, to: &ClusterMember, message: &ClusterMessage, replay: bool) -> Result<()> {
        let (handlers, faults) = {
            let hub = self.lock();
            let node = hub
                .nodes
                .get(to.id())
                .ok_or_else(|| Error::send(to.id(), "not on the network"))?;
            (Arc::clone(&node.handlers), Arc::clone(&node.faults))
        };

        if faults.should_fail() {
            return Err(Error::send(to.id(), "connection refused"));
        }
        if !handlers.message(message.clone()) {
            return Err(Error::send(to.id(), "not ready to accept messages"));
        }

        self.lock().deliveries.push(Delivery {
            to: to.id().to_string(),
            uuid: message.uuid,
            sequence: message.sequence,
            replay,
        });
        Ok(())
    }

    /// Report `member` as joined to the node `observer` (a redelivery)
    pub fn notify_joined(&self, observer: &str, member: ClusterMember) {
        let handlers = self.lock().nodes.get(observer).map(|n| Arc::clone(&n.handlers));
        if let Some(handlers) = handlers {
            handlers.member_joined(member);
        }
    }

    /// Report `member` as departed to the node `observer`
    pub fn notify_left(&self, observer: &str, member: ClusterMember) {
        let handlers = self.lock().nodes.get(observer).map(|n| Arc::clone(&n.handlers));
        if let Some(handlers) = handlers {
            handlers.member_left(member);
        }
    }

    /// Accepted deliveries to `member_id`, in arrival order
    pub fn deliveries_to(&self, member_id: &str) -> Vec<Delivery> {
        self.lock()
            .deliveries
            .iter()
            .filter(|d| d.to == member_id)
            .cloned()
            .collect()
    }

    pub fn member_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().nodes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    InitFailure(String),
    JoinFailure(String),
}

/// Membership scheme over a `MemoryNetwork`
pub struct InMemoryScheme {
    network: MemoryNetwork,
    handlers: Arc<SchemeHandlers>,
    faults: Arc<Faults>,
    local: OnceLock<(ClusterMember, String)>,
    grace_period: Duration,
    join_latency: Duration,
    scripted: Option<Scripted>,
}

impl InMemoryScheme {
    pub const NAME: &'static str = "memory";

    pub fn new(network: MemoryNetwork) -> Self {
        Self {
            network,
            handlers: Arc::new(SchemeHandlers::default()),
            faults: Arc::new(Faults::default()),
            local: OnceLock::new(),
            grace_period: Duration::ZERO,
            join_latency: Duration::from_millis(100),
            scripted: None,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_join_latency(mut self, join_latency: Duration) -> Self {
        self.join_latency = join_latency;
        self
    }

    /// Make `initialize` fail with `Error::Init`
    pub fn failing_init(mut self, reason: impl Into<String>) -> Self {
        self.scripted = Some(Scripted::InitFailure(reason.into()));
        self
    }

    /// Make `join_cluster` fail with `Error::Join`
    pub fn failing_join(mut self, reason: impl Into<String>) -> Self {
        self.scripted = Some(Scripted::JoinFailure(reason.into()));
        self
    }

    /// Fault switches applied to deliveries addressed to this member
    pub fn faults(&self) -> Arc<Faults> {
        Arc::clone(&self.faults)
    }

    fn local(&self) -> Result<&(ClusterMember, String)> {
        self.local
            .get()
            .ok_or_else(|| Error::Init("memory scheme is not initialized".into()))
    }
}

#[async_trait]
impl MembershipScheme for InMemoryScheme {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&self, ctx: &SchemeContext) -> Result<()> {
        if let Some(Scripted::InitFailure(reason)) = &self.scripted {
            return Err(Error::Init(reason.clone()));
        }
        self.local
            .set((ctx.local_member.clone(), ctx.domain.clone()))
            .map_err(|_| Error::Init("memory scheme is already initialized".into()))
    }

    async fn join_cluster(&self) -> Result<()> {
        if let Some(Scripted::JoinFailure(reason)) = &self.scripted {
            return Err(Error::Join(reason.clone()));
        }
        let (member, domain) = self.local()?.clone();
        self.network.join(Node {
            member,
            domain,
            handlers: Arc::clone(&self.handlers),
            faults: Arc::clone(&self.faults),
        })
    }

    async fn leave_cluster(&self) -> Result<()> {
        if let Ok((member, _)) = self.local() {
            self.network.leave(member.id());
        }
        Ok(())
    }

    fn on_member_joined(&self, handler: MemberHandler) {
        self.handlers.set_joined(handler);
    }

    fn on_member_left(&self, handler: MemberHandler) {
        self.handlers.set_left(handler);
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    async fn send_to(&self, member: &ClusterMember, message: &ClusterMessage) -> Result<()> {
        self.network.deliver(member, message, true)
    }

    async fn publish(&self, recipients: &[ClusterMember], message: &ClusterMessage) -> Result<()> {
        for member in recipients {
            if let Err(e) = self.network.deliver(member, message, false) {
                tracing::warn!("Live delivery of message {} failed: {}", message.sequence, e);
            }
        }
        Ok(())
    }

    fn grace_period(&self) -> Duration {
        self.grace_period
    }

    fn join_latency(&self) -> Duration {
        self.join_latency
    }
}
