//! Cluster Coordinator
//!
//! The only writer of cluster state. Scheme callbacks arrive here, update
//! the cluster context, fan out to membership listeners and start replay of
//! the message buffer to new members.
//!
//! A single replication gate orders buffer appends against join snapshots:
//! a broadcast appends and captures its live recipients under the gate, a
//! join inserts the member and snapshots the buffer under the same gate.
//! Every message therefore reaches a joining member exactly once, either in
//! its replay snapshot or through the live path.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cluster::{
    BufferStats, ClusterContext, ClusterMember, ClusterMessage, ClusterSummary, ListenerId,
    MemberInfo, MembershipEvent, MembershipListener, MessageBuffer, ReceivedMessages,
};
use crate::config::WolfClusterConfig;
use crate::error::{Error, Result};
use crate::replay::{ReplayPolicy, Replayer};
use crate::scheme::{MembershipScheme, SchemeContext, SchemeRegistry};

/// Capacity of the inbound message channel
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Starting,
    Running,
    Stopped,
}

struct Inner {
    config: WolfClusterConfig,
    local: ClusterMember,
    scheme: Arc<dyn MembershipScheme>,
    context: ClusterContext,
    buffer: MessageBuffer,
    received: ReceivedMessages,
    /// Orders buffer appends against join snapshots
    gate: Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    replayer: RwLock<Option<Arc<Replayer>>>,
    inbound: broadcast::Sender<ClusterMessage>,
    maintenance: CancellationToken,
}

/// Where a broadcast was routed
#[derive(Debug, Clone)]
pub struct BroadcastReceipt {
    pub message: ClusterMessage,
    /// Members the message was published to directly
    pub live_recipients: usize,
    /// Members still replaying, which receive it after their snapshot
    pub queued_recipients: usize,
}

impl BroadcastReceipt {
    pub fn recipients(&self) -> usize {
        self.live_recipients + self.queued_recipients
    }
}

/// Handle to the cluster coordinator; clones share one instance
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Coordinator using the built-in scheme named in the config
    pub fn new(config: WolfClusterConfig) -> Result<Self> {
        Self::with_registry(config, &SchemeRegistry::with_builtin())
    }

    /// Coordinator resolving its scheme from `registry`
    pub fn with_registry(config: WolfClusterConfig, registry: &SchemeRegistry) -> Result<Self> {
        let scheme = registry.create(&config.cluster.membership_scheme)?;
        Self::with_scheme(config, scheme)
    }

    /// Coordinator over an explicitly constructed scheme
    pub fn with_scheme(config: WolfClusterConfig, scheme: Arc<dyn MembershipScheme>) -> Result<Self> {
        config.validate()?;
        let local = config.local_member()?;

        let retention = config.buffer.retention();
        let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);

        let inner = Inner {
            local,
            scheme,
            context: ClusterContext::new(config.cluster.clone()),
            buffer: MessageBuffer::new(config.buffer.capacity, retention),
            received: ReceivedMessages::new(retention),
            gate: Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle::Created),
            replayer: RwLock::new(None),
            inbound,
            maintenance: CancellationToken::new(),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Initialize the scheme and join the cluster
    ///
    /// Scheme initialization and join failures are fatal and returned; the
    /// coordinator cannot be started again afterwards.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut lifecycle = inner.lifecycle();
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Starting,
                Lifecycle::Starting | Lifecycle::Running => return Err(Error::AlreadyRunning),
                Lifecycle::Stopped => {
                    return Err(Error::Init("a stopped coordinator cannot be restarted".into()))
                }
            }
        }

        match self.start_inner().await {
            Ok(()) => {
                tracing::info!(
                    "Coordinator for {} started with '{}' membership scheme",
                    inner.local,
                    inner.scheme.name()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Coordinator failed to start: {}", e);
                if let Some(replayer) = inner.take_replayer() {
                    replayer.shutdown().await;
                }
                inner.context.teardown();
                // Schemes cannot be initialized twice
                *inner.lifecycle() = Lifecycle::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let inner = &self.inner;
        let scheme = &inner.scheme;

        let weak = Arc::downgrade(inner);
        scheme.on_member_joined(Arc::new(move |member| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_member_joined(member);
            }
        }));
        let weak = Arc::downgrade(inner);
        scheme.on_member_left(Arc::new(move |member| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_member_left(member);
            }
        }));
        let weak = Arc::downgrade(inner);
        scheme.on_message(Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(message);
            }
        }));

        let ctx = SchemeContext {
            local_member: inner.local.clone(),
            domain: inner.config.cluster.domain.clone(),
            bind_address: inner.config.node.bind_address.clone(),
            parameters: inner.config.cluster.parameters.clone(),
        };
        scheme.initialize(&ctx).await?;

        let join_latency = scheme.join_latency();
        let retention = inner.buffer.retention();
        if retention <= join_latency * 2 {
            return Err(Error::Init(format!(
                "buffer retention {:?} must exceed twice the '{}' scheme's join latency ({:?})",
                retention,
                scheme.name(),
                join_latency
            )));
        }
        inner.buffer.set_join_window(join_latency);

        let policy = ReplayPolicy::from_config(&inner.config.replay, scheme.grace_period());
        tracing::debug!("Replay policy: {:?}", policy);
        *inner.replayer.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(
            Replayer::new(Arc::clone(scheme), policy, inner.config.replay.workers),
        ));

        // Members reported while joining must already be handled
        *inner.lifecycle() = Lifecycle::Running;
        if let Err(e) = scheme.join_cluster().await {
            let _ = scheme.leave_cluster().await;
            return Err(e);
        }

        self.spawn_maintenance();
        Ok(())
    }

    /// Periodically drop expired buffer and received-message entries
    fn spawn_maintenance(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.maintenance.clone();
        let period = self.inner.config.buffer.cleanup_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let messages = inner.buffer.evict_expired();
                        let received = inner.received.evict_expired();
                        if messages + received > 0 {
                            tracing::debug!(
                                "Cleanup evicted {} buffered message(s) and {} received-message record(s)",
                                messages,
                                received
                            );
                        }
                    }
                }
            }
        });
    }

    /// Leave the cluster, cancel replays, clear context and buffer
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut lifecycle = inner.lifecycle();
            if *lifecycle != Lifecycle::Running {
                return Err(Error::NotRunning);
            }
            *lifecycle = Lifecycle::Stopped;
        }

        tracing::info!("Stopping coordinator for {}", inner.local);
        inner.maintenance.cancel();

        if let Some(replayer) = inner.take_replayer() {
            replayer.shutdown().await;
        }
        if let Err(e) = inner.scheme.leave_cluster().await {
            tracing::warn!("Error leaving cluster: {}", e);
        }

        inner.context.teardown();
        inner.buffer.clear();
        inner.received.clear();
        tracing::info!("Coordinator stopped");
        Ok(())
    }

    /// Send a payload to the cluster and buffer it for future members
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> Result<ClusterMessage> {
        self.broadcast_receipt(payload).await.map(|receipt| receipt.message)
    }

    /// Like `broadcast`, also reporting who the message was routed to
    ///
    /// Members whose replay is still registered get the message queued
    /// behind their snapshot; everyone else gets it live.
    pub async fn broadcast_receipt(&self, payload: impl Into<Bytes>) -> Result<BroadcastReceipt> {
        let inner = &self.inner;
        if !inner.is_running() {
            return Err(Error::NotRunning);
        }

        let (message, live, queued) = {
            let _gate = inner.gate();
            let message = inner.buffer.append(inner.local.id(), payload.into());
            let replayer = inner.replayer();
            let (queued, live): (Vec<ClusterMember>, Vec<ClusterMember>) =
                inner.context.members().into_iter().partition(|member| {
                    replayer
                        .as_ref()
                        .is_some_and(|r| r.enqueue(member.id(), &message))
                });
            (message, live, queued.len())
        };

        tracing::debug!(
            "Broadcasting message {} to {} member(s), {} queued behind replay",
            message.sequence,
            live.len(),
            queued
        );
        inner.scheme.publish(&live, &message).await?;
        Ok(BroadcastReceipt {
            message,
            live_recipients: live.len(),
            queued_recipients: queued,
        })
    }

    pub fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) -> ListenerId {
        let id = self.inner.context.add_listener(listener);
        tracing::debug!("Registered membership {}", id);
        id
    }

    pub fn remove_membership_listener(&self, id: ListenerId) -> bool {
        self.inner.context.remove_listener(id)
    }

    /// Messages received from other members, each delivered once
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterMessage> {
        self.inner.inbound.subscribe()
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.inner.context.members()
    }

    pub fn member_infos(&self) -> Vec<MemberInfo> {
        self.inner.context.member_infos()
    }

    pub fn member(&self, id: &str) -> Option<ClusterMember> {
        self.inner.context.member(id)
    }

    pub fn local_member(&self) -> &ClusterMember {
        &self.inner.local
    }

    pub fn config(&self) -> &WolfClusterConfig {
        &self.inner.config
    }

    pub fn scheme_name(&self) -> &str {
        self.inner.scheme.name()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.inner.buffer.stats()
    }

    pub fn summary(&self) -> ClusterSummary {
        self.inner.context.summary()
    }

    /// Replays not yet finished
    pub fn replays_in_flight(&self) -> usize {
        self.inner
            .replayer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |r| r.active_count())
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        *self.lifecycle() == Lifecycle::Running
    }

    fn replayer(&self) -> Option<Arc<Replayer>> {
        self.replayer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_replayer(&self) -> Option<Arc<Replayer>> {
        self.replayer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn handle_member_joined(&self, member: ClusterMember) {
        if !self.is_running() {
            tracing::debug!("Ignoring join of {} while not running", member.id());
            return;
        }
        if member.id() == self.local.id() {
            return;
        }

        // The replay is registered before the gate opens so that every later
        // broadcast is queued behind this snapshot
        let pending = {
            let _gate = self.gate();
            if !self.context.add_member(member.clone()) {
                tracing::debug!("Duplicate join notification for {}", member.id());
                return;
            }
            let snapshot = self.buffer.snapshot();
            self.replayer()
                .and_then(|replayer| replayer.reserve(member.id()).map(|r| (replayer, r, snapshot)))
        };

        tracing::info!("Member joined: {}", member);
        self.context.notify(&MembershipEvent::added(member.clone()));

        match pending {
            Some((replayer, reservation, snapshot)) => {
                replayer.launch(reservation, member, snapshot);
            }
            None => tracing::warn!("No replayer available for {}", member.id()),
        }
    }

    fn handle_member_left(&self, member: ClusterMember) {
        if !self.is_running() {
            return;
        }

        let Some(removed) = self.context.remove_member(member.id()) else {
            tracing::debug!("Ignoring departure of unknown member {}", member.id());
            return;
        };

        if let Some(replayer) = self.replayer() {
            if replayer.cancel(removed.id()) {
                tracing::info!("Cancelled replay to departed member {}", removed.id());
            }
        }

        tracing::info!("Member left: {}", removed);
        self.context.notify(&MembershipEvent::removed(removed));
    }

    fn handle_message(&self, message: ClusterMessage) {
        if !self.is_running() {
            return;
        }
        if !self.received.record(message.uuid) {
            tracing::trace!(
                "Dropping duplicate message {} from {}",
                message.uuid,
                message.origin
            );
            return;
        }

        tracing::trace!("Received message {} from {}", message.sequence, message.origin);
        // No subscribers is fine
        let _ = self.inbound.send(message);
    }
}
