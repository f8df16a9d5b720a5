//! TCP endpoint shared by the network-backed schemes
//!
//! Serves probes, deliveries and leave notices from other members and sends
//! the same frames out through a `PeerClient`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;

use super::params::CommonSettings;
use super::tracker::{PeerTracker, SchemeHandlers};
use super::SchemeContext;
use crate::cluster::{ClusterMember, ClusterMessage};
use crate::error::{Error, Result};
use crate::transport::{Frame, FrameHandler, PeerClient, PeerServer};

pub struct PeerEndpoint {
    domain: String,
    local: ClusterMember,
    bind_address: String,
    client: PeerClient,
    tracker: Arc<PeerTracker>,
    handlers: Arc<SchemeHandlers>,
    server: Mutex<Option<Arc<PeerServer>>>,
}

impl PeerEndpoint {
    pub fn new(ctx: &SchemeContext, settings: &CommonSettings, handlers: Arc<SchemeHandlers>) -> Self {
        Self {
            domain: ctx.domain.clone(),
            local: ctx.local_member.clone(),
            bind_address: ctx.bind_address.clone(),
            client: PeerClient::new(settings.connect_timeout, settings.request_timeout),
            tracker: Arc::new(PeerTracker::new(ctx.local_member.id())),
            handlers,
            server: Mutex::new(None),
        }
    }

    /// Keep announced departures out of directory reconciles for `quarantine`
    pub fn with_departure_quarantine(mut self, quarantine: Duration) -> Self {
        self.tracker = Arc::new(PeerTracker::new(self.local.id()).with_quarantine(quarantine));
        self
    }

    pub fn local(&self) -> &ClusterMember {
        &self.local
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn tracker(&self) -> &PeerTracker {
        &self.tracker
    }

    pub fn handlers(&self) -> &SchemeHandlers {
        &self.handlers
    }

    /// Bind the peer port and start serving
    pub async fn start(&self) -> Result<()> {
        let handler = frame_handler(
            self.domain.clone(),
            self.local.clone(),
            Arc::clone(&self.tracker),
            Arc::clone(&self.handlers),
        );
        let server = Arc::new(PeerServer::new(self.bind_address.clone(), handler));
        let listener = server
            .bind()
            .await
            .map_err(|e| Error::Join(e.to_string()))?;

        let s = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = s.serve(listener).await {
                tracing::error!("Peer server failed: {}", e);
            }
        });

        *self.server.lock().unwrap_or_else(PoisonError::into_inner) = Some(server);
        Ok(())
    }

    /// Tell known peers we are leaving, then stop serving
    pub async fn stop(&self) {
        let notice = Frame::Leave {
            domain: self.domain.clone(),
            member_id: self.local.id().to_string(),
        };
        let peers = self.tracker.peers();
        let sends = peers.iter().map(|peer| {
            let address = peer.address();
            let notice = &notice;
            async move {
                if let Err(e) = self.client.request(&address, notice).await {
                    tracing::debug!("Leave notice to {} failed: {}", address, e);
                }
            }
        });
        join_all(sends).await;

        let server = self.server.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(server) = server {
            server.stop();
        }
        self.tracker.clear();
    }

    /// Ask the peer at `address` who it is
    pub async fn probe(&self, address: &str) -> Result<ClusterMember> {
        let ping = Frame::Ping {
            domain: self.domain.clone(),
            member: self.local.clone(),
        };
        match self.client.request(address, &ping).await? {
            Frame::Pong { member } => Ok(member),
            Frame::Error { reason } => Err(Error::Network(format!("{} refused probe: {}", address, reason))),
            other => Err(Error::Network(format!(
                "{} answered probe with {}",
                address,
                other.type_name()
            ))),
        }
    }

    /// Deliver one message and wait for the receiver to accept it
    pub async fn deliver(&self, member: &ClusterMember, message: &ClusterMessage, replay: bool) -> Result<()> {
        let frame = Frame::Deliver {
            message: message.clone(),
            replay,
        };
        let response = self
            .client
            .request(&member.address(), &frame)
            .await
            .map_err(|e| Error::send(member.id(), e))?;

        match response {
            Frame::Ack { uuid } if uuid == message.uuid => Ok(()),
            Frame::Error { reason } => Err(Error::send(member.id(), reason)),
            other => Err(Error::send(
                member.id(),
                format!("unexpected {} response", other.type_name()),
            )),
        }
    }

    /// Live delivery to every recipient concurrently; failures are logged
    pub async fn publish(&self, recipients: &[ClusterMember], message: &ClusterMessage) -> Result<()> {
        let sends = recipients.iter().map(|member| async move {
            if let Err(e) = self.deliver(member, message, false).await {
                tracing::warn!("Live delivery of message {} failed: {}", message.sequence, e);
            }
        });
        join_all(sends).await;
        Ok(())
    }
}

fn frame_handler(
    domain: String,
    local: ClusterMember,
    tracker: Arc<PeerTracker>,
    handlers: Arc<SchemeHandlers>,
) -> FrameHandler {
    Arc::new(move |peer: SocketAddr, frame: Frame| match frame {
        Frame::Ping { domain: theirs, member } => {
            if theirs != domain {
                tracing::debug!(
                    "Ignoring probe from {} ({}) in domain {} (we are {})",
                    member.id(),
                    peer,
                    theirs,
                    domain
                );
                return Frame::Error {
                    reason: format!("domain mismatch: {}", domain),
                };
            }
            tracker.observe(member, &handlers);
            Frame::Pong { member: local.clone() }
        }
        Frame::Deliver { message, replay } => {
            let uuid = message.uuid;
            tracing::trace!(
                "Received {} message {} from {}",
                if replay { "replayed" } else { "live" },
                message.sequence,
                message.origin
            );
            if handlers.message(message) {
                Frame::Ack { uuid }
            } else {
                Frame::Error {
                    reason: "not ready to accept messages".into(),
                }
            }
        }
        Frame::Leave { domain: theirs, member_id } => {
            if theirs == domain {
                tracker.depart(&member_id, &handlers);
            }
            Frame::LeaveAck
        }
        other => Frame::Error {
            reason: format!("unexpected {} request", other.type_name()),
        },
    })
}
