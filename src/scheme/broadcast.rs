//! UDP Broadcast Discovery
//!
//! Members broadcast a presence beacon on the local subnet and listen for
//! the beacons of others. A peer whose beacons stop for `member_timeout_ms`
//! is reported as gone.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::params::CommonSettings;
use super::peer::PeerEndpoint;
use super::tracker::SchemeHandlers;
use super::{MemberHandler, MembershipScheme, MessageHandler, SchemeContext};
use crate::cluster::{ClusterMember, ClusterMessage};
use crate::error::{Error, Result};

const DEFAULT_DISCOVERY_PORT: u16 = 7654;
const DEFAULT_BEACON_INTERVAL_MS: u64 = 2000;
const DEFAULT_MEMBER_TIMEOUT_MS: u64 = 10_000;

/// Beacon prefix
const BEACON_PREFIX: &str = "WOLFCLUSTER";

/// Beacon format version
const BEACON_VERSION: u8 = 1;

/// Presence beacon contents
#[derive(Debug, Clone, PartialEq, Eq)]
struct Beacon {
    domain: String,
    member_id: String,
    address: String,
}

fn format_beacon(domain: &str, member_id: &str, address: &str) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        BEACON_PREFIX, BEACON_VERSION, domain, member_id, address
    )
}

fn parse_beacon(message: &str) -> Option<Beacon> {
    let parts: Vec<&str> = message.split('|').collect();
    if parts.len() != 5 || parts[0] != BEACON_PREFIX {
        return None;
    }

    let version: u8 = parts[1].parse().ok()?;
    if version != BEACON_VERSION || parts[3].is_empty() {
        return None;
    }

    Some(Beacon {
        domain: parts[2].to_string(),
        member_id: parts[3].to_string(),
        address: parts[4].to_string(),
    })
}

struct BroadcastState {
    endpoint: PeerEndpoint,
    settings: CommonSettings,
    port: u16,
    beacon_interval: Duration,
    member_timeout: Duration,
}

impl BroadcastState {
    /// Turn a received datagram into a peer sighting
    fn accept(&self, datagram: &[u8], src: SocketAddr) -> Option<ClusterMember> {
        let beacon = parse_beacon(std::str::from_utf8(datagram).ok()?)?;

        if beacon.member_id == self.endpoint.local().id() {
            return None;
        }
        if beacon.domain != self.endpoint.domain() {
            tracing::debug!(
                "Ignoring beacon from {} in domain {} (we are {})",
                beacon.member_id,
                beacon.domain,
                self.endpoint.domain()
            );
            return None;
        }

        let member = ClusterMember::from_address(beacon.member_id, &beacon.address);
        if member.is_none() {
            tracing::debug!("Ignoring beacon from {} with bad address {}", src, beacon.address);
        }
        member
    }
}

/// Membership scheme over UDP broadcast beacons
pub struct BroadcastScheme {
    handlers: Arc<SchemeHandlers>,
    state: OnceLock<Arc<BroadcastState>>,
    cancel: CancellationToken,
}

impl BroadcastScheme {
    pub const NAME: &'static str = "broadcast";

    pub fn new() -> Self {
        Self {
            handlers: Arc::new(SchemeHandlers::default()),
            state: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn state(&self) -> Result<&Arc<BroadcastState>> {
        self.state
            .get()
            .ok_or_else(|| Error::Init("broadcast scheme is not initialized".into()))
    }
}

impl Default for BroadcastScheme {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipScheme for BroadcastScheme {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&self, ctx: &SchemeContext) -> Result<()> {
        let params = ctx.params();
        let settings = CommonSettings::from_parameters(&params)?;
        let port = params.parse_or("discovery.port", DEFAULT_DISCOVERY_PORT)?;
        let beacon_interval = params.millis_or("beacon_interval_ms", DEFAULT_BEACON_INTERVAL_MS)?;
        let member_timeout = params.millis_or("member_timeout_ms", DEFAULT_MEMBER_TIMEOUT_MS)?;

        if member_timeout <= beacon_interval {
            return Err(Error::InvalidParameter {
                key: "member_timeout_ms".into(),
                reason: "must be longer than beacon_interval_ms".into(),
            });
        }

        let state = BroadcastState {
            endpoint: PeerEndpoint::new(ctx, &settings, Arc::clone(&self.handlers)),
            settings,
            port,
            beacon_interval,
            member_timeout,
        };
        self.state
            .set(Arc::new(state))
            .map_err(|_| Error::Init("broadcast scheme is already initialized".into()))
    }

    async fn join_cluster(&self) -> Result<()> {
        let state = Arc::clone(self.state()?);
        state.endpoint.start().await?;

        let sender = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::Join(format!("Failed to bind broadcast socket: {}", e)))?;
        sender
            .set_broadcast(true)
            .map_err(|e| Error::Join(format!("Failed to enable broadcast: {}", e)))?;

        let listener = UdpSocket::bind(("0.0.0.0", state.port))
            .await
            .map_err(|e| Error::Join(format!("Failed to bind discovery port {}: {}", state.port, e)))?;

        tracing::info!("Broadcast discovery on UDP port {}", state.port);

        // Beacons, plus expiry of silent peers on the same tick
        let s = Arc::clone(&state);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let target = SocketAddr::from(([255, 255, 255, 255], s.port));
            let beacon = format_beacon(
                s.endpoint.domain(),
                s.endpoint.local().id(),
                &s.endpoint.local().address(),
            );
            let mut interval = tokio::time::interval(s.beacon_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = sender.send_to(beacon.as_bytes(), target).await {
                            tracing::trace!("Beacon send failed (network may not support broadcast): {}", e);
                        }
                        s.endpoint.tracker().expire(s.member_timeout, s.endpoint.handlers());
                    }
                }
            }
        });

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = listener.recv_from(&mut buf) => {
                        match received {
                            Ok((len, src)) => {
                                if let Some(member) = state.accept(&buf[..len], src) {
                                    state.endpoint.tracker().observe(member, state.endpoint.handlers());
                                }
                            }
                            Err(e) => tracing::trace!("Discovery recv error: {}", e),
                        }
                    }
                }
            }
            tracing::debug!("Broadcast discovery stopped");
        });

        Ok(())
    }

    async fn leave_cluster(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(state) = self.state.get() {
            state.endpoint.stop().await;
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
        self.state()?.endpoint.deliver(member, message, true).await
    }

    async fn publish(&self, recipients: &[ClusterMember], message: &ClusterMessage) -> Result<()> {
        self.state()?.endpoint.publish(recipients, message).await
    }

    fn grace_period(&self) -> Duration {
        self.state
            .get()
            .map(|s| s.settings.grace_period)
            .unwrap_or(CommonSettings::default().grace_period)
    }

    fn join_latency(&self) -> Duration {
        match self.state.get() {
            Some(s) => s.beacon_interval + s.settings.request_timeout,
            None => {
                Duration::from_millis(DEFAULT_BEACON_INTERVAL_MS)
                    + CommonSettings::default().request_timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn state(id: &str, domain: &str) -> BroadcastState {
        let ctx = SchemeContext {
            local_member: ClusterMember::new(id, "10.0.0.1", 4000),
            domain: domain.into(),
            bind_address: "127.0.0.1:0".into(),
            parameters: HashMap::new(),
        };
        let settings = CommonSettings::default();
        BroadcastState {
            endpoint: PeerEndpoint::new(&ctx, &settings, Arc::new(SchemeHandlers::default())),
            settings,
            port: DEFAULT_DISCOVERY_PORT,
            beacon_interval: Duration::from_secs(2),
            member_timeout: Duration::from_secs(10),
        }
    }

    fn src() -> SocketAddr {
        "10.0.0.9:7654".parse().unwrap()
    }

    #[test]
    fn test_format_parse_beacon() {
        let beacon = format_beacon("prod", "node-1", "10.0.10.115:4000");
        assert_eq!(
            parse_beacon(&beacon),
            Some(Beacon {
                domain: "prod".into(),
                member_id: "node-1".into(),
                address: "10.0.10.115:4000".into(),
            })
        );

        assert_eq!(parse_beacon("WOLFSCALE|1|prod|node-1|10.0.0.1:1"), None);
        assert_eq!(parse_beacon("WOLFCLUSTER|2|prod|node-1|10.0.0.1:1"), None);
        assert_eq!(parse_beacon("WOLFCLUSTER|1|prod||10.0.0.1:1"), None);
    }

    #[test]
    fn test_accept_filters_self_and_other_domains() {
        let state = state("node-1", "prod");

        let own = format_beacon("prod", "node-1", "10.0.0.1:4000");
        assert!(state.accept(own.as_bytes(), src()).is_none());

        let foreign = format_beacon("staging", "node-2", "10.0.0.2:4000");
        assert!(state.accept(foreign.as_bytes(), src()).is_none());

        let peer = format_beacon("prod", "node-2", "10.0.0.2:4000");
        let member = state.accept(peer.as_bytes(), src()).unwrap();
        assert_eq!(member.id(), "node-2");
        assert_eq!(member.address(), "10.0.0.2:4000");

        assert!(state.accept(&[0xff, 0xfe], src()).is_none());
    }

    #[tokio::test]
    async fn test_member_timeout_must_exceed_beacon_interval() {
        let scheme = BroadcastScheme::new();
        let mut parameters = HashMap::new();
        parameters.insert("beacon_interval_ms".to_string(), "5000".to_string());
        parameters.insert("member_timeout_ms".to_string(), "1000".to_string());
        let ctx = SchemeContext {
            local_member: ClusterMember::new("node-1", "127.0.0.1", 4000),
            domain: "prod".into(),
            bind_address: "127.0.0.1:4000".into(),
            parameters,
        };

        assert!(matches!(
            scheme.initialize(&ctx).await,
            Err(Error::InvalidParameter { .. })
        ));
    }
}
