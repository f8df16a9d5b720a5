//! Well-known address discovery
//!
//! A fixed list of member addresses is probed on an interval. Every probe
//! carries the local member, so a node that knows one well-known member is
//! learned by it immediately and spreads from there as others probe.
//! Peers that miss `max_missed_probes` consecutive probes are dropped.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::params::CommonSettings;
use super::peer::PeerEndpoint;
use super::tracker::SchemeHandlers;
use super::{MemberHandler, MembershipScheme, MessageHandler, SchemeContext};
use crate::cluster::{ClusterMember, ClusterMessage};
use crate::error::{Error, Result};

const DEFAULT_PROBE_INTERVAL_MS: u64 = 2000;
const DEFAULT_MAX_MISSED_PROBES: u32 = 3;

struct WkaState {
    endpoint: PeerEndpoint,
    well_known: Vec<String>,
    settings: CommonSettings,
    probe_interval: Duration,
    max_missed: u32,
}

impl WkaState {
    /// Well-known addresses plus every peer learned so far, minus ourselves
    fn targets(&self) -> BTreeSet<String> {
        let local = self.endpoint.local().address();
        self.well_known
            .iter()
            .cloned()
            .chain(self.endpoint.tracker().peers().iter().map(ClusterMember::address))
            .filter(|a| *a != local)
            .collect()
    }

    async fn probe_round(&self) -> usize {
        let targets = self.targets();
        let probes = targets.iter().map(|address| async move {
            (address, self.endpoint.probe(address).await)
        });

        let mut reachable = 0;
        for (address, result) in join_all(probes).await {
            match result {
                Ok(member) => {
                    reachable += 1;
                    self.endpoint.tracker().observe(member, self.endpoint.handlers());
                }
                Err(e) => {
                    tracing::trace!("Probe of {} failed: {}", address, e);
                    self.endpoint
                        .tracker()
                        .record_miss(address, self.max_missed, self.endpoint.handlers());
                }
            }
        }
        reachable
    }
}

/// Membership scheme over a static address list
pub struct WkaScheme {
    handlers: Arc<SchemeHandlers>,
    state: OnceLock<Arc<WkaState>>,
    cancel: CancellationToken,
}

impl WkaScheme {
    pub const NAME: &'static str = "wka";

    pub fn new() -> Self {
        Self {
            handlers: Arc::new(SchemeHandlers::default()),
            state: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn state(&self) -> Result<&Arc<WkaState>> {
        self.state
            .get()
            .ok_or_else(|| Error::Init("wka scheme is not initialized".into()))
    }

    pub fn peers(&self) -> Vec<ClusterMember> {
        self.state
            .get()
            .map(|s| s.endpoint.tracker().peers())
            .unwrap_or_default()
    }
}

impl Default for WkaScheme {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the comma separated `members` list
fn parse_members(raw: &str) -> Result<Vec<String>> {
    let mut members = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if ClusterMember::from_address("", entry).is_none() {
            return Err(Error::InvalidParameter {
                key: "members".into(),
                reason: format!("'{}' is not a host:port address", entry),
            });
        }
        members.push(entry.to_string());
    }

    if members.is_empty() {
        return Err(Error::MissingParameter("members".into()));
    }
    Ok(members)
}

#[async_trait]
impl MembershipScheme for WkaScheme {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&self, ctx: &SchemeContext) -> Result<()> {
        let params = ctx.params();
        let well_known = parse_members(params.required("members")?)?;
        let settings = CommonSettings::from_parameters(&params)?;
        let probe_interval = params.millis_or("probe_interval_ms", DEFAULT_PROBE_INTERVAL_MS)?;
        let max_missed = params.parse_or("max_missed_probes", DEFAULT_MAX_MISSED_PROBES)?;

        tracing::info!("WKA scheme initialized with {} well-known member(s)", well_known.len());

        let state = WkaState {
            endpoint: PeerEndpoint::new(ctx, &settings, Arc::clone(&self.handlers)),
            well_known,
            settings,
            probe_interval,
            max_missed,
        };
        self.state
            .set(Arc::new(state))
            .map_err(|_| Error::Init("wka scheme is already initialized".into()))
    }

    async fn join_cluster(&self) -> Result<()> {
        let state = Arc::clone(self.state()?);
        state.endpoint.start().await?;

        let reachable = state.probe_round().await;
        if reachable == 0 {
            tracing::info!("No well-known member reachable, starting as the first member");
        }

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(state.probe_interval) => {
                        state.probe_round().await;
                    }
                }
            }
            tracing::debug!("WKA probe loop stopped");
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
            Some(s) => s.probe_interval + s.settings.request_timeout,
            None => {
                Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS)
                    + CommonSettings::default().request_timeout
            }
        }
    }
}
