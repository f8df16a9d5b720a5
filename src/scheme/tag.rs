//! Tag-based discovery
//!
//! Peers are the instances of an inventory service (cloud provider API or a
//! compatible HTTP endpoint) that carry a given tag. The directory is polled
//! on an interval and every poll result is reconciled against the known
//! peer set.
//!
//! Parameters:
//! - `tag.key`, `tag.value`: the tag filter (required)
//! - `directory.url`: instance directory endpoint (required)
//! - `poll_interval_ms`: default 10000
//! - `credentials.token_env`: environment variable holding a bearer token

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::params::CommonSettings;
use super::peer::PeerEndpoint;
use super::tracker::SchemeHandlers;
use super::{MemberHandler, MembershipScheme, MessageHandler, SchemeContext};
use crate::cluster::{ClusterMember, ClusterMessage};
use crate::error::{Error, Result};

const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// One instance as reported by the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    /// Peer address as `host:port`
    pub address: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Lifecycle state; instances other than "running" are skipped
    #[serde(default)]
    pub state: Option<String>,
}

impl Instance {
    pub fn running(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            tags: BTreeMap::new(),
            state: Some("running".into()),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Source of instance listings
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    async fn instances(&self) -> Result<Vec<Instance>>;
}

/// Directory served as a JSON array over HTTP
pub struct HttpInstanceDirectory {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpInstanceDirectory {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Init(format!("Failed to build directory client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl InstanceDirectory for HttpInstanceDirectory {
    async fn instances(&self) -> Result<Vec<Instance>> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Network(format!("Instance directory {}: {}", self.url, e)))?;

        response
            .json::<Vec<Instance>>()
            .await
            .map_err(|e| Error::Network(format!("Invalid instance listing from {}: {}", self.url, e)))
    }
}

/// Fixed, replaceable listing; used for embedding and tests
#[derive(Default)]
pub struct StaticInstanceDirectory {
    instances: RwLock<Vec<Instance>>,
}

impl StaticInstanceDirectory {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self {
            instances: RwLock::new(instances),
        }
    }

    pub fn set(&self, instances: Vec<Instance>) {
        *self.instances.write().unwrap_or_else(PoisonError::into_inner) = instances;
    }
}

#[async_trait]
impl InstanceDirectory for StaticInstanceDirectory {
    async fn instances(&self) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Selects the instances that belong to the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

impl TagFilter {
    pub fn matches(&self, instance: &Instance) -> bool {
        let running = instance
            .state
            .as_deref()
            .map_or(true, |s| s.eq_ignore_ascii_case("running"));
        running && instance.tags.get(&self.key) == Some(&self.value)
    }
}

struct TagState {
    endpoint: PeerEndpoint,
    directory: Arc<dyn InstanceDirectory>,
    filter: TagFilter,
    settings: CommonSettings,
    poll_interval: Duration,
}

impl TagState {
    async fn poll(&self) -> Result<usize> {
        let instances = self.directory.instances().await?;
        let members: Vec<ClusterMember> = instances
            .iter()
            .filter(|i| self.filter.matches(i))
            .filter_map(|i| {
                let member = ClusterMember::from_address(i.id.clone(), &i.address);
                if member.is_none() {
                    tracing::warn!("Skipping instance {} with invalid address '{}'", i.id, i.address);
                }
                member.map(|m| m.with_properties(i.tags.clone()))
            })
            .filter(|m| m.id() != self.endpoint.local().id())
            .collect();

        let count = members.len();
        self.endpoint.tracker().reconcile(members, self.endpoint.handlers());
        Ok(count)
    }
}

/// Membership scheme backed by tagged instances
pub struct TagScheme {
    handlers: Arc<SchemeHandlers>,
    directory: Option<Arc<dyn InstanceDirectory>>,
    state: OnceLock<Arc<TagState>>,
    cancel: CancellationToken,
}

impl TagScheme {
    pub const NAME: &'static str = "tag";

    pub fn new() -> Self {
        Self {
            handlers: Arc::new(SchemeHandlers::default()),
            directory: None,
            state: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use the given directory instead of `directory.url`
    pub fn with_directory(directory: Arc<dyn InstanceDirectory>) -> Self {
        Self {
            directory: Some(directory),
            ..Self::new()
        }
    }

    fn state(&self) -> Result<&Arc<TagState>> {
        self.state
            .get()
            .ok_or_else(|| Error::Init("tag scheme is not initialized".into()))
    }

    /// Peers currently matching the filter
    pub fn peers(&self) -> Vec<ClusterMember> {
        self.state
            .get()
            .map(|s| s.endpoint.tracker().peers())
            .unwrap_or_default()
    }
}

impl Default for TagScheme {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipScheme for TagScheme {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&self, ctx: &SchemeContext) -> Result<()> {
        let params = ctx.params();
        let filter = TagFilter {
            key: params.required("tag.key")?.to_string(),
            value: params.required("tag.value")?.to_string(),
        };
        let settings = CommonSettings::from_parameters(&params)?;
        let poll_interval = params.millis_or("poll_interval_ms", DEFAULT_POLL_INTERVAL_MS)?;

        let directory: Arc<dyn InstanceDirectory> = match &self.directory {
            Some(directory) => Arc::clone(directory),
            None => {
                let url = params.required("directory.url")?;
                let token = match params.optional("credentials.token_env") {
                    Some(var) => Some(std::env::var(var).map_err(|_| {
                        Error::Init(format!(
                            "credentials.token_env names '{}' but it is not set",
                            var
                        ))
                    })?),
                    None => None,
                };
                Arc::new(HttpInstanceDirectory::new(url, token, settings.request_timeout)?)
            }
        };

        let state = TagState {
            // The directory keeps listing a leaving instance until it stops
            endpoint: PeerEndpoint::new(ctx, &settings, Arc::clone(&self.handlers))
                .with_departure_quarantine(poll_interval * 2),
            directory,
            filter,
            settings,
            poll_interval,
        };
        self.state
            .set(Arc::new(state))
            .map_err(|_| Error::Init("tag scheme is already initialized".into()))?;

        tracing::info!(
            "Tag scheme initialized: {}={} (poll every {:?})",
            params.required("tag.key")?,
            params.required("tag.value")?,
            poll_interval
        );
        Ok(())
    }

    async fn join_cluster(&self) -> Result<()> {
        let state = Arc::clone(self.state()?);
        state.endpoint.start().await?;

        let found = state
            .poll()
            .await
            .map_err(|e| Error::Join(format!("initial peer resolution failed: {}", e)))?;
        tracing::info!("Tag scheme resolved {} peer(s)", found);

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(state.poll_interval) => {
                        if let Err(e) = state.poll().await {
                            tracing::warn!("Instance directory poll failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Tag scheme poll loop stopped");
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
            Some(s) => s.poll_interval + s.settings.request_timeout,
            None => {
                Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
                    + CommonSettings::default().request_timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{free_address, wait_until};
    use crate::transport::{Frame, PeerClient};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn context(id: &str, address: &str, params: &[(&str, &str)]) -> SchemeContext {
        SchemeContext {
            local_member: ClusterMember::from_address(id, address).unwrap(),
            domain: "test".into(),
            bind_address: address.to_string(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    const TAGGED: &[(&str, &str)] = &[
        ("tag.key", "cluster"),
        ("tag.value", "prod"),
        ("poll_interval_ms", "50"),
    ];

    #[test]
    fn test_filter_requires_tag_and_running_state() {
        let filter = TagFilter {
            key: "cluster".into(),
            value: "prod".into(),
        };

        assert!(filter.matches(&Instance::running("a", "h:1").with_tag("cluster", "prod")));
        assert!(!filter.matches(&Instance::running("b", "h:1").with_tag("cluster", "dev")));

        let mut stopped = Instance::running("c", "h:1").with_tag("cluster", "prod");
        stopped.state = Some("stopped".into());
        assert!(!filter.matches(&stopped));
    }

    #[tokio::test]
    async fn test_missing_parameters_fail_initialization() {
        let scheme = TagScheme::new();
        let ctx = context("a", "127.0.0.1:1", &[("tag.key", "cluster")]);
        assert!(matches!(
            scheme.initialize(&ctx).await,
            Err(Error::MissingParameter(k)) if k == "tag.value"
        ));

        let ctx = context("a", "127.0.0.1:1", &[("tag.key", "cluster"), ("tag.value", "prod")]);
        assert!(matches!(
            scheme.initialize(&ctx).await,
            Err(Error::MissingParameter(k)) if k == "directory.url"
        ));
    }

    #[tokio::test]
    async fn test_unset_token_variable_fails_initialization() {
        let scheme = TagScheme::new();
        let ctx = context(
            "a",
            "127.0.0.1:1",
            &[
                ("tag.key", "cluster"),
                ("tag.value", "prod"),
                ("directory.url", "http://127.0.0.1:1/instances"),
                ("credentials.token_env", "WOLFCLUSTER_TEST_TOKEN_THAT_IS_NOT_SET"),
            ],
        );
        assert!(matches!(scheme.initialize(&ctx).await, Err(Error::Init(_))));
    }

    #[tokio::test]
    async fn test_join_latency_follows_poll_interval() {
        let scheme = TagScheme::with_directory(Arc::new(StaticInstanceDirectory::default()));
        scheme
            .initialize(&context("a", "127.0.0.1:1", TAGGED))
            .await
            .unwrap();
        assert_eq!(
            scheme.join_latency(),
            Duration::from_millis(50) + CommonSettings::default().request_timeout
        );
    }

    #[tokio::test]
    async fn test_poll_reconciles_directory_changes() {
        let local = free_address();
        let peer = free_address();
        let directory = Arc::new(StaticInstanceDirectory::new(vec![
            Instance::running("a", local.clone()).with_tag("cluster", "prod"),
            Instance::running("b", peer.clone()).with_tag("cluster", "prod"),
            Instance::running("x", "127.0.0.1:9").with_tag("cluster", "dev"),
        ]));

        let scheme = TagScheme::with_directory(directory.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        scheme.on_member_joined(Arc::new(move |m| e.lock().unwrap().push(format!("+{}", m.id()))));
        let e = Arc::clone(&events);
        scheme.on_member_left(Arc::new(move |m| e.lock().unwrap().push(format!("-{}", m.id()))));

        scheme.initialize(&context("a", &local, TAGGED)).await.unwrap();
        scheme.join_cluster().await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["+b"]);
        assert_eq!(scheme.peers()[0].property("cluster"), Some("prod"));

        directory.set(vec![Instance::running("a", local).with_tag("cluster", "prod")]);
        assert!(wait_until(Duration::from_secs(2), || events.lock().unwrap().len() == 2).await);
        assert_eq!(events.lock().unwrap()[1], "-b");

        scheme.leave_cluster().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_notice_is_not_undone_by_next_poll() {
        let local = free_address();
        let peer = free_address();
        let directory = Arc::new(StaticInstanceDirectory::new(vec![
            Instance::running("a", local.clone()).with_tag("cluster", "prod"),
            Instance::running("b", peer).with_tag("cluster", "prod"),
        ]));

        let scheme = TagScheme::with_directory(directory);
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        scheme.on_member_joined(Arc::new(move |m| e.lock().unwrap().push(format!("+{}", m.id()))));
        let e = Arc::clone(&events);
        scheme.on_member_left(Arc::new(move |m| e.lock().unwrap().push(format!("-{}", m.id()))));

        // Quarantine is two poll intervals (200ms)
        let params = [
            ("tag.key", "cluster"),
            ("tag.value", "prod"),
            ("poll_interval_ms", "100"),
        ];
        scheme.initialize(&context("a", &local, &params)).await.unwrap();
        scheme.join_cluster().await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["+b"]);

        let client = PeerClient::new(Duration::from_millis(500), Duration::from_millis(500));
        let reply = client
            .request(
                &local,
                &Frame::Leave {
                    domain: "test".into(),
                    member_id: "b".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, Frame::LeaveAck));

        // At least one poll runs while b is still listed as running
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*events.lock().unwrap(), vec!["+b", "-b"]);
        assert!(scheme.peers().is_empty());

        scheme.leave_cluster().await.unwrap();
    }

    #[tokio::test]
    async fn test_uninitialized_join_fails() {
        let scheme = TagScheme::new();
        assert!(matches!(scheme.join_cluster().await, Err(Error::Init(_))));
    }
}
