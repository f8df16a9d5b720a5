//! Cluster Context
//!
//! Process-local view of the cluster: static configuration, the current
//! member set and the registered membership listeners. Only the coordinator
//! mutates it; everyone else reads copies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::listener::{dispatch, ListenerId, MembershipListener};
use crate::cluster::member::{ClusterMember, MembershipEvent};
use crate::config::ClusterConfig;

/// A member together with when this process learned about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub member: ClusterMember,
    pub joined_at: DateTime<Utc>,
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub domain: String,
    pub membership_scheme: String,
    pub total_members: usize,
    pub listeners: usize,
}

type ListenerEntry = (ListenerId, Arc<dyn MembershipListener>);

/// Canonical membership state holder
pub struct ClusterContext {
    config: ClusterConfig,
    /// Remote members keyed by id
    members: RwLock<HashMap<String, MemberInfo>>,
    /// Listeners in registration order
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener_id: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ClusterContext {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            members: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Static cluster configuration
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Insert a member; returns false if the id is already present
    pub(crate) fn add_member(&self, member: ClusterMember) -> bool {
        let mut members = write(&self.members);
        if members.contains_key(member.id()) {
            return false;
        }
        members.insert(
            member.id().to_string(),
            MemberInfo {
                member,
                joined_at: Utc::now(),
            },
        );
        true
    }

    /// Remove a member; absent ids are a no-op
    pub(crate) fn remove_member(&self, id: &str) -> Option<ClusterMember> {
        write(&self.members).remove(id).map(|info| info.member)
    }

    pub fn contains(&self, id: &str) -> bool {
        read(&self.members).contains_key(id)
    }

    pub fn member(&self, id: &str) -> Option<ClusterMember> {
        read(&self.members).get(id).map(|info| info.member.clone())
    }

    /// All current members, sorted by id
    pub fn members(&self) -> Vec<ClusterMember> {
        let mut members: Vec<_> = read(&self.members)
            .values()
            .map(|info| info.member.clone())
            .collect();
        members.sort_by(|a, b| a.id().cmp(b.id()));
        members
    }

    /// Members with join timestamps, oldest first
    pub fn member_infos(&self) -> Vec<MemberInfo> {
        let mut infos: Vec<_> = read(&self.members).values().cloned().collect();
        infos.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        infos
    }

    pub fn size(&self) -> usize {
        read(&self.members).len()
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn MembershipListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        write(&self.listeners).push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        read(&self.listeners).len()
    }

    /// Deliver an event to every listener in registration order
    ///
    /// Listeners run without any context lock held. A failing listener is
    /// logged and skipped. Returns the number of listeners that failed.
    pub(crate) fn notify(&self, event: &MembershipEvent) -> usize {
        let listeners: Vec<ListenerEntry> = read(&self.listeners).clone();
        let mut failures = 0;

        for (id, listener) in listeners {
            if let Err(e) = dispatch(listener.as_ref(), event) {
                failures += 1;
                tracing::warn!(
                    "{} ({}) failed on {} event for {}: {}",
                    id,
                    listener.name(),
                    event.kind,
                    event.member.id(),
                    e
                );
            }
        }

        failures
    }

    /// Drop all listeners and members
    pub(crate) fn teardown(&self) {
        write(&self.listeners).clear();
        write(&self.members).clear();
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            domain: self.config.domain.clone(),
            membership_scheme: self.config.membership_scheme.clone(),
            total_members: self.size(),
            listeners: self.listener_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::listener::FnListener;
    use std::sync::Mutex;

    fn context() -> ClusterContext {
        ClusterContext::new(ClusterConfig::default())
    }

    #[test]
    fn test_member_ids_are_unique() {
        let ctx = context();
        assert!(ctx.add_member(ClusterMember::new("node-2", "localhost", 4001)));
        assert!(!ctx.add_member(ClusterMember::new("node-2", "10.0.0.2", 4001)));
        assert!(ctx.add_member(ClusterMember::new("node-3", "localhost", 4002)));

        assert_eq!(ctx.size(), 2);
        // First registration wins
        assert_eq!(ctx.member("node-2").unwrap().host(), "localhost");
    }

    #[test]
    fn test_remove_absent_member_is_noop() {
        let ctx = context();
        assert!(ctx.remove_member("ghost").is_none());

        ctx.add_member(ClusterMember::new("node-2", "localhost", 4001));
        assert!(ctx.remove_member("node-2").is_some());
        assert!(ctx.remove_member("node-2").is_none());
        assert_eq!(ctx.size(), 0);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let ctx = context();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            ctx.add_listener(Arc::new(FnListener::new(name).on_added(move |_| {
                order.lock().unwrap().push(name);
                Ok(())
            })));
        }

        let event = MembershipEvent::added(ClusterMember::new("node-2", "localhost", 4001));
        assert_eq!(ctx.notify(&event), 0);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let ctx = context();
        let seen = Arc::new(Mutex::new(Vec::new()));

        ctx.add_listener(Arc::new(FnListener::new("broken").on_added(|_| anyhow::bail!("boom"))));
        ctx.add_listener(Arc::new(FnListener::new("panics").on_added(|_| panic!("bug"))));
        let s = Arc::clone(&seen);
        ctx.add_listener(Arc::new(FnListener::new("healthy").on_added(move |e| {
            s.lock().unwrap().push(e.member.id().to_string());
            Ok(())
        })));

        let event = MembershipEvent::added(ClusterMember::new("node-2", "localhost", 4001));
        assert_eq!(ctx.notify(&event), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["node-2".to_string()]);
    }

    #[test]
    fn test_remove_listener() {
        let ctx = context();
        let id = ctx.add_listener(Arc::new(FnListener::new("a")));
        ctx.add_listener(Arc::new(FnListener::new("b")));

        assert!(ctx.remove_listener(id));
        assert!(!ctx.remove_listener(id));
        assert_eq!(ctx.listener_count(), 1);
    }

    #[test]
    fn test_teardown() {
        let ctx = context();
        ctx.add_listener(Arc::new(FnListener::new("a")));
        ctx.add_member(ClusterMember::new("node-2", "localhost", 4001));

        ctx.teardown();
        assert_eq!(ctx.size(), 0);
        assert_eq!(ctx.listener_count(), 0);
    }
}
