//! Membership listeners
//!
//! External components register listeners with the coordinator to be told
//! about members arriving and leaving. Listeners run synchronously on the
//! coordinator's event path, so they should hand heavy work off to their own
//! tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::cluster::member::{EventKind, MembershipEvent};
use crate::error::{Error, Result};

/// Handle returned on registration, used to deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receives membership changes
pub trait MembershipListener: Send + Sync {
    /// Name used when logging failures of this listener
    fn name(&self) -> &str;

    fn member_added(&self, _event: &MembershipEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn member_removed(&self, _event: &MembershipEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

type Callback = Box<dyn Fn(&MembershipEvent) -> anyhow::Result<()> + Send + Sync>;

/// Listener assembled from closures
pub struct FnListener {
    name: String,
    on_added: Option<Callback>,
    on_removed: Option<Callback>,
}

impl FnListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_added: None,
            on_removed: None,
        }
    }

    pub fn on_added<F>(mut self, f: F) -> Self
    where
        F: Fn(&MembershipEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_added = Some(Box::new(f));
        self
    }

    pub fn on_removed<F>(mut self, f: F) -> Self
    where
        F: Fn(&MembershipEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_removed = Some(Box::new(f));
        self
    }
}

impl MembershipListener for FnListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn member_added(&self, event: &MembershipEvent) -> anyhow::Result<()> {
        match &self.on_added {
            Some(f) => f(event),
            None => Ok(()),
        }
    }

    fn member_removed(&self, event: &MembershipEvent) -> anyhow::Result<()> {
        match &self.on_removed {
            Some(f) => f(event),
            None => Ok(()),
        }
    }
}

/// Deliver one event to one listener, containing errors and panics
pub(crate) fn dispatch(listener: &dyn MembershipListener, event: &MembershipEvent) -> Result<()> {
    let outcome = catch_unwind(AssertUnwindSafe(|| match event.kind {
        EventKind::Added => listener.member_added(event),
        EventKind::Removed => listener.member_removed(event),
    }));

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Listener {
            listener: listener.name().to_string(),
            reason: format!("{:#}", e),
        }),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            Err(Error::Listener {
                listener: listener.name().to_string(),
                reason: format!("panicked: {}", reason),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::member::ClusterMember;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event() -> MembershipEvent {
        MembershipEvent::added(ClusterMember::new("node-2", "localhost", 4001))
    }

    #[test]
    fn test_fn_listener_routes_by_kind() {
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let (a, r) = (Arc::clone(&added), Arc::clone(&removed));

        let listener = FnListener::new("counter")
            .on_added(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_removed(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let member = ClusterMember::new("node-2", "localhost", 4001);
        dispatch(&listener, &MembershipEvent::added(member.clone())).unwrap();
        dispatch(&listener, &MembershipEvent::removed(member)).unwrap();

        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_reports_listener_error() {
        let listener = FnListener::new("broken").on_added(|_| anyhow::bail!("database down"));

        match dispatch(&listener, &event()) {
            Err(Error::Listener { listener, reason }) => {
                assert_eq!(listener, "broken");
                assert!(reason.contains("database down"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_contains_panic() {
        let listener = FnListener::new("panicky").on_added(|_| panic!("listener bug"));

        match dispatch(&listener, &event()) {
            Err(Error::Listener { reason, .. }) => assert!(reason.contains("listener bug")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
