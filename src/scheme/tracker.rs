//! Peer tracking shared by the discovery-based schemes
//!
//! Each scheme feeds raw observations in (a poll result, a probe reply, a
//! beacon) and the tracker turns them into joined/left callbacks, one
//! change at a time.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::{MemberHandler, MessageHandler};
use crate::cluster::{ClusterMember, ClusterMessage};

/// Registered scheme callbacks
#[derive(Default)]
pub struct SchemeHandlers {
    joined: RwLock<Option<MemberHandler>>,
    left: RwLock<Option<MemberHandler>>,
    message: RwLock<Option<MessageHandler>>,
}

fn load<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn store<T>(slot: &RwLock<Option<T>>, value: T) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
}

impl SchemeHandlers {
    pub fn set_joined(&self, handler: MemberHandler) {
        store(&self.joined, handler);
    }

    pub fn set_left(&self, handler: MemberHandler) {
        store(&self.left, handler);
    }

    pub fn set_message(&self, handler: MessageHandler) {
        store(&self.message, handler);
    }

    pub fn member_joined(&self, member: ClusterMember) {
        if let Some(handler) = load(&self.joined) {
            handler(member);
        }
    }

    pub fn member_left(&self, member: ClusterMember) {
        if let Some(handler) = load(&self.left) {
            handler(member);
        }
    }

    /// Hand a message to the handler; false if none is registered yet
    pub fn message(&self, message: ClusterMessage) -> bool {
        match load(&self.message) {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }
}

struct PeerEntry {
    member: ClusterMember,
    last_seen: Instant,
    missed: u32,
}

#[derive(Default)]
struct TrackerState {
    peers: HashMap<String, PeerEntry>,
    /// Peers that announced their departure, by time of the notice
    departed: HashMap<String, Instant>,
}

/// Current set of peers as seen by one scheme
///
/// Every change and the callback it produces happen under one ordering
/// lock, so callbacks for a peer are delivered in the order the changes
/// were made. The state lock itself is never held across a callback.
pub struct PeerTracker {
    local_id: String,
    quarantine: Duration,
    order: Mutex<()>,
    state: Mutex<TrackerState>,
}

impl PeerTracker {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            quarantine: Duration::ZERO,
            order: Mutex::new(()),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Ignore a departed peer in `reconcile` for this long after its notice
    pub fn with_quarantine(mut self, quarantine: Duration) -> Self {
        self.quarantine = quarantine;
        self
    }

    fn order(&self) -> MutexGuard<'_, ()> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a sighting; reports a join the first time an id is seen
    ///
    /// A direct sighting also lifts a departure quarantine: the peer is back.
    pub fn observe(&self, member: ClusterMember, handlers: &SchemeHandlers) -> bool {
        let _order = self.order();
        self.lock().departed.remove(member.id());
        self.observe_ordered(member, handlers)
    }

    fn observe_ordered(&self, member: ClusterMember, handlers: &SchemeHandlers) -> bool {
        if member.id() == self.local_id {
            return false;
        }

        let is_new = {
            let mut state = self.lock();
            match state.peers.get_mut(member.id()) {
                Some(entry) => {
                    entry.last_seen = Instant::now();
                    entry.missed = 0;
                    false
                }
                None => {
                    state.peers.insert(
                        member.id().to_string(),
                        PeerEntry {
                            member: member.clone(),
                            last_seen: Instant::now(),
                            missed: 0,
                        },
                    );
                    true
                }
            }
        };

        if is_new {
            handlers.member_joined(member);
        }
        is_new
    }

    /// Drop a peer; reports a departure if it was known
    pub fn forget(&self, id: &str, handlers: &SchemeHandlers) -> Option<ClusterMember> {
        let _order = self.order();
        self.forget_ordered(id, handlers)
    }

    fn forget_ordered(&self, id: &str, handlers: &SchemeHandlers) -> Option<ClusterMember> {
        let removed = self.lock().peers.remove(id).map(|entry| entry.member);
        if let Some(member) = &removed {
            handlers.member_left(member.clone());
        }
        removed
    }

    /// Drop a peer that announced it is leaving
    ///
    /// Unlike `forget`, the id is quarantined so a stale directory listing
    /// does not bring it straight back.
    pub fn depart(&self, id: &str, handlers: &SchemeHandlers) -> Option<ClusterMember> {
        let _order = self.order();
        if !self.quarantine.is_zero() {
            self.lock().departed.insert(id.to_string(), Instant::now());
        }
        self.forget_ordered(id, handlers)
    }

    /// Replace the peer set with a complete observation
    pub fn reconcile(&self, observed: Vec<ClusterMember>, handlers: &SchemeHandlers) {
        let _order = self.order();
        let (gone, observed) = {
            let mut state = self.lock();
            let quarantine = self.quarantine;
            state
                .departed
                .retain(|_, since| since.elapsed() < quarantine);

            let observed: Vec<ClusterMember> = observed
                .into_iter()
                .filter(|m| {
                    let quarantined = state.departed.contains_key(m.id());
                    if quarantined {
                        tracing::debug!("Ignoring departed peer {} still listed", m.id());
                    }
                    !quarantined
                })
                .collect();
            let gone: Vec<String> = state
                .peers
                .keys()
                .filter(|id| !observed.iter().any(|m| m.id() == id.as_str()))
                .cloned()
                .collect();
            (gone, observed)
        };

        for id in gone {
            self.forget_ordered(&id, handlers);
        }
        for member in observed {
            self.observe_ordered(member, handlers);
        }
    }

    /// Drop peers not seen within `timeout`
    pub fn expire(&self, timeout: Duration, handlers: &SchemeHandlers) -> usize {
        let _order = self.order();
        let now = Instant::now();
        let stale: Vec<String> = self
            .lock()
            .peers
            .values()
            .filter(|e| now.duration_since(e.last_seen) > timeout)
            .map(|e| e.member.id().to_string())
            .collect();

        for id in &stale {
            tracing::debug!("Peer {} not seen for {:?}, dropping", id, timeout);
            self.forget_ordered(id, handlers);
        }
        stale.len()
    }

    /// Count a failed probe against the peer at `address`
    ///
    /// The peer is dropped once it exceeds `max_missed` consecutive misses.
    pub fn record_miss(&self, address: &str, max_missed: u32, handlers: &SchemeHandlers) {
        let _order = self.order();
        let evict = {
            let mut state = self.lock();
            state
                .peers
                .values_mut()
                .find(|e| e.member.address() == address)
                .and_then(|entry| {
                    entry.missed += 1;
                    (entry.missed > max_missed).then(|| entry.member.id().to_string())
                })
        };

        if let Some(id) = evict {
            tracing::info!("Peer {} at {} stopped answering probes", id, address);
            self.forget_ordered(&id, handlers);
        }
    }

    pub fn get(&self, id: &str) -> Option<ClusterMember> {
        self.lock().peers.get(id).map(|e| e.member.clone())
    }

    pub fn peers(&self) -> Vec<ClusterMember> {
        self.lock().peers.values().map(|e| e.member.clone()).collect()
    }

    /// Forget everything without reporting departures
    pub fn clear(&self) {
        let _order = self.order();
        let mut state = self.lock();
        state.peers.clear();
        state.departed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording() -> (SchemeHandlers, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = SchemeHandlers::default();

        let l = Arc::clone(&log);
        handlers.set_joined(Arc::new(move |m| l.lock().unwrap().push(format!("+{}", m.id()))));
        let l = Arc::clone(&log);
        handlers.set_left(Arc::new(move |m| l.lock().unwrap().push(format!("-{}", m.id()))));

        (handlers, log)
    }

    fn member(id: &str, port: u16) -> ClusterMember {
        ClusterMember::new(id, "127.0.0.1", port)
    }

    #[test]
    fn test_observe_reports_once_and_skips_self() {
        let (handlers, log) = recording();
        let tracker = PeerTracker::new("local");

        assert!(tracker.observe(member("a", 1), &handlers));
        assert!(!tracker.observe(member("a", 1), &handlers));
        assert!(!tracker.observe(member("local", 9), &handlers));

        assert_eq!(*log.lock().unwrap(), vec!["+a"]);
    }

    #[test]
    fn test_reconcile_diffs_peer_sets() {
        let (handlers, log) = recording();
        let tracker = PeerTracker::new("local");

        tracker.reconcile(vec![member("a", 1), member("b", 2)], &handlers);
        tracker.reconcile(vec![member("b", 2), member("c", 3)], &handlers);

        let log = log.lock().unwrap();
        assert!(log.contains(&"-a".to_string()));
        assert!(log.contains(&"+c".to_string()));
        assert_eq!(log.iter().filter(|e| *e == "+b").count(), 1);
    }

    #[test]
    fn test_missed_probes_evict() {
        let (handlers, log) = recording();
        let tracker = PeerTracker::new("local");
        tracker.observe(member("a", 1), &handlers);

        tracker.record_miss("127.0.0.1:1", 2, &handlers);
        tracker.record_miss("127.0.0.1:1", 2, &handlers);
        assert!(tracker.get("a").is_some());

        tracker.record_miss("127.0.0.1:1", 2, &handlers);
        assert!(tracker.get("a").is_none());
        assert_eq!(log.lock().unwrap().last().unwrap(), "-a");
    }

    #[test]
    fn test_expire_drops_silent_peers() {
        let (handlers, _log) = recording();
        let tracker = PeerTracker::new("local");
        tracker.observe(member("a", 1), &handlers);

        assert_eq!(tracker.expire(Duration::from_secs(60), &handlers), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tracker.expire(Duration::from_millis(5), &handlers), 1);
        assert!(tracker.peers().is_empty());
    }

    #[test]
    fn test_message_without_handler_is_refused() {
        let handlers = SchemeHandlers::default();
        let message = ClusterMessage {
            uuid: uuid::Uuid::new_v4(),
            sequence: 1,
            origin: "a".into(),
            timestamp: chrono::Utc::now(),
            payload: bytes::Bytes::new(),
        };
        assert!(!handlers.message(message.clone()));

        handlers.set_message(Arc::new(|_| {}));
        assert!(handlers.message(message));
    }

    #[test]
    fn test_callbacks_follow_change_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = Arc::new(SchemeHandlers::default());
        let l = Arc::clone(&log);
        handlers.set_joined(Arc::new(move |m| {
            // A slow coordinator must not let the departure overtake the join
            std::thread::sleep(Duration::from_millis(100));
            l.lock().unwrap().push(format!("+{}", m.id()));
        }));
        let l = Arc::clone(&log);
        handlers.set_left(Arc::new(move |m| l.lock().unwrap().push(format!("-{}", m.id()))));

        let tracker = Arc::new(PeerTracker::new("local"));
        let joining = {
            let (tracker, handlers) = (Arc::clone(&tracker), Arc::clone(&handlers));
            std::thread::spawn(move || tracker.observe(member("b", 2), &handlers))
        };
        std::thread::sleep(Duration::from_millis(20));
        tracker.forget("b", &handlers);
        joining.join().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["+b", "-b"]);
        assert!(tracker.get("b").is_none());
    }

    #[test]
    fn test_departed_peer_is_not_revived_by_stale_listing() {
        let (handlers, log) = recording();
        let tracker = PeerTracker::new("local").with_quarantine(Duration::from_millis(50));

        tracker.reconcile(vec![member("b", 2)], &handlers);
        assert!(tracker.depart("b", &handlers).is_some());

        // The directory still lists b while it shuts down
        tracker.reconcile(vec![member("b", 2)], &handlers);
        assert!(tracker.get("b").is_none());
        assert_eq!(*log.lock().unwrap(), vec!["+b", "-b"]);

        std::thread::sleep(Duration::from_millis(80));
        tracker.reconcile(vec![member("b", 2)], &handlers);
        assert!(tracker.get("b").is_some());
    }

    #[test]
    fn test_direct_sighting_lifts_quarantine() {
        let (handlers, _log) = recording();
        let tracker = PeerTracker::new("local").with_quarantine(Duration::from_secs(60));

        tracker.observe(member("b", 2), &handlers);
        tracker.depart("b", &handlers);
        assert!(tracker.observe(member("b", 2), &handlers));

        tracker.reconcile(vec![member("b", 2)], &handlers);
        assert!(tracker.get("b").is_some());
    }
}
