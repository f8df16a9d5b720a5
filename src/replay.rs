//! Replay of buffered messages to newly joined members
//!
//! Each replay runs on its own task: wait out the grace period, take a
//! worker permit, then send the snapshot in sequence order with bounded
//! retries. Messages broadcast while a replay is registered are queued
//! behind its snapshot instead of going out live, so a member that is not
//! yet accepting connections still receives them. A replay ends early when
//! its member leaves or the coordinator shuts down.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cluster::{ClusterMember, ClusterMessage, Sequence};
use crate::config::ReplayConfig;
use crate::error::Error;
use crate::scheme::MembershipScheme;

/// Timing and retry bounds for one replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayPolicy {
    pub grace_period: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub send_timeout: Duration,
}

impl ReplayPolicy {
    /// Policy from config; the scheme's grace period applies unless overridden
    pub fn from_config(config: &ReplayConfig, scheme_grace_period: Duration) -> Self {
        Self {
            grace_period: config.grace_period().unwrap_or(scheme_grace_period),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            send_timeout: config.send_timeout(),
        }
    }

    /// Capped exponential backoff before retry number `attempt` (1-based)
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Backoff with jitter, between half the ceiling and the ceiling
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        ceiling.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }
}

/// How a replay ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Every message was accepted
    Completed { delivered: usize },
    /// A message could not be delivered; the rest were skipped
    Abandoned {
        delivered: usize,
        sequence: Sequence,
        reason: String,
    },
    /// The member left or the coordinator stopped
    Cancelled { delivered: usize },
}

struct ActiveReplay {
    id: u64,
    cancel: CancellationToken,
    /// Messages appended after the snapshot, sent once the snapshot is done
    pending: VecDeque<ClusterMessage>,
}

type ActiveMap = Arc<Mutex<HashMap<String, ActiveReplay>>>;

fn lock(active: &ActiveMap) -> MutexGuard<'_, HashMap<String, ActiveReplay>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered replay that has not been started yet
///
/// Messages queued through `Replayer::enqueue` are held for it from the
/// moment it is reserved.
#[derive(Debug)]
pub struct Reservation {
    id: u64,
    member_id: String,
    cancel: CancellationToken,
}

/// Runs replays off the membership callback path
pub struct Replayer {
    scheme: Arc<dyn MembershipScheme>,
    policy: ReplayPolicy,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    active: ActiveMap,
    next_id: AtomicU64,
}

impl Replayer {
    pub fn new(scheme: Arc<dyn MembershipScheme>, policy: ReplayPolicy, workers: usize) -> Self {
        Self {
            scheme,
            policy,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &ReplayPolicy {
        &self.policy
    }

    /// Register a replay to `member_id` without starting it
    ///
    /// Returns `None` once the replayer is shut down. A replay already
    /// registered for the same member id is cancelled.
    pub fn reserve(&self, member_id: &str) -> Option<Reservation> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let previous = lock(&self.active).insert(
            member_id.to_string(),
            ActiveReplay {
                id,
                cancel: cancel.clone(),
                pending: VecDeque::new(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        Some(Reservation {
            id,
            member_id: member_id.to_string(),
            cancel,
        })
    }

    /// Start a reserved replay of `snapshot` to `member`
    pub fn launch(
        &self,
        reservation: Reservation,
        member: ClusterMember,
        snapshot: Vec<ClusterMessage>,
    ) -> JoinHandle<ReplayOutcome> {
        let Reservation { id, member_id, cancel } = reservation;
        let run = ReplayRun {
            scheme: Arc::clone(&self.scheme),
            policy: self.policy.clone(),
            permits: Arc::clone(&self.permits),
            active: Arc::clone(&self.active),
            id,
            cancel,
            member,
            snapshot,
        };
        let active = Arc::clone(&self.active);

        self.tasks.spawn(async move {
            let outcome = run.execute().await;

            let mut active = lock(&active);
            if active.get(&member_id).map(|a| a.id) == Some(id) {
                active.remove(&member_id);
            }
            outcome
        })
    }

    /// Reserve and start a replay of `snapshot` to `member`
    ///
    /// Returns `None` once the replayer is shut down.
    pub fn spawn(&self, member: ClusterMember, snapshot: Vec<ClusterMessage>) -> Option<JoinHandle<ReplayOutcome>> {
        let reservation = self.reserve(member.id())?;
        Some(self.launch(reservation, member, snapshot))
    }

    /// Queue `message` behind the replay to `member_id`
    ///
    /// Returns false when no replay is registered for the member, in which
    /// case the caller delivers it live.
    pub fn enqueue(&self, member_id: &str, message: &ClusterMessage) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match lock(&self.active).get_mut(member_id) {
            Some(replay) => {
                replay.pending.push_back(message.clone());
                true
            }
            None => false,
        }
    }

    /// Cancel the replay to `member_id`, if one is running
    pub fn cancel(&self, member_id: &str) -> bool {
        match lock(&self.active).remove(member_id) {
            Some(replay) => {
                replay.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Cancel every replay and wait for the tasks to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        lock(&self.active).clear();
    }
}

/// Next message queued behind a replay
enum Pending {
    Message(ClusterMessage),
    /// Queue drained; the replay was deregistered and live delivery takes over
    Drained,
    /// Deregistered by a cancel or replaced by a newer replay
    Gone,
}

struct ReplayRun {
    scheme: Arc<dyn MembershipScheme>,
    policy: ReplayPolicy,
    permits: Arc<Semaphore>,
    active: ActiveMap,
    id: u64,
    cancel: CancellationToken,
    member: ClusterMember,
    snapshot: Vec<ClusterMessage>,
}

impl ReplayRun {
    async fn execute(self) -> ReplayOutcome {
        let member_id = self.member.id();

        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!("Replay to {} cancelled during grace period", member_id);
                return ReplayOutcome::Cancelled { delivered: 0 };
            }
            _ = tokio::time::sleep(self.policy.grace_period) => {}
        }

        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return ReplayOutcome::Cancelled { delivered: 0 },
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return ReplayOutcome::Cancelled { delivered: 0 },
            },
        };

        tracing::info!(
            "Replaying {} buffered message(s) to {}",
            self.snapshot.len(),
            self.member
        );

        let mut delivered = 0;
        for message in &self.snapshot {
            if let Err(outcome) = self.send(message, &mut delivered).await {
                return outcome;
            }
        }

        // Keep the registration until the queue is empty so that later
        // broadcasts cannot overtake a queued message on the live path
        loop {
            let message = match self.next_pending() {
                Pending::Message(message) => message,
                Pending::Drained => break,
                Pending::Gone => {
                    tracing::debug!("Replay to {} cancelled after {} message(s)", member_id, delivered);
                    return ReplayOutcome::Cancelled { delivered };
                }
            };
            if let Err(outcome) = self.send(&message, &mut delivered).await {
                return outcome;
            }
        }

        tracing::info!("Replay to {} complete ({} message(s))", member_id, delivered);
        ReplayOutcome::Completed { delivered }
    }

    fn next_pending(&self) -> Pending {
        if self.cancel.is_cancelled() {
            return Pending::Gone;
        }
        let mut active = lock(&self.active);
        let member_id = self.member.id();
        match active.get_mut(member_id) {
            Some(replay) if replay.id == self.id => match replay.pending.pop_front() {
                Some(message) => Pending::Message(message),
                None => {
                    active.remove(member_id);
                    Pending::Drained
                }
            },
            _ => Pending::Gone,
        }
    }

    /// Deliver one message; `Err` carries the outcome that ends the replay
    async fn send(&self, message: &ClusterMessage, delivered: &mut usize) -> Result<(), ReplayOutcome> {
        match self.send_with_retry(message).await {
            Ok(()) => {
                *delivered += 1;
                Ok(())
            }
            Err(None) => {
                tracing::debug!(
                    "Replay to {} cancelled after {} message(s)",
                    self.member.id(),
                    delivered
                );
                Err(ReplayOutcome::Cancelled { delivered: *delivered })
            }
            Err(Some(e)) => {
                tracing::error!(
                    "Abandoning replay to {} at message {} after {} delivered: {}",
                    self.member.id(),
                    message.sequence,
                    delivered,
                    e
                );
                Err(ReplayOutcome::Abandoned {
                    delivered: *delivered,
                    sequence: message.sequence,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// `Err(None)` means cancelled
    async fn send_with_retry(&self, message: &ClusterMessage) -> Result<(), Option<Error>> {
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(None),
                result = tokio::time::timeout(
                    self.policy.send_timeout,
                    self.scheme.send_to(&self.member, message),
                ) => result,
            };

            let error = match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => Error::send(self.member.id(), "send timed out"),
            };

            if attempt >= self.policy.max_attempts || !error.is_retryable() {
                return Err(Some(error));
            }

            let backoff = self.policy.backoff(attempt);
            tracing::warn!(
                "Replay of message {} to {} failed (attempt {}/{}), retrying in {:?}: {}",
                message.sequence,
                self.member.id(),
                attempt,
                self.policy.max_attempts,
                backoff,
                error
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(None),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::memory::{InMemoryScheme, MemoryNetwork};
    use crate::scheme::SchemeContext;
    use std::collections::HashMap;

    fn policy(grace_ms: u64, max_attempts: u32) -> ReplayPolicy {
        ReplayPolicy {
            grace_period: Duration::from_millis(grace_ms),
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            send_timeout: Duration::from_millis(200),
        }
    }

    fn messages(n: u64) -> Vec<ClusterMessage> {
        (1..=n)
            .map(|sequence| ClusterMessage {
                uuid: uuid::Uuid::new_v4(),
                sequence,
                origin: "a".into(),
                timestamp: chrono::Utc::now(),
                payload: bytes::Bytes::from(format!("M{}", sequence)),
            })
            .collect()
    }

    async fn joined(network: &MemoryNetwork, id: &str) -> Arc<InMemoryScheme> {
        let scheme = Arc::new(InMemoryScheme::new(network.clone()));
        scheme
            .initialize(&SchemeContext {
                local_member: ClusterMember::new(id, "mem", 0),
                domain: "test".into(),
                bind_address: "mem:0".into(),
                parameters: HashMap::new(),
            })
            .await
            .unwrap();
        scheme.on_message(Arc::new(|_| {}));
        scheme.join_cluster().await.unwrap();
        scheme
    }

    #[test]
    fn test_backoff_is_capped_exponential() {
        let policy = policy(0, 5);
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(5));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(10));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(20));
        assert_eq!(policy.backoff_ceiling(40), Duration::from_millis(20));

        for attempt in 1..6 {
            let b = policy.backoff(attempt);
            assert!(b <= policy.backoff_ceiling(attempt));
            assert!(b >= policy.backoff_ceiling(attempt) / 2);
        }
    }

    #[test]
    fn test_config_grace_overrides_scheme() {
        let mut config = ReplayConfig::default();
        let scheme_grace = Duration::from_secs(3);
        assert_eq!(ReplayPolicy::from_config(&config, scheme_grace).grace_period, scheme_grace);

        config.grace_period_ms = Some(750);
        assert_eq!(
            ReplayPolicy::from_config(&config, scheme_grace).grace_period,
            Duration::from_millis(750)
        );
    }

    #[tokio::test]
    async fn test_replay_in_order_after_transient_failures() {
        let network = MemoryNetwork::new();
        let sender = joined(&network, "a").await;
        let receiver = joined(&network, "b").await;
        receiver.faults().fail_next(2);

        let replayer = Replayer::new(sender, policy(0, 5), 2);
        let handle = replayer
            .spawn(ClusterMember::new("b", "mem", 0), messages(3))
            .unwrap();

        assert_eq!(handle.await.unwrap(), ReplayOutcome::Completed { delivered: 3 });
        let seqs: Vec<_> = network.deliveries_to("b").iter().map(|d| d.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(network.deliveries_to("b").iter().all(|d| d.replay));
        assert_eq!(replayer.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_member_is_abandoned() {
        let network = MemoryNetwork::new();
        let sender = joined(&network, "a").await;
        let receiver = joined(&network, "b").await;
        receiver.faults().set_unreachable(true);

        let replayer = Replayer::new(sender, policy(0, 3), 2);
        let outcome = replayer
            .spawn(ClusterMember::new("b", "mem", 0), messages(2))
            .unwrap()
            .await
            .unwrap();

        match outcome {
            ReplayOutcome::Abandoned { delivered, sequence, .. } => {
                assert_eq!(delivered, 0);
                assert_eq!(sequence, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(network.deliveries_to("b").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_grace_period() {
        let network = MemoryNetwork::new();
        let sender = joined(&network, "a").await;
        joined(&network, "b").await;

        let replayer = Replayer::new(sender, policy(60_000, 3), 2);
        let handle = replayer
            .spawn(ClusterMember::new("b", "mem", 0), messages(2))
            .unwrap();

        assert!(replayer.cancel("b"));
        assert!(!replayer.cancel("b"));
        assert_eq!(handle.await.unwrap(), ReplayOutcome::Cancelled { delivered: 0 });
        assert!(network.deliveries_to("b").is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_grace_period() {
        let network = MemoryNetwork::new();
        let sender = joined(&network, "a").await;

        let replayer = Replayer::new(sender, policy(60_000, 3), 2);
        replayer.spawn(ClusterMember::new("b", "mem", 0), messages(1));
        replayer.spawn(ClusterMember::new("c", "mem", 0), messages(1));

        tokio::time::timeout(Duration::from_secs(1), replayer.shutdown())
            .await
            .expect("shutdown blocked on a replay");
        assert!(replayer
            .spawn(ClusterMember::new("d", "mem", 0), messages(1))
            .is_none());
    }

    #[tokio::test]
    async fn test_queued_messages_follow_the_snapshot() {
        let network = MemoryNetwork::new();
        let sender = joined(&network, "a").await;
        let receiver = joined(&network, "b").await;
        receiver.faults().fail_next(1);

        let all = messages(3);
        let replayer = Replayer::new(sender, policy(100, 5), 1);
        let handle = replayer
            .spawn(ClusterMember::new("b", "mem", 0), all[..1].to_vec())
            .unwrap();

        assert!(replayer.enqueue("b", &all[1]));
        assert!(replayer.enqueue("b", &all[2]));
        assert!(!replayer.enqueue("c", &all[2]));

        assert_eq!(handle.await.unwrap(), ReplayOutcome::Completed { delivered: 3 });
        let seqs: Vec<_> = network.deliveries_to("b").iter().map(|d| d.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        // Drained replays hand over to the live path
        assert_eq!(replayer.active_count(), 0);
        assert!(!replayer.enqueue("b", &all[0]));
    }

    #[tokio::test]
    async fn test_empty_snapshot_still_collects_queued_messages() {
        let network = MemoryNetwork::new();
        let sender = joined(&network, "a").await;
        joined(&network, "b").await;

        let replayer = Replayer::new(sender, policy(50, 3), 1);
        let reservation = replayer.reserve("b").unwrap();
        let queued = messages(1);
        assert!(replayer.enqueue("b", &queued[0]));

        let handle = replayer.launch(reservation, ClusterMember::new("b", "mem", 0), Vec::new());
        assert_eq!(handle.await.unwrap(), ReplayOutcome::Completed { delivered: 1 });
        assert_eq!(network.deliveries_to("b").len(), 1);
    }

    #[tokio::test]
    async fn test_newer_reservation_supersedes_older() {
        let network = MemoryNetwork::new();
        let sender = joined(&network, "a").await;
        joined(&network, "b").await;

        let replayer = Replayer::new(sender, policy(60_000, 3), 1);
        let first = replayer
            .spawn(ClusterMember::new("b", "mem", 0), messages(1))
            .unwrap();
        let _second = replayer.reserve("b").unwrap();

        assert_eq!(first.await.unwrap(), ReplayOutcome::Cancelled { delivered: 0 });
        assert_eq!(replayer.active_count(), 1);
    }
}
