//! Message Buffer
//!
//! Bounded history of recently broadcast messages. Joining members are
//! replayed a snapshot of this buffer so they reach the same state as the
//! members that saw the messages live.
//!
//! Two bounds apply. Age (`retention`) is the primary one and must exceed the
//! worst-case join latency (checked when the coordinator starts). `capacity` is a
//! hard memory cap; when it evicts a message that is still inside the join
//! window, replay coverage is degraded and a warning is logged.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sequence number assigned at buffer insertion
pub type Sequence = u64;

/// A broadcast payload plus its envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Unique message id, used by receivers to drop duplicates
    pub uuid: Uuid,
    /// Position in the sender's buffer
    pub sequence: Sequence,
    /// Id of the member that broadcast the message
    pub origin: String,
    /// When the message was buffered
    pub timestamp: DateTime<Utc>,
    /// Opaque application payload
    pub payload: Bytes,
}

/// Buffer statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStats {
    pub len: usize,
    pub capacity: usize,
    pub retention_secs: u64,
    pub first_sequence: Option<Sequence>,
    pub last_sequence: Option<Sequence>,
    pub evicted_total: u64,
}

struct BufferedEntry {
    stored_at: Instant,
    message: ClusterMessage,
}

struct BufferInner {
    /// Messages younger than this may still be needed by a replay
    join_window: Duration,
    next_sequence: Sequence,
    entries: VecDeque<BufferedEntry>,
    evicted_total: u64,
}

/// Append-only, bounded message history
pub struct MessageBuffer {
    capacity: usize,
    retention: Duration,
    inner: Mutex<BufferInner>,
}

impl MessageBuffer {
    /// Create a buffer holding at most `capacity` messages for `retention`
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            inner: Mutex::new(BufferInner {
                join_window: Duration::ZERO,
                next_sequence: 1,
                entries: VecDeque::new(),
                evicted_total: 0,
            }),
        }
    }

    /// Set the window inside which capacity evictions are reported
    pub fn with_join_window(self, join_window: Duration) -> Self {
        self.set_join_window(join_window);
        self
    }

    pub fn set_join_window(&self, join_window: Duration) {
        self.lock().join_window = join_window;
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a payload, assigning the next sequence number
    pub fn append(&self, origin: &str, payload: Bytes) -> ClusterMessage {
        let now = Instant::now();
        let mut inner = self.lock();

        let message = ClusterMessage {
            uuid: Uuid::new_v4(),
            sequence: inner.next_sequence,
            origin: origin.to_string(),
            timestamp: Utc::now(),
            payload,
        };
        inner.next_sequence += 1;
        inner.entries.push_back(BufferedEntry {
            stored_at: now,
            message: message.clone(),
        });

        self.evict_locked(&mut inner, now);
        message
    }

    /// Point-in-time copy of the buffered messages, oldest first
    pub fn snapshot(&self) -> Vec<ClusterMessage> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.evict_locked(&mut inner, now);
        inner.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Drop messages older than the retention period
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub(crate) fn evict_expired_at(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        self.evict_locked(&mut inner, now)
    }

    fn evict_locked(&self, inner: &mut BufferInner, now: Instant) -> usize {
        let mut evicted = 0;

        while inner.entries.len() > self.capacity {
            if let Some(entry) = inner.entries.pop_front() {
                if now.duration_since(entry.stored_at) < inner.join_window {
                    tracing::warn!(
                        "Message buffer full ({}), evicting message {} inside the join window; \
                         members joining now may miss it on replay",
                        self.capacity,
                        entry.message.sequence
                    );
                }
                evicted += 1;
            }
        }

        while let Some(front) = inner.entries.front() {
            if now.duration_since(front.stored_at) < self.retention {
                break;
            }
            inner.entries.pop_front();
            evicted += 1;
        }

        inner.evicted_total += evicted as u64;
        evicted
    }

    /// Remove every buffered message
    pub fn clear(&self) {
        let mut inner = self.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        tracing::debug!("Message buffer cleared ({} messages dropped)", dropped);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.lock();
        BufferStats {
            len: inner.entries.len(),
            capacity: self.capacity,
            retention_secs: self.retention.as_secs(),
            first_sequence: inner.entries.front().map(|e| e.message.sequence),
            last_sequence: inner.entries.back().map(|e| e.message.sequence),
            evicted_total: inner.evicted_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_sequences_are_monotonic() {
        let buffer = MessageBuffer::new(100, Duration::from_secs(60));

        let m1 = buffer.append("node-1", payload("a"));
        let m2 = buffer.append("node-1", payload("b"));
        let m3 = buffer.append("node-1", payload("c"));

        assert_eq!((m1.sequence, m2.sequence, m3.sequence), (1, 2, 3));
        assert_ne!(m1.uuid, m2.uuid);

        let seqs: Vec<_> = buffer.snapshot().iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let buffer = MessageBuffer::new(2, Duration::from_secs(60));
        for i in 0..5 {
            buffer.append("node-1", payload(&i.to_string()));
        }

        let seqs: Vec<_> = buffer.snapshot().iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);

        let stats = buffer.stats();
        assert_eq!(stats.evicted_total, 3);
        assert_eq!(stats.first_sequence, Some(4));
        assert_eq!(stats.last_sequence, Some(5));
    }

    #[test]
    fn test_age_eviction() {
        let buffer = MessageBuffer::new(100, Duration::from_secs(30));
        buffer.append("node-1", payload("old"));
        buffer.append("node-1", payload("older"));

        assert_eq!(buffer.evict_expired_at(Instant::now() + Duration::from_secs(10)), 0);
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.evict_expired_at(Instant::now() + Duration::from_secs(31)), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_appends() {
        let buffer = MessageBuffer::new(100, Duration::from_secs(60));
        buffer.append("node-1", payload("M1"));
        buffer.append("node-1", payload("M2"));

        let snapshot = buffer.snapshot();
        buffer.append("node-1", payload("M3"));

        assert_eq!(snapshot.len(), 2);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_clear_keeps_sequence_counter() {
        let buffer = MessageBuffer::new(100, Duration::from_secs(60));
        buffer.append("node-1", payload("a"));
        buffer.clear();
        assert!(buffer.is_empty());

        let next = buffer.append("node-1", payload("b"));
        assert_eq!(next.sequence, 2);
    }
}
