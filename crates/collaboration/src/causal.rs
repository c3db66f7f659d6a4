/// Causal-per-sender delivery of sequenced submissions
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::UserId;

/// Vector clock for tracking delivered submissions per author
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    /// Map of user ID to the last delivered sequence number
    clocks: HashMap<UserId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            clocks: HashMap::new(),
        }
    }

    /// Increment the clock for a user
    pub fn increment(&mut self, user_id: UserId) {
        *self.clocks.entry(user_id).or_insert(0) += 1;
    }

    /// Raise the clock for a user to at least `seq`
    pub fn observe(&mut self, user_id: UserId, seq: u64) {
        let current = self.clocks.entry(user_id).or_insert(0);
        *current = (*current).max(seq);
    }

    /// Get the current value for a user
    pub fn get(&self, user_id: UserId) -> u64 {
        *self.clocks.get(&user_id).unwrap_or(&0)
    }

    /// Merge with another vector clock (take max)
    pub fn merge(&mut self, other: &VectorClock) {
        for (user_id, &count) in &other.clocks {
            self.observe(*user_id, count);
        }
    }
}

/// Outcome of offering a submission to a [`SequenceBuffer`]
#[derive(Debug, PartialEq)]
pub enum Delivery<T> {
    /// The submission and any buffered successors, in sequence order
    Ready(Vec<T>),
    /// Already delivered; dropped
    Duplicate,
    /// Waiting for a missing predecessor
    Buffered,
}

/// Reorders one sender's submissions by sequence number.
///
/// Gaps are held for at most `gap_timeout`; after that the sender has to
/// resynchronize.
#[derive(Debug)]
pub struct SequenceBuffer<T> {
    next_seq: u64,
    pending: BTreeMap<u64, T>,
    waiting_since: Option<DateTime<Utc>>,
    gap_timeout: chrono::Duration,
}

impl<T> SequenceBuffer<T> {
    pub fn new(next_seq: u64, gap_timeout: chrono::Duration) -> Self {
        Self {
            next_seq: next_seq.max(1),
            pending: BTreeMap::new(),
            waiting_since: None,
            gap_timeout,
        }
    }

    /// Sequence number expected next
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn push(&mut self, seq: u64, item: T, now: DateTime<Utc>) -> Delivery<T> {
        if seq < self.next_seq || self.pending.contains_key(&seq) {
            return Delivery::Duplicate;
        }
        if seq > self.next_seq {
            self.pending.insert(seq, item);
            self.waiting_since.get_or_insert(now);
            return Delivery::Buffered;
        }

        let mut ready = vec![item];
        self.next_seq += 1;
        while let Some(next) = self.pending.remove(&self.next_seq) {
            ready.push(next);
            self.next_seq += 1;
        }
        self.waiting_since = if self.pending.is_empty() {
            None
        } else {
            Some(now)
        };
        Delivery::Ready(ready)
    }

    /// True once a gap has been open longer than the timeout. Buffered
    /// submissions are discarded; the sender resends them after resyncing.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        match self.waiting_since {
            Some(since) if now - since > self.gap_timeout => {
                self.pending.clear();
                self.waiting_since = None;
                true
            }
            _ => false,
        }
    }

    /// Continue from `next_seq` if the sender is ahead of us
    pub fn resume(&mut self, next_seq: u64) {
        if next_seq > self.next_seq {
            self.next_seq = next_seq;
            self.pending.retain(|&seq, _| seq > next_seq);
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &T> {
        self.pending.values()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Per-author sequence buffers of one document
#[derive(Debug)]
pub struct CausalInbox<T> {
    buffers: HashMap<UserId, SequenceBuffer<T>>,
    delivered: VectorClock,
    gap_timeout: chrono::Duration,
}

impl<T> CausalInbox<T> {
    pub fn new(gap_timeout: chrono::Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            delivered: VectorClock::new(),
            gap_timeout,
        }
    }

    pub fn accept(&mut self, sender: UserId, seq: u64, item: T, now: DateTime<Utc>) -> Delivery<T> {
        let gap_timeout = self.gap_timeout;
        let buffer = self
            .buffers
            .entry(sender)
            .or_insert_with(|| SequenceBuffer::new(1, gap_timeout));
        let delivery = buffer.push(seq, item, now);
        match &delivery {
            Delivery::Ready(_) => self.delivered.observe(sender, buffer.next_seq() - 1),
            Delivery::Buffered => {
                tracing::debug!(sender = %sender, seq, expected = buffer.next_seq(), "buffering out-of-order submission")
            }
            Delivery::Duplicate => {
                tracing::debug!(sender = %sender, seq, "dropping duplicate submission")
            }
        }
        delivery
    }

    /// Senders whose gap timed out and must resync, with the sequence
    /// number expected from them
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<(UserId, u64)> {
        self.buffers
            .iter_mut()
            .filter_map(|(sender, buffer)| {
                buffer
                    .expire(now)
                    .then(|| (*sender, buffer.next_seq()))
            })
            .collect()
    }

    /// A (re)joining sender announces the next sequence number it will use
    pub fn resume(&mut self, sender: UserId, next_seq: u64) {
        let gap_timeout = self.gap_timeout;
        self.buffers
            .entry(sender)
            .or_insert_with(|| SequenceBuffer::new(1, gap_timeout))
            .resume(next_seq);
        self.delivered.observe(sender, next_seq.saturating_sub(1));
    }

    pub fn delivered(&self) -> &VectorClock {
        &self.delivered
    }

    pub fn pending(&self) -> impl Iterator<Item = &T> {
        self.buffers.values().flat_map(|b| b.pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_in_order_delivery() {
        let mut buffer = SequenceBuffer::new(1, Duration::seconds(5));
        let now = Utc::now();
        assert_eq!(buffer.push(1, "a", now), Delivery::Ready(vec!["a"]));
        assert_eq!(buffer.push(2, "b", now), Delivery::Ready(vec!["b"]));
        assert_eq!(buffer.push(2, "b", now), Delivery::Duplicate);
    }

    #[test]
    fn test_gap_is_buffered_until_filled() {
        let mut buffer = SequenceBuffer::new(1, Duration::seconds(5));
        let now = Utc::now();
        assert_eq!(buffer.push(3, "c", now), Delivery::Buffered);
        assert_eq!(buffer.push(2, "b", now), Delivery::Buffered);
        assert_eq!(buffer.push(3, "c", now), Delivery::Duplicate);
        assert_eq!(buffer.push(1, "a", now), Delivery::Ready(vec!["a", "b", "c"]));
        assert_eq!(buffer.next_seq(), 4);
        assert!(!buffer.expire(now + Duration::seconds(60)));
    }

    #[test]
    fn test_gap_expires() {
        let mut buffer = SequenceBuffer::new(1, Duration::seconds(5));
        let now = Utc::now();
        buffer.push(2, "b", now);
        assert!(!buffer.expire(now + Duration::seconds(4)));
        assert!(buffer.expire(now + Duration::seconds(6)));
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.next_seq(), 1);
    }

    #[test]
    fn test_inbox_tracks_delivered_clock() {
        let mut inbox = CausalInbox::new(Duration::seconds(5));
        let (alice, bob) = (UserId::new(), UserId::new());
        let now = Utc::now();

        inbox.accept(alice, 1, 10, now);
        inbox.accept(alice, 2, 11, now);
        inbox.accept(bob, 2, 20, now);
        assert_eq!(inbox.delivered().get(alice), 2);
        assert_eq!(inbox.delivered().get(bob), 0);
        assert_eq!(inbox.pending().copied().collect::<Vec<_>>(), vec![20]);

        let expired = inbox.expire(now + Duration::seconds(10));
        assert_eq!(expired, vec![(bob, 1)]);

        inbox.resume(bob, 5);
        assert_eq!(inbox.accept(bob, 5, 21, now), Delivery::Ready(vec![21]));
        assert_eq!(inbox.delivered().get(bob), 5);
    }

    #[test]
    fn test_vector_clock_merge() {
        let (user1, user2) = (UserId::new(), UserId::new());
        let mut vc1 = VectorClock::new();
        let mut vc2 = VectorClock::new();

        vc1.increment(user1);
        vc1.increment(user1);
        vc2.observe(user2, 4);
        vc2.observe(user1, 1);

        vc1.merge(&vc2);
        assert_eq!(vc1.get(user1), 2);
        assert_eq!(vc1.get(user2), 4);
    }
}
