use std::collections::VecDeque;

use crate::config::OverflowPolicy;
use crate::protocol::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The envelope, or the oldest queued one under drop-oldest, was
    /// discarded. `episode_started` is true for the first drop since the
    /// backlog last drained.
    Dropped { episode_started: bool },
}

/// Bounded FIFO of envelopes waiting for a route to come back.
#[derive(Debug)]
pub struct Backlog {
    items: VecDeque<Envelope>,
    capacity: usize,
    policy: OverflowPolicy,
    overflowing: bool,
    dropped: u64,
}

impl Backlog {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
            overflowing: false,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_overflowing(&self) -> bool {
        self.overflowing
    }

    pub fn push(&mut self, envelope: Envelope) -> PushOutcome {
        if self.items.len() < self.capacity {
            self.items.push_back(envelope);
            return PushOutcome::Queued;
        }
        if self.policy == OverflowPolicy::DropOldest {
            self.items.pop_front();
            self.items.push_back(envelope);
        }
        self.record_drop()
    }

    /// Returns an envelope whose delivery failed to the head of the queue.
    /// It is older than anything queued, so when the backlog is full the
    /// policy decides between it and the newest entry.
    pub fn push_front(&mut self, envelope: Envelope) -> PushOutcome {
        if self.items.len() < self.capacity {
            self.items.push_front(envelope);
            return PushOutcome::Queued;
        }
        if self.policy == OverflowPolicy::DropNewest {
            self.items.pop_back();
            self.items.push_front(envelope);
        }
        self.record_drop()
    }

    /// Places `older` ahead of everything queued, keeping the bound.
    pub fn prepend(&mut self, older: VecDeque<Envelope>) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;
        for envelope in older.into_iter().rev() {
            let result = self.push_front(envelope);
            if outcome == PushOutcome::Queued {
                outcome = result;
            }
        }
        outcome
    }

    pub fn pop_front(&mut self) -> Option<Envelope> {
        self.items.pop_front()
    }

    pub fn take_all(&mut self) -> VecDeque<Envelope> {
        self.overflowing = false;
        std::mem::take(&mut self.items)
    }

    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        self.overflowing = false;
        count
    }

    /// Ends the current overflow episode once the queue is empty.
    pub fn note_drained(&mut self) {
        if self.items.is_empty() {
            self.overflowing = false;
        }
    }

    fn record_drop(&mut self) -> PushOutcome {
        self.dropped += 1;
        let episode_started = !self.overflowing;
        self.overflowing = true;
        PushOutcome::Dropped { episode_started }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RouteId;
    use serde_json::Value;

    fn env(n: u64) -> Envelope {
        let mut env = Envelope::event(RouteId::new("r"), "e", Value::Null);
        env.seq_num = n;
        env
    }

    fn seqs(backlog: &mut Backlog) -> Vec<u64> {
        backlog.take_all().into_iter().map(|e| e.seq_num).collect()
    }

    #[test]
    fn drop_newest_keeps_queue_and_reports_one_episode() {
        let mut backlog = Backlog::new(2, OverflowPolicy::DropNewest);
        assert_eq!(backlog.push(env(1)), PushOutcome::Queued);
        assert_eq!(backlog.push(env(2)), PushOutcome::Queued);
        assert_eq!(
            backlog.push(env(3)),
            PushOutcome::Dropped {
                episode_started: true
            }
        );
        assert_eq!(
            backlog.push(env(4)),
            PushOutcome::Dropped {
                episode_started: false
            }
        );
        assert_eq!(backlog.dropped(), 2);
        assert_eq!(seqs(&mut backlog), vec![1, 2]);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let mut backlog = Backlog::new(2, OverflowPolicy::DropOldest);
        backlog.push(env(1));
        backlog.push(env(2));
        backlog.push(env(3));
        assert_eq!(seqs(&mut backlog), vec![2, 3]);
    }

    #[test]
    fn episode_resets_after_drain() {
        let mut backlog = Backlog::new(1, OverflowPolicy::DropNewest);
        backlog.push(env(1));
        backlog.push(env(2));
        assert!(backlog.is_overflowing());
        backlog.pop_front();
        backlog.note_drained();
        backlog.push(env(3));
        assert_eq!(
            backlog.push(env(4)),
            PushOutcome::Dropped {
                episode_started: true
            }
        );
    }

    #[test]
    fn push_front_restores_failed_head() {
        let mut backlog = Backlog::new(3, OverflowPolicy::DropNewest);
        backlog.push(env(2));
        backlog.push(env(3));
        backlog.push_front(env(1));
        assert_eq!(seqs(&mut backlog), vec![1, 2, 3]);
    }

    #[test]
    fn prepend_places_older_entries_first() {
        let mut backlog = Backlog::new(8, OverflowPolicy::DropNewest);
        backlog.push(env(4));
        backlog.prepend((1..=3).map(env).collect());
        assert_eq!(seqs(&mut backlog), vec![1, 2, 3, 4]);
    }
}
