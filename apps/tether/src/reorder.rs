//! Restores per-session input order from an out-of-order, at-least-once
//! delivery stream.
//!
//! A [`ReorderQueue`] covers one input session: fragments are released
//! strictly in sequence order, duplicates and stale fragments are discarded,
//! and fragments that arrive early are held until the gap before them fills.
//! The held set is bounded; once it overflows the queue refuses further
//! input until it is reset, because skipping the missing fragment would
//! reorder keystrokes.
//!
//! [`InputReorder`] layers input-session tracking on top: a new session id
//! retires the previous one and discards everything it was holding.

use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReorderError {
    #[error("reorder buffer overflow: seq {missing} never arrived ({held} fragments held)")]
    GapOverflow { missing: u64, held: usize },
    #[error("input session is stalled waiting for seq {missing}; reset required")]
    Stalled { missing: u64 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReorderStats {
    pub released: u64,
    pub duplicates: u64,
    pub held: usize,
    pub max_held_seen: usize,
}

#[derive(Debug)]
pub struct ReorderQueue<T> {
    next_expected: u64,
    held: BTreeMap<u64, T>,
    max_held: usize,
    stalled: bool,
    stats: ReorderStats,
}

impl<T> ReorderQueue<T> {
    pub fn new(initial_seq: u64, max_held: usize) -> Self {
        Self {
            next_expected: initial_seq,
            held: BTreeMap::new(),
            max_held: max_held.max(1),
            stalled: false,
            stats: ReorderStats::default(),
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn stats(&self) -> ReorderStats {
        ReorderStats {
            held: self.held.len(),
            ..self.stats
        }
    }

    /// Accepts one fragment and returns every payload it unblocked, in order.
    pub fn push(&mut self, seq: u64, payload: T) -> Result<Vec<T>, ReorderError> {
        if self.stalled {
            return Err(ReorderError::Stalled {
                missing: self.next_expected,
            });
        }
        if seq < self.next_expected || self.held.contains_key(&seq) {
            self.stats.duplicates += 1;
            return Ok(Vec::new());
        }
        if seq > self.next_expected {
            if self.held.len() >= self.max_held {
                self.stalled = true;
                return Err(ReorderError::GapOverflow {
                    missing: self.next_expected,
                    held: self.held.len(),
                });
            }
            self.held.insert(seq, payload);
            self.stats.max_held_seen = self.stats.max_held_seen.max(self.held.len());
            return Ok(Vec::new());
        }

        let mut released = vec![payload];
        self.next_expected += 1;
        while let Some(next) = self.held.remove(&self.next_expected) {
            released.push(next);
            self.next_expected += 1;
        }
        self.stats.released += released.len() as u64;
        Ok(released)
    }

    /// Drops held fragments and restarts at `initial_seq`.
    pub fn reset(&mut self, initial_seq: u64) {
        self.held.clear();
        self.next_expected = initial_seq;
        self.stalled = false;
    }
}

/// Outcome of routing one input fragment through [`InputReorder`].
#[derive(Debug, PartialEq, Eq)]
pub enum Accepted<T> {
    /// Payloads now ready for the consumer, in order. May be empty.
    Released(Vec<T>),
    /// Fragment belonged to a retired session and was discarded.
    StaleSession,
}

#[derive(Debug)]
pub struct InputReorder<T> {
    current: Option<(String, ReorderQueue<T>)>,
    retired: VecDeque<String>,
    max_retired: usize,
    initial_seq: u64,
    max_held: usize,
}

impl<T> InputReorder<T> {
    pub fn new(initial_seq: u64, max_held: usize, max_retired: usize) -> Self {
        Self {
            current: None,
            retired: VecDeque::new(),
            max_retired: max_retired.max(1),
            initial_seq,
            max_held,
        }
    }

    pub fn current_session(&self) -> Option<&str> {
        self.current.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn next_expected(&self) -> Option<u64> {
        self.current.as_ref().map(|(_, queue)| queue.next_expected())
    }

    pub fn held_len(&self) -> usize {
        self.current.as_ref().map_or(0, |(_, queue)| queue.held_len())
    }

    pub fn is_stalled(&self) -> bool {
        self.current.as_ref().is_some_and(|(_, queue)| queue.is_stalled())
    }

    /// Fragments without a session id or with `seq == 0` bypass ordering.
    pub fn accept(
        &mut self,
        session_id: Option<&str>,
        seq: u64,
        payload: T,
    ) -> Result<Accepted<T>, ReorderError> {
        let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
            return Ok(Accepted::Released(vec![payload]));
        };
        if seq == 0 {
            return Ok(Accepted::Released(vec![payload]));
        }
        if self.retired.iter().any(|id| id == session_id) {
            return Ok(Accepted::StaleSession);
        }
        let switch = match &self.current {
            Some((id, _)) => id != session_id,
            None => true,
        };
        if switch {
            self.retire_current();
            self.current = Some((
                session_id.to_string(),
                ReorderQueue::new(self.initial_seq, self.max_held),
            ));
        }
        match self.current.as_mut() {
            Some((_, queue)) => queue.push(seq, payload).map(Accepted::Released),
            None => Ok(Accepted::Released(vec![payload])),
        }
    }

    /// Retires the current session and everything it holds. The next
    /// fragment must come from a new session id.
    pub fn reset(&mut self) -> Option<String> {
        let retired = self.current.as_ref().map(|(id, _)| id.clone());
        self.retire_current();
        retired
    }

    fn retire_current(&mut self) {
        if let Some((id, _)) = self.current.take() {
            self.retired.push_back(id);
            while self.retired.len() > self.max_retired {
                self.retired.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &mut ReorderQueue<u64>, order: &[u64]) -> Vec<u64> {
        let mut out = Vec::new();
        for &seq in order {
            out.extend(queue.push(seq, seq).expect("push"));
        }
        out
    }

    #[test]
    fn in_order_fragments_release_immediately() {
        let mut queue = ReorderQueue::new(1, 8);
        assert_eq!(queue.push(1, "a").unwrap(), vec!["a"]);
        assert_eq!(queue.push(2, "b").unwrap(), vec!["b"]);
        assert_eq!(queue.next_expected(), 3);
    }

    #[test]
    fn early_fragments_wait_for_the_gap() {
        let mut queue = ReorderQueue::new(1, 8);
        assert!(queue.push(3, 3).unwrap().is_empty());
        assert!(queue.push(2, 2).unwrap().is_empty());
        assert_eq!(queue.held_len(), 2);
        assert_eq!(queue.push(1, 1).unwrap(), vec![1, 2, 3]);
        assert_eq!(queue.held_len(), 0);
    }

    #[test]
    fn permutations_with_duplicates_release_exactly_once_in_order() {
        let orders: &[&[u64]] = &[
            &[5, 4, 3, 2, 1],
            &[2, 2, 1, 1, 3, 5, 4, 5],
            &[1, 3, 5, 2, 4, 3, 1],
            &[4, 1, 5, 2, 3, 2, 4],
        ];
        for order in orders {
            let mut queue = ReorderQueue::new(1, 16);
            assert_eq!(drain(&mut queue, order), vec![1, 2, 3, 4, 5], "order {order:?}");
        }
    }

    #[test]
    fn pseudo_random_shuffles_round_trip() {
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..50 {
            let mut order: Vec<u64> = (1..=40).collect();
            for i in (1..order.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let j = (state % (i as u64 + 1)) as usize;
                order.swap(i, j);
            }
            order.extend_from_slice(&[7, 13, 40]);
            let mut queue = ReorderQueue::new(1, 64);
            assert_eq!(drain(&mut queue, &order), (1..=40).collect::<Vec<_>>());
            assert_eq!(queue.stats().duplicates, 3);
        }
    }

    #[test]
    fn stale_fragments_are_ignored() {
        let mut queue = ReorderQueue::new(10, 4);
        assert!(queue.push(3, 3).unwrap().is_empty());
        assert_eq!(queue.push(10, 10).unwrap(), vec![10]);
        assert!(queue.push(10, 10).unwrap().is_empty());
        assert_eq!(queue.stats().duplicates, 2);
    }

    #[test]
    fn overflow_surfaces_gap_and_stalls_until_reset() {
        let mut queue = ReorderQueue::new(1, 2);
        queue.push(2, 2).unwrap();
        queue.push(3, 3).unwrap();
        assert_eq!(
            queue.push(4, 4),
            Err(ReorderError::GapOverflow { missing: 1, held: 2 })
        );
        assert_eq!(queue.push(1, 1), Err(ReorderError::Stalled { missing: 1 }));
        queue.reset(1);
        assert_eq!(queue.push(1, 1).unwrap(), vec![1]);
    }

    #[test]
    fn new_session_discards_held_state() {
        let mut input = InputReorder::new(1, 8, 4);
        assert_eq!(
            input.accept(Some("s1"), 2, "late").unwrap(),
            Accepted::Released(vec![])
        );
        assert_eq!(input.held_len(), 1);
        assert_eq!(
            input.accept(Some("s2"), 1, "fresh").unwrap(),
            Accepted::Released(vec!["fresh"])
        );
        assert_eq!(input.held_len(), 0);
        assert_eq!(
            input.accept(Some("s1"), 1, "old").unwrap(),
            Accepted::StaleSession
        );
    }

    #[test]
    fn unsequenced_fragments_bypass_ordering() {
        let mut input = InputReorder::new(1, 8, 4);
        input.accept(Some("s1"), 3, 3).unwrap();
        assert_eq!(input.accept(None, 9, 9).unwrap(), Accepted::Released(vec![9]));
        assert_eq!(
            input.accept(Some("s1"), 0, 0).unwrap(),
            Accepted::Released(vec![0])
        );
        assert_eq!(input.next_expected(), Some(1));
    }

    #[test]
    fn reset_retires_the_stalled_session() {
        let mut input = InputReorder::new(1, 1, 4);
        input.accept(Some("s1"), 2, 2).unwrap();
        assert!(input.accept(Some("s1"), 3, 3).is_err());
        assert!(input.is_stalled());
        assert_eq!(input.reset().as_deref(), Some("s1"));
        assert_eq!(input.current_session(), None);
        assert_eq!(
            input.accept(Some("s2"), 1, 1).unwrap(),
            Accepted::Released(vec![1])
        );
    }
}
