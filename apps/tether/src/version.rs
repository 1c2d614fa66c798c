use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Ordering marker for status updates.
///
/// Values are microseconds since the unix epoch, bumped past the previous
/// value when the clock has not advanced (or went backwards), so two
/// processes with roughly synchronized clocks produce comparable values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionTs(pub u64);

impl VersionTs {
    pub const ZERO: VersionTs = VersionTs(0);

    pub fn as_micros(self) -> u64 {
        self.0
    }

    pub fn is_newer_than(self, other: VersionTs) -> bool {
        self.0 > other.0
    }
}

#[derive(Debug, Default)]
pub struct VersionGenerator {
    last: AtomicU64,
}

impl VersionGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> VersionTs {
        self.next_at(now_micros())
    }

    fn next_at(&self, now: u64) -> VersionTs {
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return VersionTs(candidate),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Last value handed out, or zero before the first call.
    pub fn current(&self) -> VersionTs {
        VersionTs(self.last.load(Ordering::Acquire))
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn rapid_calls_are_strictly_increasing() {
        let generator = VersionGenerator::new();
        let mut last = VersionTs::ZERO;
        for _ in 0..10_000 {
            let next = generator.next();
            assert!(next.is_newer_than(last));
            last = next;
        }
    }

    #[test]
    fn clock_going_backwards_still_advances() {
        let generator = VersionGenerator::new();
        let a = generator.next_at(5_000);
        let b = generator.next_at(4_000);
        let c = generator.next_at(4_000);
        assert_eq!(a, VersionTs(5_000));
        assert_eq!(b, VersionTs(5_001));
        assert_eq!(c, VersionTs(5_002));
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let generator = Arc::new(VersionGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || (0..2_000).map(|_| generator.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for ts in handle.join().expect("thread") {
                assert!(seen.insert(ts), "duplicate version {ts:?}");
            }
        }
        assert_eq!(seen.len(), 8_000);
    }

    #[test]
    fn tracks_wall_clock() {
        let generator = VersionGenerator::new();
        let ts = generator.next();
        let now = now_micros();
        assert!(ts.as_micros() <= now);
        assert!(now - ts.as_micros() < 5_000_000);
    }
}
