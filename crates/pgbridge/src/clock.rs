//! Process-wide monotonic timestamps and the schema invalidation counter.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);
static LAST_ISSUED: AtomicU64 = AtomicU64::new(0);

/// Nanoseconds since the process clock epoch.
///
/// Every value returned by [`now`] is strictly greater than the previous one,
/// so cache entries and invalidation bumps are totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp, older than anything [`now`] returns.
    pub const ZERO: Self = Self(0);

    /// Build a timestamp from raw nanoseconds.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Raw nanoseconds.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

/// Current time on the process clock.
pub fn now() -> Timestamp {
    let elapsed = u64::try_from(EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX);
    let next = |last: u64| elapsed.max(last.saturating_add(1));
    let previous = LAST_ISSUED
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(next(last)))
        .unwrap_or_else(|last| last);
    Timestamp(next(previous))
}

/// Schema invalidation counter shared by a dialect and its connections.
///
/// Starts at [`Timestamp::ZERO`] and never moves backwards.
#[derive(Debug, Default)]
pub struct SchemaInvalidation {
    asof: AtomicU64,
}

impl SchemaInvalidation {
    /// Counter at the zero timestamp.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            asof: AtomicU64::new(0),
        }
    }

    /// Latest invalidation timestamp.
    pub fn current(&self) -> Timestamp {
        Timestamp(self.asof.load(Ordering::Acquire))
    }

    /// Advance the counter to the current time and return the new value.
    pub fn bump(&self) -> Timestamp {
        let ts = now();
        let previous = self.asof.fetch_max(ts.0, Ordering::AcqRel);
        let current = Timestamp(previous.max(ts.0));
        tracing::info!(asof = current.0, "schema cache invalidated");
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_strictly_increasing() {
        let mut last = now();
        for _ in 0..1000 {
            let ts = now();
            assert!(ts > last);
            last = ts;
        }
        assert!(last > Timestamp::ZERO);
    }

    #[test]
    fn test_now_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..500).map(|_| now()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<Timestamp> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn test_invalidation_starts_at_zero_and_never_decreases() {
        let invalidation = SchemaInvalidation::new();
        assert_eq!(invalidation.current(), Timestamp::ZERO);

        let first = invalidation.bump();
        assert!(first > Timestamp::ZERO);
        assert_eq!(invalidation.current(), first);

        let second = invalidation.bump();
        assert!(second > first);
        assert_eq!(invalidation.current(), second);
    }

    #[test]
    fn test_bump_is_newer_than_prior_timestamps() {
        let invalidation = SchemaInvalidation::new();
        let before = now();
        assert!(invalidation.bump() > before);
    }
}
