/// Source of record version counters.
///
/// Versions are wall-clock nanoseconds since the unix epoch, clamped so
/// that every call returns a strictly greater value than the one before
/// it. Clock skew between nodes can still make a newer edit lose to an
/// older one; the last-writer-wins rule tolerates that, and the NodeId
/// tie-break keeps the outcome deterministic.
#[derive(Debug, Default)]
pub struct VersionClock(std::sync::atomic::AtomicU64);

impl VersionClock {
    /// Construct a new VersionClock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next version counter.
    pub fn next(&self) -> u64 {
        use std::sync::atomic::Ordering::*;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let mut prev = self.0.load(Acquire);
        loop {
            let next = now.max(prev + 1);
            match self.0.compare_exchange_weak(prev, next, AcqRel, Acquire) {
                Ok(_) => return next,
                Err(p) => prev = p,
            }
        }
    }

    /// Bump the clock past a version observed from elsewhere, so that the
    /// next locally issued version supersedes it.
    pub fn observe(&self, version: u64) {
        use std::sync::atomic::Ordering::*;
        self.0.fetch_max(version, AcqRel);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strictly_increasing() {
        let clock = VersionClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let v = clock.next();
            assert!(v > last);
            last = v;
        }
    }

    #[test]
    fn tracks_wall_clock() {
        let clock = VersionClock::new();
        let wall = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        assert!(clock.next() >= wall);
    }

    #[test]
    fn observe_advances() {
        let clock = VersionClock::new();
        let future = clock.next() + 1_000_000_000;
        clock.observe(future);
        assert!(clock.next() > future);
    }
}
