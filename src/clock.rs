// Lamport logical clock, shared by every connection task of a process
// all three operations are lock free. `on_receive` is a compare-and-retry loop
// through `fetch_update`, so concurrent merges never lose each other's update
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

pub type LogicalTime = u64;

// largest time accepted from a peer. it keeps lamports exactly representable as
// JSON numbers and leaves the clock room to advance, a saturated clock would
// stop ordering anything
pub const MAX_PRESENTED: LogicalTime = (1 << 53) - 1;

#[derive(Debug, Default)]
pub struct LamportClock(AtomicU64);

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    // used when restoring from a snapshot: every event after restart must be
    // ordered after the restored ones
    pub fn starting_at(time: LogicalTime) -> Self {
        Self(AtomicU64::new(time))
    }

    pub fn current(&self) -> LogicalTime {
        self.0.load(SeqCst)
    }

    /// Advances the clock for a local event (including "about to send") and
    /// returns the new time.
    pub fn tick(&self) -> LogicalTime {
        self.advance(|local| local.saturating_add(1))
    }

    /// Merges a time observed on an incoming message, `max(local, remote) + 1`.
    pub fn on_receive(&self, remote: LogicalTime) -> LogicalTime {
        self.advance(|local| local.max(remote).saturating_add(1))
    }

    fn advance(&self, next: impl Fn(LogicalTime) -> LogicalTime) -> LogicalTime {
        // the closure never declines so both arms carry the previous value
        match self.0.fetch_update(SeqCst, SeqCst, |local| Some(next(local))) {
            Ok(prev) | Err(prev) => next(prev),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn tick_and_merge() {
        let clock = LamportClock::new();
        assert_eq!(clock.current(), 0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.on_receive(10), 11);
        // stale remote time still advances local time
        assert_eq!(clock.on_receive(3), 12);
        assert_eq!(clock.current(), 12);
    }

    #[test]
    fn restored_clock_orders_after_restored_time() {
        let clock = LamportClock::starting_at(41);
        assert_eq!(clock.tick(), 42);
        assert_eq!(clock.on_receive(0), 43);
    }

    #[test]
    fn saturates_instead_of_wrapping() {
        let clock = LamportClock::new();
        assert_eq!(clock.on_receive(u64::MAX), u64::MAX);
        assert_eq!(clock.tick(), u64::MAX);
    }

    #[test]
    fn concurrent_events_are_unique() -> anyhow::Result<()> {
        let clock = Arc::new(LamportClock::new());
        let handles = (0..8)
            .map(|i| {
                let clock = clock.clone();
                thread::spawn(move || {
                    (0..1000)
                        .map(|j| {
                            if (i + j) % 3 == 0 {
                                clock.on_receive(j)
                            } else {
                                clock.tick()
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();
        let mut seen = BTreeSet::new();
        for handle in handles {
            let times = handle
                .join()
                .map_err(|_| anyhow::anyhow!("clock thread panicked"))?;
            // per thread the returned values strictly increase
            anyhow::ensure!(times.windows(2).all(|pair| pair[0] < pair[1]));
            for time in times {
                anyhow::ensure!(seen.insert(time), "duplicated time {time}")
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(clock.current(), *seen.last().unwrap());
        Ok(())
    }

    #[test]
    fn monotonic_under_arbitrary_events() {
        arbtest::arbtest(|u| {
            let clock = LamportClock::new();
            let mut last = clock.current();
            for _ in 0..u.int_in_range(0..=64)? {
                let time = if u.arbitrary()? {
                    let remote = u.int_in_range(0..=1_000_000)?;
                    let local = clock.current();
                    let time = clock.on_receive(remote);
                    assert!(time > local.max(remote));
                    time
                } else {
                    clock.tick()
                };
                assert!(time > last);
                last = time
            }
            Ok(())
        });
    }
}
