use crossbeam_utils::CachePadded;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// The largest number of threads a single pool can account for.
///
/// Each of the four fields is stored in 16 bits, and `active + retired` must
/// never exceed this value for the thread count invariants to be expressible.
pub const MAX_POSSIBLE_THREADS: u16 = 0x7fff;

/// One coherent observation of the pool's thread bookkeeping.
///
/// The four fields are packed into a single 64-bit word so that every reader
/// observes all of them from the same instant and every writer replaces all
/// of them in one compare-exchange. There are deliberately no single-field
/// increment operations anywhere in this crate; a field changed in isolation
/// could violate `working <= active` for a concurrent observer.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Counts {
    /// Threads that exist and are not parked on the retirement semaphore.
    pub active: u16,
    /// Active threads executing a work unit or about to look for one.
    pub working: u16,
    /// Threads parked on the retirement semaphore, revivable without a spawn.
    pub retired: u16,
    /// Current ceiling on `working`, set by hill climbing, the gate thread
    /// or configuration.
    pub max_working: u16,
}

impl Counts {
    #[inline(always)]
    pub(crate) const fn new(max_working: u16) -> Self {
        Counts {
            active: 0,
            working: 0,
            retired: 0,
            max_working,
        }
    }

    #[inline(always)]
    const fn pack(self) -> u64 {
        let [a0, a1] = self.active.to_ne_bytes();
        let [w0, w1] = self.working.to_ne_bytes();
        let [r0, r1] = self.retired.to_ne_bytes();
        let [m0, m1] = self.max_working.to_ne_bytes();
        u64::from_ne_bytes([a0, a1, w0, w1, r0, r1, m0, m1])
    }

    #[inline(always)]
    const fn unpack(value: u64) -> Self {
        let [a0, a1, w0, w1, r0, r1, m0, m1] = value.to_ne_bytes();
        Counts {
            active: u16::from_ne_bytes([a0, a1]),
            working: u16::from_ne_bytes([w0, w1]),
            retired: u16::from_ne_bytes([r0, r1]),
            max_working: u16::from_ne_bytes([m0, m1]),
        }
    }
}

impl Debug for Counts {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counts")
            .field("active", &self.active)
            .field("working", &self.working)
            .field("retired", &self.retired)
            .field("max_working", &self.max_working)
            .finish()
    }
}

/// The packed atomic thread counter shared by one pool.
///
/// All updates go through [`Counter::compare_exchange`] or the retrying
/// [`Counter::update`] helper; both operate on whole [`Counts`] values.
#[repr(transparent)]
pub struct Counter {
    inner: CachePadded<AtomicU64>,
}

impl Counter {
    #[inline(always)]
    pub(crate) fn new(initial: Counts) -> Self {
        Counter {
            inner: CachePadded::new(AtomicU64::new(initial.pack())),
        }
    }

    /// An atomic load of all four fields.
    #[inline(always)]
    pub fn snapshot(&self) -> Counts {
        Counts::unpack(self.inner.load(Ordering::Acquire))
    }

    /// Attempt to replace `current` with `new`. On failure the observed
    /// value is returned so the caller can recompute and retry.
    #[inline(always)]
    pub(crate) fn compare_exchange(&self, current: Counts, new: Counts) -> Result<Counts, Counts> {
        self.inner
            .compare_exchange(current.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(Counts::unpack)
            .map_err(Counts::unpack)
    }

    /// Read, transform, CAS, and retry until the exchange commits.
    ///
    /// `f` returning `None` aborts the update; the last observed value is
    /// reported either way as `(observed, committed)`.
    pub(crate) fn update<F>(&self, mut f: F) -> (Counts, Option<Counts>)
    where
        F: FnMut(Counts) -> Option<Counts>,
    {
        let mut current = self.snapshot();
        loop {
            let new = match f(current) {
                Some(new) => new,
                None => return (current, None),
            };
            if new == current {
                return (current, Some(new));
            }
            match self.compare_exchange(current, new) {
                Ok(_) => return (current, Some(new)),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Debug for Counter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Counter").field(&self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        let counts = Counts {
            active: 17,
            working: 5,
            retired: 3,
            max_working: 12,
        };
        assert_eq!(Counts::unpack(counts.pack()), counts);

        let extremes = Counts {
            active: MAX_POSSIBLE_THREADS,
            working: 0,
            retired: MAX_POSSIBLE_THREADS,
            max_working: 1,
        };
        assert_eq!(Counts::unpack(extremes.pack()), extremes);
    }

    #[test]
    fn compare_exchange_observes_interference() {
        let counter = Counter::new(Counts::new(4));
        let seen = counter.snapshot();

        let mut bumped = seen;
        bumped.active = 1;
        bumped.working = 1;
        assert!(counter.compare_exchange(seen, bumped).is_ok());

        // A stale expectation must fail and report the committed value.
        let mut stale = seen;
        stale.active = 2;
        let observed = counter.compare_exchange(seen, stale).unwrap_err();
        assert_eq!(observed, bumped);
    }

    #[test]
    fn update_retries_until_commit() {
        use std::sync::Arc;

        let counter = Arc::new(Counter::new(Counts::new(8)));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.update(|mut c| {
                            c.active += 1;
                            c.working += 1;
                            Some(c)
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let counts = counter.snapshot();
        assert_eq!(counts.active, 4000);
        assert_eq!(counts.working, 4000);
        assert_eq!(counts.retired, 0);
        assert_eq!(counts.max_working, 8);
    }

    #[test]
    fn update_can_abort() {
        let counter = Counter::new(Counts::new(2));
        let (observed, committed) = counter.update(|_| None);
        assert_eq!(observed, counter.snapshot());
        assert!(committed.is_none());
    }
}
