use crossbeam_utils::sync::{Parker, Unparker};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How many acquisition attempts a waiter spins through before parking.
const SPIN_ATTEMPTS: usize = 64;

thread_local! {
    // Pre-allocated parker reused across waits on this thread. Taken out of
    // the cell while in use so nested waits each get their own instance.
    static PARKER: Cell<Option<Parker>> = Cell::new(None);
}

struct SemWaiter {
    granted: AtomicBool,
    unparker: Unparker,
}

struct UnfairState {
    permits: usize,
    // LIFO stack: the most recently parked worker is released first, keeping
    // its stack and thread-local state warm.
    waiters: Vec<Arc<SemWaiter>>,
}

/// The activation semaphore.
///
/// Deliberately unfair: acquirers spin briefly before parking, and released
/// permits go to the most recently parked waiter. A freshly arrived spinner
/// can overtake parked waiters entirely. Workers that miss out simply keep
/// sleeping, which is exactly what the idle-timeout path wants.
pub(crate) struct UnfairSemaphore {
    state: Mutex<UnfairState>,
}

impl UnfairSemaphore {
    pub(crate) fn new() -> Self {
        UnfairSemaphore {
            state: Mutex::new(UnfairState {
                permits: 0,
                waiters: Vec::new(),
            }),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Block until a permit is available or `timeout` elapses.
    /// Returns whether a permit was acquired.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        for _ in 0..SPIN_ATTEMPTS {
            if self.try_acquire() {
                return true;
            }
            std::hint::spin_loop();
        }

        let parker = PARKER.with(|cell| cell.take()).unwrap_or_else(Parker::new);
        let waiter = Arc::new(SemWaiter {
            granted: AtomicBool::new(false),
            unparker: parker.unparker().clone(),
        });

        let deadline = Instant::now() + timeout;
        let acquired = {
            let mut state = self.state.lock();
            if state.permits > 0 {
                state.permits -= 1;
                true
            } else {
                state.waiters.push(waiter.clone());
                drop(state);
                loop {
                    parker.park_deadline(deadline);
                    if waiter.granted.load(Ordering::Acquire) {
                        break true;
                    }
                    if Instant::now() >= deadline {
                        let mut state = self.state.lock();
                        // A grant may have landed between the deadline check
                        // and taking the lock; honour it.
                        if waiter.granted.load(Ordering::Acquire) {
                            break true;
                        }
                        state.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                        break false;
                    }
                    // Spurious unpark: go around.
                }
            }
        };

        PARKER.with(|cell| cell.set(Some(parker)));
        acquired
    }

    /// Make `n` permits available, preferring parked waiters newest-first.
    pub(crate) fn release(&self, n: usize) {
        let mut to_wake = Vec::new();
        {
            let mut state = self.state.lock();
            let mut remaining = n;
            while remaining > 0 {
                match state.waiters.pop() {
                    Some(w) => {
                        to_wake.push(w);
                        remaining -= 1;
                    }
                    None => break,
                }
            }
            state.permits += remaining;
        }
        for w in to_wake {
            w.granted.store(true, Ordering::Release);
            w.unparker.unpark();
        }
    }
}

/// The retirement semaphore: a plain counting semaphore with timed waits.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Semaphore {
            permits: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Block until a permit is available or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.cv.wait_until(&mut permits, deadline).timed_out() {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    pub(crate) fn release(&self, n: usize) {
        let mut permits = self.permits.lock();
        *permits += n;
        for _ in 0..n {
            self.cv.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unfair_release_wakes_waiter() {
        let sem = Arc::new(UnfairSemaphore::new());
        let woken = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..3)
            .map(|_| {
                let sem = sem.clone();
                let woken = woken.clone();
                std::thread::spawn(move || {
                    if sem.wait(Duration::from_secs(5)) {
                        woken.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        sem.release(3);
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unfair_wait_times_out() {
        let sem = UnfairSemaphore::new();
        let start = Instant::now();
        assert!(!sem.wait(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn permit_survives_without_waiter() {
        let sem = UnfairSemaphore::new();
        sem.release(1);
        assert!(sem.wait(Duration::from_millis(1)));
    }

    #[test]
    fn counting_semaphore_counts() {
        let sem = Semaphore::new();
        sem.release(2);
        assert!(sem.wait(Duration::from_millis(1)));
        assert!(sem.wait(Duration::from_millis(1)));
        assert!(!sem.wait(Duration::from_millis(10)));
    }
}
