use crate::sync::apc::Alerter;
use arrayvec::ArrayVec;
use parking_lot::{Condvar, Mutex};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on the number of handles one multi-object wait may cover,
/// matching the cardinality of the OS primitive this multiplexes.
pub const MAX_WAITHANDLES: usize = 63;

/// What ended an alertable wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum WaitOutcome {
    /// The event at this index was signaled (and consumed, if auto-reset).
    Signaled(usize),
    /// A mailbox message arrived; the caller must drain before re-waiting.
    Alerted,
    /// The timeout elapsed.
    TimedOut,
    /// At least one waited-on event was closed while we waited. The caller
    /// probes each handle to find the offender.
    Abandoned,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Wake {
    Signaled(usize),
    Alerted,
    Failed,
    TimedOut,
}

/// Per-blocked-thread wake slot. An event (or an alerter) delivers exactly
/// one wake into it; later deliveries fail and the would-be deliverer keeps
/// its token instead.
pub(crate) struct Waker {
    state: Mutex<Option<Wake>>,
    cv: Condvar,
}

impl Waker {
    pub(crate) fn new() -> Self {
        Waker {
            state: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Deliver `wake` unless the slot was already claimed.
    pub(crate) fn try_wake(&self, wake: Wake) -> bool {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(wake);
            self.cv.notify_one();
            true
        } else {
            false
        }
    }

    /// Block until a wake is delivered or the deadline passes. On expiry the
    /// slot is claimed with `TimedOut` so no event can deliver afterwards.
    fn wait_until(&self, deadline: Option<Instant>) -> Wake {
        let mut state = self.state.lock();
        loop {
            if let Some(wake) = *state {
                return wake;
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut state, deadline).timed_out() {
                        return *state.get_or_insert(Wake::TimedOut);
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }
    }
}

struct EventInner {
    signaled: bool,
    closed: bool,
    waiters: Vec<(Arc<Waker>, usize)>,
}

enum Registered {
    Pending,
    Signaled,
    Closed,
}

/// A portable waitable handle: the thing wait registrations wait on, and the
/// parking spot for retired I/O dispatchers and deregistration callers.
///
/// Auto-reset events hand one signal to one waiter (or store it if nobody is
/// waiting); manual-reset events stay signaled until [`Event::reset`].
/// [`Event::close`] permanently invalidates the handle, which a multi-object
/// wait reports as an abandoned wait.
pub struct Event {
    inner: Mutex<EventInner>,
    manual: bool,
}

impl Event {
    /// A new auto-reset event.
    pub fn auto_reset() -> Event {
        Event::new(false)
    }

    /// A new manual-reset event.
    pub fn manual_reset() -> Event {
        Event::new(true)
    }

    fn new(manual: bool) -> Event {
        Event {
            inner: Mutex::new(EventInner {
                signaled: false,
                closed: false,
                waiters: Vec::new(),
            }),
            manual,
        }
    }

    /// Signal the event, waking one waiter (auto-reset) or all (manual).
    pub fn signal(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if self.manual {
            inner.signaled = true;
            for (waker, index) in inner.waiters.drain(..) {
                waker.try_wake(Wake::Signaled(index));
            }
        } else {
            // Newest waiter first; losers keep sleeping and the token is
            // stored if every registered waiter was already claimed.
            while let Some((waker, index)) = inner.waiters.pop() {
                if waker.try_wake(Wake::Signaled(index)) {
                    return;
                }
            }
            inner.signaled = true;
        }
    }

    /// Clear a manual-reset event's signaled state.
    pub fn reset(&self) {
        self.inner.lock().signaled = false;
    }

    /// Permanently invalidate the handle. Current and future waits fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.signaled = false;
        for (waker, _) in inner.waiters.drain(..) {
            waker.try_wake(Wake::Failed);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub(crate) fn is_manual_reset(&self) -> bool {
        self.manual
    }

    /// Block until signaled. Returns `false` on timeout or if the event is
    /// closed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let waker = Arc::new(Waker::new());
        match self.register(&waker, 0) {
            Registered::Signaled => return true,
            Registered::Closed => return false,
            Registered::Pending => {}
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let wake = waker.wait_until(deadline);
        self.deregister(&waker);
        matches!(wake, Wake::Signaled(_))
    }

    fn register(&self, waker: &Arc<Waker>, index: usize) -> Registered {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Registered::Closed;
        }
        if inner.signaled {
            if !self.manual {
                inner.signaled = false;
            }
            return Registered::Signaled;
        }
        inner.waiters.push((waker.clone(), index));
        Registered::Pending
    }

    fn deregister(&self, waker: &Arc<Waker>) {
        self.inner
            .lock()
            .waiters
            .retain(|(w, _)| !Arc::ptr_eq(w, waker));
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Event")
            .field("manual", &self.manual)
            .field("signaled", &inner.signaled)
            .field("closed", &inner.closed)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

/// Wait for any of `events` to be signaled, for a mailbox alert, or for the
/// timeout. At most [`MAX_WAITHANDLES`] events may be waited on at once.
pub(crate) fn wait_any(
    events: &[Arc<Event>],
    timeout: Option<Duration>,
    alert: Option<&Alerter>,
) -> WaitOutcome {
    debug_assert!(events.len() <= MAX_WAITHANDLES);

    let waker = Arc::new(Waker::new());

    if let Some(alert) = alert {
        alert.install(&waker);
        // A message that arrived before the waker was installed would
        // otherwise be slept through.
        if alert.is_pending() {
            alert.uninstall();
            return WaitOutcome::Alerted;
        }
    }

    let mut registered: ArrayVec<usize, MAX_WAITHANDLES> = ArrayVec::new();
    for (index, event) in events.iter().enumerate() {
        match event.register(&waker, index) {
            Registered::Pending => registered.push(index),
            Registered::Signaled => {
                if !waker.try_wake(Wake::Signaled(index)) && !event.manual {
                    // An alert claimed the slot first; put the token back.
                    event.signal();
                }
                break;
            }
            Registered::Closed => {
                waker.try_wake(Wake::Failed);
                break;
            }
        }
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let wake = waker.wait_until(deadline);

    for &index in &registered {
        events[index].deregister(&waker);
    }
    if let Some(alert) = alert {
        alert.uninstall();
    }

    match wake {
        Wake::Signaled(index) => WaitOutcome::Signaled(index),
        Wake::Alerted => WaitOutcome::Alerted,
        Wake::Failed => WaitOutcome::Abandoned,
        Wake::TimedOut => WaitOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn auto_reset_stores_one_signal() {
        let event = Event::auto_reset();
        event.signal();
        assert!(event.wait(Some(Duration::from_millis(1))));
        // consumed
        assert!(!event.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn manual_reset_stays_signaled() {
        let event = Event::manual_reset();
        event.signal();
        assert!(event.wait(Some(Duration::from_millis(1))));
        assert!(event.wait(Some(Duration::from_millis(1))));
        event.reset();
        assert!(!event.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn signal_crosses_threads() {
        let event = Arc::new(Event::auto_reset());
        let signaller = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                event.signal();
            })
        };
        assert!(event.wait(Some(Duration::from_secs(5))));
        signaller.join().unwrap();
    }

    #[test]
    fn wait_any_reports_index() {
        let events: Vec<_> = (0..5).map(|_| Arc::new(Event::auto_reset())).collect();
        events[3].signal();
        assert_eq!(
            wait_any(&events, Some(Duration::from_millis(100)), None),
            WaitOutcome::Signaled(3)
        );
    }

    #[test]
    fn wait_any_times_out() {
        let events: Vec<_> = (0..2).map(|_| Arc::new(Event::auto_reset())).collect();
        assert_eq!(
            wait_any(&events, Some(Duration::from_millis(20)), None),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn closed_event_abandons_wait() {
        let events = vec![Arc::new(Event::auto_reset())];
        events[0].close();
        assert_eq!(
            wait_any(&events, Some(Duration::from_millis(20)), None),
            WaitOutcome::Abandoned
        );
    }

    #[test]
    fn one_signal_wakes_exactly_one_auto_waiter() {
        let event = Arc::new(Event::auto_reset());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                thread::spawn(move || event.wait(Some(Duration::from_millis(300))))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        event.signal();
        let woken = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(woken, 1);
    }
}
