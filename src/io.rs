//! The I/O completion dispatcher: a parallel pool with its own packed
//! counter, blocking on a portable completion port. Dispatchers that time
//! out while holding outstanding asynchronous I/O retire onto a dedicated
//! wakeup event instead of exiting, because their thread identity still owns
//! the pending operations.

use crate::config::PoolConfig;
use crate::counter::{Counter, Counts};
use crate::error::{Error, Result};
use crate::pool::PoolInner;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Polling interval of a retired dispatcher with pending I/O.
const IO_PENDING_WAIT: Duration = Duration::from_secs(5);

/// Growth throttle: each thread beyond the CPU count stretches the minimum
/// creation delay by this factor.
const CREATION_THROTTLE: f64 = 0.3;

/// One entry dequeued from the completion port.
pub(crate) enum Packet {
    /// A completion for a bound callback.
    Completion { binding: u64, error: u32, bytes: u32 },
    /// Drainage marker: "no new work was posted before this point".
    DrainInitiate,
    /// Follow-up marker guaranteeing a different thread observes the drain.
    DrainContinue,
}

/// A many-producer many-consumer completion queue with timed dequeue; the
/// portable stand-in for an OS completion port.
struct Port {
    queue: Mutex<VecDeque<Packet>>,
    cv: Condvar,
}

impl Port {
    fn new() -> Self {
        Port {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn post(&self, packet: Packet) {
        self.queue.lock().push_back(packet);
        self.cv.notify_one();
    }

    fn get(&self, timeout: Duration) -> Option<Packet> {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(packet) = queue.pop_front() {
                return Some(packet);
            }
            if self.cv.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    fn try_get(&self) -> Option<Packet> {
        self.queue.lock().pop_front()
    }
}

struct IoBinding {
    callback: Box<dyn Fn(u32, u32) + Send + Sync>,
}

/// A callback bound to the pool's completion port. Completions posted
/// against it run on an I/O dispatcher thread.
#[derive(Debug, Clone)]
pub struct IoRegistration {
    id: u64,
}

pub(crate) struct IoCore {
    pub(crate) counter: Counter,
    port: Port,
    bindings: Mutex<HashMap<u64, Arc<IoBinding>>>,
    next_binding: AtomicU64,
    initialized: AtomicBool,
    last_creation_ms: AtomicU64,
    drain_needed: AtomicBool,
    drained: crate::sync::Event,
    /// Parking spot for dispatchers retired with pending I/O.
    retired_wakeup: crate::sync::Event,
    next_io_worker_id: AtomicUsize,
}

impl IoCore {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        IoCore {
            counter: Counter::new(Counts::new(config.max_iocp)),
            port: Port::new(),
            bindings: Mutex::new(HashMap::new()),
            next_binding: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            last_creation_ms: AtomicU64::new(0),
            drain_needed: AtomicBool::new(false),
            drained: crate::sync::Event::manual_reset(),
            retired_wakeup: crate::sync::Event::auto_reset(),
            next_io_worker_id: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl PoolInner {
    /// Associate `callback` with the completion port. Completions are
    /// posted against the returned registration.
    pub(crate) fn bind_io_completion(
        self: &Arc<Self>,
        callback: Box<dyn Fn(u32, u32) + Send + Sync>,
    ) -> Result<IoRegistration> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let id = self.io.next_binding.fetch_add(1, Ordering::Relaxed);
        self.io
            .bindings
            .lock()
            .insert(id, Arc::new(IoBinding { callback }));
        Ok(IoRegistration { id })
    }

    /// Post a completion packet for a bound callback.
    pub(crate) fn post_completion(
        self: &Arc<Self>,
        registration: &IoRegistration,
        error: u32,
        bytes: u32,
    ) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if !self.io.bindings.lock().contains_key(&registration.id) {
            return Err(Error::InvalidArgument("unknown completion binding"));
        }
        self.io.initialized.store(true, Ordering::Release);
        self.io.port.post(Packet::Completion {
            binding: registration.id,
            error,
            bytes,
        });
        self.grow_io_pool_if_needed();
        Ok(())
    }

    /// Announce that no new work precedes this point on the port, and wait
    /// until a dispatcher has observed the marker.
    pub(crate) fn drain_completions(self: &Arc<Self>, timeout: Duration) -> bool {
        if !self.io.is_initialized() {
            return true;
        }
        self.io.drained.reset();
        self.io.port.post(Packet::DrainInitiate);
        self.grow_io_pool_if_needed();
        self.io.drained.wait(Some(timeout))
    }

    /// The gate's per-tick assist for the I/O pool.
    pub(crate) fn io_gate_assist(self: &Arc<Self>) {
        let io = &self.io;
        if !io.is_initialized() {
            return;
        }

        let counts = io.counter.snapshot();
        let all_busy = counts.active == counts.working;

        if all_busy
            && counts.retired == 0
            && counts.active < self.config.max_iocp
            && !io.drain_needed.load(Ordering::Acquire)
        {
            // Every dispatcher is busy and none are parked: check whether
            // completions are already waiting, and if so hand one straight
            // to a fresh dispatcher.
            if let Some(packet) = io.port.try_get() {
                io.counter.update(|mut c| {
                    c.active += 1;
                    c.working += 1;
                    Some(c)
                });
                if let Err((error, seed)) = self.create_io_thread(Some(packet)) {
                    warn!(%error, "io dispatcher creation failed in gate assist");
                    io.counter.update(|mut c| {
                        c.active -= 1;
                        c.working -= 1;
                        Some(c)
                    });
                    // The drained packet must not be lost.
                    if let Some(packet) = seed {
                        io.port.post(packet);
                    }
                }
            }
        } else if self.gate.cpu_is_low() && all_busy && counts.retired > 0 {
            // Plenty of CPU and parked dispatchers available: revive one
            // instead of letting completions queue up.
            self.io.retired_wakeup.signal();
        }
    }

    fn sufficient_delay_since_last_io_creation(&self, active: u16) -> bool {
        let now = self.tick_ms();
        let since = now.saturating_sub(self.io.last_creation_ms.load(Ordering::Acquire));
        let cpus = self.platform.cpu_count() as u16;
        let surplus = active.saturating_sub(cpus).min(20) as f64;
        let min_wait =
            (self.config.gate_tick_ms as f64 * (1.0 + CREATION_THROTTLE).powf(surplus)) as u64;
        since > min_wait
    }

    fn should_grow_io_pool(&self, counts: Counts) -> bool {
        if counts.working < counts.active {
            return false;
        }
        if counts.retired > 0 {
            return true;
        }
        let min = self.config.min_iocp;
        let max = self.config.max_iocp;
        if (counts.active as u32 + counts.retired as u32) < max as u32
            && (counts.active < min || self.gate.cpu_is_low())
        {
            counts.active < min || self.sufficient_delay_since_last_io_creation(counts.active)
        } else {
            false
        }
    }

    pub(crate) fn grow_io_pool_if_needed(self: &Arc<Self>) {
        let io = &self.io;
        loop {
            let counts = io.counter.snapshot();
            if !self.should_grow_io_pool(counts) {
                return;
            }
            if counts.retired > 0 {
                // Reviving a parked dispatcher beats paying thread creation.
                io.retired_wakeup.signal();
                return;
            }
            let mut new = counts;
            new.active += 1;
            new.working += 1;
            if io.counter.compare_exchange(counts, new).is_ok() {
                io.last_creation_ms.store(self.tick_ms(), Ordering::Release);
                if let Err((error, _)) = self.create_io_thread(None) {
                    warn!(%error, "io dispatcher creation failed, rolling back");
                    io.counter.update(|mut c| {
                        c.active -= 1;
                        c.working -= 1;
                        Some(c)
                    });
                }
                return;
            }
        }
    }

    /// On spawn failure the seed packet (if any) is handed back so the
    /// caller can repost it.
    fn create_io_thread(
        self: &Arc<Self>,
        seed: Option<Packet>,
    ) -> std::result::Result<(), (Error, Option<Packet>)> {
        let id = self.io.next_io_worker_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(seed));
        let inner = self.clone();
        let thread_slot = slot.clone();
        thread::Builder::new()
            .name(format!("workpool io {}", id))
            .spawn(move || {
                let seed = thread_slot.lock().take();
                io_worker_main(inner, seed)
            })
            .map(drop)
            .map_err(|e| (Error::ThreadCreationFailed(e), slot.lock().take()))
    }
}

/// Body of every I/O dispatcher thread. Born counted `(active+1,
/// working+1)` by whoever created it.
fn io_worker_main(inner: Arc<PoolInner>, mut seed: Option<Packet>) {
    trace!("io dispatcher started");
    let io = &inner.io;
    let idle_timeout = Duration::from_millis(inner.config.worker_idle_timeout_ms as u64);

    'top: loop {
        if inner.shutdown.load(Ordering::Acquire) {
            io.counter.update(|mut c| {
                c.active -= 1;
                c.working -= 1;
                Some(c)
            });
            trace!("io dispatcher exiting on shutdown");
            return;
        }

        // We are nominally working; shed the slot while we block on the
        // port so the gate can tell free dispatchers from busy ones.
        io.counter.update(|mut c| {
            c.working -= 1;
            Some(c)
        });

        let packet = match seed.take() {
            Some(packet) => Some(packet),
            None => io.port.get(idle_timeout),
        };

        // Decide: transition to working, retire, or exit. One exchange.
        let mut enter_retirement;
        let mut counts = io.counter.snapshot();
        loop {
            let mut new = counts;
            enter_retirement = false;

            if packet.is_none() {
                new.active -= 1;
                if new.active == new.working {
                    // We are the last free dispatcher; without us nobody
                    // would notice newly queued completions. Stay instead.
                    let mut stay = counts;
                    stay.working += 1; // shed again at the top
                    match io.counter.compare_exchange(counts, stay) {
                        Ok(_) => continue 'top,
                        Err(observed) => {
                            counts = observed;
                            continue;
                        }
                    }
                }
                if inner.platform.io_pending() {
                    // This thread's identity still owns outstanding I/O;
                    // exiting would orphan it.
                    enter_retirement = true;
                    new.retired += 1;
                }
            } else {
                new.working += 1;
            }

            match io.counter.compare_exchange(counts, new) {
                Ok(_) => break,
                Err(observed) => counts = observed,
            }
        }

        let packet = match packet {
            Some(packet) => packet,
            None if enter_retirement => {
                trace!("io dispatcher retired with pending io");
                loop {
                    if io.retired_wakeup.wait(Some(IO_PENDING_WAIT)) {
                        // Back into rotation; counted working until the
                        // decrement at the top.
                        io.counter.update(|mut c| {
                            c.retired -= 1;
                            c.active += 1;
                            c.working += 1;
                            Some(c)
                        });
                        continue 'top;
                    }
                    if inner.platform.io_pending() {
                        continue;
                    }
                    io.counter.update(|mut c| {
                        c.retired -= 1;
                        Some(c)
                    });
                    debug!("io dispatcher exiting after retirement");
                    return;
                }
            }
            None => {
                debug!("io dispatcher exiting");
                return;
            }
        };

        // From here on we hold a working slot. If that makes every
        // dispatcher busy, the gate must be watching the port for us.
        let counts = io.counter.snapshot();
        if counts.working >= counts.active {
            inner.ensure_gate_thread_running();
        }

        match packet {
            Packet::Completion {
                binding,
                error,
                bytes,
            } => {
                inner.grow_io_pool_if_needed();
                let callback = io.bindings.lock().get(&binding).cloned();
                match callback {
                    Some(bound) => {
                        // Callback faults must not unwind into the counter
                        // protocol.
                        if catch_unwind(AssertUnwindSafe(|| (bound.callback)(error, bytes)))
                            .is_err()
                        {
                            warn!("io completion callback panicked; continuing");
                        }
                    }
                    None => warn!(binding, "completion for unknown binding dropped"),
                }
            }
            Packet::DrainInitiate => {
                // Post the follow-up before acting so that, with the port's
                // tendency to hand a packet back to the posting thread, a
                // *different* dispatcher still observes the marker.
                io.drain_needed.store(true, Ordering::Release);
                io.port.post(Packet::DrainContinue);
            }
            Packet::DrainContinue => {
                io.drain_needed.store(false, Ordering::Release);
                io.drained.signal();
            }
        }
    }
}

impl Debug for IoCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoCore")
            .field("counts", &self.counter.snapshot())
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::platform::SystemPlatform;
    use std::sync::atomic::AtomicUsize;

    fn test_inner() -> Arc<PoolInner> {
        let config = PoolConfig {
            min_workers: 1,
            max_workers: 4,
            min_iocp: 1,
            max_iocp: 4,
            ..PoolConfig::default()
        };
        PoolInner::new(config, Arc::new(SystemPlatform), None)
    }

    #[test]
    fn posted_completion_runs_callback() {
        let inner = test_inner();
        let hits = Arc::new(AtomicUsize::new(0));
        let registration = {
            let hits = hits.clone();
            inner
                .bind_io_completion(Box::new(move |error, bytes| {
                    assert_eq!(error, 0);
                    assert_eq!(bytes, 128);
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap()
        };

        inner.post_completion(&registration, 0, 128).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_binding_is_rejected() {
        let inner = test_inner();
        let bogus = IoRegistration { id: 999 };
        assert!(matches!(
            inner.post_completion(&bogus, 0, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn drain_round_trips_markers() {
        let inner = test_inner();
        let registration = inner.bind_io_completion(Box::new(|_, _| {})).unwrap();
        inner.post_completion(&registration, 0, 0).unwrap();
        assert!(inner.drain_completions(Duration::from_secs(10)));
        assert!(!inner.io.drain_needed.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_callback_keeps_counter_consistent() {
        let inner = test_inner();
        let registration = inner
            .bind_io_completion(Box::new(|_, _| panic!("callback fault")))
            .unwrap();
        inner.post_completion(&registration, 0, 0).unwrap();

        // A follow-up completion must still be dispatched.
        let hits = Arc::new(AtomicUsize::new(0));
        let ok = {
            let hits = hits.clone();
            inner
                .bind_io_completion(Box::new(move |_, _| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap()
        };
        inner.post_completion(&ok, 0, 0).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let counts = inner.io.counter.snapshot();
        assert!(counts.working <= counts.active);
    }
}
