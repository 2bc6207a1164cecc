//! The worker pool: thread lifecycle, activation bookkeeping and the sample
//! window feeding the hill-climbing controller.
//!
//! All thread-count state lives in one packed [`Counter`]. Producers that
//! wake a worker commit the `working` increment *before* releasing the
//! semaphore; a woken worker never increments anything itself, it only
//! completes a promise someone else already made. Workers that want to exit
//! must prove no such promise is in flight, which is what the two
//! re-check-after-timeout loops below are about.

use crate::config::PoolConfig;
use crate::counter::{Counter, Counts};
use crate::error::{Error, Result};
use crate::gate::GateCore;
use crate::hill::{ChangeReason, HillClimbing};
use crate::io::IoCore;
use crate::platform::Platform;
use crate::queue::{Dispatch, DispatchQueue, InjectorQueue, WorkFn};
use crate::sync::semaphore::{Semaphore, UnfairSemaphore};
use crate::sync::spinlock::SpinLock;
use crate::timer::TimerService;
use crate::wait::WaitManager;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Hill-climbing decision state, guarded by the adjustment spinlock. Only
/// the thread that wins the lock reads or writes the sample window.
pub(crate) struct Adjustment {
    pub(crate) hill: HillClimbing,
    prior_completions: u64,
    window_start_ms: u64,
}

pub(crate) struct WorkerCore {
    pub(crate) counter: Counter,
    worker_sem: UnfairSemaphore,
    retired_sem: Semaphore,
    pub(crate) min_limit: AtomicU16,
    pub(crate) max_limit: AtomicU16,
    pub(crate) adjustment: SpinLock<Adjustment>,
    /// Tick deadline after which the next completed work unit closes the
    /// sample window. Read lock-free on every completion.
    next_adjust_at_ms: AtomicU64,
    completions: AtomicU64,
    pub(crate) last_dequeue_ms: AtomicU64,
    working_watermark: AtomicU16,
    next_worker_id: AtomicUsize,
    #[cfg(test)]
    pub(crate) fail_next_spawn: AtomicBool,
}

impl WorkerCore {
    fn new(config: &PoolConfig) -> Self {
        WorkerCore {
            counter: Counter::new(Counts::new(config.min_workers)),
            worker_sem: UnfairSemaphore::new(),
            retired_sem: Semaphore::new(),
            min_limit: AtomicU16::new(config.min_workers),
            max_limit: AtomicU16::new(config.max_workers),
            adjustment: SpinLock::new(Adjustment {
                hill: HillClimbing::new(config.hill_climbing_sample_interval_ms),
                prior_completions: 0,
                window_start_ms: 0,
            }),
            next_adjust_at_ms: AtomicU64::new(config.hill_climbing_sample_interval_ms as u64),
            completions: AtomicU64::new(0),
            last_dequeue_ms: AtomicU64::new(0),
            working_watermark: AtomicU16::new(0),
            next_worker_id: AtomicUsize::new(0),
            #[cfg(test)]
            fail_next_spawn: AtomicBool::new(false),
        }
    }

    fn note_watermark(&self, working: u16) {
        self.working_watermark.fetch_max(working, Ordering::AcqRel);
    }
}

/// The process-wide context every former global folds into. Constructed
/// once per pool and shared by reference between the worker, gate, wait,
/// timer and I/O components.
pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) queue: Arc<dyn DispatchQueue>,
    /// The built-in injector; wait and timer completions are always queued
    /// here, ahead of any user-supplied queue.
    pub(crate) local_queue: Arc<InjectorQueue>,
    pub(crate) workers: WorkerCore,
    pub(crate) io: IoCore,
    pub(crate) gate: GateCore,
    pub(crate) waits: WaitManager,
    pub(crate) timers: TimerService,
    pub(crate) shutdown: AtomicBool,
    start: Instant,
}

impl PoolInner {
    pub(crate) fn new(
        config: PoolConfig,
        platform: Arc<dyn Platform>,
        external: Option<Arc<dyn DispatchQueue>>,
    ) -> Arc<PoolInner> {
        let cpus = platform.cpu_count();
        let local_queue = Arc::new(InjectorQueue::new(cpus));
        let queue: Arc<dyn DispatchQueue> = match external {
            Some(external) => Arc::new(crate::queue::ChainedQueue::new(
                local_queue.clone(),
                external,
            )),
            None => local_queue.clone(),
        };
        Arc::new(PoolInner {
            workers: WorkerCore::new(&config),
            io: IoCore::new(&config),
            gate: GateCore::new(),
            waits: WaitManager::new(),
            timers: TimerService::new(),
            platform,
            queue,
            local_queue,
            config,
            shutdown: AtomicBool::new(false),
            start: Instant::now(),
        })
    }

    /// Milliseconds since the pool was built; the tick base every deadline
    /// in this crate is expressed in.
    pub(crate) fn tick_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Queue an internal work item (wait or timer completion) and make sure
    /// a worker will pick it up.
    pub(crate) fn enqueue_internal(self: &Arc<Self>, work: WorkFn) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.local_queue.push(work);
        self.notify_work_available();
    }

    /// The producer-side signal: work just became available.
    pub(crate) fn notify_work_available(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.maybe_add_working_worker();
        self.ensure_gate_thread_running();
    }

    /// Idempotently make sure at least one worker is looking for work,
    /// subject to `max_working`.
    pub(crate) fn maybe_add_working_worker(self: &Arc<Self>) {
        let w = &self.workers;
        let mut counts = w.counter.snapshot();
        let new = loop {
            let mut new = counts;
            new.working = counts
                .working
                .max((counts.working + 1).min(counts.max_working));
            new.active = counts.active.max(new.working);
            new.retired = counts.retired.saturating_sub(new.active - counts.active);

            if new == counts {
                return;
            }
            match w.counter.compare_exchange(counts, new) {
                Ok(_) => break new,
                Err(observed) => counts = observed,
            }
        };

        w.note_watermark(new.working);

        let to_unretire = counts.retired - new.retired;
        let to_create = (new.active - counts.active) - to_unretire;
        let to_release = (new.working - counts.working) - (to_unretire + to_create);
        debug_assert!(to_unretire + to_create + to_release <= 1);

        if to_unretire > 0 {
            w.retired_sem.release(to_unretire as usize);
        }
        if to_release > 0 {
            w.worker_sem.release(to_release as usize);
        }
        if to_create > 0 {
            if let Err(error) = self.create_worker_thread() {
                // We promised a working thread we cannot deliver; renege so
                // no ghost slot remains. The gate thread will notice the
                // stalled queue and try again next tick.
                warn!(%error, "worker thread creation failed, rolling back");
                w.counter.update(|mut c| {
                    c.working -= to_create;
                    c.active -= to_create;
                    Some(c)
                });
            }
        }
    }

    /// Called by a dispatch loop between work units: `false` means this
    /// thread just retired itself (active −1, working −1, retired +1) and
    /// must stop seeking work.
    pub(crate) fn should_worker_keep_running(&self) -> bool {
        let w = &self.workers;
        let mut counts = w.counter.snapshot();
        loop {
            if counts.active <= counts.max_working {
                return true;
            }
            let mut new = counts;
            new.working -= 1;
            new.active -= 1;
            new.retired += 1;
            match w.counter.compare_exchange(counts, new) {
                Ok(_) => return false,
                Err(observed) => counts = observed,
            }
        }
    }

    fn create_worker_thread(self: &Arc<Self>) -> Result<()> {
        #[cfg(test)]
        if self.workers.fail_next_spawn.swap(false, Ordering::AcqRel) {
            return Err(Error::ThreadCreationFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected failure",
            )));
        }

        let id = self.workers.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        thread::Builder::new()
            .name(format!("workpool worker {}", id))
            .spawn(move || worker_main(inner))
            .map(drop)
            .map_err(Error::ThreadCreationFailed)
    }

    /// Stamp the shared last-dequeue tick; the gate compares against it to
    /// detect a starving queue.
    fn note_dequeue(&self) {
        self.workers
            .last_dequeue_ms
            .store(self.tick_ms(), Ordering::Release);
    }

    /// A work unit finished on this thread. Closes the sample window when
    /// its deadline has passed.
    fn note_work_completed(self: &Arc<Self>) {
        let w = &self.workers;
        w.completions.fetch_add(1, Ordering::Relaxed);
        let now = self.tick_ms();
        if now >= w.next_adjust_at_ms.load(Ordering::Acquire)
            && !self.shutdown.load(Ordering::Acquire)
        {
            self.adjust_max_working(now);
        }
    }

    fn adjust_max_working(self: &Arc<Self>, now_ms: u64) {
        let w = &self.workers;
        let mut adj = match w.adjustment.try_lock() {
            Some(adj) => adj,
            // Somebody else is already adjusting.
            None => return,
        };
        if now_ms < w.next_adjust_at_ms.load(Ordering::Acquire) {
            return;
        }

        // The sample can come out very short if the window was reset while
        // we raced for the lock; skip it and let the next completion retry.
        let elapsed_ms = now_ms.saturating_sub(adj.window_start_ms);
        if elapsed_ms * 2 < adj.hill.interval_ms() as u64 {
            return;
        }

        let total = w.completions.load(Ordering::Relaxed);
        let completions = total - adj.prior_completions;
        let min_limit = w.min_limit.load(Ordering::Relaxed);
        let max_limit = w.max_limit.load(Ordering::Relaxed);

        let mut counts = w.counter.snapshot();
        let new_max = adj
            .hill
            .update(counts.max_working, elapsed_ms, completions, min_limit, max_limit);

        let mut inject = false;
        while new_max != counts.max_working {
            let mut new = counts;
            new.max_working = new_max;
            match w.counter.compare_exchange(counts, new) {
                Ok(_) => {
                    // Raising the ceiling? Inject one thread; if it finds
                    // work it will inject the next, up to the new maximum.
                    // Lowering it? Workers notice on their own and retire.
                    inject = new_max > counts.max_working;
                    break;
                }
                Err(observed) => {
                    if observed.max_working > counts.max_working && observed.max_working >= new_max
                    {
                        // Probably the gate thread raised the ceiling past
                        // our proposal; don't interfere.
                        break;
                    }
                    counts = observed;
                }
            }
        }

        adj.prior_completions = total;
        adj.window_start_ms = now_ms;
        w.next_adjust_at_ms
            .store(now_ms + adj.hill.interval_ms() as u64, Ordering::Release);
        drop(adj);

        if inject {
            self.maybe_add_working_worker();
        }
    }

    /// High watermark of `working` since the previous call, reset to the
    /// current value (gate telemetry).
    pub(crate) fn take_max_working_watermark(&self) -> u16 {
        let current = self.workers.counter.snapshot().working;
        self.workers
            .working_watermark
            .swap(current, Ordering::AcqRel)
    }

    /// Raise or lower the worker floor at runtime.
    pub(crate) fn set_min_workers(self: &Arc<Self>, min: u16) -> Result<()> {
        let w = &self.workers;
        if min == 0 {
            return Err(Error::InvalidArgument("min_workers must be at least 1"));
        }
        if min > w.max_limit.load(Ordering::Relaxed) {
            return Err(Error::InvalidArgument("min_workers above max_workers"));
        }
        w.min_limit.store(min, Ordering::Relaxed);

        let mut guard = w.adjustment.lock();
        let (_, committed) = w.counter.update(|mut c| {
            if c.max_working >= min {
                None
            } else {
                c.max_working = min;
                Some(c)
            }
        });
        if let Some(new) = committed {
            guard.hill.force_change(new.max_working, ChangeReason::Limit);
        }
        drop(guard);

        if self.queue.requests_pending() {
            self.maybe_add_working_worker();
        }
        Ok(())
    }

    /// Lower or raise the worker ceiling at runtime.
    pub(crate) fn set_max_workers(self: &Arc<Self>, max: u16) -> Result<()> {
        let w = &self.workers;
        if max < w.min_limit.load(Ordering::Relaxed) {
            return Err(Error::InvalidArgument("max_workers below min_workers"));
        }
        if max > crate::counter::MAX_POSSIBLE_THREADS {
            return Err(Error::InvalidArgument("thread limit above supported maximum"));
        }
        w.max_limit.store(max, Ordering::Relaxed);

        let mut guard = w.adjustment.lock();
        let (_, committed) = w.counter.update(|mut c| {
            if c.max_working <= max {
                None
            } else {
                c.max_working = max;
                Some(c)
            }
        });
        if let Some(new) = committed {
            guard.hill.force_change(new.max_working, ChangeReason::Limit);
        }
        Ok(())
    }
}

/// Body of every worker thread.
fn worker_main(inner: Arc<PoolInner>) {
    trace!("worker started");
    let w = &inner.workers;
    let idle_timeout = Duration::from_millis(inner.config.worker_idle_timeout_ms as u64);
    let mut found_work = true;

    enum Step {
        Dispatch,
        Retire,
        Wait,
    }

    'work: loop {
        // Decide whether to keep dispatching, retire, or wind down. All
        // three commit in a single exchange so a concurrent observer never
        // sees a half-applied transition.
        let mut counts = w.counter.snapshot();
        let step = loop {
            debug_assert!(counts.active > 0);
            debug_assert!(counts.working > 0);

            let mut new = counts;
            let retiring = if counts.active > counts.max_working {
                new.active -= 1;
                new.retired += 1;
                true
            } else {
                if found_work {
                    break Step::Dispatch;
                }
                false
            };
            new.working -= 1;

            match w.counter.compare_exchange(counts, new) {
                Ok(_) => break if retiring { Step::Retire } else { Step::Wait },
                Err(observed) => counts = observed,
            }
        };

        match step {
            Step::Dispatch => {
                inner.note_dequeue();
                match inner.queue.dispatch_one() {
                    Dispatch::Worked => {
                        found_work = true;
                        inner.note_work_completed();
                    }
                    Dispatch::NoWork => found_work = false,
                    Dispatch::Recalled => {
                        // The producer wants the thread back; release our
                        // working slot without treating this as work found.
                        trace!("worker recalled");
                        found_work = false;
                    }
                }
            }

            Step::Retire => {
                // Work may have arrived just before we shed the active
                // slot, in which case the producer believes it is already
                // being picked up. Re-signal before parking.
                if inner.queue.requests_pending() {
                    inner.maybe_add_working_worker();
                }
                trace!("worker retired");

                loop {
                    if w.retired_sem.wait(idle_timeout) {
                        // The releaser already re-promoted us in the
                        // counter; just go back to work.
                        found_work = true;
                        continue 'work;
                    }
                    if inner.platform.io_pending() {
                        continue;
                    }

                    // Timed out. A wake signal may still be in flight: if
                    // the retired count already hit zero, someone consumed
                    // our slot and the semaphore permit is addressed to us.
                    // Swallow it and wait again instead of exiting.
                    let mut counts = w.counter.snapshot();
                    let exit = loop {
                        if counts.retired == 0 {
                            break false;
                        }
                        let mut new = counts;
                        new.retired -= 1;
                        match w.counter.compare_exchange(counts, new) {
                            Ok(_) => break true,
                            Err(observed) => counts = observed,
                        }
                    };
                    if exit {
                        break 'work;
                    }
                }
            }

            Step::Wait => {
                // Same pre-park sweep as above: we may have reduced the
                // working count just after work arrived.
                if inner.queue.requests_pending() {
                    found_work = true;
                    inner.maybe_add_working_worker();
                }
                trace!("worker awaiting work");

                loop {
                    if w.worker_sem.wait(idle_timeout) {
                        // Releaser pre-committed our working increment.
                        found_work = true;
                        continue 'work;
                    }
                    if inner.platform.io_pending() {
                        continue;
                    }

                    // Timed out while nominally inactive. If active equals
                    // working, a release raced in and a permit is on its
                    // way; block again rather than stranding it.
                    let mut guard = w.adjustment.lock();
                    let mut counts = w.counter.snapshot();
                    let exit = loop {
                        if counts.active == counts.working {
                            break false;
                        }
                        let mut new = counts;
                        new.active -= 1;
                        let min_limit = w.min_limit.load(Ordering::Relaxed);
                        let max_limit = w.max_limit.load(Ordering::Relaxed);
                        new.max_working = new
                            .active
                            .min(new.max_working)
                            .max(min_limit)
                            .min(max_limit);
                        match w.counter.compare_exchange(counts, new) {
                            Ok(_) => {
                                guard
                                    .hill
                                    .force_change(new.max_working, ChangeReason::ThreadTimedOut);
                                break true;
                            }
                            Err(observed) => counts = observed,
                        }
                    };
                    drop(guard);
                    if exit {
                        break 'work;
                    }
                }
            }
        }
    }

    debug!("worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SystemPlatform;

    fn test_inner(min: u16, max: u16) -> Arc<PoolInner> {
        let config = PoolConfig {
            min_workers: min,
            max_workers: max,
            worker_idle_timeout_ms: 200,
            ..PoolConfig::default()
        };
        PoolInner::new(config, Arc::new(SystemPlatform), None)
    }

    #[test]
    fn rollback_restores_counter_after_failed_spawn() {
        let inner = test_inner(2, 8);
        let before = inner.workers.counter.snapshot();

        inner.workers.fail_next_spawn.store(true, Ordering::SeqCst);
        inner.maybe_add_working_worker();

        let after = inner.workers.counter.snapshot();
        assert_eq!(before, after);
    }

    #[test]
    fn maybe_add_is_idempotent_at_ceiling() {
        let inner = test_inner(1, 8);
        // Seed the counter as if one worker were already working at a
        // ceiling of one; a second add must be a no-op.
        inner.workers.counter.update(|mut c| {
            c.active = 1;
            c.working = 1;
            c.max_working = 1;
            Some(c)
        });
        let before = inner.workers.counter.snapshot();
        inner.maybe_add_working_worker();
        assert_eq!(inner.workers.counter.snapshot(), before);
    }

    #[test]
    fn should_worker_keep_running_retires_above_ceiling() {
        let inner = test_inner(1, 8);
        inner.workers.counter.update(|mut c| {
            c.active = 3;
            c.working = 3;
            c.max_working = 2;
            Some(c)
        });
        assert!(!inner.should_worker_keep_running());
        let counts = inner.workers.counter.snapshot();
        assert_eq!(counts.active, 2);
        assert_eq!(counts.working, 2);
        assert_eq!(counts.retired, 1);

        // Back at the ceiling: stay.
        assert!(inner.should_worker_keep_running());
    }

    #[test]
    fn set_limits_validation() {
        let inner = test_inner(2, 8);
        assert!(inner.set_min_workers(0).is_err());
        assert!(inner.set_max_workers(1).is_err());
        assert!(inner.set_min_workers(4).is_ok());
        // Raising the floor lifts the ceiling with it.
        assert!(inner.workers.counter.snapshot().max_working >= 4);
        assert!(inner.set_max_workers(4).is_ok());
    }

    #[test]
    fn watermark_resets_on_take() {
        let inner = test_inner(2, 8);
        inner.workers.note_watermark(5);
        assert_eq!(inner.take_max_working_watermark(), 5);
        assert_eq!(inner.take_max_working_watermark(), 0);
    }
}
