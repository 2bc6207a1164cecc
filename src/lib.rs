//!
//! Workpool is an adaptive pool of OS worker threads for short-lived
//! synchronous work items and wait/timer registrations.
//!
//! The pool multiplexes a large number of queued callbacks onto a small,
//! dynamically sized set of threads. The thread count is not configured, it
//! is *measured*: a hill-climbing controller correlates thread-count changes
//! with completed-work throughput and walks the ceiling toward the local
//! optimum, while a supervisor thread watches CPU utilization and injects
//! threads when the queue starves.
//!
//! Main pieces:
//! * A packed atomic counter carrying the whole `{active, working, retired,
//!   max-working}` quadruple, updated only by whole-word compare-exchange.
//! * Worker threads with an activation semaphore, an idle-timeout exit path
//!   and a retirement state that parks surplus threads for cheap revival.
//! * Dedicated wait threads multiplexing up to [`MAX_WAITHANDLES`] waitable
//!   handles each, plus a single timer thread, both mutated exclusively
//!   through per-thread mailboxes.
//! * An I/O completion dispatcher pool with its own counter and
//!   retire-with-pending-I/O semantics.
//!
//! ```
//! use workpool::{PoolConfig, ThreadPool};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = ThreadPool::new(PoolConfig::default()).unwrap();
//! let done = Arc::new(AtomicUsize::new(0));
//! for _ in 0..16 {
//!     let done = done.clone();
//!     pool.enqueue_work(move || {
//!         done.fetch_add(1, Ordering::SeqCst);
//!     })
//!     .unwrap();
//! }
//! # while done.load(Ordering::SeqCst) < 16 {
//! #     std::thread::sleep(std::time::Duration::from_millis(5));
//! # }
//! ```

// Force missing implementations
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(unused_imports)]
#![forbid(unused_must_use)]
#![forbid(unused_import_braces)]

mod config;
mod counter;
mod error;
mod gate;
mod hill;
mod io;
mod platform;
mod pool;
mod queue;
mod recycle;
mod sync;
mod timer;
mod wait;

pub use config::PoolConfig;
pub use counter::{Counts, MAX_POSSIBLE_THREADS};
pub use error::{Error, Result};
pub use io::IoRegistration;
pub use platform::{CpuTimes, PendingIo, Platform, SystemPlatform};
pub use queue::{Dispatch, DispatchQueue, WorkFn};
pub use sync::{Event, MAX_WAITHANDLES};
pub use timer::{Timer, TimerCallback};
pub use wait::{CompletionNotice, RegisteredWait, WaitCallback};

use pool::PoolInner;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

///
/// Prelude of the workpool crate
pub mod prelude {
    pub use crate::{
        CompletionNotice, Dispatch, DispatchQueue, Event, PoolConfig, ThreadPool,
    };
}

/// The pool itself: one instance owns a worker pool, an I/O dispatcher
/// pool, the wait threads, the timer thread and their supervisor.
///
/// Dropping the handle initiates shutdown; threads wind down on their idle
/// timeouts and registrations still in flight are deliberately leaked
/// rather than risking teardown races.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.worker_counts())
            .field("io", &self.io_counts())
            .finish()
    }
}

impl ThreadPool {
    /// Build a pool with the built-in work queue and platform defaults.
    pub fn new(config: PoolConfig) -> Result<ThreadPool> {
        Self::build(config, None, Arc::new(SystemPlatform))
    }

    /// Build a pool that dispatches from `queue` in addition to the
    /// built-in one (which keeps carrying wait and timer completions).
    pub fn with_queue(config: PoolConfig, queue: Arc<dyn DispatchQueue>) -> Result<ThreadPool> {
        Self::build(config, Some(queue), Arc::new(SystemPlatform))
    }

    /// Build a pool against a custom [`Platform`] capability set.
    pub fn with_platform(config: PoolConfig, platform: Arc<dyn Platform>) -> Result<ThreadPool> {
        Self::build(config, None, platform)
    }

    fn build(
        config: PoolConfig,
        queue: Option<Arc<dyn DispatchQueue>>,
        platform: Arc<dyn Platform>,
    ) -> Result<ThreadPool> {
        config.validate()?;
        Ok(ThreadPool {
            inner: PoolInner::new(config, platform, queue),
        })
    }

    /// Queue `work` for execution on some worker thread, creating or waking
    /// one if necessary.
    pub fn enqueue_work<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        self.inner.local_queue.push(Box::new(work));
        self.inner.notify_work_available();
        Ok(())
    }

    /// Tell the scheduler the external queue went from empty to non-empty.
    /// Producers feeding a [`ThreadPool::with_queue`] pool must call this.
    pub fn notify_work_available(&self) {
        self.inner.notify_work_available();
    }

    /// For dispatch loops that run more than one unit per
    /// [`DispatchQueue::dispatch_one`] call: between units, ask whether this
    /// thread should go on. `false` means the thread just retired itself
    /// and must return from `dispatch_one` promptly.
    pub fn should_worker_keep_running(&self) -> bool {
        self.inner.should_worker_keep_running()
    }

    /// Register `callback` to run whenever `handle` is signaled, or when
    /// `timeout` elapses first (the callback's argument tells which). With
    /// `single`, the registration fires at most once.
    pub fn register_wait<F>(
        &self,
        handle: Arc<Event>,
        callback: F,
        timeout: Option<Duration>,
        single: bool,
    ) -> Result<RegisteredWait>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner
            .register_wait(handle, Box::new(callback), timeout, single)
    }

    /// Remove a wait registration. `CompletionNotice::Blocking` waits until
    /// any in-flight callback has finished; the other modes return at once.
    pub fn unregister_wait(&self, wait: RegisteredWait, notice: CompletionNotice) -> Result<()> {
        self.inner.unregister_wait(wait, notice)
    }

    /// Create a timer that first fires `due` from now (disarmed when
    /// `None`) and then every `period` (one-shot when `None`).
    pub fn create_timer<F>(
        &self,
        callback: F,
        due: Option<Duration>,
        period: Option<Duration>,
    ) -> Result<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.create_timer(Box::new(callback), due, period)
    }

    /// Re-arm or disarm an existing timer.
    pub fn change_timer(
        &self,
        timer: &Timer,
        due: Option<Duration>,
        period: Option<Duration>,
    ) -> Result<()> {
        self.inner.change_timer(timer, due, period)
    }

    /// Destroy a timer; no callback is queued afterwards.
    pub fn delete_timer(&self, timer: Timer, notice: CompletionNotice) -> Result<()> {
        self.inner.delete_timer(timer, notice)
    }

    /// Bind `callback` to the pool's completion port.
    pub fn bind_io_completion<F>(&self, callback: F) -> Result<IoRegistration>
    where
        F: Fn(u32, u32) + Send + Sync + 'static,
    {
        self.inner.bind_io_completion(Box::new(callback))
    }

    /// Post a completion packet `(error, bytes)` for a bound callback; it
    /// runs on an I/O dispatcher thread.
    pub fn post_completion(
        &self,
        registration: &IoRegistration,
        error: u32,
        bytes: u32,
    ) -> Result<()> {
        self.inner.post_completion(registration, error, bytes)
    }

    /// Post a drainage marker to the completion port and wait until a
    /// dispatcher observes it, bounding "work posted before this point".
    pub fn drain_completions(&self, timeout: Duration) -> bool {
        self.inner.drain_completions(timeout)
    }

    /// Raise or lower the worker floor.
    pub fn set_min_workers(&self, min: u16) -> Result<()> {
        self.inner.set_min_workers(min)
    }

    /// Raise or lower the worker ceiling.
    pub fn set_max_workers(&self, max: u16) -> Result<()> {
        self.inner.set_max_workers(max)
    }

    /// A coherent snapshot of the worker-pool thread bookkeeping.
    pub fn worker_counts(&self) -> Counts {
        self.inner.workers.counter.snapshot()
    }

    /// A coherent snapshot of the I/O dispatcher pool bookkeeping.
    pub fn io_counts(&self) -> Counts {
        self.inner.io.counter.snapshot()
    }

    /// Number of wait threads currently alive.
    pub fn wait_thread_count(&self) -> usize {
        self.inner.waits.thread_count()
    }

    /// Last CPU utilization sample taken by the supervisor (0–100), if any.
    pub fn cpu_utilization(&self) -> Option<u8> {
        let cpu = self
            .inner
            .gate
            .cpu_utilization
            .load(Ordering::Acquire);
        (cpu <= 100).then(|| cpu)
    }

    /// Begin an orderly shutdown: no new work is accepted, dispatchers are
    /// recalled and the long-lived service threads unwind at their next
    /// safe point. Worker threads drain away on their idle timeouts.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.local_queue.recall();
        self.inner.waits.shutdown_all();
        self.inner.timers.shutdown();
        self.inner.gate.interrupt();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
