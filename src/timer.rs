//! The timer queue: one timer thread sweeping an arena of timer records,
//! firing due timers as pool work items and re-arming periodic ones. All
//! mutation (create, change, delete) arrives through the thread's mailbox;
//! the thread itself never performs teardown that could block — that is
//! pushed onto the worker pool.

use crate::error::{Error, Result};
use crate::pool::PoolInner;
use crate::sync::apc::{Mailbox, Remote};
use crate::wait::CompletionNotice;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::trace;

bitflags::bitflags! {
    struct TimerFlags: u32 {
        const REGISTERED          = 1 << 0;
        const ACTIVE              = 1 << 1;
        const DELETE_PENDING      = 1 << 2;
        const INTERNAL_COMPLETION = 1 << 3;
    }
}

/// Callback run every time the timer fires.
pub type TimerCallback = Box<dyn Fn() + Send + Sync>;

struct TimerSched {
    /// Absolute tick (pool time base) of the next firing.
    firing_at_ms: u64,
    /// 0 = one-shot.
    period_ms: u64,
}

pub(crate) struct TimerInner {
    callback: TimerCallback,
    /// Relative due time at creation; `None` creates the timer disarmed.
    initial_due_ms: Option<u64>,
    state: AtomicU32,
    refcount: AtomicUsize,
    /// Mutated only on the timer thread.
    sched: Mutex<TimerSched>,
    internal_done: crate::sync::Event,
    external_done: Mutex<Option<Arc<crate::sync::Event>>>,
}

impl TimerInner {
    fn state(&self) -> TimerFlags {
        TimerFlags::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, flags: TimerFlags) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear_state(&self, flags: TimerFlags) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn release_ref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// Handle returned by [`ThreadPool::create_timer`](crate::ThreadPool::create_timer).
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Debug for Timer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("state", &self.inner.state())
            .finish()
    }
}

enum TimerMsg {
    Insert(Arc<TimerInner>),
    Change {
        timer: Arc<TimerInner>,
        due_ms: Option<u64>,
        period_ms: u64,
    },
    Delete(Arc<TimerInner>),
    Shutdown,
}

/// Lazily started singleton timer thread.
pub(crate) struct TimerService {
    remote: Mutex<Option<Remote<TimerMsg>>>,
}

impl TimerService {
    pub(crate) fn new() -> Self {
        TimerService {
            remote: Mutex::new(None),
        }
    }

    pub(crate) fn shutdown(&self) {
        if let Some(remote) = self.remote.lock().as_ref() {
            let _ = remote.send(TimerMsg::Shutdown);
        }
    }
}

impl PoolInner {
    fn ensure_timer_thread(self: &Arc<Self>) -> Result<Remote<TimerMsg>> {
        let mut guard = self.timers.remote.lock();
        if let Some(remote) = guard.as_ref() {
            return Ok(remote.clone());
        }
        let mailbox = Mailbox::new();
        let remote = mailbox.remote();
        let inner = self.clone();
        thread::Builder::new()
            .name("workpool timer".to_string())
            .spawn(move || timer_thread_main(inner, mailbox))
            .map_err(Error::ThreadCreationFailed)?;
        *guard = Some(remote.clone());
        Ok(remote)
    }

    /// Create a timer firing `due` from now (or disarmed when `None`) and
    /// then every `period` (one-shot when `None` or zero).
    pub(crate) fn create_timer(
        self: &Arc<Self>,
        callback: TimerCallback,
        due: Option<Duration>,
        period: Option<Duration>,
    ) -> Result<Timer> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let remote = self.ensure_timer_thread()?;
        let timer = Arc::new(TimerInner {
            callback,
            initial_due_ms: due.map(|d| d.as_millis() as u64),
            state: AtomicU32::new(TimerFlags::empty().bits()),
            refcount: AtomicUsize::new(1),
            sched: Mutex::new(TimerSched {
                firing_at_ms: u64::MAX,
                period_ms: period.map_or(0, |p| p.as_millis() as u64),
            }),
            internal_done: crate::sync::Event::auto_reset(),
            external_done: Mutex::new(None),
        });
        remote.send(TimerMsg::Insert(timer.clone()))?;
        Ok(Timer { inner: timer })
    }

    /// Re-arm (or disarm, with `due == None`) an existing timer.
    pub(crate) fn change_timer(
        self: &Arc<Self>,
        timer: &Timer,
        due: Option<Duration>,
        period: Option<Duration>,
    ) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let remote = self.ensure_timer_thread()?;
        remote.send(TimerMsg::Change {
            timer: timer.inner.clone(),
            due_ms: due.map(|d| d.as_millis() as u64),
            period_ms: period.map_or(0, |p| p.as_millis() as u64),
        })
    }

    /// Destroy a timer. No callback will be queued after this resolves; see
    /// [`CompletionNotice`] for how "resolves" is reported.
    pub(crate) fn delete_timer(
        self: &Arc<Self>,
        timer: Timer,
        notice: CompletionNotice,
    ) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let remote = self.ensure_timer_thread()?;
        let inner = timer.inner;
        match notice {
            CompletionNotice::Blocking => {
                inner.set_state(TimerFlags::INTERNAL_COMPLETION);
                remote.send(TimerMsg::Delete(inner.clone()))?;
                inner.internal_done.wait(None);
            }
            notice => {
                if let CompletionNotice::Event(event) = notice {
                    *inner.external_done.lock() = Some(event);
                }
                remote.send(TimerMsg::Delete(inner))?;
            }
        }
        Ok(())
    }
}

fn timer_thread_main(inner: Arc<PoolInner>, mailbox: Mailbox<TimerMsg>) {
    trace!("timer thread started");
    let mut queue: Vec<Arc<TimerInner>> = Vec::new();

    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            abandon_drain(&mailbox);
            trace!("timer thread exiting on shutdown");
            return;
        }

        let mut messages = Vec::new();
        mailbox.drain(|msg| messages.push(msg));
        for msg in messages {
            apply(&inner, &mut queue, msg);
        }

        let next = fire_timers(&inner, &mut queue);
        mailbox.alertable_sleep(next.map(Duration::from_millis));
    }
}

fn abandon_drain(mailbox: &Mailbox<TimerMsg>) {
    mailbox.drain(|msg| {
        if let TimerMsg::Delete(timer) = msg {
            timer.internal_done.signal();
            if let Some(event) = timer.external_done.lock().take() {
                event.signal();
            }
        }
    });
}

/// Runs on the timer thread.
fn apply(inner: &Arc<PoolInner>, queue: &mut Vec<Arc<TimerInner>>, msg: TimerMsg) {
    let now = inner.tick_ms();
    match msg {
        TimerMsg::Insert(timer) => {
            if timer.state().contains(TimerFlags::DELETE_PENDING) {
                // Deleted before it was ever registered.
                finish_delete(inner, timer);
                return;
            }
            match timer.initial_due_ms {
                None => timer.set_state(TimerFlags::REGISTERED),
                Some(due) => {
                    timer.sched.lock().firing_at_ms = now + due;
                    timer.set_state(TimerFlags::REGISTERED | TimerFlags::ACTIVE);
                    queue.push(timer);
                }
            }
        }
        TimerMsg::Change {
            timer,
            due_ms,
            period_ms,
        } => {
            timer.sched.lock().period_ms = period_ms;
            match due_ms {
                None => deactivate_timer(queue, &timer),
                Some(due) => {
                    timer.sched.lock().firing_at_ms = now + due;
                    if !timer.state().contains(TimerFlags::ACTIVE) {
                        timer.set_state(TimerFlags::ACTIVE);
                        queue.push(timer);
                    }
                }
            }
        }
        TimerMsg::Delete(timer) => {
            let state = timer.state();
            if !state.contains(TimerFlags::REGISTERED) {
                timer.set_state(TimerFlags::DELETE_PENDING);
                timer.release_ref();
                return;
            }
            if state.contains(TimerFlags::ACTIVE) {
                deactivate_timer(queue, &timer);
            }
            if timer.release_ref() == 0 {
                finish_delete(inner, timer);
            }
        }
        TimerMsg::Shutdown => {}
    }
}

fn deactivate_timer(queue: &mut Vec<Arc<TimerInner>>, timer: &Arc<TimerInner>) {
    if let Some(position) = queue.iter().position(|t| Arc::ptr_eq(t, timer)) {
        queue.swap_remove(position);
    }
    timer.clear_state(TimerFlags::ACTIVE);
}

/// Sweep the queue, firing due timers and re-arming periodic ones. Returns
/// the interval until the next firing, `None` when nothing is scheduled.
fn fire_timers(inner: &Arc<PoolInner>, queue: &mut Vec<Arc<TimerInner>>) -> Option<u64> {
    let now = inner.tick_ms();
    let mut next: Option<u64> = None;
    let mut index = 0;

    while index < queue.len() {
        let timer = queue[index].clone();
        let (firing_at, period) = {
            let sched = timer.sched.lock();
            (sched.firing_at_ms, sched.period_ms)
        };

        if now >= firing_at {
            let one_shot = period == 0;
            if one_shot {
                deactivate_timer(queue, &timer);
                // deactivation swapped another entry into `index`
            } else {
                timer.sched.lock().firing_at_ms = now + period;
                index += 1;
            }

            timer.refcount.fetch_add(1, Ordering::AcqRel);
            let fired = TimerRef(timer);
            inner.enqueue_internal(Box::new(move || {
                (fired.0.callback)();
                drop(fired);
            }));

            if !one_shot {
                next = Some(next.map_or(period, |n| n.min(period)));
            }
        } else {
            let until = firing_at - now;
            next = Some(next.map_or(until, |n| n.min(until)));
            index += 1;
        }
    }
    next
}

/// Holds the callback's reference; the last reference out resolves the
/// completion events (on a worker thread, never the timer thread).
struct TimerRef(Arc<TimerInner>);

impl Drop for TimerRef {
    fn drop(&mut self) {
        if self.0.release_ref() == 0 {
            finish_delete_local(&self.0);
        }
    }
}

/// The timer thread must not run teardown that can block (a user callback
/// drop may do anything); hand the final destruction to the worker pool.
fn finish_delete(inner: &Arc<PoolInner>, timer: Arc<TimerInner>) {
    if inner.shutdown.load(Ordering::Acquire) {
        finish_delete_local(&timer);
        return;
    }
    inner.enqueue_internal(Box::new(move || finish_delete_local(&timer)));
}

fn finish_delete_local(timer: &Arc<TimerInner>) {
    if timer.state().contains(TimerFlags::INTERNAL_COMPLETION) {
        timer.internal_done.signal();
        return;
    }
    if let Some(event) = timer.external_done.lock().take() {
        event.signal();
    }
}
