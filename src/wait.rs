//! Dedicated wait threads multiplexing many registered waits onto the
//! bounded multi-object wait primitive.
//!
//! Every registration is owned by exactly one wait thread; all mutation of
//! registration and slot state happens on that thread, delivered through its
//! mailbox. The spine (the list of wait threads) is the only thing guarded
//! by a lock, and only for the brief find-or-create on registration.

use crate::counter::MAX_POSSIBLE_THREADS;
use crate::error::{Error, Result};
use crate::pool::PoolInner;
use crate::sync::apc::{Mailbox, Remote};
use crate::sync::event::MAX_WAITHANDLES;
use crate::sync::{Event, WaitOutcome};
use arrayvec::ArrayVec;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{trace, warn};

bitflags::bitflags! {
    struct WaitFlags: u32 {
        /// The owning wait thread has seen the registration.
        const REGISTERED          = 1 << 0;
        /// Present in a slot and part of the multi-wait.
        const ACTIVE              = 1 << 1;
        /// Fire once, then deactivate.
        const SINGLE_EXECUTION    = 1 << 2;
        /// Deregistered before it was ever registered.
        const DELETE_PENDING      = 1 << 3;
        /// A blocking deregistration is waiting on the internal event.
        const INTERNAL_COMPLETION = 1 << 4;
    }
}

/// How callers want to learn that a wait or timer teardown finished.
#[derive(Debug)]
pub enum CompletionNotice {
    /// Fire and forget.
    None,
    /// Signal this event once the record is destroyed.
    Event(Arc<Event>),
    /// Block the calling thread until any in-flight callback has returned
    /// and the record is destroyed. Must not be used from inside the
    /// callback itself.
    Blocking,
}

/// Callback invoked with `timed_out`.
pub type WaitCallback = Box<dyn Fn(bool) + Send + Sync>;

struct WaitTiming {
    start_ms: u64,
    remaining_ms: u64,
}

pub(crate) struct WaitInner {
    handle: Arc<Event>,
    callback: WaitCallback,
    timeout_ms: Option<u32>,
    state: AtomicU32,
    refcount: AtomicUsize,
    /// Mutated only on the owning wait thread.
    timing: Mutex<WaitTiming>,
    partial_done: Event,
    internal_done: Event,
    external_done: Mutex<Option<Arc<Event>>>,
    owner: Remote<WaitMsg>,
}

impl WaitInner {
    fn state(&self) -> WaitFlags {
        WaitFlags::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, flags: WaitFlags) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear_state(&self, flags: WaitFlags) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Drop one reference, returning how many remain.
    fn release_ref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// Handle returned by [`ThreadPool::register_wait`](crate::ThreadPool::register_wait).
pub struct RegisteredWait {
    pub(crate) inner: Arc<WaitInner>,
}

impl Debug for RegisteredWait {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredWait")
            .field("state", &self.inner.state())
            .finish()
    }
}

pub(crate) enum WaitMsg {
    Insert(Arc<WaitInner>),
    Deregister(Arc<WaitInner>),
    Shutdown,
}

/// Shared view of one wait thread: its mailbox plus the handle-slot
/// reservation counter checked during placement.
pub(crate) struct WaitThreadShared {
    remote: Remote<WaitMsg>,
    num_wait_handles: AtomicUsize,
}

pub(crate) struct WaitManager {
    spine: Mutex<Vec<Arc<WaitThreadShared>>>,
    next_thread_id: AtomicUsize,
}

impl WaitManager {
    pub(crate) fn new() -> Self {
        WaitManager {
            spine: Mutex::new(Vec::new()),
            next_thread_id: AtomicUsize::new(0),
        }
    }

    /// Number of wait threads alive (diagnostics).
    pub(crate) fn thread_count(&self) -> usize {
        self.spine.lock().len()
    }

    pub(crate) fn shutdown_all(&self) {
        for shared in self.spine.lock().iter() {
            let _ = shared.remote.send(WaitMsg::Shutdown);
        }
    }
}

/// Parallel slot arrays owned by one wait thread: `handles[i]` is waited on,
/// `lists[i]` holds every registration attached to that handle.
struct Slots {
    handles: ArrayVec<Arc<Event>, MAX_WAITHANDLES>,
    lists: ArrayVec<VecDeque<Arc<WaitInner>>, MAX_WAITHANDLES>,
}

impl Slots {
    fn new() -> Self {
        Slots {
            handles: ArrayVec::new(),
            lists: ArrayVec::new(),
        }
    }
}

impl PoolInner {
    /// Register `callback` to run when `handle` is signaled or `timeout`
    /// elapses. `single` registrations fire once; recurring ones re-arm
    /// after every firing.
    pub(crate) fn register_wait(
        self: &Arc<Self>,
        handle: Arc<Event>,
        callback: WaitCallback,
        timeout: Option<Duration>,
        single: bool,
    ) -> Result<RegisteredWait> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let timeout_ms = match timeout {
            None => None,
            Some(t) => {
                let ms = t.as_millis();
                if ms > u32::MAX as u128 {
                    return Err(Error::InvalidArgument("wait timeout too large"));
                }
                Some(ms as u32)
            }
        };

        let shared = self.find_wait_thread()?;
        let mut flags = WaitFlags::empty();
        if single {
            flags |= WaitFlags::SINGLE_EXECUTION;
        }
        let reg = Arc::new(WaitInner {
            handle,
            callback,
            timeout_ms,
            state: AtomicU32::new(flags.bits()),
            refcount: AtomicUsize::new(1),
            timing: Mutex::new(WaitTiming {
                start_ms: self.tick_ms(),
                remaining_ms: timeout_ms.map_or(u64::MAX, u64::from),
            }),
            partial_done: Event::auto_reset(),
            internal_done: Event::auto_reset(),
            external_done: Mutex::new(None),
            owner: shared.remote.clone(),
        });

        if let Err(error) = shared.remote.send(WaitMsg::Insert(reg.clone())) {
            shared.num_wait_handles.fetch_sub(1, Ordering::AcqRel);
            return Err(error);
        }
        Ok(RegisteredWait { inner: reg })
    }

    /// Tear a registration down. See [`CompletionNotice`] for the options.
    pub(crate) fn unregister_wait(
        self: &Arc<Self>,
        wait: RegisteredWait,
        notice: CompletionNotice,
    ) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let reg = wait.inner;
        match notice {
            CompletionNotice::Blocking => {
                reg.set_state(WaitFlags::INTERNAL_COMPLETION);
                reg.owner.send(WaitMsg::Deregister(reg.clone()))?;
                reg.internal_done.wait(None);
            }
            notice => {
                if let CompletionNotice::Event(event) = notice {
                    *reg.external_done.lock() = Some(event);
                }
                reg.owner.send(WaitMsg::Deregister(reg.clone()))?;
                // Wait for removal to become visible, then drop our
                // reference; the last one out signals the external event.
                reg.partial_done.wait(None);
                if reg.release_ref() == 0 {
                    delete_wait(&reg);
                }
            }
        }
        Ok(())
    }

    /// Pick a wait thread with a free handle slot, creating one when every
    /// existing thread is at capacity. Reserves the slot before returning.
    fn find_wait_thread(self: &Arc<Self>) -> Result<Arc<WaitThreadShared>> {
        let mut spine = self.waits.spine.lock();
        loop {
            for shared in spine.iter() {
                if shared.num_wait_handles.load(Ordering::Acquire) < MAX_WAITHANDLES {
                    shared.num_wait_handles.fetch_add(1, Ordering::AcqRel);
                    return Ok(shared.clone());
                }
            }
            let created = self.create_wait_thread()?;
            spine.push(created);
        }
    }

    fn create_wait_thread(self: &Arc<Self>) -> Result<Arc<WaitThreadShared>> {
        let mailbox = Mailbox::new();
        let shared = Arc::new(WaitThreadShared {
            remote: mailbox.remote(),
            num_wait_handles: AtomicUsize::new(0),
        });
        let id = self.waits.next_thread_id.fetch_add(1, Ordering::Relaxed);
        debug_assert!(id < MAX_POSSIBLE_THREADS as usize);

        let inner = self.clone();
        let thread_shared = shared.clone();
        thread::Builder::new()
            .name(format!("workpool wait {}", id))
            .spawn(move || wait_thread_main(inner, mailbox, thread_shared))
            .map_err(Error::ThreadCreationFailed)?;
        Ok(shared)
    }
}

fn wait_thread_main(inner: Arc<PoolInner>, mailbox: Mailbox<WaitMsg>, shared: Arc<WaitThreadShared>) {
    trace!("wait thread started");
    let mut slots = Slots::new();

    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            // Designated safe point: leave registrations as they are (they
            // leak deliberately) but unblock anyone mid-teardown.
            abandon_drain(&mailbox);
            trace!("wait thread exiting on shutdown");
            return;
        }

        if slots.handles.is_empty() {
            // Nothing to wait for; sleep alertably until a message arrives.
            mailbox.alertable_sleep(None);
            drain(&inner, &mailbox, &shared, &mut slots);
            continue;
        }

        if mailbox.alert_pending() {
            // A deregistration may be racing a permanently-signaled handle;
            // give the mailbox a turn before re-entering the long wait.
            drain(&inner, &mailbox, &shared, &mut slots);
            continue;
        }

        let now = inner.tick_ms();
        let min_remaining = minimum_remaining(&mut slots, now);
        let outcome = mailbox.alertable_wait(
            &slots.handles,
            min_remaining.map(Duration::from_millis),
        );

        match outcome {
            WaitOutcome::Alerted => drain(&inner, &mailbox, &shared, &mut slots),
            WaitOutcome::Signaled(index) => {
                // Snapshot: completions may deactivate registrations and
                // reshape the slot arrays under us. An auto-reset handle
                // delivered exactly one signal, which pays for exactly one
                // completion; a manual-reset handle releases the whole
                // list.
                let manual = slots.handles[index].is_manual_reset();
                let fired: Vec<_> = if manual {
                    slots.lists[index].iter().cloned().collect()
                } else {
                    slots.lists[index].iter().take(1).cloned().collect()
                };
                for reg in fired {
                    process_completion(&inner, &shared, &mut slots, reg, false);
                }
            }
            WaitOutcome::TimedOut => {
                let deadline = min_remaining.unwrap_or(0);
                let all: Vec<_> = slots
                    .lists
                    .iter()
                    .flat_map(|list| list.iter().cloned())
                    .collect();
                for reg in all {
                    let due = reg.timeout_ms.is_some()
                        && reg.timing.lock().remaining_ms == deadline;
                    if due {
                        process_completion(&inner, &shared, &mut slots, reg, true);
                    }
                }
            }
            WaitOutcome::Abandoned => {
                // Find the dead handle by probing each slot, then detach
                // everything that was waiting on it.
                let mut index = 0;
                while index < slots.handles.len() {
                    if slots.handles[index].is_closed() {
                        warn!("abandoned wait handle; deactivating its registrations");
                        let dead: Vec<_> = slots.lists[index].iter().cloned().collect();
                        for reg in dead {
                            deactivate_wait(&shared, &mut slots, &reg);
                        }
                        // The slot at `index` is gone; re-examine the same
                        // position.
                    } else {
                        index += 1;
                    }
                }
            }
        }
    }
}

fn drain(
    inner: &Arc<PoolInner>,
    mailbox: &Mailbox<WaitMsg>,
    shared: &Arc<WaitThreadShared>,
    slots: &mut Slots,
) {
    let mut messages = Vec::new();
    mailbox.drain(|msg| messages.push(msg));
    for msg in messages {
        match msg {
            WaitMsg::Insert(reg) => insert_wait(inner, shared, slots, reg),
            WaitMsg::Deregister(reg) => deregister_wait(shared, slots, &reg),
            WaitMsg::Shutdown => {}
        }
    }
}

/// On shutdown, unblock teardown callers without touching shared state.
fn abandon_drain(mailbox: &Mailbox<WaitMsg>) {
    mailbox.drain(|msg| {
        if let WaitMsg::Deregister(reg) = msg {
            reg.partial_done.signal();
            reg.internal_done.signal();
        }
    });
}

/// Runs on the wait thread: attach a new registration to its slot.
fn insert_wait(
    inner: &Arc<PoolInner>,
    shared: &Arc<WaitThreadShared>,
    slots: &mut Slots,
    reg: Arc<WaitInner>,
) {
    if reg.state().contains(WaitFlags::DELETE_PENDING) {
        // Deregistered before we ever saw it.
        delete_wait(&reg);
        return;
    }
    reg.set_state(WaitFlags::REGISTERED | WaitFlags::ACTIVE);
    {
        let mut timing = reg.timing.lock();
        timing.start_ms = inner.tick_ms();
        timing.remaining_ms = reg.timeout_ms.map_or(u64::MAX, u64::from);
    }

    match slots
        .handles
        .iter()
        .position(|h| Arc::ptr_eq(h, &reg.handle))
    {
        Some(index) => {
            // Duplicate handle: the slot reservation made at registration
            // time wasn't needed after all.
            shared.num_wait_handles.fetch_sub(1, Ordering::AcqRel);
            slots.lists[index].push_back(reg);
        }
        None => {
            debug_assert!(slots.handles.len() < MAX_WAITHANDLES);
            slots.handles.push(reg.handle.clone());
            let mut list = VecDeque::new();
            list.push_back(reg);
            slots.lists.push(list);
        }
    }
}

/// Runs on the wait thread: detach and resolve a deregistration request.
fn deregister_wait(shared: &Arc<WaitThreadShared>, slots: &mut Slots, reg: &Arc<WaitInner>) {
    let state = reg.state();
    if !state.contains(WaitFlags::REGISTERED) {
        reg.set_state(WaitFlags::DELETE_PENDING);
        reg.release_ref();
        if !state.contains(WaitFlags::INTERNAL_COMPLETION) {
            reg.partial_done.signal();
        }
        return;
    }

    if state.contains(WaitFlags::ACTIVE) {
        deactivate_wait(shared, slots, reg);
    }

    if !state.contains(WaitFlags::INTERNAL_COMPLETION) {
        // Non-blocking: the unregistering caller owns the final reference
        // and performs the destruction once removal is visible.
        reg.partial_done.signal();
        return;
    }

    if reg.release_ref() == 0 {
        delete_wait(reg);
    }
}

/// Runs on the wait thread: remove a registration from its slot, shifting
/// the parallel arrays closed if the slot empties.
fn deactivate_wait(shared: &Arc<WaitThreadShared>, slots: &mut Slots, reg: &Arc<WaitInner>) {
    let mut found = None;
    'search: for (i, list) in slots.lists.iter().enumerate() {
        for (j, candidate) in list.iter().enumerate() {
            if Arc::ptr_eq(candidate, reg) {
                found = Some((i, j));
                break 'search;
            }
        }
    }
    if let Some((slot, position)) = found {
        slots.lists[slot].remove(position);
        if slots.lists[slot].is_empty() {
            slots.lists.remove(slot);
            slots.handles.remove(slot);
            shared.num_wait_handles.fetch_sub(1, Ordering::AcqRel);
        }
    }
    reg.clear_state(WaitFlags::ACTIVE);
}

/// Runs on the wait thread: a registration's handle fired or its timeout
/// elapsed. Queue the callback to the worker pool.
fn process_completion(
    inner: &Arc<PoolInner>,
    shared: &Arc<WaitThreadShared>,
    slots: &mut Slots,
    reg: Arc<WaitInner>,
    timed_out: bool,
) {
    if !reg.state().contains(WaitFlags::ACTIVE) {
        return;
    }

    if reg.state().contains(WaitFlags::SINGLE_EXECUTION) {
        deactivate_wait(shared, slots, &reg);
    } else {
        // Re-arm: restart the timeout clock.
        let mut timing = reg.timing.lock();
        timing.start_ms = inner.tick_ms();
        timing.remaining_ms = reg.timeout_ms.map_or(u64::MAX, u64::from);
    }

    reg.refcount.fetch_add(1, Ordering::AcqRel);
    let callback_ref = CallbackRef(reg);
    inner.enqueue_internal(Box::new(move || {
        (callback_ref.0.callback)(timed_out);
        drop(callback_ref);
    }));
}

/// Holds the callback's reference on a registration; releasing the last
/// reference destroys the record even if the callback panicked.
struct CallbackRef(Arc<WaitInner>);

impl Drop for CallbackRef {
    fn drop(&mut self) {
        if self.0.release_ref() == 0 {
            delete_wait(&self.0);
        }
    }
}

/// Resolve the completion events of a registration whose last reference
/// just went away. The record itself is freed when the final `Arc` drops.
fn delete_wait(reg: &Arc<WaitInner>) {
    if reg.state().contains(WaitFlags::INTERNAL_COMPLETION) {
        reg.internal_done.signal();
        return;
    }
    if let Some(event) = reg.external_done.lock().take() {
        event.signal();
    }
}

/// Compute the smallest remaining timeout across every registration,
/// refreshing each registration's remaining-time tracker on the way.
/// `None` means every registration waits forever.
fn minimum_remaining(slots: &mut Slots, now: u64) -> Option<u64> {
    let mut min = None;
    for list in &slots.lists {
        for reg in list {
            let timeout = match reg.timeout_ms {
                Some(timeout) => timeout as u64,
                None => continue,
            };
            let mut timing = reg.timing.lock();
            let elapsed = now.saturating_sub(timing.start_ms);
            timing.remaining_ms = timeout.saturating_sub(elapsed);
            min = Some(match min {
                None => timing.remaining_ms,
                Some(m) if timing.remaining_ms < m => timing.remaining_ms,
                Some(m) => m,
            });
        }
    }
    min
}
