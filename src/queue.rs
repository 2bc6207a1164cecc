use crate::recycle::RecycledLists;
use crossbeam_deque::{Injector, Steal};
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Result of asking the dispatch queue to run one unit of work on the
/// calling thread.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dispatch {
    /// A unit ran to completion (or panicked and was swallowed).
    Worked,
    /// The queue had nothing; the worker may wind down.
    NoWork,
    /// The producer wants the thread back immediately; do not count this as
    /// having found work.
    Recalled,
}

/// Boxed work item run by a pool worker.
pub type WorkFn = Box<dyn FnOnce() + Send + 'static>;

/// The boundary between the scheduler and whatever feeds it.
///
/// `requests_pending` may momentarily report a false negative; a producer
/// that takes the queue from empty to non-empty must follow up with
/// [`ThreadPool::notify_work_available`](crate::ThreadPool::notify_work_available).
/// In return the scheduler guarantees that some worker calls `dispatch_one`
/// within bounded time of that notification, as long as `max_working >= 1`.
///
/// `dispatch_one` is always invoked with no scheduler lock held.
pub trait DispatchQueue: Send + Sync + 'static {
    /// Cheap check whether any work is queued.
    fn requests_pending(&self) -> bool;
    /// Run at most one unit of work on the calling thread.
    fn dispatch_one(&self) -> Dispatch;
}

pub(crate) struct WorkRecord {
    callback: Option<WorkFn>,
}

/// The built-in queue: a global injector of boxed callbacks with record
/// recycling, sufficient to run the pool stand-alone.
pub struct InjectorQueue {
    injector: Injector<Box<WorkRecord>>,
    recalled: AtomicBool,
    recycled: RecycledLists<WorkRecord>,
}

impl InjectorQueue {
    pub(crate) fn new(cpus: usize) -> Self {
        InjectorQueue {
            injector: Injector::new(),
            recalled: AtomicBool::new(false),
            recycled: RecycledLists::new(cpus),
        }
    }

    pub(crate) fn push(&self, callback: WorkFn) {
        let mut record = self
            .recycled
            .pop()
            .unwrap_or_else(|| Box::new(WorkRecord { callback: None }));
        record.callback = Some(callback);
        self.injector.push(record);
    }

    /// Make every subsequent `dispatch_one` return [`Dispatch::Recalled`].
    pub(crate) fn recall(&self) {
        self.recalled.store(true, Ordering::Release);
    }
}

impl DispatchQueue for InjectorQueue {
    fn requests_pending(&self) -> bool {
        !self.injector.is_empty()
    }

    fn dispatch_one(&self) -> Dispatch {
        if self.recalled.load(Ordering::Acquire) {
            return Dispatch::Recalled;
        }
        loop {
            match self.injector.steal() {
                Steal::Success(mut record) => {
                    let callback = record.callback.take();
                    self.recycled.push(record);
                    if let Some(callback) = callback {
                        // User code must not take the worker down or skew
                        // the counter protocol.
                        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                            warn!("work item panicked; continuing");
                        }
                    }
                    return Dispatch::Worked;
                }
                Steal::Empty => return Dispatch::NoWork,
                Steal::Retry => {}
            }
        }
    }
}

/// Combines the pool's own injector with a user-supplied queue. Internal
/// items (wait and timer completions) always dispatch ahead of external
/// work so a slow producer queue cannot starve the pool's own plumbing.
pub(crate) struct ChainedQueue {
    internal: Arc<InjectorQueue>,
    external: Arc<dyn DispatchQueue>,
}

impl ChainedQueue {
    pub(crate) fn new(internal: Arc<InjectorQueue>, external: Arc<dyn DispatchQueue>) -> Self {
        ChainedQueue { internal, external }
    }
}

impl DispatchQueue for ChainedQueue {
    fn requests_pending(&self) -> bool {
        self.internal.requests_pending() || self.external.requests_pending()
    }

    fn dispatch_one(&self) -> Dispatch {
        match self.internal.dispatch_one() {
            Dispatch::NoWork => self.external.dispatch_one(),
            dispatched => dispatched,
        }
    }
}

impl Debug for ChainedQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedQueue")
            .field("internal", &self.internal)
            .finish()
    }
}

impl Debug for InjectorQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectorQueue")
            .field("pending", &!self.injector.is_empty())
            .field("recalled", &self.recalled.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn dispatches_in_some_order() {
        let queue = InjectorQueue::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            queue.push(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(queue.requests_pending());
        assert_eq!(queue.dispatch_one(), Dispatch::Worked);
        assert_eq!(queue.dispatch_one(), Dispatch::Worked);
        assert_eq!(queue.dispatch_one(), Dispatch::Worked);
        assert_eq!(queue.dispatch_one(), Dispatch::NoWork);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_item_counts_as_worked() {
        let queue = InjectorQueue::new(1);
        queue.push(Box::new(|| panic!("oops")));
        assert_eq!(queue.dispatch_one(), Dispatch::Worked);
        assert_eq!(queue.dispatch_one(), Dispatch::NoWork);
    }

    #[test]
    fn recall_preempts_pending_work() {
        let queue = InjectorQueue::new(1);
        queue.push(Box::new(|| {}));
        queue.recall();
        assert_eq!(queue.dispatch_one(), Dispatch::Recalled);
    }
}
