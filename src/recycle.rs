use crossbeam_queue::ArrayQueue;
use std::cell::Cell;
use std::fmt::{Debug, Formatter};

/// How many recycled records each per-CPU list holds before overflow is
/// handed back to the general allocator.
const MAX_RECYCLED_PER_CPU: usize = 40;

thread_local! {
    // Round-robin slot assignment so unrelated threads spread over the
    // per-CPU lists instead of all hammering list zero.
    static RECYCLE_SLOT: Cell<Option<usize>> = Cell::new(None);
}

static NEXT_SLOT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

/// Bounded per-CPU LIFO freelists for hot-path record allocations.
///
/// `pop` hands back a previously recycled box when the calling thread's list
/// has one; `push` stores a spent record unless the list is full, in which
/// case the box is simply dropped.
pub(crate) struct RecycledLists<T> {
    per_cpu: Box<[ArrayQueue<Box<T>>]>,
}

impl<T> RecycledLists<T> {
    pub(crate) fn new(cpus: usize) -> Self {
        let per_cpu = (0..cpus.max(1))
            .map(|_| ArrayQueue::new(MAX_RECYCLED_PER_CPU))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        RecycledLists { per_cpu }
    }

    fn slot(&self) -> usize {
        RECYCLE_SLOT.with(|cell| {
            let slot = cell.get().unwrap_or_else(|| {
                let next =
                    NEXT_SLOT.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.per_cpu.len();
                cell.set(Some(next));
                next
            });
            slot % self.per_cpu.len()
        })
    }

    pub(crate) fn pop(&self) -> Option<Box<T>> {
        self.per_cpu[self.slot()].pop()
    }

    pub(crate) fn push(&self, record: Box<T>) {
        // A full list means the allocator takes the record back.
        let _ = self.per_cpu[self.slot()].push(record);
    }
}

impl<T> Debug for RecycledLists<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecycledLists")
            .field("lists", &self.per_cpu.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_within_capacity() {
        let lists: RecycledLists<u64> = RecycledLists::new(1);
        assert!(lists.pop().is_none());
        lists.push(Box::new(42));
        assert_eq!(*lists.pop().unwrap(), 42);
        assert!(lists.pop().is_none());
    }

    #[test]
    fn overflow_is_dropped_not_stored() {
        let lists: RecycledLists<usize> = RecycledLists::new(1);
        for i in 0..MAX_RECYCLED_PER_CPU + 10 {
            lists.push(Box::new(i));
        }
        let mut recovered = 0;
        while lists.pop().is_some() {
            recovered += 1;
        }
        assert_eq!(recovered, MAX_RECYCLED_PER_CPU);
    }
}
