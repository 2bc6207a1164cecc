//! The small synchronization toolkit the pool is built from: the two worker
//! semaphores, the portable waitable event with bounded multi-object wait,
//! the mailbox used as the mutation channel for wait and timer threads, and
//! the narrow test-and-set lock guarding thread-count adjustment.

pub(crate) mod apc;
pub(crate) mod event;
pub(crate) mod semaphore;
pub(crate) mod spinlock;

pub use event::{Event, MAX_WAITHANDLES};
pub(crate) use event::WaitOutcome;
