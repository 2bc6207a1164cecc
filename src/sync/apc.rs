//! The mutation channel for wait and timer threads.
//!
//! A [`Mailbox`] pairs an unbounded channel with an [`Alerter`] that
//! interrupts the owning thread's current alertable wait. Sending a message
//! is the portable rendition of queueing an APC: the payload runs on the
//! owning thread, at its next alertable point, never concurrently with that
//! thread's own state.

use crate::error::{Error, Result};
use crate::sync::event::{Event, Wake, WaitOutcome, Waker};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The wake-up half of a mailbox: knows how to interrupt whatever alertable
/// wait the owning thread is currently in.
pub(crate) struct Alerter {
    slot: Mutex<Option<Arc<Waker>>>,
    pending: AtomicBool,
}

impl Alerter {
    fn new() -> Self {
        Alerter {
            slot: Mutex::new(None),
            pending: AtomicBool::new(false),
        }
    }

    fn alert(&self) {
        self.pending.store(true, Ordering::Release);
        if let Some(waker) = self.slot.lock().as_ref() {
            waker.try_wake(Wake::Alerted);
        }
    }

    pub(crate) fn install(&self, waker: &Arc<Waker>) {
        *self.slot.lock() = Some(waker.clone());
    }

    pub(crate) fn uninstall(&self) {
        *self.slot.lock() = None;
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// The receiving end, owned by exactly one thread.
pub(crate) struct Mailbox<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    alerter: Arc<Alerter>,
}

impl<T> Mailbox<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Mailbox {
            tx,
            rx,
            alerter: Arc::new(Alerter::new()),
        }
    }

    pub(crate) fn remote(&self) -> Remote<T> {
        Remote {
            tx: self.tx.clone(),
            alerter: self.alerter.clone(),
        }
    }

    /// Has a message arrived since the last drain?
    pub(crate) fn alert_pending(&self) -> bool {
        self.alerter.is_pending()
    }

    /// Run `f` for every queued message.
    pub(crate) fn drain(&self, mut f: impl FnMut(T)) {
        self.alerter.pending.store(false, Ordering::Release);
        loop {
            match self.rx.try_recv() {
                Ok(msg) => f(msg),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// An alertable wait over `events`: returns when one is signaled, a
    /// message arrives, or the timeout elapses.
    pub(crate) fn alertable_wait(
        &self,
        events: &[Arc<Event>],
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        crate::sync::event::wait_any(events, timeout, Some(&self.alerter))
    }

    /// An alertable sleep with no handles: wakes only for messages (or the
    /// timeout). `None` sleeps until a message arrives.
    pub(crate) fn alertable_sleep(&self, timeout: Option<Duration>) -> bool {
        matches!(self.alertable_wait(&[], timeout), WaitOutcome::Alerted)
    }
}

impl<T> Debug for Mailbox<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("queued", &self.rx.len()).finish()
    }
}

/// The sending end; clone freely.
pub(crate) struct Remote<T> {
    tx: Sender<T>,
    alerter: Arc<Alerter>,
}

impl<T> Clone for Remote<T> {
    fn clone(&self) -> Self {
        Remote {
            tx: self.tx.clone(),
            alerter: self.alerter.clone(),
        }
    }
}

impl<T> Remote<T> {
    /// Deliver `msg` to the owning thread's next alertable point.
    pub(crate) fn send(&self, msg: T) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::Shutdown)?;
        self.alerter.alert();
        Ok(())
    }
}

impl<T> Debug for Remote<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Remote")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn send_interrupts_sleep() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        let remote = mailbox.remote();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.send(7).unwrap();
        });

        assert!(mailbox.alertable_sleep(Some(Duration::from_secs(5))));
        let mut got = Vec::new();
        mailbox.drain(|m| got.push(m));
        assert_eq!(got, vec![7]);
        sender.join().unwrap();
    }

    #[test]
    fn message_sent_before_sleep_is_not_missed() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        mailbox.remote().send(1).unwrap();
        assert!(mailbox.alertable_sleep(Some(Duration::from_millis(500))));
    }

    #[test]
    fn sleep_times_out_without_messages() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        assert!(!mailbox.alertable_sleep(Some(Duration::from_millis(20))));
    }

    #[test]
    fn drain_clears_pending_flag() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        mailbox.remote().send(1).unwrap();
        assert!(mailbox.alert_pending());
        mailbox.drain(|_| {});
        assert!(!mailbox.alert_pending());
    }
}
