//! The gate thread: a singleton supervisor that samples CPU utilization,
//! detects a starving work queue, and assists the I/O pool with growth
//! decisions. It exists only while something needs it and winds itself down
//! through the same compare-exchange dance that starts it.

use crate::hill::ChangeReason;
use crate::platform::CpuSampler;
use crate::pool::PoolInner;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

const STATUS_NOT_RUNNING: u8 = 0;
const STATUS_WAITING_FOR_REQUEST: u8 = 1;
const STATUS_REQUESTED: u8 = 2;

/// Below this busy percentage the machine is considered underloaded and the
/// pool may grow more aggressively.
pub(crate) const CPU_UTILIZATION_LOW: u8 = 80;

/// Stored utilization when the platform cannot measure: treated as neither
/// low nor saturated.
pub(crate) const CPU_UTILIZATION_UNKNOWN: u8 = u8::MAX;

pub(crate) struct GateCore {
    status: AtomicU8,
    /// Latest sampled busy percentage, readable by the I/O growth policy.
    pub(crate) cpu_utilization: AtomicU8,
    tick_lock: Mutex<()>,
    tick_cv: Condvar,
}

impl GateCore {
    pub(crate) fn new() -> Self {
        GateCore {
            status: AtomicU8::new(STATUS_NOT_RUNNING),
            cpu_utilization: AtomicU8::new(CPU_UTILIZATION_UNKNOWN),
            tick_lock: Mutex::new(()),
            tick_cv: Condvar::new(),
        }
    }

    pub(crate) fn cpu_is_low(&self) -> bool {
        let cpu = self.cpu_utilization.load(Ordering::Acquire);
        cpu != CPU_UTILIZATION_UNKNOWN && cpu < CPU_UTILIZATION_LOW
    }

    /// Interrupt the current tick wait (shutdown notification).
    pub(crate) fn interrupt(&self) {
        let _guard = self.tick_lock.lock();
        self.tick_cv.notify_all();
    }

    /// One supervision tick. A plain timed condvar wait stands in for a
    /// coalescable OS timer; the configured tolerance is why the period is
    /// allowed to be sloppy.
    fn sleep_tick(&self, period: Duration) {
        let mut guard = self.tick_lock.lock();
        self.tick_cv.wait_for(&mut guard, period);
    }
}

impl PoolInner {
    /// Make sure the gate thread is running and aware it is still wanted.
    /// Callers race freely; exactly one thread ends up spawning it.
    pub(crate) fn ensure_gate_thread_running(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let gate = &self.gate;
        loop {
            match gate.status.load(Ordering::Acquire) {
                STATUS_REQUESTED => {
                    // Someone already registered a request; nothing to do.
                    return;
                }
                STATUS_WAITING_FOR_REQUEST => {
                    if gate
                        .status
                        .compare_exchange(
                            STATUS_WAITING_FOR_REQUEST,
                            STATUS_REQUESTED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => {
                    if gate
                        .status
                        .compare_exchange(
                            STATUS_NOT_RUNNING,
                            STATUS_REQUESTED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let inner = self.clone();
                        let spawned = thread::Builder::new()
                            .name("workpool gate".to_string())
                            .spawn(move || gate_main(inner));
                        if let Err(error) = spawned {
                            // Someone else will have to try again later.
                            warn!(%error, "gate thread creation failed");
                            gate.status.store(STATUS_NOT_RUNNING, Ordering::Release);
                        }
                        return;
                    }
                }
            }
        }
    }

    /// `true` while any component still needs supervision. Flips the status
    /// word to `WaitingForRequest` first so a concurrent
    /// [`PoolInner::ensure_gate_thread_running`] can veto the shutdown.
    fn gate_still_needed(&self) -> bool {
        let gate = &self.gate;
        let previous = gate
            .status
            .swap(STATUS_WAITING_FOR_REQUEST, Ordering::AcqRel);
        if previous != STATUS_WAITING_FOR_REQUEST {
            return true;
        }

        // No request since the last tick; check the standing predicates.
        let io_counts = self.io.counter.snapshot();
        let need_for_io =
            self.io.is_initialized() && io_counts.active.saturating_sub(io_counts.working) == 0;
        let need_for_workers = self.queue.requests_pending();
        let need_for_tracking = self.config.enable_worker_tracking;

        if need_for_io || need_for_workers || need_for_tracking {
            return true;
        }

        gate.status
            .compare_exchange(
                STATUS_WAITING_FOR_REQUEST,
                STATUS_NOT_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
    }

    /// Has the queue gone un-dequeued long enough to call it starved? The
    /// threshold scales with the thread count so a saturated machine is not
    /// flooded with even more threads.
    fn sufficient_delay_since_last_dequeue(&self) -> bool {
        let tick = self.config.gate_tick_ms as u64;
        let delay = self
            .tick_ms()
            .saturating_sub(self.workers.last_dequeue_ms.load(Ordering::Acquire));
        let threshold = if self.gate.cpu_is_low() {
            tick
        } else {
            let threads = self.workers.counter.snapshot().active.max(1) as u64;
            threads * 2 * tick
        };
        delay > threshold
    }

    /// Raise the ceiling by one and inject a worker. Called with starvation
    /// already established.
    fn inject_starvation_worker(self: &Arc<Self>) {
        let w = &self.workers;
        let max_limit = w.max_limit.load(Ordering::Relaxed);

        let mut guard = w.adjustment.lock();
        let mut counts = w.counter.snapshot();
        let mut injected = false;
        // Don't add a thread past the limit, and don't pile on while an
        // earlier raise is still being filled.
        while counts.active < max_limit && counts.active >= counts.max_working {
            let mut new = counts;
            new.max_working = counts.active + 1;
            match w.counter.compare_exchange(counts, new) {
                Ok(_) => {
                    guard
                        .hill
                        .force_change(new.max_working, ChangeReason::Starvation);
                    injected = true;
                    break;
                }
                Err(observed) => counts = observed,
            }
        }
        drop(guard);

        if injected {
            debug!("work queue starvation: injecting a worker");
            self.maybe_add_working_worker();
        }
    }
}

fn gate_main(inner: Arc<PoolInner>) {
    trace!("gate thread started");
    // The tick may be delivered up to the configured tolerance late; a
    // timed condvar wait with the tolerance folded in stands in for a
    // coalescable OS timer.
    let period = Duration::from_millis(
        (inner.config.gate_tick_ms + inner.config.gate_tick_tolerance_ms) as u64,
    );
    let mut sampler = CpuSampler::new(inner.platform.clone());
    // Prime the tick counters; the first delta would otherwise cover an
    // unbounded interval.
    let _ = sampler.sample();

    loop {
        inner.gate.sleep_tick(period);

        if inner.shutdown.load(Ordering::Acquire) {
            inner
                .gate
                .status
                .store(STATUS_NOT_RUNNING, Ordering::Release);
            trace!("gate thread exiting on shutdown");
            return;
        }

        if inner.config.enable_worker_tracking {
            tracing::debug!(
                target: "workpool::telemetry",
                max_working = inner.take_max_working_watermark(),
                "working thread count sample"
            );
        }

        let cpu = sampler
            .sample()
            .unwrap_or(CPU_UTILIZATION_UNKNOWN);
        inner.gate.cpu_utilization.store(cpu, Ordering::Release);

        inner.io_gate_assist();

        if !inner.config.disable_starvation_detection
            && inner.queue.requests_pending()
            && inner.sufficient_delay_since_last_dequeue()
        {
            inner.inject_starvation_worker();
        }

        if !inner.gate_still_needed() {
            trace!("gate thread no longer needed, exiting");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::platform::SystemPlatform;

    fn test_inner() -> Arc<PoolInner> {
        let config = PoolConfig {
            min_workers: 1,
            max_workers: 4,
            gate_tick_ms: 20,
            ..PoolConfig::default()
        };
        PoolInner::new(config, Arc::new(SystemPlatform), None)
    }

    #[test]
    fn concurrent_ensure_spawns_one_gate() {
        let inner = test_inner();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let inner = inner.clone();
                std::thread::spawn(move || inner.ensure_gate_thread_running())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        // With nothing to supervise the one gate thread all callers agreed
        // on retires itself and resets the status word.
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(
            inner.gate.status.load(Ordering::SeqCst),
            STATUS_NOT_RUNNING
        );
    }

    #[test]
    fn starvation_injection_respects_max_limit() {
        let inner = test_inner();
        inner.workers.counter.update(|mut c| {
            c.active = 4;
            c.working = 4;
            c.max_working = 4;
            Some(c)
        });
        inner.inject_starvation_worker();
        // active == max_limit: no raise.
        assert_eq!(inner.workers.counter.snapshot().max_working, 4);
    }

    #[test]
    fn starvation_injection_raises_ceiling() {
        let inner = test_inner();
        inner.workers.counter.update(|mut c| {
            c.active = 2;
            c.working = 2;
            c.max_working = 2;
            Some(c)
        });
        inner.inject_starvation_worker();
        let counts = inner.workers.counter.snapshot();
        assert_eq!(counts.max_working, 3);
    }
}
