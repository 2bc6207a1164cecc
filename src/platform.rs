//! Optional operating-system facilities behind a capability trait.
//!
//! The scheduler needs three things the OS may or may not offer: CPU time
//! accounting restricted to the process affinity, per-thread pending-I/O
//! introspection, and (elsewhere) a coalescable tick. Everything here has a
//! working fallback so the pool runs unchanged on platforms without the
//! capability.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Cumulative CPU tick counters over the CPUs this process may run on.
#[derive(Debug, Copy, Clone, Default)]
pub struct CpuTimes {
    /// Ticks spent running anything.
    pub busy: u64,
    /// Busy plus idle ticks.
    pub total: u64,
}

/// Platform capabilities consumed by the gate thread and the I/O pool.
pub trait Platform: Send + Sync + 'static {
    /// Current cumulative CPU times, or `None` if the platform cannot say.
    fn cpu_times(&self) -> Option<CpuTimes>;

    /// Number of CPUs available to this process.
    fn cpu_count(&self) -> usize;

    /// Whether the calling thread has asynchronous I/O outstanding.
    fn io_pending(&self) -> bool {
        pending_io_count() > 0
    }
}

/// The default capability set: `/proc/stat` masked by the scheduler
/// affinity on Linux, graceful unknowns elsewhere.
#[derive(Debug, Default)]
pub struct SystemPlatform;

impl Platform for SystemPlatform {
    fn cpu_times(&self) -> Option<CpuTimes> {
        imp::cpu_times()
    }

    fn cpu_count(&self) -> usize {
        imp::affinity_cpu_count().unwrap_or_else(num_cpus::get).max(1)
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::CpuTimes;

    pub(super) fn affinity_mask() -> Option<libc::cpu_set_t> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) == 0 {
                Some(set)
            } else {
                None
            }
        }
    }

    pub(super) fn affinity_cpu_count() -> Option<usize> {
        affinity_mask().map(|set| unsafe { libc::CPU_COUNT(&set) as usize })
    }

    pub(super) fn cpu_times() -> Option<CpuTimes> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let mask = affinity_mask();

        let mut times = CpuTimes::default();
        let mut matched = false;
        for line in stat.lines() {
            let rest = match line.strip_prefix("cpu") {
                Some(rest) if !rest.starts_with(' ') => rest,
                _ => continue,
            };
            let mut fields = rest.split_whitespace();
            let index: usize = match fields.next().map(str::parse) {
                // The first token after "cpu" is the CPU index for per-CPU
                // rows; the aggregate row was skipped above.
                Some(Ok(index)) => index,
                _ => continue,
            };
            if let Some(set) = mask.as_ref() {
                if index < libc::CPU_SETSIZE as usize && !unsafe { libc::CPU_ISSET(index, set) } {
                    continue;
                }
            }

            let ticks: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
            if ticks.len() < 5 {
                continue;
            }
            // user nice system idle iowait irq softirq steal ...
            let idle = ticks[3] + ticks[4];
            let busy: u64 = ticks
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != 3 && i != 4)
                .map(|(_, &t)| t)
                .sum();
            times.busy += busy;
            times.total += busy + idle;
            matched = true;
        }
        matched.then(|| times)
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::CpuTimes;

    pub(super) fn affinity_cpu_count() -> Option<usize> {
        None
    }

    pub(super) fn cpu_times() -> Option<CpuTimes> {
        None
    }
}

thread_local! {
    static PENDING_IO: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
}

fn pending_io_count() -> usize {
    PENDING_IO.with(|counter| counter.load(Ordering::Acquire))
}

/// Marks the calling thread as having one asynchronous I/O outstanding until
/// the guard is dropped. The guard may be sent to whichever thread completes
/// the I/O; the count stays attributed to the initiating thread.
///
/// This is what lets an I/O dispatcher "retire with pending I/O" instead of
/// exiting: the pool asks the [`Platform`] and the default implementation
/// answers from this counter.
#[derive(Debug)]
pub struct PendingIo {
    counter: Arc<AtomicUsize>,
}

impl PendingIo {
    /// Record the start of an asynchronous operation on this thread.
    pub fn begin() -> PendingIo {
        let counter = PENDING_IO.with(|counter| counter.clone());
        counter.fetch_add(1, Ordering::AcqRel);
        PendingIo { counter }
    }
}

impl Drop for PendingIo {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Utilization derived from consecutive [`CpuTimes`] snapshots.
pub(crate) struct CpuSampler {
    platform: Arc<dyn Platform>,
    prev: Option<CpuTimes>,
}

impl CpuSampler {
    pub(crate) fn new(platform: Arc<dyn Platform>) -> Self {
        CpuSampler {
            platform,
            prev: None,
        }
    }

    /// Percent busy (0–100) since the previous call, or `None` when the
    /// platform cannot say or on the first call.
    pub(crate) fn sample(&mut self) -> Option<u8> {
        let current = self.platform.cpu_times()?;
        let prev = self.prev.replace(current)?;
        let total = current.total.saturating_sub(prev.total);
        if total == 0 {
            return None;
        }
        let busy = current.busy.saturating_sub(prev.busy);
        Some(((busy * 100) / total).min(100) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_io_guard_counts() {
        assert!(!SystemPlatform.io_pending());
        let guard = PendingIo::begin();
        assert!(SystemPlatform.io_pending());
        drop(guard);
        assert!(!SystemPlatform.io_pending());
    }

    #[test]
    fn pending_io_survives_cross_thread_completion() {
        let guard = PendingIo::begin();
        assert!(SystemPlatform.io_pending());
        std::thread::spawn(move || drop(guard)).join().unwrap();
        assert!(!SystemPlatform.io_pending());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_stat_is_readable() {
        let platform = SystemPlatform;
        let first = platform.cpu_times().expect("no /proc/stat");
        assert!(first.total >= first.busy);
        assert!(platform.cpu_count() >= 1);
    }

    #[test]
    fn sampler_needs_two_snapshots() {
        let mut sampler = CpuSampler::new(Arc::new(SystemPlatform));
        let first = sampler.sample();
        if cfg!(target_os = "linux") {
            assert!(first.is_none());
        }
    }
}
