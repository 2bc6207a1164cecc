use crate::counter::MAX_POSSIBLE_THREADS;
use crate::error::{Error, Result};

/// Assumed per-thread stack reservation used to derive the default worker
/// ceiling from the address space, mirroring common platform defaults.
const DEFAULT_STACK_RESERVE: u64 = 2 * 1024 * 1024;

/// Tuning knobs for a [`ThreadPool`](crate::ThreadPool).
///
/// All fields have sensible defaults; construct with `PoolConfig::default()`
/// and override what you need. Validation happens once, when the pool is
/// built.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Lower bound on `max_working` for the worker pool. Defaults to the
    /// number of logical CPUs.
    pub min_workers: u16,
    /// Upper bound on worker threads. Defaults to a ceiling derived from
    /// half the virtual address space divided by the default stack size,
    /// clamped to the packed-counter maximum.
    pub max_workers: u16,
    /// Lower bound for the I/O completion pool. Defaults to the CPU count.
    pub min_iocp: u16,
    /// Upper bound for the I/O completion pool.
    pub max_iocp: u16,
    /// Initial hill-climbing sample interval. The controller adapts the
    /// effective interval upward from here.
    pub hill_climbing_sample_interval_ms: u32,
    /// Period of the gate thread's supervision tick.
    pub gate_tick_ms: u32,
    /// Scheduling slack the gate tolerates on its tick; a coalescable timer
    /// may deliver the tick up to this much late.
    pub gate_tick_tolerance_ms: u32,
    /// How long an idle worker blocks for work before exiting.
    pub worker_idle_timeout_ms: u32,
    /// Emit a telemetry event with the max-working watermark every gate tick.
    pub enable_worker_tracking: bool,
    /// Turn off the gate's starvation detection (diagnostic use).
    pub disable_starvation_detection: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().clamp(1, MAX_POSSIBLE_THREADS as usize) as u16;
        PoolConfig {
            min_workers: cpus,
            max_workers: default_max_workers(cpus),
            min_iocp: cpus,
            max_iocp: default_max_workers(cpus),
            hill_climbing_sample_interval_ms: 100,
            gate_tick_ms: 500,
            gate_tick_tolerance_ms: 50,
            worker_idle_timeout_ms: 20_000,
            enable_worker_tracking: false,
            disable_starvation_detection: false,
        }
    }
}

impl PoolConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(Error::InvalidArgument("min_workers must be at least 1"));
        }
        if self.max_workers < self.min_workers {
            return Err(Error::InvalidArgument("max_workers below min_workers"));
        }
        if self.min_iocp == 0 {
            return Err(Error::InvalidArgument("min_iocp must be at least 1"));
        }
        if self.max_iocp < self.min_iocp {
            return Err(Error::InvalidArgument("max_iocp below min_iocp"));
        }
        if self.max_workers > MAX_POSSIBLE_THREADS || self.max_iocp > MAX_POSSIBLE_THREADS {
            return Err(Error::InvalidArgument("thread limit above supported maximum"));
        }
        if self.hill_climbing_sample_interval_ms == 0 {
            return Err(Error::InvalidArgument("sample interval must be nonzero"));
        }
        if self.gate_tick_ms == 0 {
            return Err(Error::InvalidArgument("gate tick must be nonzero"));
        }
        if self.worker_idle_timeout_ms == 0 {
            return Err(Error::InvalidArgument("idle timeout must be nonzero"));
        }
        Ok(())
    }
}

/// The default worker ceiling:
///
///  1) at least `min_limit`,
///  2) no greater than half the virtual address space divided by the
///     default stack reservation,
///  3) at most the packed-counter maximum.
fn default_max_workers(min_limit: u16) -> u16 {
    let half_address_space: u64 = if cfg!(target_pointer_width = "64") {
        // 47 usable user-space bits on the common 64-bit configurations.
        1u64 << 46
    } else {
        0x7FFE_0000 / 2
    };
    let limit = half_address_space / DEFAULT_STACK_RESERVE;
    let limit = limit.max(min_limit as u64);
    limit.min(MAX_POSSIBLE_THREADS as u64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn default_ceiling_honours_min() {
        assert!(default_max_workers(4) >= 4);
        assert!(default_max_workers(4) <= MAX_POSSIBLE_THREADS);
        assert_eq!(
            default_max_workers(MAX_POSSIBLE_THREADS),
            MAX_POSSIBLE_THREADS
        );
    }

    #[test]
    fn rejects_inverted_limits() {
        let config = PoolConfig {
            min_workers: 8,
            max_workers: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_zero_min() {
        let config = PoolConfig {
            min_workers: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
