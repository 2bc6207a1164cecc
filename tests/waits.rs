//! End-to-end scenarios for the wait, timer and I/O completion subsystems.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use workpool::{
    CompletionNotice, Event, Platform, PoolConfig, ThreadPool, MAX_WAITHANDLES,
};

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn quick_config() -> PoolConfig {
    PoolConfig {
        min_workers: 2,
        max_workers: 8,
        min_iocp: 1,
        max_iocp: 4,
        hill_climbing_sample_interval_ms: 50,
        gate_tick_ms: 50,
        worker_idle_timeout_ms: 500,
        ..PoolConfig::default()
    }
}

#[test]
fn wait_fan_out_over_distinct_handles() {
    let pool = ThreadPool::new(quick_config()).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let timed_out = Arc::new(AtomicUsize::new(0));

    const WAITS: usize = 200;
    let mut registrations = Vec::new();
    for _ in 0..WAITS {
        let handle = Arc::new(Event::auto_reset());
        let fired = fired.clone();
        let timed_out = timed_out.clone();
        let registration = pool
            .register_wait(
                handle,
                move |was_timeout| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    if was_timeout {
                        timed_out.fetch_add(1, Ordering::SeqCst);
                    }
                },
                Some(Duration::from_millis(500)),
                true,
            )
            .unwrap();
        registrations.push(registration);
    }

    // 200 distinct handles at 63 per wait thread.
    let expected_threads = (WAITS + MAX_WAITHANDLES - 1) / MAX_WAITHANDLES;
    assert_eq!(pool.wait_thread_count(), expected_threads);

    // Nothing is ever signaled; every registration fires its timeout.
    assert!(
        wait_until(Duration::from_secs(30), || {
            fired.load(Ordering::SeqCst) == WAITS
        }),
        "only {} of {} waits fired",
        fired.load(Ordering::SeqCst),
        WAITS
    );
    assert_eq!(timed_out.load(Ordering::SeqCst), WAITS);
}

#[test]
fn signaled_single_wait_fires_once() {
    let pool = ThreadPool::new(quick_config()).unwrap();
    let handle = Arc::new(Event::auto_reset());
    let fired = Arc::new(AtomicUsize::new(0));

    let _registration = {
        let fired = fired.clone();
        pool.register_wait(
            handle.clone(),
            move |was_timeout| {
                assert!(!was_timeout);
                fired.fetch_add(1, Ordering::SeqCst);
            },
            None,
            true,
        )
        .unwrap()
    };

    handle.signal();
    assert!(wait_until(Duration::from_secs(10), || {
        fired.load(Ordering::SeqCst) == 1
    }));

    // Single-execution: a second signal must not re-fire.
    handle.signal();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn recurring_wait_rearms_until_unregistered() {
    let pool = ThreadPool::new(quick_config()).unwrap();
    let handle = Arc::new(Event::auto_reset());
    let fired = Arc::new(AtomicUsize::new(0));

    let registration = {
        let fired = fired.clone();
        pool.register_wait(
            handle.clone(),
            move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            None,
            false,
        )
        .unwrap()
    };

    for round in 1..=3 {
        handle.signal();
        assert!(wait_until(Duration::from_secs(10), || {
            fired.load(Ordering::SeqCst) == round
        }));
    }

    pool.unregister_wait(registration, CompletionNotice::Blocking)
        .unwrap();

    handle.signal();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[test]
fn blocking_unregister_waits_for_inflight_callback() {
    let pool = ThreadPool::new(quick_config()).unwrap();
    let handle = Arc::new(Event::auto_reset());
    let entered = Arc::new(Event::manual_reset());
    let finished = Arc::new(AtomicUsize::new(0));

    let registration = {
        let entered = entered.clone();
        let finished = finished.clone();
        pool.register_wait(
            handle.clone(),
            move |_| {
                entered.signal();
                std::thread::sleep(Duration::from_millis(600));
                finished.fetch_add(1, Ordering::SeqCst);
            },
            None,
            false,
        )
        .unwrap()
    };

    handle.signal();
    assert!(entered.wait(Some(Duration::from_secs(10))));

    // The callback is mid-flight; a blocking deregistration must not
    // return until it has finished.
    pool.unregister_wait(registration, CompletionNotice::Blocking)
        .unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    // And no callback ever runs again.
    handle.signal();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn unregister_with_event_notice_signals_destruction() {
    let pool = ThreadPool::new(quick_config()).unwrap();
    let handle = Arc::new(Event::auto_reset());
    let destroyed = Arc::new(Event::auto_reset());

    let registration = pool
        .register_wait(handle, |_| {}, None, false)
        .unwrap();
    pool.unregister_wait(registration, CompletionNotice::Event(destroyed.clone()))
        .unwrap();

    assert!(destroyed.wait(Some(Duration::from_secs(10))));
}

#[test]
fn recurring_timeout_wait_keeps_firing() {
    let pool = ThreadPool::new(quick_config()).unwrap();
    let handle = Arc::new(Event::auto_reset());
    let fired = Arc::new(AtomicUsize::new(0));

    let _registration = {
        let fired = fired.clone();
        pool.register_wait(
            handle,
            move |was_timeout| {
                assert!(was_timeout);
                fired.fetch_add(1, Ordering::SeqCst);
            },
            Some(Duration::from_millis(100)),
            false,
        )
        .unwrap()
    };

    assert!(wait_until(Duration::from_secs(10), || {
        fired.load(Ordering::SeqCst) >= 3
    }));
}

#[test]
fn one_shot_timer_fires_once() {
    let pool = ThreadPool::new(quick_config()).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let _timer = {
        let fired = fired.clone();
        pool.create_timer(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            Some(Duration::from_millis(50)),
            None,
        )
        .unwrap()
    };

    assert!(wait_until(Duration::from_secs(10), || {
        fired.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn periodic_timer_fires_until_deleted() {
    let pool = ThreadPool::new(quick_config()).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let timer = {
        let fired = fired.clone();
        pool.create_timer(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            Some(Duration::from_millis(20)),
            Some(Duration::from_millis(50)),
        )
        .unwrap()
    };

    assert!(wait_until(Duration::from_secs(10), || {
        fired.load(Ordering::SeqCst) >= 3
    }));

    pool.delete_timer(timer, CompletionNotice::Blocking).unwrap();
    let after_delete = fired.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), after_delete);
}

#[test]
fn disarmed_timer_arms_through_change() {
    let pool = ThreadPool::new(quick_config()).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let timer = {
        let fired = fired.clone();
        pool.create_timer(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            None,
            None,
        )
        .unwrap()
    };

    // Created disarmed: nothing fires on its own.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    pool.change_timer(&timer, Some(Duration::from_millis(30)), None)
        .unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        fired.load(Ordering::SeqCst) == 1
    }));

    let destroyed = Arc::new(Event::auto_reset());
    pool.delete_timer(timer, CompletionNotice::Event(destroyed.clone()))
        .unwrap();
    assert!(destroyed.wait(Some(Duration::from_secs(10))));
}

/// Platform stub that reports pending asynchronous I/O on every thread,
/// forcing timed-out I/O dispatchers into retirement instead of exit.
#[derive(Debug)]
struct PendingIoPlatform;

impl Platform for PendingIoPlatform {
    fn cpu_times(&self) -> Option<workpool::CpuTimes> {
        None
    }

    fn cpu_count(&self) -> usize {
        2
    }

    fn io_pending(&self) -> bool {
        true
    }
}

#[test]
fn io_dispatcher_retires_with_pending_io_and_revives() {
    let config = PoolConfig {
        min_iocp: 2,
        worker_idle_timeout_ms: 300,
        ..quick_config()
    };
    let pool = ThreadPool::with_platform(config, Arc::new(PendingIoPlatform)).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let registration = {
        let hits = hits.clone();
        pool.bind_io_completion(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
        })
        .unwrap()
    };

    // Two overlapping completions pull two dispatchers into existence.
    pool.post_completion(&registration, 0, 0).unwrap();
    pool.post_completion(&registration, 0, 0).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        hits.load(Ordering::SeqCst) == 2
    }));

    // Both dispatchers idle out; with pending I/O on their threads one of
    // them must retire rather than exit (the other stays as the last free
    // dispatcher).
    assert!(
        wait_until(Duration::from_secs(10), || {
            pool.io_counts().retired == 1
        }),
        "no dispatcher retired: {:?}",
        pool.io_counts()
    );

    // Occupy the free dispatcher, then post more work: the growth policy
    // must revive the retired dispatcher through its wakeup event.
    pool.post_completion(&registration, 0, 0).unwrap();
    pool.post_completion(&registration, 0, 0).unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            hits.load(Ordering::SeqCst) == 4
        }),
        "retired dispatcher never revived: {:?}",
        pool.io_counts()
    );
    let counts = pool.io_counts();
    assert!(counts.working <= counts.active, "{:?}", counts);
}
