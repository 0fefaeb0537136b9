use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rstest::rstest;

use stingray_core::{CountdownEvent, SysConf};
use stingray_runtime::TaskPool;

fn wait_done(done: &CountdownEvent) {
    assert!(
        done.wait_timeout(Duration::from_secs(10)),
        "timed out waiting for scheduled work"
    );
}

#[test]
fn start_rejects_bad_worker_counts() {
    assert!(TaskPool::start(0).is_err());
    assert!(TaskPool::start(SysConf::num_cores() + 1).is_err());
}

#[test]
fn schedule_runs_everything() {
    let pool = TaskPool::start(2.min(SysConf::num_cores())).unwrap();
    let executed = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(CountdownEvent::new(1000));

    for _ in 0..1000 {
        let executed = executed.clone();
        let done = done.clone();
        pool.schedule(move || {
            executed.fetch_add(1, Ordering::Relaxed);
            done.signal();
        });
    }

    wait_done(&done);
    assert_eq!(1000, executed.load(Ordering::Relaxed));
    pool.shutdown();
}

#[test]
fn affinity_serializes_callbacks() {
    let pool = TaskPool::start(SysConf::num_cores().min(4)).unwrap();
    let affinity = pool.next_affinity();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(CountdownEvent::new(200));

    for sequence in 0..200usize {
        let in_flight = in_flight.clone();
        let overlaps = overlaps.clone();
        let order = order.clone();
        let done = done.clone();

        pool.schedule_to(affinity, move || {
            if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            order.lock().unwrap().push(sequence);
            in_flight.fetch_sub(1, Ordering::SeqCst);
            done.signal();
        });
    }

    wait_done(&done);
    assert_eq!(0, overlaps.load(Ordering::SeqCst));
    assert_eq!((0..200).collect::<Vec<_>>(), *order.lock().unwrap());
    pool.shutdown();
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
fn barrier_runs_after_queued_work(#[case] worker_count: usize) {
    if worker_count > SysConf::num_cores() {
        return;
    }

    const ROUTINES: usize = 100;
    const NAP: Duration = Duration::from_millis(5);

    let pool = TaskPool::start(worker_count).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(CountdownEvent::new(1));
    let started = Instant::now();

    for _ in 0..ROUTINES {
        let completed = completed.clone();
        pool.schedule(move || {
            thread::sleep(NAP);
            completed.fetch_add(1, Ordering::Relaxed);
        });
    }

    let completed_at_barrier = completed.clone();
    let done_signal = done.clone();
    pool.schedule_barrier(move || {
        assert_eq!(ROUTINES, completed_at_barrier.load(Ordering::Relaxed));
        done_signal.signal();
    });

    assert!(
        done.wait_timeout(Duration::from_secs(30)),
        "barrier follow-on never ran"
    );

    // With round-robin dispatch, each worker sleeps through its share of
    // the queued routines before its barrier arrival runs.
    //
    assert!(started.elapsed() >= NAP * (ROUTINES / worker_count) as u32);
    pool.shutdown();
}

#[test]
fn timers_fire_in_deadline_order() {
    let pool = TaskPool::start(2.min(SysConf::num_cores())).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(CountdownEvent::new(2));
    let started = Instant::now();

    // Registered slow-first to prove execution follows deadlines, not
    // registration order.
    //
    for (label, delay) in [
        ("slow", Duration::from_millis(200)),
        ("fast", Duration::from_millis(100)),
    ] {
        let order = order.clone();
        let done = done.clone();
        pool.schedule_in(delay, move || {
            order.lock().unwrap().push((label, started.elapsed()));
            done.signal();
        });
    }

    wait_done(&done);

    let order = order.lock().unwrap();
    let labels: Vec<&str> = order.iter().map(|(label, _)| *label).collect();
    assert_eq!(vec!["fast", "slow"], labels);
    assert!(order[0].1 >= Duration::from_millis(100));
    assert!(order[1].1 >= Duration::from_millis(200));
    drop(order);

    pool.shutdown();
}

#[test]
fn wait_releases_on_wakeup() {
    let pool = TaskPool::start(1).unwrap();

    let waker_pool = pool.clone();
    pool.schedule_in(Duration::from_millis(50), move || waker_pool.wakeup());

    pool.wait();
    pool.shutdown();
}
