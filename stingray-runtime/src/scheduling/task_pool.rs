use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use stingray_core::{CountdownEvent, SysConf};
use tracing::debug;

use super::routine::{self, Routine};
use super::routine_queue::RoutineQueue;
use super::timekeeper::Timekeeper;
use super::worker::Worker;

/// Round-robin fan-out over the worker mailboxes, shared by the pool, the
/// timekeeper and barrier fences.
///
pub(crate) struct Dispatcher {
    mailboxes: Vec<Arc<RoutineQueue>>,
    next_worker: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn dispatch(&self, routine: Box<dyn Routine>) {
        // Relaxed: the cursor only spreads load; slightly uneven dispatch
        // under contention is acceptable.
        //
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.mailboxes.len();
        self.mailboxes[index].push(routine);
    }

    pub(crate) fn dispatch_to(&self, worker: usize, routine: Box<dyn Routine>) {
        self.mailboxes[worker].push(routine);
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.mailboxes.len()
    }
}

/// Fan-in object behind `TaskPool::schedule_barrier`. One arrival routine
/// lands at the tail of every mailbox; the last arrival releases the
/// follow-on through ordinary dispatch.
///
struct BarrierFence {
    pending_arrivals: AtomicUsize,
    follow_on: Mutex<Option<Box<dyn Routine>>>,
    dispatcher: Arc<Dispatcher>,
}

impl BarrierFence {
    fn arrive(&self) {
        if self.pending_arrivals.fetch_sub(1, Ordering::AcqRel) == 1 {
            let follow_on = self
                .follow_on
                .lock()
                .unwrap()
                .take()
                .expect("barrier fence released twice");
            self.dispatcher.dispatch(follow_on);
        }
    }
}

/// A fixed-size pool of non-blocking worker threads plus the timekeeper.
///
/// `schedule` is legal only between `start` and `shutdown`. Routines run
/// to completion on the worker that pops them; per-object serialization is
/// obtained by binding an affinity from `next_affinity` and scheduling
/// through `schedule_to`.
///
pub struct TaskPool {
    dispatcher: Arc<Dispatcher>,
    workers: Mutex<Vec<Worker>>,
    next_affinity: AtomicUsize,
    timekeeper: Timekeeper,
    exited: Mutex<bool>,
    exit_signal: Condvar,
}

impl TaskPool {
    /// Start `worker_count` workers and the timekeeper. Rejects a zero
    /// worker count and counts beyond the hardware cores.
    ///
    pub fn start(worker_count: usize) -> io::Result<Arc<TaskPool>> {
        if worker_count == 0 || worker_count > SysConf::num_cores() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "worker count {worker_count} outside 1..={}",
                    SysConf::num_cores()
                ),
            ));
        }

        let mailboxes: Vec<Arc<RoutineQueue>> = (0..worker_count)
            .map(|_| Arc::new(RoutineQueue::new()))
            .collect();

        let dispatcher = Arc::new(Dispatcher {
            mailboxes: mailboxes.clone(),
            next_worker: AtomicUsize::new(0),
        });

        let started = Arc::new(CountdownEvent::new(worker_count));
        let workers: Vec<Worker> = mailboxes
            .iter()
            .enumerate()
            .map(|(id, mailbox)| Worker::spawn(id, mailbox.clone(), started.clone()))
            .collect();
        started.wait();

        let timekeeper = Timekeeper::start(dispatcher.clone())?;

        debug!(worker_count, "task pool started");

        Ok(Arc::new(TaskPool {
            dispatcher,
            workers: Mutex::new(workers),
            next_affinity: AtomicUsize::new(0),
            timekeeper,
            exited: Mutex::new(false),
            exit_signal: Condvar::new(),
        }))
    }

    pub fn worker_count(&self) -> usize {
        self.dispatcher.worker_count()
    }

    /// Hand out a stable worker binding for a long-lived object. All of
    /// the object's callbacks scheduled through `schedule_to` with this
    /// affinity execute single-threaded, without locks inside the object.
    ///
    pub fn next_affinity(&self) -> usize {
        self.next_affinity.fetch_add(1, Ordering::Relaxed) % self.worker_count()
    }

    /// Round-robin dispatch.
    ///
    pub fn schedule<F>(&self, kernel: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.dispatch(routine::call_routine(kernel));
    }

    /// Dispatch to the worker `affinity` is bound to. Routines scheduled
    /// to one affinity are totally ordered and never run concurrently
    /// with each other.
    ///
    pub fn schedule_to<F>(&self, affinity: usize, kernel: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            affinity < self.worker_count(),
            "affinity {affinity} out of range"
        );
        self.dispatcher
            .dispatch_to(affinity, routine::call_routine(kernel));
    }

    /// Run `kernel` once `delay` has elapsed on the monotonic clock.
    ///
    pub fn schedule_in<F>(&self, delay: Duration, kernel: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.timekeeper
            .schedule_after(delay, routine::call_routine(kernel));
    }

    /// Run `kernel` after every routine that was queued on any worker
    /// before this call has completed. This is the primitive the channel
    /// layer uses to quiesce in-flight callbacks.
    ///
    pub fn schedule_barrier<F>(&self, kernel: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let fence = Arc::new(BarrierFence {
            pending_arrivals: AtomicUsize::new(self.worker_count()),
            follow_on: Mutex::new(Some(routine::call_routine(kernel))),
            dispatcher: self.dispatcher.clone(),
        });

        for worker in 0..self.worker_count() {
            let fence = fence.clone();
            self.dispatcher
                .dispatch_to(worker, routine::call_routine(move || fence.arrive()));
        }
    }

    /// Release threads blocked in `wait` without stopping the workers.
    ///
    pub fn wakeup(&self) {
        let mut exited = self.exited.lock().unwrap();
        *exited = true;
        self.exit_signal.notify_all();
    }

    /// Stop the timekeeper, then every worker in order, then release the
    /// `wait`ers. All producers must have quiesced beforehand: worker
    /// mailboxes have to be empty and the timer set drained.
    ///
    pub fn shutdown(&self) {
        self.timekeeper.stop();

        let mut workers = self.workers.lock().unwrap();
        for worker in workers.iter_mut() {
            worker.stop();
        }
        workers.clear();
        drop(workers);

        debug!("task pool stopped");
        self.wakeup();
    }

    /// Block until `shutdown` or `wakeup` signals.
    ///
    pub fn wait(&self) {
        let mut exited = self.exited.lock().unwrap();
        while !*exited {
            exited = self.exit_signal.wait(exited).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use stingray_core::CountdownEvent;

    use super::TaskPool;

    #[test]
    fn reports_configured_worker_count() {
        let pool = TaskPool::start(1).unwrap();
        assert_eq!(1, pool.worker_count());
        pool.shutdown();
    }

    #[test]
    fn affinities_cycle_over_workers() {
        let pool = TaskPool::start(1).unwrap();
        assert_eq!(0, pool.next_affinity());
        assert_eq!(0, pool.next_affinity());
        pool.shutdown();
    }

    #[test]
    fn barrier_waits_for_queued_routines() {
        let pool = TaskPool::start(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(CountdownEvent::new(1));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        let counter_at_barrier = counter.clone();
        let done_signal = done.clone();
        pool.schedule_barrier(move || {
            assert_eq!(10, counter_at_barrier.load(Ordering::Relaxed));
            done_signal.signal();
        });

        assert!(done.wait_timeout(Duration::from_secs(5)));
        pool.shutdown();
    }
}
