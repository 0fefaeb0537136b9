use std::cmp::Ordering as CmpOrdering;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use binary_heap_plus::{BinaryHeap, MinComparator};
use tracing::{error, trace};

use super::routine::Routine;
use super::task_pool::Dispatcher;

/// A routine armed to run at a monotonic deadline.
///
struct TimerEvent {
    deadline: Duration,
    routine: Box<dyn Routine>,
}

impl Ord for TimerEvent {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline.cmp(&other.deadline)
    }
}

impl PartialOrd for TimerEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Eq for TimerEvent {}

impl PartialEq for TimerEvent {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

type TimerHeap = BinaryHeap<TimerEvent, MinComparator>;

/// Current CLOCK_MONOTONIC reading.
///
fn monotonic_now() -> Duration {
    let mut now: libc::timespec = unsafe { mem::zeroed() };
    // SAFETY: CLOCK_MONOTONIC with a valid out-pointer cannot fail.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    Duration::new(now.tv_sec as u64, now.tv_nsec as u32)
}

// Arm the fd to fire at an absolute monotonic deadline. A deadline in the
// past fires immediately. A zero it_value would disarm instead, hence the
// one-nanosecond floor.
//
fn arm(timer_fd: libc::c_int, deadline: Duration) {
    let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
    spec.it_value.tv_sec = deadline.as_secs() as libc::time_t;
    spec.it_value.tv_nsec = deadline.subsec_nanos() as libc::c_long;
    if spec.it_value.tv_sec == 0 && spec.it_value.tv_nsec == 0 {
        spec.it_value.tv_nsec = 1;
    }

    let status = unsafe {
        libc::timerfd_settime(timer_fd, libc::TFD_TIMER_ABSTIME, &spec, ptr::null_mut())
    };
    if status < 0 {
        error!(err = %io::Error::last_os_error(), "timerfd_settime failed");
    }
}

fn disarm(timer_fd: libc::c_int) {
    let spec: libc::itimerspec = unsafe { mem::zeroed() };
    unsafe { libc::timerfd_settime(timer_fd, 0, &spec, ptr::null_mut()) };
}

/// The auxiliary thread owning the monotonic timer fd. It blocks in
/// `read(timerfd)`, pops all due events on each expiry and hands their
/// routines to pool dispatch, then re-arms the fd to the new earliest
/// deadline (or leaves it disarmed when the set is empty).
///
pub(crate) struct Timekeeper {
    timer_fd: libc::c_int,
    pending: Arc<spin::Mutex<TimerHeap>>,
    stop_requested: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timekeeper {
    pub(crate) fn start(dispatcher: Arc<Dispatcher>) -> io::Result<Timekeeper> {
        let timer_fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC) };
        if timer_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let pending = Arc::new(spin::Mutex::new(TimerHeap::new_min()));
        let stop_requested = Arc::new(AtomicBool::new(false));

        let loop_pending = pending.clone();
        let loop_stop = stop_requested.clone();
        let join_handle = thread::Builder::new()
            .name("stingray-timekeeper".into())
            .spawn(move || Timekeeper::run_loop(timer_fd, &loop_pending, &loop_stop, &dispatcher))?;

        Ok(Timekeeper {
            timer_fd,
            pending,
            stop_requested,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    fn run_loop(
        timer_fd: libc::c_int,
        pending: &spin::Mutex<TimerHeap>,
        stop_requested: &AtomicBool,
        dispatcher: &Dispatcher,
    ) {
        loop {
            let mut expirations = 0u64;
            let status = unsafe {
                libc::read(
                    timer_fd,
                    (&mut expirations as *mut u64).cast(),
                    mem::size_of::<u64>(),
                )
            };
            if status < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "timerfd read failed");
                return;
            }

            if stop_requested.load(Ordering::Acquire) {
                return;
            }

            let now = monotonic_now();
            let mut due: Vec<Box<dyn Routine>> = Vec::new();
            {
                let mut pending = pending.lock();
                while pending.peek().is_some_and(|event| event.deadline <= now) {
                    due.push(pending.pop().unwrap().routine);
                }
                match pending.peek() {
                    Some(event) => arm(timer_fd, event.deadline),
                    None => disarm(timer_fd),
                }
            }

            trace!(count = due.len(), "timer expiry");
            for routine in due {
                dispatcher.dispatch(routine);
            }
        }
    }

    /// Insert `{now + delay, routine}`, re-arming the fd only when the
    /// insertion changed the minimum deadline.
    ///
    pub(crate) fn schedule_after(&self, delay: Duration, routine: Box<dyn Routine>) {
        let deadline = monotonic_now() + delay;

        let mut pending = self.pending.lock();
        let new_minimum = pending
            .peek()
            .is_none_or(|event| deadline < event.deadline);
        pending.push(TimerEvent { deadline, routine });
        if new_minimum {
            arm(self.timer_fd, deadline);
        }
    }

    /// Stop and join the timer thread. The timer set must already be
    /// drained: there is no cancellation, callers may not race shutdown
    /// against pending timers.
    ///
    pub(crate) fn stop(&self) {
        assert!(
            self.pending.lock().is_empty(),
            "timekeeper stopped with timers pending"
        );

        self.stop_requested.store(true, Ordering::Release);
        arm(self.timer_fd, monotonic_now());

        if let Some(join_handle) = self.join_handle.lock().unwrap().take() {
            join_handle.join().expect("timekeeper thread panicked");
        }
    }
}

impl Drop for Timekeeper {
    fn drop(&mut self) {
        // Safety net for a pool dropped without shutdown.
        //
        if self.join_handle.lock().unwrap().is_some() {
            self.stop_requested.store(true, Ordering::Release);
            arm(self.timer_fd, monotonic_now());
            if let Some(join_handle) = self.join_handle.lock().unwrap().take() {
                let _ = join_handle.join();
            }
        }
        unsafe { libc::close(self.timer_fd) };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{TimerEvent, monotonic_now};
    use crate::scheduling::routine::call_routine;

    #[test]
    fn monotonic_clock_advances() {
        let first = monotonic_now();
        let second = monotonic_now();
        assert!(second >= first);
    }

    #[test]
    fn timer_events_order_by_deadline() {
        let early = TimerEvent {
            deadline: Duration::from_millis(1),
            routine: call_routine(|| {}),
        };
        let late = TimerEvent {
            deadline: Duration::from_millis(2),
            routine: call_routine(|| {}),
        };
        assert!(early < late);
    }
}
