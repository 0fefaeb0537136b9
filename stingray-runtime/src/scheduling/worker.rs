use std::sync::Arc;
use std::thread::{self, JoinHandle};

use stingray_core::CountdownEvent;
use tracing::trace;

use super::routine;
use super::routine_queue::RoutineQueue;

/// A scheduler worker: one OS thread serially draining one mailbox.
///
pub(crate) struct Worker {
    id: usize,
    mailbox: Arc<RoutineQueue>,
    join_handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread. `started` is signaled once the thread is
    /// live and about to enter its pop loop.
    ///
    pub(crate) fn spawn(
        id: usize,
        mailbox: Arc<RoutineQueue>,
        started: Arc<CountdownEvent>,
    ) -> Worker {
        let loop_mailbox = mailbox.clone();
        let join_handle = thread::Builder::new()
            .name(format!("stingray-worker-{id}"))
            .spawn(move || {
                started.signal();
                Worker::run_loop(id, &loop_mailbox);
            })
            .expect("failed to spawn worker thread");

        Worker {
            id,
            mailbox,
            join_handle: Some(join_handle),
        }
    }

    // The hot path carries no shutdown branch beyond the sentinel check.
    //
    fn run_loop(id: usize, mailbox: &RoutineQueue) {
        loop {
            let routine = mailbox.pop();
            if routine.is_exit() {
                trace!(worker = id, "worker exiting");
                return;
            }
            routine.run();
        }
    }

    /// Stop the worker. All producers must have quiesced: the mailbox has
    /// to be empty before the exit sentinel goes in, and is empty again
    /// after the join.
    ///
    pub(crate) fn stop(&mut self) {
        assert!(
            self.mailbox.is_empty(),
            "worker {} stopped with routines still queued",
            self.id
        );

        self.mailbox.push(routine::exit_routine());

        if let Some(join_handle) = self.join_handle.take() {
            join_handle.join().expect("worker thread panicked");
        }

        assert!(self.mailbox.is_empty());
    }
}
