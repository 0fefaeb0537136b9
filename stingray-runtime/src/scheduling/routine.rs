/// A heap-allocated, one-shot unit of work.
///
/// A routine is owned by exactly one mailbox from push until pop, runs
/// exactly once on the worker that pops it, and is destroyed on return
/// from `run`. The `next` link lives inside the routine allocation, so a
/// mailbox insertion allocates nothing on its own.
///
pub(crate) trait Routine: Send {
    /// Execute and consume the routine.
    ///
    fn run(self: Box<Self>);

    fn link_next(&mut self, next: Box<dyn Routine>);
    fn take_next(&mut self) -> Option<Box<dyn Routine>>;

    /// Marks the worker-loop termination sentinel.
    ///
    fn is_exit(&self) -> bool {
        false
    }
}

struct CallRoutine<F: FnOnce() + Send + 'static> {
    kernel: F,
    next: Option<Box<dyn Routine>>,
}

impl<F: FnOnce() + Send + 'static> Routine for CallRoutine<F> {
    fn run(self: Box<Self>) {
        let CallRoutine { kernel, .. } = *self;
        kernel();
    }

    fn link_next(&mut self, next: Box<dyn Routine>) {
        debug_assert!(self.next.is_none());
        self.next = Some(next);
    }

    fn take_next(&mut self) -> Option<Box<dyn Routine>> {
        self.next.take()
    }
}

/// Wrap a closure and its captured arguments into a schedulable routine.
///
pub(crate) fn call_routine<F: FnOnce() + Send + 'static>(kernel: F) -> Box<dyn Routine> {
    Box::new(CallRoutine { kernel, next: None })
}

/// The distinguished routine that terminates a worker loop. Never run;
/// the worker recognizes it and returns instead.
///
struct ExitRoutine {
    next: Option<Box<dyn Routine>>,
}

pub(crate) fn exit_routine() -> Box<dyn Routine> {
    Box::new(ExitRoutine { next: None })
}

impl Routine for ExitRoutine {
    fn run(self: Box<Self>) {}

    fn link_next(&mut self, next: Box<dyn Routine>) {
        debug_assert!(self.next.is_none());
        self.next = Some(next);
    }

    fn take_next(&mut self) -> Option<Box<dyn Routine>> {
        self.next.take()
    }

    fn is_exit(&self) -> bool {
        true
    }
}
