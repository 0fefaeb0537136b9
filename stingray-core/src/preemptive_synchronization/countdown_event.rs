use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A blocking fan-in point: `wait` returns once `signal` has been called
/// `count` times.
///
/// Used to park a preemptive thread until a known amount of work spread
/// over other threads has finished (worker startup, scheduled batches in
/// tests and benchmarks).
///
pub struct CountdownEvent {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl CountdownEvent {
    pub fn new(count: usize) -> Self {
        CountdownEvent {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    // Decrement by one. Returns true when this call released the waiters.
    // Signals past zero are ignored.
    //
    pub fn signal(&self) -> bool {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        if *remaining == 0 {
            self.zero.notify_all();
            true
        } else {
            false
        }
    }

    // Wait until the count reaches zero.
    //
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.zero.wait(remaining).unwrap();
        }
    }

    /// Bounded wait. Returns false if the count did not reach zero within
    /// `timeout`.
    ///
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let remaining = self.remaining.lock().unwrap();
        let (remaining, _) = self
            .zero
            .wait_timeout_while(remaining, timeout, |remaining| *remaining > 0)
            .unwrap();
        *remaining == 0
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::CountdownEvent;

    #[test]
    fn releases_after_count_signals() {
        let event = Arc::new(CountdownEvent::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                thread::spawn(move || {
                    event.signal();
                })
            })
            .collect();

        event.wait();
        assert_eq!(0, event.remaining());

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn extra_signals_are_ignored() {
        let event = CountdownEvent::new(1);
        assert!(event.signal());
        assert!(!event.signal());
        assert_eq!(0, event.remaining());
    }

    #[test]
    fn wait_timeout_reports_expiry() {
        let event = CountdownEvent::new(1);
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        event.signal();
        assert!(event.wait_timeout(Duration::from_millis(10)));
    }
}
