use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{error, trace};

/// Callback invoked by the wait thread with the ready event mask for one
/// registered fd. By contract it only enqueues work into the task pool;
/// no user logic runs in the event-raising context.
///
pub type EventDispatch = Arc<dyn Fn(u32) + Send + Sync>;

const EVENT_BATCH: usize = 256;

struct Registration {
    dispatch: EventDispatch,
}

/// Edge-triggered epoll demultiplexer.
///
/// At most one registration per fd. `remove` is synchronous with respect
/// to new event delivery: dispatch runs under the same lock `remove`
/// takes, so once `remove` returns, no further routine for that fd is
/// scheduled. Routines already handed to the pool may still run; callers
/// drain those with a pool barrier.
///
pub struct EpollSet {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    registrations: Mutex<HashMap<RawFd, Registration>>,
    stop_requested: AtomicBool,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EpollSet {
    /// Create the epoll instance plus its internal wake channel and spawn
    /// the wait thread.
    ///
    pub fn start() -> io::Result<Arc<EpollSet>> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        // The wake channel only has to break epoll_wait out of its block.
        //
        let mut wake_event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut wake_event) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        let set = Arc::new(EpollSet {
            epoll_fd,
            wake_fd,
            registrations: Mutex::new(HashMap::new()),
            stop_requested: AtomicBool::new(false),
            join_handle: Mutex::new(None),
        });

        let loop_set = set.clone();
        let join_handle = thread::Builder::new()
            .name("stingray-epoll".into())
            .spawn(move || loop_set.wait_loop())?;
        *set.join_handle.lock().unwrap() = Some(join_handle);

        Ok(set)
    }

    fn wait_loop(&self) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];

        loop {
            let ready = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), EVENT_BATCH as i32, -1)
            };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "epoll_wait failed");
                return;
            }

            for event in &events[..ready as usize] {
                let fd = event.u64 as RawFd;

                if fd == self.wake_fd {
                    if self.stop_requested.load(Ordering::Acquire) {
                        return;
                    }
                    self.drain_wake_fd();
                    continue;
                }

                // Dispatch under the registration lock: this is what makes
                // `remove` a fence against new deliveries. Dispatch only
                // pushes into a pool mailbox, so the hold time is short and
                // no lock above the demultiplexer in the ordering is taken.
                //
                let registrations = self.registrations.lock().unwrap();
                if let Some(registration) = registrations.get(&fd) {
                    let events = event.events;
                    trace!(fd, events, "fd ready");
                    (registration.dispatch)(events);
                }
            }
        }
    }

    fn drain_wake_fd(&self) {
        let mut value = 0u64;
        unsafe {
            libc::read(
                self.wake_fd,
                (&mut value as *mut u64).cast(),
                mem::size_of::<u64>(),
            )
        };
    }

    /// Register interest in `interest` events for `fd`. At most one
    /// registration per fd.
    ///
    pub fn add(&self, fd: RawFd, interest: u32, dispatch: EventDispatch) -> io::Result<()> {
        let mut registrations = self.registrations.lock().unwrap();
        if registrations.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }

        let mut event = libc::epoll_event {
            events: interest,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }

        registrations.insert(fd, Registration { dispatch });
        Ok(())
    }

    /// Unregister `fd`. Once this returns, no new dispatch for the fd is
    /// made; routines already in a mailbox may still be running.
    ///
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let mut registrations = self.registrations.lock().unwrap();
        if registrations.remove(&fd).is_none() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }

        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Stop and join the wait thread. Idempotent. The descriptors close
    /// when the last reference drops.
    ///
    pub fn shutdown(&self) {
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        let wake = 1u64;
        unsafe {
            libc::write(
                self.wake_fd,
                (&wake as *const u64).cast(),
                mem::size_of::<u64>(),
            )
        };

        if let Some(join_handle) = self.join_handle.lock().unwrap().take() {
            join_handle.join().expect("epoll wait thread panicked");
        }
    }
}

impl Drop for EpollSet {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::sync::Arc;
    use std::time::Duration;

    use stingray_core::CountdownEvent;

    use super::EpollSet;

    #[test]
    fn dispatches_ready_fds_until_removed() {
        let epoll = EpollSet::start().unwrap();

        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        assert!(fd >= 0);

        let notified = Arc::new(CountdownEvent::new(1));
        let dispatch_notified = notified.clone();
        epoll
            .add(
                fd,
                (libc::EPOLLIN | libc::EPOLLET) as u32,
                Arc::new(move |events| {
                    assert!(events & libc::EPOLLIN as u32 != 0);
                    dispatch_notified.signal();
                }),
            )
            .unwrap();

        // Double registration of the same fd is refused.
        assert!(
            epoll
                .add(fd, libc::EPOLLIN as u32, Arc::new(|_: u32| {}))
                .is_err()
        );

        let value = 1u64;
        unsafe { libc::write(fd, (&value as *const u64).cast(), mem::size_of::<u64>()) };

        assert!(notified.wait_timeout(Duration::from_secs(5)));

        epoll.remove(fd).unwrap();
        assert!(epoll.remove(fd).is_err());

        epoll.shutdown();
        unsafe { libc::close(fd) };
    }
}
