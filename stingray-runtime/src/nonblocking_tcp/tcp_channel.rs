use std::collections::VecDeque;
use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, error, trace};

use crate::demultiplexing::{EpollSet, EventDispatch};
use crate::nonblocking_tcp::tcp_options::TcpOptions;
use crate::scheduling::TaskPool;

// Upper bound on buffers handed to one writev call (kernel IOV_MAX).
//
const WRITEV_BATCH: usize = 1024;

/// Per-read completion: `(channel, status, buffer)`. Status is the byte
/// count on success, -1 on error (the buffer is then empty and the
/// channel is tainted).
///
pub type ReadDoneFn = Box<dyn FnOnce(&Arc<TcpChannel>, isize, BytesMut) + Send>;

/// Unregister completion, invoked exactly once with status 0.
///
pub type UnregisterDoneFn = Box<dyn FnOnce(i32) + Send>;

/// Upper-layer consumer of a channel's write completions.
///
/// `on_write_done` fires once per fully flushed buffer with that buffer's
/// byte size, or once with -1 on a write error. Callbacks run with the
/// channel lock held, on the channel's affinity worker or on the thread
/// whose `enqueue_write` progressed the drain; the handler must not call
/// back into the channel from inside the callback.
///
pub trait ChannelClient: Send + Sync {
    fn on_write_done(&self, channel: &Arc<TcpChannel>, status: isize);
}

struct ReadCtx {
    buffer: BytesMut,
    /// Buffer size the read completes at, fixed when the read is installed.
    target: usize,
    read_done: ReadDoneFn,
}

struct ClientBinding {
    handler: Arc<dyn ChannelClient>,
    unregister_done: Option<UnregisterDoneFn>,
}

/// A queued buffer plus its size as enqueued; partial writes advance
/// `data` but write-done reports `size`.
///
struct PendingWrite {
    data: Bytes,
    size: usize,
}

struct ChannelState {
    write_backlog: VecDeque<PendingWrite>,
    read_ctx: Option<ReadCtx>,
    client: Option<ClientBinding>,
}

/// A bidirectional, non-blocking byte stream bound to one socket.
///
/// All operations are non-blocking; completions arrive as routines on the
/// channel's affinity worker. Errors are reported once, after which the
/// channel is tainted and the upper layer is expected to unregister and
/// close.
///
pub struct TcpChannel {
    fd: RawFd,
    affinity: usize,
    max_backlog: usize,
    pool: Arc<TaskPool>,
    epoll: Arc<EpollSet>,
    state: Mutex<ChannelState>,
    closed: AtomicBool,
    weak_self: Weak<TcpChannel>,
}

impl TcpChannel {
    pub(crate) fn from_socket(
        socket: socket2::Socket,
        pool: &Arc<TaskPool>,
        epoll: &Arc<EpollSet>,
        options: &TcpOptions,
    ) -> Arc<TcpChannel> {
        let fd = socket.into_raw_fd();

        Arc::new_cyclic(|weak_self| TcpChannel {
            fd,
            affinity: pool.next_affinity(),
            max_backlog: options.write_backlog,
            pool: pool.clone(),
            epoll: epoll.clone(),
            state: Mutex::new(ChannelState {
                write_backlog: VecDeque::new(),
                read_ctx: None,
                client: None,
            }),
            closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    fn strong_self(&self) -> Arc<TcpChannel> {
        // The caller reached this method through a live Arc.
        self.weak_self.upgrade().expect("channel reference vanished")
    }

    /// Attach the upper layer and register the socket with the
    /// demultiplexer. One client at a time.
    ///
    pub fn register_client(&self, handler: Arc<dyn ChannelClient>) {
        {
            let mut state = self.state.lock().unwrap();
            assert!(
                state.client.is_none(),
                "channel already has a registered client"
            );
            state.client = Some(ClientBinding {
                handler,
                unregister_done: None,
            });
        }

        let channel = self.strong_self();
        let pool = self.pool.clone();
        let affinity = self.affinity;
        let dispatch: EventDispatch = Arc::new(move |events| {
            let channel = channel.clone();
            pool.schedule_to(affinity, move || channel.on_fd_event(events));
        });

        let interest = (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32;
        self.epoll
            .add(self.fd, interest, dispatch)
            .expect("channel epoll registration failed");
    }

    /// Detach the upper layer: stop new event deliveries synchronously,
    /// drain routines already in flight with a pool barrier, then deliver
    /// `on_done(0)` exactly once.
    ///
    pub fn unregister_client(&self, on_done: UnregisterDoneFn) {
        {
            let mut state = self.state.lock().unwrap();
            let client = state
                .client
                .as_mut()
                .expect("unregister without a registered client");
            assert!(
                client.unregister_done.is_none(),
                "channel unregistered twice"
            );
            client.unregister_done = Some(on_done);
        }

        self.epoll
            .remove(self.fd)
            .expect("channel epoll removal failed");

        let channel = self.strong_self();
        self.pool.schedule_barrier(move || channel.barrier_done());
    }

    fn barrier_done(self: Arc<Self>) {
        // Every event routine queued ahead of the barrier has drained and
        // the demultiplexer delivers nothing new: no further code touches
        // this channel.
        //
        let client = {
            let mut state = self.state.lock().unwrap();
            state.write_backlog.clear();
            state.read_ctx = None;
            state
                .client
                .take()
                .expect("unregister barrier without a detaching client")
        };

        let on_done = client
            .unregister_done
            .expect("unregister barrier without a completion callback");
        on_done(0);
    }

    /// Queue `data` for writing.
    ///
    /// Rejects with `EBUSY` when the backlog is at capacity. When the
    /// backlog was empty, drains synchronously and returns the bytes
    /// written (no callbacks on this path); otherwise queues and returns
    /// 0, and each buffer is reported through `on_write_done` as the
    /// asynchronous drain flushes it.
    ///
    pub fn enqueue_write(&self, data: Bytes) -> io::Result<usize> {
        assert!(!data.is_empty(), "enqueue of an empty buffer");

        let mut state = self.state.lock().unwrap();

        if state.write_backlog.len() >= self.max_backlog {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }

        let was_empty = state.write_backlog.is_empty();
        state.write_backlog.push_back(PendingWrite {
            size: data.len(),
            data,
        });

        if was_empty {
            self.drain_writes(&mut state, false)
        } else {
            // Asynchronous context: errors and completions went through
            // the client callbacks already.
            //
            let _ = self.drain_writes(&mut state, true);
            Ok(0)
        }
    }

    /// Install the single in-flight read and drain synchronously.
    ///
    /// Returns the filled buffer when the read completed inline (the
    /// completion callback is then dropped unused); `None` when the
    /// completion will arrive asynchronously. The read completes once the
    /// buffer is filled to its capacity, possibly across several
    /// readiness wake-ups. A second read while one is pending is a fatal
    /// contract violation.
    ///
    pub fn read(&self, buffer: BytesMut, on_done: ReadDoneFn) -> Option<BytesMut> {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.read_ctx.is_none(),
            "channel already has a read in flight"
        );
        assert!(buffer.capacity() > 0, "read buffer has no capacity");
        assert!(buffer.is_empty(), "read buffer must start empty");

        state.read_ctx = Some(ReadCtx {
            target: buffer.capacity(),
            buffer,
            read_done: on_done,
        });

        self.drain_reads(&mut state, false)
    }

    /// Tear the socket down. The client must already be detached; double
    /// close is a fatal contract violation.
    ///
    pub fn close(&self) {
        assert!(
            self.state.lock().unwrap().client.is_none(),
            "channel closed with a registered client"
        );
        assert!(
            !self.closed.swap(true, Ordering::AcqRel),
            "channel closed twice"
        );

        debug!(fd = self.fd, "closing channel");
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
            libc::close(self.fd);
        }
    }

    // Readiness handler. Always executed as a pool routine on this
    // channel's affinity worker, never in the epoll thread's context.
    //
    fn on_fd_event(self: Arc<Self>, events: u32) {
        trace!(fd = self.fd, events, "channel event");

        let mut state = self.state.lock().unwrap();

        if events & libc::EPOLLIN as u32 != 0 {
            self.drain_reads(&mut state, true);
        }

        if events & libc::EPOLLOUT as u32 != 0 {
            let _ = self.drain_writes(&mut state, true);
        }
    }

    // Edge-triggered read loop: drain until the buffer is full, the
    // kernel runs out of bytes, or an error surfaces. A zero-byte read
    // means "nothing more right now", not EOF.
    //
    fn drain_reads(&self, state: &mut ChannelState, async_ctx: bool) -> Option<BytesMut> {
        loop {
            let Some(ctx) = state.read_ctx.as_mut() else {
                return None;
            };

            debug_assert!(ctx.buffer.len() < ctx.target);
            let wanted = ctx.target - ctx.buffer.len();

            let spare = ctx.buffer.spare_capacity_mut();
            let wanted = wanted.min(spare.len());
            let status = unsafe { libc::read(self.fd, spare.as_mut_ptr().cast(), wanted) };

            if status < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return None;
                }

                error!(fd = self.fd, %err, "channel read failed");
                let ctx = state.read_ctx.take().unwrap();
                (ctx.read_done)(&self.strong_self(), -1, BytesMut::new());
                return None;
            }

            if status == 0 {
                return None;
            }

            // SAFETY: the kernel initialized `status` bytes of the spare
            // capacity, and `status <= wanted <= spare.len()`.
            unsafe { ctx.buffer.set_len(ctx.buffer.len() + status as usize) };

            if ctx.buffer.len() == ctx.target {
                let ctx = state.read_ctx.take().unwrap();
                if async_ctx {
                    let filled = ctx.buffer.len() as isize;
                    (ctx.read_done)(&self.strong_self(), filled, ctx.buffer);
                    return None;
                }
                return Some(ctx.buffer);
            }
        }
    }

    // Gather-write drain: writev over the front of the backlog, trim by
    // what the kernel accepted, report each fully flushed buffer in the
    // asynchronous context.
    //
    fn drain_writes(&self, state: &mut ChannelState, async_ctx: bool) -> io::Result<usize> {
        let mut total_written = 0usize;

        loop {
            if state.write_backlog.is_empty() {
                break;
            }

            let mut iovecs: Vec<libc::iovec> =
                Vec::with_capacity(state.write_backlog.len().min(WRITEV_BATCH));
            for pending in state.write_backlog.iter().take(WRITEV_BATCH) {
                iovecs.push(libc::iovec {
                    iov_base: pending.data.as_ptr() as *mut libc::c_void,
                    iov_len: pending.data.len(),
                });
            }

            let status =
                unsafe { libc::writev(self.fd, iovecs.as_ptr(), iovecs.len() as libc::c_int) };

            if status < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }

                error!(fd = self.fd, %err, "channel write failed");
                if async_ctx && let Some(client) = state.client.as_ref() {
                    let handler = client.handler.clone();
                    handler.on_write_done(&self.strong_self(), -1);
                }
                return Err(err);
            }

            if status == 0 {
                break;
            }

            total_written += status as usize;

            // Trim the backlog by what the kernel took.
            //
            let mut accepted = status as usize;
            while accepted > 0 {
                let front = state
                    .write_backlog
                    .front_mut()
                    .expect("writev returned more than was queued");

                if accepted >= front.data.len() {
                    let flushed = state.write_backlog.pop_front().unwrap();
                    accepted -= flushed.data.len();
                    if async_ctx && let Some(client) = state.client.as_ref() {
                        let handler = client.handler.clone();
                        handler.on_write_done(&self.strong_self(), flushed.size as isize);
                    }
                } else {
                    front.data.advance(accepted);
                    accepted = 0;
                }
            }
        }

        Ok(total_written)
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe { libc::close(self.fd) };
        }
    }
}
