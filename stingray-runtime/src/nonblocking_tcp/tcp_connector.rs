use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error};

use crate::demultiplexing::{EpollSet, EventDispatch};
use crate::nonblocking_tcp::socket_address::SocketAddress;
use crate::nonblocking_tcp::tcp_channel::TcpChannel;
use crate::nonblocking_tcp::tcp_listener::ConnectHandler;
use crate::nonblocking_tcp::tcp_options::TcpOptions;
use crate::scheduling::TaskPool;

struct PendingConnect {
    socket: Socket,
    handler: Arc<dyn ConnectHandler>,
}

/// Initiates non-blocking outbound connections and produces channels.
///
pub struct TcpConnector {
    pool: Arc<TaskPool>,
    epoll: Arc<EpollSet>,
    options: TcpOptions,
    affinity: usize,
    pending: Mutex<HashMap<RawFd, PendingConnect>>,
    weak_self: Weak<TcpConnector>,
}

impl TcpConnector {
    pub fn new(
        pool: &Arc<TaskPool>,
        epoll: &Arc<EpollSet>,
        options: TcpOptions,
    ) -> Arc<TcpConnector> {
        Arc::new_cyclic(|weak_self| TcpConnector {
            pool: pool.clone(),
            epoll: epoll.clone(),
            options,
            affinity: pool.next_affinity(),
            pending: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Begin a connect to `address.remote()`; the result arrives on
    /// `handler` as a pool routine.
    ///
    pub fn connect(
        &self,
        address: SocketAddress,
        handler: Arc<dyn ConnectHandler>,
    ) -> io::Result<()> {
        let socket = Socket::new(
            Domain::for_address(address.remote()),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        self.options.apply(&socket)?;
        socket.bind(&SockAddr::from(address.local()))?;

        match socket.connect(&SockAddr::from(address.remote())) {
            // A loopback connect can complete immediately; EPOLLOUT still
            // fires and the normal completion path picks it up.
            //
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) => return Err(err),
        }

        let fd = socket.as_raw_fd();
        {
            let mut pending = self.pending.lock().unwrap();
            let inserted = pending.insert(fd, PendingConnect { socket, handler }).is_none();
            assert!(inserted, "connecting fd already pending");
        }

        let connector = self
            .weak_self
            .upgrade()
            .expect("connector reference vanished");
        let pool = self.pool.clone();
        let affinity = self.affinity;
        let dispatch: EventDispatch = Arc::new(move |events| {
            let connector = connector.clone();
            pool.schedule_to(affinity, move || connector.on_connect_ready(fd, events));
        });

        self.epoll.add(fd, libc::EPOLLOUT as u32, dispatch)?;

        debug!(fd, remote = %address.remote(), "connect issued");
        Ok(())
    }

    // Connect readiness: EPOLLOUT alone means connected, EPOLLERR means
    // failure. Either way the registration is removed before the result
    // is delivered, so the fd's lifecycle in the demultiplexer is clean.
    //
    fn on_connect_ready(self: Arc<Self>, fd: RawFd, events: u32) {
        if self.epoll.remove(fd).is_err() {
            // Shutdown got here first and owns the notification.
            return;
        }

        let Some(pending) = self.pending.lock().unwrap().remove(&fd) else {
            return;
        };

        if events & libc::EPOLLERR as u32 == 0 && events & libc::EPOLLOUT as u32 != 0 {
            debug!(fd, "connected");
            let channel =
                TcpChannel::from_socket(pending.socket, &self.pool, &self.epoll, &self.options);
            let handler = pending.handler;
            self.pool.schedule(move || handler.on_connect(0, Some(channel)));
        } else {
            error!(fd, events, "connect failed");
            let handler = pending.handler;
            self.pool.schedule(move || handler.on_connect(-1, None));
            // Dropping the pending socket closes the fd.
        }
    }

    /// Abort every in-flight connect: unregister, deliver `on_connect(-1,
    /// None)`, close.
    ///
    pub fn shutdown(&self) {
        let drained: Vec<(RawFd, PendingConnect)> =
            self.pending.lock().unwrap().drain().collect();

        for (fd, pending) in drained {
            let _ = self.epoll.remove(fd);
            let handler = pending.handler;
            self.pool.schedule(move || handler.on_connect(-1, None));
        }
    }
}
