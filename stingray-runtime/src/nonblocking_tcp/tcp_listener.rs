use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, Weak};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error, info};

use crate::demultiplexing::{EpollSet, EventDispatch};
use crate::nonblocking_tcp::tcp_channel::TcpChannel;
use crate::nonblocking_tcp::tcp_options::TcpOptions;
use crate::scheduling::TaskPool;

/// Upper-layer callback for accept/connect completion: status 0 with a
/// channel on success, -1 with `None` on failure. Always invoked as a
/// pool routine.
///
pub trait ConnectHandler: Send + Sync {
    fn on_connect(&self, status: i32, channel: Option<Arc<TcpChannel>>);
}

struct ListenerState {
    socket: Option<Socket>,
    handler: Option<Arc<dyn ConnectHandler>>,
}

/// Accepting endpoint: produces one channel per inbound connection.
///
pub struct TcpListener {
    pool: Arc<TaskPool>,
    epoll: Arc<EpollSet>,
    options: TcpOptions,
    affinity: usize,
    state: Mutex<ListenerState>,
    weak_self: Weak<TcpListener>,
}

impl TcpListener {
    pub fn new(
        pool: &Arc<TaskPool>,
        epoll: &Arc<EpollSet>,
        options: TcpOptions,
    ) -> Arc<TcpListener> {
        Arc::new_cyclic(|weak_self| TcpListener {
            pool: pool.clone(),
            epoll: epoll.clone(),
            options,
            affinity: pool.next_affinity(),
            state: Mutex::new(ListenerState {
                socket: None,
                handler: None,
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// Bind, listen and register for inbound connections. Accepted
    /// channels and accept failures are delivered to `handler`.
    ///
    pub fn listen(&self, bind_addr: SocketAddr, handler: Arc<dyn ConnectHandler>) -> io::Result<()> {
        let socket = Socket::new(Domain::for_address(bind_addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        // Window options go on the listening socket so accepted
        // connections negotiate with them from the start.
        //
        self.options.apply(&socket)?;
        socket.bind(&SockAddr::from(bind_addr))?;
        socket.listen(self.options.listen_backlog)?;

        let fd = socket.as_raw_fd();

        {
            let mut state = self.state.lock().unwrap();
            assert!(state.handler.is_none(), "listener is already listening");
            state.socket = Some(socket);
            state.handler = Some(handler);
        }

        let listener = self
            .weak_self
            .upgrade()
            .expect("listener reference vanished");
        let pool = self.pool.clone();
        let affinity = self.affinity;
        let dispatch: EventDispatch = Arc::new(move |events| {
            let listener = listener.clone();
            pool.schedule_to(affinity, move || listener.on_accept_ready(events));
        });

        self.epoll
            .add(fd, (libc::EPOLLIN | libc::EPOLLET) as u32, dispatch)?;

        info!(%bind_addr, "tcp listener started");
        Ok(())
    }

    /// Bound address, useful after listening on port 0.
    ///
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let state = self.state.lock().unwrap();
        let socket = state.socket.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "listener is not listening")
        })?;
        socket.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "listener address is not inet")
        })
    }

    // Edge-triggered accept: drain the pending backlog until the kernel
    // runs out of connections, constructing a channel per accepted fd.
    //
    fn on_accept_ready(self: Arc<Self>, _events: u32) {
        let state = self.state.lock().unwrap();
        let Some(socket) = state.socket.as_ref() else {
            // Raced with shutdown.
            return;
        };
        let handler = state.handler.clone().expect("listening without a handler");

        loop {
            match socket.accept() {
                Ok((accepted, _peer)) => {
                    if let Err(err) = accepted
                        .set_nonblocking(true)
                        .and_then(|_| self.options.apply(&accepted))
                    {
                        error!(%err, "accepted socket setup failed");
                        let handler = handler.clone();
                        self.pool.schedule(move || handler.on_connect(-1, None));
                        continue;
                    }

                    debug!(fd = accepted.as_raw_fd(), "accepted connection");
                    let channel =
                        TcpChannel::from_socket(accepted, &self.pool, &self.epoll, &self.options);
                    let handler = handler.clone();
                    self.pool
                        .schedule(move || handler.on_connect(0, Some(channel)));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    // Notify the failure and keep listening.
                    //
                    error!(%err, "accept failed");
                    let handler = handler.clone();
                    self.pool.schedule(move || handler.on_connect(-1, None));
                    break;
                }
            }
        }
    }

    /// Stop accepting: unregister from the demultiplexer so no new
    /// connections are delivered, detach the handler, close the socket.
    ///
    pub fn shutdown(&self) -> io::Result<()> {
        let fd = {
            let state = self.state.lock().unwrap();
            let socket = state.socket.as_ref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "listener is not listening")
            })?;
            socket.as_raw_fd()
        };

        self.epoll.remove(fd)?;

        let socket = {
            let mut state = self.state.lock().unwrap();
            state.handler = None;
            state.socket.take().expect("listener socket vanished")
        };

        let _ = socket.shutdown(std::net::Shutdown::Both);
        info!("tcp listener stopped");
        Ok(())
    }
}
