#![allow(dead_code)]

//! Building blocks for event-driven network services on Linux: a
//! non-blocking task scheduler, an edge-triggered epoll demultiplexer and
//! an asynchronous TCP channel layer on top of both.

pub mod demultiplexing;
pub mod nonblocking_tcp;
pub mod scheduling;

// Re-export the handful of types almost every consumer needs.
pub use demultiplexing::{EpollSet, EventDispatch};
pub use nonblocking_tcp::{
    ChannelClient, ConnectHandler, ReadDoneFn, SocketAddress, TcpChannel, TcpConnector,
    TcpListener, TcpOptions, UnregisterDoneFn,
};
pub use scheduling::TaskPool;
