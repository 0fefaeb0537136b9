use std::io;

use socket2::Socket;

/// Default bound on queued-but-unwritten buffers per channel.
///
pub const DEFAULT_WRITE_BACKLOG: usize = 128;

/// Per-socket tunables shared by listeners, connectors and the channels
/// they produce.
///
#[derive(Clone, Debug)]
pub struct TcpOptions {
    /// Pending-connection queue length handed to `listen`.
    pub listen_backlog: i32,
    /// `TCP_NODELAY`; `None` leaves the kernel default.
    pub no_delay: Option<bool>,
    /// `SO_SNDBUF` in bytes; `None` leaves the kernel default.
    pub send_window: Option<usize>,
    /// `SO_RCVBUF` in bytes; `None` leaves the kernel default.
    pub recv_window: Option<usize>,
    /// Buffers a channel accepts in `enqueue_write` before reporting
    /// `EBUSY`.
    pub write_backlog: usize,
}

impl Default for TcpOptions {
    fn default() -> Self {
        TcpOptions {
            listen_backlog: 128,
            no_delay: None,
            send_window: None,
            recv_window: None,
            write_backlog: DEFAULT_WRITE_BACKLOG,
        }
    }
}

impl TcpOptions {
    pub(crate) fn apply(&self, socket: &Socket) -> io::Result<()> {
        if let Some(no_delay) = self.no_delay {
            socket.set_nodelay(no_delay)?;
        }
        if let Some(send_window) = self.send_window {
            socket.set_send_buffer_size(send_window)?;
        }
        if let Some(recv_window) = self.recv_window {
            socket.set_recv_buffer_size(recv_window)?;
        }
        Ok(())
    }
}
