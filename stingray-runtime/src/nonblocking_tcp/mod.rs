pub mod socket_address;
pub mod tcp_channel;
pub mod tcp_connector;
pub mod tcp_listener;
pub mod tcp_options;

pub use socket_address::SocketAddress;
pub use tcp_channel::{ChannelClient, ReadDoneFn, TcpChannel, UnregisterDoneFn};
pub use tcp_connector::TcpConnector;
pub use tcp_listener::{ConnectHandler, TcpListener};
pub use tcp_options::{DEFAULT_WRITE_BACKLOG, TcpOptions};
