use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

/// Local/remote endpoint pair for an outbound connection.
///
#[derive(Clone, Copy, Debug)]
pub struct SocketAddress {
    local: SocketAddr,
    remote: SocketAddr,
}

fn resolve(hostport: &str) -> io::Result<SocketAddr> {
    hostport.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("cannot resolve {hostport}"),
        )
    })
}

impl SocketAddress {
    /// Connect to `remote`, leaving the local endpoint to the kernel.
    ///
    pub fn for_remote(remote: SocketAddr) -> SocketAddress {
        SocketAddress {
            local: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            remote,
        }
    }

    /// Parse a `"host:port"` remote endpoint.
    ///
    pub fn parse(remote: &str) -> io::Result<SocketAddress> {
        Ok(SocketAddress::for_remote(resolve(remote)?))
    }

    /// Parse an explicit `"host:port"` pair.
    ///
    pub fn parse_pair(local: &str, remote: &str) -> io::Result<SocketAddress> {
        Ok(SocketAddress {
            local: resolve(local)?,
            remote: resolve(remote)?,
        })
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}
