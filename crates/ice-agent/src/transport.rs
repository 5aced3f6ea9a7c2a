//! Dual-stack non-blocking UDP transport with port-range binding (spec §4.4).

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::Lazy;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::IceError;

const RECV_SEND_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// Process-wide port counter (spec §5 "Shared resources"): a single
/// `once_cell::sync::Lazy<AtomicU32>`, seeded with a random value so repeated
/// runs of the same process don't all start from the same port.
static PORT_COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(rand::random()));

fn next_port_in_range(begin: u16, end: u16) -> u16 {
    let span = u32::from(end).saturating_sub(u32::from(begin)) + 1;
    let offset = PORT_COUNTER.fetch_add(1, Ordering::Relaxed) % span;
    begin + offset as u16
}

/// Where to bind, and from what port range. `(0, 0)` means ephemeral.
#[derive(Debug, Clone, Copy)]
pub struct BindConfig {
    pub bind_address: Option<IpAddr>,
    pub port_range: (u16, u16),
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            port_range: (0, 0),
        }
    }
}

/// One bound, non-blocking UDP socket.
pub struct UdpTransport {
    socket: mio::net::UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub fn bind(config: BindConfig) -> Result<Self, IceError> {
        let addr = config
            .bind_address
            .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));

        let domain = match addr {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(RECV_SEND_BUFFER_BYTES)?;
        socket.set_send_buffer_size(RECV_SEND_BUFFER_BYTES)?;

        if matches!(addr, IpAddr::V6(v6) if v6.is_unspecified()) {
            // Dual-stack: accept v4-mapped connections on the v6 wildcard socket.
            let _ = socket.set_only_v6(false);
        }

        let (begin, end) = config.port_range;
        let bound = if begin == 0 && end == 0 {
            socket.bind(&SocketAddr::new(addr, 0).into())?;
            true
        } else {
            let mut bound = false;
            for _ in begin..=end {
                let port = next_port_in_range(begin, end);
                match socket.bind(&SocketAddr::new(addr, port).into()) {
                    Ok(()) => {
                        bound = true;
                        break;
                    }
                    Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            bound
        };

        if !bound {
            return Err(IceError::SocketError(io::Error::new(
                io::ErrorKind::AddrInUse,
                "port range exhausted",
            )));
        }

        let local_addr = socket.local_addr()?.as_socket().ok_or_else(|| {
            IceError::Internal("bound socket has no local socket address".into())
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = mio::net::UdpSocket::from_std(std_socket);

        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    pub fn mio_socket(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.socket
    }
}
