//! Platform socket driver: a thin abstraction over a non-blocking datagram
//!  socket, introduced so the manager and connections can be exercised against
//!  mocked or in-memory drivers in tests.

#[cfg(test)]
use mockall::automock;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, trace};

/// A received datagram of length zero signals an ICMP port-unreachable
///  notification for the returned address, not actual data.
#[cfg_attr(test, automock)]
pub trait SocketDriver: Send + Sync + 'static {
    /// Returns false when the datagram could not be handed to the OS.
    fn send_to(&self, to: SocketAddr, data: &[u8]) -> bool;

    /// Non-blocking: `None` means no datagram is waiting.
    fn recv_from(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)>;

    fn ttl(&self) -> u32;

    fn set_ttl(&self, ttl: u32);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Production driver over a non-blocking `UdpSocket`.
pub struct UdpSocketDriver {
    socket: UdpSocket,
    /// Best-effort attribution of ICMP errors reported through `recv_from`,
    ///  since the OS does not tell us the originating address.
    last_send_to: Mutex<Option<SocketAddr>>,
}

impl UdpSocketDriver {
    /// Binds the first free port in `port..=port + port_range` on `bind_ip`.
    pub fn bind(
        bind_ip: std::net::IpAddr,
        port: u16,
        port_range: u16,
        incoming_buffer_size: usize,
        outgoing_buffer_size: usize,
    ) -> anyhow::Result<UdpSocketDriver> {
        let domain = if bind_ip.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };

        for candidate in port..=port.saturating_add(port_range) {
            let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
                .context("creating UDP socket")?;
            socket.set_recv_buffer_size(incoming_buffer_size)?;
            socket.set_send_buffer_size(outgoing_buffer_size)?;
            socket.set_nonblocking(true)?;

            let addr = SocketAddr::new(bind_ip, candidate);
            match socket.bind(&addr.into()) {
                Ok(()) => {
                    let socket: UdpSocket = socket.into();
                    debug!("bound UDP socket to {:?}", socket.local_addr()?);
                    return Ok(UdpSocketDriver {
                        socket,
                        last_send_to: Mutex::new(None),
                    });
                }
                Err(e) if candidate < port.saturating_add(port_range) => {
                    trace!("port {} unavailable ({}), trying next", candidate, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(anyhow!("no free port in {}..={}", port, port.saturating_add(port_range)))
    }

    /// Resolves `host:port` through the system resolver, preferring the first
    ///  returned address.
    pub fn resolve(address: &str) -> anyhow::Result<SocketAddr> {
        address
            .to_socket_addrs()
            .with_context(|| format!("resolving {:?}", address))?
            .next()
            .ok_or_else(|| anyhow!("{:?} did not resolve to any address", address))
    }
}

impl SocketDriver for UdpSocketDriver {
    fn send_to(&self, to: SocketAddr, data: &[u8]) -> bool {
        *self.last_send_to.lock().unwrap_or_else(|e| e.into_inner()) = Some(to);
        match self.socket.send_to(data, to) {
            Ok(_) => true,
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                false
            }
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Some((len, from)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e)
                if e.kind() == ErrorKind::ConnectionReset
                    || e.kind() == ErrorKind::ConnectionRefused =>
            {
                // the OS reports ICMP unreachable this way; surface it as the
                //  zero-length marker datagram against the last peer we sent to
                let addr = *self.last_send_to.lock().unwrap_or_else(|e| e.into_inner());
                addr.map(|addr| (0, addr))
            }
            Err(e) => {
                error!("UDP socket receive error: {}", e);
                None
            }
        }
    }

    fn ttl(&self) -> u32 {
        self.socket.ttl().unwrap_or(64)
    }

    fn set_ttl(&self, ttl: u32) {
        if let Err(e) = self.socket.set_ttl(ttl) {
            error!("failed to set socket TTL to {}: {}", ttl, e);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_loopback_roundtrip() {
        let a = UdpSocketDriver::bind("127.0.0.1".parse().unwrap(), 0, 0, 64 * 1024, 64 * 1024).unwrap();
        let b = UdpSocketDriver::bind("127.0.0.1".parse().unwrap(), 0, 0, 64 * 1024, 64 * 1024).unwrap();

        let b_addr = b.local_addr().unwrap();
        assert!(a.send_to(b_addr, &[1, 2, 3]));

        let mut buf = [0u8; 16];
        let mut received = None;
        for _ in 0..100 {
            if let Some(r) = b.recv_from(&mut buf) {
                received = Some(r);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let (len, from) = received.expect("datagram should arrive on loopback");
        assert_eq!(len, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn test_recv_is_nonblocking() {
        let driver = UdpSocketDriver::bind("127.0.0.1".parse().unwrap(), 0, 0, 64 * 1024, 64 * 1024).unwrap();
        let mut buf = [0u8; 16];
        assert!(driver.recv_from(&mut buf).is_none());
    }

    #[test]
    fn test_ttl_roundtrip() {
        let driver = UdpSocketDriver::bind("127.0.0.1".parse().unwrap(), 0, 0, 64 * 1024, 64 * 1024).unwrap();
        let original = driver.ttl();
        driver.set_ttl(5);
        assert_eq!(driver.ttl(), 5);
        driver.set_ttl(original);
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = UdpSocketDriver::resolve("localhost:1234").unwrap();
        assert_eq!(addr.port(), 1234);
    }
}
