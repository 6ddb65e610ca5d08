//! Non-blocking UDP socket adapter.
//!
//! Sends retry on interrupt and fall back to `NotReady` on would-block,
//! treated as success from the protocol's perspective; zero-length sends
//! are dropped as a no-op success.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};

use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkingStack {
    Default,
}

/// Status reported by the adapter's non-blocking `send`/`recv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Ok,
    NotReady,
    Disconnected,
}

/// Non-blocking UDP socket. `send`/`recv` never block; they return
/// [`SocketStatus::NotReady`] instead.
pub struct SocketAdapter {
    protocol: Protocol,
    stack: NetworkingStack,
    socket: Option<UdpSocket>,
}

impl SocketAdapter {
    pub fn new(protocol: Protocol, stack: NetworkingStack) -> Self {
        Self { protocol, stack, socket: None }
    }

    /// Bind to `local_port` on all interfaces and switch to non-blocking
    /// mode. `local_port == 0` lets the OS pick an ephemeral port.
    pub fn bind(&mut self, local_port: u16) -> io::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))?;
        socket.set_nonblocking(true)?;
        debug!("socket bound to port {}", socket.local_addr()?.port());
        self.socket = Some(socket);
        Ok(())
    }

    /// Send `data` to `target`, retrying internally on transient failures
    /// until completion or a hard error. Zero-length sends are dropped as
    /// success without touching the socket.
    pub fn send(&self, data: &[u8], target: SocketAddr) -> SocketStatus {
        if data.is_empty() {
            return SocketStatus::Ok;
        }
        let socket = match &self.socket {
            Some(socket) => socket,
            None => return SocketStatus::Disconnected,
        };
        loop {
            match socket.send_to(data, target) {
                Ok(_) => return SocketStatus::Ok,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return SocketStatus::NotReady,
                Err(err) => {
                    warn!("socket send to {} failed: {}", target, err);
                    return SocketStatus::Disconnected;
                }
            }
        }
    }

    /// Receive at most one datagram into `buffer`, appending its bytes.
    pub fn recv(&self, buffer: &mut Vec<u8>) -> (SocketStatus, Option<SocketAddr>) {
        let socket = match &self.socket {
            Some(socket) => socket,
            None => return (SocketStatus::Disconnected, None),
        };
        let mut scratch = [0u8; super::packet::MAX_DATAGRAM_SIZE];
        match socket.recv_from(&mut scratch) {
            Ok((size, sender)) => {
                buffer.extend_from_slice(&scratch[..size]);
                (SocketStatus::Ok, Some(sender))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => (SocketStatus::NotReady, None),
            Err(err) => {
                warn!("socket recv failed: {}", err);
                (SocketStatus::Disconnected, None)
            }
        }
    }

    pub fn close(&mut self) {
        self.socket = None;
    }

    pub fn local_port(&self) -> u16 {
        self.socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn networking_stack(&self) -> NetworkingStack {
        self.stack
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_length_send_is_dropped_as_success() {
        let adapter = SocketAdapter::new(Protocol::Udp, NetworkingStack::Default);
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(adapter.send(&[], target), SocketStatus::Ok);
    }

    #[test]
    fn unbound_socket_reports_disconnected() {
        let adapter = SocketAdapter::new(Protocol::Udp, NetworkingStack::Default);
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(adapter.send(&[1, 2, 3], target), SocketStatus::Disconnected);
    }

    #[test]
    fn bound_sockets_exchange_a_datagram() {
        let mut a = SocketAdapter::new(Protocol::Udp, NetworkingStack::Default);
        let mut b = SocketAdapter::new(Protocol::Udp, NetworkingStack::Default);
        a.bind(0).unwrap();
        b.bind(0).unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port()).parse().unwrap();

        assert_eq!(a.send(b"hello", b_addr), SocketStatus::Ok);

        let mut buffer = Vec::new();
        let mut status;
        loop {
            let (s, _sender) = b.recv(&mut buffer);
            status = s;
            if status != SocketStatus::NotReady || !buffer.is_empty() {
                break;
            }
        }
        assert_eq!(status, SocketStatus::Ok);
        assert_eq!(buffer, b"hello");
    }
}
