//! UDP socket plumbing for the media session.
//!
//! [`bind_udp`] creates a socket tuned for bursty video (large kernel
//! buffers, short read timeout). [`SessionSocket`] wraps the live socket
//! together with the peer address so a reconnect can hot-swap both while
//! the receive thread keeps running.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, info};

use crate::error::StreamError;

/// Kernel buffer size requested for both directions.
pub const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Default blocking-read timeout of the receive thread.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Bind a UDP socket on `local` with enlarged buffers and `read_timeout`.
pub fn bind_udp(local: SocketAddr, read_timeout: Duration) -> Result<UdpSocket, StreamError> {
    let domain = if local.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&local.into())?;
    let socket: UdpSocket = socket.into();
    tune(&socket, read_timeout)?;
    Ok(socket)
}

/// Apply buffer sizes and the read timeout to an externally created socket.
///
/// Buffer sizing is best-effort: kernels clamp the request silently.
pub fn tune(socket: &UdpSocket, read_timeout: Duration) -> Result<(), StreamError> {
    let sock = SockRef::from(socket);
    let _ = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE);
    socket.set_read_timeout(Some(read_timeout))?;
    Ok(())
}

// ── SessionSocket ────────────────────────────────────────────────

struct Endpoint {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

/// The session's current socket and peer, swappable at runtime.
pub struct SessionSocket {
    endpoint: RwLock<Endpoint>,
    generation: AtomicU64,
    read_timeout: Duration,
}

impl SessionSocket {
    /// Take ownership of a connected/bound socket that talks to `peer`.
    pub fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        read_timeout: Duration,
    ) -> Result<Self, StreamError> {
        tune(&socket, read_timeout)?;
        Ok(Self {
            endpoint: RwLock::new(Endpoint {
                socket: Arc::new(socket),
                peer,
            }),
            generation: AtomicU64::new(0),
            read_timeout,
        })
    }

    /// Send one datagram to the current peer.
    pub fn send(&self, datagram: &[u8]) -> Result<usize, StreamError> {
        let (socket, peer) = {
            let ep = self.endpoint.read();
            (Arc::clone(&ep.socket), ep.peer)
        };
        Ok(socket.send_to(datagram, peer)?)
    }

    /// Block up to the read timeout for a datagram from the current peer.
    ///
    /// Returns `Ok(None)` on timeout and for datagrams from other sources.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>, StreamError> {
        let (socket, peer) = {
            let ep = self.endpoint.read();
            (Arc::clone(&ep.socket), ep.peer)
        };
        match socket.recv_from(buf) {
            Ok((len, from)) if from == peer => Ok(Some(len)),
            Ok((_, from)) => {
                debug!(%from, %peer, "ignoring datagram from unexpected source");
                Ok(None)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the socket and peer; in-flight reads on the old socket
    /// finish within one read timeout.
    pub fn swap(&self, socket: UdpSocket, peer: SocketAddr) -> Result<(), StreamError> {
        tune(&socket, self.read_timeout)?;
        let local = socket.local_addr().ok();
        *self.endpoint.write() = Endpoint {
            socket: Arc::new(socket),
            peer,
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(?local, %peer, generation, "session socket swapped");
        Ok(())
    }

    pub fn peer(&self) -> SocketAddr {
        self.endpoint.read().peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        Ok(self.endpoint.read().socket.local_addr()?)
    }

    /// Number of swaps performed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> UdpSocket {
        bind_udp("127.0.0.1:0".parse().unwrap(), Duration::from_millis(20)).unwrap()
    }

    #[test]
    fn send_and_receive_from_peer() {
        let a = loopback();
        let b = loopback();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let sa = SessionSocket::new(a, b_addr, Duration::from_millis(20)).unwrap();
        let sb = SessionSocket::new(b, a_addr, Duration::from_millis(200)).unwrap();

        sa.send(b"hello").unwrap();
        let mut buf = [0u8; 64];
        let len = sb.recv(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"hello");
    }

    #[test]
    fn recv_times_out_with_none() {
        let a = loopback();
        let peer = "127.0.0.1:9".parse().unwrap();
        let s = SessionSocket::new(a, peer, Duration::from_millis(10)).unwrap();
        let mut buf = [0u8; 16];
        assert!(s.recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn foreign_datagrams_are_ignored() {
        let a = loopback();
        let stranger = loopback();
        let expected_peer = "127.0.0.1:9".parse().unwrap();
        let a_addr = a.local_addr().unwrap();
        let s = SessionSocket::new(a, expected_peer, Duration::from_millis(200)).unwrap();

        stranger.send_to(b"nope", a_addr).unwrap();
        let mut buf = [0u8; 16];
        assert!(s.recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn swap_replaces_socket_and_peer() {
        let a = loopback();
        let peer1 = loopback();
        let peer2 = loopback();
        let s = SessionSocket::new(a, peer1.local_addr().unwrap(), Duration::from_millis(20))
            .unwrap();

        let replacement = loopback();
        let new_local = replacement.local_addr().unwrap();
        s.swap(replacement, peer2.local_addr().unwrap()).unwrap();
        assert_eq!(s.generation(), 1);
        assert_eq!(s.local_addr().unwrap(), new_local);

        s.send(b"x").unwrap();
        peer2.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut buf = [0u8; 4];
        let (len, from) = peer2.recv_from(&mut buf).unwrap();
        assert_eq!(len, 1);
        assert_eq!(from, new_local);
    }
}
