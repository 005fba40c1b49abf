//! Datagram socket abstractions.
//!
//! The engine talks to its peers through [`DatagramSocket`], a minimal
//! UDP-like interface: sends are fire-and-forget, receives drain everything
//! that arrived since the last poll, and nothing is ordered or reliable. The
//! internal protocol (redundant bundles, idempotent buffers, digests) is
//! built to tolerate exactly that.
//!
//! Sockets move raw bytes; the wire codec lives in the transport layer.
//! That split keeps protocol violations (unknown tags, malformed frames)
//! visible to the session instead of being swallowed at the I/O boundary.
//!
//! Two implementations ship with the crate:
//!
//! - [`UdpDatagramSocket`] — a non-blocking UDP socket for native peers.
//! - [`MemoryPairSocket`] — an in-process pair for tests and simulations,
//!   addressed by [`ParticipantIndex`]. All of the deterministic latency and
//!   loss schedules in the test suite run over this socket, wrapped in a
//!   [`ChaosSocket`](crate::network::chaos_socket::ChaosSocket).
//!
//! Browser deployments bring their own implementation over a WebRTC data
//! channel; anything that can move small binary datagrams will do.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ParticipantIndex;

const RECV_BUFFER_SIZE: usize = 4096;

/// A packet larger than this may be fragmented, so ideally we wouldn't send
/// packets larger than this.
pub const IDEAL_MAX_DATAGRAM_SIZE: usize = 508;

/// An unreliable, unordered datagram channel.
///
/// Implementations must never block: `send_to` drops on failure, and
/// `receive_all` returns only what has already arrived.
pub trait DatagramSocket<A>
where
    A: Clone + PartialEq + Eq + Hash + Debug,
{
    /// Sends a datagram toward `addr`. Failures are logged and swallowed —
    /// the protocol treats every send as potentially lost anyway.
    fn send_to(&mut self, payload: &[u8], addr: &A);

    /// Returns all datagrams received since the last call, with their source
    /// addresses.
    fn receive_all(&mut self) -> Vec<(A, Vec<u8>)>;
}

/// A simple non-blocking UDP socket bound to `0.0.0.0:port`.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpDatagramSocket {
    /// Binds to `0.0.0.0:port` in non-blocking mode.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
        })
    }

    /// The local address this socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }
}

impl DatagramSocket<SocketAddr> for UdpDatagramSocket {
    fn send_to(&mut self, payload: &[u8], addr: &SocketAddr) {
        if payload.len() > IDEAL_MAX_DATAGRAM_SIZE {
            tracing::warn!(
                len = payload.len(),
                "datagram exceeds fragmentation-safe size"
            );
        }
        if let Err(err) = self.socket.send_to(payload, addr) {
            tracing::warn!(%addr, %err, "udp send failed; treating as packet loss");
        }
    }

    fn receive_all(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, src)) => {
                    if let Some(bytes) = self.recv_buffer.get(..len) {
                        received.push((src, bytes.to_vec()));
                    }
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::warn!(%err, "udp receive failed");
                    break;
                },
            }
        }
        received
    }
}

/// Shared queue of datagrams between two in-process endpoints.
type Mailbox = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// In-process datagram socket for tests and simulations.
///
/// A pair shares two mailboxes (one per direction). Payloads are the exact
/// bytes the wire codec produced, so tests exercise the byte layouts peers
/// see.
#[derive(Debug)]
pub struct MemoryPairSocket {
    local: ParticipantIndex,
    remote: ParticipantIndex,
    inbound: Mailbox,
    outbound: Mailbox,
}

impl MemoryPairSocket {
    /// Creates a connected pair. The first socket speaks as `a` and hears
    /// from `b`; the second the reverse.
    #[must_use]
    pub fn pair(a: ParticipantIndex, b: ParticipantIndex) -> (Self, Self) {
        let a_to_b: Mailbox = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a: Mailbox = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                local: a,
                remote: b,
                inbound: b_to_a.clone(),
                outbound: a_to_b.clone(),
            },
            Self {
                local: b,
                remote: a,
                inbound: a_to_b,
                outbound: b_to_a,
            },
        )
    }

    /// The local endpoint's address.
    #[must_use]
    pub fn local_index(&self) -> ParticipantIndex {
        self.local
    }
}

impl DatagramSocket<ParticipantIndex> for MemoryPairSocket {
    fn send_to(&mut self, payload: &[u8], addr: &ParticipantIndex) {
        if *addr != self.remote {
            tracing::warn!(%addr, "memory socket has no route; dropping");
            return;
        }
        self.outbound.lock().push_back(payload.to_vec());
    }

    fn receive_all(&mut self) -> Vec<(ParticipantIndex, Vec<u8>)> {
        let mut queued = self.inbound.lock();
        queued.drain(..).map(|bytes| (self.remote, bytes)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn memory_pair_delivers_both_directions() {
        let zero = ParticipantIndex::new(0);
        let one = ParticipantIndex::new(1);
        let (mut a, mut b) = MemoryPairSocket::pair(zero, one);

        a.send_to(&[1, 2, 3], &one);
        a.send_to(&[4], &one);
        b.send_to(&[5, 6], &zero);

        let at_b = b.receive_all();
        assert_eq!(at_b, vec![(zero, vec![1, 2, 3]), (zero, vec![4])]);

        let at_a = a.receive_all();
        assert_eq!(at_a, vec![(one, vec![5, 6])]);

        // Queues drained.
        assert!(a.receive_all().is_empty());
        assert!(b.receive_all().is_empty());
    }

    #[test]
    fn unknown_route_drops_instead_of_panicking() {
        let zero = ParticipantIndex::new(0);
        let one = ParticipantIndex::new(1);
        let (mut a, mut b) = MemoryPairSocket::pair(zero, one);
        a.send_to(&[9], &ParticipantIndex::new(9));
        assert!(b.receive_all().is_empty());
    }

    #[test]
    #[allow(clippy::ip_constant)]
    fn udp_socket_roundtrip() {
        let mut a = UdpDatagramSocket::bind_to_port(0).unwrap();
        let mut b = UdpDatagramSocket::bind_to_port(0).unwrap();
        let addr_b = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            b.local_addr().unwrap().port(),
        );

        a.send_to(&[0xDE, 0xAD], &addr_b);
        // Non-blocking: poll until the datagram lands or we give up.
        let mut received = Vec::new();
        for _ in 0..100 {
            received = b.receive_all();
            if !received.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, vec![0xDE, 0xAD]);
    }
}
