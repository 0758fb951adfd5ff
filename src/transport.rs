//! Datagram transport: a thin wrapper around a non-blocking `UdpSocket` that
//!  speaks [Packet] instead of raw bytes. No protocol logic lives here.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

#[cfg(test)] use mockall::automock;
use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::protocol::Packet;

/// Interval between polls of a non-blocking receive when no datagram was
///  queued. All blocking receive loops (server listener, client receiver,
///  discovery) are built on this cadence.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// This is an abstraction for sending a packet on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing the retransmission logic.
#[cfg_attr(test, automock)]
pub trait PacketSender: Send + Sync + 'static {
    fn send_packet(&self, packet: &Packet, to: SocketAddr) -> anyhow::Result<()>;
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds to all interfaces on the given port (0 for an ephemeral port).
    pub fn bind(port: u16, enable_broadcast: bool) -> anyhow::Result<UdpTransport> {
        Self::bind_to(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port), enable_broadcast)
    }

    pub fn bind_to(addr: SocketAddrV4, enable_broadcast: bool) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        if enable_broadcast {
            socket.set_broadcast(true)?;
        }
        debug!("bound receive socket to {:?}", socket.local_addr()?);

        Ok(UdpTransport { socket })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serializes `packet` and sends it as a single datagram. This blocks only
    ///  on the kernel send buffer - it never waits for any acknowledgement.
    pub fn send_packet(&self, packet: &Packet, to: SocketAddr) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(Packet::SERIALIZED_LEN);
        packet.ser(&mut buf);
        self.socket.send_to(&buf, to)?;
        Ok(())
    }

    /// Polls for the next datagram. Returns `Ok(None)` when nothing is queued,
    ///  and also when a queued datagram was dropped because its size is not
    ///  exactly [Packet::SERIALIZED_LEN] or its payload does not decode - UDP
    ///  is lossy by contract, and there is no addressable sender to notify.
    pub fn try_recv_packet(&self) -> anyhow::Result<Option<(Packet, SocketAddr)>> {
        let mut buf = [0u8; 2 * Packet::SERIALIZED_LEN];
        match self.socket.recv_from(&mut buf) {
            Ok((num_read, from)) => {
                if num_read != Packet::SERIALIZED_LEN {
                    trace!("dropping datagram of size {} from {:?}", num_read, from);
                    return Ok(None);
                }

                let mut parse_buf = &buf[..num_read];
                match Packet::try_deser(&mut parse_buf) {
                    Ok(packet) => Ok(Some((packet, from))),
                    Err(e) => {
                        warn!("dropping undecodable datagram from {:?}: {}", from, e);
                        Ok(None)
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl PacketSender for UdpTransport {
    fn send_packet(&self, packet: &Packet, to: SocketAddr) -> anyhow::Result<()> {
        UdpTransport::send_packet(self, packet, to)
    }
}
