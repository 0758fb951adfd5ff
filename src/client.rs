//! Client pipeline: broadcast or direct server discovery, the stdin input
//!  loop, and the stop-and-wait sender with its asynchronous reply receiver.
//!
//! Two threads: the main thread reads `<destination-ip> <value>` lines and
//!  blocks in the send routine; the receiver thread polls the socket, matches
//!  replies against the single outstanding request and wakes the sender. At
//!  most one request is ever outstanding, so an id comparison suffices to
//!  reject stale duplicates from earlier retransmissions.

use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::{error, info, trace, warn};

use crate::config::ClientConfig;
use crate::protocol::{Packet, PacketPayload, PacketType};
use crate::transport::{PacketSender, UdpTransport, RECV_POLL_INTERVAL};

/// The slot for the one request that may be outstanding at any time, shared
///  between the sender (main thread) and the receiver thread.
struct AckSlot {
    /// the unacknowledged request packet, kept for retransmission and for
    ///  reporting the outcome
    outstanding: Mutex<Option<Packet>>,
    ack_received: Condvar,
}

impl AckSlot {
    fn new() -> AckSlot {
        AckSlot {
            outstanding: Mutex::new(None),
            ack_received: Condvar::new(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Option<Packet>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, packet: Packet) {
        let mut outstanding = self.locked();
        debug_assert!(outstanding.is_none(), "a second request while one is outstanding");
        *outstanding = Some(packet);
    }

    fn clear(&self) {
        *self.locked() = None;
    }

    /// Blocks up to `timeout` for the receiver to clear the slot. True once
    ///  the ACK arrived; false means the caller should retransmit.
    fn wait_cleared(&self, timeout: Duration) -> bool {
        let outstanding = self.locked();
        if outstanding.is_none() {
            // the ACK beat us to the wait
            return true;
        }
        let (outstanding, _) = self
            .ack_received
            .wait_timeout(outstanding, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        outstanding.is_none()
    }

    /// Receiver side: if `reply` echoes the outstanding request id, clears the
    ///  slot, reports the outcome and wakes the sender. Anything else is a
    ///  stale duplicate and is dropped.
    fn complete_matching(&self, reply: &Packet, server_ip: Ipv4Addr) {
        let mut outstanding = self.locked();
        let matches = outstanding
            .as_ref()
            .is_some_and(|request| request.request_id == reply.request_id);
        if !matches {
            trace!(id = reply.request_id, "ignoring reply that matches no outstanding request");
            return;
        }

        let request = outstanding.take().expect("checked above");
        report_outcome(&request, reply, server_ip);
        self.ack_received.notify_all();
    }
}

fn report_outcome(request: &Packet, reply: &Packet, server_ip: Ipv4Addr) {
    let PacketPayload::Request { dest_ip, value } = &request.payload else {
        return;
    };
    let PacketPayload::Reply { balance } = &reply.payload else {
        return;
    };

    match reply.packet_type {
        PacketType::TransactionAck => {
            info!(
                server = %server_ip,
                id_req = request.request_id,
                dest = %dest_ip,
                value,
                new_balance = balance,
                "transfer acknowledged"
            );
        }
        PacketType::InsufficientBalanceAck => {
            warn!(dest = %dest_ip, value, balance, "insufficient balance, transfer rejected");
        }
        PacketType::InvalidClientAck => {
            warn!(dest = %dest_ip, "destination is not a registered client, transfer rejected");
        }
        PacketType::ErrorAck => {
            warn!(id_req = request.request_id, "server reported an error for this request");
        }
        _ => {}
    }
}

/// Stop-and-wait: send, block for the ACK, retransmit on timeout, forever.
struct StopAndWaitSender {
    sender: Arc<dyn PacketSender>,
    pending: Arc<AckSlot>,
    ack_timeout: Duration,
}

impl StopAndWaitSender {
    /// Returns once the receiver thread has observed the matching ACK. A send
    ///  error aborts the current transfer (the slot is cleared so the caller
    ///  can continue with the next one).
    fn send_request(&self, packet: Packet, to: SocketAddr) -> anyhow::Result<()> {
        self.pending.set(packet.clone());
        loop {
            if let Err(e) = self.sender.send_packet(&packet, to) {
                self.pending.clear();
                return Err(e);
            }
            if self.pending.wait_cleared(self.ack_timeout) {
                return Ok(());
            }
            trace!(id_req = packet.request_id, "no ACK within timeout, retransmitting");
        }
    }
}

fn receiver_loop(transport: &UdpTransport, pending: &AckSlot, server_ip: Ipv4Addr) {
    loop {
        match transport.try_recv_packet() {
            Ok(Some((reply, _))) => pending.complete_matching(&reply, server_ip),
            Ok(None) => thread::sleep(RECV_POLL_INTERVAL),
            Err(e) => {
                error!("socket error: {}", e);
                thread::sleep(RECV_POLL_INTERVAL);
            }
        }
    }
}

fn parse_transfer_line(line: &str) -> anyhow::Result<(Ipv4Addr, u32)> {
    let mut parts = line.split_whitespace();
    let dest = parts
        .next()
        .ok_or_else(|| anyhow!("expected '<destination-ip> <value>'"))?;
    let value = parts
        .next()
        .ok_or_else(|| anyhow!("expected '<destination-ip> <value>'"))?;
    if parts.next().is_some() {
        return Err(anyhow!("trailing input after '<destination-ip> <value>'"));
    }

    let dest = dest
        .parse::<Ipv4Addr>()
        .map_err(|_| anyhow!("'{}' is not an IPv4 address", dest))?;
    let value = value
        .parse::<u32>()
        .map_err(|_| anyhow!("'{}' is not a transfer value", value))?;
    Ok((dest, value))
}

pub struct Client {
    transport: Arc<UdpTransport>,
    pending: Arc<AckSlot>,
    config: ClientConfig,
    /// strictly increasing; 0 is reserved for discovery
    next_request_id: u32,
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Client> {
        let broadcast = config.server_ip.is_none();
        let transport = Arc::new(UdpTransport::bind(0, broadcast)?);
        Ok(Client {
            transport,
            pending: Arc::new(AckSlot::new()),
            config,
            next_request_id: 1,
        })
    }

    /// Discovers the server, spawns the receiver thread and then processes
    ///  stdin lines until EOF.
    pub fn run(mut self) -> anyhow::Result<()> {
        let (server, server_ip, ack) = self.discover_server();

        // the discovery ACK echoes the highest request id the server has
        //  processed for this address; continuing above it keeps a restarted
        //  client from having its first transfers swallowed as duplicates
        self.next_request_id = ack.request_id + 1;

        {
            let transport = Arc::clone(&self.transport);
            let pending = Arc::clone(&self.pending);
            thread::spawn(move || receiver_loop(&transport, &pending, server_ip));
        }

        let sender = StopAndWaitSender {
            sender: Arc::clone(&self.transport) as Arc<dyn PacketSender>,
            pending: Arc::clone(&self.pending),
            ack_timeout: self.config.ack_timeout,
        };

        for line in std::io::stdin().lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let (dest_ip, value) = match parse_transfer_line(&line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("invalid input: {}", e);
                    continue;
                }
            };

            let request_id = self.next_request_id;
            self.next_request_id += 1;
            let request = Packet::request(PacketType::TransactionRequest, request_id, dest_ip, value);
            if let Err(e) = sender.send_request(request, server) {
                warn!(id_req = request_id, "error sending transfer request: {}", e);
            }
        }
        Ok(())
    }

    /// Sends discovery probes - to the broadcast address or directly to a
    ///  known server - every ACK timeout until one is answered. There is no
    ///  give-up path and no partially discovered state.
    fn discover_server(&self) -> (SocketAddr, Ipv4Addr, Packet) {
        let target: SocketAddr = match self.config.server_ip {
            Some(ip) => (ip, self.config.server_port).into(),
            None => (Ipv4Addr::BROADCAST, self.config.server_port).into(),
        };
        let probe = Packet::discovery();
        info!("discovering server via {:?}", target);

        loop {
            if let Err(e) = self.transport.send_packet(&probe, target) {
                warn!("error sending discovery probe: {}", e);
            }

            let deadline = Instant::now() + self.config.ack_timeout;
            while Instant::now() < deadline {
                match self.transport.try_recv_packet() {
                    Ok(Some((reply, from))) => {
                        if reply.packet_type != PacketType::ClientDiscoveryAck {
                            continue;
                        }
                        if let (IpAddr::V4(server_ip), PacketPayload::Reply { balance }) =
                            (from.ip(), &reply.payload)
                        {
                            info!(server_addr = %server_ip, balance, "discovered server");
                            return (from, server_ip, reply);
                        }
                    }
                    Ok(None) => thread::sleep(RECV_POLL_INTERVAL),
                    Err(e) => {
                        warn!("socket error during discovery: {}", e);
                        thread::sleep(RECV_POLL_INTERVAL);
                    }
                }
            }
        }
    }
}
