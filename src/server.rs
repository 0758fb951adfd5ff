//! Server pipeline: a listen loop that spawns one worker thread per datagram,
//!  the discovery and transaction handlers, and the global bank statistics.
//!
//! The listen thread never performs business logic and never holds a lock, so
//!  packet intake is never blocked by a slow transaction. All balance state
//!  lives in a [LockedMap] keyed by the client's source IP; the statistics are
//!  a single value behind one mutex so that a logged snapshot is always
//!  internally consistent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::locked_map::{LockedMap, PairValues};
use crate::protocol::{Packet, PacketPayload, PacketType, DISCOVERY_REQUEST_ID};
use crate::transport::{UdpTransport, RECV_POLL_INTERVAL};

/// Per-client state, created lazily on first discovery and never destroyed
///  during the server's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    /// 0 until the first non-discovery request from this client is observed;
    ///  monotonically non-decreasing afterwards
    pub last_processed_request_id: u32,
    pub balance: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BankStats {
    /// successfully applied non-duplicate, non-zero, non-self transfers
    pub num_transactions: u64,
    /// sum of applied transfer amounts
    pub total_transferred: u64,
    /// sum of all client balances; equals registered clients x initial balance
    ///  at every observation point
    pub total_balance: u64,
}

pub struct Server {
    transport: UdpTransport,
    clients: LockedMap<Ipv4Addr, ClientRecord>,
    stats: Mutex<BankStats>,
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> anyhow::Result<Server> {
        let transport = UdpTransport::bind(config.port, false)?;
        Ok(Server {
            transport,
            clients: LockedMap::new(),
            stats: Mutex::new(BankStats::default()),
            config,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn stats_snapshot(&self) -> BankStats {
        self.stats_locked().clone()
    }

    pub fn registered_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn client_record(&self, client: &Ipv4Addr) -> Option<ClientRecord> {
        self.clients.read(client)
    }

    /// The listen loop. Blocks on receive and spawns a fresh worker for every
    ///  well-formed datagram; runs until the process exits.
    pub fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!("serving on {:?}", self.local_addr()?);
        self.log_bank_state();

        loop {
            match self.transport.try_recv_packet() {
                Ok(Some((packet, sender))) => {
                    let server = Arc::clone(&self);
                    thread::spawn(move || server.process(packet, sender));
                }
                Ok(None) => thread::sleep(RECV_POLL_INTERVAL),
                Err(e) => {
                    error!("socket error: {}", e);
                    thread::sleep(RECV_POLL_INTERVAL);
                }
            }
        }
    }

    fn process(&self, packet: Packet, sender: SocketAddr) {
        if let Some(reply) = self.handle_packet(&packet, sender) {
            if let Err(e) = self.transport.send_packet(&reply, sender) {
                warn!("error sending reply to {:?}: {}", sender, e);
            }
        }
    }

    /// Dispatches one datagram and returns the reply to send back, if any.
    pub fn handle_packet(&self, packet: &Packet, sender: SocketAddr) -> Option<Packet> {
        let src = match sender.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                debug!("ignoring datagram from IPv6 sender {:?}", sender);
                return None;
            }
        };

        match (packet.packet_type, &packet.payload) {
            (PacketType::ClientDiscovery, _) => Some(self.handle_discovery(src)),
            (PacketType::TransactionRequest, PacketPayload::Request { dest_ip, value }) => {
                self.handle_transaction(src, packet.request_id, *dest_ip, *value)
            }
            _ => {
                trace!("ignoring packet of type {:?} from {:?}", packet.packet_type, sender);
                None
            }
        }
    }

    /// Idempotent: repeated discoveries never mutate balance or request id
    ///  state.
    fn handle_discovery(&self, src: Ipv4Addr) -> Packet {
        let created = self.clients.insert(
            src,
            ClientRecord {
                last_processed_request_id: 0,
                balance: self.config.initial_balance,
            },
        );

        if created {
            {
                let mut stats = self.stats_locked();
                stats.total_balance += self.config.initial_balance as u64;
            }
            info!(client = %src, "registered new client");
            self.log_bank_state();
            return Packet::reply(
                PacketType::ClientDiscoveryAck,
                DISCOVERY_REQUEST_ID,
                self.config.initial_balance,
            );
        }

        let record = self
            .clients
            .read(&src)
            .expect("client records are never removed");
        Packet::reply(
            PacketType::ClientDiscoveryAck,
            record.last_processed_request_id,
            record.balance,
        )
    }

    fn handle_transaction(
        &self,
        src: Ipv4Addr,
        request_id: u32,
        dest_ip: Ipv4Addr,
        value: u32,
    ) -> Option<Packet> {
        // Claim the request id *before* any validation, in one atomic step
        //  with the snapshot that decides duplicate handling. A retransmission
        //  arriving during the service time of the original observes the
        //  claimed id and is replayed instead of applied twice.
        let snapshot = self.clients.update(&src, |record| {
            let snapshot = record.clone();
            if request_id > record.last_processed_request_id {
                record.last_processed_request_id = request_id;
            }
            snapshot
        });

        let Some(snapshot) = snapshot else {
            // a well-behaved client always discovers first; no balance is
            //  invented for one that did not
            warn!(client = %src, id_req = request_id, "transaction from unknown client");
            return Some(Packet::reply(PacketType::ErrorAck, request_id, 0));
        };

        let duplicate = request_id <= snapshot.last_processed_request_id;
        if duplicate {
            info!(client = %src, id_req = request_id, dest = %dest_ip, value, "DUP!! retransmitted request");
            // replay with the cached ACK shape - no state change, no
            //  statistics change
            return Some(Packet::reply(
                PacketType::TransactionAck,
                snapshot.last_processed_request_id,
                snapshot.balance,
            ));
        }
        info!(client = %src, id_req = request_id, dest = %dest_ip, value, "transaction request");

        if value == 0 {
            return Some(Packet::reply(PacketType::TransactionAck, request_id, snapshot.balance));
        }

        if !self.clients.exists(&dest_ip) {
            return Some(Packet::reply(PacketType::InvalidClientAck, request_id, snapshot.balance));
        }

        if src == dest_ip {
            return Some(Packet::reply(PacketType::TransactionAck, request_id, snapshot.balance));
        }

        if snapshot.balance < value {
            return Some(Packet::reply(
                PacketType::InsufficientBalanceAck,
                request_id,
                snapshot.balance,
            ));
        }

        let mut new_balance = snapshot.balance;
        let applied = self.clients.atomic_pair_operation(&src, &dest_ip, |pair| {
            if let PairValues::Distinct(src_record, dest_record) = pair {
                // only this client's own requests ever debit it, and it has at
                //  most one outstanding, so the solvency check above still
                //  holds under the write locks
                src_record.balance -= value;
                dest_record.balance += value;
                new_balance = src_record.balance;
            }
        });
        if !applied {
            // a record disappeared between lookup and locking; records are
            //  never removed, so this is not expected to fire. The client will
            //  retransmit.
            warn!(client = %src, id_req = request_id, "pair update failed, dropping request");
            return None;
        }

        {
            let mut stats = self.stats_locked();
            stats.num_transactions += 1;
            stats.total_transferred += value as u64;
            // total_balance is deliberately untouched: transfers conserve money
        }
        self.log_bank_state();

        Some(Packet::reply(PacketType::TransactionAck, request_id, new_balance))
    }

    fn stats_locked(&self) -> MutexGuard<'_, BankStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_bank_state(&self) {
        let stats = self.stats_snapshot();
        info!(
            num_transactions = stats.num_transactions,
            total_transferred = stats.total_transferred,
            total_balance = stats.total_balance,
            "bank state"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_INITIAL_BALANCE;
    use rstest::rstest;

    fn test_server() -> Server {
        // port 0: the OS assigns an ephemeral port, nothing is received on it
        Server::new(ServerConfig::new(0)).unwrap()
    }

    fn addr(ip: [u8; 4]) -> SocketAddr {
        SocketAddr::from((ip, 5555))
    }

    fn discover(server: &Server, ip: [u8; 4]) -> Packet {
        server
            .handle_packet(&Packet::discovery(), addr(ip))
            .expect("discovery must be answered")
    }

    fn transfer(server: &Server, from: [u8; 4], request_id: u32, to: [u8; 4], value: u32) -> Packet {
        let request = Packet::request(
            PacketType::TransactionRequest,
            request_id,
            Ipv4Addr::from(to),
            value,
        );
        server
            .handle_packet(&request, addr(from))
            .expect("transaction must be answered")
    }

    #[test]
    fn test_discovery_registers_client() {
        let server = test_server();

        let reply = discover(&server, [10, 0, 0, 1]);
        assert_eq!(reply, Packet::reply(PacketType::ClientDiscoveryAck, 0, DEFAULT_INITIAL_BALANCE));

        assert_eq!(server.registered_clients(), 1);
        assert_eq!(
            server.client_record(&Ipv4Addr::new(10, 0, 0, 1)),
            Some(ClientRecord { last_processed_request_id: 0, balance: DEFAULT_INITIAL_BALANCE })
        );
        assert_eq!(
            server.stats_snapshot(),
            BankStats { num_transactions: 0, total_transferred: 0, total_balance: 100 }
        );
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let server = test_server();

        discover(&server, [10, 0, 0, 1]);
        let second = discover(&server, [10, 0, 0, 1]);

        assert_eq!(second, Packet::reply(PacketType::ClientDiscoveryAck, 0, DEFAULT_INITIAL_BALANCE));
        assert_eq!(server.registered_clients(), 1);
        assert_eq!(server.stats_snapshot().total_balance, 100);
    }

    #[test]
    fn test_discovery_echoes_current_client_state() {
        let server = test_server();
        discover(&server, [10, 0, 0, 1]);
        discover(&server, [10, 0, 0, 2]);
        transfer(&server, [10, 0, 0, 1], 1, [10, 0, 0, 2], 30);

        let rediscovery = discover(&server, [10, 0, 0, 1]);
        assert_eq!(rediscovery, Packet::reply(PacketType::ClientDiscoveryAck, 1, 70));
    }

    #[test]
    fn test_simple_transfer() {
        let server = test_server();
        discover(&server, [10, 0, 0, 1]);
        discover(&server, [10, 0, 0, 2]);

        let reply = transfer(&server, [10, 0, 0, 1], 1, [10, 0, 0, 2], 30);
        assert_eq!(reply, Packet::reply(PacketType::TransactionAck, 1, 70));

        assert_eq!(server.client_record(&Ipv4Addr::new(10, 0, 0, 1)).unwrap().balance, 70);
        assert_eq!(server.client_record(&Ipv4Addr::new(10, 0, 0, 2)).unwrap().balance, 130);
        assert_eq!(
            server.stats_snapshot(),
            BankStats { num_transactions: 1, total_transferred: 30, total_balance: 200 }
        );
    }

    #[test]
    fn test_duplicate_request_is_replayed_not_reapplied() {
        let server = test_server();
        discover(&server, [10, 0, 0, 1]);
        discover(&server, [10, 0, 0, 2]);

        let first = transfer(&server, [10, 0, 0, 1], 1, [10, 0, 0, 2], 30);
        let replayed = transfer(&server, [10, 0, 0, 1], 1, [10, 0, 0, 2], 30);

        // identical (request id, balance) on both responses, identical post-state
        assert_eq!(first, Packet::reply(PacketType::TransactionAck, 1, 70));
        assert_eq!(replayed, Packet::reply(PacketType::TransactionAck, 1, 70));
        assert_eq!(server.client_record(&Ipv4Addr::new(10, 0, 0, 1)).unwrap().balance, 70);
        assert_eq!(server.client_record(&Ipv4Addr::new(10, 0, 0, 2)).unwrap().balance, 130);
        assert_eq!(
            server.stats_snapshot(),
            BankStats { num_transactions: 1, total_transferred: 30, total_balance: 200 }
        );
    }

    #[test]
    fn test_stale_request_id_is_treated_as_duplicate() {
        let server = test_server();
        discover(&server, [10, 0, 0, 1]);
        discover(&server, [10, 0, 0, 2]);
        transfer(&server, [10, 0, 0, 1], 1, [10, 0, 0, 2], 10);
        transfer(&server, [10, 0, 0, 1], 2, [10, 0, 0, 2], 10);

        let stale = transfer(&server, [10, 0, 0, 1], 1, [10, 0, 0, 2], 10);
        // the replay carries the *latest* processed id and balance
        assert_eq!(stale, Packet::reply(PacketType::TransactionAck, 2, 80));
        assert_eq!(server.stats_snapshot().num_transactions, 2);
    }

    #[test]
    fn test_unknown_source_gets_error_ack() {
        let server = test_server();

        let reply = transfer(&server, [10, 9, 9, 9], 1, [10, 0, 0, 2], 10);
        assert_eq!(reply, Packet::reply(PacketType::ErrorAck, 1, 0));
        // no record is created for the unknown source
        assert_eq!(server.registered_clients(), 0);
    }

    #[test]
    fn test_unknown_destination_gets_invalid_client_ack_and_claims_the_id() {
        let server = test_server();
        discover(&server, [10, 0, 0, 1]);

        let reply = transfer(&server, [10, 0, 0, 1], 1, [10, 9, 9, 9], 10);
        assert_eq!(reply, Packet::reply(PacketType::InvalidClientAck, 1, DEFAULT_INITIAL_BALANCE));

        // the id was claimed before validation: a retry of the failed request
        //  is a duplicate and returns the cached outcome shape
        assert_eq!(
            server.client_record(&Ipv4Addr::new(10, 0, 0, 1)).unwrap().last_processed_request_id,
            1
        );
        let retry = transfer(&server, [10, 0, 0, 1], 1, [10, 9, 9, 9], 10);
        assert_eq!(retry, Packet::reply(PacketType::TransactionAck, 1, DEFAULT_INITIAL_BALANCE));
    }

    #[test]
    fn test_insufficient_balance() {
        let server = test_server();
        discover(&server, [10, 0, 0, 1]);
        discover(&server, [10, 0, 0, 2]);
        transfer(&server, [10, 0, 0, 1], 1, [10, 0, 0, 2], 30);

        let reply = transfer(&server, [10, 0, 0, 1], 2, [10, 0, 0, 2], 500);
        assert_eq!(reply, Packet::reply(PacketType::InsufficientBalanceAck, 2, 70));
        assert_eq!(
            server.stats_snapshot(),
            BankStats { num_transactions: 1, total_transferred: 30, total_balance: 200 }
        );
    }

    #[rstest]
    #[case::zero_value([10, 0, 0, 2], 0)]
    #[case::self_transfer([10, 0, 0, 1], 25)]
    fn test_fast_paths_ack_without_applying(#[case] dest: [u8; 4], #[case] value: u32) {
        let server = test_server();
        discover(&server, [10, 0, 0, 1]);
        discover(&server, [10, 0, 0, 2]);

        let reply = transfer(&server, [10, 0, 0, 1], 1, dest, value);
        assert_eq!(reply, Packet::reply(PacketType::TransactionAck, 1, DEFAULT_INITIAL_BALANCE));

        // balances and statistics untouched, but the id is claimed
        assert_eq!(server.client_record(&Ipv4Addr::new(10, 0, 0, 1)).unwrap().balance, 100);
        assert_eq!(server.client_record(&Ipv4Addr::new(10, 0, 0, 2)).unwrap().balance, 100);
        assert_eq!(server.stats_snapshot().num_transactions, 0);
        assert_eq!(
            server.client_record(&Ipv4Addr::new(10, 0, 0, 1)).unwrap().last_processed_request_id,
            1
        );
    }

    #[test]
    fn test_acks_are_ignored_by_the_dispatcher() {
        let server = test_server();
        discover(&server, [10, 0, 0, 1]);

        for packet in [
            Packet::reply(PacketType::ClientDiscoveryAck, 1, 5),
            Packet::reply(PacketType::TransactionAck, 1, 5),
            Packet::reply(PacketType::InsufficientBalanceAck, 1, 5),
            Packet::reply(PacketType::InvalidClientAck, 1, 5),
            Packet::reply(PacketType::ErrorAck, 1, 5),
        ] {
            assert_eq!(server.handle_packet(&packet, addr([10, 0, 0, 1])), None);
        }
    }

    #[test]
    fn test_conservation_and_monotonicity_across_a_mixed_workload() {
        let server = test_server();
        let clients: [[u8; 4]; 3] = [[10, 0, 0, 1], [10, 0, 0, 2], [10, 0, 0, 3]];
        for c in clients {
            discover(&server, c);
        }

        let mut last_stats = server.stats_snapshot();
        let workload: [([u8; 4], u32, [u8; 4], u32); 6] = [
            ([10, 0, 0, 1], 1, [10, 0, 0, 2], 40),
            ([10, 0, 0, 2], 1, [10, 0, 0, 3], 140),
            ([10, 0, 0, 2], 2, [10, 0, 0, 2], 5),   // self transfer
            ([10, 0, 0, 3], 1, [10, 0, 0, 1], 500), // insufficient
            ([10, 0, 0, 3], 2, [10, 9, 9, 9], 5),   // invalid destination
            ([10, 0, 0, 1], 2, [10, 0, 0, 3], 60),
        ];
        for (from, id, to, value) in workload {
            transfer(&server, from, id, to, value);

            let stats = server.stats_snapshot();
            assert_eq!(stats.total_balance, 3 * DEFAULT_INITIAL_BALANCE as u64);
            assert!(stats.num_transactions >= last_stats.num_transactions);
            assert!(stats.total_transferred >= last_stats.total_transferred);
            last_stats = stats;
        }

        let sum: u64 = clients
            .iter()
            .map(|c| server.client_record(&Ipv4Addr::from(*c)).unwrap().balance as u64)
            .sum();
        assert_eq!(sum, 300);
        assert_eq!(
            last_stats,
            BankStats { num_transactions: 3, total_transferred: 240, total_balance: 300 }
        );
    }
}
