//! Shared fixtures for the integration tests: an in-memory network hub with
//!  configurable fault injection, and recording handlers that capture what the
//!  transport delivers.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use udplink::driver::SocketDriver;
use udplink::{Connection, ConnectionHandler, CorruptionReason, DisconnectReason, ManagerHandler};

#[derive(Default)]
struct FaultPolicy {
    drop_every_nth: Option<u64>,
    flip_byte_every_nth: Option<u64>,
}

/// An in-memory packet network. Endpoints share one hub; delivery is immediate
///  and in order unless the fault policy says otherwise.
pub struct Network {
    inboxes: Mutex<HashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>>,
    policy: Mutex<FaultPolicy>,
    datagram_counter: Mutex<u64>,
}

impl Network {
    pub fn new() -> Arc<Network> {
        Arc::new(Network {
            inboxes: Mutex::new(HashMap::new()),
            policy: Mutex::new(FaultPolicy::default()),
            datagram_counter: Mutex::new(0),
        })
    }

    /// Silently discards every nth datagram from now on.
    pub fn drop_every_nth(&self, n: u64) {
        self.policy.lock().unwrap().drop_every_nth = Some(n);
        *self.datagram_counter.lock().unwrap() = 0;
    }

    /// Corrupts one byte of every nth datagram from now on.
    pub fn flip_byte_every_nth(&self, n: u64) {
        self.policy.lock().unwrap().flip_byte_every_nth = Some(n);
        *self.datagram_counter.lock().unwrap() = 0;
    }

    pub fn endpoint(self: &Arc<Self>, addr: SocketAddr) -> Arc<NetworkDriver> {
        self.inboxes.lock().unwrap().entry(addr).or_default();
        Arc::new(NetworkDriver {
            addr,
            network: self.clone(),
            ttl: Mutex::new(64),
        })
    }
}

pub struct NetworkDriver {
    addr: SocketAddr,
    network: Arc<Network>,
    ttl: Mutex<u32>,
}

impl SocketDriver for NetworkDriver {
    fn send_to(&self, to: SocketAddr, data: &[u8]) -> bool {
        // TTL-limited port-alive probes expire inside the network
        if *self.ttl.lock().unwrap() <= 5 {
            return true;
        }

        let mut data = data.to_vec();
        {
            let count = {
                let mut counter = self.network.datagram_counter.lock().unwrap();
                *counter += 1;
                *counter
            };
            let policy = self.network.policy.lock().unwrap();
            if policy.drop_every_nth.is_some_and(|n| count % n == 0) {
                return true;
            }
            if policy.flip_byte_every_nth.is_some_and(|n| count % n == 0) {
                let middle = data.len() / 2;
                data[middle] ^= 0x55;
            }
        }

        self.network
            .inboxes
            .lock()
            .unwrap()
            .entry(to)
            .or_default()
            .push_back((data, self.addr));
        true
    }

    fn recv_from(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        let (data, from) = self
            .network
            .inboxes
            .lock()
            .unwrap()
            .get_mut(&self.addr)?
            .pop_front()?;
        buf[..data.len()].copy_from_slice(&data);
        Some((data.len(), from))
    }

    fn ttl(&self) -> u32 {
        *self.ttl.lock().unwrap()
    }

    fn set_ttl(&self, ttl: u32) {
        *self.ttl.lock().unwrap() = ttl;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

/// Captures everything the transport hands to the application.
#[derive(Default)]
pub struct RecordingHandler {
    pub routed: Mutex<Vec<Vec<u8>>>,
    pub connected: AtomicBool,
    pub terminated: Mutex<Option<DisconnectReason>>,
    pub crc_rejects: Mutex<u64>,
    pub corrupt: Mutex<Option<CorruptionReason>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler::default())
    }

    pub fn routed(&self) -> Vec<Vec<u8>> {
        self.routed.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn terminated_with(&self) -> Option<DisconnectReason> {
        *self.terminated.lock().unwrap()
    }
}

impl ConnectionHandler for RecordingHandler {
    fn on_route_packet(&self, data: &[u8]) {
        self.routed.lock().unwrap().push(data.to_vec());
    }

    fn on_connect_complete(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    fn on_terminated(&self, reason: DisconnectReason) {
        *self.terminated.lock().unwrap() = Some(reason);
    }

    fn on_crc_reject(&self, _data: &[u8]) {
        *self.crc_rejects.lock().unwrap() += 1;
    }

    fn on_packet_corrupt(&self, _data: &[u8], reason: CorruptionReason) {
        *self.corrupt.lock().unwrap() = Some(reason);
    }
}

/// Accepts every inbound connection and attaches a fresh [RecordingHandler].
#[derive(Default)]
pub struct Acceptor {
    pub accepted: Mutex<Vec<(Arc<Connection>, Arc<RecordingHandler>)>>,
}

impl Acceptor {
    pub fn new() -> Arc<Acceptor> {
        Arc::new(Acceptor::default())
    }

    pub fn only_connection(&self) -> (Arc<Connection>, Arc<RecordingHandler>) {
        let accepted = self.accepted.lock().unwrap();
        assert_eq!(accepted.len(), 1, "expected exactly one accepted connection");
        accepted[0].clone()
    }
}

impl ManagerHandler for Acceptor {
    fn on_connect_request(&self, connection: &Arc<Connection>) -> bool {
        let handler = RecordingHandler::new();
        connection.set_handler(handler.clone());
        self.accepted.lock().unwrap().push((connection.clone(), handler));
        true
    }
}
