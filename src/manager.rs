//! The socket owner: demultiplexes inbound datagrams onto connections, accepts
//!  or refuses new peers, honors remap requests after NAT rebinds, and drives
//!  every connection's periodic work through a due-time scheduler.
//!
//! Single-threaded poll model: the application calls [Manager::poll] regularly
//!  (typically once per frame). Nothing happens between polls.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::buffers::PacketPool;
use crate::config::{ManagerConfig, MIN_RAW_PACKET_SIZE};
use crate::connection::{Connection, ConnectionEvent, Status};
use crate::driver::{SocketDriver, UdpSocketDriver};
use crate::handler::ManagerHandler;
use crate::scheduler::Scheduler;
use crate::wire::{
    ConnectPacket, DisconnectReason, PacketType, RequestRemapPacket, TerminatePacket,
    INTERNAL_PACKET_MARKER, PROTOCOL_VERSION,
};

/// Manager-wide counters. Updated with relaxed atomics so [Manager::stats] can
///  be called from any thread without touching the connection indices.
#[derive(Default)]
pub struct ManagerStats {
    received_datagrams: AtomicU64,
    received_bytes: AtomicU64,
    unknown_source_datagrams: AtomicU64,
    icmp_errors: AtomicU64,
    connects_accepted: AtomicU64,
    connects_refused: AtomicU64,
    server_status_requests: AtomicU64,
}

/// Counters returned by [Manager::stats]. The first group is manager-wide;
///  the rest are summed over the currently live connections.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ManagerStatsSnapshot {
    pub received_datagrams: u64,
    pub received_bytes: u64,
    pub unknown_source_datagrams: u64,
    pub icmp_errors: u64,
    pub connects_accepted: u64,
    pub connects_refused: u64,
    pub server_status_requests: u64,

    pub sent_datagrams: u64,
    pub sent_bytes: u64,
    pub crc_rejects: u64,
    pub order_rejects: u64,
    pub duplicate_reliable: u64,
    pub corrupt_packets: u64,
    pub resent_accelerated: u64,
    pub resent_timed_out: u64,
}

impl ManagerStats {
    fn snapshot(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            received_datagrams: self.received_datagrams.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            unknown_source_datagrams: self.unknown_source_datagrams.load(Ordering::Relaxed),
            icmp_errors: self.icmp_errors.load(Ordering::Relaxed),
            connects_accepted: self.connects_accepted.load(Ordering::Relaxed),
            connects_refused: self.connects_refused.load(Ordering::Relaxed),
            server_status_requests: self.server_status_requests.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One entry of the deferred-callback queue. Connect-request decisions go
///  through the queue too, so the application thread makes them.
enum QueuedEvent {
    Connection(ConnectionEvent),
    ConnectRequest,
}

struct ManagerIndices {
    by_address: FxHashMap<SocketAddr, Arc<Connection>>,
    by_code: FxHashMap<u32, Arc<Connection>>,
    scheduler: Scheduler<Arc<Connection>>,
}

pub struct Manager {
    config: Arc<ManagerConfig>,
    driver: Arc<dyn SocketDriver>,
    pool: Arc<PacketPool>,
    handler: Mutex<Option<Arc<dyn ManagerHandler>>>,
    indices: Mutex<ManagerIndices>,
    event_queue: Mutex<VecDeque<(Arc<Connection>, QueuedEvent)>>,
    stats: ManagerStats,
}

impl Manager {
    /// Binds a UDP socket on the first free port in `port..=port + port_range`.
    pub fn bind(
        config: ManagerConfig,
        bind_ip: IpAddr,
        port: u16,
        port_range: u16,
    ) -> anyhow::Result<Arc<Manager>> {
        config.validate()?;
        let driver = UdpSocketDriver::bind(
            bind_ip,
            port,
            port_range,
            config.incoming_buffer_size,
            config.outgoing_buffer_size,
        )?;
        Self::with_driver(config, Arc::new(driver))
    }

    /// Runs the manager over an arbitrary [SocketDriver], used by the tests to
    ///  substitute in-memory transports.
    pub fn with_driver(
        config: ManagerConfig,
        driver: Arc<dyn SocketDriver>,
    ) -> anyhow::Result<Arc<Manager>> {
        config.validate()?;
        let pool = PacketPool::new(config.packet_pool_size);
        Ok(Arc::new(Manager {
            config: Arc::new(config),
            driver,
            pool,
            handler: Mutex::new(None),
            indices: Mutex::new(ManagerIndices {
                by_address: FxHashMap::default(),
                by_code: FxHashMap::default(),
                scheduler: Scheduler::new(),
            }),
            event_queue: Mutex::new(VecDeque::new()),
            stats: ManagerStats::default(),
        }))
    }

    pub fn set_handler(&self, handler: Arc<dyn ManagerHandler>) {
        *lock(&self.handler) = Some(handler);
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.driver.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.indices).by_code.len()
    }

    pub fn stats(&self) -> ManagerStatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        for connection in lock(&self.indices).by_code.values() {
            let stats = connection.stats();
            snapshot.sent_datagrams += stats.sent_datagrams;
            snapshot.sent_bytes += stats.sent_bytes;
            snapshot.crc_rejects += stats.crc_rejects;
            snapshot.order_rejects += stats.order_rejects;
            snapshot.duplicate_reliable += stats.duplicate_reliable;
            snapshot.corrupt_packets += stats.corrupt_packets;
            snapshot.resent_accelerated += stats.resent_accelerated;
            snapshot.resent_timed_out += stats.resent_timed_out;
        }
        snapshot
    }

    /// Initiates a connection to `address` (a `host:port` string). Negotiation
    ///  proceeds across subsequent polls; attach a handler to observe the
    ///  connect-complete callback.
    pub fn establish(&self, address: &str) -> anyhow::Result<Arc<Connection>> {
        let peer = UdpSocketDriver::resolve(address)?;
        self.establish_to(peer)
    }

    pub fn establish_to(&self, peer: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        let now = Instant::now();
        let mut indices = lock(&self.indices);
        if indices.by_code.len() >= self.config.max_connections {
            anyhow::bail!("connection limit of {} reached", self.config.max_connections);
        }
        if let Some(existing) = indices.by_address.get(&peer) {
            if existing.status() != Status::Disconnected {
                anyhow::bail!("already connected to {}", peer);
            }
        }

        let connection = Connection::new_outbound(
            self.config.clone(),
            self.driver.clone(),
            self.pool.clone(),
            peer,
            now,
        );
        info!("establishing connection to {}", peer);
        self.index(&mut indices, &connection, now);
        Ok(connection)
    }

    /// One scheduling pass: drains waiting datagrams, then, unless
    ///  `give_connections_time` is off, gives time to every connection that is
    ///  due. `max_receive_time` caps how long the drain may take under a
    ///  datagram flood; zero means no cap. Returns whether anything arrived.
    pub fn poll(&self, max_receive_time: Duration, give_connections_time: bool) -> bool {
        let deadline = Instant::now() + max_receive_time;
        let mut buf = vec![0u8; self.config.max_raw_packet_size.max(1500)];

        let mut received = false;
        loop {
            let Some((len, from)) = self.driver.recv_from(&mut buf) else {
                break;
            };
            received = true;
            let now = Instant::now();
            if len == 0 {
                self.on_icmp_error(now, from);
            } else {
                self.on_datagram(now, &buf[..len], from);
            }
            if !max_receive_time.is_zero() && now >= deadline {
                debug!("datagram drain exceeded its {:?} budget", max_receive_time);
                break;
            }
        }

        if give_connections_time {
            self.give_time_to_connections(Instant::now());
        }
        received
    }

    /// Delivers queued callbacks when `use_event_queue` is set. A no-op
    ///  otherwise.
    pub fn deliver_events(&self) {
        loop {
            let Some((connection, event)) = lock(&self.event_queue).pop_front() else {
                return;
            };
            match event {
                QueuedEvent::Connection(event) => connection.fire_events(vec![event]),
                QueuedEvent::ConnectRequest => self.decide_connect_request(&connection),
            }
        }
    }

    /// Terminates every connection with `ManagerDeleted`. Called by `Drop`.
    ///  Peers still get the Terminate notification, but teardown is not
    ///  surfaced through the terminated callback; the disconnect reason stays
    ///  queryable on each connection.
    pub fn shutdown(&self) {
        let now = Instant::now();
        let connections: Vec<Arc<Connection>> = {
            let mut indices = lock(&self.indices);
            let connections = indices.by_code.values().cloned().collect();
            indices.by_address.clear();
            indices.by_code.clear();
            connections
        };
        for connection in connections {
            let _ = connection.terminated_by_manager(now, DisconnectReason::ManagerDeleted);
        }
    }

    // ----------------------------------------------------- inbound demux

    fn on_datagram(&self, now: Instant, data: &[u8], from: SocketAddr) {
        ManagerStats::bump(&self.stats.received_datagrams);
        self.stats.received_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

        let known = lock(&self.indices).by_address.get(&from).cloned();
        if let Some(connection) = known {
            let events = connection.process_raw_packet(now, data);
            self.after_processing(&connection);
            self.dispatch(&connection, events);
            return;
        }

        // from an unknown source only a handful of control packets mean anything
        if data.len() >= 2 && data[0] == INTERNAL_PACKET_MARKER {
            match PacketType::try_from(data[1]) {
                Ok(PacketType::Connect) => {
                    self.on_inbound_connect(now, &data[2..], from);
                    return;
                }
                Ok(PacketType::RequestRemap) => {
                    self.on_remap_request(&data[2..], from);
                    return;
                }
                Ok(PacketType::ServerStatus) => {
                    ManagerStats::bump(&self.stats.server_status_requests);
                    if let Some(handler) = lock(&self.handler).clone() {
                        handler.on_server_status_request(from);
                    }
                    return;
                }
                // never answer teardown noise, that way lies a packet loop
                Ok(PacketType::Terminate) | Ok(PacketType::UnreachableConnection) => return,
                _ => {}
            }
        }

        ManagerStats::bump(&self.stats.unknown_source_datagrams);
        trace!("{} byte datagram from unknown source {}", data.len(), from);
        if self.config.reply_unreachable {
            self.driver.send_to(
                from,
                &[INTERNAL_PACKET_MARKER, PacketType::UnreachableConnection.into()],
            );
        }
    }

    fn on_inbound_connect(&self, now: Instant, payload: &[u8], from: SocketAddr) {
        let mut buf = payload;
        let Ok(connect) = ConnectPacket::deser(&mut buf) else {
            debug!("unparseable Connect from {}", from);
            return;
        };

        if connect.protocol_version != PROTOCOL_VERSION {
            debug!(
                "refusing {}: protocol version {} vs our {}",
                from, connect.protocol_version, PROTOCOL_VERSION
            );
            self.refuse(from, connect.connect_code, DisconnectReason::ConnectionRefused);
            return;
        }
        if (connect.max_raw_packet_size as usize) < MIN_RAW_PACKET_SIZE {
            debug!("refusing {}: unusable raw packet size {}", from, connect.max_raw_packet_size);
            self.refuse(from, connect.connect_code, DisconnectReason::ConnectionRefused);
            return;
        }
        if connect.protocol_name != self.config.protocol_name {
            debug!("refusing {}: protocol name {:?}", from, connect.protocol_name);
            self.refuse(from, connect.connect_code, DisconnectReason::OtherProtocolName);
            return;
        }
        {
            let indices = lock(&self.indices);
            if indices.by_code.len() >= self.config.max_connections {
                drop(indices);
                debug!("refusing {}: connection limit reached", from);
                self.refuse(from, connect.connect_code, DisconnectReason::ConnectionRefused);
                return;
            }
            if indices.by_code.contains_key(&connect.connect_code) {
                // retry of a Connect we already answered, from a source address
                //  we no longer recognize
                return;
            }
        }

        let connection = Connection::new_inbound(
            self.config.clone(),
            self.driver.clone(),
            self.pool.clone(),
            from,
            &connect,
            now,
        );

        if self.config.use_event_queue {
            // the accept decision is deferred to `deliver_events`; the peer's
            //  Confirm stays unsent until the application thread decides
            {
                let mut indices = lock(&self.indices);
                self.index(&mut indices, &connection, now);
            }
            lock(&self.event_queue).push_back((connection, QueuedEvent::ConnectRequest));
            return;
        }

        let accepted = match lock(&self.handler).clone() {
            Some(handler) => handler.on_connect_request(&connection),
            None => true,
        };
        if !accepted {
            ManagerStats::bump(&self.stats.connects_refused);
            let events =
                connection.terminated_by_manager(now, DisconnectReason::ConnectionRefused);
            self.dispatch(&connection, events);
            return;
        }

        ManagerStats::bump(&self.stats.connects_accepted);
        info!("accepted connection from {}", from);
        connection.confirm_accepted(now);
        let mut indices = lock(&self.indices);
        self.index(&mut indices, &connection, now);
    }

    fn decide_connect_request(&self, connection: &Arc<Connection>) {
        let now = Instant::now();
        let accepted = match lock(&self.handler).clone() {
            Some(handler) => handler.on_connect_request(connection),
            None => true,
        };
        if accepted {
            ManagerStats::bump(&self.stats.connects_accepted);
            info!("accepted connection from {}", connection.peer_address());
            connection.confirm_accepted(now);
        } else {
            ManagerStats::bump(&self.stats.connects_refused);
            self.deindex(connection);
            let events =
                connection.terminated_by_manager(now, DisconnectReason::ConnectionRefused);
            self.dispatch(connection, events);
        }
    }

    fn on_remap_request(&self, payload: &[u8], from: SocketAddr) {
        if !self.config.allow_port_remapping {
            return;
        }
        let mut buf = payload;
        let Ok(remap) = RequestRemapPacket::deser(&mut buf) else {
            return;
        };

        let mut indices = lock(&self.indices);
        let Some(connection) = indices.by_code.get(&remap.connect_code).cloned() else {
            drop(indices);
            ManagerStats::bump(&self.stats.unknown_source_datagrams);
            if self.config.reply_unreachable {
                self.driver.send_to(
                    from,
                    &[INTERNAL_PACKET_MARKER, PacketType::UnreachableConnection.into()],
                );
            }
            return;
        };
        // the encrypt code doubles as proof that the requester is the real peer
        if connection.encrypt_code() != remap.encrypt_code {
            warn!("remap request for connection {:x} with wrong encrypt code from {}", remap.connect_code, from);
            return;
        }
        let old = connection.peer_address();
        if old.ip() != from.ip() && !self.config.allow_address_remapping {
            debug!("refusing remap of {:x}: {} -> {} changes the address", remap.connect_code, old, from);
            return;
        }

        info!("remapping connection {:x}: {} -> {}", remap.connect_code, old, from);
        indices.by_address.remove(&old);
        connection.set_peer_address(from);
        indices.by_address.insert(from, connection);
    }

    fn on_icmp_error(&self, now: Instant, from: SocketAddr) {
        ManagerStats::bump(&self.stats.icmp_errors);
        let connection = lock(&self.indices).by_address.get(&from).cloned();
        if let Some(connection) = connection {
            let events = connection.on_port_unreachable(now);
            self.after_processing(&connection);
            self.dispatch(&connection, events);
        }
    }

    fn refuse(&self, to: SocketAddr, connect_code: u32, reason: DisconnectReason) {
        ManagerStats::bump(&self.stats.connects_refused);
        let mut packet = Vec::with_capacity(10);
        TerminatePacket { connect_code, reason: Some(reason) }.ser(&mut packet);
        self.driver.send_to(to, &packet);
    }

    // ----------------------------------------------------- scheduling

    fn give_time_to_connections(&self, now: Instant) {
        if self.config.use_connection_scheduler {
            loop {
                let due = lock(&self.indices).scheduler.pop_due(now);
                let Some(connection) = due else {
                    break;
                };
                self.give_time_to(&connection, now, true);
            }
        } else {
            let connections: Vec<Arc<Connection>> =
                lock(&self.indices).by_code.values().cloned().collect();
            for connection in connections {
                self.give_time_to(&connection, now, false);
            }
        }
    }

    fn give_time_to(&self, connection: &Arc<Connection>, now: Instant, reschedule: bool) {
        let (events, next_due) = connection.give_time(now);
        if connection.status() == Status::Disconnected {
            self.deindex(connection);
        } else if reschedule {
            lock(&self.indices).scheduler.schedule(
                connection.connect_code() as u64,
                connection.clone(),
                next_due,
                Some(now),
            );
        }
        self.dispatch(connection, events);
    }

    /// Datagram processing can terminate a connection; drop it from the indices
    ///  when it does.
    fn after_processing(&self, connection: &Arc<Connection>) {
        if connection.status() == Status::Disconnected {
            self.deindex(connection);
        }
    }

    fn index(&self, indices: &mut ManagerIndices, connection: &Arc<Connection>, now: Instant) {
        indices.by_address.insert(connection.peer_address(), connection.clone());
        indices.by_code.insert(connection.connect_code(), connection.clone());
        indices.scheduler.schedule(
            connection.connect_code() as u64,
            connection.clone(),
            now,
            None,
        );
    }

    fn deindex(&self, connection: &Arc<Connection>) {
        let mut indices = lock(&self.indices);
        indices.by_address.remove(&connection.peer_address());
        indices.by_code.remove(&connection.connect_code());
        indices.scheduler.remove(connection.connect_code() as u64);
    }

    fn dispatch(&self, connection: &Arc<Connection>, events: Vec<ConnectionEvent>) {
        if events.is_empty() {
            return;
        }
        if self.config.use_event_queue {
            let mut queue = lock(&self.event_queue);
            for event in events {
                queue.push_back((connection.clone(), QueuedEvent::Connection(event)));
            }
        } else {
            connection.fire_events(events);
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockManagerHandler;
    use crate::wire::ConfirmPacket;
    use std::sync::Mutex;

    /// A driver with a scripted inbound queue and a captured outbound log.
    struct TestDriver {
        incoming: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl TestDriver {
        fn new() -> Arc<TestDriver> {
            Arc::new(TestDriver {
                incoming: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn push_incoming(&self, from: SocketAddr, data: &[u8]) {
            self.incoming.lock().unwrap().push_back((data.to_vec(), from));
        }

        fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
            self.sent.lock().unwrap().drain(..).collect()
        }
    }

    impl SocketDriver for TestDriver {
        fn send_to(&self, to: SocketAddr, data: &[u8]) -> bool {
            self.sent.lock().unwrap().push((to, data.to_vec()));
            true
        }

        fn recv_from(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
            let (data, from) = self.incoming.lock().unwrap().pop_front()?;
            buf[..data.len()].copy_from_slice(&data);
            Some((data.len(), from))
        }

        fn ttl(&self) -> u32 {
            64
        }

        fn set_ttl(&self, _ttl: u32) {}

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.1.9:{}", port).parse().unwrap()
    }

    fn manager(tweak: impl FnOnce(&mut ManagerConfig)) -> (Arc<Manager>, Arc<TestDriver>) {
        let mut config = ManagerConfig::new("test-protocol");
        config.max_data_hold_time = Duration::ZERO;
        tweak(&mut config);
        let driver = TestDriver::new();
        let manager = Manager::with_driver(config, driver.clone()).unwrap();
        (manager, driver)
    }

    fn connect_packet(code: u32, name: &str) -> Vec<u8> {
        let mut packet = Vec::new();
        ConnectPacket {
            protocol_version: PROTOCOL_VERSION,
            connect_code: code,
            max_raw_packet_size: 512,
            protocol_name: name.to_string(),
        }
        .ser(&mut packet);
        packet
    }

    #[test]
    fn test_establish_indexes_and_sends_connect() {
        let (manager, driver) = manager(|_| {});
        let connection = manager.establish_to(addr(5000)).unwrap();

        assert_eq!(manager.connection_count(), 1);
        assert_eq!(connection.status(), Status::Negotiating);

        manager.poll(Duration::ZERO, true);
        let sent = driver.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(5000));
        assert_eq!(sent[0].1[1], u8::from(PacketType::Connect));
    }

    #[test]
    fn test_establish_twice_to_same_peer_fails() {
        let (manager, _driver) = manager(|_| {});
        manager.establish_to(addr(5000)).unwrap();
        assert!(manager.establish_to(addr(5000)).is_err());
    }

    #[test]
    fn test_inbound_connect_creates_connection_and_confirms() {
        let (manager, driver) = manager(|_| {});
        let mut handler = MockManagerHandler::new();
        handler.expect_on_connect_request().times(1).return_const(true);
        manager.set_handler(Arc::new(handler));

        driver.push_incoming(addr(6000), &connect_packet(0x1234, "test-protocol"));
        manager.poll(Duration::ZERO, true);

        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.stats().connects_accepted, 1);
        let sent = driver.take_sent();
        assert!(sent.iter().any(|(to, d)| *to == addr(6000) && d[1] == u8::from(PacketType::Confirm)));
    }

    #[test]
    fn test_refused_connect_is_terminated() {
        let (manager, driver) = manager(|_| {});
        let mut handler = MockManagerHandler::new();
        handler.expect_on_connect_request().times(1).return_const(false);
        manager.set_handler(Arc::new(handler));

        driver.push_incoming(addr(6000), &connect_packet(0x1234, "test-protocol"));
        manager.poll(Duration::ZERO, true);

        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.stats().connects_refused, 1);
        let sent = driver.take_sent();
        assert!(sent.iter().any(|(_, d)| d[1] == u8::from(PacketType::Terminate)));
        // a refused peer must never have seen a Confirm
        assert!(sent.iter().all(|(_, d)| d[1] != u8::from(PacketType::Confirm)));
    }

    #[test]
    fn test_tiny_raw_packet_size_is_refused() {
        let (manager, driver) = manager(|_| {});
        let mut packet = Vec::new();
        ConnectPacket {
            protocol_version: PROTOCOL_VERSION,
            connect_code: 11,
            max_raw_packet_size: 16,
            protocol_name: "test-protocol".to_string(),
        }
        .ser(&mut packet);
        driver.push_incoming(addr(6000), &packet);
        manager.poll(Duration::ZERO, true);

        assert_eq!(manager.connection_count(), 0);
        let sent = driver.take_sent();
        let mut buf = &sent[0].1[2..];
        let terminate = TerminatePacket::deser(&mut buf).unwrap();
        assert_eq!(terminate.reason, Some(DisconnectReason::ConnectionRefused));
    }

    #[test]
    fn test_wrong_protocol_name_is_refused() {
        let (manager, driver) = manager(|_| {});
        driver.push_incoming(addr(6000), &connect_packet(7, "other-protocol"));
        manager.poll(Duration::ZERO, true);

        assert_eq!(manager.connection_count(), 0);
        let sent = driver.take_sent();
        assert_eq!(sent.len(), 1);
        let mut buf = &sent[0].1[2..];
        let terminate = TerminatePacket::deser(&mut buf).unwrap();
        assert_eq!(terminate.connect_code, 7);
        assert_eq!(terminate.reason, Some(DisconnectReason::OtherProtocolName));
    }

    #[test]
    fn test_wrong_protocol_version_is_refused() {
        let (manager, driver) = manager(|_| {});
        let mut packet = Vec::new();
        ConnectPacket {
            protocol_version: PROTOCOL_VERSION + 1,
            connect_code: 9,
            max_raw_packet_size: 512,
            protocol_name: "test-protocol".to_string(),
        }
        .ser(&mut packet);
        driver.push_incoming(addr(6000), &packet);
        manager.poll(Duration::ZERO, true);

        let sent = driver.take_sent();
        let mut buf = &sent[0].1[2..];
        let terminate = TerminatePacket::deser(&mut buf).unwrap();
        assert_eq!(terminate.reason, Some(DisconnectReason::ConnectionRefused));
    }

    #[test]
    fn test_connection_limit_is_enforced() {
        let (manager, driver) = manager(|c| c.max_connections = 1);
        driver.push_incoming(addr(6000), &connect_packet(1, "test-protocol"));
        driver.push_incoming(addr(6001), &connect_packet(2, "test-protocol"));
        manager.poll(Duration::ZERO, true);

        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.stats().connects_refused, 1);
    }

    #[test]
    fn test_unknown_source_gets_unreachable_reply() {
        let (manager, driver) = manager(|c| c.reply_unreachable = true);
        driver.push_incoming(addr(7000), &[42, 43, 44]);
        manager.poll(Duration::ZERO, true);

        assert_eq!(manager.stats().unknown_source_datagrams, 1);
        let sent = driver.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(7000));
        assert_eq!(sent[0].1, vec![0, u8::from(PacketType::UnreachableConnection)]);
    }

    #[test]
    fn test_unreachable_reply_can_be_disabled() {
        let (manager, driver) = manager(|c| c.reply_unreachable = false);
        driver.push_incoming(addr(7000), &[42, 43, 44]);
        manager.poll(Duration::ZERO, true);

        assert!(driver.take_sent().is_empty());
        assert_eq!(manager.stats().unknown_source_datagrams, 1);
    }

    #[test]
    fn test_terminate_from_unknown_source_is_not_answered() {
        let (manager, driver) = manager(|c| c.reply_unreachable = true);
        let mut packet = Vec::new();
        TerminatePacket { connect_code: 5, reason: None }.ser(&mut packet);
        driver.push_incoming(addr(7000), &packet);
        manager.poll(Duration::ZERO, true);

        assert!(driver.take_sent().is_empty());
    }

    #[test]
    fn test_server_status_request_reaches_the_handler() {
        let (manager, driver) = manager(|_| {});
        let mut handler = MockManagerHandler::new();
        handler
            .expect_on_server_status_request()
            .withf(|from| *from == addr(8000))
            .times(1)
            .return_const(());
        manager.set_handler(Arc::new(handler));

        driver.push_incoming(addr(8000), &[INTERNAL_PACKET_MARKER, PacketType::ServerStatus.into()]);
        manager.poll(Duration::ZERO, true);
        assert_eq!(manager.stats().server_status_requests, 1);
    }

    #[test]
    fn test_remap_request_moves_the_connection() {
        let (manager, driver) = manager(|c| c.allow_port_remapping = true);
        driver.push_incoming(addr(6000), &connect_packet(0xabcd, "test-protocol"));
        manager.poll(Duration::ZERO, true);
        let connection = {
            assert_eq!(manager.connection_count(), 1);
            lock(&manager.indices).by_code[&0xabcd].clone()
        };
        let encrypt_code = connection.encrypt_code();
        driver.take_sent();

        // same host, new port, correct encrypt code
        let mut packet = Vec::new();
        RequestRemapPacket { connect_code: 0xabcd, encrypt_code }.ser(&mut packet);
        driver.push_incoming(addr(6001), &packet);
        manager.poll(Duration::ZERO, true);

        assert_eq!(connection.peer_address(), addr(6001));
        assert_eq!(manager.connection_count(), 1);
    }

    #[test]
    fn test_remap_with_wrong_encrypt_code_is_ignored() {
        let (manager, driver) = manager(|c| c.allow_port_remapping = true);
        driver.push_incoming(addr(6000), &connect_packet(0xabcd, "test-protocol"));
        manager.poll(Duration::ZERO, true);
        let connection = lock(&manager.indices).by_code[&0xabcd].clone();
        let wrong = connection.encrypt_code().wrapping_add(1);

        let mut packet = Vec::new();
        RequestRemapPacket { connect_code: 0xabcd, encrypt_code: wrong }.ser(&mut packet);
        driver.push_incoming(addr(6001), &packet);
        manager.poll(Duration::ZERO, true);

        assert_eq!(connection.peer_address(), addr(6000));
    }

    #[test]
    fn test_address_remapping_requires_opt_in() {
        let (manager, driver) = manager(|c| {
            c.allow_port_remapping = true;
            c.allow_address_remapping = false;
        });
        driver.push_incoming(addr(6000), &connect_packet(0xabcd, "test-protocol"));
        manager.poll(Duration::ZERO, true);
        let connection = lock(&manager.indices).by_code[&0xabcd].clone();

        let other_host: SocketAddr = "192.168.1.10:6000".parse().unwrap();
        let mut packet = Vec::new();
        RequestRemapPacket {
            connect_code: 0xabcd,
            encrypt_code: connection.encrypt_code(),
        }
        .ser(&mut packet);
        driver.push_incoming(other_host, &packet);
        manager.poll(Duration::ZERO, true);

        assert_eq!(connection.peer_address(), addr(6000));
    }

    #[test]
    fn test_zero_length_datagram_is_an_icmp_signal() {
        let (manager, driver) = manager(|c| c.icmp_error_retry_period = Duration::from_secs(5));
        manager.establish_to(addr(5000)).unwrap();
        driver.push_incoming(addr(5000), &[]);
        manager.poll(Duration::ZERO, true);

        assert_eq!(manager.stats().icmp_errors, 1);
        // one error only starts the clock, the connection stays indexed
        assert_eq!(manager.connection_count(), 1);
    }

    #[test]
    fn test_poll_reports_whether_data_arrived() {
        let (manager, driver) = manager(|_| {});
        assert!(!manager.poll(Duration::ZERO, true));

        driver.push_incoming(addr(7000), &[42]);
        assert!(manager.poll(Duration::ZERO, true));
    }

    #[test]
    fn test_poll_can_skip_giving_connections_time() {
        let (manager, driver) = manager(|_| {});
        manager.establish_to(addr(5000)).unwrap();

        manager.poll(Duration::ZERO, false);
        assert!(driver.take_sent().is_empty(), "receive only, no Connect yet");

        manager.poll(Duration::ZERO, true);
        assert_eq!(driver.take_sent().len(), 1);
    }

    #[test]
    fn test_shutdown_terminates_all_connections() {
        let (manager, driver) = manager(|_| {});
        let a = manager.establish_to(addr(5000)).unwrap();
        let b = manager.establish_to(addr(5001)).unwrap();

        manager.shutdown();
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(a.disconnect_reason(), Some(DisconnectReason::ManagerDeleted));
        assert_eq!(b.disconnect_reason(), Some(DisconnectReason::ManagerDeleted));
        let terminates = driver
            .take_sent()
            .into_iter()
            .filter(|(_, d)| d[1] == u8::from(PacketType::Terminate))
            .count();
        assert_eq!(terminates, 2);
    }

    #[test]
    fn test_shutdown_does_not_fire_the_terminated_callback() {
        let (manager, _driver) = manager(|_| {});
        let connection = manager.establish_to(addr(5000)).unwrap();

        use crate::handler::MockConnectionHandler;
        let mut handler = MockConnectionHandler::new();
        handler.expect_on_terminated().times(0);
        connection.set_handler(Arc::new(handler));

        manager.shutdown();
        assert_eq!(connection.disconnect_reason(), Some(DisconnectReason::ManagerDeleted));
    }

    #[test]
    fn test_disconnected_connection_is_dropped_from_the_indices() {
        let (manager, _driver) = manager(|_| {});
        let connection = manager.establish_to(addr(5000)).unwrap();
        connection.disconnect();

        manager.poll(Duration::ZERO, true);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_event_queue_defers_callbacks_to_deliver_events() {
        let (manager, driver) = manager(|c| c.use_event_queue = true);
        driver.push_incoming(addr(6000), &connect_packet(3, "test-protocol"));
        manager.poll(Duration::ZERO, true);
        let connection = lock(&manager.indices).by_code[&3].clone();

        use crate::handler::MockConnectionHandler;
        let mut handler = MockConnectionHandler::new();
        handler
            .expect_on_route_packet()
            .withf(|data| data == b"queued")
            .times(1)
            .return_const(());
        connection.set_handler(Arc::new(handler));

        // an unreliable data packet from the peer (crc 0, no encryption)
        driver.push_incoming(addr(6000), b"queued");
        manager.poll(Duration::ZERO, true);
        // not delivered inside poll
        manager.deliver_events();
    }

    #[test]
    fn test_event_queue_defers_the_connect_request_decision() {
        let (manager, driver) = manager(|c| c.use_event_queue = true);
        let mut handler = MockManagerHandler::new();
        handler.expect_on_connect_request().times(1).return_const(false);
        manager.set_handler(Arc::new(handler));

        driver.push_incoming(addr(6000), &connect_packet(4, "test-protocol"));
        manager.poll(Duration::ZERO, true);

        // indexed, but neither decided nor confirmed until the app asks for events
        assert_eq!(manager.connection_count(), 1);
        assert!(driver
            .take_sent()
            .iter()
            .all(|(_, d)| d[1] != u8::from(PacketType::Confirm)));

        manager.deliver_events();
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.stats().connects_refused, 1);
    }
}
