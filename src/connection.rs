//! One negotiated peer relationship: the packet-type dispatch switch, the four
//!  lazily created reliable channels, the two ordered lanes, the hold buffer
//!  that batches small cooked packets into Multi datagrams, keep-alive and
//!  timeout supervision, and clock-sync probing.
//!
//! Locking: all mutable state sits behind one mutex. Application callbacks are
//!  never invoked while it is held - processing collects [ConnectionEvent]s and
//!  the caller dispatches them after the lock is released.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::Buf;
use bytes_varint::VarIntSupport;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::buffers::PacketPool;
use crate::config::{ManagerConfig, MIN_RAW_PACKET_SIZE};
use crate::driver::SocketDriver;
use crate::encryption::{DecodeError, RawPipeline};
use crate::handler::ConnectionHandler;
use crate::reliable_channel::{ChannelOutput, ReliableChannel};
use crate::wire::{
    self, ClockReflectPacket, ClockSyncPacket, ConfirmPacket, ConnectPacket, CorruptionReason,
    DisconnectReason, PacketType, RequestRemapPacket, TerminatePacket, INTERNAL_PACKET_MARKER,
    NUM_RELIABLE_CHANNELS, PROTOCOL_VERSION,
};

/// TTL used for port-alive packets, low enough to die before reaching the peer
///  while still refreshing NAT mappings along the way.
const PORT_ALIVE_TTL: u32 = 5;

/// Multi / Group / ZeroEscape nesting deeper than this is corrupt.
const MAX_DISPATCH_DEPTH: u32 = 3;

const NUM_ORDERED_LANES: usize = 2;

/// An ordered-lane stamp is fresh only within this forward window of the last
///  accepted one. Everything else is a stale packet or a forged stamp jump.
const ORDERED_FRESH_WINDOW: u16 = 30000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    /// Handshake in progress (initiating side only).
    Negotiating,
    Connected,
    /// `disconnect_after_flush` was called; the connection lives on until all
    ///  reliable data is acknowledged.
    DisconnectPending,
    Disconnected,
}

/// Traffic counters, snapshotted via [Connection::stats].
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub sent_datagrams: u64,
    pub received_datagrams: u64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub crc_rejects: u64,
    pub order_rejects: u64,
    pub duplicate_reliable: u64,
    pub resent_accelerated: u64,
    pub resent_timed_out: u64,
    pub last_ping_ms: u32,
    pub average_ping_ms: u32,
    pub low_ping_ms: u32,
    pub high_ping_ms: u32,
    /// Round time of the currently adopted clock-correlation sample.
    pub master_ping_ms: u32,
    pub corrupt_packets: u64,
}

/// What processing produced for the application. Collected under the lock,
///  dispatched to the handler after it is released.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum ConnectionEvent {
    Routed(Vec<u8>),
    ConnectComplete,
    Terminated(DisconnectReason),
    CrcReject(Vec<u8>),
    PacketCorrupt(Vec<u8>, CorruptionReason),
}

pub struct Connection {
    connect_code: u32,
    inner: Mutex<ConnectionInner>,
}

struct ConnectionInner {
    config: Arc<ManagerConfig>,
    driver: Arc<dyn SocketDriver>,
    pool: Arc<PacketPool>,
    handler: Option<Arc<dyn ConnectionHandler>>,

    status: Status,
    peer: SocketAddr,
    initiator: bool,
    created: Instant,
    /// Set by `disconnect_after_flush`; the flush gives up when it passes.
    disconnect_deadline: Option<Instant>,
    disconnect_reason: Option<DisconnectReason>,
    /// Reason the peer put into its Terminate packet, if any.
    peer_disconnect_reason: Option<DisconnectReason>,

    // negotiated state; `pipeline` is `None` until the handshake completes
    connect_code: u32,
    encrypt_code: u32,
    pipeline: Option<RawPipeline>,
    max_cooked_packet_size: usize,
    /// Kept for re-sending when the peer's Connect retry crosses our reply.
    confirm: Option<ConfirmPacket>,
    confirm_sent: bool,

    channels: [Option<ReliableChannel>; NUM_RELIABLE_CHANNELS],

    out_ordered_stamps: [u16; NUM_ORDERED_LANES],
    in_ordered_stamps: [Option<u16>; NUM_ORDERED_LANES],

    hold: Vec<u8>,
    hold_count: usize,
    hold_since: Option<Instant>,

    last_send: Instant,
    last_receive: Instant,
    next_connect_attempt: Instant,
    last_port_alive: Instant,
    last_clock_sync: Option<Instant>,
    icmp_first_error: Option<Instant>,
    remap_requested: bool,

    clock_sync_stamp: u16,
    outstanding_syncs: FxHashMap<u16, Instant>,
    /// Offset of the peer's elapsed-time clock relative to ours, in ms, taken
    ///  from the best reflect sample so far.
    sync_time_delta_ms: i64,
    sync_adopted_at: Option<Instant>,

    stats: ConnectionStats,
}

impl Connection {
    pub(crate) fn new_outbound(
        config: Arc<ManagerConfig>,
        driver: Arc<dyn SocketDriver>,
        pool: Arc<PacketPool>,
        peer: SocketAddr,
        now: Instant,
    ) -> Arc<Connection> {
        let connect_code = rand::random();
        Arc::new(Connection {
            connect_code,
            inner: Mutex::new(ConnectionInner::new(
                config,
                driver,
                pool,
                peer,
                connect_code,
                true,
                now,
            )),
        })
    }

    /// Accepting side, created by the manager on an inbound Connect. Connected
    ///  from the start, but the Confirm reply stays unsent until the manager
    ///  accepts the peer via [Connection::confirm_accepted].
    pub(crate) fn new_inbound(
        config: Arc<ManagerConfig>,
        driver: Arc<dyn SocketDriver>,
        pool: Arc<PacketPool>,
        peer: SocketAddr,
        connect: &ConnectPacket,
        now: Instant,
    ) -> Arc<Connection> {
        let mut inner = ConnectionInner::new(
            config.clone(),
            driver,
            pool,
            peer,
            connect.connect_code,
            false,
            now,
        );

        let encrypt_code = rand::random();
        let negotiated_raw = config
            .max_raw_packet_size
            .min(connect.max_raw_packet_size as usize);
        let confirm = ConfirmPacket {
            connect_code: connect.connect_code,
            encrypt_code,
            crc_bytes: config.crc_bytes,
            encrypt_methods: config.encrypt_methods,
            max_raw_packet_size: negotiated_raw as u32,
            protocol_version: PROTOCOL_VERSION,
        };
        inner.adopt_pipeline(encrypt_code, confirm.crc_bytes, confirm.encrypt_methods, negotiated_raw);
        inner.status = Status::Connected;
        inner.confirm = Some(confirm);

        Arc::new(Connection {
            connect_code: connect.connect_code,
            inner: Mutex::new(inner),
        })
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.lock().peer
    }

    pub(crate) fn connect_code(&self) -> u32 {
        self.connect_code
    }

    pub(crate) fn encrypt_code(&self) -> u32 {
        self.lock().encrypt_code
    }

    pub(crate) fn set_peer_address(&self, peer: SocketAddr) {
        self.lock().peer = peer;
    }

    /// Transmits the stored Confirm once the manager has accepted the peer.
    ///  Until then the peer keeps retrying its Connect and must not believe it
    ///  is connected.
    pub(crate) fn confirm_accepted(&self, now: Instant) {
        let mut inner = self.lock();
        if let Some(confirm) = inner.confirm.clone() {
            inner.send_confirm(now, &confirm);
            inner.confirm_sent = true;
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        self.lock().stats.clone()
    }

    /// Offset of the peer's elapsed-time clock relative to ours in ms, from the
    ///  best clock-sync sample so far. Zero until the first reflect arrives.
    pub fn peer_time_delta_ms(&self) -> i64 {
        self.lock().sync_time_delta_ms
    }

    /// Time since the last datagram arrived from the peer.
    pub fn last_received_elapsed(&self) -> Duration {
        self.lock().last_receive.elapsed()
    }

    /// Time since this side last put a datagram on the wire.
    pub fn last_sent_elapsed(&self) -> Duration {
        self.lock().last_send.elapsed()
    }

    /// Largest payload `send_unreliable` accepts, determined by the negotiated
    ///  raw packet size and pipeline overhead. Zero while still negotiating.
    pub fn max_payload_size(&self) -> usize {
        self.lock().max_cooked_packet_size
    }

    /// The reason this connection ended, once `status` is `Disconnected`.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.lock().disconnect_reason
    }

    /// The reason the peer reported in its Terminate packet, if it sent one.
    pub fn peer_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.lock().peer_disconnect_reason
    }

    pub fn set_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        self.lock().handler = Some(handler);
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.lock().handler.clone()
    }

    /// Queues `data` for exactly-once in-order delivery on one of the four
    ///  reliable channels.
    pub fn send_reliable(&self, channel: usize, data: &[u8]) -> anyhow::Result<()> {
        if channel >= NUM_RELIABLE_CHANNELS {
            bail!("reliable channel must be 0..{}, was {}", NUM_RELIABLE_CHANNELS, channel);
        }
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            inner.ensure_connected()?;
            let mut out = ChannelOutput::default();
            let accepted = inner.channel_mut(channel).send(now, data, &mut out);
            inner.apply_channel_output(now, out, &[], &mut events);
            if !accepted {
                inner.terminate(now, DisconnectReason::ReliableOverflow, true, &mut events);
                drop(inner);
                self.fire_events(events);
                bail!("reliable channel {} overflowed", channel);
            }
        }
        self.fire_events(events);
        Ok(())
    }

    /// Fire-and-forget send. Must fit a single datagram.
    pub fn send_unreliable(&self, data: &[u8]) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.ensure_connected()?;

        let escape = data.first() == Some(&INTERNAL_PACKET_MARKER);
        let needed = data.len() + if escape { 2 } else { 0 };
        if needed > inner.max_cooked_packet_size {
            bail!(
                "unreliable payload of {} bytes exceeds the packet size limit of {}",
                data.len(),
                inner.max_cooked_packet_size
            );
        }
        if escape {
            let mut cooked = Vec::with_capacity(needed);
            cooked.push(INTERNAL_PACKET_MARKER);
            cooked.push(PacketType::ZeroEscape.into());
            cooked.extend_from_slice(data);
            inner.send_cooked(now, &cooked);
        } else {
            inner.send_cooked(now, data);
        }
        Ok(())
    }

    /// Unreliable send on one of two ordered lanes: packets arriving behind the
    ///  newest delivered one are dropped on the receiving side.
    pub fn send_ordered(&self, lane: usize, data: &[u8]) -> anyhow::Result<()> {
        if lane >= NUM_ORDERED_LANES {
            bail!("ordered lane must be 0..{}, was {}", NUM_ORDERED_LANES, lane);
        }
        let now = Instant::now();
        let mut inner = self.lock();
        inner.ensure_connected()?;
        if data.len() + 4 > inner.max_cooked_packet_size {
            bail!(
                "ordered payload of {} bytes exceeds the packet size limit",
                data.len()
            );
        }

        let stamp = inner.out_ordered_stamps[lane].wrapping_add(1);
        inner.out_ordered_stamps[lane] = stamp;
        let packet_type = if lane == 0 { PacketType::Ordered } else { PacketType::Ordered2 };
        let mut cooked = Vec::with_capacity(4 + data.len());
        cooked.push(INTERNAL_PACKET_MARKER);
        cooked.push(packet_type.into());
        cooked.extend_from_slice(&stamp.to_be_bytes());
        cooked.extend_from_slice(data);
        inner.send_cooked(now, &cooked);
        Ok(())
    }

    /// Terminates immediately. Queued reliable data is abandoned; the peer gets
    ///  a best-effort Terminate notification. The terminated callback fires
    ///  inside this call.
    pub fn disconnect(&self) {
        let now = Instant::now();
        let mut events = Vec::new();
        self.lock().terminate(now, DisconnectReason::Application, true, &mut events);
        self.fire_events(events);
    }

    /// Keeps the connection alive until every queued reliable byte has been
    ///  acknowledged or `flush_timeout` passes, then terminates with
    ///  `Application`. Zero finalizes immediately; new sends are refused in the
    ///  meantime.
    pub fn disconnect_after_flush(&self, flush_timeout: Duration) {
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            if inner.status == Status::Connected || inner.status == Status::Negotiating {
                if flush_timeout.is_zero() {
                    inner.terminate(now, DisconnectReason::Application, true, &mut events);
                } else {
                    inner.status = Status::DisconnectPending;
                    inner.disconnect_deadline = Some(now + flush_timeout);
                }
            }
        }
        self.fire_events(events);
    }

    pub(crate) fn process_raw_packet(&self, now: Instant, data: &[u8]) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        self.lock().process_raw_packet(now, data, &mut events);
        events
    }

    /// Periodic work: resends, acks, keep-alives, timeouts. Returns the events
    ///  to dispatch and when this connection wants time again.
    pub(crate) fn give_time(&self, now: Instant) -> (Vec<ConnectionEvent>, Instant) {
        let mut events = Vec::new();
        let next_due = self.lock().give_time(now, &mut events);
        (events, next_due)
    }

    pub(crate) fn on_port_unreachable(&self, now: Instant) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        self.lock().on_port_unreachable(now, &mut events);
        events
    }

    pub(crate) fn terminated_by_manager(&self, now: Instant, reason: DisconnectReason) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        self.lock().terminate(now, reason, true, &mut events);
        events
    }

    /// Invokes the handler for each event, with no lock held.
    pub(crate) fn fire_events(&self, events: Vec<ConnectionEvent>) {
        if events.is_empty() {
            return;
        }
        let handler = self.handler();
        let Some(handler) = handler else {
            trace!("dropping {} events of handlerless connection", events.len());
            return;
        };
        for event in events {
            match event {
                ConnectionEvent::Routed(data) => handler.on_route_packet(&data),
                ConnectionEvent::ConnectComplete => handler.on_connect_complete(),
                ConnectionEvent::Terminated(reason) => handler.on_terminated(reason),
                ConnectionEvent::CrcReject(data) => handler.on_crc_reject(&data),
                ConnectionEvent::PacketCorrupt(data, reason) => {
                    handler.on_packet_corrupt(&data, reason)
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ConnectionInner {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: Arc<ManagerConfig>,
        driver: Arc<dyn SocketDriver>,
        pool: Arc<PacketPool>,
        peer: SocketAddr,
        connect_code: u32,
        initiator: bool,
        now: Instant,
    ) -> ConnectionInner {
        ConnectionInner {
            config,
            driver,
            pool,
            handler: None,
            status: Status::Negotiating,
            peer,
            initiator,
            created: now,
            disconnect_deadline: None,
            disconnect_reason: None,
            peer_disconnect_reason: None,
            connect_code,
            encrypt_code: 0,
            pipeline: None,
            max_cooked_packet_size: 0,
            confirm: None,
            confirm_sent: false,
            channels: Default::default(),
            out_ordered_stamps: [0; NUM_ORDERED_LANES],
            in_ordered_stamps: [None; NUM_ORDERED_LANES],
            hold: Vec::new(),
            hold_count: 0,
            hold_since: None,
            last_send: now,
            last_receive: now,
            next_connect_attempt: now,
            last_port_alive: now,
            last_clock_sync: None,
            icmp_first_error: None,
            remap_requested: false,
            clock_sync_stamp: 0,
            outstanding_syncs: FxHashMap::default(),
            sync_time_delta_ms: 0,
            sync_adopted_at: None,
            stats: ConnectionStats::default(),
        }
    }

    fn adopt_pipeline(
        &mut self,
        encrypt_code: u32,
        crc_bytes: u8,
        methods: [crate::config::EncryptMethod; 2],
        negotiated_raw: usize,
    ) {
        self.encrypt_code = encrypt_code;
        let pipeline = RawPipeline::new(
            methods,
            self.config.user_transforms.clone(),
            encrypt_code,
            crc_bytes,
            negotiated_raw,
        );
        self.max_cooked_packet_size = negotiated_raw - pipeline.overhead();
        self.pipeline = Some(pipeline);
    }

    fn ensure_connected(&self) -> anyhow::Result<()> {
        match self.status {
            Status::Connected => Ok(()),
            Status::Negotiating => bail!("still negotiating"),
            Status::DisconnectPending => bail!("disconnect pending"),
            Status::Disconnected => bail!("disconnected"),
        }
    }

    fn channel_mut(&mut self, channel: usize) -> &mut ReliableChannel {
        let config = self.config.reliable[channel].clone();
        let max_cooked = self.max_cooked_packet_size;
        let pool = self.pool.clone();
        self.channels[channel]
            .get_or_insert_with(|| ReliableChannel::new(channel, config, max_cooked, pool))
    }

    // ----------------------------------------------------- inbound

    fn process_raw_packet(&mut self, now: Instant, data: &[u8], events: &mut Vec<ConnectionEvent>) {
        if self.status == Status::Disconnected {
            return;
        }
        self.stats.received_datagrams += 1;
        self.stats.received_bytes += data.len() as u64;
        self.last_receive = now;
        self.icmp_first_error = None;

        // negotiation and teardown control packets bypass the pipeline
        if data.len() >= 2 && data[0] == INTERNAL_PACKET_MARKER {
            if let Ok(packet_type) = PacketType::try_from(data[1]) {
                if packet_type.is_unencrypted_control() {
                    self.process_control(now, packet_type, &data[2..], events);
                    return;
                }
            }
        }

        let Some(pipeline) = &self.pipeline else {
            trace!("dropping non-control packet while negotiating");
            return;
        };
        let cooked = match pipeline.decode(data) {
            Ok(cooked) => cooked,
            Err(DecodeError::TooShort) => {
                events.push(ConnectionEvent::PacketCorrupt(
                    data.to_vec(),
                    CorruptionReason::CrcBytesExceedPacket,
                ));
                self.terminate(now, DisconnectReason::CorruptPacket, true, events);
                return;
            }
            Err(DecodeError::CrcMismatch) | Err(DecodeError::TransformFailed) => {
                self.stats.crc_rejects += 1;
                events.push(ConnectionEvent::CrcReject(data.to_vec()));
                return;
            }
        };
        // decodable traffic proves the peer knows us again, so a later NAT
        //  rebind gets its own remap recovery attempt
        self.remap_requested = false;
        self.dispatch_cooked(now, &cooked, 0, events);
    }

    fn process_control(
        &mut self,
        now: Instant,
        packet_type: PacketType,
        payload: &[u8],
        events: &mut Vec<ConnectionEvent>,
    ) {
        let mut buf = payload;
        match packet_type {
            PacketType::Confirm => {
                let Ok(confirm) = ConfirmPacket::deser(&mut buf) else {
                    return;
                };
                self.on_confirm(now, confirm, events);
            }
            PacketType::Connect => {
                let Ok(connect) = ConnectPacket::deser(&mut buf) else {
                    return;
                };
                self.on_crossed_connect(now, connect, events);
            }
            PacketType::Terminate => {
                let Ok(terminate) = TerminatePacket::deser(&mut buf) else {
                    return;
                };
                if terminate.connect_code != self.connect_code {
                    return;
                }
                self.peer_disconnect_reason = terminate.reason;
                self.terminate(now, DisconnectReason::OtherSideTerminated, false, events);
            }
            PacketType::UnreachableConnection => {
                self.on_unreachable(now, events);
            }
            // handled at manager level; ignore if addressed at a connection
            PacketType::RequestRemap | PacketType::ServerStatus => {}
            _ => {}
        }
    }

    fn on_confirm(&mut self, now: Instant, confirm: ConfirmPacket, events: &mut Vec<ConnectionEvent>) {
        if !self.initiator || confirm.connect_code != self.connect_code {
            return;
        }
        if self.status != Status::Negotiating {
            return; // duplicate Confirm from a Connect retry
        }
        if confirm.protocol_version != PROTOCOL_VERSION {
            debug!(
                "peer {} confirmed with protocol version {}, ours is {}",
                self.peer, confirm.protocol_version, PROTOCOL_VERSION
            );
            self.terminate(now, DisconnectReason::ConnectFail, false, events);
            return;
        }

        if confirm.crc_bytes > 4 || (confirm.max_raw_packet_size as usize) < MIN_RAW_PACKET_SIZE {
            debug!(
                "peer {} confirmed with unusable raw-packet parameters ({} bytes, crc {})",
                self.peer, confirm.max_raw_packet_size, confirm.crc_bytes
            );
            self.terminate(now, DisconnectReason::ConnectFail, false, events);
            return;
        }

        let negotiated_raw = self
            .config
            .max_raw_packet_size
            .min(confirm.max_raw_packet_size as usize);
        self.adopt_pipeline(
            confirm.encrypt_code,
            confirm.crc_bytes,
            confirm.encrypt_methods,
            negotiated_raw,
        );
        self.status = Status::Connected;
        debug!("connection to {} negotiated, {} raw bytes per datagram", self.peer, negotiated_raw);
        events.push(ConnectionEvent::ConnectComplete);
    }

    /// A Connect packet arriving at an already existing connection.
    fn on_crossed_connect(&mut self, now: Instant, connect: ConnectPacket, events: &mut Vec<ConnectionEvent>) {
        if !self.initiator {
            if connect.connect_code == self.connect_code {
                // the peer retried before our Confirm arrived; resend only once
                //  the manager has actually accepted the peer
                if self.confirm_sent {
                    if let Some(confirm) = self.confirm.clone() {
                        self.send_confirm(now, &confirm);
                    }
                }
            } else {
                // the peer restarted and is negotiating from scratch; tear this
                //  connection down so the manager can accept the fresh one
                self.terminate(now, DisconnectReason::NewConnectionAttempt, false, events);
            }
            return;
        }
        if connect.connect_code == self.connect_code {
            self.terminate(now, DisconnectReason::ConnectingToSelf, false, events);
        } else {
            self.terminate(now, DisconnectReason::MutualConnectError, false, events);
        }
    }

    fn on_unreachable(&mut self, now: Instant, events: &mut Vec<ConnectionEvent>) {
        if self.status == Status::Negotiating {
            self.terminate(now, DisconnectReason::ConnectionRefused, false, events);
            return;
        }
        if self.config.allow_port_remapping && !self.remap_requested {
            // the peer may simply have lost our NAT mapping; ask it to re-index
            //  us under the new source address before giving up
            debug!("peer {} does not know us, requesting a remap", self.peer);
            self.remap_requested = true;
            let mut packet = Vec::with_capacity(10);
            RequestRemapPacket {
                connect_code: self.connect_code,
                encrypt_code: self.encrypt_code,
            }
            .ser(&mut packet);
            self.transmit_raw(now, &packet);
        } else {
            self.terminate(now, DisconnectReason::UnreachableConnection, false, events);
        }
    }

    fn dispatch_cooked(
        &mut self,
        now: Instant,
        data: &[u8],
        depth: u32,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if data.is_empty() {
            return;
        }
        if data[0] != INTERNAL_PACKET_MARKER {
            events.push(ConnectionEvent::Routed(data.to_vec()));
            return;
        }
        if depth >= MAX_DISPATCH_DEPTH {
            self.corrupt(now, data, CorruptionReason::NestedTooDeep, events);
            return;
        }
        if data.len() < 2 {
            self.corrupt(now, data, CorruptionReason::TruncatedHeader, events);
            return;
        }
        let Ok(packet_type) = PacketType::try_from(data[1]) else {
            self.corrupt(now, data, CorruptionReason::TruncatedHeader, events);
            return;
        };

        if let Some(channel_packet) = packet_type.channel_packet() {
            self.dispatch_channel_packet(now, channel_packet, data, events);
            return;
        }

        match packet_type {
            PacketType::ZeroEscape => {
                events.push(ConnectionEvent::Routed(data[2..].to_vec()));
            }
            PacketType::Multi => {
                if depth > 0 {
                    self.corrupt(now, data, CorruptionReason::NestedTooDeep, events);
                    return;
                }
                let mut buf = &data[2..];
                while !buf.is_empty() {
                    let len = buf[0] as usize;
                    let rest = &buf[1..];
                    if len > rest.len() {
                        self.corrupt(now, data, CorruptionReason::LengthOverrun, events);
                        return;
                    }
                    self.dispatch_cooked(now, &rest[..len], depth + 1, events);
                    if self.status == Status::Disconnected {
                        return;
                    }
                    buf = &rest[len..];
                }
            }
            PacketType::Group => {
                self.route_group(now, &data[2..], data, events);
            }
            PacketType::Ordered | PacketType::Ordered2 => {
                if data.len() < 4 {
                    self.corrupt(now, data, CorruptionReason::TruncatedHeader, events);
                    return;
                }
                let lane = if packet_type == PacketType::Ordered { 0 } else { 1 };
                let stamp = u16::from_be_bytes([data[2], data[3]]);
                let fresh = match self.in_ordered_stamps[lane] {
                    None => true,
                    Some(last) => {
                        let ahead = stamp.wrapping_sub(last);
                        ahead != 0 && ahead <= ORDERED_FRESH_WINDOW
                    }
                };
                if fresh {
                    self.in_ordered_stamps[lane] = Some(stamp);
                    events.push(ConnectionEvent::Routed(data[4..].to_vec()));
                } else {
                    self.stats.order_rejects += 1;
                }
            }
            PacketType::KeepAlive | PacketType::PortAlive => {
                // nothing to do, receive timers were already refreshed
            }
            PacketType::ClockSync => {
                let mut buf = &data[2..];
                if let Ok(sync) = ClockSyncPacket::deser(&mut buf) {
                    self.on_clock_sync(now, sync);
                }
            }
            PacketType::ClockReflect => {
                let mut buf = &data[2..];
                if let Ok(reflect) = ClockReflectPacket::deser(&mut buf) {
                    self.on_clock_reflect(now, reflect);
                }
            }
            _ => {
                debug!("ignoring unexpected packet type {:?} inside a cooked packet", packet_type);
            }
        }
    }

    fn dispatch_channel_packet(
        &mut self,
        now: Instant,
        channel_packet: wire::ChannelPacket,
        data: &[u8],
        events: &mut Vec<ConnectionEvent>,
    ) {
        if data.len() < 4 {
            self.corrupt(now, data, CorruptionReason::TruncatedHeader, events);
            return;
        }
        let stamp = u16::from_be_bytes([data[2], data[3]]);
        let payload = &data[4..];

        let mut out = ChannelOutput::default();
        match channel_packet {
            wire::ChannelPacket::Reliable(ch) => {
                let channel = self.channel_mut(ch);
                channel.on_reliable(stamp, payload, false, &mut out);
                channel.flush_acks(&mut out);
            }
            wire::ChannelPacket::Fragment(ch) => {
                let channel = self.channel_mut(ch);
                channel.on_reliable(stamp, payload, true, &mut out);
                channel.flush_acks(&mut out);
            }
            wire::ChannelPacket::Ack(ch) => {
                self.channel_mut(ch).on_ack(now, stamp, &mut out);
            }
            wire::ChannelPacket::AckAll(ch) => {
                self.channel_mut(ch).on_ack_all(now, stamp);
            }
        }
        self.apply_channel_output(now, out, data, events);
    }

    /// Transmits and routes everything a channel operation produced.
    fn apply_channel_output(
        &mut self,
        now: Instant,
        out: ChannelOutput,
        source: &[u8],
        events: &mut Vec<ConnectionEvent>,
    ) {
        self.stats.duplicate_reliable += out.duplicates;
        self.stats.resent_accelerated += out.resends_accelerated;
        self.stats.resent_timed_out += out.resends_timed_out;

        for cooked in &out.cooked {
            self.send_cooked(now, cooked);
        }
        for payload in out.delivered {
            self.route_logical(now, payload, events);
            if self.status == Status::Disconnected {
                return;
            }
        }
        if let Some(reason) = out.corrupt {
            self.corrupt(now, source, reason, events);
        }
    }

    /// A complete logical packet delivered by a reliable channel: raw
    ///  application data, a ZeroEscape wrapper, or a Group of coalesced sends.
    fn route_logical(&mut self, now: Instant, data: Vec<u8>, events: &mut Vec<ConnectionEvent>) {
        if data.is_empty() {
            return;
        }
        if data[0] != INTERNAL_PACKET_MARKER {
            events.push(ConnectionEvent::Routed(data));
            return;
        }
        if data.len() < 2 {
            self.corrupt(now, &data, CorruptionReason::TruncatedHeader, events);
            return;
        }
        match PacketType::try_from(data[1]) {
            Ok(PacketType::ZeroEscape) => {
                events.push(ConnectionEvent::Routed(data[2..].to_vec()));
            }
            Ok(PacketType::Group) => {
                self.route_group(now, &data[2..], &data, events);
            }
            _ => {
                self.corrupt(now, &data, CorruptionReason::TruncatedHeader, events);
            }
        }
    }

    /// Group entries are varint-length-prefixed application payloads, stored
    ///  verbatim, so they route directly without further dispatch.
    fn route_group(
        &mut self,
        now: Instant,
        mut entries: &[u8],
        source: &[u8],
        events: &mut Vec<ConnectionEvent>,
    ) {
        while !entries.is_empty() {
            let len = match entries.try_get_usize_varint() {
                Ok(len) => len,
                Err(_) => {
                    self.corrupt(now, source, CorruptionReason::TruncatedHeader, events);
                    return;
                }
            };
            if len > entries.remaining() {
                self.corrupt(now, source, CorruptionReason::LengthOverrun, events);
                return;
            }
            events.push(ConnectionEvent::Routed(entries[..len].to_vec()));
            entries.advance(len);
        }
    }

    fn corrupt(
        &mut self,
        now: Instant,
        data: &[u8],
        reason: CorruptionReason,
        events: &mut Vec<ConnectionEvent>,
    ) {
        warn!("corrupt packet from {}: {:?}", self.peer, reason);
        self.stats.corrupt_packets += 1;
        events.push(ConnectionEvent::PacketCorrupt(data.to_vec(), reason));
        self.terminate(now, DisconnectReason::CorruptPacket, true, events);
    }

    // ----------------------------------------------------- clock sync

    fn on_clock_sync(&mut self, now: Instant, sync: ClockSyncPacket) {
        let elapsed_ms = now.duration_since(self.created).as_millis() as u32;
        let mut cooked = Vec::with_capacity(40);
        ClockReflectPacket {
            stamp: sync.stamp,
            server_sync_stamp: elapsed_ms,
            your_sent: sync.our_sent,
            your_received: sync.our_received,
            our_sent: self.stats.sent_datagrams,
            our_received: self.stats.received_datagrams,
        }
        .ser(&mut cooked);
        self.transmit_cooked(now, &cooked);
    }

    fn on_clock_reflect(&mut self, now: Instant, reflect: ClockReflectPacket) {
        let Some(sent_at) = self.outstanding_syncs.remove(&reflect.stamp) else {
            return;
        };
        let rtt = now.duration_since(sent_at).as_millis() as u32;
        self.stats.last_ping_ms = rtt;
        if self.stats.low_ping_ms == 0 || rtt < self.stats.low_ping_ms {
            self.stats.low_ping_ms = rtt;
        }
        if rtt > self.stats.high_ping_ms {
            self.stats.high_ping_ms = rtt;
        }
        self.stats.average_ping_ms = if self.stats.average_ping_ms == 0 {
            rtt
        } else {
            (self.stats.average_ping_ms * 7 + rtt) / 8
        };

        // Correlate clocks only from good samples. A slow round trip smears
        //  the midpoint estimate, so a sample must beat the adopted round time
        //  within a small margin, unless the adopted one has grown stale.
        let adopt = match self.sync_adopted_at {
            None => true,
            Some(at) => {
                rtt <= self.stats.master_ping_ms.saturating_add(20)
                    || now.duration_since(at) >= Duration::from_secs(120)
            }
        };
        if adopt {
            let our_elapsed = now.duration_since(self.created).as_millis() as i64;
            let peer_elapsed = i64::from(reflect.server_sync_stamp) + i64::from(rtt / 2);
            self.sync_time_delta_ms = peer_elapsed - our_elapsed;
            self.sync_adopted_at = Some(now);
            self.stats.master_ping_ms = rtt;
        }
    }

    fn send_clock_sync(&mut self, now: Instant) {
        self.clock_sync_stamp = self.clock_sync_stamp.wrapping_add(1);
        let stamp = self.clock_sync_stamp;
        self.outstanding_syncs.insert(stamp, now);
        // drop probes the peer never answered
        if self.outstanding_syncs.len() > 32 {
            let stale: Vec<u16> = self
                .outstanding_syncs
                .iter()
                .filter(|(_, sent)| now.duration_since(**sent) > Duration::from_secs(30))
                .map(|(stamp, _)| *stamp)
                .collect();
            for stamp in stale {
                self.outstanding_syncs.remove(&stamp);
            }
        }

        let mut cooked = Vec::with_capacity(40);
        ClockSyncPacket {
            stamp,
            master_ping: self.stats.master_ping_ms,
            avg_ping: self.stats.average_ping_ms,
            low_ping: self.stats.low_ping_ms,
            high_ping: self.stats.high_ping_ms,
            last_ping: self.stats.last_ping_ms,
            our_sent: self.stats.sent_datagrams,
            our_received: self.stats.received_datagrams,
        }
        .ser(&mut cooked);
        self.transmit_cooked(now, &cooked);
    }

    // ----------------------------------------------------- outbound

    /// Sends or holds one cooked packet. Small packets are batched into a Multi
    ///  datagram until `max_data_hold_time` elapses or the datagram fills up.
    fn send_cooked(&mut self, now: Instant, cooked: &[u8]) {
        let max_cooked = self.max_cooked_packet_size;
        let holdable = !self.config.max_data_hold_time.is_zero()
            && cooked.len() <= u8::MAX as usize
            && 2 + 1 + cooked.len() <= max_cooked;
        if !holdable {
            // preserve ordering relative to anything already held
            self.flush_hold(now);
            self.transmit_cooked(now, cooked);
            return;
        }
        if 2 + self.hold.len() + 1 + cooked.len() > max_cooked {
            self.flush_hold(now);
        }
        if self.hold_count == 0 {
            self.hold_since = Some(now);
        }
        self.hold.push(cooked.len() as u8);
        self.hold.extend_from_slice(cooked);
        self.hold_count += 1;
    }

    fn flush_hold(&mut self, now: Instant) {
        if self.hold_count == 0 {
            return;
        }
        if self.hold_count == 1 {
            let single = self.hold[1..].to_vec();
            self.transmit_cooked(now, &single);
        } else {
            trace!("flushing {} held packets as one Multi datagram", self.hold_count);
            let mut multi = Vec::with_capacity(2 + self.hold.len());
            multi.push(INTERNAL_PACKET_MARKER);
            multi.push(PacketType::Multi.into());
            multi.extend_from_slice(&self.hold);
            self.transmit_cooked(now, &multi);
        }
        self.hold.clear();
        self.hold_count = 0;
        self.hold_since = None;
    }

    /// Runs the pipeline and puts one datagram on the wire.
    fn transmit_cooked(&mut self, now: Instant, cooked: &[u8]) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };
        let raw = pipeline.encode(cooked);
        self.transmit_raw(now, &raw);
    }

    fn transmit_raw(&mut self, now: Instant, raw: &[u8]) {
        if !self.driver.send_to(self.peer, raw) {
            debug!("driver refused a {} byte datagram to {}", raw.len(), self.peer);
        }
        self.last_send = now;
        self.stats.sent_datagrams += 1;
        self.stats.sent_bytes += raw.len() as u64;
    }

    fn send_confirm(&mut self, now: Instant, confirm: &ConfirmPacket) {
        let mut packet = Vec::with_capacity(32);
        confirm.ser(&mut packet);
        self.transmit_raw(now, &packet);
    }

    // ----------------------------------------------------- timers

    fn give_time(&mut self, now: Instant, events: &mut Vec<ConnectionEvent>) -> Instant {
        match self.status {
            Status::Disconnected => now + Duration::from_secs(3600),
            Status::Negotiating => self.give_time_negotiating(now, events),
            Status::Connected | Status::DisconnectPending => self.give_time_connected(now, events),
        }
    }

    fn give_time_negotiating(&mut self, now: Instant, events: &mut Vec<ConnectionEvent>) -> Instant {
        if let Some(timeout) = self.config.connect_attempt_timeout {
            if now.duration_since(self.created) >= timeout {
                self.terminate(now, DisconnectReason::ConnectFail, false, events);
                return now + Duration::from_secs(3600);
            }
        }
        if now >= self.next_connect_attempt {
            let mut packet = Vec::with_capacity(48);
            ConnectPacket {
                protocol_version: PROTOCOL_VERSION,
                connect_code: self.connect_code,
                max_raw_packet_size: self.config.max_raw_packet_size as u32,
                protocol_name: self.config.protocol_name.clone(),
            }
            .ser(&mut packet);
            self.transmit_raw(now, &packet);
            self.next_connect_attempt = now + self.config.connect_attempt_delay;
        }
        self.next_connect_attempt
    }

    fn give_time_connected(&mut self, now: Instant, events: &mut Vec<ConnectionEvent>) -> Instant {
        for channel in 0..NUM_RELIABLE_CHANNELS {
            if self.channels[channel].is_none() {
                continue;
            }
            let mut out = ChannelOutput::default();
            if let Some(ch) = self.channels[channel].as_mut() {
                ch.give_time(now, &mut out);
            }
            self.apply_channel_output(now, out, &[], events);
            if self.status == Status::Disconnected {
                return now + Duration::from_secs(3600);
            }
        }

        if let Some(since) = self.hold_since {
            if now.duration_since(since) >= self.config.max_data_hold_time {
                self.flush_hold(now);
            }
        }

        if let Some(delay) = self.config.keep_alive_delay {
            if now.duration_since(self.last_send) >= delay {
                self.transmit_cooked(now, &[INTERNAL_PACKET_MARKER, PacketType::KeepAlive.into()]);
            }
        }
        if let Some(delay) = self.config.port_alive_delay {
            if now.duration_since(self.last_port_alive) >= delay {
                self.send_port_alive(now);
            }
        }
        if let Some(delay) = self.config.clock_sync_delay {
            if self.initiator {
                let due = match self.last_clock_sync {
                    None => true,
                    Some(last) => now.duration_since(last) >= delay,
                };
                if due {
                    self.last_clock_sync = Some(now);
                    self.send_clock_sync(now);
                }
            }
        }

        if let Some(timeout) = self.config.no_data_timeout {
            if now.duration_since(self.last_receive) >= timeout {
                debug!("peer {} went silent, disconnecting", self.peer);
                self.terminate(now, DisconnectReason::Timeout, true, events);
                return now + Duration::from_secs(3600);
            }
        }
        if let Some(timeout) = self.config.oldest_unacknowledged_timeout {
            let oldest = self
                .channels
                .iter()
                .flatten()
                .filter_map(|ch| ch.oldest_unacked_age(now))
                .max();
            if oldest.is_some_and(|age| age >= timeout) {
                debug!("peer {} stopped acknowledging, disconnecting", self.peer);
                self.terminate(now, DisconnectReason::UnacknowledgedTimeout, true, events);
                return now + Duration::from_secs(3600);
            }
        }

        if self.status == Status::DisconnectPending {
            let pending: usize = self.channels.iter().flatten().map(|ch| ch.pending_bytes()).sum();
            let drained = pending == 0 && self.hold_count == 0;
            let deadline_passed = self.disconnect_deadline.is_some_and(|deadline| now >= deadline);
            if drained || deadline_passed {
                if !drained {
                    debug!("abandoning {} unflushed bytes to {}", pending, self.peer);
                }
                self.terminate(now, DisconnectReason::Application, true, events);
                return now + Duration::from_secs(3600);
            }
        }

        self.next_due(now)
    }

    fn next_due(&self, now: Instant) -> Instant {
        let busy = self.channels.iter().flatten().any(|ch| ch.pending_bytes() > 0);
        if busy {
            return now + Duration::from_millis(30);
        }
        if let Some(since) = self.hold_since {
            return (since + self.config.max_data_hold_time).max(now);
        }
        now + Duration::from_millis(100)
    }

    /// Port-alive packets carry a short TTL so they refresh NAT mappings along
    ///  the route without ever reaching the peer.
    fn send_port_alive(&mut self, now: Instant) {
        self.last_port_alive = now;
        let saved_ttl = self.driver.ttl();
        self.driver.set_ttl(PORT_ALIVE_TTL);
        self.transmit_cooked(now, &[INTERNAL_PACKET_MARKER, PacketType::PortAlive.into()]);
        self.driver.set_ttl(saved_ttl);
    }

    fn on_port_unreachable(&mut self, now: Instant, events: &mut Vec<ConnectionEvent>) {
        if self.status == Status::Disconnected {
            return;
        }
        match self.icmp_first_error {
            None => {
                // momentary blips and remap races produce spurious unreachables,
                //  only a persistent error counts
                self.icmp_first_error = Some(now);
            }
            Some(first) => {
                if now.duration_since(first) >= self.config.icmp_error_retry_period {
                    debug!("persistent ICMP errors for {}, disconnecting", self.peer);
                    self.terminate(now, DisconnectReason::IcmpError, false, events);
                }
            }
        }
    }

    fn terminate(
        &mut self,
        now: Instant,
        reason: DisconnectReason,
        notify_peer: bool,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if self.status == Status::Disconnected {
            return;
        }
        self.status = Status::Disconnected;
        self.disconnect_reason = Some(reason);
        debug!("connection to {} terminated: {:?}", self.peer, reason);
        if notify_peer {
            let mut packet = Vec::with_capacity(10);
            TerminatePacket {
                connect_code: self.connect_code,
                reason: Some(reason),
            }
            .ser(&mut packet);
            self.transmit_raw(now, &packet);
        }
        events.push(ConnectionEvent::Terminated(reason));
    }
}
