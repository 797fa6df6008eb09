//! The sliding-window reliable delivery engine - one instance per
//!  (connection, channel number 0-3), lazily created on first use.
//!
//! Outgoing: small sends coalesce into a shared Group staging buffer; everything
//!  else becomes its own logical packet in a FIFO. `pull_down` slices the head of
//!  the FIFO into physical packets as congestion-window space allows, advancing a
//!  single fragmentation cursor so arbitrarily large sends stream out without one
//!  giant in-flight buffer. Sequence ids are logically unbounded u64 counters,
//!  transmitted as 16-bit wrapped stamps and stored in a ring of
//!  `max_outstanding_packets` slots.
//!
//! Incoming: out-of-order arrivals wait in a ring keyed by id modulo the ring
//!  size; the expected id arriving drains the ring forward contiguously. Only one
//!  fragmented logical packet reassembles at a time per channel.
//!
//! The channel never touches the socket - it emits cooked packets and in-order
//!  application payloads into a [ChannelOutput] that the owning connection runs
//!  through its encryption pipeline and hold buffer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BufMut;
use bytes_varint::VarIntSupportMut;
use tracing::{debug, trace};

use crate::buffers::{LogicalPacket, PacketPool};
use crate::config::ReliableConfig;
use crate::congestion::CongestionWindow;
use crate::wire::{self, CorruptionReason, PacketType, INTERNAL_PACKET_MARKER};

/// marker + type + stamp
const RELIABLE_HEADER_LEN: usize = 4;
/// total-length field on the first fragment of a logical packet
const FRAGMENT_LENGTH_FIELD_LEN: usize = 4;
/// marker + type of the Group wrapper around coalesced sends
const GROUP_HEADER_LEN: usize = 2;

/// Backlog limit as a multiple of the in-flight byte cap; exceeding it is a
///  `ReliableOverflow` disconnect.
const QUEUE_OVERFLOW_FACTOR: usize = 8;

const INITIAL_AVG_PING_MS: u64 = 400;

/// Everything one processing step produced: cooked packets to transmit,
///  application payloads in delivery order, and bookkeeping for the owning
///  connection's statistics.
#[derive(Default)]
pub struct ChannelOutput {
    pub cooked: Vec<Vec<u8>>,
    pub delivered: Vec<Vec<u8>>,
    /// Set when inbound framing was unparseable; fatal to the connection.
    pub corrupt: Option<CorruptionReason>,
    pub duplicates: u64,
    pub resends_accelerated: u64,
    pub resends_timed_out: u64,
}

struct PhysicalPacket {
    first_send: Instant,
    last_send: Instant,
    send_count: u32,
    parent: Arc<LogicalPacket>,
    offset: usize,
    len: usize,
    fragment: bool,
}

enum InSlot {
    Data { data: Vec<u8>, fragment: bool },
    /// Already handed to the application by out-of-order delivery; skipped when
    ///  the in-order drain reaches it.
    Consumed,
}

pub struct ReliableChannel {
    channel: usize,
    config: ReliableConfig,
    /// On-wire size of one physical packet including its header.
    fragment_size: usize,
    pool: Arc<PacketPool>,
    congestion: CongestionWindow,

    // outgoing
    next_outgoing_id: u64,
    /// oldest unacknowledged id; invariant: `pending_id <= next_outgoing_id`
    pending_id: u64,
    out_ring: Vec<Option<PhysicalPacket>>,
    outgoing_bytes: usize,
    queue: VecDeque<Arc<LogicalPacket>>,
    queue_bytes: usize,
    fragment_cursor: usize,
    coalesce: Vec<u8>,
    coalesce_count: usize,
    last_pull: Option<Instant>,
    window_was_filled: bool,
    acked_since_tick: bool,
    avg_ping_ms: u64,

    // incoming
    next_incoming_id: u64,
    in_ring: Vec<Option<InSlot>>,
    reassembly: Vec<u8>,
    reassembly_target: usize,
    pending_ack_all: Option<u64>,
    pending_acks: Vec<u64>,
}

impl ReliableChannel {
    pub fn new(
        channel: usize,
        config: ReliableConfig,
        max_cooked_packet_size: usize,
        pool: Arc<PacketPool>,
    ) -> ReliableChannel {
        let fragment_size = if config.fragment_size > 0 {
            config.fragment_size.min(max_cooked_packet_size)
        } else {
            max_cooked_packet_size
        };
        let congestion = CongestionWindow::new(
            fragment_size,
            config.congestion_window_minimum,
            config.tolerance_loss_count,
        );
        let mut out_ring = Vec::new();
        out_ring.resize_with(config.max_outstanding_packets, || None);
        let mut in_ring = Vec::new();
        in_ring.resize_with(config.max_instanding_packets, || None);

        ReliableChannel {
            channel,
            config,
            fragment_size,
            pool,
            congestion,
            next_outgoing_id: 0,
            pending_id: 0,
            out_ring,
            outgoing_bytes: 0,
            queue: VecDeque::new(),
            queue_bytes: 0,
            fragment_cursor: 0,
            coalesce: Vec::new(),
            coalesce_count: 0,
            last_pull: None,
            window_was_filled: false,
            acked_since_tick: false,
            avg_ping_ms: INITIAL_AVG_PING_MS,
            next_incoming_id: 0,
            in_ring,
            reassembly: Vec::new(),
            reassembly_target: 0,
            pending_ack_all: None,
            pending_acks: Vec::new(),
        }
    }

    /// Bytes not yet acknowledged by the peer, including backlog not yet on the
    ///  wire. Zero means a disconnect flush may complete.
    pub fn pending_bytes(&self) -> usize {
        self.outgoing_bytes + self.queue_bytes + self.coalesce.len()
    }

    /// Age of the oldest unacknowledged physical packet.
    pub fn oldest_unacked_age(&self, now: Instant) -> Option<Duration> {
        if self.pending_id >= self.next_outgoing_id {
            return None;
        }
        let slot = self.out_slot(self.pending_id);
        self.out_ring[slot]
            .as_ref()
            .map(|p| now.duration_since(p.first_send))
    }

    pub fn average_ping_ms(&self) -> u64 {
        self.avg_ping_ms
    }

    /// Largest payload a non-fragment physical packet can carry.
    fn single_capacity(&self) -> usize {
        self.fragment_size - RELIABLE_HEADER_LEN
    }

    fn out_slot(&self, id: u64) -> usize {
        (id % self.out_ring.len() as u64) as usize
    }

    fn in_slot(&self, id: u64) -> usize {
        (id % self.in_ring.len() as u64) as usize
    }

    // ----------------------------------------------------- send path

    /// Queues one application payload for exactly-once delivery. Returns false
    ///  on overflow (too many unacknowledged bytes backed up), which the
    ///  connection treats as fatal.
    pub fn send(&mut self, now: Instant, data: &[u8], out: &mut ChannelOutput) -> bool {
        let limit = self.config.max_outstanding_bytes.saturating_mul(QUEUE_OVERFLOW_FACTOR);
        if self.pending_bytes() + data.len() > limit {
            debug!("channel {}: reliable overflow at {} pending bytes", self.channel, self.pending_bytes());
            return false;
        }

        let coalesce_threshold = self.fragment_size / 4;
        if self.config.coalesce && data.len() <= coalesce_threshold {
            let entry_len = varint_len(data.len()) + data.len();
            if GROUP_HEADER_LEN + self.coalesce.len() + entry_len > self.single_capacity() {
                self.flush_coalesce();
            }
            self.coalesce.put_usize_varint(data.len());
            self.coalesce.put_slice(data);
            self.coalesce_count += 1;
        } else {
            self.flush_coalesce();
            let mut packet = self.pool.get_empty();
            if data.first() == Some(&INTERNAL_PACKET_MARKER) {
                // escape application data that happens to look like internal framing
                packet.data_mut().put_u8(INTERNAL_PACKET_MARKER);
                packet.data_mut().put_u8(PacketType::ZeroEscape.into());
            }
            packet.data_mut().put_slice(data);
            self.enqueue(packet);
        }

        self.pull_down(now, out);
        true
    }

    fn flush_coalesce(&mut self) {
        if self.coalesce_count == 0 {
            return;
        }
        trace!("channel {}: flushing {} coalesced sends", self.channel, self.coalesce_count);
        let mut packet = self.pool.get_empty();
        packet.data_mut().put_u8(INTERNAL_PACKET_MARKER);
        packet.data_mut().put_u8(PacketType::Group.into());
        packet.data_mut().put_slice(&self.coalesce);
        self.coalesce.clear();
        self.coalesce_count = 0;
        self.enqueue(packet);
    }

    fn enqueue(&mut self, packet: LogicalPacket) {
        self.queue_bytes += packet.len();
        self.queue.push_back(Arc::new(packet));
    }

    /// Slices the head of the logical queue into physical packets while window,
    ///  ring and trickle budgets allow, transmitting each immediately.
    fn pull_down(&mut self, now: Instant, out: &mut ChannelOutput) {
        if !self.config.trickle_rate.is_zero() {
            if let Some(last) = self.last_pull {
                if now.duration_since(last) < self.config.trickle_rate {
                    return;
                }
            }
        }

        let mut pulled_bytes = 0usize;
        loop {
            let Some(head) = self.queue.front().cloned() else {
                break;
            };
            let total = head.len();
            let is_fragment = total > self.single_capacity();
            let mut capacity = self.single_capacity();
            if is_fragment && self.fragment_cursor == 0 {
                capacity -= FRAGMENT_LENGTH_FIELD_LEN;
            }
            let slice_len = (total - self.fragment_cursor).min(capacity);

            let budget = self.config.max_outstanding_bytes.min(self.congestion.window());
            if self.outgoing_bytes + slice_len > budget {
                self.window_was_filled = true;
                break;
            }
            if self.next_outgoing_id - self.pending_id >= self.out_ring.len() as u64 {
                break;
            }
            if self.config.trickle_size > 0 && pulled_bytes + slice_len > self.config.trickle_size {
                break;
            }

            let id = self.next_outgoing_id;
            self.next_outgoing_id += 1;
            let physical = PhysicalPacket {
                first_send: now,
                last_send: now,
                send_count: 1,
                parent: head.clone(),
                offset: self.fragment_cursor,
                len: slice_len,
                fragment: is_fragment,
            };
            out.cooked.push(build_wire(self.channel, id, &physical));
            let slot = self.out_slot(id);
            self.out_ring[slot] = Some(physical);
            self.outgoing_bytes += slice_len;
            pulled_bytes += slice_len;

            self.fragment_cursor += slice_len;
            if self.fragment_cursor >= total {
                self.queue.pop_front();
                self.queue_bytes -= total;
                self.fragment_cursor = 0;
            }
        }

        if pulled_bytes > 0 {
            self.last_pull = Some(now);
        }
    }

    // ----------------------------------------------------- tick

    pub fn give_time(&mut self, now: Instant, out: &mut ChannelOutput) {
        self.flush_coalesce();

        if self.window_was_filled && self.acked_since_tick {
            self.congestion.on_window_filled_and_acked();
        }
        self.window_was_filled = false;
        self.acked_since_tick = false;

        // timeout-driven resends, capped by the current window
        let delay = self.optimal_resend_delay();
        let budget = self.config.max_outstanding_bytes.min(self.congestion.window());
        let mut resend_ids = Vec::new();
        let mut resend_bytes = 0usize;
        for id in self.pending_id..self.next_outgoing_id {
            let slot = self.out_slot(id);
            if let Some(p) = &self.out_ring[slot] {
                if now.duration_since(p.last_send) >= delay {
                    if resend_bytes + p.len > budget {
                        break;
                    }
                    resend_bytes += p.len;
                    resend_ids.push(id);
                }
            }
        }
        let rtt = Duration::from_millis(self.avg_ping_ms);
        for id in resend_ids {
            self.resend(id, now, out);
            out.resends_timed_out += 1;
            if self.congestion.on_timeout_resend(now, rtt) {
                // slow the resend clock down so a real stall does not trigger
                //  rapid-fire resends
                self.avg_ping_ms = (self.avg_ping_ms * 3 / 2)
                    .min(self.config.resend_delay_cap.as_millis() as u64);
            }
        }

        self.pull_down(now, out);
        self.flush_acks(out);
    }

    fn optimal_resend_delay(&self) -> Duration {
        let scaled = Duration::from_millis(
            self.avg_ping_ms * self.config.resend_delay_percent as u64 / 100,
        );
        (scaled + self.config.resend_delay_adjust).min(self.config.resend_delay_cap)
    }

    fn resend(&mut self, id: u64, now: Instant, out: &mut ChannelOutput) {
        let channel = self.channel;
        let slot = self.out_slot(id);
        if let Some(p) = self.out_ring[slot].as_mut() {
            trace!("channel {}: resending physical packet {}", channel, id);
            p.last_send = now;
            p.send_count += 1;
            out.cooked.push(build_wire(channel, id, p));
        }
    }

    // ----------------------------------------------------- acks (sender side)

    pub fn on_ack(&mut self, now: Instant, stamp: u16, out: &mut ChannelOutput) {
        let Some(id) = wire::resolve_stamp(self.pending_id, stamp) else {
            return;
        };
        if id < self.pending_id || id >= self.next_outgoing_id {
            return; // stale or bogus ack
        }
        let slot = self.out_slot(id);
        let Some(acked) = self.out_ring[slot].take() else {
            return; // already acknowledged
        };
        let acked_sent_at = acked.last_send;
        self.retire(acked, now);
        self.advance_pending();
        self.acked_since_tick = true;

        // a later packet was acknowledged first: everything older that was sent
        //  no later than the acked packet is presumed lost and resent early
        let mut accelerated = Vec::new();
        for earlier in self.pending_id..id {
            let slot = self.out_slot(earlier);
            if let Some(p) = &self.out_ring[slot] {
                if p.last_send <= acked_sent_at {
                    accelerated.push(earlier);
                }
            }
        }
        let rtt = Duration::from_millis(self.avg_ping_ms);
        for earlier in accelerated {
            self.resend(earlier, now, out);
            out.resends_accelerated += 1;
            self.congestion.on_accelerated_resend(now, rtt);
        }
    }

    pub fn on_ack_all(&mut self, now: Instant, stamp: u16) {
        let Some(id) = wire::resolve_stamp(self.pending_id, stamp) else {
            return;
        };
        if id < self.pending_id || self.pending_id >= self.next_outgoing_id {
            return;
        }
        let last = id.min(self.next_outgoing_id - 1);
        for i in self.pending_id..=last {
            let slot = self.out_slot(i);
            if let Some(p) = self.out_ring[slot].take() {
                self.retire(p, now);
            }
        }
        self.pending_id = last + 1;
        self.advance_pending();
        self.acked_since_tick = true;
    }

    fn retire(&mut self, p: PhysicalPacket, now: Instant) {
        self.outgoing_bytes -= p.len;
        if p.send_count == 1 {
            // Karn: only never-resent packets contribute RTT samples
            let sample = now.duration_since(p.first_send).as_millis() as u64;
            self.avg_ping_ms = ((self.avg_ping_ms * 7 + sample) / 8).max(1);
        }
        // dropping `p` releases its share of the parent logical packet
    }

    fn advance_pending(&mut self) {
        while self.pending_id < self.next_outgoing_id {
            let slot = self.out_slot(self.pending_id);
            if self.out_ring[slot].is_some() {
                break;
            }
            self.pending_id += 1;
        }
    }

    // ----------------------------------------------------- receive side

    /// A Reliable or Fragment physical packet. `data` is everything after the
    ///  stamp (for a first fragment that includes the total-length field).
    pub fn on_reliable(
        &mut self,
        stamp: u16,
        data: &[u8],
        fragment: bool,
        out: &mut ChannelOutput,
    ) {
        let id = match wire::resolve_stamp(self.next_incoming_id, stamp) {
            Some(id) => id,
            None => {
                out.duplicates += 1;
                self.queue_ack_all(out);
                return;
            }
        };

        if id < self.next_incoming_id {
            out.duplicates += 1;
            self.queue_ack_all(out);
            return;
        }
        if id >= self.next_incoming_id + self.in_ring.len() as u64 {
            trace!("channel {}: dropping packet {} beyond the receive window", self.channel, id);
            return;
        }

        if id == self.next_incoming_id {
            self.deliver_physical(data.to_vec(), fragment, out);
            if out.corrupt.is_some() {
                return;
            }
            self.next_incoming_id += 1;
            self.drain_in_order(out);
            self.queue_ack_all(out);
        } else {
            let slot = self.in_slot(id);
            if self.in_ring[slot].is_some() {
                out.duplicates += 1;
            } else if self.config.out_of_order_delivery && !fragment {
                self.deliver_physical(data.to_vec(), fragment, out);
                self.in_ring[slot] = Some(InSlot::Consumed);
            } else {
                self.in_ring[slot] = Some(InSlot::Data { data: data.to_vec(), fragment });
            }
            self.queue_selective_ack(id, out);
        }
    }

    fn drain_in_order(&mut self, out: &mut ChannelOutput) {
        loop {
            let slot = self.in_slot(self.next_incoming_id);
            match self.in_ring[slot].take() {
                Some(InSlot::Data { data, fragment }) => {
                    self.deliver_physical(data, fragment, out);
                    if out.corrupt.is_some() {
                        return;
                    }
                    self.next_incoming_id += 1;
                }
                Some(InSlot::Consumed) => {
                    self.next_incoming_id += 1;
                }
                None => break,
            }
        }
    }

    fn deliver_physical(&mut self, data: Vec<u8>, fragment: bool, out: &mut ChannelOutput) {
        if !fragment {
            out.delivered.push(data);
            return;
        }

        if self.reassembly_target == 0 {
            if data.len() < FRAGMENT_LENGTH_FIELD_LEN {
                out.corrupt = Some(CorruptionReason::TruncatedHeader);
                return;
            }
            let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if declared == 0 || declared > self.config.max_incoming_logical_size {
                debug!("channel {}: bad declared fragment length {}", self.channel, declared);
                out.corrupt = Some(CorruptionReason::BadFragmentLength);
                return;
            }
            self.reassembly_target = declared;
            self.reassembly.extend_from_slice(&data[FRAGMENT_LENGTH_FIELD_LEN..]);
        } else {
            self.reassembly.extend_from_slice(&data);
        }

        if self.reassembly.len() > self.reassembly_target {
            out.corrupt = Some(CorruptionReason::LengthOverrun);
            return;
        }
        if self.reassembly.len() == self.reassembly_target {
            self.reassembly_target = 0;
            out.delivered.push(std::mem::take(&mut self.reassembly));
        }
    }

    fn queue_ack_all(&mut self, out: &mut ChannelOutput) {
        if self.next_incoming_id == 0 {
            return;
        }
        let id = self.next_incoming_id - 1;
        if self.config.ack_deduping {
            self.pending_ack_all = Some(id); // replaces any pending cumulative ack
        } else {
            out.cooked.push(ack_packet(PacketType::ack_all(self.channel), id));
        }
    }

    fn queue_selective_ack(&mut self, id: u64, out: &mut ChannelOutput) {
        if self.config.ack_deduping {
            if !self.pending_acks.contains(&id) {
                self.pending_acks.push(id);
            }
        } else {
            out.cooked.push(ack_packet(PacketType::ack(self.channel), id));
        }
    }

    /// Emits any pending (deduped) acknowledgements. Called after each inbound
    ///  processing batch and from `give_time`.
    pub fn flush_acks(&mut self, out: &mut ChannelOutput) {
        if let Some(id) = self.pending_ack_all.take() {
            out.cooked.push(ack_packet(PacketType::ack_all(self.channel), id));
        }
        for id in std::mem::take(&mut self.pending_acks) {
            out.cooked.push(ack_packet(PacketType::ack(self.channel), id));
        }
    }
}

fn build_wire(channel: usize, id: u64, p: &PhysicalPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RELIABLE_HEADER_LEN + FRAGMENT_LENGTH_FIELD_LEN + p.len);
    buf.put_u8(INTERNAL_PACKET_MARKER);
    let packet_type = if p.fragment {
        PacketType::fragment(channel)
    } else {
        PacketType::reliable(channel)
    };
    buf.put_u8(packet_type.into());
    buf.put_u16(wire::stamp_of(id));
    if p.fragment && p.offset == 0 {
        buf.put_u32(p.parent.len() as u32);
    }
    buf.put_slice(&p.parent.data()[p.offset..p.offset + p.len]);
    buf
}

fn ack_packet(packet_type: PacketType, id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RELIABLE_HEADER_LEN);
    buf.put_u8(INTERNAL_PACKET_MARKER);
    buf.put_u8(packet_type.into());
    buf.put_u16(wire::stamp_of(id));
    buf
}

fn varint_len(value: usize) -> usize {
    let mut buf = Vec::with_capacity(4);
    buf.put_usize_varint(value);
    buf.len()
}
