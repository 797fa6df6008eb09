use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::encryption::UserTransform;
use crate::wire::NUM_RELIABLE_CHANNELS;

/// Hard upper bound for the per-channel in-flight ring. Sequence ids wrap modulo
///  the ring size for storage, and the 16-bit wire stamps can only be resolved
///  unambiguously while the window stays well below 32768.
pub const MAX_OUTSTANDING_PACKETS_CAP: usize = 30000;

/// Smallest raw packet size either side may offer or adopt. Anything below this
///  cannot fit the negotiation and reliable headers plus a CRC trailer.
pub const MIN_RAW_PACKET_SIZE: usize = 64;

/// Encryption applied per pass of the two-pass raw-packet pipeline. The byte
///  value is what goes over the wire in the Confirm packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum EncryptMethod {
    #[default]
    None = 0,
    /// XOR against the connection's encrypt code, chained with the previous
    ///  output byte.
    Xor = 1,
    /// XOR against a per-connection pseudorandom byte buffer seeded from the
    ///  encrypt code.
    XorBuffer = 2,
    UserSupplied = 3,
    UserSupplied2 = 4,
}

/// Tuning for one reliable channel. All four channels share the factory default
///  unless the application overrides individual slots.
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// Cap on unacknowledged bytes in flight; the effective send budget each tick
    ///  is the smaller of this and the congestion window.
    pub max_outstanding_bytes: usize,
    /// Size of the in-flight packet ring (hard cap [MAX_OUTSTANDING_PACKETS_CAP]).
    pub max_outstanding_packets: usize,
    /// Size of the out-of-order arrival ring on the receiving side.
    pub max_instanding_packets: usize,
    /// On-wire size of one physical packet including its reliable header.
    ///  Zero means "use the negotiated max raw packet size".
    pub fragment_size: usize,
    /// Max bytes newly pulled into flight per tick; zero disables trickling.
    pub trickle_size: usize,
    /// Minimum spacing between trickle batches.
    pub trickle_rate: Duration,
    /// Additive part of the resend delay.
    pub resend_delay_adjust: Duration,
    /// Multiplicative part of the resend delay, in percent of the RTT average.
    pub resend_delay_percent: u32,
    /// Upper bound for the computed resend delay.
    pub resend_delay_cap: Duration,
    /// Number of acceleration-driven resends tolerated before the congestion
    ///  window takes a soft backoff. Isolated network reordering stays free.
    pub tolerance_loss_count: u32,
    /// Floor for the congestion window; zero means twice the fragment size.
    pub congestion_window_minimum: usize,
    /// Largest logical packet the receiving side will reassemble.
    pub max_incoming_logical_size: usize,
    /// Deliver packets that arrive ahead of a gap immediately instead of holding
    ///  them for in-order delivery. Duplicates are still suppressed.
    pub out_of_order_delivery: bool,
    /// Merge small sends into a shared Group packet.
    pub coalesce: bool,
    /// Replace a pending cumulative ack instead of emitting one per packet.
    pub ack_deduping: bool,
}

impl Default for ReliableConfig {
    fn default() -> ReliableConfig {
        ReliableConfig {
            max_outstanding_bytes: 200 * 1024,
            max_outstanding_packets: 400,
            max_instanding_packets: 400,
            fragment_size: 0,
            trickle_size: 0,
            trickle_rate: Duration::ZERO,
            resend_delay_adjust: Duration::from_millis(300),
            resend_delay_percent: 125,
            resend_delay_cap: Duration::from_secs(5),
            tolerance_loss_count: 5,
            congestion_window_minimum: 0,
            max_incoming_logical_size: 4 * 1024 * 1024,
            out_of_order_delivery: false,
            coalesce: true,
            ack_deduping: true,
        }
    }
}

/// Per-manager configuration, shared by all connections the manager owns. The
///  raw-packet parameters (crc bytes, encryption, packet size) are what the
///  accepting side offers during negotiation.
pub struct ManagerConfig {
    /// Both sides must present the same protocol name during negotiation;
    ///  a mismatch is refused with `OtherProtocolName`.
    pub protocol_name: String,
    pub max_connections: usize,
    /// Largest datagram this side is willing to send or receive, including the
    ///  CRC trailer. The negotiated value is the smaller of both sides'.
    pub max_raw_packet_size: usize,
    /// Socket-level receive buffer, passed to the driver at bind time.
    pub incoming_buffer_size: usize,
    /// Socket-level send buffer, passed to the driver at bind time.
    pub outgoing_buffer_size: usize,
    /// Trailing CRC bytes on every cooked packet (0-4).
    pub crc_bytes: u8,
    pub encrypt_methods: [EncryptMethod; 2],
    pub user_transforms: [Option<Arc<dyn UserTransform>>; 2],
    /// Send a keep-alive when nothing was sent for this long. `None` disables.
    pub keep_alive_delay: Option<Duration>,
    /// Send a TTL-limited port-alive at this interval to refresh NAT mappings
    ///  without reaching the peer. `None` disables.
    pub port_alive_delay: Option<Duration>,
    /// Self-disconnect (`Timeout`) when nothing was received for this long.
    pub no_data_timeout: Option<Duration>,
    /// Self-disconnect (`UnacknowledgedTimeout`) when any single physical packet
    ///  stays unacknowledged for this long.
    pub oldest_unacknowledged_timeout: Option<Duration>,
    /// Spacing of Connect re-sends while negotiating.
    pub connect_attempt_delay: Duration,
    /// Give up negotiating (`ConnectFail`) after this long. `None` keeps trying
    ///  until the application disconnects.
    pub connect_attempt_timeout: Option<Duration>,
    /// ICMP unreachable errors within this period of the first one are ignored,
    ///  riding out momentary blips and NAT-remap races.
    pub icmp_error_retry_period: Duration,
    /// Interval for clock-sync probes on the initiating side. `None` disables.
    pub clock_sync_delay: Option<Duration>,
    /// Small cooked packets are batched into one Multi datagram until this much
    ///  time passed since the first held packet.
    pub max_data_hold_time: Duration,
    /// Honor RequestRemap packets at all.
    pub allow_port_remapping: bool,
    /// Additionally allow the remapped source to have a different IP address,
    ///  not just a different port.
    pub allow_address_remapping: bool,
    /// Reply to datagrams from unknown sources with an UnreachableConnection
    ///  notification.
    pub reply_unreachable: bool,
    /// Queue application callbacks for explicit delivery via
    ///  `Manager::deliver_events` instead of invoking them inside `poll`.
    pub use_event_queue: bool,
    /// Drive connections through the due-time scheduler; when disabled, `poll`
    ///  gives every connection time unconditionally.
    pub use_connection_scheduler: bool,
    /// Buffers kept in the logical packet pool's free list.
    pub packet_pool_size: usize,
    pub reliable: [ReliableConfig; NUM_RELIABLE_CHANNELS],
}

impl ManagerConfig {
    pub fn new(protocol_name: impl Into<String>) -> ManagerConfig {
        ManagerConfig {
            protocol_name: protocol_name.into(),
            max_connections: 1000,
            max_raw_packet_size: 512,
            incoming_buffer_size: 2 * 1024 * 1024,
            outgoing_buffer_size: 2 * 1024 * 1024,
            crc_bytes: 0,
            encrypt_methods: [EncryptMethod::None, EncryptMethod::None],
            user_transforms: [None, None],
            keep_alive_delay: Some(Duration::from_secs(15)),
            port_alive_delay: None,
            no_data_timeout: Some(Duration::from_secs(90)),
            oldest_unacknowledged_timeout: Some(Duration::from_secs(90)),
            connect_attempt_delay: Duration::from_secs(1),
            connect_attempt_timeout: Some(Duration::from_secs(10)),
            icmp_error_retry_period: Duration::from_secs(5),
            clock_sync_delay: None,
            max_data_hold_time: Duration::from_millis(50),
            allow_port_remapping: true,
            allow_address_remapping: false,
            reply_unreachable: true,
            use_event_queue: false,
            use_connection_scheduler: true,
            packet_pool_size: 1000,
            reliable: Default::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.protocol_name.is_empty() || self.protocol_name.len() >= crate::wire::MAX_PROTOCOL_NAME_LEN {
            bail!("protocol name must be 1..{} bytes", crate::wire::MAX_PROTOCOL_NAME_LEN);
        }
        if self.max_raw_packet_size < MIN_RAW_PACKET_SIZE {
            bail!("max raw packet size {} is too small to fit the protocol headers", self.max_raw_packet_size);
        }
        if self.crc_bytes > 4 {
            bail!("crc bytes must be 0..=4, was {}", self.crc_bytes);
        }
        for (pass, method) in self.encrypt_methods.iter().enumerate() {
            let needs_user = matches!(method, EncryptMethod::UserSupplied | EncryptMethod::UserSupplied2);
            if needs_user && self.user_transforms[pass].is_none() {
                bail!("encrypt pass {} is user-supplied but no transform was provided", pass);
            }
        }
        for (channel, reliable) in self.reliable.iter().enumerate() {
            if reliable.max_outstanding_packets == 0
                || reliable.max_outstanding_packets > MAX_OUTSTANDING_PACKETS_CAP
            {
                bail!(
                    "channel {}: max outstanding packets must be 1..={}, was {}",
                    channel, MAX_OUTSTANDING_PACKETS_CAP, reliable.max_outstanding_packets
                );
            }
            if reliable.max_instanding_packets == 0
                || reliable.max_instanding_packets > MAX_OUTSTANDING_PACKETS_CAP
            {
                bail!(
                    "channel {}: max instanding packets must be 1..={}, was {}",
                    channel, MAX_OUTSTANDING_PACKETS_CAP, reliable.max_instanding_packets
                );
            }
            if reliable.fragment_size != 0 {
                if reliable.fragment_size < 16 {
                    bail!("channel {}: fragment size {} is too small", channel, reliable.fragment_size);
                }
                if reliable.fragment_size > self.max_raw_packet_size {
                    bail!(
                        "channel {}: fragment size {} exceeds max raw packet size {}",
                        channel, reliable.fragment_size, self.max_raw_packet_size
                    );
                }
            }
            if reliable.resend_delay_percent == 0 {
                bail!("channel {}: resend delay percent must be positive", channel);
            }
            if reliable.max_incoming_logical_size == 0 {
                bail!("channel {}: max incoming logical size must be positive", channel);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ManagerConfig {
        ManagerConfig::new("test-protocol")
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_protocol_name() {
        let mut config = valid();
        config.protocol_name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_crc_bytes_above_four() {
        let mut config = valid();
        config.crc_bytes = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_outstanding_packets_beyond_cap() {
        let mut config = valid();
        config.reliable[2].max_outstanding_packets = MAX_OUTSTANDING_PACKETS_CAP + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_fragment_size_beyond_raw_packet_size() {
        let mut config = valid();
        config.reliable[0].fragment_size = config.max_raw_packet_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_user_method_without_transform() {
        let mut config = valid();
        config.encrypt_methods[1] = EncryptMethod::UserSupplied;
        assert!(config.validate().is_err());
    }
}
