//! Wire-level vocabulary of the protocol: packet type bytes, disconnect reasons,
//!  control packet ser / deser, and the mapping between 16-bit wire stamps and the
//!  logically unbounded 64-bit sequence ids used internally.
//!
//! All multi-byte fields are big-endian.

use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::config::EncryptMethod;

/// Version byte exchanged during negotiation - peers with a different version
///  refuse each other.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound for the negotiated protocol name, including room for a terminator.
pub const MAX_PROTOCOL_NAME_LEN: usize = 32;

/// Every internal packet starts with this marker byte followed by a [PacketType]
///  byte. Application payloads that happen to start with a zero byte are escaped
///  with a `ZeroEscape` wrapper so they can be told apart.
pub const INTERNAL_PACKET_MARKER: u8 = 0;

/// The four reliable families (`Reliable`, `Fragment`, `Ack`, `AckAll`) occupy
///  contiguous runs of four type bytes each, so the channel number is the offset
///  into the run.
pub const NUM_RELIABLE_CHANNELS: usize = 4;

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    ZeroEscape = 0,
    Connect = 1,
    Confirm = 2,
    Terminate = 3,
    UnreachableConnection = 4,
    RequestRemap = 5,
    KeepAlive = 6,
    PortAlive = 7,
    ServerStatus = 8,
    ClockSync = 9,
    ClockReflect = 10,
    Multi = 11,
    Group = 12,
    Ordered = 13,
    Ordered2 = 14,
    Reliable1 = 15,
    Reliable2 = 16,
    Reliable3 = 17,
    Reliable4 = 18,
    Fragment1 = 19,
    Fragment2 = 20,
    Fragment3 = 21,
    Fragment4 = 22,
    Ack1 = 23,
    Ack2 = 24,
    Ack3 = 25,
    Ack4 = 26,
    AckAll1 = 27,
    AckAll2 = 28,
    AckAll3 = 29,
    AckAll4 = 30,
}

/// A packet type that is routed to one of the four reliable channels.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelPacket {
    Reliable(usize),
    Fragment(usize),
    Ack(usize),
    AckAll(usize),
}

impl PacketType {
    /// Types that are handled without the encryption / CRC pipeline, both during
    ///  negotiation (when no pipeline exists yet) and for best-effort teardown.
    pub fn is_unencrypted_control(self) -> bool {
        matches!(
            self,
            PacketType::Connect
                | PacketType::Confirm
                | PacketType::Terminate
                | PacketType::UnreachableConnection
                | PacketType::RequestRemap
                | PacketType::ServerStatus
        )
    }

    pub fn channel_packet(self) -> Option<ChannelPacket> {
        let raw: u8 = self.into();
        let rel: u8 = PacketType::Reliable1.into();
        let frag: u8 = PacketType::Fragment1.into();
        let ack: u8 = PacketType::Ack1.into();
        let ack_all: u8 = PacketType::AckAll1.into();

        let n = NUM_RELIABLE_CHANNELS as u8;
        if (rel..rel + n).contains(&raw) {
            Some(ChannelPacket::Reliable((raw - rel) as usize))
        } else if (frag..frag + n).contains(&raw) {
            Some(ChannelPacket::Fragment((raw - frag) as usize))
        } else if (ack..ack + n).contains(&raw) {
            Some(ChannelPacket::Ack((raw - ack) as usize))
        } else if (ack_all..ack_all + n).contains(&raw) {
            Some(ChannelPacket::AckAll((raw - ack_all) as usize))
        } else {
            None
        }
    }

    pub fn reliable(channel: usize) -> PacketType {
        Self::of_family(PacketType::Reliable1, channel)
    }

    pub fn fragment(channel: usize) -> PacketType {
        Self::of_family(PacketType::Fragment1, channel)
    }

    pub fn ack(channel: usize) -> PacketType {
        Self::of_family(PacketType::Ack1, channel)
    }

    pub fn ack_all(channel: usize) -> PacketType {
        Self::of_family(PacketType::AckAll1, channel)
    }

    fn of_family(base: PacketType, channel: usize) -> PacketType {
        assert!(channel < NUM_RELIABLE_CHANNELS);
        let raw: u8 = base.into();
        PacketType::try_from(raw + channel as u8)
            .expect("reliable family runs are contiguous")
    }
}

/// Terminal reasons a connection can end with. Surfaced through the terminated
///  callback and queryable afterwards - never raised as an error.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum DisconnectReason {
    Application = 0,
    ConnectFail = 1,
    Timeout = 2,
    UnacknowledgedTimeout = 3,
    ReliableOverflow = 4,
    CorruptPacket = 5,
    IcmpError = 6,
    UnreachableConnection = 7,
    OtherSideTerminated = 8,
    ConnectionRefused = 9,
    NewConnectionAttempt = 10,
    ConnectingToSelf = 11,
    MutualConnectError = 12,
    OtherProtocolName = 13,
    ManagerDeleted = 14,
}

/// Why an inbound packet was treated as corrupt. Handed to the corrupt-packet
///  callback right before the connection is torn down.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CorruptionReason {
    TruncatedHeader,
    LengthOverrun,
    BadFragmentLength,
    CrcBytesExceedPacket,
    NestedTooDeep,
}

/// Reconstructs the 64-bit logical id closest to `reference` whose low 16 bits
///  equal `stamp`. Returns `None` if that id would be negative.
///
/// The in-flight windows are bounded well below 32768 ids, so "closest" is
///  unambiguous for any packet the protocol can legitimately produce.
pub fn resolve_stamp(reference: u64, stamp: u16) -> Option<u64> {
    let mut diff = stamp as i64 - (reference & 0xffff) as i64;
    if diff > 0x8000 {
        diff -= 0x10000;
    } else if diff < -0x8000 {
        diff += 0x10000;
    }
    let resolved = reference as i64 + diff;
    if resolved < 0 {
        None
    } else {
        Some(resolved as u64)
    }
}

pub fn stamp_of(id: u64) -> u16 {
    (id & 0xffff) as u16
}

/// First packet of the negotiation handshake, re-sent every `connect_attempt_delay`
///  until a matching [ConfirmPacket] arrives.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectPacket {
    pub protocol_version: u32,
    pub connect_code: u32,
    pub max_raw_packet_size: u32,
    pub protocol_name: String,
}

impl ConnectPacket {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(INTERNAL_PACKET_MARKER);
        buf.put_u8(PacketType::Connect.into());
        buf.put_u32(self.protocol_version);
        buf.put_u32(self.connect_code);
        buf.put_u32(self.max_raw_packet_size);
        let name = self.protocol_name.as_bytes();
        let len = name.len().min(MAX_PROTOCOL_NAME_LEN - 1);
        buf.put_slice(&name[..len]);
        buf.put_u8(0);
    }

    /// Deserializes the payload *after* the marker and type bytes.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectPacket> {
        let protocol_version = buf.try_get_u32()?;
        let connect_code = buf.try_get_u32()?;
        let max_raw_packet_size = buf.try_get_u32()?;

        let mut name = Vec::new();
        loop {
            let b = buf.try_get_u8()?;
            if b == 0 {
                break;
            }
            if name.len() >= MAX_PROTOCOL_NAME_LEN {
                bail!("protocol name exceeds {} bytes", MAX_PROTOCOL_NAME_LEN);
            }
            name.push(b);
        }

        Ok(ConnectPacket {
            protocol_version,
            connect_code,
            max_raw_packet_size,
            protocol_name: String::from_utf8(name)?,
        })
    }
}

/// Accepting side's reply to [ConnectPacket], carrying the full negotiated
///  configuration for the connection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConfirmPacket {
    pub connect_code: u32,
    pub encrypt_code: u32,
    pub crc_bytes: u8,
    pub encrypt_methods: [EncryptMethod; 2],
    pub max_raw_packet_size: u32,
    pub protocol_version: u32,
}

impl ConfirmPacket {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(INTERNAL_PACKET_MARKER);
        buf.put_u8(PacketType::Confirm.into());
        buf.put_u32(self.connect_code);
        buf.put_u32(self.encrypt_code);
        buf.put_u8(self.crc_bytes);
        buf.put_u8(self.encrypt_methods[0].into());
        buf.put_u8(self.encrypt_methods[1].into());
        buf.put_u32(self.max_raw_packet_size);
        buf.put_u32(self.protocol_version);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConfirmPacket> {
        let connect_code = buf.try_get_u32()?;
        let encrypt_code = buf.try_get_u32()?;
        let crc_bytes = buf.try_get_u8()?;
        let m0 = EncryptMethod::try_from(buf.try_get_u8()?)?;
        let m1 = EncryptMethod::try_from(buf.try_get_u8()?)?;
        let max_raw_packet_size = buf.try_get_u32()?;
        let protocol_version = buf.try_get_u32()?;
        Ok(ConfirmPacket {
            connect_code,
            encrypt_code,
            crc_bytes,
            encrypt_methods: [m0, m1],
            max_raw_packet_size,
            protocol_version,
        })
    }
}

/// Best-effort teardown notification. The reason is optional on the wire so that
///  very old peers without it still parse.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TerminatePacket {
    pub connect_code: u32,
    pub reason: Option<DisconnectReason>,
}

impl TerminatePacket {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(INTERNAL_PACKET_MARKER);
        buf.put_u8(PacketType::Terminate.into());
        buf.put_u32(self.connect_code);
        if let Some(reason) = self.reason {
            buf.put_u16(reason.into());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<TerminatePacket> {
        let connect_code = buf.try_get_u32()?;
        let reason = if buf.remaining() >= 2 {
            DisconnectReason::try_from(buf.try_get_u16()?).ok()
        } else {
            None
        };
        Ok(TerminatePacket { connect_code, reason })
    }
}

/// Request to re-index an existing connection under a new source address after a
///  NAT mapping change. Only honored when the encrypt code matches.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestRemapPacket {
    pub connect_code: u32,
    pub encrypt_code: u32,
}

impl RequestRemapPacket {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(INTERNAL_PACKET_MARKER);
        buf.put_u8(PacketType::RequestRemap.into());
        buf.put_u32(self.connect_code);
        buf.put_u32(self.encrypt_code);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RequestRemapPacket> {
        let connect_code = buf.try_get_u32()?;
        let encrypt_code = buf.try_get_u32()?;
        Ok(RequestRemapPacket { connect_code, encrypt_code })
    }
}

/// Round-trip timing probe, sent periodically by the initiating side.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClockSyncPacket {
    pub stamp: u16,
    pub master_ping: u32,
    pub avg_ping: u32,
    pub low_ping: u32,
    pub high_ping: u32,
    pub last_ping: u32,
    pub our_sent: u64,
    pub our_received: u64,
}

impl ClockSyncPacket {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(INTERNAL_PACKET_MARKER);
        buf.put_u8(PacketType::ClockSync.into());
        buf.put_u16(self.stamp);
        buf.put_u32(self.master_ping);
        buf.put_u32(self.avg_ping);
        buf.put_u32(self.low_ping);
        buf.put_u32(self.high_ping);
        buf.put_u32(self.last_ping);
        buf.put_u64(self.our_sent);
        buf.put_u64(self.our_received);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ClockSyncPacket> {
        Ok(ClockSyncPacket {
            stamp: buf.try_get_u16()?,
            master_ping: buf.try_get_u32()?,
            avg_ping: buf.try_get_u32()?,
            low_ping: buf.try_get_u32()?,
            high_ping: buf.try_get_u32()?,
            last_ping: buf.try_get_u32()?,
            our_sent: buf.try_get_u64()?,
            our_received: buf.try_get_u64()?,
        })
    }
}

/// Reply to [ClockSyncPacket], echoing the probe stamp plus both sides' traffic
///  counters so either end can estimate loss.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClockReflectPacket {
    pub stamp: u16,
    pub server_sync_stamp: u32,
    pub your_sent: u64,
    pub your_received: u64,
    pub our_sent: u64,
    pub our_received: u64,
}

impl ClockReflectPacket {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(INTERNAL_PACKET_MARKER);
        buf.put_u8(PacketType::ClockReflect.into());
        buf.put_u16(self.stamp);
        buf.put_u32(self.server_sync_stamp);
        buf.put_u64(self.your_sent);
        buf.put_u64(self.your_received);
        buf.put_u64(self.our_sent);
        buf.put_u64(self.our_received);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ClockReflectPacket> {
        Ok(ClockReflectPacket {
            stamp: buf.try_get_u16()?,
            server_sync_stamp: buf.try_get_u32()?,
            your_sent: buf.try_get_u64()?,
            your_received: buf.try_get_u64()?,
            our_sent: buf.try_get_u64()?,
            our_received: buf.try_get_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0, Some(0))]
    #[case::exact(100, 100, Some(100))]
    #[case::ahead(100, 105, Some(105))]
    #[case::behind(100, 95, Some(95))]
    #[case::wrap_forward(0xfff0, 0x0005, Some(0x10005))]
    #[case::wrap_backward(0x10005, 0xfff0, Some(0xfff0))]
    #[case::high_bits_kept(0x5_0000 + 10, 15, Some(0x5_0000 + 15))]
    #[case::half_window_ahead(5, 0x8000, Some(0x8000))]
    #[case::would_be_negative(5, 0x9000, None)]
    fn test_resolve_stamp(#[case] reference: u64, #[case] stamp: u32, #[case] expected: Option<u64>) {
        assert_eq!(resolve_stamp(reference, stamp as u16), expected);
    }

    #[rstest]
    #[case::reliable_0(PacketType::reliable(0), PacketType::Reliable1, Some(ChannelPacket::Reliable(0)))]
    #[case::reliable_3(PacketType::reliable(3), PacketType::Reliable4, Some(ChannelPacket::Reliable(3)))]
    #[case::fragment_1(PacketType::fragment(1), PacketType::Fragment2, Some(ChannelPacket::Fragment(1)))]
    #[case::ack_2(PacketType::ack(2), PacketType::Ack3, Some(ChannelPacket::Ack(2)))]
    #[case::ack_all_3(PacketType::ack_all(3), PacketType::AckAll4, Some(ChannelPacket::AckAll(3)))]
    #[case::not_a_channel(PacketType::KeepAlive, PacketType::KeepAlive, None)]
    fn test_channel_packet(
        #[case] constructed: PacketType,
        #[case] expected_type: PacketType,
        #[case] expected_channel: Option<ChannelPacket>,
    ) {
        assert_eq!(constructed, expected_type);
        assert_eq!(constructed.channel_packet(), expected_channel);
    }

    #[test]
    fn test_connect_roundtrip() {
        let original = ConnectPacket {
            protocol_version: PROTOCOL_VERSION,
            connect_code: 0xdead_beef,
            max_raw_packet_size: 512,
            protocol_name: "my-game".to_string(),
        };

        let mut buf = Vec::new();
        original.ser(&mut buf);
        assert_eq!(buf[0], INTERNAL_PACKET_MARKER);
        assert_eq!(buf[1], u8::from(PacketType::Connect));

        let mut b = &buf[2..];
        let deser = ConnectPacket::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_connect_rejects_unterminated_name() {
        let mut buf = Vec::new();
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_u32(1);
        buf.put_u32(512);
        buf.put_slice(&[b'x'; MAX_PROTOCOL_NAME_LEN + 1]);

        let mut b = buf.as_slice();
        assert!(ConnectPacket::deser(&mut b).is_err());
    }

    #[test]
    fn test_confirm_roundtrip() {
        let original = ConfirmPacket {
            connect_code: 17,
            encrypt_code: 0x0102_0304,
            crc_bytes: 2,
            encrypt_methods: [EncryptMethod::Xor, EncryptMethod::None],
            max_raw_packet_size: 496,
            protocol_version: PROTOCOL_VERSION,
        };

        let mut buf = Vec::new();
        original.ser(&mut buf);
        let mut b = &buf[2..];
        let deser = ConfirmPacket::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[rstest]
    #[case::with_reason(Some(DisconnectReason::Application))]
    #[case::without_reason(None)]
    fn test_terminate_roundtrip(#[case] reason: Option<DisconnectReason>) {
        let original = TerminatePacket { connect_code: 99, reason };

        let mut buf = Vec::new();
        original.ser(&mut buf);
        let mut b = &buf[2..];
        assert_eq!(TerminatePacket::deser(&mut b).unwrap(), original);
    }

    #[test]
    fn test_clock_sync_roundtrip() {
        let original = ClockSyncPacket {
            stamp: 0x1234,
            master_ping: 80,
            avg_ping: 90,
            low_ping: 60,
            high_ping: 140,
            last_ping: 85,
            our_sent: 1000,
            our_received: 950,
        };
        let mut buf = Vec::new();
        original.ser(&mut buf);
        let mut b = &buf[2..];
        assert_eq!(ClockSyncPacket::deser(&mut b).unwrap(), original);
    }

    #[test]
    fn test_clock_reflect_roundtrip() {
        let original = ClockReflectPacket {
            stamp: 7,
            server_sync_stamp: 123_456,
            your_sent: 1,
            your_received: 2,
            our_sent: 3,
            our_received: 4,
        };
        let mut buf = Vec::new();
        original.ser(&mut buf);
        let mut b = &buf[2..];
        assert_eq!(ClockReflectPacket::deser(&mut b).unwrap(), original);
    }

    #[test]
    fn test_truncated_control_packets_fail() {
        let mut b: &[u8] = &[0, 1, 2];
        assert!(ConfirmPacket::deser(&mut b).is_err());
        let mut b: &[u8] = &[0, 1];
        assert!(ConnectPacket::deser(&mut b).is_err());
        let mut b: &[u8] = &[];
        assert!(ClockSyncPacket::deser(&mut b).is_err());
    }
}
