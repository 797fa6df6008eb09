//! A connection-oriented reliable transport over UDP for real-time games and
//!  other latency-sensitive applications, symmetric between the two ends of a
//!  connection once it is negotiated.
//!
//! ## Design goals
//!
//! * A [Manager] owns one UDP socket and any number of [Connection]s through it
//!   * either side of a manager pair can initiate; once negotiated the
//!     connection is fully symmetric
//!   * single-threaded poll model: the application calls [Manager::poll] once
//!     per frame, nothing happens between polls
//! * The abstraction is sending / receiving *packets* (defined-length chunks of
//!   data as opposed to streams of bytes)
//! * Three delivery classes per connection:
//!   * *reliable*: four independent sliding-window channels with exactly-once
//!     in-order delivery, fragmentation of arbitrarily large packets, selective
//!     and cumulative acknowledgement, and Reno-style congestion control
//!   * *ordered*: two unreliable lanes that drop anything arriving behind the
//!     newest delivered packet - for state snapshots where only the latest
//!     matters
//!   * *unreliable*: plain fire-and-forget
//! * Combine small packets, delaying the send for a configurable hold interval:
//!   small cooked packets batch into one Multi datagram, small reliable sends
//!   coalesce into a shared Group packet
//! * Optional per-datagram scrambling (XOR variants or application-supplied
//!   transforms, up to two passes) plus a CRC trailer of 0-4 bytes
//! * NAT keep-alive and remap support: TTL-limited port-alive probes refresh
//!   mappings without reaching the peer, and a connection whose mapping changed
//!   can re-attach to its old state via a RequestRemap exchange
//! * Clock-sync probes give both sides a shared RTT estimate
//!
//! ## Wire format
//!
//! Every datagram is the output of the per-connection pipeline (encryption
//!  passes, then a CRC trailer) over one *cooked* packet. Negotiation and
//!  teardown control packets bypass the pipeline. A cooked packet whose first
//!  byte is nonzero is raw application data; otherwise byte 0 is the internal
//!  marker and byte 1 the packet type:
//!
//! ```ascii
//! 0:  0x00 internal packet marker
//! 1:  packet type:
//!     *  0 ZeroEscape          - application payload that starts with 0x00
//!     *  1 Connect             - handshake, initiating side (unencrypted)
//!     *  2 Confirm             - handshake reply with negotiated parameters
//!     *  3 Terminate           - best-effort teardown notification
//!     *  4 UnreachableConnection - "I do not know you"
//!     *  5 RequestRemap        - re-index me under my new source address
//!     *  6 KeepAlive
//!     *  7 PortAlive           - TTL-limited NAT refresh
//!     *  8 ServerStatus        - out-of-band status probe
//!     *  9/10 ClockSync / ClockReflect
//!     * 11 Multi               - [u8 len, entry]* of held cooked packets
//!     * 12 Group               - [varint len, payload]* of coalesced sends
//!     * 13/14 Ordered lanes    - u16 stamp, payload
//!     * 15-18 Reliable ch 0-3  - u16 stamp, payload
//!     * 19-22 Fragment ch 0-3  - u16 stamp, (u32 total len,) payload
//!     * 23-26 Ack ch 0-3       - u16 stamp
//!     * 27-30 AckAll ch 0-3    - u16 stamp
//! ```
//!
//! Reliable sequence ids are unbounded 64-bit counters internally and 16-bit
//!  wrapped stamps on the wire; the in-flight windows are bounded far below the
//!  wrap distance, so the nearest id to the window edge is always unambiguous.

pub mod buffers;
pub mod config;
mod congestion;
pub mod connection;
pub mod driver;
pub mod encryption;
pub mod handler;
pub mod manager;
mod reliable_channel;
mod scheduler;
pub mod wire;

pub use config::{EncryptMethod, ManagerConfig, ReliableConfig};
pub use connection::{Connection, ConnectionStats, Status};
pub use encryption::UserTransform;
pub use handler::{ConnectionHandler, ManagerHandler, NullHandler};
pub use manager::{Manager, ManagerStatsSnapshot};
pub use wire::{CorruptionReason, DisconnectReason};
