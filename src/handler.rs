//! Application-facing hook surface. The transport calls these; the application
//!  implements them. All methods default to no-ops so handlers only override
//!  what they care about.

#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::connection::Connection;
use crate::wire::{CorruptionReason, DisconnectReason};

/// Per-connection callbacks. Attached with [Connection::set_handler]; a
///  connection without a handler silently drops its deliveries.
#[cfg_attr(test, automock)]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// One application payload, in order for reliable channels.
    fn on_route_packet(&self, data: &[u8]) {
        let _ = data;
    }

    /// The negotiation handshake completed (initiating side only - the
    ///  accepting side is connected from the start).
    fn on_connect_complete(&self) {}

    fn on_terminated(&self, reason: DisconnectReason) {
        let _ = reason;
    }

    /// A datagram failed CRC verification. The connection stays up.
    fn on_crc_reject(&self, data: &[u8]) {
        let _ = data;
    }

    /// A packet with unparseable internal framing; the connection is torn down
    ///  with `CorruptPacket` right after this call.
    fn on_packet_corrupt(&self, data: &[u8], reason: CorruptionReason) {
        let _ = (data, reason);
    }
}

/// Manager-wide callbacks.
#[cfg_attr(test, automock)]
pub trait ManagerHandler: Send + Sync + 'static {
    /// A new inbound connection finished negotiating. Return false to refuse it;
    ///  the typical implementation attaches a [ConnectionHandler] and returns
    ///  true.
    fn on_connect_request(&self, connection: &Arc<Connection>) -> bool {
        let _ = connection;
        true
    }

    /// A ServerStatus probe arrived from `from` (possibly not a connected peer).
    fn on_server_status_request(&self, from: SocketAddr) {
        let _ = from;
    }
}

/// A no-op handler for connections the application does not care to observe.
pub struct NullHandler;

impl ConnectionHandler for NullHandler {}
impl ManagerHandler for NullHandler {}
