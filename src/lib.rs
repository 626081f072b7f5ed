//! Protocol logic for a QUIC (draft-18) endpoint.
//!
//! This crate contains the per-connection transport core: the client and
//! server state machines, the TLS 1.3 handshake glue, packet protection,
//! acknowledgement bookkeeping, and stream multiplexing. It performs no I/O
//! of its own; encrypted datagrams leave through the [`PacketSender`]
//! capability and arrive through [`Connection::handle_datagram`] or
//! [`Endpoint::handle`], and timers are driven by the caller.
//!
//! All state for a single connection is confined to one logical task;
//! nothing in here takes a lock.

#[macro_use]
extern crate failure;
#[macro_use]
extern crate slog;
extern crate bytes;
extern crate constant_time_eq;
extern crate fnv;
extern crate rand;
extern crate ring;
extern crate rustls;
extern crate slab;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

use std::fmt;
use std::ops;

mod coding;
mod range_set;

pub mod crypto;
pub mod frame;
pub mod packet;
pub mod transport_parameters;

mod connection;
mod endpoint;
mod flow;
mod stream;

pub use connection::{
    ClientConfig, Completion, Connection, ConnectionError, HandshakeHandle, InvalidState,
    PacketSender, Signal, State,
};
pub use connection::{ClientState, ServerState};
pub use crypto::{CertificateValidator, ConnectError, InvalidCertificate, NoopCertificateValidator};
pub use endpoint::{
    Config, ConnectionHandle, Endpoint, EndpointError, ListenerFactory, ServerConfig,
};
pub use flow::{FlowControl, FrameSender, NoopFlowControl, SendDecision, WindowedFlowControl};
pub use frame::Frame;
pub use stream::StreamListener;

/// The QUIC protocol version implemented: draft-18.
pub const VERSION: u32 = 0xff00_0012;

/// Datagrams carrying a client's first Initial packet must be at least this large.
pub const MIN_INITIAL_SIZE: usize = 1200;
/// The smallest datagram payload any QUIC path must be able to carry.
pub const MIN_MTU: u16 = 1232;

pub(crate) const MIN_CID_SIZE: usize = 4;
pub(crate) const MAX_CID_SIZE: usize = 18;

/// Whether an endpoint initiated a connection or accepted it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Whether a stream carries data in both directions or only away from its initiator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Directionality {
    Bi,
    Uni,
}

/// Identifier for a stream within a particular connection.
///
/// The two low bits encode the initiating side and the directionality; the
/// remaining bits are a per-type index.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        let mut id = index << 2;
        if directionality == Directionality::Uni {
            id |= 0x2;
        }
        if initiator == Side::Server {
            id |= 0x1;
        }
        StreamId(id)
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }

    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-level error codes, as carried in CONNECTION_CLOSE frames.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TransportError(pub u16);

impl TransportError {
    pub const NO_ERROR: TransportError = TransportError(0x0);
    pub const INTERNAL_ERROR: TransportError = TransportError(0x1);
    pub const CONNECTION_REFUSED: TransportError = TransportError(0x2);
    pub const FLOW_CONTROL_ERROR: TransportError = TransportError(0x3);
    pub const STREAM_LIMIT_ERROR: TransportError = TransportError(0x4);
    pub const STREAM_STATE_ERROR: TransportError = TransportError(0x5);
    pub const FINAL_SIZE_ERROR: TransportError = TransportError(0x6);
    pub const FRAME_ENCODING_ERROR: TransportError = TransportError(0x7);
    pub const TRANSPORT_PARAMETER_ERROR: TransportError = TransportError(0x8);
    pub const PROTOCOL_VIOLATION: TransportError = TransportError(0xA);

    /// A TLS-originated error, carrying the alert code in the low byte.
    pub fn crypto(alert: u8) -> Self {
        TransportError(0x100 | alert as u16)
    }

    pub fn is_crypto(self) -> bool {
        self.0 & !0xFF == 0x100
    }
}

impl From<u16> for TransportError {
    fn from(x: u16) -> Self {
        TransportError(x)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_crypto() {
            return write!(f, "CRYPTO_ERROR({})", self.0 as u8);
        }
        let name = match *self {
            TransportError::NO_ERROR => "NO_ERROR",
            TransportError::INTERNAL_ERROR => "INTERNAL_ERROR",
            TransportError::CONNECTION_REFUSED => "CONNECTION_REFUSED",
            TransportError::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            TransportError::STREAM_LIMIT_ERROR => "STREAM_LIMIT_ERROR",
            TransportError::STREAM_STATE_ERROR => "STREAM_STATE_ERROR",
            TransportError::FINAL_SIZE_ERROR => "FINAL_SIZE_ERROR",
            TransportError::FRAME_ENCODING_ERROR => "FRAME_ENCODING_ERROR",
            TransportError::TRANSPORT_PARAMETER_ERROR => "TRANSPORT_PARAMETER_ERROR",
            TransportError::PROTOCOL_VIOLATION => "PROTOCOL_VIOLATION",
            _ => return write!(f, "TRANSPORT_ERROR({:#x})", self.0),
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_bits() {
        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        assert_eq!(id.0, 0);
        let id = StreamId::new(Side::Server, Directionality::Bi, 0);
        assert_eq!(id.0, 1);
        let id = StreamId::new(Side::Client, Directionality::Uni, 3);
        assert_eq!(id.0, 14);
        assert_eq!(id.initiator(), Side::Client);
        assert_eq!(id.directionality(), Directionality::Uni);
        assert_eq!(id.index(), 3);
        let id = StreamId::new(Side::Server, Directionality::Uni, 7);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.directionality(), Directionality::Uni);
        assert_eq!(id.index(), 7);
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(format!("{}", TransportError::PROTOCOL_VIOLATION), "PROTOCOL_VIOLATION");
        assert_eq!(format!("{}", TransportError::crypto(42)), "CRYPTO_ERROR(42)");
    }
}
