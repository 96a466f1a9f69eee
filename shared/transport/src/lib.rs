//! Reliable/unreliable multiplexed UDP datagram transport.
//!
//! One socket serves every peer. Each datagram carries a single frame:
//! connection management, keepalive, an acknowledgement, or a data frame in
//! one of three reliability classes:
//!
//! - **unreliable**: fire-and-forget, may be lost or reordered;
//! - **reliable-ordered**: delivered exactly once, in send order, with
//!   transparent fragmentation of oversized messages;
//! - **reliable-sequenced**: delivered at most once, only if no newer
//!   message of the class has already arrived.
//!
//! The transport is single-threaded and callback-driven: a host calls
//! [`Transport::poll`] in a loop and the transport invokes the listener's
//! callbacks synchronously from inside that call. Sends never block; frames
//! are queued per peer and flushed at the end of each poll cycle.

mod connection;
mod endpoint;
mod frame;

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

pub use endpoint::{ConnectionRequest, Peer, PeerId, Transport, TransportConfig};

/// Default UDP listen port of the relay.
pub const DEFAULT_PORT: u16 = 10515;

/// Largest datagram the transport will emit.
pub const MAX_DATAGRAM_SIZE: usize = 1400;

pub(crate) const DATA_HEADER_SIZE: usize = 6;

/// Largest message that fits a single data frame.
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_DATAGRAM_SIZE - DATA_HEADER_SIZE;

/// Fragment count is a `u8`, bounding reliable-ordered messages.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Largest reliable-ordered message, after fragmentation.
pub const MAX_MESSAGE_SIZE: usize = MAX_FRAGMENT_PAYLOAD * MAX_FRAGMENTS;

/// Reliability class of one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reliability {
    Unreliable,
    ReliableOrdered,
    ReliableSequenced,
}

/// Why a peer went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote end sent a disconnect notice.
    Remote,
    /// Keepalive or retransmission budget exhausted.
    Timeout,
    /// An outbound connection attempt was rejected or never answered.
    ConnectFailed,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Remote => "remote",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ConnectFailed => "connect_failed",
        }
    }
}

/// Non-fatal conditions surfaced through [`EventListener::error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// A datagram that could not be decoded as a frame.
    MalformedDatagram,
    /// The socket rejected an outbound datagram.
    Send,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::MalformedDatagram => "malformed_datagram",
            TransportErrorKind::Send => "send",
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket I/O error")]
    Io(#[from] io::Error),

    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("peer is not connected")]
    NotConnected,

    #[error("transport is stopped")]
    Stopped,
}

/// Callbacks invoked synchronously from [`Transport::poll`], always on the
/// polling thread.
pub trait EventListener {
    /// An unknown endpoint passed the connection-key check; the listener
    /// decides whether to admit it. An undecided request is rejected when
    /// dropped.
    fn connection_requested(&mut self, request: ConnectionRequest);

    fn peer_connected(&mut self, peer: Peer);

    fn peer_disconnected(&mut self, peer: Peer, reason: DisconnectReason);

    fn receive(&mut self, peer: Peer, data: Bytes, class: Reliability);

    fn error(&mut self, endpoint: Option<SocketAddr>, kind: TransportErrorKind) {
        let _ = (endpoint, kind);
    }
}

/// Byte/packet counters. The only transport hooks that may be wired to a
/// metrics recorder; everything else stays on the polling thread.
pub trait TransportMetrics: Send + Sync {
    fn rx_packet(&self, bytes: usize);
    fn tx_packet(&self, bytes: usize);
    fn send_error(&self);
}

/// Default no-op counters.
pub struct NoopTransportMetrics;

impl TransportMetrics for NoopTransportMetrics {
    fn rx_packet(&self, _bytes: usize) {}
    fn tx_packet(&self, _bytes: usize) {}
    fn send_error(&self) {}
}
