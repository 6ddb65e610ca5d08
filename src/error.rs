//! Error types shared across the crate.
//!
//! Hand-written enums with manual `Display`/`Error` impls rather than a
//! derive-macro error crate.

use std::fmt;

/// A short or malformed read from a [`PacketCursor`](crate::cursor::PacketCursor).
#[derive(Debug)]
pub enum CursorError {
    UnexpectedEof,
}

impl fmt::Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorError::UnexpectedEof => write!(f, "unexpected end of packet"),
        }
    }
}

impl std::error::Error for CursorError {}

/// Errors a [`Connector`](crate::connector::Connector) can raise while
/// processing outgoing or incoming packets.
#[derive(Debug)]
pub enum ConnectorError {
    /// An unexpected packet type for the connector's current status. Stands
    /// in for the source's `FatalMessageTypeReceived` exception.
    FatalPacketType,
    /// A short or malformed read while decoding an inbound packet.
    PacketReadError,
    /// An unknown handler id, or a fragment group that could not be
    /// assembled.
    IllegalMessage,
    /// `append_to_next_outgoing_packet` was called with an empty slice.
    EmptyAppend,
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorError::FatalPacketType => {
                write!(f, "unexpected packet type for the current connector status")
            }
            ConnectorError::PacketReadError => write!(f, "short read while decoding a packet"),
            ConnectorError::IllegalMessage => {
                write!(f, "illegal message: unknown handler id or unassemblable fragment group")
            }
            ConnectorError::EmptyAppend => {
                write!(f, "cannot append zero bytes to an outgoing packet")
            }
        }
    }
}

impl std::error::Error for ConnectorError {}

impl From<CursorError> for ConnectorError {
    fn from(_: CursorError) -> Self {
        ConnectorError::PacketReadError
    }
}

/// Errors surfaced by [`Server`](crate::node::Server)/[`Client`](crate::node::Client)
/// construction and application-facing operations.
#[derive(Debug)]
pub enum NodeError {
    /// `Protocol::Tcp` was requested; this crate implements UDP only.
    ProtocolNotImplemented,
    /// `resize` was asked to shrink a server, which is unsupported.
    ShrinkNotSupported,
    /// No free connector slot was available to accept a new client.
    ServerFull,
    /// `compose`/`client_connector` referenced a client index out of range.
    InvalidClientIndex,
    /// `compose` was called on a connector that is not `Connected`.
    NotConnected,
    /// Binding or otherwise touching the underlying socket failed.
    Io(std::io::Error),
    /// Forwarded from the connector targeted by the operation.
    Connector(ConnectorError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::ProtocolNotImplemented => write!(f, "protocol not implemented"),
            NodeError::ShrinkNotSupported => write!(f, "shrinking a server's capacity is not supported"),
            NodeError::ServerFull => write!(f, "server has no free connector slots"),
            NodeError::InvalidClientIndex => write!(f, "client index out of range"),
            NodeError::NotConnected => write!(f, "connector is not connected"),
            NodeError::Io(err) => write!(f, "socket error: {}", err),
            NodeError::Connector(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Io(err) => Some(err),
            NodeError::Connector(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err)
    }
}

impl From<ConnectorError> for NodeError {
    fn from(err: ConnectorError) -> Self {
        NodeError::Connector(err)
    }
}
