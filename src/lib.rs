//! Reliable, ordered message delivery over UDP for client/server real-time
//! applications.
//!
//! A [`Server`](node::Server) accepts connections from many
//! [`Client`](node::Client)s (or the reverse happens locally, via
//! [`Server::accept_local_connection`](node::Server::accept_local_connection)),
//! each side driven by one tick's worth of
//! [`update(Receive)`](node::UpdateMode::Receive) followed by
//! [`update(Send)`](node::UpdateMode::Send). Application messages are
//! dispatched through a [`HandlerRegistry`](handler::HandlerRegistry) keyed
//! by an integer id, folded into whatever application context type the
//! caller chooses.

#![warn(clippy::all)]
#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

pub mod connector;
pub mod cursor;
pub mod error;
pub mod event;
pub mod handler;
pub mod loopback;
pub mod node;
pub mod packet;
pub mod socket;

pub use connector::{Connector, ConnectorStatus, LatencyStats, RemoteInfo, RetransmitPredicate};
pub use error::{ConnectorError, CursorError, NodeError};
pub use event::{ConnectAttemptFailedReason, DisconnectReason, Event, EventFactory};
pub use handler::HandlerRegistry;
pub use node::{
    create_client, create_dummy_client, create_dummy_server, create_server, Client, ComposeReceiver,
    DummyClient, DummyServer, Server, UpdateMode,
};
pub use socket::{NetworkingStack, Protocol, SocketStatus};
