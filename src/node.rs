//! `Server`/`Client` nodes: own a socket and one or more `Connector`s, and
//! orchestrate one tick's `update(Receive)`/`update(Send)` pass.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::connector::{Connector, ConnectorStatus, RetransmitPredicate};
use crate::error::NodeError;
use crate::event::{Event, EventFactory};
use crate::handler::HandlerRegistry;
use crate::socket::{NetworkingStack, Protocol, SocketAdapter, SocketStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Receive,
    Send,
}

/// Who a `Server::compose` call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeReceiver {
    Index(usize),
    ForAll,
}

/// A listening node that accepts connections from many clients.
pub struct Server {
    passphrase: String,
    max_packet_size: usize,
    timeout_limit: Duration,
    socket: SocketAdapter,
    connectors: Vec<Connector>,
    events: EventFactory,
    running: bool,
}

impl Server {
    pub fn new(passphrase: impl Into<String>, capacity: usize, max_packet_size: usize) -> Self {
        let passphrase = passphrase.into();
        let events = EventFactory::new();
        let timeout_limit = Duration::from_secs(30);
        let connectors = (0..capacity)
            .map(|_| Connector::new(passphrase.clone(), max_packet_size, timeout_limit, events.clone()))
            .collect();
        Self {
            passphrase,
            max_packet_size,
            timeout_limit,
            socket: SocketAdapter::new(Protocol::Udp, NetworkingStack::Default),
            connectors,
            events,
            running: false,
        }
    }

    pub fn start(&mut self, local_port: u16) -> io::Result<()> {
        self.socket.bind(local_port)?;
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        for i in 0..self.connectors.len() {
            if self.connectors[i].status() != ConnectorStatus::Disconnected {
                self.connectors[i].disconnect(true, &self.socket);
            }
        }
        self.socket.close();
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn size(&self) -> usize {
        self.connectors.len()
    }

    /// Grow the number of client slots. Shrinking is not supported.
    pub fn resize(&mut self, new_size: usize) -> Result<(), NodeError> {
        if new_size < self.connectors.len() {
            return Err(NodeError::ShrinkNotSupported);
        }
        while self.connectors.len() < new_size {
            self.connectors.push(Connector::new(
                self.passphrase.clone(),
                self.max_packet_size,
                self.timeout_limit,
                self.events.clone(),
            ));
        }
        Ok(())
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_port()
    }

    pub fn set_timeout_limit(&mut self, limit: Duration) {
        self.timeout_limit = limit;
        for connector in &mut self.connectors {
            connector.set_timeout_limit(limit);
        }
    }

    pub fn set_retransmit_predicate(&mut self, predicate: RetransmitPredicate) {
        for connector in &mut self.connectors {
            connector.set_retransmit_predicate(predicate);
        }
    }

    pub fn client_connector(&self, client_index: usize) -> Option<&Connector> {
        self.connectors.get(client_index)
    }

    pub fn kick_client(&mut self, client_index: usize) {
        if let Some(connector) = self.connectors.get_mut(client_index) {
            connector.disconnect(true, &self.socket);
        }
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop()
    }

    pub fn compose(&mut self, receiver: ComposeReceiver, bytes: &[u8]) -> Result<(), NodeError> {
        match receiver {
            ComposeReceiver::Index(index) => {
                let connector = self.connectors.get_mut(index).ok_or(NodeError::InvalidClientIndex)?;
                if connector.status() != ConnectorStatus::Connected {
                    return Err(NodeError::NotConnected);
                }
                connector.append_to_next_outgoing_packet(bytes)?;
                Ok(())
            }
            ComposeReceiver::ForAll => {
                for connector in self.connectors.iter_mut() {
                    if connector.status() == ConnectorStatus::Connected {
                        connector.append_to_next_outgoing_packet(bytes)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Bridge a local-process client directly onto a free slot, bypassing
    /// the wire handshake entirely.
    pub fn accept_local_connection(&mut self, client: &mut Client) -> Result<usize, NodeError> {
        let index = self
            .connectors
            .iter()
            .position(|c| c.status() == ConnectorStatus::Disconnected)
            .ok_or(NodeError::ServerFull)?;
        let (server_end, client_end) = crate::loopback::new_pair();
        let placeholder: SocketAddr = "0.0.0.0:0".parse().unwrap();
        self.connectors[index].set_client_index(index);
        self.connectors[index].try_accept_local(placeholder, server_end);
        client.connector.connect_local(placeholder, client_end);
        Ok(index)
    }

    pub fn update<Ctx>(&mut self, mode: UpdateMode, ctx: &mut Ctx, handlers: &HandlerRegistry<Ctx>) {
        if !self.running {
            return;
        }
        match mode {
            UpdateMode::Receive => self.update_receive(ctx, handlers),
            UpdateMode::Send => self.update_send(),
        }
    }

    fn update_receive<Ctx>(&mut self, ctx: &mut Ctx, handlers: &HandlerRegistry<Ctx>) {
        for connector in &mut self.connectors {
            connector.prep_to_receive();
        }
        loop {
            let mut datagram = Vec::new();
            match self.socket.recv(&mut datagram) {
                (SocketStatus::Ok, Some(sender)) => {
                    if let Some(index) = self.find_connector_for(sender) {
                        self.connectors[index].received_packet(&datagram);
                    } else {
                        self.accept_new_client(sender, &datagram);
                    }
                }
                (SocketStatus::Ok, None) => {}
                (SocketStatus::NotReady, _) | (SocketStatus::Disconnected, _) => break,
            }
        }
        for i in 0..self.connectors.len() {
            if self.connectors[i].status() == ConnectorStatus::Connected {
                self.connectors[i].receiving_finished();
                self.connectors[i].send_acks(&self.socket);
            }
            if self.connectors[i].status() != ConnectorStatus::Disconnected {
                self.connectors[i].handle_data_messages(ctx, handlers, Some(i));
            }
            if self.connectors[i].status() != ConnectorStatus::Disconnected {
                self.connectors[i].check_for_timeout();
            }
        }
    }

    fn update_send(&mut self) {
        for connector in &mut self.connectors {
            if connector.status() != ConnectorStatus::Disconnected {
                connector.send(&self.socket);
            }
        }
    }

    fn find_connector_for(&self, sender: SocketAddr) -> Option<usize> {
        self.connectors
            .iter()
            .position(|c| c.remote_info().map(|r| r.addr) == Some(sender))
    }

    fn accept_new_client(&mut self, sender: SocketAddr, datagram: &[u8]) {
        if let Some(index) = self.connectors.iter().position(|c| c.status() == ConnectorStatus::Disconnected) {
            if self.connectors[index].try_accept(sender, datagram) {
                self.connectors[index].set_client_index(index);
            }
        }
    }
}

/// A node that connects to a single remote `Server`.
pub struct Client {
    passphrase: String,
    socket: SocketAdapter,
    connector: Connector,
    events: EventFactory,
    running: bool,
}

impl Client {
    pub fn new(passphrase: impl Into<String>, max_packet_size: usize) -> Self {
        let passphrase = passphrase.into();
        let events = EventFactory::new();
        let timeout_limit = Duration::from_secs(30);
        let connector = Connector::new(passphrase.clone(), max_packet_size, timeout_limit, events.clone());
        Self {
            passphrase,
            socket: SocketAdapter::new(Protocol::Udp, NetworkingStack::Default),
            connector,
            events,
            running: false,
        }
    }

    pub fn connect(&mut self, local_port: u16, server_addr: SocketAddr) -> io::Result<()> {
        self.socket.bind(local_port)?;
        self.running = true;
        self.connector.connect(server_addr);
        Ok(())
    }

    pub fn connect_local(&mut self, server: &mut Server) -> Result<(), NodeError> {
        self.running = true;
        server.accept_local_connection(self)?;
        Ok(())
    }

    pub fn disconnect(&mut self, notify_remote: bool) {
        self.connector.disconnect(notify_remote, &self.socket);
        self.socket.close();
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_port()
    }

    pub fn set_timeout_limit(&mut self, limit: Duration) {
        self.connector.set_timeout_limit(limit);
    }

    pub fn set_retransmit_predicate(&mut self, predicate: RetransmitPredicate) {
        self.connector.set_retransmit_predicate(predicate);
    }

    pub fn server_connector(&self) -> &Connector {
        &self.connector
    }

    pub fn client_index(&self) -> Option<usize> {
        self.connector.client_index()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop()
    }

    pub fn compose(&mut self, bytes: &[u8]) -> Result<(), NodeError> {
        if self.connector.status() != ConnectorStatus::Connected {
            return Err(NodeError::NotConnected);
        }
        self.connector.append_to_next_outgoing_packet(bytes)?;
        Ok(())
    }

    pub fn update<Ctx>(&mut self, mode: UpdateMode, ctx: &mut Ctx, handlers: &HandlerRegistry<Ctx>) {
        if !self.running {
            return;
        }
        match mode {
            UpdateMode::Receive => self.update_receive(ctx, handlers),
            UpdateMode::Send => self.update_send(),
        }
    }

    fn update_receive<Ctx>(&mut self, ctx: &mut Ctx, handlers: &HandlerRegistry<Ctx>) {
        self.connector.prep_to_receive();
        if !self.connector.is_connected_locally() {
            loop {
                let mut datagram = Vec::new();
                match self.socket.recv(&mut datagram) {
                    (SocketStatus::Ok, Some(sender)) => {
                        if self.connector.remote_info().map(|r| r.addr) == Some(sender) {
                            self.connector.received_packet(&datagram);
                        }
                    }
                    (SocketStatus::Ok, None) => {}
                    (SocketStatus::NotReady, _) | (SocketStatus::Disconnected, _) => break,
                }
            }
        }
        if self.connector.status() == ConnectorStatus::Connected {
            self.connector.receiving_finished();
            self.connector.send_acks(&self.socket);
        }
        if self.connector.status() != ConnectorStatus::Disconnected {
            let sender_index = self.connector.client_index();
            self.connector.handle_data_messages(ctx, handlers, sender_index);
        }
        if self.connector.status() != ConnectorStatus::Disconnected {
            self.connector.check_for_timeout();
        }
    }

    fn update_send(&mut self) {
        if self.connector.status() != ConnectorStatus::Disconnected {
            self.connector.send(&self.socket);
        }
    }
}

/// No-op `Server` stand-in used when networking is compiled out of a build
/// without touching call sites.
#[derive(Default)]
pub struct DummyServer;

impl DummyServer {
    pub fn new() -> Self {
        Self
    }

    pub fn start(&mut self, _local_port: u16) {}
    pub fn stop(&mut self) {}
    pub fn is_running(&self) -> bool {
        false
    }
    pub fn size(&self) -> usize {
        0
    }
    pub fn passphrase(&self) -> &str {
        ""
    }
    pub fn protocol(&self) -> Protocol {
        Protocol::Udp
    }
    pub fn update<Ctx>(&mut self, _mode: UpdateMode, _ctx: &mut Ctx, _handlers: &HandlerRegistry<Ctx>) {}
    pub fn poll_event(&mut self) -> Option<Event> {
        None
    }
    pub fn compose(&mut self, _receiver: ComposeReceiver, _bytes: &[u8]) -> Result<(), NodeError> {
        Ok(())
    }
}

/// No-op `Client` stand-in, mirroring `DummyServer`.
#[derive(Default)]
pub struct DummyClient;

impl DummyClient {
    pub fn new() -> Self {
        Self
    }

    pub fn connect(&mut self, _local_port: u16, _server_addr: SocketAddr) {}
    pub fn disconnect(&mut self, _notify_remote: bool) {}
    pub fn is_running(&self) -> bool {
        false
    }
    pub fn passphrase(&self) -> &str {
        ""
    }
    pub fn update<Ctx>(&mut self, _mode: UpdateMode, _ctx: &mut Ctx, _handlers: &HandlerRegistry<Ctx>) {}
    pub fn poll_event(&mut self) -> Option<Event> {
        None
    }
    pub fn compose(&mut self, _bytes: &[u8]) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Construct a live server, rejecting protocols other than UDP.
pub fn create_server(
    protocol: Protocol,
    passphrase: impl Into<String>,
    capacity: usize,
    max_packet_size: usize,
) -> Result<Server, NodeError> {
    match protocol {
        Protocol::Tcp => Err(NodeError::ProtocolNotImplemented),
        Protocol::Udp => Ok(Server::new(passphrase, capacity, max_packet_size)),
    }
}

pub fn create_dummy_server() -> DummyServer {
    DummyServer::new()
}

/// Construct a live client, rejecting protocols other than UDP.
pub fn create_client(protocol: Protocol, passphrase: impl Into<String>, max_packet_size: usize) -> Result<Client, NodeError> {
    match protocol {
        Protocol::Tcp => Err(NodeError::ProtocolNotImplemented),
        Protocol::Udp => Ok(Client::new(passphrase, max_packet_size)),
    }
}

pub fn create_dummy_client() -> DummyClient {
    DummyClient::new()
}
