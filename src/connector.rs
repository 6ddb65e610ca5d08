//! The Connector state machine: handshake, fragmentation, acknowledgement,
//! latency measurement and timeout detection for one remote peer.
//!
//! Protocol-fatal conditions are collapsed into [`ConnectorError`] variants
//! and handled once, at the top of [`Connector::received_packet`], rather
//! than threaded through every nested packet-processing call.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::cursor::PacketCursor;
use crate::error::ConnectorError;
use crate::event::{ConnectAttemptFailedReason, DisconnectReason, Event, EventFactory};
use crate::handler::HandlerRegistry;
use crate::loopback::{LoopbackEnd, LoopbackStatus};
use crate::packet::{
    self, RecvSlot, RecvTag, SendSlot, SendTag, TaggedPacket, MAX_UPLOADS_PER_PASS,
};
use crate::socket::{SocketAdapter, SocketStatus};

/// Decides whether an unacknowledged packet should be retransmitted this
/// pass, given how many passes it has waited and the connector's current
/// mean round-trip latency.
pub type RetransmitPredicate = fn(cycles_since_last_transmit: u32, elapsed: Duration, mean_latency_us: u64) -> bool;

/// Retransmit once the packet has waited at least twice the observed mean
/// latency.
pub fn default_retransmit_predicate(_cycles_since_last_transmit: u32, elapsed: Duration, mean_latency_us: u64) -> bool {
    elapsed.as_micros() as u64 >= 2 * mean_latency_us
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Disconnected,
    Connecting,
    Accepting,
    Connected,
}

/// Mean/optimistic/pessimistic round-trip latency observed over one
/// receive pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyStats {
    pub mean_us: u64,
    pub optimistic_us: u64,
    pub pessimistic_us: u64,
}

struct LatencyAccumulator {
    sum_us: u64,
    count: u64,
    min_us: u64,
    max_us: u64,
}

impl LatencyAccumulator {
    fn new() -> Self {
        Self { sum_us: 0, count: 0, min_us: u64::MAX, max_us: 0 }
    }

    fn record(&mut self, sample: Duration) {
        let us = sample.as_micros() as u64;
        self.sum_us += us;
        self.count += 1;
        self.min_us = self.min_us.min(us);
        self.max_us = self.max_us.max(us);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteInfo {
    pub addr: SocketAddr,
}

/// One remote peer's connection state machine. A [`Server`](crate::node::Server)
/// owns one per client slot; a [`Client`](crate::node::Client) owns exactly
/// one.
pub struct Connector {
    status: ConnectorStatus,
    remote: Option<RemoteInfo>,
    client_index: Option<usize>,
    passphrase: String,
    max_packet_size: usize,
    timeout_limit: Duration,
    timeout_stopwatch: Instant,
    latency: LatencyStats,
    latency_accum: Option<LatencyAccumulator>,
    send_buffer: VecDeque<SendSlot>,
    send_buffer_head_index: u32,
    recv_buffer: VecDeque<RecvSlot>,
    recv_buffer_head_index: u32,
    pending_acks: Vec<u32>,
    retransmit_predicate: RetransmitPredicate,
    loopback: Option<LoopbackEnd>,
    events: EventFactory,
    /// One-shot: set by `start_session`, cleared by the next
    /// `handle_data_messages` call, which is a no-op while it is set. Gives
    /// the application exactly one tick to observe `Connected` before any
    /// user message for that connection can be dispatched.
    awaiting_first_data: bool,
}

impl Connector {
    pub fn new(
        passphrase: impl Into<String>,
        max_packet_size: usize,
        timeout_limit: Duration,
        events: EventFactory,
    ) -> Self {
        Self {
            status: ConnectorStatus::Disconnected,
            remote: None,
            client_index: None,
            passphrase: passphrase.into(),
            max_packet_size,
            timeout_limit,
            timeout_stopwatch: Instant::now(),
            latency: LatencyStats::default(),
            latency_accum: None,
            send_buffer: VecDeque::new(),
            send_buffer_head_index: 1,
            recv_buffer: VecDeque::new(),
            recv_buffer_head_index: 1,
            pending_acks: Vec::new(),
            retransmit_predicate: default_retransmit_predicate,
            loopback: None,
            events,
            awaiting_first_data: false,
        }
    }

    pub fn status(&self) -> ConnectorStatus {
        self.status
    }

    pub fn remote_info(&self) -> Option<RemoteInfo> {
        self.remote
    }

    pub fn client_index(&self) -> Option<usize> {
        self.client_index
    }

    pub fn set_client_index(&mut self, index: usize) {
        self.client_index = Some(index);
    }

    pub fn is_connected_locally(&self) -> bool {
        self.loopback.is_some()
    }

    pub fn send_buffer_len(&self) -> usize {
        self.send_buffer.len()
    }

    pub fn recv_buffer_len(&self) -> usize {
        self.recv_buffer.len()
    }

    pub fn latency_stats(&self) -> LatencyStats {
        self.latency
    }

    pub fn set_retransmit_predicate(&mut self, predicate: RetransmitPredicate) {
        self.retransmit_predicate = predicate;
    }

    pub fn set_timeout_limit(&mut self, limit: Duration) {
        self.timeout_limit = limit;
    }

    // ---- handshake -----------------------------------------------------

    /// Try to interpret `datagram` from `sender` as a HELLO establishing a
    /// new connection. Returns whether it was accepted.
    pub fn try_accept(&mut self, sender: SocketAddr, datagram: &[u8]) -> bool {
        debug_assert_eq!(self.status, ConnectorStatus::Disconnected);
        let mut cursor = PacketCursor::from_bytes(datagram.to_vec());
        let pkt_type = match cursor.extract_u32() {
            Ok(t) => t,
            Err(_) => return false,
        };
        if pkt_type != packet::HELLO {
            return false;
        }
        let passphrase = match cursor.extract_string() {
            Ok(s) => s,
            Err(_) => return false,
        };
        if passphrase != self.passphrase {
            self.events.push(Event::BadPassphrase { received_passphrase: passphrase });
            return false;
        }
        self.remote = Some(RemoteInfo { addr: sender });
        self.status = ConnectorStatus::Accepting;
        self.reset_buffers();
        true
    }

    /// Local-loopback equivalent of `try_accept`: no HELLO/CONNECT exchange
    /// takes place, the connector moves straight to `Connected`.
    pub fn try_accept_local(&mut self, remote_addr: SocketAddr, loopback: LoopbackEnd) {
        debug_assert_eq!(self.status, ConnectorStatus::Disconnected);
        self.remote = Some(RemoteInfo { addr: remote_addr });
        self.loopback = Some(loopback);
        self.reset_buffers();
        self.start_session();
        self.events.push(Event::Connected { client_index: self.client_index });
    }

    pub fn connect(&mut self, target: SocketAddr) {
        debug_assert_eq!(self.status, ConnectorStatus::Disconnected);
        self.remote = Some(RemoteInfo { addr: target });
        self.status = ConnectorStatus::Connecting;
        self.reset_buffers();
    }

    /// Local-loopback equivalent of `connect`.
    pub fn connect_local(&mut self, remote_addr: SocketAddr, loopback: LoopbackEnd) {
        debug_assert_eq!(self.status, ConnectorStatus::Disconnected);
        self.remote = Some(RemoteInfo { addr: remote_addr });
        self.loopback = Some(loopback);
        self.reset_buffers();
        self.start_session();
        self.events.push(Event::Connected { client_index: self.client_index });
    }

    pub fn disconnect(&mut self, notify_remote: bool, socket: &SocketAdapter) {
        if self.status == ConnectorStatus::Disconnected {
            return;
        }
        if notify_remote {
            if let Some(loopback) = &self.loopback {
                loopback.set_status(LoopbackStatus::EndedGraceful);
            } else if let Some(remote) = self.remote {
                let mut cursor = PacketCursor::new();
                cursor.append_u32(packet::DISCONNECT);
                let _ = socket.send(cursor.as_bytes(), remote.addr);
            }
        }
        self.reset();
    }

    pub fn check_for_timeout(&mut self) {
        if self.timeout_limit.is_zero() || self.loopback.is_some() {
            return;
        }
        if self.timeout_stopwatch.elapsed() < self.timeout_limit {
            return;
        }
        let was_connected = self.status == ConnectorStatus::Connected;
        debug!("connector timed out (connected={})", was_connected);
        self.reset();
        if was_connected {
            self.events.push(Event::Disconnected {
                reason: DisconnectReason::TimedOut,
                message: "connection timed out".into(),
            });
        } else {
            self.events.push(Event::ConnectAttemptFailed { reason: ConnectAttemptFailedReason::TimedOut });
        }
    }

    fn start_session(&mut self) {
        self.status = ConnectorStatus::Connected;
        self.timeout_stopwatch = Instant::now();
        self.awaiting_first_data = true;
    }

    fn reset_buffers(&mut self) {
        self.send_buffer.clear();
        self.recv_buffer.clear();
        self.pending_acks.clear();
        self.send_buffer_head_index = 1;
        self.recv_buffer_head_index = 1;
        self.prepare_next_outgoing_data_packet(packet::DATA);
    }

    pub fn reset(&mut self) {
        if let Some(loopback) = self.loopback.take() {
            loopback.set_status(LoopbackStatus::EndedGraceful);
        }
        self.status = ConnectorStatus::Disconnected;
        self.remote = None;
        self.client_index = None;
        self.send_buffer.clear();
        self.recv_buffer.clear();
        self.pending_acks.clear();
        self.send_buffer_head_index = 1;
        self.recv_buffer_head_index = 1;
        self.latency = LatencyStats::default();
        self.awaiting_first_data = false;
    }

    // ---- sending ---------------------------------------------------------

    pub fn send(&mut self, socket: &SocketAdapter) {
        match self.status {
            ConnectorStatus::Connecting => {
                let mut cursor = PacketCursor::new();
                cursor.append_u32(packet::HELLO);
                cursor.append_string(&self.passphrase);
                let remote = self.remote.expect("connecting connector has a remote");
                let _ = socket.send(cursor.as_bytes(), remote.addr);
            }
            ConnectorStatus::Accepting => {
                let mut cursor = PacketCursor::new();
                cursor.append_u32(packet::CONNECT);
                cursor.append_string(&self.passphrase);
                cursor.append_i32(self.client_index.map(|i| i as i32).unwrap_or(-1));
                let remote = self.remote.expect("accepting connector has a remote");
                let _ = socket.send(cursor.as_bytes(), remote.addr);
            }
            ConnectorStatus::Connected => {
                if self.loopback.is_some() {
                    self.transfer_all_data_to_local_peer();
                } else {
                    self.upload_all_data(socket);
                }
            }
            ConnectorStatus::Disconnected => {}
        }
    }

    fn upload_all_data(&mut self, socket: &SocketAdapter) {
        let mut uploaded = 0u32;
        let mut disconnected = false;
        let remote_addr = match self.remote {
            Some(remote) => remote.addr,
            None => return,
        };
        for i in 0..self.send_buffer.len() {
            if uploaded >= MAX_UPLOADS_PER_PASS {
                break;
            }
            let should_send = match self.send_buffer[i].tag {
                SendTag::AcknowledgedWeakly | SendTag::AcknowledgedStrongly => false,
                SendTag::ReadyForSending => true,
                SendTag::NotAcknowledged => (self.retransmit_predicate)(
                    self.send_buffer[i].cycles_since_last_transmit,
                    self.send_buffer[i].stopwatch.elapsed(),
                    self.latency.mean_us,
                ),
            };
            if !should_send {
                if self.send_buffer[i].tag == SendTag::NotAcknowledged {
                    self.send_buffer[i].cycles_since_last_transmit += 1;
                }
                continue;
            }
            let status = socket.send(&self.send_buffer[i].bytes, remote_addr);
            match status {
                SocketStatus::Ok | SocketStatus::NotReady => {
                    let slot = &mut self.send_buffer[i];
                    slot.stopwatch = Instant::now();
                    slot.cycles_since_last_transmit = 0;
                    slot.tag = SendTag::NotAcknowledged;
                    uploaded += 1;
                    if status == SocketStatus::NotReady {
                        break;
                    }
                }
                SocketStatus::Disconnected => {
                    disconnected = true;
                    break;
                }
            }
        }
        if disconnected {
            warn!("socket disconnected while uploading data");
            self.events.push(Event::Disconnected {
                reason: DisconnectReason::Error,
                message: "socket disconnected".into(),
            });
            self.reset();
            return;
        }
        self.prepare_next_outgoing_data_packet(packet::DATA);
    }

    /// Local connections have no wire round-trip, so there is nothing to
    /// acknowledge: the whole buffer moves across the bridge unconditionally
    /// and is immediately considered delivered.
    fn transfer_all_data_to_local_peer(&mut self) {
        let mut outgoing: Vec<TaggedPacket> =
            self.send_buffer.iter().map(|slot| TaggedPacket { bytes: slot.bytes.clone() }).collect();
        if !outgoing.is_empty() {
            if let Some(loopback) = &self.loopback {
                loopback.put_data(&mut outgoing);
            }
        }
        self.send_buffer_head_index += self.send_buffer.len() as u32;
        self.send_buffer.clear();
        self.prepare_next_outgoing_data_packet(packet::DATA);
    }

    fn prepare_next_outgoing_data_packet(&mut self, pkt_type: u32) {
        let ordinal = self.send_buffer_head_index + self.send_buffer.len() as u32;
        let mut cursor = PacketCursor::new();
        cursor.append_u32(pkt_type);
        cursor.append_u32(ordinal);
        if self.loopback.is_none() {
            for ack in self.pending_acks.drain(..) {
                cursor.append_u32(ack);
            }
        }
        cursor.append_u32(0);
        self.send_buffer.push_back(SendSlot::new(cursor.into_bytes()));
    }

    /// Append application bytes to the connector's outgoing stream,
    /// fragmenting across DATA/DATA_MORE/DATA_TAIL packets as needed.
    pub fn append_to_next_outgoing_packet(&mut self, bytes: &[u8]) -> Result<(), ConnectorError> {
        if bytes.is_empty() {
            return Err(ConnectorError::EmptyAppend);
        }
        if bytes.len() < self.max_packet_size {
            let tail_len = self.send_buffer.back().expect("tail invariant").bytes.len();
            if tail_len + bytes.len() > self.max_packet_size {
                self.prepare_next_outgoing_data_packet(packet::DATA);
            }
            self.send_buffer.back_mut().unwrap().bytes.extend_from_slice(bytes);
        } else {
            self.fragment_append(bytes);
        }
        Ok(())
    }

    fn retag_send_tail(&mut self, new_type: u32) {
        let tail = self.send_buffer.back_mut().expect("tail invariant");
        tail.bytes[0..4].copy_from_slice(&new_type.to_be_bytes());
    }

    fn fragment_append(&mut self, bytes: &[u8]) {
        let tail_len = self.send_buffer.back().expect("tail invariant").bytes.len();
        if tail_len >= self.max_packet_size / 2 {
            self.prepare_next_outgoing_data_packet(packet::DATA_MORE);
        } else {
            self.retag_send_tail(packet::DATA_MORE);
        }

        let mut remaining = bytes;
        loop {
            let space = {
                let tail = self.send_buffer.back().unwrap();
                self.max_packet_size - tail.bytes.len()
            };
            let take = space.min(remaining.len());
            self.send_buffer.back_mut().unwrap().bytes.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if remaining.is_empty() {
                break;
            }
            self.prepare_next_outgoing_data_packet(packet::DATA_MORE);
        }

        self.retag_send_tail(packet::DATA_TAIL);
        self.prepare_next_outgoing_data_packet(packet::DATA);
    }

    // ---- receiving ---------------------------------------------------------

    pub fn prep_to_receive(&mut self) {
        self.latency_accum = Some(LatencyAccumulator::new());
    }

    pub fn receiving_finished(&mut self) {
        if let Some(acc) = self.latency_accum.take() {
            if acc.count > 0 {
                self.latency.mean_us = acc.sum_us / acc.count;
                self.latency.optimistic_us = acc.min_us;
                self.latency.pessimistic_us = acc.max_us;
            }
        }
    }

    pub fn send_acks(&mut self, socket: &SocketAdapter) {
        if self.status != ConnectorStatus::Connected || self.loopback.is_some() || self.pending_acks.is_empty() {
            return;
        }
        let mut cursor = PacketCursor::new();
        cursor.append_u32(packet::ACKS);
        for ord in self.pending_acks.drain(..) {
            cursor.append_u32(ord);
        }
        if let Some(remote) = self.remote {
            let _ = socket.send(cursor.as_bytes(), remote.addr);
        }
    }

    /// Decode and dispatch one inbound datagram. Protocol-fatal errors are
    /// handled here, once, rather than propagated to the caller.
    pub fn received_packet(&mut self, datagram: &[u8]) {
        let mut cursor = PacketCursor::from_bytes(datagram.to_vec());
        if let Err(err) = self.dispatch_received(&mut cursor) {
            self.handle_receive_error(err);
        }
    }

    fn dispatch_received(&mut self, cursor: &mut PacketCursor) -> Result<(), ConnectorError> {
        let pkt_type = cursor.extract_u32().map_err(ConnectorError::from)?;
        match pkt_type {
            packet::HELLO => self.process_hello(),
            packet::CONNECT => self.process_connect(cursor),
            packet::DISCONNECT => {
                self.process_disconnect();
                Ok(())
            }
            packet::DATA | packet::DATA_MORE | packet::DATA_TAIL => self.process_data(pkt_type, cursor),
            packet::ACKS => self.process_acks(cursor),
            _ => Err(ConnectorError::FatalPacketType),
        }
    }

    fn handle_receive_error(&mut self, err: ConnectorError) {
        warn!("connector protocol error: {}", err);
        let was_connected = self.status == ConnectorStatus::Connected;
        self.reset();
        if was_connected {
            self.events.push(Event::Disconnected { reason: DisconnectReason::Error, message: err.to_string() });
        } else {
            self.events.push(Event::ConnectAttemptFailed { reason: ConnectAttemptFailedReason::Error });
        }
    }

    fn process_hello(&mut self) -> Result<(), ConnectorError> {
        match self.status {
            ConnectorStatus::Connecting | ConnectorStatus::Disconnected => Err(ConnectorError::FatalPacketType),
            ConnectorStatus::Accepting => {
                trace!("ignoring duplicate HELLO while accepting");
                Ok(())
            }
            ConnectorStatus::Connected => {
                trace!("ignoring stray HELLO while connected");
                Ok(())
            }
        }
    }

    fn process_connect(&mut self, cursor: &mut PacketCursor) -> Result<(), ConnectorError> {
        match self.status {
            ConnectorStatus::Connecting => {
                let passphrase = cursor.extract_string().map_err(ConnectorError::from)?;
                let client_index = cursor.extract_i32().map_err(ConnectorError::from)?;
                if passphrase != self.passphrase {
                    self.events.push(Event::BadPassphrase { received_passphrase: passphrase });
                    self.reset();
                    return Ok(());
                }
                self.client_index = if client_index >= 0 { Some(client_index as usize) } else { None };
                self.start_session();
                self.events.push(Event::Connected { client_index: self.client_index });
                Ok(())
            }
            ConnectorStatus::Accepting | ConnectorStatus::Disconnected => Err(ConnectorError::FatalPacketType),
            ConnectorStatus::Connected => {
                trace!("ignoring stray CONNECT while connected");
                Ok(())
            }
        }
    }

    fn process_disconnect(&mut self) {
        self.events.push(Event::Disconnected {
            reason: DisconnectReason::Graceful,
            message: "remote disconnected".into(),
        });
        self.reset();
    }

    fn process_data(&mut self, pkt_type: u32, cursor: &mut PacketCursor) -> Result<(), ConnectorError> {
        match self.status {
            ConnectorStatus::Connecting | ConnectorStatus::Disconnected => Err(ConnectorError::FatalPacketType),
            ConnectorStatus::Accepting => {
                self.start_session();
                self.events.push(Event::Connected { client_index: self.client_index });
                self.save_data_packet(pkt_type, cursor)
            }
            ConnectorStatus::Connected => self.save_data_packet(pkt_type, cursor),
        }
    }

    fn save_data_packet(&mut self, pkt_type: u32, cursor: &mut PacketCursor) -> Result<(), ConnectorError> {
        let ordinal = cursor.extract_u32().map_err(ConnectorError::from)?;
        let index = ordinal.checked_sub(self.recv_buffer_head_index);
        let duplicate = match index {
            None => true,
            Some(i) => {
                let i = i as usize;
                i < self.recv_buffer.len() && self.recv_buffer[i].tag != RecvTag::WaitingForData
            }
        };
        if duplicate {
            self.consume_strong_ack_list(cursor)?;
            if self.loopback.is_none() {
                self.pending_acks.push(ordinal);
            }
            return Ok(());
        }
        let i = index.unwrap() as usize;
        while self.recv_buffer.len() <= i {
            self.recv_buffer.push_back(RecvSlot::waiting());
        }
        self.consume_strong_ack_list(cursor)?;
        let remaining = cursor.extract_remaining();
        let tag = packet::recv_tag_for_type(pkt_type).ok_or(ConnectorError::FatalPacketType)?;
        self.recv_buffer[i] = RecvSlot { bytes: remaining, tag };
        if self.loopback.is_none() {
            self.pending_acks.push(ordinal);
        }
        Ok(())
    }

    fn consume_strong_ack_list(&mut self, cursor: &mut PacketCursor) -> Result<(), ConnectorError> {
        loop {
            let ord = cursor.extract_u32().map_err(ConnectorError::from)?;
            if ord == 0 {
                break;
            }
            self.received_ack(ord, true);
        }
        Ok(())
    }

    fn process_acks(&mut self, cursor: &mut PacketCursor) -> Result<(), ConnectorError> {
        if self.status != ConnectorStatus::Connected {
            return Err(ConnectorError::FatalPacketType);
        }
        while !cursor.end_of_packet() {
            let ord = cursor.extract_u32().map_err(ConnectorError::from)?;
            self.received_ack(ord, false);
        }
        Ok(())
    }

    fn received_ack(&mut self, ordinal: u32, strong: bool) {
        if ordinal < self.send_buffer_head_index {
            return;
        }
        let i = (ordinal - self.send_buffer_head_index) as usize;
        if i >= self.send_buffer.len() {
            return;
        }
        if strong {
            let sample = self.send_buffer[i].stopwatch.elapsed();
            if let Some(acc) = &mut self.latency_accum {
                acc.record(sample);
            }
            self.timeout_stopwatch = Instant::now();
            self.send_buffer[i].tag = SendTag::AcknowledgedStrongly;
            self.send_buffer[i].bytes.clear();
        } else {
            self.send_buffer[i].tag = SendTag::AcknowledgedWeakly;
            self.send_buffer[i].bytes.clear();
        }
        if i == 0 {
            while let Some(front) = self.send_buffer.front() {
                if front.tag == SendTag::AcknowledgedStrongly {
                    self.send_buffer.pop_front();
                    self.send_buffer_head_index += 1;
                } else {
                    break;
                }
            }
        }
    }

    /// Drain the receive buffer: assemble fragmented groups, unpack complete
    /// packets through `handlers`, and absorb any loopback arrivals.
    pub fn handle_data_messages<Ctx>(
        &mut self,
        ctx: &mut Ctx,
        handlers: &HandlerRegistry<Ctx>,
        sender_index: Option<usize>,
    ) {
        if self.awaiting_first_data {
            self.awaiting_first_data = false;
            return;
        }

        if let Some(loopback) = self.loopback.clone() {
            let mut incoming = Vec::new();
            if loopback.get_data(&mut incoming) {
                self.timeout_stopwatch = Instant::now();
            }
            for packet in incoming {
                let mut cursor = PacketCursor::from_bytes(packet.bytes);
                let pkt_type = match cursor.extract_u32() {
                    Ok(t) => t,
                    Err(_) => {
                        self.handle_receive_error(ConnectorError::PacketReadError);
                        return;
                    }
                };
                if let Err(err) = self.process_data(pkt_type, &mut cursor) {
                    self.handle_receive_error(err);
                    return;
                }
            }
        }

        loop {
            let head_tag = match self.recv_buffer.front() {
                Some(slot) => slot.tag,
                None => break,
            };
            match head_tag {
                RecvTag::WaitingForMore => match self.try_assemble_fragment_group() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => {
                        self.handle_receive_error(err);
                        return;
                    }
                },
                RecvTag::ReadyForUnpacking => {
                    let slot = self.recv_buffer.pop_front().unwrap();
                    self.recv_buffer_head_index += 1;
                    let mut cursor = PacketCursor::from_bytes(slot.bytes);
                    while !cursor.end_of_packet() {
                        let handler_id = match cursor.extract_u32() {
                            Ok(id) => id,
                            Err(_) => {
                                self.handle_receive_error(ConnectorError::PacketReadError);
                                return;
                            }
                        };
                        if handlers.dispatch(handler_id, ctx, sender_index, &mut cursor).is_err() {
                            self.handle_receive_error(ConnectorError::IllegalMessage);
                            return;
                        }
                    }
                }
                RecvTag::Unpacked => {
                    self.recv_buffer.pop_front();
                    self.recv_buffer_head_index += 1;
                }
                RecvTag::WaitingForData | RecvTag::WaitingForMoreTail => break,
            }
        }

        if let Some(loopback) = &self.loopback {
            match loopback.status() {
                LoopbackStatus::Active => {}
                LoopbackStatus::EndedGraceful => {
                    self.events.push(Event::Disconnected {
                        reason: DisconnectReason::Graceful,
                        message: "peer closed the local connection".into(),
                    });
                    self.reset();
                }
                LoopbackStatus::EndedError => {
                    self.events.push(Event::Disconnected {
                        reason: DisconnectReason::Error,
                        message: "local connection ended in error".into(),
                    });
                    self.reset();
                }
            }
        }
    }

    fn try_assemble_fragment_group(&mut self) -> Result<bool, ConnectorError> {
        let mut end = None;
        for idx in 1..self.recv_buffer.len() {
            match self.recv_buffer[idx].tag {
                RecvTag::WaitingForMore => continue,
                RecvTag::WaitingForMoreTail => {
                    end = Some(idx);
                    break;
                }
                RecvTag::WaitingForData => return Ok(false),
                _ => return Err(ConnectorError::IllegalMessage),
            }
        }
        let end = match end {
            Some(e) => e,
            None => return Ok(false),
        };
        let mut combined = std::mem::take(&mut self.recv_buffer[0].bytes);
        for idx in 1..=end {
            combined.extend_from_slice(&self.recv_buffer[idx].bytes);
            self.recv_buffer[idx].bytes.clear();
            self.recv_buffer[idx].tag = RecvTag::Unpacked;
        }
        self.recv_buffer[0].bytes = combined;
        self.recv_buffer[0].tag = RecvTag::ReadyForUnpacking;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_connector() -> Connector {
        Connector::new("s3cr3t", 512, Duration::from_secs(5), EventFactory::new())
    }

    #[test]
    fn fresh_connector_is_disconnected_with_primed_tail() {
        let connector = new_connector();
        assert_eq!(connector.status(), ConnectorStatus::Disconnected);
    }

    #[test]
    fn connect_transitions_to_connecting_and_primes_a_tail() {
        let mut connector = new_connector();
        connector.connect("127.0.0.1:9000".parse().unwrap());
        assert_eq!(connector.status(), ConnectorStatus::Connecting);
        assert_eq!(connector.send_buffer_len(), 1);
    }

    #[test]
    fn try_accept_rejects_wrong_passphrase() {
        let mut connector = new_connector();
        let mut hello = PacketCursor::new();
        hello.append_u32(packet::HELLO);
        hello.append_string("wrong");
        let accepted = connector.try_accept("127.0.0.1:9000".parse().unwrap(), hello.as_bytes());
        assert!(!accepted);
        assert_eq!(connector.status(), ConnectorStatus::Disconnected);
    }

    #[test]
    fn try_accept_rejects_non_hello_packet() {
        let mut connector = new_connector();
        let mut packet = PacketCursor::new();
        packet.append_u32(packet::DATA);
        assert!(!connector.try_accept("127.0.0.1:9000".parse().unwrap(), packet.as_bytes()));
    }

    #[test]
    fn try_accept_moves_to_accepting_on_match() {
        let mut connector = new_connector();
        let mut hello = PacketCursor::new();
        hello.append_u32(packet::HELLO);
        hello.append_string("s3cr3t");
        assert!(connector.try_accept("127.0.0.1:9000".parse().unwrap(), hello.as_bytes()));
        assert_eq!(connector.status(), ConnectorStatus::Accepting);
    }

    #[test]
    fn local_handshake_skips_straight_to_connected() {
        let (server_end, _client_end) = crate::loopback::new_pair();
        let mut connector = new_connector();
        connector.try_accept_local("0.0.0.0:0".parse().unwrap(), server_end);
        assert_eq!(connector.status(), ConnectorStatus::Connected);
        assert!(connector.is_connected_locally());
    }

    #[test]
    fn append_within_one_packet_does_not_fragment() {
        let mut connector = new_connector();
        connector.connect("127.0.0.1:9000".parse().unwrap());
        connector.append_to_next_outgoing_packet(b"small").unwrap();
        assert_eq!(connector.send_buffer_len(), 1);
    }

    #[test]
    fn append_larger_than_max_packet_size_fragments() {
        let mut connector = new_connector();
        connector.connect("127.0.0.1:9000".parse().unwrap());
        let huge = vec![7u8; 2000];
        connector.append_to_next_outgoing_packet(&huge).unwrap();
        assert!(connector.send_buffer_len() > 1);
    }

    #[test]
    fn empty_append_is_rejected() {
        let mut connector = new_connector();
        connector.connect("127.0.0.1:9000".parse().unwrap());
        assert!(connector.append_to_next_outgoing_packet(&[]).is_err());
    }

    #[test]
    fn data_packet_processing_round_trips_through_handler() {
        let mut server = new_connector();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut hello = PacketCursor::new();
        hello.append_u32(packet::HELLO);
        hello.append_string("s3cr3t");
        assert!(server.try_accept(addr, hello.as_bytes()));

        let mut data = PacketCursor::new();
        data.append_u32(packet::DATA);
        data.append_u32(1);
        data.append_u32(0);
        data.append_u32(99);
        data.append_bytes(&[1, 2, 3]);
        server.received_packet(data.as_bytes());
        assert_eq!(server.status(), ConnectorStatus::Connected);

        server.prep_to_receive();
        server.receiving_finished();

        let mut registry: HandlerRegistry<Vec<u8>> = HandlerRegistry::new();
        registry.register(99, |ctx, _sender, cursor| {
            ctx.extend_from_slice(&cursor.extract_remaining());
            Ok(())
        });

        // The tick that transitions Accepting -> Connected is a no-op for
        // message delivery: the application gets one tick to observe
        // `Connected` before any user message for this connection arrives.
        let mut ctx = Vec::new();
        server.handle_data_messages(&mut ctx, &registry, None);
        assert!(ctx.is_empty());

        server.handle_data_messages(&mut ctx, &registry, None);
        assert_eq!(ctx, vec![1, 2, 3]);
    }
}
