//! Wire packet type tags and the tagged buffer slots a [`Connector`](crate::connector::Connector)
//! stores outgoing and incoming packets in.

use std::time::Instant;

pub const HELLO: u32 = 0x3BF0_E110;
pub const CONNECT: u32 = 0x83C9_6CA4;
pub const DISCONNECT: u32 = 0xD0F2_35AB;
pub const DATA: u32 = 0xA765_B8F6;
pub const DATA_MORE: u32 = 0x782A_2A78;
pub const DATA_TAIL: u32 = 0x00DA_7A11;
pub const ACKS: u32 = 0x71AC_2519;

/// Upper bound on a single datagram, matching the wider engine's
/// `MAX_PACKET_SIZE`.
pub const MAX_DATAGRAM_SIZE: usize = 65_000;

/// Ceiling on datagrams uploaded per `send()` pass, so one laggy Connector
/// cannot starve the others sharing a socket.
pub const MAX_UPLOADS_PER_PASS: u32 = 128;

/// State of an entry in a Connector's `sendBuffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTag {
    /// Newly created, not yet transmitted.
    ReadyForSending,
    /// Transmitted at least once, awaiting ack.
    NotAcknowledged,
    /// Acknowledged implicitly by receipt of a later packet. Body cleared.
    AcknowledgedWeakly,
    /// Acknowledged explicitly. Body cleared, latency sample taken.
    AcknowledgedStrongly,
}

/// State of an entry in a Connector's `recvBuffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTag {
    /// Slot reserved, packet not yet received.
    WaitingForData,
    /// Fully received and dispatchable.
    ReadyForUnpacking,
    /// Received, middle piece of a fragmented group.
    WaitingForMore,
    /// Received, last fragment of a group.
    WaitingForMoreTail,
    /// Fragment already absorbed into its group's head packet.
    Unpacked,
}

/// An outgoing packet awaiting transmission or acknowledgement.
#[derive(Debug)]
pub struct SendSlot {
    pub bytes: Vec<u8>,
    pub stopwatch: Instant,
    pub cycles_since_last_transmit: u32,
    pub tag: SendTag,
}

impl SendSlot {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            stopwatch: Instant::now(),
            cycles_since_last_transmit: 0,
            tag: SendTag::ReadyForSending,
        }
    }
}

/// A received packet awaiting reassembly or dispatch.
#[derive(Debug)]
pub struct RecvSlot {
    pub bytes: Vec<u8>,
    pub tag: RecvTag,
}

impl RecvSlot {
    pub fn waiting() -> Self {
        Self { bytes: Vec::new(), tag: RecvTag::WaitingForData }
    }
}

/// A complete datagram exchanged over the [loopback bridge](crate::loopback),
/// carrying the same bytes a real socket send would, without wire encoding.
#[derive(Debug, Clone)]
pub struct TaggedPacket {
    pub bytes: Vec<u8>,
}

/// Map a DATA/DATA_MORE/DATA_TAIL wire type to the recv-side tag a freshly
/// saved packet should carry.
pub fn recv_tag_for_type(packet_type: u32) -> Option<RecvTag> {
    match packet_type {
        DATA => Some(RecvTag::ReadyForUnpacking),
        DATA_MORE => Some(RecvTag::WaitingForMore),
        DATA_TAIL => Some(RecvTag::WaitingForMoreTail),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recv_tag_for_type_covers_data_variants() {
        assert_eq!(recv_tag_for_type(DATA), Some(RecvTag::ReadyForUnpacking));
        assert_eq!(recv_tag_for_type(DATA_MORE), Some(RecvTag::WaitingForMore));
        assert_eq!(recv_tag_for_type(DATA_TAIL), Some(RecvTag::WaitingForMoreTail));
        assert_eq!(recv_tag_for_type(HELLO), None);
    }
}
