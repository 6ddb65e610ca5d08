//! Thread-safe in-process bridge substituting for the network between a
//! server-side and a client-side [`Connector`](crate::connector::Connector)
//! that live in the same process.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::packet::TaggedPacket;

/// Severity-ordered status of a loopback bridge. Monotonic: once raised, a
/// bridge's status never drops back down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopbackStatus {
    Active,
    EndedGraceful,
    EndedError,
}

struct Inner {
    to_server: VecDeque<TaggedPacket>,
    to_client: VecDeque<TaggedPacket>,
    status: LoopbackStatus,
}

struct Shared {
    inner: Mutex<Inner>,
}

/// One Connector's handle onto a bridge. Exactly two exist per bridge, one
/// held by each side; cloning an end does not create a third party, it just
/// hands out another reference to the same shared state.
#[derive(Clone)]
pub struct LoopbackEnd {
    shared: Arc<Shared>,
    is_server_side: bool,
}

/// Construct a fresh bridge, returning the server-side and client-side ends.
pub fn new_pair() -> (LoopbackEnd, LoopbackEnd) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            to_server: VecDeque::new(),
            to_client: VecDeque::new(),
            status: LoopbackStatus::Active,
        }),
    });
    (
        LoopbackEnd { shared: shared.clone(), is_server_side: true },
        LoopbackEnd { shared, is_server_side: false },
    )
}

impl LoopbackEnd {
    /// Append `packets` to the deque bound for the other side, draining
    /// `packets` on return.
    pub fn put_data(&self, packets: &mut Vec<TaggedPacket>) {
        let mut inner = self.shared.inner.lock().unwrap();
        let destination = if self.is_server_side { &mut inner.to_client } else { &mut inner.to_server };
        destination.extend(packets.drain(..));
    }

    /// Drain this side's inbound deque into `out`. Returns whether anything
    /// arrived.
    pub fn get_data(&self, out: &mut Vec<TaggedPacket>) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        let source = if self.is_server_side { &mut inner.to_server } else { &mut inner.to_client };
        if source.is_empty() {
            return false;
        }
        out.extend(source.drain(..));
        true
    }

    pub fn status(&self) -> LoopbackStatus {
        self.shared.inner.lock().unwrap().status
    }

    /// Raise the bridge's status, retaining the maximum of the current and
    /// requested value.
    pub fn set_status(&self, status: LoopbackStatus) {
        let mut inner = self.shared.inner.lock().unwrap();
        if status > inner.status {
            inner.status = status;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transfers_packets_in_one_direction() {
        let (server_end, client_end) = new_pair();
        let mut outgoing = vec![TaggedPacket { bytes: vec![1, 2, 3] }];
        server_end.put_data(&mut outgoing);
        assert!(outgoing.is_empty());

        let mut received = Vec::new();
        assert!(client_end.get_data(&mut received));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].bytes, vec![1, 2, 3]);
        assert!(!client_end.get_data(&mut Vec::new()));
    }

    #[test]
    fn status_is_monotonic() {
        let (server_end, client_end) = new_pair();
        server_end.set_status(LoopbackStatus::EndedError);
        server_end.set_status(LoopbackStatus::EndedGraceful);
        assert_eq!(client_end.status(), LoopbackStatus::EndedError);
    }

    #[test]
    fn ends_see_each_others_direction() {
        let (server_end, client_end) = new_pair();
        let mut from_client = vec![TaggedPacket { bytes: vec![9] }];
        client_end.put_data(&mut from_client);
        let mut received = Vec::new();
        assert!(server_end.get_data(&mut received));
        assert_eq!(received[0].bytes, vec![9]);
    }
}
