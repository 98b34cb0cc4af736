//! The peer table (C1): the registry of local clients, expected or connected, keyed by
//! `(namespace, rank)`. A single logical identity may be bound to more than one socket, since a
//! client can `fork`/`exec` a child that re-initializes against this same server.

use crate::net::buffer::Buffer;
use crate::net::wire::{Header, OutFrame};
use hashbrown::HashMap;
use mio_uds::UnixStream;
use pmix_util::error::{PmixError, PmixResult};
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};

pub type PeerId = usize;

pub const READ_BUF_SIZE: usize = 65536;
pub const WRITE_BUF_SIZE: usize = 65536;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerState {
    /// Pre-registered by the lifecycle layer (e.g. `setup_fork`); no socket bound yet.
    Expected,
    /// Accepted but still inside the blocking handshake.
    Handshaking,
    /// Live: non-blocking reads and writes are active.
    Connected,
    /// Socket closed; the entry is a tombstone kept only so in-flight tracker references
    /// resolve to "gone" instead of panicking.
    Closed,
}

/// One entry in the peer table: one `(namespace, rank)` identity bound to at most one socket.
pub struct Peer {
    pub namespace: String,
    pub rank: i32,
    pub state: PeerState,
    stream: Option<UnixStream>,
    pub read_buffer: Buffer,
    pub write_buffer: Buffer,
    pub send_in_flight: Option<OutFrame>,
    pub send_queue: VecDeque<OutFrame>,
}

impl Peer {
    fn new(namespace: &str, rank: i32) -> Peer {
        Peer {
            namespace: namespace.to_owned(),
            rank,
            state: PeerState::Expected,
            stream: None,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            send_in_flight: None,
            send_queue: VecDeque::new(),
        }
    }

    pub fn stream(&self) -> Option<&UnixStream> {
        self.stream.as_ref()
    }

    pub fn stream_mut(&mut self) -> Option<&mut UnixStream> {
        self.stream.as_mut()
    }

    pub fn is_live(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Disjoint borrow of the read buffer and the socket, for the reactor's readable-event
    /// handler; a method call alone cannot return both at once since the borrow checker treats
    /// `stream_mut()` as borrowing all of `self`.
    pub fn read_parts(&mut self) -> (&mut Buffer, Option<&mut UnixStream>) {
        (&mut self.read_buffer, self.stream.as_mut())
    }

    /// Same as [`Peer::read_parts`], for the writable-event handler.
    pub fn write_parts(&mut self) -> (&mut Buffer, Option<&mut UnixStream>) {
        (&mut self.write_buffer, self.stream.as_mut())
    }

    /// Enqueues a reply (invariant I5: at most one frame in flight, the rest FIFO-ordered).
    /// Returns `true` if the caller must arm the writable event (the queue was previously idle).
    pub fn queue_reply(&mut self, frame: OutFrame) -> bool {
        if self.send_in_flight.is_none() && self.send_queue.is_empty() {
            self.send_in_flight = Some(frame);
            true
        } else {
            self.send_queue.push_back(frame);
            false
        }
    }

    /// Called once `send_in_flight` has been fully written: promotes the next queued frame.
    pub fn advance_send_queue(&mut self) {
        self.send_in_flight = self.send_queue.pop_front();
    }
}

/// Registry of expected and connected peers (C1 in the component table).
#[derive(Default)]
pub struct PeerTable {
    entries: Vec<Option<Peer>>,
    free: Vec<PeerId>,
    /// identity -> every socket-bound slot sharing that identity, in insertion order.
    by_identity: HashMap<(String, i32), Vec<PeerId>>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable {
            entries: Vec::new(),
            free: Vec::new(),
            by_identity: HashMap::new(),
        }
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.entries.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.entries.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// Pre-registers an identity with no socket bound; used by the lifecycle layer when
    /// preparing a child's environment ahead of its connect.
    pub fn register_expected(&mut self, namespace: &str, rank: i32) -> PeerId {
        let id = self.insert(Peer::new(namespace, rank));
        self.by_identity
            .entry((namespace.to_owned(), rank))
            .or_insert_with(Vec::new)
            .push(id);
        id
    }

    /// Binds a freshly accepted, handshake-validated socket to an identity. Reuses a
    /// pre-registered slot with no socket if one exists; otherwise appends a new slot sharing
    /// the identity. An identity with no existing slot at all is rejected with `Unknown`.
    pub fn bind_socket(&mut self, namespace: &str, rank: i32, stream: UnixStream) -> PmixResult<PeerId> {
        let key = (namespace.to_owned(), rank);

        let existing = self.by_identity.get(&key).cloned().unwrap_or_default();
        if existing.is_empty() {
            return Err(PmixError::Unknown);
        }

        for id in &existing {
            if let Some(peer) = self.entries[*id].as_mut() {
                if peer.stream.is_none() {
                    peer.stream = Some(stream);
                    peer.state = PeerState::Connected;
                    return Ok(*id);
                }
            }
        }

        let mut peer = Peer::new(namespace, rank);
        peer.stream = Some(stream);
        peer.state = PeerState::Connected;
        let id = self.insert(peer);
        self.by_identity.entry(key).or_insert_with(Vec::new).push(id);
        Ok(id)
    }

    /// Looks up a live peer by identity, disambiguating between multiple sockets bound to the
    /// same `(namespace, rank)` by raw fd when `sd` is `Some` (the case `bind_socket`'s
    /// multi-slot-per-identity support exists for). `sd: None` returns the first live slot for
    /// the identity, for callers that don't care which socket answers.
    pub fn find(&self, namespace: &str, rank: i32, sd: Option<RawFd>) -> Option<PeerId> {
        self.by_identity.get(&(namespace.to_owned(), rank))?.iter().copied().find(|id| match self.get(*id) {
            Some(p) if p.is_live() => match sd {
                Some(fd) => p.stream.as_ref().map(|s| s.as_raw_fd()) == Some(fd),
                None => true,
            },
            _ => false,
        })
    }

    /// Tears the entry down: closes (drops) the socket, marks it a tombstone, and frees the
    /// slot for reuse. The identity index entry is left in place so stray tracker references
    /// resolve to a `Closed` peer instead of a dangling id.
    pub fn unregister(&mut self, id: PeerId) {
        if let Some(peer) = self.entries.get_mut(id).and_then(|s| s.as_mut()) {
            if peer.state == PeerState::Closed {
                return;
            }
            peer.stream = None;
            peer.state = PeerState::Closed;
            peer.send_in_flight = None;
            peer.send_queue.clear();
            self.free.push(id);
        }
    }

    fn insert(&mut self, peer: Peer) -> PeerId {
        if let Some(id) = self.free.pop() {
            self.entries[id] = Some(peer);
            id
        } else {
            self.entries.push(Some(peer));
            self.entries.len() - 1
        }
    }
}

/// Wire-format accessor: every reply that targets `peer` needs a `(namespace, rank)` pair for
/// the header, independent of whatever tag the request arrived on.
pub fn header_identity(peer: &Peer) -> (&str, i32) {
    (&peer.namespace, peer.rank)
}

pub fn build_reply(peer_namespace: &str, peer_rank: i32, tag: u32, payload: std::rc::Rc<Vec<u8>>) -> OutFrame {
    OutFrame::new(peer_namespace, peer_rank, tag, payload)
}

pub fn empty_header(namespace: &str, rank: i32, tag: u32, nbytes: u32) -> Header {
    Header::new(namespace, rank, crate::net::wire::FrameType::User, tag, nbytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_socket_without_expected_entry_is_unknown() {
        let mut table = PeerTable::new();
        let (a, _b) = UnixStream::pair().unwrap();
        let err = table.bind_socket("job1", 0, a).unwrap_err();
        assert_eq!(err, PmixError::Unknown);
    }

    #[test]
    fn bind_socket_reuses_expected_slot() {
        let mut table = PeerTable::new();
        let expected = table.register_expected("job1", 0);
        let (a, _b) = UnixStream::pair().unwrap();
        let bound = table.bind_socket("job1", 0, a).unwrap();
        assert_eq!(expected, bound);
        assert!(table.get(bound).unwrap().is_live());
    }

    #[test]
    fn bind_socket_appends_new_slot_for_second_connection() {
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        let (a, _) = UnixStream::pair().unwrap();
        let first = table.bind_socket("job1", 0, a).unwrap();

        let (b, _) = UnixStream::pair().unwrap();
        let second = table.bind_socket("job1", 0, b).unwrap();

        assert_ne!(first, second);
        assert!(table.get(first).unwrap().is_live());
        assert!(table.get(second).unwrap().is_live());
    }

    #[test]
    fn unregister_marks_closed_without_freeing_identity_lookup() {
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        let (a, _) = UnixStream::pair().unwrap();
        let id = table.bind_socket("job1", 0, a).unwrap();

        table.unregister(id);
        assert_eq!(table.get(id).unwrap().state, PeerState::Closed);
        assert!(table.find("job1", 0, None).is_none());
    }

    #[test]
    fn find_disambiguates_by_socket_when_two_slots_share_an_identity() {
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        let (a, _) = UnixStream::pair().unwrap();
        let a_fd = a.as_raw_fd();
        let first = table.bind_socket("job1", 0, a).unwrap();

        let (b, _) = UnixStream::pair().unwrap();
        let b_fd = b.as_raw_fd();
        let second = table.bind_socket("job1", 0, b).unwrap();

        assert_eq!(table.find("job1", 0, Some(a_fd)), Some(first));
        assert_eq!(table.find("job1", 0, Some(b_fd)), Some(second));
        assert_eq!(table.find("job1", 0, None), Some(first));
    }

    #[test]
    fn unregister_pushes_the_freed_slot_for_reuse() {
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        let (a, _) = UnixStream::pair().unwrap();
        let id = table.bind_socket("job1", 0, a).unwrap();

        table.unregister(id);
        let reused = table.register_expected("job2", 1);
        assert_eq!(reused, id);
    }

    #[test]
    fn queue_reply_sets_in_flight_when_idle() {
        let mut peer = Peer::new("job1", 0);
        let frame = OutFrame::new("job1", 0, 7, std::rc::Rc::new(vec![1, 2, 3]));
        assert!(peer.queue_reply(frame));
        assert!(peer.send_in_flight.is_some());
    }

    #[test]
    fn queue_reply_appends_to_fifo_when_busy() {
        let mut peer = Peer::new("job1", 0);
        let first = OutFrame::new("job1", 0, 1, std::rc::Rc::new(vec![1]));
        let second = OutFrame::new("job1", 0, 2, std::rc::Rc::new(vec![2]));
        assert!(peer.queue_reply(first));
        assert!(!peer.queue_reply(second));
        assert_eq!(peer.send_queue.len(), 1);
    }
}
