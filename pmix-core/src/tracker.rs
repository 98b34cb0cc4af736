//! The collective tracker (C6): coalesces concurrent fence/get/connect/disconnect requests that
//! share an identical participant range list, so the host is invoked exactly once per distinct
//! collective and every local contributor receives the same reply (P2/P3).

use crate::host::Range;
use crate::peer::PeerId;
use hashbrown::HashMap;
use std::rc::Rc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrackerKind {
    Fence,
    Get,
    Connect,
    Disconnect,
}

/// One local contributor to a collective: the peer plus the tag its request arrived on, so the
/// eventual reply can echo that tag back (letting the client library resume the matching
/// in-flight call).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Contributor {
    pub peer: PeerId,
    pub tag: u32,
}

/// An in-progress collective: the exact range list that identifies it, every local contributor
/// that has joined, and the host's reply once it arrives (invariant I6: reference-counted, so
/// fan-out never copies the payload).
pub struct Tracker {
    pub ranges: Vec<Range>,
    pub contributors: Vec<Contributor>,
    pub reply: Option<Rc<Vec<u8>>>,
}

impl Tracker {
    fn new(ranges: Vec<Range>) -> Tracker {
        Tracker {
            ranges,
            contributors: Vec::new(),
            reply: None,
        }
    }

    /// Appends a contributor, enforcing invariant I3 (no duplicate socket+tag per tracker).
    pub fn add_contributor(&mut self, peer: PeerId, tag: u32) {
        let c = Contributor { peer, tag };
        if !self.contributors.contains(&c) {
            self.contributors.push(c);
        }
    }
}

/// One kind-map per collective kind, plus spawn, which is never coalesced (§9: keyed by a fresh
/// id per request rather than by participant, since keying by the spawning peer's identity alone
/// would incorrectly coalesce two concurrent spawns from the same rank). Every kind is keyed by a
/// monotonic id rather than a raw index: removing one in-flight tracker must never renumber
/// another tracker of the same kind that is still pending.
#[derive(Default)]
pub struct TrackerStore {
    fence: HashMap<u64, Tracker>,
    get: HashMap<u64, Tracker>,
    connect: HashMap<u64, Tracker>,
    disconnect: HashMap<u64, Tracker>,
    spawn: HashMap<u64, Tracker>,
    next_id: u64,
}

impl TrackerStore {
    pub fn new() -> TrackerStore {
        TrackerStore::default()
    }

    fn kind_map(&mut self, kind: TrackerKind) -> &mut HashMap<u64, Tracker> {
        match kind {
            TrackerKind::Fence => &mut self.fence,
            TrackerKind::Get => &mut self.get,
            TrackerKind::Connect => &mut self.connect,
            TrackerKind::Disconnect => &mut self.disconnect,
        }
    }

    fn kind_map_ref(&self, kind: TrackerKind) -> &HashMap<u64, Tracker> {
        match kind {
            TrackerKind::Fence => &self.fence,
            TrackerKind::Get => &self.get,
            TrackerKind::Connect => &self.connect,
            TrackerKind::Disconnect => &self.disconnect,
        }
    }

    /// Finds the tracker in `kind`'s map whose range list is structurally equal to `ranges`, or
    /// inserts a fresh one with a defensive copy. Returns the tracker's id plus whether it was
    /// just created, so the caller invokes the host upcall only on first join (P2) and simply
    /// adds a contributor on every subsequent one.
    pub fn get_or_create(&mut self, kind: TrackerKind, ranges: &[Range]) -> (u64, bool) {
        {
            let map = self.kind_map(kind);
            if let Some(id) = map.iter().find(|(_, t)| t.ranges == ranges).map(|(&id, _)| id) {
                return (id, false);
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.kind_map(kind).insert(id, Tracker::new(ranges.to_vec()));
        (id, true)
    }

    pub fn get(&self, kind: TrackerKind, id: u64) -> Option<&Tracker> {
        self.kind_map_ref(kind).get(&id)
    }

    pub fn get_mut(&mut self, kind: TrackerKind, id: u64) -> Option<&mut Tracker> {
        self.kind_map(kind).get_mut(&id)
    }

    /// Removes a tracker from its kind-map **before** any reply is queued (I4), so the next
    /// identical collective starts fresh rather than reusing a stale record. Unlike a `Vec`
    /// index, `id` stays valid for every other in-flight tracker of the same kind after this
    /// call.
    pub fn remove(&mut self, kind: TrackerKind, id: u64) -> Tracker {
        self.kind_map(kind).remove(&id).expect("tracker id must still be present")
    }

    pub fn new_spawn_tracker(&mut self, peer: PeerId, tag: u32) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut tracker = Tracker::new(Vec::new());
        tracker.add_contributor(peer, tag);
        self.spawn.insert(id, tracker);
        id
    }

    pub fn get_spawn_mut(&mut self, id: u64) -> Option<&mut Tracker> {
        self.spawn.get_mut(&id)
    }

    pub fn remove_spawn(&mut self, id: u64) -> Option<Tracker> {
        self.spawn.remove(&id)
    }
}
