//! The switchyard (C5): decodes command opcodes and their per-command argument lists, invokes
//! host upcalls, and builds replies. Tracked commands (fence/get/connect/disconnect/spawn) may
//! complete synchronously — inline, from inside the upcall — or later; both paths converge on
//! the same completion routine (§4.6), which is why trackers are never fanned out directly from
//! inside a host callback closure.
//!
//! Collective commands are never dispatched one frame at a time: every frame decoded out of a
//! single reactor tick is grouped by structural range-list equality *before* any host upcall
//! happens, so a host that completes inline (the common, documented path) still replies to every
//! local contributor that showed up this tick, not just whichever one was decoded first (P2).

use crate::host::{App, Info, InfoValue, ModexCb, ModexRecord, Range, ServerModule, StatusCb};
use crate::net::wire::{OutFrame, PackBuffer, UnpackBuffer};
use crate::peer::PeerTable;
use crate::peer::PeerId;
use crate::tracker::{Tracker, TrackerKind, TrackerStore};
use pmix_util::error::{PmixError, PmixResult, STATUS_SUCCESS};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Command {
    Abort = 0,
    Fence = 1,
    FenceNb = 2,
    Get = 3,
    GetNb = 4,
    JobInfo = 5,
    Finalize = 6,
    Publish = 7,
    Lookup = 8,
    Unpublish = 9,
    Spawn = 10,
    Connect = 11,
    Disconnect = 12,
}

impl Command {
    pub fn from_u8(v: u8) -> PmixResult<Command> {
        Ok(match v {
            0 => Command::Abort,
            1 => Command::Fence,
            2 => Command::FenceNb,
            3 => Command::Get,
            4 => Command::GetNb,
            5 => Command::JobInfo,
            6 => Command::Finalize,
            7 => Command::Publish,
            8 => Command::Lookup,
            9 => Command::Unpublish,
            10 => Command::Spawn,
            11 => Command::Connect,
            12 => Command::Disconnect,
            _ => return Err(PmixError::BadParam),
        })
    }
}

fn unpack_range(u: &mut UnpackBuffer) -> PmixResult<Range> {
    let namespace = u.unpack_string()?;
    let has_ranks = u.unpack_u8()?;
    let ranks = if has_ranks != 0 {
        let n = u.unpack_u32()? as usize;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(u.unpack_i32()?);
        }
        Some(v)
    } else {
        None
    };
    Ok(Range::new(namespace, ranks))
}

fn unpack_ranges(u: &mut UnpackBuffer) -> PmixResult<Vec<Range>> {
    let n = u.unpack_u32()? as usize;
    let mut ranges = Vec::with_capacity(n);
    for _ in 0..n {
        ranges.push(unpack_range(u)?);
    }
    Ok(ranges)
}

fn unpack_info(u: &mut UnpackBuffer) -> PmixResult<Info> {
    let key = u.unpack_string()?;
    let value = match u.unpack_u8()? {
        0 => InfoValue::Int(u.unpack_i64()?),
        1 => InfoValue::Str(u.unpack_string()?),
        2 => InfoValue::Bytes(u.unpack_bytes()?),
        _ => return Err(PmixError::BadParam),
    };
    Ok(Info { key, value })
}

fn pack_info(p: &mut PackBuffer, info: &Info) {
    p.pack_string(&info.key);
    match &info.value {
        InfoValue::Int(v) => {
            p.pack_u8(0);
            p.pack_i64(*v);
        }
        InfoValue::Str(s) => {
            p.pack_u8(1);
            p.pack_string(s);
        }
        InfoValue::Bytes(b) => {
            p.pack_u8(2);
            p.pack_bytes(b);
        }
    }
}

fn pack_modex_record(p: &mut PackBuffer, r: &ModexRecord) {
    p.pack_string(&r.namespace);
    p.pack_i32(r.rank);
    p.pack_bytes(&r.blob);
}

fn unpack_app(u: &mut UnpackBuffer) -> PmixResult<App> {
    let cmd = u.unpack_string()?;
    let argc = u.unpack_u32()? as usize;
    let mut argv = Vec::with_capacity(argc);
    for _ in 0..argc {
        argv.push(u.unpack_string()?);
    }
    let envc = u.unpack_u32()? as usize;
    let mut env = Vec::with_capacity(envc);
    for _ in 0..envc {
        env.push(u.unpack_string()?);
    }
    let maxprocs = u.unpack_i32()?;
    Ok(App { cmd, argv, env, maxprocs })
}

fn status_of(result: &PmixResult<()>) -> i32 {
    match result {
        Ok(()) => STATUS_SUCCESS,
        Err(e) => e.status_code(),
    }
}

/// Queues a freshly built reply on `peer_id`, tagging it with the request's tag so the client
/// library resumes the matching in-flight call. Returns the peer id if the write event needs
/// arming (the send queue was previously idle).
fn queue_immediate(table: &mut PeerTable, peer_id: PeerId, tag: u32, packed: Vec<u8>, writable: &mut Vec<PeerId>) -> PmixResult<()> {
    let peer = table.get_mut(peer_id).ok_or(PmixError::Unreach)?;
    let frame = OutFrame::new(&peer.namespace, peer.rank, tag, Rc::new(packed));
    if peer.queue_reply(frame) {
        writable.push(peer_id);
    }
    Ok(())
}

/// Fans a shared reply buffer to every live contributor (§4.6, §9: a contributor whose peer has
/// already closed is skipped silently rather than failing the whole fan-out).
fn fan_out(table: &mut PeerTable, tracker: &Tracker, payload: Rc<Vec<u8>>, writable: &mut Vec<PeerId>) {
    for c in &tracker.contributors {
        let Some(peer) = table.get_mut(c.peer) else { continue };
        if !peer.is_live() {
            continue;
        }
        let frame = OutFrame::new(&peer.namespace, peer.rank, c.tag, payload.clone());
        if peer.queue_reply(frame) {
            writable.push(c.peer);
        }
    }
}

type ModexSlot = Rc<RefCell<Option<(PmixResult<()>, Vec<ModexRecord>)>>>;
type StatusSlot = Rc<RefCell<Option<PmixResult<()>>>>;
type SpawnSlot = Rc<RefCell<Option<(PmixResult<()>, String)>>>;

struct PendingModex {
    kind: TrackerKind,
    id: u64,
    slot: ModexSlot,
}

struct PendingStatus {
    kind: TrackerKind,
    id: u64,
    slot: StatusSlot,
}

struct PendingSpawn {
    id: u64,
    slot: SpawnSlot,
}

/// Every same-tick Fence/FenceNb(barrier) request that shares an identical range list, collected
/// before the host is called so an inline completion fans out to all of them at once.
struct FenceGroup {
    ranges: Vec<Range>,
    contributors: Vec<(PeerId, u32)>,
    collect_data: bool,
    barrier: bool,
}

/// Same idea as `FenceGroup`, for collectives whose range list alone identifies the group
/// (get/connect/disconnect).
struct RangeGroup {
    ranges: Vec<Range>,
    contributors: Vec<(PeerId, u32)>,
}

struct GetGroup {
    namespace: String,
    rank: i32,
    contributors: Vec<(PeerId, u32)>,
}

/// What the reactor must do after a dispatch: sockets to re-arm for writing, and which peers
/// (one per Finalize in the batch) must have their read side torn down.
#[derive(Default)]
pub struct DispatchOutcome {
    pub writable: Vec<PeerId>,
    pub close_peers: Vec<PeerId>,
}

/// Holds callbacks the host has not yet fired. Checked once per reactor tick (`drain`) so a
/// genuinely asynchronous completion still reaches its contributors.
#[derive(Default)]
pub struct Switchyard {
    pending_modex: Vec<PendingModex>,
    pending_status: Vec<PendingStatus>,
    pending_spawn: Vec<PendingSpawn>,
}

impl Switchyard {
    pub fn new() -> Switchyard {
        Switchyard::default()
    }

    /// Convenience wrapper around [`Switchyard::dispatch_batch`] for callers with exactly one
    /// decoded frame in hand (unit tests, mostly); a single-frame batch behaves identically to
    /// the old per-frame dispatch for every non-collective command, and for a collective command
    /// it creates-and-calls-the-host exactly as it would have before batching existed.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &mut self,
        command: Command,
        tag: u32,
        payload: &[u8],
        peer_id: PeerId,
        table: &mut PeerTable,
        trackers: &mut TrackerStore,
        host: &dyn ServerModule,
    ) -> PmixResult<DispatchOutcome> {
        self.dispatch_batch(vec![(peer_id, tag, command, payload.to_vec())], table, trackers, host)
    }

    /// Decodes and processes every frame collected from a single reactor tick. Non-collective
    /// commands are handled immediately, in order; collective commands are first grouped by
    /// structural range-list equality across the whole batch, and only then joined to a tracker
    /// and (on first join) handed to the host — so every local contributor that arrived this
    /// tick is already attached before an inline host reply can fan out (P2).
    pub fn dispatch_batch(
        &mut self,
        frames: Vec<(PeerId, u32, Command, Vec<u8>)>,
        table: &mut PeerTable,
        trackers: &mut TrackerStore,
        host: &dyn ServerModule,
    ) -> PmixResult<DispatchOutcome> {
        let mut out = DispatchOutcome::default();
        let mut fence_groups: Vec<FenceGroup> = Vec::new();
        let mut get_groups: Vec<GetGroup> = Vec::new();
        let mut connect_groups: Vec<RangeGroup> = Vec::new();
        let mut disconnect_groups: Vec<RangeGroup> = Vec::new();

        for (peer_id, tag, command, payload) in frames {
            let mut u = UnpackBuffer::new(&payload);

            let (req_ns, req_rank) = {
                let peer = table.get(peer_id).ok_or(PmixError::Unreach)?;
                (peer.namespace.clone(), peer.rank)
            };

            match command {
                Command::Abort => {
                    let status = u.unpack_i32()?;
                    let msg = u.unpack_string()?;
                    let result = host.abort(status, &msg);
                    let mut p = PackBuffer::new();
                    p.pack_status(status_of(&result));
                    queue_immediate(table, peer_id, tag, p.into_inner(), &mut out.writable)?;
                }

                Command::Fence | Command::FenceNb => {
                    let ranges = unpack_ranges(&mut u)?;
                    let collect_data = u.unpack_i32()?;
                    let barrier = u.unpack_i32()?;
                    while u.remaining() > 0 {
                        let scope = u.unpack_string()?;
                        let blob = u.unpack_bytes()?;
                        let _ = host.store_modex(
                            &scope,
                            ModexRecord {
                                namespace: req_ns.clone(),
                                rank: req_rank,
                                blob,
                            },
                        );
                    }

                    let tracked = matches!(command, Command::Fence) || barrier != 0;
                    if !tracked {
                        let mut p = PackBuffer::new();
                        p.pack_status(STATUS_SUCCESS);
                        queue_immediate(table, peer_id, tag, p.into_inner(), &mut out.writable)?;
                    } else {
                        match fence_groups.iter_mut().find(|g| g.ranges == ranges) {
                            Some(group) => {
                                group.contributors.push((peer_id, tag));
                                group.collect_data |= collect_data != 0;
                                group.barrier |= barrier != 0;
                            }
                            None => fence_groups.push(FenceGroup {
                                ranges,
                                contributors: vec![(peer_id, tag)],
                                collect_data: collect_data != 0,
                                barrier: barrier != 0,
                            }),
                        }
                    }
                }

                Command::Get | Command::GetNb => {
                    let namespace = u.unpack_string()?;
                    let rank = u.unpack_i32()?;
                    match get_groups.iter_mut().find(|g| g.namespace == namespace && g.rank == rank) {
                        Some(group) => group.contributors.push((peer_id, tag)),
                        None => get_groups.push(GetGroup {
                            namespace,
                            rank,
                            contributors: vec![(peer_id, tag)],
                        }),
                    }
                }

                Command::JobInfo => {
                    let info = host.get_job_info(&req_ns, req_rank);
                    let mut p = PackBuffer::new();
                    match info {
                        Ok(info) => {
                            p.pack_status(STATUS_SUCCESS);
                            p.pack_u32(info.len() as u32);
                            for i in &info {
                                pack_info(&mut p, i);
                            }
                        }
                        Err(e) => p.pack_status(e.status_code()),
                    }
                    queue_immediate(table, peer_id, tag, p.into_inner(), &mut out.writable)?;
                }

                Command::Finalize => {
                    host.terminated(&req_ns, req_rank);
                    out.close_peers.push(peer_id);
                }

                Command::Publish => {
                    let scope = u.unpack_string()?;
                    let n = u.unpack_u32()? as usize;
                    let mut info = Vec::with_capacity(n);
                    for _ in 0..n {
                        info.push(unpack_info(&mut u)?);
                    }
                    let result = host.publish(&scope, &info);
                    let mut p = PackBuffer::new();
                    p.pack_status(status_of(&result));
                    queue_immediate(table, peer_id, tag, p.into_inner(), &mut out.writable)?;
                }

                Command::Lookup => {
                    let scope = u.unpack_string()?;
                    let n = u.unpack_u32()? as usize;
                    let mut keys = Vec::with_capacity(n);
                    for _ in 0..n {
                        keys.push(u.unpack_string()?);
                    }
                    let mut p = PackBuffer::new();
                    match host.lookup(&scope, &keys) {
                        Ok((ns, info)) => {
                            p.pack_status(STATUS_SUCCESS);
                            p.pack_string(&ns);
                            for i in &info {
                                pack_info(&mut p, i);
                            }
                        }
                        Err(e) => p.pack_status(e.status_code()),
                    }
                    queue_immediate(table, peer_id, tag, p.into_inner(), &mut out.writable)?;
                }

                Command::Unpublish => {
                    let scope = u.unpack_string()?;
                    let n = u.unpack_u32()? as usize;
                    let mut keys = Vec::with_capacity(n);
                    for _ in 0..n {
                        keys.push(u.unpack_string()?);
                    }
                    let result = host.unpublish(&scope, &keys);
                    let mut p = PackBuffer::new();
                    p.pack_status(status_of(&result));
                    queue_immediate(table, peer_id, tag, p.into_inner(), &mut out.writable)?;
                }

                Command::Spawn => {
                    let n = u.unpack_u32()? as usize;
                    let mut apps = Vec::with_capacity(n);
                    for _ in 0..n {
                        apps.push(unpack_app(&mut u)?);
                    }
                    let id = trackers.new_spawn_tracker(peer_id, tag);

                    let slot: SpawnSlot = Rc::new(RefCell::new(None));
                    let cb_slot = slot.clone();
                    let cb = Box::new(move |status, namespace| {
                        *cb_slot.borrow_mut() = Some((status, namespace));
                    });

                    match host.spawn(&apps, cb) {
                        Ok(()) => {
                            let taken = slot.borrow_mut().take();
                            if let Some((status, namespace)) = taken {
                                self.complete_spawn(id, status, namespace, table, trackers, &mut out.writable);
                            } else {
                                self.pending_spawn.push(PendingSpawn { id, slot });
                            }
                        }
                        Err(err) => {
                            if let Some(tracker) = trackers.remove_spawn(id) {
                                let mut p = PackBuffer::new();
                                p.pack_status(err.status_code());
                                let payload = Rc::new(p.into_inner());
                                fan_out(table, &tracker, payload, &mut out.writable);
                            }
                        }
                    }
                }

                Command::Connect => {
                    let ranges = unpack_ranges(&mut u)?;
                    match connect_groups.iter_mut().find(|g| g.ranges == ranges) {
                        Some(group) => group.contributors.push((peer_id, tag)),
                        None => connect_groups.push(RangeGroup { ranges, contributors: vec![(peer_id, tag)] }),
                    }
                }

                Command::Disconnect => {
                    let ranges = unpack_ranges(&mut u)?;
                    match disconnect_groups.iter_mut().find(|g| g.ranges == ranges) {
                        Some(group) => group.contributors.push((peer_id, tag)),
                        None => disconnect_groups.push(RangeGroup { ranges, contributors: vec![(peer_id, tag)] }),
                    }
                }
            }
        }

        for group in fence_groups {
            let FenceGroup { ranges, contributors, collect_data, barrier } = group;
            let host_ranges = ranges.clone();
            self.join_modex_group(TrackerKind::Fence, ranges, contributors, table, trackers, &mut out.writable, |cb| {
                host.fence_nb(&host_ranges, barrier, collect_data, cb)
            })?;
        }

        for group in get_groups {
            let GetGroup { namespace, rank, contributors } = group;
            let ranges = vec![Range::new(namespace.clone(), Some(vec![rank]))];
            self.join_modex_group(TrackerKind::Get, ranges, contributors, table, trackers, &mut out.writable, |cb| {
                host.get_modex_nb(&namespace, rank, cb)
            })?;
        }

        for group in connect_groups {
            let RangeGroup { ranges, contributors } = group;
            let host_ranges = ranges.clone();
            self.join_status_group(TrackerKind::Connect, ranges, contributors, table, trackers, &mut out.writable, |cb| {
                host.connect(&host_ranges, cb)
            })?;
        }

        for group in disconnect_groups {
            let RangeGroup { ranges, contributors } = group;
            let host_ranges = ranges.clone();
            self.join_status_group(TrackerKind::Disconnect, ranges, contributors, table, trackers, &mut out.writable, |cb| {
                host.disconnect(&host_ranges, cb)
            })?;
        }

        Ok(out)
    }

    /// Joins every contributor in `contributors` to a modex-returning collective (fence/get) in
    /// one shot: the host upcall is invoked only if this group did not already match a tracker
    /// still in flight from an earlier tick (P2).
    #[allow(clippy::too_many_arguments)]
    fn join_modex_group(
        &mut self,
        kind: TrackerKind,
        ranges: Vec<Range>,
        contributors: Vec<(PeerId, u32)>,
        table: &mut PeerTable,
        trackers: &mut TrackerStore,
        writable: &mut Vec<PeerId>,
        call_host: impl FnOnce(ModexCb) -> PmixResult<()>,
    ) -> PmixResult<()> {
        let (id, created) = trackers.get_or_create(kind, &ranges);
        {
            let tracker = trackers.get_mut(kind, id).unwrap();
            for (peer_id, tag) in &contributors {
                tracker.add_contributor(*peer_id, *tag);
            }
        }

        if !created {
            return Ok(());
        }

        let slot: ModexSlot = Rc::new(RefCell::new(None));
        let cb_slot = slot.clone();
        let cb: ModexCb = Box::new(move |status, data| {
            *cb_slot.borrow_mut() = Some((status, data));
        });

        match call_host(cb) {
            Ok(()) => {
                let taken = slot.borrow_mut().take();
                if let Some((status, data)) = taken {
                    self.complete_modex(kind, id, status, data, table, trackers, writable);
                } else {
                    self.pending_modex.push(PendingModex { kind, id, slot });
                }
            }
            Err(err) => {
                let tracker = trackers.remove(kind, id);
                let mut p = PackBuffer::new();
                p.pack_status(err.status_code());
                p.pack_u32(0);
                let payload = Rc::new(p.into_inner());
                fan_out(table, &tracker, payload, writable);
            }
        }
        Ok(())
    }

    /// Joins every contributor in `contributors` to a status-only collective (connect/disconnect)
    /// in one shot; same shape as [`Switchyard::join_modex_group`].
    #[allow(clippy::too_many_arguments)]
    fn join_status_group(
        &mut self,
        kind: TrackerKind,
        ranges: Vec<Range>,
        contributors: Vec<(PeerId, u32)>,
        table: &mut PeerTable,
        trackers: &mut TrackerStore,
        writable: &mut Vec<PeerId>,
        call_host: impl FnOnce(StatusCb) -> PmixResult<()>,
    ) -> PmixResult<()> {
        let (id, created) = trackers.get_or_create(kind, &ranges);
        {
            let tracker = trackers.get_mut(kind, id).unwrap();
            for (peer_id, tag) in &contributors {
                tracker.add_contributor(*peer_id, *tag);
            }
        }

        if !created {
            return Ok(());
        }

        let slot: StatusSlot = Rc::new(RefCell::new(None));
        let cb_slot = slot.clone();
        let cb: StatusCb = Box::new(move |status| {
            *cb_slot.borrow_mut() = Some(status);
        });

        match call_host(cb) {
            Ok(()) => {
                let taken = slot.borrow_mut().take();
                if let Some(status) = taken {
                    self.complete_status(kind, id, status, table, trackers, writable);
                } else {
                    self.pending_status.push(PendingStatus { kind, id, slot });
                }
            }
            Err(err) => {
                let tracker = trackers.remove(kind, id);
                let mut p = PackBuffer::new();
                p.pack_status(err.status_code());
                let payload = Rc::new(p.into_inner());
                fan_out(table, &tracker, payload, writable);
            }
        }
        Ok(())
    }

    fn complete_modex(
        &mut self,
        kind: TrackerKind,
        id: u64,
        status: PmixResult<()>,
        data: Vec<ModexRecord>,
        table: &mut PeerTable,
        trackers: &mut TrackerStore,
        writable: &mut Vec<PeerId>,
    ) {
        let tracker = trackers.remove(kind, id);
        let mut p = PackBuffer::new();
        p.pack_status(status_of(&status));
        p.pack_u32(data.len() as u32);
        for record in &data {
            pack_modex_record(&mut p, record);
        }
        let payload = Rc::new(p.into_inner());
        fan_out(table, &tracker, payload, writable);
    }

    fn complete_status(
        &mut self,
        kind: TrackerKind,
        id: u64,
        status: PmixResult<()>,
        table: &mut PeerTable,
        trackers: &mut TrackerStore,
        writable: &mut Vec<PeerId>,
    ) {
        let tracker = trackers.remove(kind, id);
        let mut p = PackBuffer::new();
        p.pack_status(status_of(&status));
        let payload = Rc::new(p.into_inner());
        fan_out(table, &tracker, payload, writable);
    }

    fn complete_spawn(
        &mut self,
        id: u64,
        status: PmixResult<()>,
        namespace: String,
        table: &mut PeerTable,
        trackers: &mut TrackerStore,
        writable: &mut Vec<PeerId>,
    ) {
        if let Some(tracker) = trackers.remove_spawn(id) {
            let mut p = PackBuffer::new();
            p.pack_status(status_of(&status));
            p.pack_string(&namespace);
            let payload = Rc::new(p.into_inner());
            fan_out(table, &tracker, payload, writable);
        }
    }

    /// Drains every callback the host has fired since the last tick but that did not fire
    /// inline — the genuinely asynchronous half of §4.6's "may fire inline or later".
    pub fn drain(&mut self, table: &mut PeerTable, trackers: &mut TrackerStore) -> Vec<PeerId> {
        let mut writable = Vec::new();

        let mut still_pending = Vec::new();
        for pending in std::mem::take(&mut self.pending_modex) {
            let taken = pending.slot.borrow_mut().take();
            if let Some((status, data)) = taken {
                self.complete_modex(pending.kind, pending.id, status, data, table, trackers, &mut writable);
            } else {
                still_pending.push(pending);
            }
        }
        self.pending_modex = still_pending;

        let mut still_pending = Vec::new();
        for pending in std::mem::take(&mut self.pending_status) {
            let taken = pending.slot.borrow_mut().take();
            if let Some(status) = taken {
                self.complete_status(pending.kind, pending.id, status, table, trackers, &mut writable);
            } else {
                still_pending.push(pending);
            }
        }
        self.pending_status = still_pending;

        let mut still_pending = Vec::new();
        for pending in std::mem::take(&mut self.pending_spawn) {
            let taken = pending.slot.borrow_mut().take();
            if let Some((status, namespace)) = taken {
                self.complete_spawn(pending.id, status, namespace, table, trackers, &mut writable);
            } else {
                still_pending.push(pending);
            }
        }
        self.pending_spawn = still_pending;

        writable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{App, SpawnCb, StatusCb};
    use std::cell::Cell;
    use std::convert::TryInto;

    struct FakeHost {
        abort_calls: RefCell<Vec<(i32, String)>>,
        fence_calls: Cell<u32>,
        store_modex_calls: Cell<u32>,
        connect_supported: bool,
        fence_inline: bool,
    }

    impl FakeHost {
        fn new() -> FakeHost {
            FakeHost {
                abort_calls: RefCell::new(Vec::new()),
                fence_calls: Cell::new(0),
                store_modex_calls: Cell::new(0),
                connect_supported: true,
                fence_inline: true,
            }
        }
    }

    impl ServerModule for FakeHost {
        fn abort(&self, status: i32, msg: &str) -> PmixResult<()> {
            self.abort_calls.borrow_mut().push((status, msg.to_owned()));
            Ok(())
        }

        fn store_modex(&self, _scope: &str, _record: ModexRecord) -> PmixResult<()> {
            self.store_modex_calls.set(self.store_modex_calls.get() + 1);
            Ok(())
        }

        fn fence_nb(&self, _ranges: &[Range], _barrier: bool, _collect: bool, cb: ModexCb) -> PmixResult<()> {
            self.fence_calls.set(self.fence_calls.get() + 1);
            if self.fence_inline {
                cb(Ok(()), Vec::new());
            }
            Ok(())
        }

        fn connect(&self, _ranges: &[Range], cb: StatusCb) -> PmixResult<()> {
            if !self.connect_supported {
                return Err(PmixError::NotSupported);
            }
            cb(Ok(()));
            Ok(())
        }

        fn spawn(&self, _apps: &[App], cb: SpawnCb) -> PmixResult<()> {
            cb(Ok(()), "job2".to_owned());
            Ok(())
        }
    }

    fn connect_two_peers(table: &mut PeerTable) -> (PeerId, PeerId) {
        table.register_expected("job1", 0);
        table.register_expected("job1", 1);
        let (a, _) = mio_uds::UnixStream::pair().unwrap();
        let (b, _) = mio_uds::UnixStream::pair().unwrap();
        let p0 = table.bind_socket("job1", 0, a).unwrap();
        let p1 = table.bind_socket("job1", 1, b).unwrap();
        (p0, p1)
    }

    fn fence_payload(ns: &str, wildcard: bool, blob: &[u8]) -> Vec<u8> {
        let mut p = PackBuffer::new();
        p.pack_u32(1);
        p.pack_string(ns);
        p.pack_u8(if wildcard { 0 } else { 1 });
        p.pack_i32(0);
        p.pack_i32(1);
        p.pack_string("modex");
        p.pack_bytes(blob);
        p.into_inner()
    }

    #[test]
    fn two_peer_fence_in_one_tick_coalesces_to_one_host_call() {
        let mut table = PeerTable::new();
        let (p0, p1) = connect_two_peers(&mut table);
        let mut trackers = TrackerStore::new();
        let mut yard = Switchyard::new();
        let host = FakeHost::new();

        let payload = fence_payload("job1", true, &[0u8; 8]);
        let frames = vec![
            (p0, 1, Command::Fence, payload.clone()),
            (p1, 1, Command::Fence, payload),
        ];
        yard.dispatch_batch(frames, &mut table, &mut trackers, &host).unwrap();

        assert_eq!(host.fence_calls.get(), 1);
        assert_eq!(host.store_modex_calls.get(), 2);
        assert!(table.get(p0).unwrap().send_in_flight.is_some());
        assert!(table.get(p1).unwrap().send_in_flight.is_some());
    }

    #[test]
    fn two_peer_fence_across_separate_ticks_still_coalesces() {
        // A second contributor joining a tracker still pending from an earlier tick (not
        // created this tick) must not trigger a second host call either.
        let mut table = PeerTable::new();
        let (p0, p1) = connect_two_peers(&mut table);
        let mut trackers = TrackerStore::new();
        let mut yard = Switchyard::new();
        let mut host = FakeHost::new();
        host.fence_inline = false;

        let payload = fence_payload("job1", true, &[0u8; 8]);
        yard.dispatch(Command::Fence, 1, &payload, p0, &mut table, &mut trackers, &host).unwrap();
        yard.dispatch(Command::Fence, 1, &payload, p1, &mut table, &mut trackers, &host).unwrap();

        assert_eq!(host.fence_calls.get(), 1);
    }

    #[test]
    fn fence_nb_with_no_barrier_replies_immediately_without_tracking() {
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        let (a, _) = mio_uds::UnixStream::pair().unwrap();
        let p0 = table.bind_socket("job1", 0, a).unwrap();
        let mut trackers = TrackerStore::new();
        let mut yard = Switchyard::new();
        let host = FakeHost::new();

        let mut p = PackBuffer::new();
        p.pack_u32(1);
        p.pack_string("job1");
        p.pack_u8(1);
        p.pack_u32(2);
        p.pack_i32(0);
        p.pack_i32(1);
        p.pack_i32(0);
        p.pack_i32(0);
        p.pack_string("modex");
        p.pack_bytes(&[0u8; 16]);
        let payload = p.into_inner();

        yard.dispatch(Command::FenceNb, 9, &payload, p0, &mut table, &mut trackers, &host).unwrap();

        assert_eq!(host.fence_calls.get(), 0);
        assert_eq!(host.store_modex_calls.get(), 1);
        assert!(table.get(p0).unwrap().send_in_flight.is_some());
    }

    #[test]
    fn missing_upcall_replies_not_supported_without_leaking_a_tracker() {
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        let (a, _) = mio_uds::UnixStream::pair().unwrap();
        let p0 = table.bind_socket("job1", 0, a).unwrap();
        let mut trackers = TrackerStore::new();
        let mut yard = Switchyard::new();

        let mut host = FakeHost::new();
        host.connect_supported = false;

        let mut p = PackBuffer::new();
        p.pack_u32(1);
        p.pack_string("job1");
        p.pack_u8(1);
        p.pack_u32(2);
        p.pack_i32(0);
        p.pack_i32(1);
        let payload = p.into_inner();

        yard.dispatch(Command::Connect, 4, &payload, p0, &mut table, &mut trackers, &host).unwrap();

        let frame = table.get(p0).unwrap().send_in_flight.as_ref().unwrap();
        let status = i32::from_ne_bytes(frame.payload[0..4].try_into().unwrap());
        assert_eq!(status, PmixError::NotSupported.status_code());

        assert!(trackers.get(TrackerKind::Connect, 0).is_none());
    }

    #[test]
    fn spawn_reply_carries_the_new_namespace() {
        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        let (a, _) = mio_uds::UnixStream::pair().unwrap();
        let p0 = table.bind_socket("job1", 0, a).unwrap();
        let mut trackers = TrackerStore::new();
        let mut yard = Switchyard::new();
        let host = FakeHost::new();

        let mut p = PackBuffer::new();
        p.pack_u32(0);
        let payload = p.into_inner();

        yard.dispatch(Command::Spawn, 2, &payload, p0, &mut table, &mut trackers, &host).unwrap();

        let frame = table.get(p0).unwrap().send_in_flight.as_ref().unwrap();
        let mut u = UnpackBuffer::new(&frame.payload);
        assert_eq!(u.unpack_i32().unwrap(), STATUS_SUCCESS);
        assert_eq!(u.unpack_string().unwrap(), "job2");
    }

    #[test]
    fn lookup_round_trips_typed_info_values() {
        struct LookupHost;
        impl ServerModule for LookupHost {
            fn lookup(&self, _scope: &str, _keys: &[String]) -> PmixResult<(String, Vec<Info>)> {
                Ok((
                    "dir".to_owned(),
                    vec![
                        Info {
                            key: "a".to_owned(),
                            value: InfoValue::Int(7),
                        },
                        Info {
                            key: "b".to_owned(),
                            value: InfoValue::Str("v".to_owned()),
                        },
                    ],
                ))
            }
        }

        let mut table = PeerTable::new();
        table.register_expected("job1", 0);
        let (a, _) = mio_uds::UnixStream::pair().unwrap();
        let p0 = table.bind_socket("job1", 0, a).unwrap();
        let mut trackers = TrackerStore::new();
        let mut yard = Switchyard::new();

        let mut p = PackBuffer::new();
        p.pack_string("scope");
        p.pack_u32(2);
        p.pack_string("a");
        p.pack_string("b");
        let payload = p.into_inner();

        yard.dispatch(Command::Lookup, 3, &payload, p0, &mut table, &mut trackers, &LookupHost).unwrap();

        let frame = table.get(p0).unwrap().send_in_flight.as_ref().unwrap();
        let mut u = UnpackBuffer::new(&frame.payload);
        assert_eq!(u.unpack_i32().unwrap(), STATUS_SUCCESS);
        assert_eq!(u.unpack_string().unwrap(), "dir");
        let first = unpack_info(&mut u).unwrap();
        assert_eq!(first.value, InfoValue::Int(7));
        let second = unpack_info(&mut u).unwrap();
        assert_eq!(second.value, InfoValue::Str("v".to_owned()));
    }

    #[test]
    fn finalize_calls_terminated_and_asks_the_caller_to_close_the_peer() {
        struct TermHost {
            seen: RefCell<Option<(String, i32)>>,
        }
        impl ServerModule for TermHost {
            fn terminated(&self, namespace: &str, rank: i32) {
                *self.seen.borrow_mut() = Some((namespace.to_owned(), rank));
            }
        }

        let mut table = PeerTable::new();
        table.register_expected("job1", 3);
        let (a, _) = mio_uds::UnixStream::pair().unwrap();
        let p0 = table.bind_socket("job1", 3, a).unwrap();
        let mut trackers = TrackerStore::new();
        let mut yard = Switchyard::new();
        let host = TermHost { seen: RefCell::new(None) };

        let outcome = yard.dispatch(Command::Finalize, 0, &[], p0, &mut table, &mut trackers, &host).unwrap();

        assert_eq!(outcome.close_peers, vec![p0]);
        assert_eq!(host.seen.borrow().as_ref().unwrap(), &("job1".to_owned(), 3));
    }

    #[test]
    fn finalize_batch_closes_every_peer_that_finalized_this_tick() {
        struct TermHost;
        impl ServerModule for TermHost {
            fn terminated(&self, _namespace: &str, _rank: i32) {}
        }

        let mut table = PeerTable::new();
        let (p0, p1) = connect_two_peers(&mut table);
        let mut trackers = TrackerStore::new();
        let mut yard = Switchyard::new();
        let host = TermHost;

        let frames = vec![
            (p0, 0, Command::Finalize, Vec::new()),
            (p1, 0, Command::Finalize, Vec::new()),
        ];
        let outcome = yard.dispatch_batch(frames, &mut table, &mut trackers, &host).unwrap();

        assert_eq!(outcome.close_peers.len(), 2);
        assert!(outcome.close_peers.contains(&p0));
        assert!(outcome.close_peers.contains(&p1));
    }
}
