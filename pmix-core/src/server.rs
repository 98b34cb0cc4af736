//! Lifecycle (C8) and the event loop: the one `Server` that owns every peer, tracker, and
//! socket, tying the reactor's readiness events to the handshake and switchyard layers. No peer
//! or tracker field is ever touched outside a call into this struct (§5).

use crate::host::ServerModule;
use crate::net::buffer::Buffer;
use crate::net::handshake::run_handshake;
use crate::net::reactor::Reactor;
use crate::net::wire::{FrameType, Header, UnpackBuffer};
use crate::peer::{Peer, PeerId, PeerTable};
use crate::switchyard::{Command, Switchyard};
use crate::tracker::TrackerStore;
use pmix_util::error::{PmixError, PmixResult};
use slog::Logger;
use std::io;
use std::path::{Path, PathBuf};

/// Daemon-level settings, layered by `pmix-server`'s CLI over environment over defaults; the
/// `tmpdir`/`TMPDIR` fallback chain itself is re-run inside `init` regardless of this value,
/// since that chain is a protocol requirement rather than a user preference (§10.2).
pub struct ServerConfig {
    pub tmpdir: Option<PathBuf>,
    pub credential: Option<Vec<u8>>,
    pub version: String,
    pub max_cred_size: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            tmpdir: None,
            credential: None,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            max_cred_size: crate::net::wire::MAX_CRED_SIZE,
        }
    }
}

/// The rendezvous address advertised to children via `setup_fork` (§4.8, §6).
#[derive(Clone)]
pub struct RendezvousInfo {
    pub uri: String,
    pub path: PathBuf,
}

pub struct Server {
    host: Box<dyn ServerModule>,
    config: ServerConfig,
    peers: PeerTable,
    trackers: TrackerStore,
    switchyard: Switchyard,
    reactor: Option<Reactor>,
    rendezvous: Option<RendezvousInfo>,
    init_count: u32,
    logger: Logger,
}

impl Server {
    pub fn new(host: Box<dyn ServerModule>, config: ServerConfig, logger: Logger) -> Server {
        Server {
            host,
            config,
            peers: PeerTable::new(),
            trackers: TrackerStore::new(),
            switchyard: Switchyard::new(),
            reactor: None,
            rendezvous: None,
            init_count: 0,
            logger,
        }
    }

    /// Idempotent via a plain reference count (§10.5): only the first call binds the rendezvous
    /// socket and arms the accept event; later calls just bump the count and return the same
    /// address.
    pub fn init(&mut self) -> PmixResult<RendezvousInfo> {
        self.init_count += 1;
        if self.init_count > 1 {
            return self.rendezvous.clone().ok_or(PmixError::Unknown);
        }

        let tmpdir = resolve_tmpdir(self.config.tmpdir.as_deref());
        let pid = std::process::id();
        let path = tmpdir.join(format!("pmix-{}", pid));
        let _ = std::fs::remove_file(&path);

        let reactor = Reactor::bind(&path)?;
        let uri = format!("{}:{}", pid, path.display());
        slog::info!(self.logger, "server listening"; "uri" => uri.as_str());

        self.reactor = Some(reactor);
        let info = RendezvousInfo { uri, path };
        self.rendezvous = Some(info.clone());
        Ok(info)
    }

    /// Matches `init`; on the last unref, tears down the accept event, closes the listen
    /// socket, unlinks the rendezvous path, and releases every peer and tracker (§4.8).
    pub fn finalize(&mut self) {
        if self.init_count == 0 {
            return;
        }
        self.init_count -= 1;
        if self.init_count > 0 {
            return;
        }

        self.reactor = None;
        if let Some(info) = self.rendezvous.take() {
            let _ = std::fs::remove_file(&info.path);
            slog::info!(self.logger, "server finalized"; "path" => info.path.display().to_string());
        }
        self.trackers = TrackerStore::new();
        self.peers = PeerTable::new();
    }

    /// Pre-registers a child identity and builds the environment `setup_fork` hands it (§6):
    /// `PMIX_NAMESPACE`, `PMIX_RANK`, `PMIX_SERVER_URI`, and `PMIX_SERVER_CREDENTIAL` if a
    /// credential was configured.
    pub fn setup_fork(&mut self, namespace: &str, rank: i32) -> PmixResult<Vec<(String, String)>> {
        let info = self.rendezvous.as_ref().ok_or(PmixError::Unknown)?;
        self.peers.register_expected(namespace, rank);

        let mut env = vec![
            ("PMIX_NAMESPACE".to_owned(), namespace.to_owned()),
            ("PMIX_RANK".to_owned(), rank.to_string()),
            ("PMIX_SERVER_URI".to_owned(), info.uri.clone()),
        ];
        if let Some(cred) = &self.config.credential {
            env.push(("PMIX_SERVER_CREDENTIAL".to_owned(), encode_hex(cred)));
        }
        Ok(env)
    }

    /// One pass through the reactor: blocks up to `timeout_ms` for readiness, runs the
    /// handshake on every pending accept, ingests and decodes every readable peer's complete
    /// frames into one batch, flushes send queues on writable peers, dispatches the whole
    /// batch to the switchyard in a single call, and finally drains any host callback that
    /// fired asynchronously since the previous pass.
    ///
    /// The batch is collected in full before the switchyard ever sees it: two peers that both
    /// join the same collective in this tick must both be attached to its tracker before the
    /// host is called, or a host that replies inline would only ever reach whichever peer was
    /// decoded first (P2).
    pub fn run_once(&mut self, timeout_ms: Option<u64>) -> PmixResult<()> {
        let events = {
            let reactor = self.reactor.as_mut().ok_or(PmixError::Unknown)?;
            reactor.poll(timeout_ms)?
        };

        let mut batch = Vec::new();
        let mut hard_closed = Vec::new();

        for event in events {
            if event.is_listener {
                self.accept_ready();
            } else if let Some(peer_id) = event.peer {
                if event.readable {
                    self.collect_readable(peer_id, &mut batch, &mut hard_closed);
                }
                if event.writable {
                    self.handle_writable(peer_id);
                }
            }
        }

        if !batch.is_empty() {
            let result = self.switchyard.dispatch_batch(batch, &mut self.peers, &mut self.trackers, self.host.as_ref());
            match result {
                Ok(outcome) => {
                    self.arm_writable(&outcome.writable);
                    for peer_id in outcome.close_peers {
                        self.close_peer(peer_id);
                    }
                }
                Err(err) => {
                    slog::warn!(self.logger, "batch dispatch failed"; "error" => err.to_string());
                }
            }
        }

        for peer_id in hard_closed {
            self.close_peer(peer_id);
        }

        let writable = self.switchyard.drain(&mut self.peers, &mut self.trackers);
        self.arm_writable(&writable);
        Ok(())
    }

    fn accept_ready(&mut self) {
        let streams = match &self.reactor {
            Some(reactor) => reactor.accept_all(),
            None => return,
        };

        for stream in streams {
            match run_handshake(
                stream,
                &self.config.version,
                self.config.max_cred_size,
                self.host.authenticator(),
                &mut self.peers,
            ) {
                Ok(peer_id) => {
                    slog::debug!(self.logger, "peer connected"; "peer_id" => peer_id);
                    if let (Some(peer), Some(reactor)) = (self.peers.get(peer_id), &self.reactor) {
                        if let Some(stream) = peer.stream() {
                            if let Err(err) = reactor.register_peer(peer_id, stream) {
                                slog::warn!(self.logger, "failed to register peer with reactor"; "error" => err.to_string());
                            }
                        }
                    }
                }
                Err(err) => {
                    slog::warn!(self.logger, "handshake failed"; "error" => err.to_string());
                }
            }
        }
    }

    /// Ingests and decodes every complete frame currently buffered for `peer_id`, appending each
    /// one to this tick's shared `batch` instead of dispatching it immediately — dispatch only
    /// happens once, after every readable peer in this tick has been drained, so same-tick
    /// collective requests can be coalesced before any host upcall (P2). A peer that errors
    /// (EOF, a decode failure, an unknown opcode) is appended to `hard_closed` instead of being
    /// closed here, since closing it mid-collection could invalidate a `peer_id` another frame
    /// in the same batch still refers to.
    fn collect_readable(&mut self, peer_id: PeerId, batch: &mut Vec<(PeerId, u32, Command, Vec<u8>)>, hard_closed: &mut Vec<PeerId>) {
        let mut frames = Vec::new();
        let mut closed = false;

        if let Some(peer) = self.peers.get_mut(peer_id) {
            let (buf, stream) = peer.read_parts();
            match stream {
                Some(stream) => match buf.ingress(stream) {
                    Ok(()) => closed = true,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(_) => closed = true,
                },
                None => closed = true,
            }

            loop {
                match try_take_frame(buf) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        for (header, payload) in frames {
            if header.msg_type != FrameType::User {
                continue;
            }

            let mut u = UnpackBuffer::new(&payload);
            let opcode = match u.unpack_u8() {
                Ok(v) => v,
                Err(_) => {
                    slog::warn!(self.logger, "dropping frame with no command opcode"; "peer_id" => peer_id);
                    closed = true;
                    break;
                }
            };
            let command = match Command::from_u8(opcode) {
                Ok(c) => c,
                Err(_) => {
                    slog::warn!(self.logger, "dropping frame with unknown opcode"; "peer_id" => peer_id, "opcode" => opcode as u32);
                    closed = true;
                    break;
                }
            };
            let consumed = payload.len() - u.remaining();
            batch.push((peer_id, header.tag, command, payload[consumed..].to_vec()));
        }

        if closed {
            hard_closed.push(peer_id);
        }
    }

    fn handle_writable(&mut self, peer_id: PeerId) {
        let (closed, drained) = match self.peers.get_mut(peer_id) {
            Some(peer) => match flush_peer(peer) {
                Ok(drained) => (false, drained),
                Err(_) => (true, false),
            },
            None => return,
        };

        if closed {
            self.close_peer(peer_id);
            return;
        }

        if drained {
            if let (Some(peer), Some(reactor)) = (self.peers.get(peer_id), &self.reactor) {
                if let Some(stream) = peer.stream() {
                    let _ = reactor.reregister_peer(peer_id, stream, false);
                }
            }
        }
    }

    fn arm_writable(&mut self, peers: &[PeerId]) {
        for &peer_id in peers {
            if let (Some(peer), Some(reactor)) = (self.peers.get(peer_id), &self.reactor) {
                if let Some(stream) = peer.stream() {
                    let _ = reactor.reregister_peer(peer_id, stream, true);
                }
            }
        }
    }

    fn close_peer(&mut self, peer_id: PeerId) {
        if let (Some(peer), Some(reactor)) = (self.peers.get(peer_id), &self.reactor) {
            if let Some(stream) = peer.stream() {
                let _ = reactor.deregister_peer(stream);
            }
        }
        self.peers.unregister(peer_id);
        slog::debug!(self.logger, "peer closed"; "peer_id" => peer_id);
    }
}

/// Copies a complete frame out of `buf` if one is fully buffered, consuming it. Leaves the
/// buffer untouched on a short read so the reactor tries again on the next readable event.
fn try_take_frame(buf: &mut Buffer) -> PmixResult<Option<(Header, Vec<u8>)>> {
    let data = buf.read_slice();
    if data.len() < Header::SIZE {
        return Ok(None);
    }

    let mut cursor = io::Cursor::new(data);
    let header = Header::read(&mut cursor)?;
    let total = Header::SIZE + header.nbytes as usize;
    if data.len() < total {
        return Ok(None);
    }

    let payload = data[Header::SIZE..total].to_vec();
    buf.move_head(total);
    Ok(Some((header, payload)))
}

/// Serializes `peer`'s in-flight frame into its write buffer, once, so repeated `WouldBlock`s on
/// the same frame don't re-serialize it.
fn stage_frame(peer: &mut Peer) {
    if !peer.write_buffer.is_empty() {
        return;
    }
    if let Some(frame) = peer.send_in_flight.clone() {
        let mut bytes = Vec::with_capacity(Header::SIZE + frame.payload.len());
        frame.header.write(&mut bytes).expect("vec write cannot fail");
        bytes.extend_from_slice(&frame.payload);

        let slice = peer.write_buffer.write_slice();
        slice[..bytes.len()].copy_from_slice(&bytes);
        peer.write_buffer.move_tail(bytes.len());
    }
}

/// Drains as much of `peer`'s send queue as the socket accepts without blocking. Returns `true`
/// once every queued frame (including the one in flight) has been written.
fn flush_peer(peer: &mut Peer) -> PmixResult<bool> {
    loop {
        if peer.send_in_flight.is_none() {
            return Ok(true);
        }
        stage_frame(peer);

        let (buf, stream) = peer.write_parts();
        let stream = stream.ok_or(PmixError::Unreach)?;
        match buf.egress(stream) {
            Ok(()) => {
                peer.advance_send_queue();
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) => return Err(err.into()),
        }
    }
}

fn resolve_tmpdir(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    for var in ["TMPDIR", "TEMP", "TMP"] {
        if let Ok(v) = std::env::var(var) {
            if !v.is_empty() {
                return PathBuf::from(v);
            }
        }
    }
    PathBuf::from("/tmp")
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
