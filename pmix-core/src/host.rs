//! The host interface: upcalls the embedding runtime registers with the server. The core
//! invokes these; it never implements them. Every upcall has a default implementation that
//! returns `NotSupported`, so a host only needs to override the handful it actually backs —
//! everything else synthesizes a well-formed `NOT_SUPPORTED` reply rather than hanging the
//! client (§4.5).

use crate::net::handshake::Authenticator;
use pmix_util::error::{PmixError, PmixResult};

/// A collective participant descriptor: a namespace plus an explicit rank list, or `None` for
/// "every rank in that namespace".
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Range {
    pub namespace: String,
    pub ranks: Option<Vec<i32>>,
}

impl Range {
    pub fn new(namespace: impl Into<String>, ranks: Option<Vec<i32>>) -> Range {
        Range {
            namespace: namespace.into(),
            ranks,
        }
    }
}

/// Typed values carried in key/value info records (publish/lookup/job-info).
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub key: String,
    pub value: InfoValue,
}

/// A key/value blob contributed by one process at a fence.
#[derive(Debug, Clone)]
pub struct ModexRecord {
    pub namespace: String,
    pub rank: i32,
    pub blob: Vec<u8>,
}

/// A single application in a spawn request.
#[derive(Debug, Clone)]
pub struct App {
    pub cmd: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub maxprocs: i32,
}

/// Fired once the host's fence/get completes, carrying the aggregated modex data. May fire
/// inline from inside the upcall that registered it, or later (§4.6) — never from another
/// thread, since the server's peer and tracker state is single-owner (§5).
pub type ModexCb = Box<dyn FnOnce(PmixResult<()>, Vec<ModexRecord>)>;
/// Fired once a status-only collective (connect/disconnect) completes.
pub type StatusCb = Box<dyn FnOnce(PmixResult<()>)>;
/// Fired once a spawn completes, carrying the new namespace.
pub type SpawnCb = Box<dyn FnOnce(PmixResult<()>, String)>;

#[allow(unused_variables)]
pub trait ServerModule {
    fn abort(&self, status: i32, msg: &str) -> PmixResult<()> {
        Err(PmixError::NotSupported)
    }

    fn fence_nb(&self, ranges: &[Range], barrier: bool, collect_data: bool, cb: ModexCb) -> PmixResult<()> {
        Err(PmixError::NotSupported)
    }

    fn store_modex(&self, scope: &str, record: ModexRecord) -> PmixResult<()> {
        Err(PmixError::NotSupported)
    }

    fn get_modex_nb(&self, namespace: &str, rank: i32, cb: ModexCb) -> PmixResult<()> {
        Err(PmixError::NotSupported)
    }

    fn publish(&self, scope: &str, info: &[Info]) -> PmixResult<()> {
        Err(PmixError::NotSupported)
    }

    fn lookup(&self, scope: &str, keys: &[String]) -> PmixResult<(String, Vec<Info>)> {
        Err(PmixError::NotSupported)
    }

    fn unpublish(&self, scope: &str, keys: &[String]) -> PmixResult<()> {
        Err(PmixError::NotSupported)
    }

    fn spawn(&self, apps: &[App], cb: SpawnCb) -> PmixResult<()> {
        Err(PmixError::NotSupported)
    }

    fn connect(&self, ranges: &[Range], cb: StatusCb) -> PmixResult<()> {
        Err(PmixError::NotSupported)
    }

    fn disconnect(&self, ranges: &[Range], cb: StatusCb) -> PmixResult<()> {
        Err(PmixError::NotSupported)
    }

    fn get_job_info(&self, namespace: &str, rank: i32) -> PmixResult<Vec<Info>> {
        Err(PmixError::NotSupported)
    }

    fn terminated(&self, namespace: &str, rank: i32) {}

    /// `None` means no authenticator is registered at all: the handshake skips token
    /// validation entirely rather than treating every token as a failure.
    fn authenticator(&self) -> Option<&dyn Authenticator> {
        None
    }
}
