#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Core of a per-node PMIx server: peer table, wire framing, handshake, the non-blocking
//! reactor, the command switchyard and the collective tracker that coalesces concurrent
//! fence/connect/disconnect/spawn/get requests before handing them to the host exactly once.

pub mod host;
pub mod net;
pub mod peer;
pub mod server;
pub mod switchyard;
pub mod tracker;

pub use pmix_util::error::{PmixError, PmixResult};
