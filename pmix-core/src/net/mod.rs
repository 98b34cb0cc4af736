//! Framing, handshake and reactor: the I/O layer local clients talk to.

pub mod buffer;
pub mod handshake;
pub mod reactor;
pub mod wire;
