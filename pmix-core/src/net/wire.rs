//! The fixed-layout frame header and the primitive pack/unpack helpers the switchyard builds
//! commands and replies out of. Byte order is native: this protocol never crosses a socket that
//! leaves the host, so there is nothing to gain from a fixed wire endianness.

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use pmix_util::error::{PmixError, PmixResult};
use std::io::{self, Read, Write};

/// Maximum namespace length, matching the reference server's `PMIX_MAX_NSLEN`.
pub const NSLEN: usize = 256;

/// Hard cap on a handshake credential payload (invariant I2).
pub const MAX_CRED_SIZE: usize = 4096;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake / identity traffic.
    IdentPmix = 0,
    /// Steady-state command and reply traffic.
    User = 1,
}

impl FrameType {
    pub fn from_u8(v: u8) -> PmixResult<FrameType> {
        match v {
            0 => Ok(FrameType::IdentPmix),
            1 => Ok(FrameType::User),
            _ => Err(PmixError::BadParam),
        }
    }
}

/// The fixed header every frame opens with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Header {
    pub namespace: [u8; NSLEN],
    pub rank: i32,
    pub msg_type: FrameType,
    pub tag: u32,
    pub nbytes: u32,
}

impl Header {
    pub const SIZE: usize = NSLEN + 4 + 1 + 4 + 4;

    pub fn new(namespace: &str, rank: i32, msg_type: FrameType, tag: u32, nbytes: u32) -> Header {
        let mut ns = [0u8; NSLEN];
        let bytes = namespace.as_bytes();
        let len = bytes.len().min(NSLEN);
        ns[..len].copy_from_slice(&bytes[..len]);

        Header {
            namespace: ns,
            rank,
            msg_type,
            tag,
            nbytes,
        }
    }

    pub fn namespace_str(&self) -> &str {
        let end = self.namespace.iter().position(|&b| b == 0).unwrap_or(NSLEN);
        std::str::from_utf8(&self.namespace[..end]).unwrap_or("")
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.namespace)?;
        w.write_i32::<NativeEndian>(self.rank)?;
        w.write_u8(self.msg_type as u8)?;
        w.write_u32::<NativeEndian>(self.tag)?;
        w.write_u32::<NativeEndian>(self.nbytes)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> PmixResult<Header> {
        let mut namespace = [0u8; NSLEN];
        r.read_exact(&mut namespace)?;
        let rank = r.read_i32::<NativeEndian>()?;
        let msg_type = FrameType::from_u8(r.read_u8()?)?;
        let tag = r.read_u32::<NativeEndian>()?;
        let nbytes = r.read_u32::<NativeEndian>()?;

        Ok(Header {
            namespace,
            rank,
            msg_type,
            tag,
            nbytes,
        })
    }
}

/// An outbound framed message: header followed by `nbytes` of payload. The payload is kept in
/// a reference-counted buffer (invariant I6) so a single fan-out reply can be shared across
/// every contributor without copying.
#[derive(Clone)]
pub struct OutFrame {
    pub header: Header,
    pub payload: std::rc::Rc<Vec<u8>>,
}

impl OutFrame {
    pub fn new(namespace: &str, rank: i32, tag: u32, payload: std::rc::Rc<Vec<u8>>) -> OutFrame {
        OutFrame {
            header: Header::new(namespace, rank, FrameType::User, tag, payload.len() as u32),
            payload,
        }
    }
}

/// A small self-describing write cursor used to build command replies. Mirrors the opaque
/// `pack(buf, value, type)` service described for the external codec: every command reply is
/// built by a sequence of calls to the primitives below.
pub struct PackBuffer {
    bytes: Vec<u8>,
}

impl PackBuffer {
    pub fn new() -> PackBuffer {
        PackBuffer { bytes: Vec::new() }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    pub fn pack_i32(&mut self, v: i32) {
        self.bytes.write_i32::<NativeEndian>(v).expect("vec write cannot fail");
    }

    pub fn pack_u32(&mut self, v: u32) {
        self.bytes.write_u32::<NativeEndian>(v).expect("vec write cannot fail");
    }

    pub fn pack_i64(&mut self, v: i64) {
        self.bytes.write_i64::<NativeEndian>(v).expect("vec write cannot fail");
    }

    pub fn pack_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn pack_status(&mut self, status: i32) {
        self.pack_i32(status);
    }

    pub fn pack_string(&mut self, s: &str) {
        self.pack_u32(s.len() as u32);
        self.bytes.extend_from_slice(s.as_bytes());
    }

    pub fn pack_bytes(&mut self, b: &[u8]) {
        self.pack_u32(b.len() as u32);
        self.bytes.extend_from_slice(b);
    }
}

/// A read cursor matching [`PackBuffer`], used by the switchyard to decode incoming commands.
pub struct UnpackBuffer<'a> {
    cursor: io::Cursor<&'a [u8]>,
}

impl<'a> UnpackBuffer<'a> {
    pub fn new(data: &'a [u8]) -> UnpackBuffer<'a> {
        UnpackBuffer {
            cursor: io::Cursor::new(data),
        }
    }

    pub fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    pub fn unpack_i32(&mut self) -> PmixResult<i32> {
        self.cursor.read_i32::<NativeEndian>().map_err(|_| PmixError::BadParam)
    }

    pub fn unpack_u32(&mut self) -> PmixResult<u32> {
        self.cursor.read_u32::<NativeEndian>().map_err(|_| PmixError::BadParam)
    }

    pub fn unpack_i64(&mut self) -> PmixResult<i64> {
        self.cursor.read_i64::<NativeEndian>().map_err(|_| PmixError::BadParam)
    }

    pub fn unpack_u8(&mut self) -> PmixResult<u8> {
        self.cursor.read_u8().map_err(|_| PmixError::BadParam)
    }

    pub fn unpack_string(&mut self) -> PmixResult<String> {
        let len = self.unpack_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf).map_err(|_| PmixError::BadParam)?;
        String::from_utf8(buf).map_err(|_| PmixError::BadParam)
    }

    pub fn unpack_bytes(&mut self) -> PmixResult<Vec<u8>> {
        let len = self.unpack_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf).map_err(|_| PmixError::BadParam)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let hdr = Header::new("job1", 3, FrameType::User, 42, 16);
        let mut buf = Vec::new();
        hdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), Header::SIZE);

        let back = Header::read(&mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(back.namespace_str(), "job1");
        assert_eq!(back.rank, 3);
        assert_eq!(back.msg_type, FrameType::User);
        assert_eq!(back.tag, 42);
        assert_eq!(back.nbytes, 16);
    }

    #[test]
    fn header_rejects_unknown_frame_type() {
        let mut buf = vec![0u8; Header::SIZE];
        buf[NSLEN + 4] = 0xff;
        let err = Header::read(&mut io::Cursor::new(&buf)).unwrap_err();
        assert_eq!(err, PmixError::BadParam);
    }

    #[test]
    fn pack_unpack_string_round_trips() {
        let mut pack = PackBuffer::new();
        pack.pack_status(0);
        pack.pack_string("hello");
        let bytes = pack.into_inner();

        let mut unpack = UnpackBuffer::new(&bytes);
        assert_eq!(unpack.unpack_i32().unwrap(), 0);
        assert_eq!(unpack.unpack_string().unwrap(), "hello");
        assert_eq!(unpack.remaining(), 0);
    }

    #[test]
    fn pack_unpack_bytes_round_trips() {
        let mut pack = PackBuffer::new();
        pack.pack_bytes(&[1, 2, 3, 4]);
        let bytes = pack.into_inner();

        let mut unpack = UnpackBuffer::new(&bytes);
        assert_eq!(unpack.unpack_bytes().unwrap(), vec![1, 2, 3, 4]);
    }
}
