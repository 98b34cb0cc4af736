use slice_deque::SliceDeque;
use std::io;

/// All buffer sizes must be a multiple of this so growth stays cheap and predictable.
pub const BUF_SIZE_INCREMENT: usize = 65536;

/// A fixed-capacity ring buffer backing one direction (read or write) of a peer socket.
///
/// Bytes are appended at the tail and consumed from the head; the underlying
/// [`SliceDeque`] keeps both halves of the ring contiguous so callers never have to special
/// case a wraparound.
pub struct Buffer {
    data: SliceDeque<u8>,
    size: usize,
}

impl Buffer {
    pub fn new(size: usize) -> Buffer {
        assert_eq!(
            size % BUF_SIZE_INCREMENT,
            0,
            "buffer size must be a multiple of {}",
            BUF_SIZE_INCREMENT
        );

        Buffer {
            data: SliceDeque::with_capacity(size),
            size,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Drops `count` bytes from the head, as if they had been consumed.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) };
    }

    /// Marks `count` bytes beyond the current tail as written.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) };
    }

    /// The currently buffered, unread bytes.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data
    }

    /// The free space beyond the current tail, available for writing. The deque was allocated
    /// with `size` capacity up front, so this is always a valid, contiguous slice.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        let len = self.data.len();
        let free = self.size - len;
        unsafe { std::slice::from_raw_parts_mut(self.data.as_mut_ptr().add(len), free) }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Writes as much buffered data as possible into `sink`, stopping on `WouldBlock` or once
    /// the buffer is empty.
    pub fn egress<W: io::Write>(&mut self, sink: &mut W) -> io::Result<()> {
        loop {
            if self.data.is_empty() {
                return Ok(());
            }

            match sink.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => self.move_head(written),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Err(io::ErrorKind::WouldBlock.into()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Reads from `source` until it would block, EOF is hit, or the buffer fills. Filling the
    /// buffer without reaching EOF is reported as an overrun: the caller asked for a frame
    /// larger than the buffer was sized to hold.
    pub fn ingress<R: io::Read>(&mut self, source: &mut R) -> io::Result<()> {
        loop {
            let free = self.free_capacity();
            if free == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "buffer overrun"));
            }

            let read_count = match source.read(self.write_slice()) {
                Ok(n) => n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Err(io::ErrorKind::WouldBlock.into()),
                Err(err) => return Err(err),
            };

            if read_count == 0 {
                return Ok(());
            }

            self.move_tail(read_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    struct MockChannel {
        inbound: Vec<u8>,
        outbound: Vec<u8>,
        cap: usize,
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.inbound.len()).min(self.cap);
            buf[..n].copy_from_slice(&self.inbound[..n]);
            self.inbound.drain(..n);
            Ok(n)
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.cap);
            self.outbound.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = Buffer::new(BUF_SIZE_INCREMENT);
        {
            let slice = buf.write_slice();
            slice[..5].copy_from_slice(b"hello");
        }
        buf.move_tail(5);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.read_slice(), b"hello");
        buf.move_head(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn ingress_stops_at_eof() {
        let mut buf = Buffer::new(BUF_SIZE_INCREMENT);
        let mut chan = MockChannel {
            inbound: b"abc".to_vec(),
            outbound: Vec::new(),
            cap: 1024,
        };
        buf.ingress(&mut chan).unwrap();
        assert_eq!(buf.read_slice(), b"abc");
    }

    #[test]
    fn ingress_overrun_when_buffer_fills_without_eof() {
        let mut buf = Buffer::new(BUF_SIZE_INCREMENT);
        let mut chan = MockChannel {
            inbound: vec![0u8; BUF_SIZE_INCREMENT + 1],
            outbound: Vec::new(),
            cap: BUF_SIZE_INCREMENT + 1,
        };
        let err = buf.ingress(&mut chan).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn egress_drains_until_empty() {
        let mut buf = Buffer::new(BUF_SIZE_INCREMENT);
        {
            let slice = buf.write_slice();
            slice[..3].copy_from_slice(b"xyz");
        }
        buf.move_tail(3);
        let mut chan = MockChannel {
            inbound: Vec::new(),
            outbound: Vec::new(),
            cap: 1024,
        };
        buf.egress(&mut chan).unwrap();
        assert!(buf.is_empty());
        assert_eq!(chan.outbound, b"xyz");
    }
}
