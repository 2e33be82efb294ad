//! Growable byte queue with prepend headroom and fd scatter-read.
//!
//! Layout: `| prependable | readable | writable |` over one backing vector.
//! `retrieve` consumes from the front, `append` extends the back; draining
//! the buffer resets both cursors so the space is reused without copying.

use std::io;
use std::os::unix::io::RawFd;

/// Headroom kept in front of the readable region so callers can cheaply
/// prepend a length header.
pub const CHEAP_PREPEND: usize = 8;

/// Initial capacity of the readable/writable region.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack-resident spill region used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

/// Byte buffer backing a connection's input and output queues.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Bytes available to read.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Bytes that can be appended without growing or shifting.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Bytes in front of the read cursor, including the headroom.
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, without consuming it.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Advance the read cursor by `n`. Consuming everything resets both
    /// cursors to the headroom offset.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Discard the readable region and reset both cursors.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Drain `n` bytes as a string (lossy on invalid UTF-8).
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        assert!(n <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.buf[self.reader_index..self.reader_index + n])
            .into_owned();
        self.retrieve(n);
        s
    }

    /// Drain the whole buffer as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let n = self.readable_bytes();
        self.retrieve_as_string(n)
    }

    /// Append bytes, growing or shifting to make room first.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Write into the headroom directly in front of the readable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    /// Ensure at least `len` writable bytes.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Enough slack in front: shift readable bytes back to the
            // headroom offset instead of growing.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Scatter-read from `fd` into the writable tail plus a 64 KiB stack
    /// region, so one syscall drains the kernel buffer even when the tail is
    /// small. Overflow that landed in the stack region is appended after the
    /// syscall, growing the buffer at most once.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_index) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_BUF_SIZE,
            },
        ];
        // Skip the stack region when the tail alone is at least as large.
        let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd` in one syscall. The caller advances
    /// the read cursor by the returned count.
    pub fn write_fd(&self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.buf.as_ptr().add(self.reader_index) as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello, world");
        assert_eq!(buf.readable_bytes(), 12);
        assert_eq!(buf.peek(), b"hello, world");
        assert_eq!(buf.retrieve_all_as_string(), "hello, world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn full_retrieve_resets_cursors() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(3);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn partial_retrieve_keeps_remainder() {
        let mut buf = Buffer::new();
        buf.append(b"0123456789");
        buf.retrieve(4);
        assert_eq!(buf.peek(), b"456789");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 4);
    }

    #[test]
    fn append_grows_when_needed() {
        let mut buf = Buffer::new();
        let data = vec![0x5a; INITIAL_SIZE * 3];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), data.len());
        assert_eq!(buf.peek(), &data[..]);
    }

    #[test]
    fn append_shifts_instead_of_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; 800]);
        buf.retrieve(700);
        // 100 readable left at offset 708; writable is 224 but the front
        // slack makes room for 500 more without reallocating.
        let len_before = buf.buf.len();
        buf.append(&vec![2u8; 500]);
        assert_eq!(buf.buf.len(), len_before);
        assert_eq!(buf.readable_bytes(), 600);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn prepend_uses_headroom() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let header = (7u32).to_be_bytes();
        buf.prepend(&header);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(&buf.peek()[..4], &header);
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    fn read_fd_drains_past_writable() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let data: Vec<u8> = (0..60_000u32).map(|i| (i % 251) as u8).collect();
        tx.write_all(&data).unwrap();
        tx.flush().unwrap();
        rx.set_nonblocking(true).unwrap();

        let mut buf = Buffer::new();
        let mut total = 0;
        while total < data.len() {
            match buf.read_fd(rx.as_raw_fd()) {
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("read_fd failed: {e}"),
            }
        }
        assert_eq!(total, data.len());
        assert_eq!(buf.peek(), &data[..]);
    }

    #[test]
    fn read_fd_would_block_on_empty_socket() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let mut buf = Buffer::new();
        let err = buf.read_fd(rx.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn write_fd_then_caller_advances() {
        let (tx, mut rx) = UnixStream::pair().unwrap();
        let mut buf = Buffer::new();
        buf.append(b"ping");
        let n = buf.write_fd(tx.as_raw_fd()).unwrap();
        assert_eq!(n, 4);
        buf.retrieve(n);
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = [0u8; 8];
        let got = std::io::Read::read(&mut rx, &mut out).unwrap();
        assert_eq!(&out[..got], b"ping");
    }
}
