use std::io;

/// Growable byte buffer with separate read/write cursors and cheap prepend.
///
/// Layout: `| prependable | readable | writable |`. The prependable region
/// starts at `kCHEAP_PREPEND` bytes and exists so framing layers above this
/// one can back-patch a length prefix without a second allocation.
pub struct Buffer {
    storage: Vec<u8>,
    reader: usize,
    writer: usize,
}

const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;
/// Stack scratch used by `read_fd` to absorb bursts larger than the current
/// writable tail in a single `readv`.
const EXTRA_BUF_SIZE: usize = 65536;

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Buffer {
            storage: vec![0u8; CHEAP_PREPEND + initial_size],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.writer
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader..self.writer]
    }

    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    fn begin_write_mut(&mut self) -> *mut u8 {
        unsafe { self.storage.as_mut_ptr().add(self.writer) }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let dst = self.begin_write_mut();
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        self.writer += data.len();
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Compacts in place if the combined free space suffices, otherwise
    /// grows the backing storage. See the invariant in module docs: after
    /// compaction `reader == CHEAP_PREPEND`.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Scatter-reads from `fd` into the writable tail plus a stack scratch
    /// region, in one syscall, then folds any overflow into the buffer via
    /// `append`. Returns the raw `read`/`readv` return value: `0` means the
    /// peer half-closed, a negative value means `errno` is in the second
    /// element of the returned tuple.
    pub fn read_fd(&mut self, fd: std::os::fd::RawFd) -> (isize, i32) {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec { iov_base: self.begin_write_mut().cast(), iov_len: writable },
            libc::iovec { iov_base: extra_buf.as_mut_ptr().cast(), iov_len: extra_buf.len() },
        ];
        let iovcnt = if writable < extra_buf.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return (n as isize, io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.storage.len();
            self.append(&extra_buf[..n - writable]);
        }
        (n as isize, 0)
    }

    /// Single `write` of the unread region. The caller advances the reader
    /// by the returned byte count on success.
    pub fn write_fd(&self, fd: std::os::fd::RawFd) -> (isize, i32) {
        let data = self.peek();
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            (n as isize, io::Error::last_os_error().raw_os_error().unwrap_or(0))
        } else {
            (n as isize, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.retrieve_as_vec(5), b"hello");
        assert_eq!(buf.peek(), b" world");
    }

    #[test]
    fn retrieve_all_resets_cursors_to_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn retrieve_more_than_readable_resets_like_retrieve_all() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(100);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_beyond_capacity_triggers_resize_growth() {
        let mut buf = Buffer::with_capacity(4);
        let big = vec![7u8; 4096];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), 4096);
        assert_eq!(buf.peek(), &big[..]);
    }

    #[test]
    fn compaction_reclaims_space_without_resizing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789012345"); // fills the 16-byte tail exactly
        buf.retrieve(10); // free up prependable+retrieved room via compaction
        let cap_before = buf.storage.len();
        buf.append(b"abcdefghij"); // 10 bytes, should fit after compaction
        assert_eq!(cap_before, buf.storage.len());
        assert_eq!(buf.peek(), b"012345abcdefghij");
    }

    #[test]
    fn cursor_invariant_holds_after_mixed_ops() {
        let mut buf = Buffer::new();
        for _ in 0..50 {
            buf.append(b"xyz123");
            buf.retrieve(2);
        }
        assert!(CHEAP_PREPEND <= buf.reader);
        assert!(buf.reader <= buf.writer);
        assert!(buf.writer <= buf.storage.len());
        assert_eq!(buf.readable_bytes(), buf.writer - buf.reader);
    }
}
