//! Growable byte buffer with read/write cursors.
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0       <=     reader_index  <=  writer_index   <=     len
//! ```
//!
//! The prependable region starts at [`CHEAP_PREPEND`] so a small header
//! can be written in front of queued data without moving it.

use std::io;
use std::os::fd::RawFd;

/// Reserved prefix length for cheap prepends.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack-local spill segment used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    storage: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Buffer::default()
    }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader_index..self.writer_index]
    }

    /// Mark `len` bytes as consumed. Consuming everything resets both
    /// cursors to [`CHEAP_PREPEND`].
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consume up to `len` bytes and return them as a string.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let s = String::from_utf8_lossy(&self.storage[self.reader_index..self.reader_index + len])
            .into_owned();
        self.retrieve(len);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Guarantee at least `len` writable bytes, growing or sliding the
    /// readable region back to the prepend mark.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.writer_index + len, 0);
        } else {
            // Slide readable bytes back to reclaim the consumed prefix.
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Scatter-read from `fd` into the writable tail plus a stack-local
    /// spill segment, so one syscall captures whatever the kernel has
    /// buffered without pre-growing the buffer.
    ///
    /// Returns the byte count from the kernel (0 means EOF). Transient
    /// conditions (`EAGAIN`, `EINTR`) surface as the corresponding
    /// `io::Error`; the caller decides whether they are retryable.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.storage[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt: libc::c_int = if writable < extra.len() { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}
