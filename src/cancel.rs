//! Cancellation token for interrupting the blocking buffer wait.
//!
//! Backed by a self-pipe plus an atomic flag. `cancel()` is
//! async-signal-safe (one atomic store and one `write(2)` of a byte), so it
//! can run inside a signal handler. The read end of the pipe is included in
//! every `ppoll` set: a signal arriving at any moment either flips the flag
//! before the loop's between-round check or wakes the poll. There is no
//! window where a wakeup can be missed.

use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

struct Inner {
    cancelled: AtomicBool,
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

/// Cloneable cancellation handle. All clones observe the same state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid out-pointer for two descriptors.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, so both descriptors are owned by us.
        let (read_fd, write_fd) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                read_fd,
                write_fd,
            }),
        })
    }

    /// Request cancellation. Async-signal-safe, idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let byte = 1u8;
        // SAFETY: write(2) on an owned nonblocking pipe fd with a valid
        // one-byte buffer; a full pipe (EAGAIN) still leaves the poll
        // readable, so the result is deliberately ignored.
        unsafe {
            libc::write(
                self.raw_write_fd(),
                (&raw const byte).cast(),
                1,
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The fd to include in poll sets; readable once cancelled.
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.inner.read_fd.as_fd()
    }

    fn raw_write_fd(&self) -> RawFd {
        self.inner.write_fd.as_raw_fd()
    }
}
