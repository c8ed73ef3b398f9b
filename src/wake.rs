//! Counting wake signal used to hand cross-thread notifications to the loop.
//!
//! Backed by a kernel `eventfd(2)`, which has exactly the required
//! semantics: a 64-bit counter, writes add, a read returns and zeroes it,
//! readable while the counter is above zero and writable while it is below
//! `u64::MAX - 1`.

use crate::error::Error;
use std::os::unix::io::{AsRawFd, RawFd};

/// Closing happens on `Drop`; an operation racing with the close observes
/// [`Error::BadFd`].
#[derive(Debug)]
pub struct WakeFd {
    fd: RawFd,
}

// The fd is only an index into the kernel's file table; concurrent reads and
// writes from any thread are defined behavior.
unsafe impl Send for WakeFd {}
unsafe impl Sync for WakeFd {}

impl WakeFd {
    /// Creates a wake signal with the given initial counter value.
    /// `initial` must be below `u64::MAX`.
    pub fn new(initial: u64, nonblocking: bool) -> Result<Self, Error> {
        if initial == u64::MAX {
            return Err(Error::InvalidArg("initial wake value out of range"));
        }

        let mut flags = libc::EFD_CLOEXEC;
        if nonblocking {
            flags |= libc::EFD_NONBLOCK;
        }
        // eventfd only takes a 32-bit initial value; create at zero and apply
        // the full 64-bit value with a write.
        let fd = unsafe { libc::eventfd(0, flags) };
        if fd < 0 {
            return Err(Error::IOError { source: std::io::Error::last_os_error() });
        }

        let wake = Self { fd };
        if initial > 0 {
            wake.write(initial)?;
        }
        Ok(wake)
    }

    /// Adds `value` to the counter. Writing zero is a successful no-op;
    /// `u64::MAX` is rejected. If the addition would overflow the counter the
    /// call blocks until a reader drains it, or returns [`Error::WouldBlock`]
    /// in non-blocking mode.
    pub fn write(&self, value: u64) -> Result<(), Error> {
        if value == 0 {
            return Ok(());
        }
        if value == u64::MAX {
            return Err(Error::InvalidArg("wake value out of range"));
        }

        let buf = value.to_ne_bytes();
        let result = unsafe {
            libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len())
        };
        if result == buf.len() as isize {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    /// Returns the current counter and resets it to zero. Blocks while the
    /// counter is zero, or returns [`Error::WouldBlock`] in non-blocking mode.
    pub fn read(&self) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        let result = unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if result == buf.len() as isize {
            Ok(u64::from_ne_bytes(buf))
        } else {
            Err(last_errno())
        }
    }
}

fn last_errno() -> Error {
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Error::WouldBlock,
        Some(libc::EBADF) => Error::BadFd,
        Some(libc::EINVAL) => Error::InvalidArg("wake value out of range"),
        _ => Error::IOError { source: err },
    }
}

impl AsRawFd for WakeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn writes_accumulate_until_read() {
        let wake = WakeFd::new(0, true).unwrap();
        for _ in 0..3 {
            wake.write(1).unwrap();
        }
        assert_eq!(wake.read().unwrap(), 3);
        assert!(matches!(wake.read(), Err(Error::WouldBlock)));
    }

    #[test]
    fn initial_value_is_readable() {
        let wake = WakeFd::new(7, true).unwrap();
        assert_eq!(wake.read().unwrap(), 7);
    }

    #[test]
    fn zero_write_is_a_noop() {
        let wake = WakeFd::new(0, true).unwrap();
        wake.write(0).unwrap();
        assert!(matches!(wake.read(), Err(Error::WouldBlock)));
    }

    #[test]
    fn max_value_write_is_rejected() {
        let wake = WakeFd::new(0, true).unwrap();
        assert!(matches!(wake.write(u64::MAX), Err(Error::InvalidArg(_))));
        assert!(matches!(WakeFd::new(u64::MAX, true), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn overflowing_write_would_block() {
        let wake = WakeFd::new(u64::MAX - 1, true).unwrap();
        assert!(matches!(wake.write(1), Err(Error::WouldBlock)));
        assert_eq!(wake.read().unwrap(), u64::MAX - 1);
        wake.write(1).unwrap();
    }

    #[test]
    fn cross_thread_writes_are_counted() {
        let wake = Arc::new(WakeFd::new(0, false).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let wake = Arc::clone(&wake);
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    wake.write(1).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut total = 0;
        while total < 100 {
            total += wake.read().unwrap();
        }
        assert_eq!(total, 100);
    }
}
