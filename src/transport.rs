//! Byte-stream transport under the WebSocket client.
//!
//! The handshake and frame layers only see this trait; plain TCP ships with
//! the crate and TLS stacks plug in through [`Connector`] without the core
//! knowing about them.

use crate::error::Error;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// A connected, non-blocking byte stream with readiness polling.
///
/// `read`/`write` perform one transfer of up to `buf.len()` bytes, waiting at
/// most `timeout_ms` for the fd to become ready. A read of `Ok(0)` means the
/// peer closed the stream.
pub trait Transport {
    fn as_raw_fd(&self) -> RawFd;

    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Error>;

    fn write(&mut self, buf: &[u8], timeout_ms: u32) -> Result<usize, Error>;

    /// Waits up to `timeout_ms` for readability. `Ok(true)` means ready.
    fn poll_read(&self, timeout_ms: u32) -> Result<bool, Error> {
        poll_fd(self.as_raw_fd(), libc::POLLIN, timeout_ms)
    }

    /// Waits up to `timeout_ms` for writability. `Ok(true)` means ready.
    fn poll_write(&self, timeout_ms: u32) -> Result<bool, Error> {
        poll_fd(self.as_raw_fd(), libc::POLLOUT, timeout_ms)
    }
}

/// One `poll(2)` on a single fd. `Ok(false)` is a timeout.
pub(crate) fn poll_fd(fd: RawFd, events: libc::c_short, timeout_ms: u32) -> Result<bool, Error> {
    let mut pollfd = libc::pollfd { fd, events, revents: 0 };
    let timeout = timeout_ms.min(i32::MAX as u32) as libc::c_int;
    let result = unsafe { libc::poll(&mut pollfd, 1, timeout) };
    match result {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        _ => Err(Error::IOError { source: std::io::Error::last_os_error() }),
    }
}

/// [`Transport`] over any non-blocking `Read + Write` stream with an fd.
///
/// The caller is responsible for putting the stream into non-blocking mode
/// before wrapping it; [`TcpConnector`] does so for plain TCP.
pub struct StreamTransport<S> {
    inner: S,
}

impl<S: Read + Write + AsRawFd> StreamTransport<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: Read + Write + AsRawFd> Transport for StreamTransport<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Error> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if !poll_fd(self.as_raw_fd(), libc::POLLIN, remaining_ms(deadline))? {
                        return Err(Error::Timeout);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::IOError { source: err }),
            }
        }
    }

    fn write(&mut self, buf: &[u8], timeout_ms: u32) -> Result<usize, Error> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if !poll_fd(self.as_raw_fd(), libc::POLLOUT, remaining_ms(deadline))? {
                        return Err(Error::Timeout);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::IOError { source: err }),
            }
        }
    }
}

fn remaining_ms(deadline: Instant) -> u32 {
    deadline
        .saturating_duration_since(Instant::now())
        .as_millis()
        .min(u32::MAX as u128) as u32
}

/// Establishes the byte stream the Upgrade handshake runs over. TLS callers
/// provide their own implementation; the shipped one is plain TCP.
pub trait Connector {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout_ms: u32,
    ) -> Result<Box<dyn Transport>, Error>;
}

pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout_ms: u32,
    ) -> Result<Box<dyn Transport>, Error> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, Duration::from_millis(timeout_ms as u64)) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    return Ok(Box::new(StreamTransport::new(stream)));
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => Error::IOError { source: err },
            None => Error::URLNoHost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn pair() -> (StreamTransport<UnixStream>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (StreamTransport::new(a), b)
    }

    #[test]
    fn read_returns_available_bytes() {
        let (mut transport, mut peer) = pair();
        peer.write_all(b"abc").unwrap();
        let mut buf = [0u8; 8];
        let n = transport.read(&mut buf, 1000).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn read_times_out_when_idle() {
        let (mut transport, _peer) = pair();
        let mut buf = [0u8; 8];
        assert!(matches!(transport.read(&mut buf, 10), Err(Error::Timeout)));
    }

    #[test]
    fn read_reports_peer_close() {
        let (mut transport, peer) = pair();
        drop(peer);
        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn poll_read_sees_pending_data() {
        let (transport, mut peer) = pair();
        assert!(!transport.poll_read(0).unwrap());
        peer.write_all(b"x").unwrap();
        assert!(transport.poll_read(1000).unwrap());
    }
}
