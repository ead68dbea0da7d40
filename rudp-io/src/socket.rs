//! UDP socket wrapper for talkers
//!
//! Provides a cross-platform UDP socket with the options a talker needs.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

/// Socket errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

impl SocketError {
    /// True when the operation only failed because nothing was ready
    pub fn is_would_block(&self) -> bool {
        match self {
            SocketError::Io(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
            SocketError::InvalidAddress => false,
        }
    }
}

/// Datagram socket of one talker
pub struct RudpSocket {
    inner: Socket,
}

impl RudpSocket {
    /// Create a socket bound to the given address
    ///
    /// Port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&addr.into())?;
        debug!(%addr, "udp socket bound");

        Ok(RudpSocket { inner: socket })
    }

    /// Switch between blocking and non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        self.inner.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Bound blocking receives; `None` blocks forever
    #[cfg(test)]
    fn set_read_timeout(
        &self,
        timeout: Option<std::time::Duration>,
    ) -> Result<(), SocketError> {
        // A zero timeout is rejected by the OS
        let timeout = timeout.map(|t| t.max(std::time::Duration::from_millis(1)));
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Set the send buffer size
    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_send_buffer_size(size)?;
        Ok(())
    }

    /// Set the receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    /// Send one datagram
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, &target.into())?)
    }

    /// Receive one datagram, returning its size and source
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        // SAFETY: recv_from only writes initialized bytes into the buffer and
        // `u8` has no invalid bit patterns.
        let uninit = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };
        let (n, addr) = self.inner.recv_from(uninit)?;
        Ok((n, addr.as_socket().ok_or(SocketError::InvalidAddress)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_socket_creation() {
        let socket = RudpSocket::bind(local()).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_socket_send_recv() {
        let sender = RudpSocket::bind(local()).unwrap();
        let receiver = RudpSocket::bind(local()).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        sender
            .send_to(b"Hello, RUDP!", receiver.local_addr().unwrap())
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello, RUDP!");
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_buffer_sizes() {
        let socket = RudpSocket::bind(local()).unwrap();
        socket.set_send_buffer_size(1 << 18).unwrap();
        socket.set_recv_buffer_size(1 << 18).unwrap();
    }

    #[test]
    fn test_nonblocking_would_block() {
        let socket = RudpSocket::bind(local()).unwrap();
        socket.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(err.is_would_block());
    }

    #[test]
    fn test_read_timeout_would_block() {
        let socket = RudpSocket::bind(local()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();

        let mut buf = [0u8; 16];
        assert!(socket.recv_from(&mut buf).unwrap_err().is_would_block());
    }
}
