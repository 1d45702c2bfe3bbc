//! Generic byte stream abstraction
//!
//! Sessions and the negotiator only need an ordered, reliable byte stream.
//! TCP+TLS is the default binding; tests drive the same code over
//! `tokio::io::duplex`.

use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any ordered, reliable, bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

/// Type-erased stream owned by a session
pub type BoxedStream = Box<dyn AsyncStream>;

/// Where a stream is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportAddress {
    /// TCP/IP socket address (IP:port)
    Tcp(SocketAddr),
    /// In-process stream with no network address
    Memory,
}

impl TransportAddress {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TransportAddress::Tcp(addr) => Some(*addr),
            TransportAddress::Memory => None,
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
            TransportAddress::Memory => write!(f, "memory"),
        }
    }
}

impl From<SocketAddr> for TransportAddress {
    fn from(addr: SocketAddr) -> Self {
        TransportAddress::Tcp(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_address_display() {
        let addr: SocketAddr = "192.168.1.20:1739".parse().unwrap();
        assert_eq!(TransportAddress::from(addr).to_string(), "tcp://192.168.1.20:1739");
        assert_eq!(TransportAddress::Memory.to_string(), "memory");
        assert_eq!(TransportAddress::Memory.socket_addr(), None);
    }

    #[test]
    fn test_duplex_is_async_stream() {
        let (a, _b) = tokio::io::duplex(64);
        let boxed: BoxedStream = Box::new(a);
        drop(boxed);
    }
}
