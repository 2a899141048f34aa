//! Error surface of the transport.
//!
//! Internal operations return [`ErrorKind`]; the public endpoint methods
//! wrap kinds into an [`OpError`] naming the operation and the endpoints
//! involved, the way OS socket errors read.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::addr::{Addr, AddrError, IpPort};
use crate::cipher::CryptError;
use crate::layers::{LayerError, ParseError};

/// The operation an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Dial,
    Listen,
    Accept,
    Handshake,
    Read,
    Write,
    Close,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Dial => "dial",
            Op::Listen => "listen",
            Op::Accept => "accept",
            Op::Handshake => "handshake",
            Op::Read => "read",
            Op::Write => "write",
            Op::Close => "close",
        };
        f.write_str(name)
    }
}

/// Failure causes, independent of the operation that hit them.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error("address {0} not supported")]
    UnsupportedAddr(String),
    #[error("transport layer {0} not supported")]
    UnsupportedTransport(&'static str),
    #[error("open capture: {0}")]
    CaptureOpen(#[source] io::Error),
    #[error("read capture: {0}")]
    CaptureRead(#[source] io::Error),
    #[error("write capture: {0}")]
    CaptureWrite(#[source] io::Error),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("handshake timeout")]
    HandshakeTimeout,
    #[error("connection reset")]
    HandshakeReset,
    #[error("invalid handshake packet")]
    HandshakeProtocol,
    #[error("peer {0} unrecognized")]
    UnknownPeer(IpPort),
    #[error("peer {0} unauthorized")]
    UnauthorizedPeer(IpPort),
    #[error("crypt: {0}")]
    Crypto(#[from] CryptError),
    #[error("timeout")]
    Timeout,
    #[error("connection closed")]
    Closed,
}

impl ErrorKind {
    /// Whether this is a cooperative timeout the caller may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::HandshakeTimeout)
    }
}

/// An error tagged with the operation and the endpoints it concerns.
#[derive(Debug)]
pub struct OpError {
    pub op: Op,
    pub local: Option<Addr>,
    pub remote: Option<Addr>,
    pub kind: ErrorKind,
}

impl OpError {
    pub fn new(op: Op, local: Option<Addr>, remote: Option<Addr>, kind: ErrorKind) -> Self {
        Self {
            op,
            local,
            remote,
            kind,
        }
    }

    /// Whether this is a cooperative timeout the caller may retry.
    pub fn is_timeout(&self) -> bool {
        self.kind.is_timeout()
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if let Some(local) = &self.local {
            write!(f, " {}", local)?;
        }
        if let Some(remote) = &self.remote {
            write!(f, " -> {}", remote)?;
        }
        write!(f, ": {}", self.kind)
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_error_display() {
        let err = OpError::new(
            Op::Read,
            Some(Addr::Tcp("10.0.0.1:5000".parse().unwrap())),
            Some(Addr::Udp("10.0.0.2:443".parse().unwrap())),
            ErrorKind::Timeout,
        );
        assert_eq!(err.to_string(), "read 10.0.0.1:5000 -> 10.0.0.2:443: timeout");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_op_error_without_addrs() {
        let err = OpError::new(Op::Close, None, None, ErrorKind::Closed);
        assert_eq!(err.to_string(), "close: connection closed");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_handshake_timeout_is_timeout() {
        assert!(ErrorKind::HandshakeTimeout.is_timeout());
        assert!(!ErrorKind::HandshakeReset.is_timeout());
    }
}
