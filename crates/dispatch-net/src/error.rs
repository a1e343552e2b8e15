//! Stable error taxonomy shared by the whole proxy.

use std::io;

use thiserror::Error;

/// Network-layer errors.
///
/// The variants are the stable kinds callers dispatch on (the SOCKS reply
/// mapping in particular); the payloads carry human-readable detail.
#[derive(Debug, Clone, Error)]
pub enum NetError {
    #[error("resource temporarily unavailable")]
    Again,

    #[error("connect in progress")]
    InProgress,

    #[error("socket is already connecting or connected")]
    Already,

    #[error("operation timed out")]
    Timeout,

    #[error("network unreachable")]
    NetUnreach,

    #[error("host unreachable")]
    HostUnreach,

    #[error("connection refused")]
    ConnRefused,

    #[error("invalid socket handle")]
    InvalidSocket,

    #[error("DNS failure: {0}")]
    DnsFailure(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("no suitable interface available")]
    NoIface,

    #[error("no addresses to try")]
    NoAddresses,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("network error: {0}")]
    Generic(String),
}

impl NetError {
    /// Whether the operation should simply be retried when the socket is
    /// ready again.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::Again | NetError::InProgress)
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind;

        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::Interrupted => NetError::Again,
            ErrorKind::TimedOut => NetError::Timeout,
            ErrorKind::NetworkUnreachable => NetError::NetUnreach,
            ErrorKind::HostUnreachable => NetError::HostUnreach,
            ErrorKind::ConnectionRefused => NetError::ConnRefused,
            _ => NetError::Generic(e.to_string()),
        }
    }
}
