use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::bytes::Bytes;

/// Handle for one connection handed out by a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out")]
    Timeout,

    #[error("connection closed by remote")]
    Closed,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                TransportError::Closed
            }
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Reliable ordered byte stream the engine talks through.
///
/// All calls return immediately. Completion (connected, readable, error,
/// timeout) comes back to the engine through its `on_*` methods, called by
/// whoever owns both the engine and the transport.
pub trait Transport {
    /// Starts connecting. The outcome is reported later for the returned id.
    fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> ConnId;

    /// Queues bytes for sending. `more` hints that another send follows
    /// right away so the flush may be deferred.
    fn send(&mut self, conn: ConnId, data: Bytes, more: bool);

    /// Replaces the read deadline of a connection. Passing the deadline
    /// without any input arriving reports [`TransportError::Timeout`].
    fn set_timeout(&mut self, conn: ConnId, deadline: Instant);

    fn close(&mut self, conn: ConnId);
}
