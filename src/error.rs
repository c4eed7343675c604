//! Error types for the multiplexer.
//!
//! Two propagation scopes exist:
//!
//! - **Connection-fatal**: framing-level violations (bad version, bad frame
//!   type, duplicate stream) where the byte stream may be desynchronized.
//!   These close the whole session and are surfaced once through the error
//!   callback and the session's terminal-error slot.
//! - **Per-stream**: unexpected flags, exceeded receive windows, resets and
//!   write timeouts. These surface on the affected stream only.
//!
//! The enum is `Clone` so a single terminal error can be both reported to a
//! callback and retained for later inspection; transport I/O failures are
//! therefore carried as their display string.

use std::io;
use thiserror::Error;

/// Everything that can go wrong on a session or one of its streams.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Received a frame with an unsupported protocol version. Fatal.
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),

    /// Received a frame with an unknown type byte. Fatal.
    #[error("invalid msg type: {0}")]
    InvalidFrameType(u8),

    /// Operation attempted after the session shut down.
    #[error("session shutdown")]
    SessionShutdown,

    /// The remote opened a stream id that is already registered. Fatal.
    #[error("duplicate stream initiated")]
    DuplicateStream,

    /// The remote sent more data than the receive window allowed.
    #[error("recv window exceeded")]
    ReceiveWindowExceeded,

    /// A deadline was reached.
    #[error("i/o deadline reached")]
    Timeout,

    /// Read or write on a stream that has already closed.
    #[error("stream closed")]
    StreamClosed,

    /// A FIN arrived in a state that cannot accept one.
    #[error("unexpected flag")]
    UnexpectedFlag,

    /// `open()` rejected because the remote sent GoAway.
    #[error("remote end is not accepting connections")]
    RemoteGoAway,

    /// The stream was reset, either explicitly or by backlog eviction.
    #[error("connection reset")]
    ConnectionReset,

    /// No window credit arrived within the connection write timeout.
    #[error("connection write timeout")]
    ConnectionWriteTimeout,

    /// A keepalive ping went unanswered past its deadline.
    #[error("keepalive timeout")]
    KeepAliveTimeout,

    /// The remote reported a protocol error via GoAway. Fatal.
    #[error("remote protocol error")]
    RemoteProtocolError,

    /// The remote reported an internal error via GoAway. Fatal.
    #[error("remote internal error")]
    RemoteInternalError,

    /// The remote sent a GoAway with an unknown reason code. Fatal.
    #[error("unexpected go away code: {0}")]
    InvalidGoAwayCode(u32),

    /// The underlying transport failed.
    #[error("i/o error: {0}")]
    Io(String),
}

impl Error {
    pub(crate) fn from_io(err: &io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Timeout | Error::ConnectionWriteTimeout | Error::KeepAliveTimeout => {
                io::ErrorKind::TimedOut
            }
            Error::ConnectionReset => io::ErrorKind::ConnectionReset,
            Error::StreamClosed | Error::SessionShutdown => io::ErrorKind::NotConnected,
            Error::RemoteGoAway => io::ErrorKind::ConnectionRefused,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
