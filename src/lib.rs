//! Stream multiplexing over a single reliable byte transport.
//!
//! Filament layers independent, flow-controlled, bidirectional logical
//! streams on top of one ordered byte stream (typically a TCP socket),
//! speaking the yamux wire protocol: 12-byte framed messages, credit-based
//! sliding windows, TCP-like per-stream SYN/ACK/FIN/RST lifecycle, ping
//! keepalives and a GoAway teardown handshake.
//!
//! # Architecture
//!
//! - [`frame`]: wire-exact header codec, frame types, flags, reason codes
//! - [`stream`]: per-stream state machine, windows, and the blocking
//!   [`Stream`] handle
//! - [`session`]: the connection — reassembly, dispatch, stream table,
//!   keepalive, GoAway, teardown
//! - [`config`] / [`error`]: tuning surface and error taxonomy
//!
//! The session makes no assumptions about the transport beyond ordered
//! reliable delivery: outbound bytes go to an injected [`std::io::Write`]
//! sink, inbound bytes are pushed in via [`Session::receive`] in chunks of
//! any size. Encryption, authentication and connection establishment are
//! out of scope.
//!
//! # Example
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::net::TcpStream;
//!
//! use filament::{Config, Session};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = TcpStream::connect("127.0.0.1:4000")?;
//! let session = Session::client(Config::default(), Box::new(socket.try_clone()?))?;
//!
//! // Feed inbound bytes from a reader thread.
//! let driver = session.clone();
//! std::thread::spawn(move || {
//!     let _ = driver.drive(socket);
//! });
//!
//! let mut stream = session.open()?;
//! stream.write_all(b"echo-0")?;
//! let mut reply = [0u8; 6];
//! stream.read_exact(&mut reply)?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod frame;
pub mod session;
pub mod stream;

pub use config::{BacklogMode, Config, ConfigError};
pub use error::Error;
pub use frame::{
    Flags, FrameType, GoAwayCode, Header, HEADER_LEN, INITIAL_STREAM_WINDOW, PROTOCOL_VERSION,
};
pub use session::{ErrorCallback, Role, Session, StreamCallback};
pub use stream::{Stream, StreamState};
