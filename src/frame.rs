//! Wire frame format (yamux framing).
//!
//! Every frame starts with a fixed 12-byte header; only `Data` frames carry
//! a body. Multi-byte fields are big-endian:
//!
//! ```text
//! +--------+--------+----------------+--------------------------------+
//! | version|  type  |     flags      |           stream id            |
//! +--------+--------+----------------+--------------------------------+
//! |             length              |  body (Data frames only) ...
//! +---------------------------------+
//! ```
//!
//! The `length` field is overloaded by frame type: a body byte count for
//! `Data`, the window delta for `WindowUpdate`, the ping id for `Ping`, and
//! the reason code for `GoAway`.

use bitflags::bitflags;

/// Protocol version carried in every header. Anything else is fatal.
pub const PROTOCOL_VERSION: u8 = 0;

/// Size of an encoded header, for every frame type.
pub const HEADER_LEN: usize = 12;

/// Initial send/receive window granted to every stream, in bytes.
pub const INITIAL_STREAM_WINDOW: u32 = 256 * 1024;

/// Frame types understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream payload bytes; the only frame type with a body.
    Data = 0x0,
    /// Window credit grant; `length` holds the delta, not a body size.
    WindowUpdate = 0x1,
    /// Liveness probe; `length` holds the ping id.
    Ping = 0x2,
    /// Connection-level "no new streams" signal; `length` holds the reason.
    GoAway = 0x3,
}

impl FrameType {
    /// Parse a wire type byte. Returns `None` for unknown types, which the
    /// session treats as a fatal protocol error.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Data),
            0x1 => Some(Self::WindowUpdate),
            0x2 => Some(Self::Ping),
            0x3 => Some(Self::GoAway),
            _ => None,
        }
    }
}

bitflags! {
    /// Stream lifecycle flags carried in the header, TCP-like but applied
    /// per logical stream. Flags may combine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u16 {
        /// First frame of a new stream.
        const SYN = 0x1;
        /// Acknowledges a received SYN.
        const ACK = 0x2;
        /// Half-closes the sender's side.
        const FIN = 0x4;
        /// Hard-resets the stream.
        const RST = 0x8;
    }
}

/// GoAway reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GoAwayCode {
    /// Normal termination; the sender accepts no further streams.
    Normal = 0,
    /// The sender observed a protocol violation.
    ProtocolError = 1,
    /// The sender hit an internal error.
    InternalError = 2,
}

impl GoAwayCode {
    /// Parse a wire reason code. Unknown codes are a connection error.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::ProtocolError),
            2 => Some(Self::InternalError),
            _ => None,
        }
    }
}

/// A decoded frame header.
///
/// `ty` is kept as the raw wire byte so an invalid type survives decoding
/// and can be reported; use [`Header::frame_type`] for the checked view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version, must equal [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Raw frame type byte.
    pub ty: u8,
    /// Lifecycle flags.
    pub flags: Flags,
    /// Addressed stream, 0 for connection-level frames.
    pub stream_id: u32,
    /// Type-dependent payload field (see module docs).
    pub length: u32,
}

impl Header {
    /// Build a header for the given frame type.
    #[must_use]
    pub fn new(ty: FrameType, flags: Flags, stream_id: u32, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            ty: ty as u8,
            flags,
            stream_id,
            length,
        }
    }

    /// Data frame header; `length` is the body size that must follow.
    #[must_use]
    pub fn data(flags: Flags, stream_id: u32, length: u32) -> Self {
        Self::new(FrameType::Data, flags, stream_id, length)
    }

    /// Window update header; `delta` is credit granted to the peer.
    #[must_use]
    pub fn window_update(flags: Flags, stream_id: u32, delta: u32) -> Self {
        Self::new(FrameType::WindowUpdate, flags, stream_id, delta)
    }

    /// Ping header carrying `ping_id`.
    #[must_use]
    pub fn ping(flags: Flags, ping_id: u32) -> Self {
        Self::new(FrameType::Ping, flags, 0, ping_id)
    }

    /// GoAway header carrying `code`.
    #[must_use]
    pub fn go_away(code: GoAwayCode) -> Self {
        Self::new(FrameType::GoAway, Flags::empty(), 0, code as u32)
    }

    /// Checked frame type.
    #[must_use]
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.ty)
    }

    /// Encode into the fixed 12-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.version;
        buf[1] = self.ty;
        buf[2..4].copy_from_slice(&self.flags.bits().to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode a header from the first 12 bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_LEN`]. Callers are expected
    /// to have buffered a complete header first; a short slice here is a
    /// programmer error, not a protocol error.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= HEADER_LEN, "header requires {HEADER_LEN} bytes");
        Self {
            version: buf[0],
            ty: buf[1],
            flags: Flags::from_bits_retain(u16::from_be_bytes([buf[2], buf[3]])),
            stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}
