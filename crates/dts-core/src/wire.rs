//! dts wire format — the frame header and status codes for all dts RPC.
//!
//! These types ARE the protocol. Every field and every discriminant here is
//! part of the wire format; changing anything breaks deployed peers.
//!
//! A frame is this fixed header followed by `length` bytes of JSON payload.
//! The header is `#[repr(C, packed)]` with zerocopy derives for
//! deterministic layout and allocation-free parsing. There is no unsafe code
//! in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// First four bytes of every frame: "DTS1" read as big-endian u32.
pub const FRAME_MAGIC: u32 = 0x4454_5331;

/// Wire format version. A receiver seeing an unknown version drops the
/// connection rather than guess.
pub const WIRE_VERSION: u8 = 1;

/// Set on `msg_type` for response and stream frames flowing server → client.
pub const RESPONSE_BIT: u8 = 0x80;

/// Header flag bit: this frame ends a server stream (the EOF frame).
pub const FLAG_EOS: u8 = 0b0000_0001;

/// Upper bound on payload size a receiver will accept.
pub const MAX_PAYLOAD: u32 = 4 * 1024 * 1024;

// ── Frame header ──────────────────────────────────────────────────────────────

/// Fixed preamble of every dts frame.
///
/// Wire size: 20 bytes. All multi-byte fields are little-endian (native for
/// every deployment target; the assert below pins the layout, not the
/// endianness — peers are same-architecture by contract).
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Always [`FRAME_MAGIC`]. Anything else poisons the connection.
    pub magic: u32,

    /// Payload length in bytes, not including this header.
    pub length: u32,

    /// Correlates a response (and every stream frame) with its request.
    /// Chosen by the caller; unique per connection while the call is live.
    pub call_id: u64,

    /// [`MsgType`] discriminant; responses carry the request discriminant
    /// with [`RESPONSE_BIT`] set.
    pub msg_type: u8,

    /// [`StatusCode`] discriminant. Meaningful on responses and stream
    /// trailers; zero on requests.
    pub status: u8,

    /// Bit flags, see [`FLAG_EOS`]. Remaining bits must be zero.
    pub flags: u8,

    /// Always [`WIRE_VERSION`].
    pub version: u8,
}

// Compile-time size guard. If this fails, the wire format silently changed.
assert_eq_size!(FrameHeader, [u8; 20]);

impl FrameHeader {
    pub fn request(msg_type: MsgType, call_id: u64, length: u32) -> Self {
        Self {
            magic: FRAME_MAGIC,
            length,
            call_id,
            msg_type: msg_type as u8,
            status: 0,
            flags: 0,
            version: WIRE_VERSION,
        }
    }

    pub fn response(msg_type: MsgType, call_id: u64, status: StatusCode, length: u32) -> Self {
        Self {
            magic: FRAME_MAGIC,
            length,
            call_id,
            msg_type: msg_type as u8 | RESPONSE_BIT,
            status: status as u8,
            flags: 0,
            version: WIRE_VERSION,
        }
    }

    pub fn is_response(&self) -> bool {
        self.msg_type & RESPONSE_BIT != 0
    }

    pub fn op(&self) -> Option<MsgType> {
        MsgType::from_u8(self.msg_type & !RESPONSE_BIT)
    }
}

// ── Operations ────────────────────────────────────────────────────────────────

/// The four RPC operations of the task service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Unary: Task → TaskResponse.
    SubmitTask = 1,
    /// Unary: task_id → bool.
    CancelTask = 2,
    /// Unary: task_id → Task.
    QueryStatus = 3,
    /// Server-streaming: client_id → stream of Task.
    ListenResults = 4,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::SubmitTask),
            2 => Some(Self::CancelTask),
            3 => Some(Self::QueryStatus),
            4 => Some(Self::ListenResults),
            _ => None,
        }
    }

    pub const ALL: [MsgType; 4] = [
        Self::SubmitTask,
        Self::CancelTask,
        Self::QueryStatus,
        Self::ListenResults,
    ];
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Terminal status of an RPC, carried in response headers and trailers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Internal = 2,
    Unavailable = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    Unimplemented = 6,
}

impl StatusCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Cancelled),
            2 => Some(Self::Internal),
            3 => Some(Self::Unavailable),
            4 => Some(Self::DeadlineExceeded),
            5 => Some(Self::NotFound),
            6 => Some(Self::Unimplemented),
            _ => None,
        }
    }
}

/// Status code plus human-readable detail.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}
