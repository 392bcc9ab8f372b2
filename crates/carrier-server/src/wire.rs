//! The RPC request/response envelopes and their framing over a Flow (spec
//! §6 "RPC request/response header"). This is the engine's own wire
//! format, distinct from the application *value* codec (spec §1, out of
//! scope): positional arguments and results travel as opaque byte blobs,
//! already encoded by whatever the application's codec produced, and this
//! crate never looks inside them.

use carrier_endpoint::{CarrierError, ErrorKind};
use serde::{Deserialize, Serialize};

/// First message on an accepted Flow (spec §6 "RPC request header").
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    pub suffix: String,
    pub timeout_ms: Option<u64>,
    pub granted_blessings: Vec<u8>,
    pub discharges: Vec<Vec<u8>>,
    pub trace: Option<TraceRecord>,
    pub args: Vec<Vec<u8>>,
}

/// Reply to a `RequestEnvelope` (spec §6 "RPC response header").
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub error: Option<WireError>,
    pub end_of_stream: bool,
    pub results: Vec<Vec<u8>>,
    pub trace: Option<TraceRecord>,
}

/// A minimal trace-propagation record (spec §6); carried through but not
/// otherwise interpreted by this crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: u64,
    pub span_id: u64,
}

/// `CarrierError` flattened for the wire: `ErrorKind` doesn't derive
/// `serde` (it's shared across crates that don't otherwise need it), so
/// this crate owns the numeric mapping at its one serialization boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: u8,
    pub message: String,
    pub suffix: Option<String>,
    pub method: Option<String>,
}

impl From<CarrierError> for WireError {
    fn from(e: CarrierError) -> Self {
        WireError {
            kind: kind_to_wire(e.kind()),
            message: e.message,
            suffix: e.suffix,
            method: e.method,
        }
    }
}

impl From<WireError> for CarrierError {
    fn from(w: WireError) -> Self {
        let mut e = CarrierError::new(wire_to_kind(w.kind), w.message);
        e.suffix = w.suffix;
        e.method = w.method;
        e
    }
}

fn kind_to_wire(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Cancelled => 0,
        ErrorKind::Timeout => 1,
        ErrorKind::NoAccess => 2,
        ErrorKind::NoSuchName => 3,
        ErrorKind::NoSuchMethod => 4,
        ErrorKind::NoSuchSuffix => 5,
        ErrorKind::BadProtocol => 6,
        ErrorKind::Aborted => 7,
        ErrorKind::BadArg => 8,
        ErrorKind::Unknown => 9,
    }
}

fn wire_to_kind(tag: u8) -> ErrorKind {
    match tag {
        0 => ErrorKind::Cancelled,
        1 => ErrorKind::Timeout,
        2 => ErrorKind::NoAccess,
        3 => ErrorKind::NoSuchName,
        4 => ErrorKind::NoSuchMethod,
        5 => ErrorKind::NoSuchSuffix,
        6 => ErrorKind::BadProtocol,
        7 => ErrorKind::Aborted,
        8 => ErrorKind::BadArg,
        _ => ErrorKind::Unknown,
    }
}

/// A single item (or the close-send marker) on an already-open call,
/// carried after the initial `RequestEnvelope`/`ResponseEnvelope` (spec
/// §4.8 point 7 "the flowServer provides Send/Recv that encode/decode
/// items through the codec").
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamFrame {
    pub item: Option<Vec<u8>>,
    pub close_send: bool,
}

/// Everything the server writes to a Flow from the point it starts
/// invoking a method onward: zero or more streamed-out items
/// (`MethodStream::send`) interleaved with exactly one terminal
/// `ResponseEnvelope` (spec §4.8 point 7-8). Tagged so the client side can
/// tell a mid-stream item from the final response without knowing the
/// item count in advance.
#[derive(Debug, Serialize, Deserialize)]
pub enum ResultFrame {
    Item(Vec<u8>),
    Final(ResponseEnvelope),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WireCodecError {
    #[error("failed to encode rpc envelope: {0}")]
    Encode(String),
    #[error("failed to decode rpc envelope: {0}")]
    Decode(String),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireCodecError> {
    postcard::to_allocvec(value).map_err(|e| WireCodecError::Encode(e.to_string()))
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, WireCodecError> {
    postcard::from_bytes(bytes).map_err(|e| WireCodecError::Decode(e.to_string()))
}
