//! The fixed VIF control and data message set (spec §4.2, §6).
//!
//! `Message::read_from`/`Message::write_to` are the single framing pair for
//! every message exchanged over a VIF's underlying byte stream. The wire
//! format is `[tag: u8][body-len: u32 BE][body]`; the codec rejects bodies
//! over `MAX_FRAME_PAYLOAD` and rejects unknown tags.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type Vci = u32;
pub type FlowId = u32;

/// VC-IDs and Flow-IDs below this value are reserved (spec §3: Flow-ID 0 is
/// the shared/counter channel; VIF VC-IDs 0-1 are reserved).
pub const RESERVED_FLOW_ID: FlowId = 0;

/// Largest body a single message may carry. Larger frames are rejected as
/// `bad-protocol` before the body is even read off the wire.
pub const MAX_FRAME_PAYLOAD: u32 = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    #[error("carrier-msg: unexpected end of stream")]
    Eof,
    #[error("carrier-msg: frame of {0} bytes exceeds the {MAX_FRAME_PAYLOAD} byte limit")]
    FrameTooLarge(u32),
    #[error("carrier-msg: unknown message tag {0}")]
    UnknownTag(u8),
    #[error("carrier-msg: malformed message body: {0}")]
    Malformed(&'static str),
    #[error("carrier-msg: invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("carrier-msg: io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MsgError>;

/// A `(VC-ID, Flow-ID) -> bytes` credit map, carried by `OpenVc` and
/// `AddReceiveBuffers` (spec §4.2).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterMap(pub Vec<(Vci, FlowId, u64)>);

impl CounterMap {
    pub fn new() -> Self {
        CounterMap(Vec::new())
    }

    pub fn insert(&mut self, vci: Vci, flow_id: FlowId, credit: u64) {
        self.0.push((vci, flow_id, credit));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Vci, FlowId, u64)> {
        self.0.iter()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.0.len() as u32);
        for (vci, flow_id, credit) in &self.0 {
            buf.put_u32(*vci);
            buf.put_u32(*flow_id);
            buf.put_u64(*credit);
        }
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let count = get_u32(buf)? as usize;
        let mut out = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let vci = get_u32(buf)?;
            let flow_id = get_u32(buf)?;
            let credit = get_u64(buf)?;
            out.push((vci, flow_id, credit));
        }
        Ok(CounterMap(out))
    }
}

impl FromIterator<(Vci, FlowId, u64)> for CounterMap {
    fn from_iter<T: IntoIterator<Item = (Vci, FlowId, u64)>>(iter: T) -> Self {
        CounterMap(iter.into_iter().collect())
    }
}

/// The fixed VIF control and data message set (spec §4.2).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request to create a VC; `counters` seeds initial per-Flow credits.
    OpenVc {
        vci: Vci,
        local_ep: String,
        remote_ep: String,
        counters: CounterMap,
    },
    /// Tear down a VC; `error` is informational.
    CloseVc { vci: Vci, error: String },
    /// Carries encrypted bytes for one Flow; `close_flag` is the half-close
    /// marker.
    Data {
        vci: Vci,
        flow_id: FlowId,
        payload: Bytes,
        close_flag: bool,
    },
    /// Credit update: map of (VC, Flow) -> bytes added.
    AddReceiveBuffers { counters: CounterMap },
    /// Notification of a new Flow opened by the peer, with initial credit.
    OpenFlow {
        vci: Vci,
        flow_id: FlowId,
        initial_credit: u64,
    },
    /// First message on an accepted Flow: protocol version negotiation and
    /// the proxied-destination endpoint (if dialing through a proxy).
    Setup {
        min_version: u32,
        max_version: u32,
        peer_remote_endpoint: String,
    },
    /// "I am a proxy, keep this Flow open for back-channel."
    MultiProxyRequest,
    /// "I am a server, please assign me a public endpoint."
    ProxyServerRequest,
    /// Proxy's reply with the endpoints the requester should advertise.
    ProxyResponse { endpoints: Vec<String> },
}

const TAG_OPEN_VC: u8 = 1;
const TAG_CLOSE_VC: u8 = 2;
const TAG_DATA: u8 = 3;
const TAG_ADD_RECEIVE_BUFFERS: u8 = 4;
const TAG_OPEN_FLOW: u8 = 5;
const TAG_SETUP: u8 = 6;
const TAG_MULTI_PROXY_REQUEST: u8 = 7;
const TAG_PROXY_SERVER_REQUEST: u8 = 8;
const TAG_PROXY_RESPONSE: u8 = 9;

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_u32(buf: &mut impl Buf) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(MsgError::Malformed("truncated u32"));
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut impl Buf) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(MsgError::Malformed("truncated u64"));
    }
    Ok(buf.get_u64())
}

fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(MsgError::Malformed("truncated u8"));
    }
    Ok(buf.get_u8())
}

fn get_string(buf: &mut impl Buf) -> Result<String> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(MsgError::Malformed("truncated string"));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| MsgError::InvalidUtf8)
}

fn get_bytes(buf: &mut impl Buf) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(MsgError::Malformed("truncated payload"));
    }
    Ok(buf.copy_to_bytes(len))
}

impl Message {
    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Message::OpenVc {
                vci,
                local_ep,
                remote_ep,
                counters,
            } => {
                buf.put_u32(*vci);
                put_string(buf, local_ep);
                put_string(buf, remote_ep);
                counters.encode(buf);
            }
            Message::CloseVc { vci, error } => {
                buf.put_u32(*vci);
                put_string(buf, error);
            }
            Message::Data {
                vci,
                flow_id,
                payload,
                close_flag,
            } => {
                buf.put_u32(*vci);
                buf.put_u32(*flow_id);
                buf.put_u8(if *close_flag { 1 } else { 0 });
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Message::AddReceiveBuffers { counters } => counters.encode(buf),
            Message::OpenFlow {
                vci,
                flow_id,
                initial_credit,
            } => {
                buf.put_u32(*vci);
                buf.put_u32(*flow_id);
                buf.put_u64(*initial_credit);
            }
            Message::Setup {
                min_version,
                max_version,
                peer_remote_endpoint,
            } => {
                buf.put_u32(*min_version);
                buf.put_u32(*max_version);
                put_string(buf, peer_remote_endpoint);
            }
            Message::MultiProxyRequest | Message::ProxyServerRequest => {}
            Message::ProxyResponse { endpoints } => {
                buf.put_u32(endpoints.len() as u32);
                for ep in endpoints {
                    put_string(buf, ep);
                }
            }
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Message::OpenVc { .. } => TAG_OPEN_VC,
            Message::CloseVc { .. } => TAG_CLOSE_VC,
            Message::Data { .. } => TAG_DATA,
            Message::AddReceiveBuffers { .. } => TAG_ADD_RECEIVE_BUFFERS,
            Message::OpenFlow { .. } => TAG_OPEN_FLOW,
            Message::Setup { .. } => TAG_SETUP,
            Message::MultiProxyRequest => TAG_MULTI_PROXY_REQUEST,
            Message::ProxyServerRequest => TAG_PROXY_SERVER_REQUEST,
            Message::ProxyResponse { .. } => TAG_PROXY_RESPONSE,
        }
    }

    /// Synchronously frames the message into `[tag][len][body]`, for
    /// callers handing the bytes to a queue rather than a socket directly
    /// (the per-VC write loop does this before putting onto the VIF's
    /// shared output queue). Panics if the body would exceed
    /// `MAX_FRAME_PAYLOAD`; callers that coalesce `Data` payloads keep
    /// batches well under that cap.
    pub fn encode_frame(&self) -> Bytes {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);
        assert!(
            body.len() as u64 <= MAX_FRAME_PAYLOAD as u64,
            "message body of {} bytes exceeds the frame limit",
            body.len()
        );
        let mut framed = BytesMut::with_capacity(5 + body.len());
        framed.put_u8(self.tag());
        framed.put_u32(body.len() as u32);
        framed.extend_from_slice(&body);
        framed.freeze()
    }

    /// Serializes and writes a full framed message.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);
        if body.len() as u64 > MAX_FRAME_PAYLOAD as u64 {
            return Err(MsgError::FrameTooLarge(body.len() as u32));
        }
        let mut header = BytesMut::with_capacity(5);
        header.put_u8(self.tag());
        header.put_u32(body.len() as u32);
        writer.write_all(&header).await?;
        writer.write_all(&body).await?;
        Ok(())
    }

    /// Reads and parses one framed message, rejecting oversized frames and
    /// unknown tags.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
        let tag = reader.read_u8().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                MsgError::Eof
            } else {
                MsgError::Io(e)
            }
        })?;
        let len = reader.read_u32().await?;
        if len > MAX_FRAME_PAYLOAD {
            return Err(MsgError::FrameTooLarge(len));
        }
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        Self::parse(tag, &mut body.as_slice())
    }

    fn parse(tag: u8, buf: &mut impl Buf) -> Result<Message> {
        let msg = match tag {
            TAG_OPEN_VC => Message::OpenVc {
                vci: get_u32(buf)?,
                local_ep: get_string(buf)?,
                remote_ep: get_string(buf)?,
                counters: CounterMap::decode(buf)?,
            },
            TAG_CLOSE_VC => Message::CloseVc {
                vci: get_u32(buf)?,
                error: get_string(buf)?,
            },
            TAG_DATA => {
                let vci = get_u32(buf)?;
                let flow_id = get_u32(buf)?;
                let close_flag = get_u8(buf)? != 0;
                let payload = get_bytes(buf)?;
                Message::Data {
                    vci,
                    flow_id,
                    payload,
                    close_flag,
                }
            }
            TAG_ADD_RECEIVE_BUFFERS => Message::AddReceiveBuffers {
                counters: CounterMap::decode(buf)?,
            },
            TAG_OPEN_FLOW => Message::OpenFlow {
                vci: get_u32(buf)?,
                flow_id: get_u32(buf)?,
                initial_credit: get_u64(buf)?,
            },
            TAG_SETUP => Message::Setup {
                min_version: get_u32(buf)?,
                max_version: get_u32(buf)?,
                peer_remote_endpoint: get_string(buf)?,
            },
            TAG_MULTI_PROXY_REQUEST => Message::MultiProxyRequest,
            TAG_PROXY_SERVER_REQUEST => Message::ProxyServerRequest,
            TAG_PROXY_RESPONSE => {
                let count = get_u32(buf)? as usize;
                let mut endpoints = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    endpoints.push(get_string(buf)?);
                }
                Message::ProxyResponse { endpoints }
            }
            other => return Err(MsgError::UnknownTag(other)),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(msg: Message) {
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();
        let mut cursor = buf.as_slice();
        let decoded = Message::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn open_vc_round_trips() {
        let mut counters = CounterMap::new();
        counters.insert(2, 1, 65536);
        round_trip(Message::OpenVc {
            vci: 2,
            local_ep: "/@6@tcp@a:1@@6@6@@0@".into(),
            remote_ep: "/@6@tcp@b:2@@6@6@@0@".into(),
            counters,
        })
        .await;
    }

    #[tokio::test]
    async fn close_vc_round_trips() {
        round_trip(Message::CloseVc {
            vci: 5,
            error: "peer went away".into(),
        })
        .await;
    }

    #[tokio::test]
    async fn data_round_trips_including_empty_payload() {
        round_trip(Message::Data {
            vci: 2,
            flow_id: 7,
            payload: Bytes::from_static(b"hello"),
            close_flag: false,
        })
        .await;
        round_trip(Message::Data {
            vci: 2,
            flow_id: 7,
            payload: Bytes::new(),
            close_flag: true,
        })
        .await;
    }

    #[tokio::test]
    async fn add_receive_buffers_round_trips() {
        let mut counters = CounterMap::new();
        counters.insert(2, 1, 100);
        counters.insert(2, 2, 200);
        round_trip(Message::AddReceiveBuffers { counters }).await;
    }

    #[tokio::test]
    async fn open_flow_round_trips() {
        round_trip(Message::OpenFlow {
            vci: 2,
            flow_id: 9,
            initial_credit: 4096,
        })
        .await;
    }

    #[tokio::test]
    async fn setup_round_trips() {
        round_trip(Message::Setup {
            min_version: 3,
            max_version: 6,
            peer_remote_endpoint: "/@6@tcp@c:3@@6@6@@0@".into(),
        })
        .await;
    }

    #[tokio::test]
    async fn proxy_messages_round_trip() {
        round_trip(Message::MultiProxyRequest).await;
        round_trip(Message::ProxyServerRequest).await;
        round_trip(Message::ProxyResponse {
            endpoints: vec!["/@6@tcp@a:1@@6@6@@0@".into()],
        })
        .await;
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.push(TAG_DATA);
        buf.extend_from_slice(&(MAX_FRAME_PAYLOAD + 1).to_be_bytes());
        let mut cursor = buf.as_slice();
        let err = Message::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MsgError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let mut buf = Vec::new();
        buf.push(200);
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut cursor = buf.as_slice();
        let err = Message::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MsgError::UnknownTag(200)));
    }

    #[tokio::test]
    async fn encode_frame_matches_write_to() {
        let msg = Message::OpenFlow {
            vci: 4,
            flow_id: 2,
            initial_credit: 1024,
        };
        let framed = msg.encode_frame();
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();
        assert_eq!(&framed[..], &buf[..]);
    }

    #[tokio::test]
    async fn truncated_stream_is_eof() {
        let buf: Vec<u8> = Vec::new();
        let mut cursor = buf.as_slice();
        let err = Message::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MsgError::Eof));
    }
}
