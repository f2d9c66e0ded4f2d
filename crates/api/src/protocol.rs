//! Weft wire protocol types.
//!
//! The peer protocol is framed, message-oriented, and multiplexed over a
//! single TLS stream per peer. A frame on the wire is a 4-byte big-endian
//! length followed by a prost-encoded [Envelope]; the envelope carries the
//! message type tag, a compression flag, and the message payload. Large
//! payloads are deflate-compressed.
//!
//! Requests are correlated by a monotonically increasing per-connection
//! request id; responses may arrive out of order.

use crate::{
    BlockInfo, FileRecord, RepoId, WeftError, WeftResult, NodeId,
};
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

/// The ALPN protocol token negotiated on every peer connection.
pub const ALPN_TOKEN: &[u8] = b"weft/1.0";

/// The default peer port, applied to configured addresses without one.
pub const DEFAULT_PORT: u16 = 22000;

/// Hard ceiling on a single frame, enforced on read. A frame advertising
/// more than this is a protocol error.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Payloads at or above this size are deflate-compressed on the wire.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Message type tag carried by every [Envelope].
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    ::prost::Enumeration,
)]
#[repr(i32)]
pub enum MsgType {
    /// Not a valid message type.
    Unspecified = 0,
    /// First message in each direction: the repositories this node serves.
    ClusterConfig = 1,
    /// Full record list for one repository, replacing the sender's view.
    Index = 2,
    /// Incremental records since the sender's last send watermark.
    IndexUpdate = 3,
    /// Block read request.
    Request = 4,
    /// Reply to a [MsgType::Request].
    Response = 5,
    /// Keepalive probe.
    Ping = 6,
    /// Keepalive reply.
    Pong = 7,
    /// Graceful shutdown with a reason string.
    Close = 8,
}

/// The framing envelope every message travels in.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// The [MsgType] of the payload.
    #[prost(enumeration = "MsgType", tag = "1")]
    pub ty: i32,

    /// `true` if the payload bytes are deflate-compressed.
    #[prost(bool, tag = "2")]
    pub compressed: bool,

    /// The encoded message payload.
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
}

/// First message in each direction after the handshake: the repositories
/// this node serves and the per-repository peer lists.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterConfig {
    /// Implementation name, for log context only.
    #[prost(string, tag = "1")]
    pub client_name: String,

    /// Implementation version, for log context only.
    #[prost(string, tag = "2")]
    pub client_version: String,

    /// The repositories the sending node serves.
    #[prost(message, repeated, tag = "3")]
    pub repositories: Vec<RepoAnnounce>,
}

/// One repository entry within a [ClusterConfig].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RepoAnnounce {
    /// The repository id.
    #[prost(string, tag = "1")]
    pub id: String,

    /// NodeIds the sending node syncs this repository with.
    #[prost(string, repeated, tag = "2")]
    pub nodes: Vec<String>,
}

/// Payload of [MsgType::Index] and [MsgType::IndexUpdate]: the sending
/// node's records for one repository. An `Index` replaces the receiver's
/// whole view of the sender; an `IndexUpdate` merges into it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Index {
    /// The repository id.
    #[prost(string, tag = "1")]
    pub repo: String,

    /// The records.
    #[prost(message, repeated, tag = "2")]
    pub records: Vec<WireRecord>,
}

/// Wire form of a [FileRecord].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireRecord {
    /// Repository-relative path.
    #[prost(string, tag = "1")]
    pub name: String,

    /// Flag bitfield.
    #[prost(uint32, tag = "2")]
    pub flags: u32,

    /// Modification time, seconds since the unix epoch.
    #[prost(int64, tag = "3")]
    pub modified: i64,

    /// Originator-owned version counter.
    #[prost(uint64, tag = "4")]
    pub version: u64,

    /// Sender-scoped receive sequence.
    #[prost(uint64, tag = "5")]
    pub local_version: u64,

    /// Ordered block list.
    #[prost(message, repeated, tag = "6")]
    pub blocks: Vec<WireBlock>,
}

/// Wire form of a [BlockInfo].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireBlock {
    /// Byte offset within the file.
    #[prost(uint64, tag = "1")]
    pub offset: u64,

    /// Block length in bytes.
    #[prost(uint32, tag = "2")]
    pub size: u32,

    /// SHA-256 of the block contents.
    #[prost(bytes = "bytes", tag = "3")]
    pub hash: Bytes,
}

/// Block read request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    /// Per-connection correlation id, monotonically increasing.
    #[prost(uint32, tag = "1")]
    pub id: u32,

    /// The repository id.
    #[prost(string, tag = "2")]
    pub repo: String,

    /// Repository-relative path.
    #[prost(string, tag = "3")]
    pub name: String,

    /// Byte offset of the requested block.
    #[prost(uint64, tag = "4")]
    pub offset: u64,

    /// Length of the requested block.
    #[prost(uint32, tag = "5")]
    pub size: u32,
}

/// Error codes a [Response] may carry instead of data.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ResponseCode {
    /// The request succeeded and `data` holds the block.
    Ok = 0,
    /// The serving node hit a local error reading the block.
    GenericError = 1,
    /// The name is unknown, deleted, or not a regular file.
    NoSuchFile = 2,
    /// The `(offset, size)` does not match a block of the current local
    /// record for the name.
    InvalidRequest = 3,
}

/// Reply to a [Request].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    /// The correlation id of the request this replies to.
    #[prost(uint32, tag = "1")]
    pub id: u32,

    /// Outcome of the request.
    #[prost(enumeration = "ResponseCode", tag = "2")]
    pub code: i32,

    /// The block contents when `code` is [ResponseCode::Ok], empty
    /// otherwise.
    #[prost(bytes = "bytes", tag = "3")]
    pub data: Bytes,
}

/// Graceful connection shutdown.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Close {
    /// Human-readable reason.
    #[prost(string, tag = "1")]
    pub reason: String,
}

impl From<&FileRecord> for WireRecord {
    fn from(r: &FileRecord) -> Self {
        Self {
            name: r.name.clone(),
            flags: r.flags,
            modified: r.modified,
            version: r.version,
            local_version: r.local_version,
            blocks: r
                .blocks
                .iter()
                .map(|b| WireBlock {
                    offset: b.offset,
                    size: b.size,
                    hash: b.hash.clone(),
                })
                .collect(),
        }
    }
}

impl From<WireRecord> for FileRecord {
    fn from(r: WireRecord) -> Self {
        Self {
            name: r.name,
            flags: r.flags,
            modified: r.modified,
            version: r.version,
            local_version: r.local_version,
            blocks: r
                .blocks
                .into_iter()
                .map(|b| BlockInfo {
                    offset: b.offset,
                    size: b.size,
                    hash: b.hash,
                })
                .collect(),
        }
    }
}

impl Index {
    /// Build an index message from records.
    pub fn new<'a, I: IntoIterator<Item = &'a FileRecord>>(
        repo: &RepoId,
        records: I,
    ) -> Self {
        Self {
            repo: repo.to_string(),
            records: records.into_iter().map(Into::into).collect(),
        }
    }
}

impl RepoAnnounce {
    /// Build a repository announcement.
    pub fn new<'a, I: IntoIterator<Item = &'a NodeId>>(
        id: &RepoId,
        nodes: I,
    ) -> Self {
        Self {
            id: id.to_string(),
            nodes: nodes.into_iter().map(|n| n.to_string()).collect(),
        }
    }
}

/// Encode a message body. Infallible for in-memory buffers.
pub fn encode_message<M: Message>(msg: &M) -> Bytes {
    let mut out = BytesMut::new();
    msg.encode(&mut out).expect("failed to encode message");
    out.freeze()
}

/// Decode a message body received from a peer.
pub fn decode_message<M: Message + Default>(data: Bytes) -> WeftResult<M> {
    M::decode(data)
        .map_err(|e| WeftError::protocol(format!("malformed message: {e}")))
}

fn deflate(data: &[u8]) -> WeftResult<Vec<u8>> {
    use std::io::Read;
    let mut enc = flate2::read::DeflateEncoder::new(
        data,
        flate2::Compression::fast(),
    );
    let mut out = Vec::with_capacity(data.len() / 2);
    enc.read_to_end(&mut out)
        .map_err(|e| WeftError::other_src("deflate", e))?;
    Ok(out)
}

fn inflate(data: &[u8]) -> WeftResult<Vec<u8>> {
    use std::io::Read;
    let mut out = Vec::with_capacity(data.len() * 2);
    let dec = flate2::read::DeflateDecoder::new(data);
    dec.take(MAX_FRAME_LEN as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| {
            WeftError::protocol(format!("corrupt compressed payload: {e}"))
        })?;
    if out.len() > MAX_FRAME_LEN {
        return Err(WeftError::protocol("compressed payload too large"));
    }
    Ok(out)
}

impl Envelope {
    /// Wrap an encoded payload in an envelope, compressing it when it is
    /// large enough to be worth it.
    pub fn seal(ty: MsgType, payload: Bytes) -> WeftResult<Self> {
        if payload.len() >= COMPRESSION_THRESHOLD {
            Ok(Self {
                ty: ty as i32,
                compressed: true,
                payload: deflate(&payload)?.into(),
            })
        } else {
            Ok(Self {
                ty: ty as i32,
                compressed: false,
                payload,
            })
        }
    }

    /// Split an envelope into its message type and decompressed payload.
    pub fn open(self) -> WeftResult<(MsgType, Bytes)> {
        let ty = MsgType::try_from(self.ty).map_err(|_| {
            WeftError::protocol(format!("unknown message type {}", self.ty))
        })?;
        if ty == MsgType::Unspecified {
            return Err(WeftError::protocol("unspecified message type"));
        }
        let payload = if self.compressed {
            inflate(&self.payload)?.into()
        } else {
            self.payload
        };
        Ok((ty, payload))
    }

    /// Encode this envelope as a length-prefixed frame ready for the wire.
    pub fn to_frame(&self) -> WeftResult<Bytes> {
        let body_len = self.encoded_len();
        if body_len > MAX_FRAME_LEN {
            return Err(WeftError::other(format!(
                "frame of {body_len} bytes exceeds the frame ceiling"
            )));
        }
        let mut out = BytesMut::with_capacity(4 + body_len);
        out.put_u32(body_len as u32);
        self.encode(&mut out).expect("failed to encode envelope");
        Ok(out.freeze())
    }

    /// Decode an envelope from the body of a frame (length prefix already
    /// stripped).
    pub fn from_frame_body(body: Bytes) -> WeftResult<Self> {
        Self::decode(body)
            .map_err(|e| WeftError::protocol(format!("malformed frame: {e}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_payload_stays_uncompressed() {
        let env =
            Envelope::seal(MsgType::Ping, Bytes::from_static(b"x")).unwrap();
        assert!(!env.compressed);
        let (ty, payload) = env.open().unwrap();
        assert_eq!(MsgType::Ping, ty);
        assert_eq!(&b"x"[..], &payload[..]);
    }

    #[test]
    fn large_payload_round_trips_through_compression() {
        let payload = Bytes::from(vec![7u8; 8192]);
        let env = Envelope::seal(MsgType::Index, payload.clone()).unwrap();
        assert!(env.compressed);
        assert!(env.payload.len() < payload.len());
        let (ty, opened) = env.open().unwrap();
        assert_eq!(MsgType::Index, ty);
        assert_eq!(payload, opened);
    }

    #[test]
    fn frame_round_trip() {
        let env = Envelope::seal(
            MsgType::Close,
            encode_message(&Close {
                reason: "bye".into(),
            }),
        )
        .unwrap();
        let frame = env.to_frame().unwrap();

        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);

        let dec = Envelope::from_frame_body(frame.slice(4..)).unwrap();
        let (ty, payload) = dec.open().unwrap();
        assert_eq!(MsgType::Close, ty);
        let close: Close = decode_message(payload).unwrap();
        assert_eq!("bye", close.reason);
    }

    #[test]
    fn unknown_message_type_is_a_protocol_error() {
        let env = Envelope {
            ty: 99,
            compressed: false,
            payload: Bytes::new(),
        };
        assert!(env.open().unwrap_err().is_protocol());
    }

    #[test]
    fn record_round_trip_preserves_fields() {
        let rec = FileRecord {
            name: "dir/a.txt".into(),
            flags: 0o644,
            modified: 1_700_000_000,
            version: 42,
            local_version: 7,
            blocks: vec![crate::BlockInfo {
                offset: 0,
                size: 5,
                hash: Bytes::from_static(b"hash"),
            }],
        };
        let wire = WireRecord::from(&rec);
        let back = FileRecord::from(wire);
        assert_eq!(rec, back);
    }
}
