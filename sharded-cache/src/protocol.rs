//! Wire protocol shared by every socket in the cluster.
//!
//! Each message travels as one frame:
//!
//! ```text
//! [payload_size: u32 BE][message_type: u32 BE][payload_len: u32 BE][payload]
//! ```
//!
//! where `payload_size = 8 + payload_len`. A receiver reads the size prefix,
//! then exactly `payload_size` more bytes. All integers are big-endian.
//!
//! [`Frame`] is the raw tagged payload; [`Message`] is the typed view the
//! servers dispatch on. Conversions between them are exhaustive, so an
//! unknown tag surfaces as [`ProtocolError::UnknownType`] instead of a
//! default match arm.

use std::fmt;
use std::io::{self, Read, Write};

use thiserror::Error;

use crate::hashing::ShardId;

/// Largest `payload_size` a receiver will accept.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("frame size {size} does not match payload length {payload_len}")]
    SizeMismatch { size: usize, payload_len: usize },
    #[error("{msg_type} payload truncated: needed {needed} more bytes, {remaining} left")]
    Truncated {
        msg_type: MessageType,
        needed: usize,
        remaining: usize,
    },
    #[error("{0} payload has trailing bytes")]
    TrailingBytes(MessageType),
    #[error("{0} payload is missing its NUL terminator")]
    MissingNul(MessageType),
    #[error("{0} payload contains invalid utf-8")]
    InvalidUtf8(MessageType),
    #[error("unknown discover operation {0:?}")]
    BadOperation([u8; 4]),
}

/// Numeric tag carried in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Error = 0,
    MasterRegister = 1,
    MasterRegisterAck = 2,
    FollowerRegister = 3,
    FollowerRegisterAck = 4,
    MasterHeartbeat = 5,
    FollowerHeartbeat = 6,
    ClientDiscover = 7,
    DiscoverAck = 8,
    ClientGet = 9,
    GetAck = 10,
    ClientPut = 11,
    FollowerConnect = 12,
    Replicate = 13,
    Promote = 14,
    Redirect = 15,
}

impl MessageType {
    pub fn from_tag(tag: u32) -> Result<Self, ProtocolError> {
        Ok(match tag {
            0 => MessageType::Error,
            1 => MessageType::MasterRegister,
            2 => MessageType::MasterRegisterAck,
            3 => MessageType::FollowerRegister,
            4 => MessageType::FollowerRegisterAck,
            5 => MessageType::MasterHeartbeat,
            6 => MessageType::FollowerHeartbeat,
            7 => MessageType::ClientDiscover,
            8 => MessageType::DiscoverAck,
            9 => MessageType::ClientGet,
            10 => MessageType::GetAck,
            11 => MessageType::ClientPut,
            12 => MessageType::FollowerConnect,
            13 => MessageType::Replicate,
            14 => MessageType::Promote,
            15 => MessageType::Redirect,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A raw frame: message tag plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serializes the frame including its `payload_size` prefix.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload.len();
        let mut buf = Vec::with_capacity(4 + HEADER_LEN + payload_len);
        buf.extend_from_slice(&((HEADER_LEN + payload_len) as u32).to_be_bytes());
        buf.extend_from_slice(&(self.msg_type as u32).to_be_bytes());
        buf.extend_from_slice(&(payload_len as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses the bytes that follow the size prefix.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < HEADER_LEN {
            return Err(ProtocolError::SizeMismatch {
                size: body.len(),
                payload_len: 0,
            });
        }
        let tag = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let payload_len = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
        if body.len() != HEADER_LEN + payload_len {
            return Err(ProtocolError::SizeMismatch {
                size: body.len(),
                payload_len,
            });
        }
        Ok(Self {
            msg_type: MessageType::from_tag(tag)?,
            payload: body[HEADER_LEN..].to_vec(),
        })
    }
}

/// Which kind of request a discovery is routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Put,
}

impl Operation {
    fn tag(self) -> &'static [u8; 4] {
        match self {
            Operation::Get => b"get ",
            Operation::Put => b"put ",
        }
    }

    fn from_tag(tag: [u8; 4]) -> Result<Self, ProtocolError> {
        match &tag {
            b"get " => Ok(Operation::Get),
            b"put " => Ok(Operation::Put),
            _ => Err(ProtocolError::BadOperation(tag)),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Get => f.write_str("get"),
            Operation::Put => f.write_str("put"),
        }
    }
}

/// Every message exchanged between clients, shards and the configuration
/// service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Error {
        reason: String,
    },
    MasterRegister {
        port: u16,
    },
    MasterRegisterAck {
        id: ShardId,
    },
    FollowerRegister {
        port: u16,
    },
    FollowerRegisterAck {
        master_id: ShardId,
        slot: u32,
        master_addr: String,
        master_port: u16,
    },
    MasterHeartbeat {
        id: ShardId,
    },
    FollowerHeartbeat {
        master_id: ShardId,
        slot: u32,
    },
    /// The key travels NUL-terminated, so it cannot itself contain a NUL.
    ClientDiscover {
        op: Operation,
        key: String,
    },
    DiscoverAck {
        addr: String,
        port: u16,
    },
    /// Same key encoding as `ClientDiscover`.
    ClientGet {
        key: String,
    },
    GetAck {
        value: Option<i32>,
    },
    ClientPut {
        key: String,
        value: i32,
    },
    /// `Some(port)` announces a follower; `None` is the master's acceptance.
    FollowerConnect {
        port: Option<u16>,
    },
    Replicate {
        key: String,
        value: i32,
    },
    Promote,
    Redirect {
        addr: String,
        port: u16,
    },
}

impl Message {
    pub fn error(reason: impl Into<String>) -> Self {
        Message::Error {
            reason: reason.into(),
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Error { .. } => MessageType::Error,
            Message::MasterRegister { .. } => MessageType::MasterRegister,
            Message::MasterRegisterAck { .. } => MessageType::MasterRegisterAck,
            Message::FollowerRegister { .. } => MessageType::FollowerRegister,
            Message::FollowerRegisterAck { .. } => MessageType::FollowerRegisterAck,
            Message::MasterHeartbeat { .. } => MessageType::MasterHeartbeat,
            Message::FollowerHeartbeat { .. } => MessageType::FollowerHeartbeat,
            Message::ClientDiscover { .. } => MessageType::ClientDiscover,
            Message::DiscoverAck { .. } => MessageType::DiscoverAck,
            Message::ClientGet { .. } => MessageType::ClientGet,
            Message::GetAck { .. } => MessageType::GetAck,
            Message::ClientPut { .. } => MessageType::ClientPut,
            Message::FollowerConnect { .. } => MessageType::FollowerConnect,
            Message::Replicate { .. } => MessageType::Replicate,
            Message::Promote => MessageType::Promote,
            Message::Redirect { .. } => MessageType::Redirect,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::new();
        match self {
            Message::Error { reason } => put_nul_string(&mut payload, reason),
            Message::MasterRegister { port } | Message::FollowerRegister { port } => {
                payload.extend_from_slice(&port.to_be_bytes());
            }
            Message::MasterRegisterAck { id } | Message::MasterHeartbeat { id } => {
                payload.extend_from_slice(&id.to_be_bytes());
            }
            Message::FollowerRegisterAck {
                master_id,
                slot,
                master_addr,
                master_port,
            } => {
                payload.extend_from_slice(&master_id.to_be_bytes());
                payload.extend_from_slice(&slot.to_be_bytes());
                put_addr_port(&mut payload, master_addr, *master_port);
            }
            Message::FollowerHeartbeat { master_id, slot } => {
                payload.extend_from_slice(&master_id.to_be_bytes());
                payload.extend_from_slice(&slot.to_be_bytes());
            }
            Message::ClientDiscover { op, key } => {
                payload.extend_from_slice(op.tag());
                put_nul_string(&mut payload, key);
            }
            Message::DiscoverAck { addr, port } | Message::Redirect { addr, port } => {
                put_addr_port(&mut payload, addr, *port);
            }
            Message::ClientGet { key } => put_nul_string(&mut payload, key),
            Message::GetAck { value } => {
                if let Some(value) = value {
                    payload.extend_from_slice(&value.to_be_bytes());
                }
            }
            Message::ClientPut { key, value } | Message::Replicate { key, value } => {
                payload.extend_from_slice(&(key.len() as u32).to_be_bytes());
                payload.extend_from_slice(key.as_bytes());
                payload.extend_from_slice(&value.to_be_bytes());
            }
            Message::FollowerConnect { port } => {
                if let Some(port) = port {
                    payload.extend_from_slice(&port.to_be_bytes());
                }
            }
            Message::Promote => {}
        }
        Frame {
            msg_type: self.msg_type(),
            payload,
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(frame.msg_type, &frame.payload);
        let message = match frame.msg_type {
            MessageType::Error => {
                // Tolerate a missing terminator so foreign error strings still surface.
                let bytes = r.rest();
                let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
                Message::Error {
                    reason: String::from_utf8_lossy(bytes).into_owned(),
                }
            }
            MessageType::MasterRegister => Message::MasterRegister { port: r.u16()? },
            MessageType::MasterRegisterAck => Message::MasterRegisterAck { id: r.u32()? },
            MessageType::FollowerRegister => Message::FollowerRegister { port: r.u16()? },
            MessageType::FollowerRegisterAck => Message::FollowerRegisterAck {
                master_id: r.u32()?,
                slot: r.u32()?,
                master_addr: r.len_prefixed_string()?,
                master_port: r.u16()?,
            },
            MessageType::MasterHeartbeat => Message::MasterHeartbeat { id: r.u32()? },
            MessageType::FollowerHeartbeat => Message::FollowerHeartbeat {
                master_id: r.u32()?,
                slot: r.u32()?,
            },
            MessageType::ClientDiscover => {
                let tag = r.take(4)?;
                Message::ClientDiscover {
                    op: Operation::from_tag([tag[0], tag[1], tag[2], tag[3]])?,
                    key: r.nul_string()?,
                }
            }
            MessageType::DiscoverAck => Message::DiscoverAck {
                addr: r.len_prefixed_string()?,
                port: r.u16()?,
            },
            MessageType::ClientGet => Message::ClientGet {
                key: r.nul_string()?,
            },
            MessageType::GetAck => Message::GetAck {
                value: if r.is_empty() { None } else { Some(r.i32()?) },
            },
            MessageType::ClientPut => Message::ClientPut {
                key: r.len_prefixed_string()?,
                value: r.i32()?,
            },
            MessageType::FollowerConnect => Message::FollowerConnect {
                port: if r.is_empty() { None } else { Some(r.u16()?) },
            },
            MessageType::Replicate => Message::Replicate {
                key: r.len_prefixed_string()?,
                value: r.i32()?,
            },
            MessageType::Promote => Message::Promote,
            MessageType::Redirect => Message::Redirect {
                addr: r.len_prefixed_string()?,
                port: r.u16()?,
            },
        };
        r.finish()?;
        Ok(message)
    }
}

fn put_nul_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn put_addr_port(buf: &mut Vec<u8>, addr: &str, port: u16) {
    buf.extend_from_slice(&(addr.len() as u32).to_be_bytes());
    buf.extend_from_slice(addr.as_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
}

struct PayloadReader<'a> {
    msg_type: MessageType,
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(msg_type: MessageType, buf: &'a [u8]) -> Self {
        Self { msg_type, buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated {
                msg_type: self.msg_type,
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn utf8(&self, bytes: &[u8]) -> Result<String, ProtocolError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(self.msg_type))
    }

    fn len_prefixed_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        self.utf8(bytes)
    }

    fn nul_string(&mut self) -> Result<String, ProtocolError> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::MissingNul(self.msg_type))?;
        let bytes = self.take(end + 1)?;
        self.utf8(&bytes[..end])
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes(self.msg_type))
        }
    }
}

/// Reads one framed message.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before sending
/// a size prefix.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    let mut size_buf = [0u8; 4];
    let mut filled = 0;
    while filled < size_buf.len() {
        match reader.read(&mut size_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let size = u32::from_be_bytes(size_buf) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(size));
    }
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body)?;
    let frame = Frame::decode(&body)?;
    Message::from_frame(&frame).map(Some)
}

/// Writes one framed message and flushes the writer.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    writer.write_all(&message.to_frame().encode())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn every_message() -> Vec<Message> {
        vec![
            Message::error("registry full"),
            Message::error(""),
            Message::MasterRegister { port: 6969 },
            Message::MasterRegisterAck { id: 0x7fff_0001 },
            Message::FollowerRegister { port: 7000 },
            Message::FollowerRegisterAck {
                master_id: 42,
                slot: 2,
                master_addr: "127.0.0.1".into(),
                master_port: 6969,
            },
            Message::MasterHeartbeat { id: 9 },
            Message::FollowerHeartbeat {
                master_id: 9,
                slot: 1,
            },
            Message::ClientDiscover {
                op: Operation::Get,
                key: "apple".into(),
            },
            Message::ClientDiscover {
                op: Operation::Put,
                key: String::new(),
            },
            Message::DiscoverAck {
                addr: "10.0.0.7".into(),
                port: 1,
            },
            Message::ClientGet { key: "k".into() },
            Message::GetAck { value: None },
            Message::GetAck { value: Some(-17) },
            Message::ClientPut {
                key: "k".into(),
                value: i32::MAX,
            },
            Message::FollowerConnect { port: Some(7001) },
            Message::FollowerConnect { port: None },
            Message::Replicate {
                key: "ключ".into(),
                value: i32::MIN,
            },
            Message::Promote,
            Message::Redirect {
                addr: "localhost".into(),
                port: 9000,
            },
        ]
    }

    #[test]
    fn every_message_survives_the_wire() {
        let mut wire = Vec::new();
        for message in every_message() {
            write_message(&mut wire, &message).expect("write");
        }

        let mut reader = Cursor::new(wire);
        for expected in every_message() {
            let decoded = read_message(&mut reader).expect("read").expect("message");
            assert_eq!(decoded, expected);
        }
        assert!(read_message(&mut reader).expect("eof").is_none());
    }

    #[test]
    fn client_put_layout_matches_the_wire_format() {
        let encoded = Message::ClientPut {
            key: "ab".into(),
            value: 258,
        }
        .to_frame()
        .encode();

        let expected: Vec<u8> = [
            &18u32.to_be_bytes()[..], // 8 + payload_len
            &11u32.to_be_bytes(),     // ClientPut
            &10u32.to_be_bytes(),     // payload_len
            &2u32.to_be_bytes(),
            b"ab",
            &258i32.to_be_bytes(),
        ]
        .concat();
        assert_eq!(encoded, expected);
    }

    #[test]
    fn empty_payloads_keep_their_type() {
        for message in [Message::Promote, Message::GetAck { value: None }] {
            let frame = message.to_frame();
            assert!(frame.payload.is_empty());
            let encoded = frame.encode();
            assert_eq!(&encoded[..4], &8u32.to_be_bytes());
            assert_eq!(Frame::decode(&encoded[4..]).expect("decode"), frame);
        }
    }

    #[test]
    fn discover_payload_carries_operation_tag_and_nul() {
        let frame = Message::ClientDiscover {
            op: Operation::Put,
            key: "x".into(),
        }
        .to_frame();
        assert_eq!(frame.payload, b"put x\0");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&99u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            Frame::decode(&body),
            Err(ProtocolError::UnknownType(99))
        ));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&(MessageType::Promote as u32).to_be_bytes());
        body.extend_from_slice(&3u32.to_be_bytes());
        body.push(1);
        assert!(matches!(
            Frame::decode(&body),
            Err(ProtocolError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        let frame = Frame {
            msg_type: MessageType::MasterRegisterAck,
            payload: vec![0, 1],
        };
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::Truncated { needed: 4, remaining: 2, .. })
        ));
    }

    #[test]
    fn get_key_without_terminator_is_rejected() {
        let frame = Frame {
            msg_type: MessageType::ClientGet,
            payload: b"abc".to_vec(),
        };
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::MissingNul(MessageType::ClientGet))
        ));
    }

    #[test]
    fn bad_operation_tag_is_rejected() {
        let frame = Frame {
            msg_type: MessageType::ClientDiscover,
            payload: b"del k\0".to_vec(),
        };
        assert!(matches!(
            Message::from_frame(&frame),
            Err(ProtocolError::BadOperation(_))
        ));
    }

    #[test]
    fn oversized_frames_are_refused_before_allocating() {
        let wire = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        assert!(matches!(
            read_message(&mut Cursor::new(wire)),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn stream_cut_mid_frame_is_an_error() {
        let mut wire = Message::ClientGet { key: "key".into() }.to_frame().encode();
        wire.truncate(wire.len() - 2);
        assert!(matches!(
            read_message(&mut Cursor::new(wire)),
            Err(ProtocolError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof
        ));
    }
}
