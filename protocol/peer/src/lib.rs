//! Binary protocol spoken between cluster peers.
//!
//! Every frame is little-endian and length-prefixed:
//!
//! ```text
//! [0..4)  payload length, including the 2-byte code
//! [4..6)  message code
//! [6..)   message body (code-specific)
//! ```
//!
//! A reader therefore consumes exactly `payload_length + 4` bytes per frame.
//! Strings inside bodies carry a `u16` length prefix; a trailing byte blob
//! (a stored value) runs to the end of the body.
//!
//! # Example
//!
//! ```
//! use protocol_peer::Message;
//! use bytes::BytesMut;
//!
//! let mut buf = BytesMut::new();
//! Message::Ping.encode(&mut buf);
//!
//! let (message, consumed) = Message::parse(&buf).unwrap();
//! assert_eq!(message, Message::Ping);
//! assert_eq!(consumed, buf.len());
//! ```

use bytes::{Buf, BufMut, BytesMut};

/// Fixed frame header size: `u32` length plus `u16` code.
pub const HEADER_SIZE: usize = 6;

/// Upper bound on a frame body; larger advertised lengths are rejected so a
/// corrupt header cannot trigger an unbounded read.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Node is a full cluster member.
pub const MODE_ACTIVE: u8 = 0;
/// Node is a client-style participant that refuses passive-passive links.
pub const MODE_PASSIVE: u8 = 1;

/// Message codes as they appear on the wire.
pub mod code {
    pub const VERIFY: u16 = 1;
    pub const VERIFY_OK: u16 = 2;
    pub const PING: u16 = 3;
    pub const PONG: u16 = 4;
    pub const SYNC_REQ: u16 = 5;
    pub const SYNC_RSP: u16 = 6;
    pub const PUT: u16 = 7;
    pub const DEL: u16 = 8;
    pub const GET_REQ: u16 = 9;
    pub const GET_RSP: u16 = 10;
}

/// Parse error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    #[error("incomplete frame")]
    Incomplete,
    /// Body does not match the schema for its code.
    #[error("invalid message body")]
    Invalid,
    /// Code field does not name a known message.
    #[error("unknown message code {0}")]
    UnknownCode(u16),
    /// Advertised body length exceeds [`MAX_BODY_SIZE`].
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

/// A peer advertised in a topology sync response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedPeer {
    /// Peer id; empty when only the address is known.
    pub id: String,
    /// `host:port` of the peer's listener.
    pub ip_address: String,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake: the sender introduces itself.
    Verify {
        /// Sender's node id.
        id: String,
        /// Port the sender's listener accepts peers on.
        service_port: String,
        /// Sender's mode ([`MODE_ACTIVE`] or [`MODE_PASSIVE`]).
        mode: u8,
    },
    /// Handshake acknowledged.
    VerifyOk,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Ask the peer for its peer list.
    SyncReq {
        /// Requester's mode; passive peers are filtered for passive askers.
        mode: u8,
    },
    /// Peer list reply.
    SyncRsp {
        /// The responder's replication factor.
        replication_factor: u8,
        /// Known peers, excluding the asker.
        peers: Vec<ProposedPeer>,
    },
    /// Replicated write.
    Put {
        /// Entry key.
        key: String,
        /// Absolute expiry epoch second; 0 means no expiry.
        expiry: u64,
        /// Entry value.
        value: Vec<u8>,
    },
    /// Replicated delete.
    Del {
        /// Entry key.
        key: String,
    },
    /// Cross-peer read request.
    GetReq {
        /// Entry key to look up on the receiver.
        key: String,
        /// Opaque request tag echoed back in the response.
        pending_key: String,
    },
    /// Cross-peer read reply; an empty value signals a miss.
    GetRsp {
        /// Request tag from the matching [`Message::GetReq`].
        pending_key: String,
        /// Entry value, or empty on miss.
        value: Vec<u8>,
    },
}

impl Message {
    /// Wire code for this message.
    pub fn code(&self) -> u16 {
        match self {
            Message::Verify { .. } => code::VERIFY,
            Message::VerifyOk => code::VERIFY_OK,
            Message::Ping => code::PING,
            Message::Pong => code::PONG,
            Message::SyncReq { .. } => code::SYNC_REQ,
            Message::SyncRsp { .. } => code::SYNC_RSP,
            Message::Put { .. } => code::PUT,
            Message::Del { .. } => code::DEL,
            Message::GetReq { .. } => code::GET_REQ,
            Message::GetRsp { .. } => code::GET_RSP,
        }
    }

    /// Human-readable name for a wire code, for logging.
    pub fn code_name(code: u16) -> &'static str {
        match code {
            code::VERIFY => "VERIFY",
            code::VERIFY_OK => "VERIFY_OK",
            code::PING => "PING",
            code::PONG => "PONG",
            code::SYNC_REQ => "SYNC_REQ",
            code::SYNC_RSP => "SYNC_RSP",
            code::PUT => "PUT",
            code::DEL => "DEL",
            code::GET_REQ => "GET_REQ",
            code::GET_RSP => "GET_RSP",
            _ => "UNKNOWN",
        }
    }

    /// Encode a full frame (header plus body) into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);
        buf.reserve(HEADER_SIZE + body.len());
        buf.put_u32_le((body.len() + 2) as u32);
        buf.put_u16_le(self.code());
        buf.put_slice(&body);
    }

    /// Parse one frame from the front of `data`.
    ///
    /// Returns the message and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Message, usize), ParseError> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::Incomplete);
        }
        let payload = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        if payload < 2 {
            return Err(ParseError::Invalid);
        }
        let body_len = payload - 2;
        if body_len > MAX_BODY_SIZE {
            return Err(ParseError::TooLarge(body_len));
        }
        let total = 4 + payload;
        if data.len() < total {
            return Err(ParseError::Incomplete);
        }
        let code = u16::from_le_bytes(data[4..6].try_into().unwrap());
        let message = Self::decode_body(code, &data[HEADER_SIZE..total])?;
        Ok((message, total))
    }

    /// Decode a message body for `code`, as read by a reader that framed the
    /// stream itself.
    pub fn decode_body(code: u16, body: &[u8]) -> Result<Message, ParseError> {
        let mut buf = body;
        let message = match code {
            code::VERIFY => {
                let id = get_string(&mut buf)?;
                let service_port = get_string(&mut buf)?;
                let mode = get_u8(&mut buf)?;
                Message::Verify {
                    id,
                    service_port,
                    mode,
                }
            }
            code::VERIFY_OK => Message::VerifyOk,
            code::PING => Message::Ping,
            code::PONG => Message::Pong,
            code::SYNC_REQ => {
                let mode = get_u8(&mut buf)?;
                Message::SyncReq { mode }
            }
            code::SYNC_RSP => {
                let replication_factor = get_u8(&mut buf)?;
                if buf.remaining() < 2 {
                    return Err(ParseError::Invalid);
                }
                let count = buf.get_u16_le() as usize;
                let mut peers = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let id = get_string(&mut buf)?;
                    let ip_address = get_string(&mut buf)?;
                    peers.push(ProposedPeer { id, ip_address });
                }
                Message::SyncRsp {
                    replication_factor,
                    peers,
                }
            }
            code::PUT => {
                let key = get_string(&mut buf)?;
                if buf.remaining() < 8 {
                    return Err(ParseError::Invalid);
                }
                let expiry = buf.get_u64_le();
                let value = buf.to_vec();
                buf = &[];
                Message::Put { key, expiry, value }
            }
            code::DEL => {
                let key = get_string(&mut buf)?;
                Message::Del { key }
            }
            code::GET_REQ => {
                let key = get_string(&mut buf)?;
                let pending_key = get_string(&mut buf)?;
                Message::GetReq { key, pending_key }
            }
            code::GET_RSP => {
                let pending_key = get_string(&mut buf)?;
                let value = buf.to_vec();
                buf = &[];
                Message::GetRsp { pending_key, value }
            }
            other => return Err(ParseError::UnknownCode(other)),
        };
        if !buf.is_empty() {
            return Err(ParseError::Invalid);
        }
        Ok(message)
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Message::Verify {
                id,
                service_port,
                mode,
            } => {
                put_string(buf, id);
                put_string(buf, service_port);
                buf.put_u8(*mode);
            }
            Message::VerifyOk | Message::Ping | Message::Pong => {}
            Message::SyncReq { mode } => {
                buf.put_u8(*mode);
            }
            Message::SyncRsp {
                replication_factor,
                peers,
            } => {
                buf.put_u8(*replication_factor);
                buf.put_u16_le(peers.len() as u16);
                for peer in peers {
                    put_string(buf, &peer.id);
                    put_string(buf, &peer.ip_address);
                }
            }
            Message::Put { key, expiry, value } => {
                put_string(buf, key);
                buf.put_u64_le(*expiry);
                buf.put_slice(value);
            }
            Message::Del { key } => {
                put_string(buf, key);
            }
            Message::GetReq { key, pending_key } => {
                put_string(buf, key);
                put_string(buf, pending_key);
            }
            Message::GetRsp { pending_key, value } => {
                put_string(buf, pending_key);
                buf.put_slice(value);
            }
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

// Body decoding operates on a complete frame, so running out of bytes here
// is corruption rather than a short read.
fn get_string(buf: &mut &[u8]) -> Result<String, ParseError> {
    if buf.remaining() < 2 {
        return Err(ParseError::Invalid);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(ParseError::Invalid);
    }
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw).map_err(|_| ParseError::Invalid)
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, ParseError> {
    if buf.remaining() < 1 {
        return Err(ParseError::Invalid);
    }
    Ok(buf.get_u8())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        let (parsed, consumed) = Message::parse(&buf).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_roundtrip_all_messages() {
        roundtrip(Message::Verify {
            id: "node-a".to_owned(),
            service_port: "9911".to_owned(),
            mode: MODE_ACTIVE,
        });
        roundtrip(Message::VerifyOk);
        roundtrip(Message::Ping);
        roundtrip(Message::Pong);
        roundtrip(Message::SyncReq { mode: MODE_PASSIVE });
        roundtrip(Message::SyncRsp {
            replication_factor: 3,
            peers: vec![
                ProposedPeer {
                    id: "node-b".to_owned(),
                    ip_address: "10.0.0.2:9911".to_owned(),
                },
                ProposedPeer {
                    id: String::new(),
                    ip_address: "10.0.0.3:9911".to_owned(),
                },
            ],
        });
        roundtrip(Message::Put {
            key: "key_1".to_owned(),
            expiry: 0,
            value: b"data_1".to_vec(),
        });
        roundtrip(Message::Put {
            key: "key_2".to_owned(),
            expiry: 1_700_000_000,
            value: Vec::new(),
        });
        roundtrip(Message::Del {
            key: "key_1".to_owned(),
        });
        roundtrip(Message::GetReq {
            key: "key_1".to_owned(),
            pending_key: "key_1a8Zk0Qw".to_owned(),
        });
        roundtrip(Message::GetRsp {
            pending_key: "key_1a8Zk0Qw".to_owned(),
            value: b"data_1".to_vec(),
        });
        roundtrip(Message::GetRsp {
            pending_key: "miss".to_owned(),
            value: Vec::new(),
        });
    }

    #[test]
    fn test_frame_layout() {
        let mut buf = BytesMut::new();
        Message::Ping.encode(&mut buf);
        // Payload is just the code field: length 2, code 3, empty body.
        assert_eq!(&buf[..], &[2, 0, 0, 0, 3, 0]);
    }

    #[test]
    fn test_incomplete_header() {
        assert_eq!(Message::parse(&[]), Err(ParseError::Incomplete));
        assert_eq!(Message::parse(&[5, 0, 0]), Err(ParseError::Incomplete));
    }

    #[test]
    fn test_incomplete_body() {
        let mut buf = BytesMut::new();
        Message::Del {
            key: "key".to_owned(),
        }
        .encode(&mut buf);
        assert_eq!(
            Message::parse(&buf[..buf.len() - 1]),
            Err(ParseError::Incomplete)
        );
    }

    #[test]
    fn test_unknown_code() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_u16_le(999);
        assert_eq!(Message::parse(&buf), Err(ParseError::UnknownCode(999)));
    }

    #[test]
    fn test_truncated_string_in_body() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2 + 2);
        buf.put_u16_le(code::DEL);
        buf.put_u16_le(50); // claims a 50-byte key, provides none
        assert_eq!(Message::parse(&buf), Err(ParseError::Invalid));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2 + 1);
        buf.put_u16_le(code::PING);
        buf.put_u8(0xff);
        assert_eq!(Message::parse(&buf), Err(ParseError::Invalid));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_BODY_SIZE + 3) as u32);
        buf.put_u16_le(code::PUT);
        assert!(matches!(
            Message::parse(&buf),
            Err(ParseError::TooLarge(_))
        ));
    }

    #[test]
    fn test_zero_length_payload_invalid() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u16_le(code::PING);
        assert_eq!(Message::parse(&buf), Err(ParseError::Invalid));
    }

    #[test]
    fn test_code_names() {
        assert_eq!(Message::code_name(code::PUT), "PUT");
        assert_eq!(Message::code_name(4242), "UNKNOWN");
    }
}
