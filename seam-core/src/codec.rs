//! Y3 frame codec: deterministic encode, total decode, tokio-util framing.
//!
//! The outer node packet is self-delimiting (type byte + size varint), so
//! [`FrameCodec`] finds frame boundaries without a separate length prefix.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::frame::{
    AuthenticationAckFrame, AuthenticationFrame, BackflowFrame, CloseStreamFrame, DataFrame, Frame,
    FrameType, GoawayFrame, HandshakeAckFrame, HandshakeFrame, ObserveFrame, RejectedFrame,
    StreamFrame, tags,
};
use crate::y3::{
    NodePacket, int_bytes, put_node, put_primitive, tags_bytes, to_bool, to_i64, to_tags, to_u32,
    to_utf8, uint_bytes,
};

/// Frames larger than this are refused by both encoder and decoder.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn bool_bytes(v: bool) -> &'static [u8] {
    if v { &[0x01] } else { &[] }
}

/// Encode one frame to its Y3 bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut body = BytesMut::new();
    match frame {
        Frame::Handshake(f) => {
            put_primitive(&mut body, tags::HANDSHAKE_NAME, f.name.as_bytes());
            put_primitive(&mut body, tags::HANDSHAKE_ID, f.id.as_bytes());
            put_primitive(&mut body, tags::HANDSHAKE_CLIENT_ID, f.client_id.as_bytes());
            put_primitive(
                &mut body,
                tags::HANDSHAKE_CLIENT_TYPE,
                &uint_bytes(u64::from(f.client_type)),
            );
            put_primitive(
                &mut body,
                tags::HANDSHAKE_OBSERVE_DATA_TAGS,
                &tags_bytes(&f.observe_data_tags),
            );
            put_primitive(&mut body, tags::HANDSHAKE_AUTH_NAME, f.auth_name.as_bytes());
            put_primitive(&mut body, tags::HANDSHAKE_AUTH_PAYLOAD, &f.auth_payload);
        }
        Frame::HandshakeAck(f) => {
            put_primitive(&mut body, tags::HANDSHAKE_ACK_ID, f.id.as_bytes());
            put_primitive(
                &mut body,
                tags::HANDSHAKE_ACK_CLIENT_ID,
                f.client_id.as_bytes(),
            );
            put_primitive(
                &mut body,
                tags::HANDSHAKE_ACK_STREAM_ID,
                &int_bytes(f.stream_id),
            );
        }
        Frame::Authentication(f) => {
            put_primitive(&mut body, tags::AUTHENTICATION_NAME, f.auth_name.as_bytes());
            put_primitive(&mut body, tags::AUTHENTICATION_PAYLOAD, &f.auth_payload);
        }
        Frame::AuthenticationAck(f) => {
            put_primitive(&mut body, tags::AUTHENTICATION_ACK_OK, bool_bytes(f.ok));
            put_primitive(
                &mut body,
                tags::AUTHENTICATION_ACK_REASON,
                f.reason.as_bytes(),
            );
        }
        Frame::Data(f) => {
            put_primitive(&mut body, tags::DATA_TAG, &uint_bytes(u64::from(f.tag)));
            put_primitive(&mut body, tags::DATA_METADATA, &f.metadata);
            put_primitive(&mut body, tags::DATA_PAYLOAD, &f.payload);
            put_primitive(&mut body, tags::DATA_STREAMED, bool_bytes(f.streamed));
            put_primitive(&mut body, tags::DATA_BROADCAST, bool_bytes(f.broadcast));
        }
        Frame::Backflow(f) => {
            put_primitive(&mut body, tags::BACKFLOW_TAG, &uint_bytes(u64::from(f.tag)));
            put_primitive(&mut body, tags::BACKFLOW_CARRIAGE, &f.carriage);
        }
        Frame::Stream(f) => {
            put_primitive(&mut body, tags::STREAM_ID, f.id.as_bytes());
            put_primitive(&mut body, tags::STREAM_STREAM_ID, &int_bytes(f.stream_id));
            put_primitive(
                &mut body,
                tags::STREAM_CHUNK_SIZE,
                &uint_bytes(u64::from(f.chunk_size)),
            );
        }
        Frame::Goaway(f) => {
            put_primitive(&mut body, tags::GOAWAY_REASON, f.reason.as_bytes());
        }
        Frame::CloseStream(f) => {
            put_primitive(
                &mut body,
                tags::CLOSE_STREAM_STREAM_ID,
                &int_bytes(f.stream_id),
            );
            put_primitive(&mut body, tags::CLOSE_STREAM_REASON, f.reason.as_bytes());
        }
        Frame::Rejected(f) => {
            put_primitive(&mut body, tags::REJECTED_REASON, f.reason.as_bytes());
        }
        Frame::Observe(f) => {
            put_primitive(&mut body, tags::OBSERVE_TAG, &uint_bytes(u64::from(f.tag)));
        }
    }

    let mut buf = BytesMut::with_capacity(body.len() + 6);
    put_node(&mut buf, frame.frame_type().as_byte(), &body);
    buf.freeze()
}

fn utf8_field(node: &NodePacket, field: u8) -> Result<String, Error> {
    node.primitive(field).map_or_else(|| Ok(String::new()), to_utf8)
}

fn bytes_field(node: &NodePacket, field: u8) -> Bytes {
    node.primitive(field)
        .map_or_else(Bytes::new, Bytes::copy_from_slice)
}

fn u32_field(node: &NodePacket, field: u8) -> Result<u32, Error> {
    node.primitive(field).map_or(Ok(0), to_u32)
}

fn i64_field(node: &NodePacket, field: u8) -> Result<i64, Error> {
    node.primitive(field).map_or(Ok(0), to_i64)
}

fn bool_field(node: &NodePacket, field: u8) -> Result<bool, Error> {
    node.primitive(field).map_or(Ok(false), to_bool)
}

/// Decode one frame from a complete Y3 node packet.
///
/// # Errors
///
/// Returns [`Error::Malformed`] for unknown type bytes, type/width
/// mismatches, and size overruns.
pub fn decode_frame(data: &[u8]) -> Result<Frame, Error> {
    let (node, _) = NodePacket::decode(data)?;
    let frame_type = FrameType::from_byte(node.field)
        .ok_or_else(|| Error::malformed(format!("unknown frame type 0x{:02x}", node.field)))?;

    let frame = match frame_type {
        FrameType::Handshake => {
            let client_type = u8::try_from(u32_field(&node, tags::HANDSHAKE_CLIENT_TYPE)?)
                .map_err(|_| Error::malformed("client type exceeds one byte"))?;
            Frame::Handshake(HandshakeFrame {
                name: utf8_field(&node, tags::HANDSHAKE_NAME)?,
                id: utf8_field(&node, tags::HANDSHAKE_ID)?,
                client_id: utf8_field(&node, tags::HANDSHAKE_CLIENT_ID)?,
                client_type,
                observe_data_tags: node
                    .primitive(tags::HANDSHAKE_OBSERVE_DATA_TAGS)
                    .map_or_else(|| Ok(Vec::new()), to_tags)?,
                auth_name: utf8_field(&node, tags::HANDSHAKE_AUTH_NAME)?,
                auth_payload: bytes_field(&node, tags::HANDSHAKE_AUTH_PAYLOAD),
            })
        }
        FrameType::HandshakeAck => Frame::HandshakeAck(HandshakeAckFrame {
            id: utf8_field(&node, tags::HANDSHAKE_ACK_ID)?,
            client_id: utf8_field(&node, tags::HANDSHAKE_ACK_CLIENT_ID)?,
            stream_id: i64_field(&node, tags::HANDSHAKE_ACK_STREAM_ID)?,
        }),
        FrameType::Authentication => Frame::Authentication(AuthenticationFrame {
            auth_name: utf8_field(&node, tags::AUTHENTICATION_NAME)?,
            auth_payload: bytes_field(&node, tags::AUTHENTICATION_PAYLOAD),
        }),
        FrameType::AuthenticationAck => Frame::AuthenticationAck(AuthenticationAckFrame {
            ok: bool_field(&node, tags::AUTHENTICATION_ACK_OK)?,
            reason: utf8_field(&node, tags::AUTHENTICATION_ACK_REASON)?,
        }),
        FrameType::Data => Frame::Data(DataFrame {
            tag: u32_field(&node, tags::DATA_TAG)?,
            metadata: bytes_field(&node, tags::DATA_METADATA),
            payload: bytes_field(&node, tags::DATA_PAYLOAD),
            streamed: bool_field(&node, tags::DATA_STREAMED)?,
            broadcast: bool_field(&node, tags::DATA_BROADCAST)?,
        }),
        FrameType::Backflow => Frame::Backflow(BackflowFrame {
            tag: u32_field(&node, tags::BACKFLOW_TAG)?,
            carriage: bytes_field(&node, tags::BACKFLOW_CARRIAGE),
        }),
        FrameType::Stream => Frame::Stream(StreamFrame {
            id: utf8_field(&node, tags::STREAM_ID)?,
            stream_id: i64_field(&node, tags::STREAM_STREAM_ID)?,
            chunk_size: u32_field(&node, tags::STREAM_CHUNK_SIZE)?,
        }),
        FrameType::Goaway => Frame::Goaway(GoawayFrame {
            reason: utf8_field(&node, tags::GOAWAY_REASON)?,
        }),
        FrameType::CloseStream => Frame::CloseStream(CloseStreamFrame {
            stream_id: i64_field(&node, tags::CLOSE_STREAM_STREAM_ID)?,
            reason: utf8_field(&node, tags::CLOSE_STREAM_REASON)?,
        }),
        FrameType::Rejected => Frame::Rejected(RejectedFrame {
            reason: utf8_field(&node, tags::REJECTED_REASON)?,
        }),
        FrameType::Observe => Frame::Observe(ObserveFrame {
            tag: u32_field(&node, tags::OBSERVE_TAG)?,
        }),
    };

    Ok(frame)
}

/// tokio-util codec speaking whole Y3 frames over a QUIC stream.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Tag byte plus at least one size byte.
        if src.len() < 2 {
            return Ok(None);
        }

        // Parse the size varint without committing.
        let mut body_len: u64 = 0;
        let mut shift = 0u32;
        let mut pos = 1usize;
        loop {
            let Some(&byte) = src.get(pos) else {
                return Ok(None);
            };
            pos += 1;
            if shift >= 64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    Error::malformed("frame size varint exceeds 64 bits"),
                ));
            }
            body_len |= u64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }

        if body_len > MAX_FRAME_LEN as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                Error::malformed(format!("frame of {body_len} bytes exceeds limit")),
            ));
        }

        #[allow(clippy::cast_possible_truncation)]
        let total = pos + body_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let packet = src.split_to(total);
        decode_frame(&packet)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = encode_frame(&item);
        if bytes.len() > MAX_FRAME_LEN + 6 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                Error::malformed("frame exceeds maximum length"),
            ));
        }
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Handshake(HandshakeFrame {
                name: "sfn-async-log-events".into(),
                id: "hs-1".into(),
                client_id: "client-1".into(),
                client_type: crate::frame::ClientType::StreamFunction.as_u8(),
                observe_data_tags: vec![0x21, 0x22],
                auth_name: "token".into(),
                auth_payload: Bytes::from_static(b"secret"),
            }),
            Frame::HandshakeAck(HandshakeAckFrame {
                id: "hs-1".into(),
                client_id: "client-1".into(),
                stream_id: 12,
            }),
            Frame::Authentication(AuthenticationFrame {
                auth_name: "token".into(),
                auth_payload: Bytes::from_static(b"secret"),
            }),
            Frame::AuthenticationAck(AuthenticationAckFrame {
                ok: true,
                reason: String::new(),
            }),
            Frame::AuthenticationAck(AuthenticationAckFrame {
                ok: false,
                reason: "invalid credential".into(),
            }),
            Frame::Data(DataFrame {
                tag: 0x21,
                metadata: Bytes::from_static(b"\x81\x00"),
                payload: Bytes::from_static(b"test"),
                streamed: false,
                broadcast: true,
            }),
            Frame::Backflow(BackflowFrame {
                tag: 0x22,
                carriage: Bytes::from_static(b"reply"),
            }),
            Frame::Stream(StreamFrame {
                id: "pipe-1".into(),
                stream_id: -3,
                chunk_size: 1024,
            }),
            Frame::Goaway(GoawayFrame {
                reason: "shutting down".into(),
            }),
            Frame::CloseStream(CloseStreamFrame {
                stream_id: 8,
                reason: "replaced".into(),
            }),
            Frame::Rejected(RejectedFrame {
                reason: "handshake required".into(),
            }),
            Frame::Observe(ObserveFrame { tag: 0x30 }),
        ]
    }

    #[test]
    fn roundtrip_every_variant() {
        for frame in sample_frames() {
            let bytes = encode_frame(&frame);
            let decoded = decode_frame(&bytes).unwrap();
            // Tag lists are canonicalized (sorted) on encode.
            if let (Frame::Handshake(a), Frame::Handshake(b)) = (&frame, &decoded) {
                let mut sorted = a.observe_data_tags.clone();
                sorted.sort_unstable();
                assert_eq!(sorted, b.observe_data_tags);
            } else {
                assert_eq!(frame, decoded, "frame {}", frame.frame_type());
            }
        }
    }

    #[test]
    fn roundtrip_empty_fields() {
        let frame = Frame::Data(DataFrame::default());
        assert_eq!(decode_frame(&encode_frame(&frame)).unwrap(), frame);

        let frame = Frame::Handshake(HandshakeFrame::default());
        assert_eq!(decode_frame(&encode_frame(&frame)).unwrap(), frame);
    }

    #[test]
    fn encode_is_deterministic() {
        let frame = Frame::Data(DataFrame {
            tag: 0x1234,
            metadata: Bytes::from_static(b"md"),
            payload: Bytes::from_static(b"payload"),
            streamed: true,
            broadcast: false,
        });
        assert_eq!(encode_frame(&frame), encode_frame(&frame));
    }

    #[test]
    fn reencode_is_stable() {
        // Encode(Decode(x)) over valid bytes reproduces the same frame.
        for frame in sample_frames() {
            let bytes = encode_frame(&frame);
            let decoded = decode_frame(&bytes).unwrap();
            let bytes2 = encode_frame(&decoded);
            assert_eq!(decode_frame(&bytes2).unwrap(), decoded);
        }
    }

    #[test]
    fn unknown_type_byte_is_malformed() {
        let frame = Frame::Observe(ObserveFrame { tag: 1 });
        let mut bytes = encode_frame(&frame).to_vec();
        bytes[0] = 0x80 | 0x12; // no frame uses 0x12
        assert!(matches!(
            decode_frame(&bytes),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn truncated_bytes_are_malformed() {
        let bytes = encode_frame(&Frame::Goaway(GoawayFrame {
            reason: "bye".into(),
        }));
        for cut in 1..bytes.len() {
            assert!(decode_frame(&bytes[..cut]).is_err(), "cut {cut}");
        }
    }

    #[test]
    fn unknown_fields_are_skipped() {
        // Append an unrecognized primitive to a Goaway body; decode ignores it.
        let mut body = BytesMut::new();
        crate::y3::put_primitive(&mut body, tags::GOAWAY_REASON, b"bye");
        crate::y3::put_primitive(&mut body, 0x2A, b"future field");
        let mut buf = BytesMut::new();
        crate::y3::put_node(&mut buf, FrameType::Goaway.as_byte(), &body);

        let decoded = decode_frame(&buf).unwrap();
        assert_eq!(
            decoded,
            Frame::Goaway(GoawayFrame {
                reason: "bye".into()
            })
        );
    }

    #[test]
    fn type_width_mismatch_is_malformed() {
        // A 5-byte value in the Data tag field (u32) must fail.
        let mut body = BytesMut::new();
        crate::y3::put_primitive(&mut body, tags::DATA_TAG, &[1, 2, 3, 4, 5]);
        let mut buf = BytesMut::new();
        crate::y3::put_node(&mut buf, FrameType::Data.as_byte(), &body);
        assert!(decode_frame(&buf).is_err());
    }

    #[test]
    fn codec_splits_concatenated_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frames = sample_frames();
        for frame in &frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }
        assert_eq!(decoded.len(), frames.len());
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_partial_frame() {
        let mut codec = FrameCodec::new();
        let bytes = encode_frame(&Frame::Rejected(RejectedFrame {
            reason: "handshake required".into(),
        }));

        let mut buf = BytesMut::new();
        for chunk in bytes.chunks(3) {
            let before = buf.len();
            buf.extend_from_slice(chunk);
            let result = codec.decode(&mut buf).unwrap();
            if before + chunk.len() == bytes.len() {
                assert!(result.is_some());
            } else {
                assert!(result.is_none());
            }
        }
    }

    #[test]
    fn codec_rejects_oversized_frame() {
        let mut codec = FrameCodec::new();
        // Hand-craft a header claiming a body far over the limit.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x80 | 0x3F]);
        crate::y3::put_varint(&mut buf, (MAX_FRAME_LEN as u64) + 1);
        assert!(codec.decode(&mut buf).is_err());
    }
}
