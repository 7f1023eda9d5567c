//! Wire frame types for the client↔zipper protocol.
//!
//! Every frame is a Y3 node packet whose field id is the frame type byte.
//! Type bytes and field tags are part of the stable wire contract.

use bytes::Bytes;

/// Application-chosen 32-bit identifier partitioning the data plane.
pub type Tag = u32;

/// What kind of endpoint sits behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientType {
    /// Producer of tagged data frames.
    Source,
    /// Stateful handler observing tags and emitting new ones.
    StreamFunction,
    /// A peer zipper forming the mesh.
    UpstreamZipper,
}

impl ClientType {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            ClientType::Source => 0x5F,
            ClientType::StreamFunction => 0x5D,
            ClientType::UpstreamZipper => 0x5E,
        }
    }

    #[must_use]
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x5F => Some(ClientType::Source),
            0x5D => Some(ClientType::StreamFunction),
            0x5E => Some(ClientType::UpstreamZipper),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ClientType::Source => "source",
            ClientType::StreamFunction => "stream-function",
            ClientType::UpstreamZipper => "upstream-zipper",
        })
    }
}

/// Frame type bytes (the outer node packet's field id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Authentication = 0x03,
    AuthenticationAck = 0x11,
    HandshakeAck = 0x29,
    Backflow = 0x2D,
    Goaway = 0x2E,
    Handshake = 0x31,
    Stream = 0x33,
    CloseStream = 0x34,
    Observe = 0x35,
    Rejected = 0x39,
    Data = 0x3F,
}

impl FrameType {
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x03 => Some(FrameType::Authentication),
            0x11 => Some(FrameType::AuthenticationAck),
            0x29 => Some(FrameType::HandshakeAck),
            0x2D => Some(FrameType::Backflow),
            0x2E => Some(FrameType::Goaway),
            0x31 => Some(FrameType::Handshake),
            0x33 => Some(FrameType::Stream),
            0x34 => Some(FrameType::CloseStream),
            0x35 => Some(FrameType::Observe),
            0x39 => Some(FrameType::Rejected),
            0x3F => Some(FrameType::Data),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FrameType::Authentication => "AuthenticationFrame",
            FrameType::AuthenticationAck => "AuthenticationAckFrame",
            FrameType::HandshakeAck => "HandshakeAckFrame",
            FrameType::Backflow => "BackflowFrame",
            FrameType::Goaway => "GoawayFrame",
            FrameType::Handshake => "HandshakeFrame",
            FrameType::Stream => "StreamFrame",
            FrameType::CloseStream => "CloseStreamFrame",
            FrameType::Observe => "ObserveFrame",
            FrameType::Rejected => "RejectedFrame",
            FrameType::Data => "DataFrame",
        })
    }
}

/// Sent on the control stream to request a new data stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandshakeFrame {
    pub name: String,
    pub id: String,
    pub client_id: String,
    pub client_type: u8,
    pub observe_data_tags: Vec<Tag>,
    pub auth_name: String,
    pub auth_payload: Bytes,
}

/// The server's reply identifying the accepted data stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandshakeAckFrame {
    pub id: String,
    pub client_id: String,
    pub stream_id: i64,
}

/// Credential exchange, first frame on every control stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthenticationFrame {
    pub auth_name: String,
    pub auth_payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthenticationAckFrame {
    pub ok: bool,
    pub reason: String,
}

/// The carrier of a discrete user message.
///
/// `broadcast` is a routing attribute of the frame itself, deliberately not
/// part of the metadata block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataFrame {
    pub tag: Tag,
    pub metadata: Bytes,
    pub payload: Bytes,
    pub streamed: bool,
    pub broadcast: bool,
}

/// Server→source reply bearing a downstream handler's output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackflowFrame {
    pub tag: Tag,
    pub carriage: Bytes,
}

/// Reference to a uni-stream carrying bulk bytes; travels as the payload
/// of a [`DataFrame`] with `streamed == true`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamFrame {
    pub id: String,
    pub stream_id: i64,
    pub chunk_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GoawayFrame {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseStreamFrame {
    pub stream_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RejectedFrame {
    pub reason: String,
}

/// Asks the zipper's broker for the next uni-stream carrying this tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObserveFrame {
    pub tag: Tag,
}

/// The tagged sum of every frame kind. Decode dispatches on the outer
/// node packet's field id with an exhaustive match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(HandshakeFrame),
    HandshakeAck(HandshakeAckFrame),
    Authentication(AuthenticationFrame),
    AuthenticationAck(AuthenticationAckFrame),
    Data(DataFrame),
    Backflow(BackflowFrame),
    Stream(StreamFrame),
    Goaway(GoawayFrame),
    CloseStream(CloseStreamFrame),
    Rejected(RejectedFrame),
    Observe(ObserveFrame),
}

impl Frame {
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Handshake(_) => FrameType::Handshake,
            Frame::HandshakeAck(_) => FrameType::HandshakeAck,
            Frame::Authentication(_) => FrameType::Authentication,
            Frame::AuthenticationAck(_) => FrameType::AuthenticationAck,
            Frame::Data(_) => FrameType::Data,
            Frame::Backflow(_) => FrameType::Backflow,
            Frame::Stream(_) => FrameType::Stream,
            Frame::Goaway(_) => FrameType::Goaway,
            Frame::CloseStream(_) => FrameType::CloseStream,
            Frame::Rejected(_) => FrameType::Rejected,
            Frame::Observe(_) => FrameType::Observe,
        }
    }
}

// Field tags, scoped per enclosing node.
pub(crate) mod tags {
    // HandshakeFrame
    pub const HANDSHAKE_NAME: u8 = 0x01;
    pub const HANDSHAKE_ID: u8 = 0x03;
    pub const HANDSHAKE_CLIENT_ID: u8 = 0x04;
    pub const HANDSHAKE_CLIENT_TYPE: u8 = 0x05;
    pub const HANDSHAKE_OBSERVE_DATA_TAGS: u8 = 0x06;
    pub const HANDSHAKE_AUTH_NAME: u8 = 0x07;
    pub const HANDSHAKE_AUTH_PAYLOAD: u8 = 0x08;

    // HandshakeAckFrame
    pub const HANDSHAKE_ACK_ID: u8 = 0x26;
    pub const HANDSHAKE_ACK_CLIENT_ID: u8 = 0x27;
    pub const HANDSHAKE_ACK_STREAM_ID: u8 = 0x28;

    // AuthenticationFrame
    pub const AUTHENTICATION_NAME: u8 = 0x04;
    pub const AUTHENTICATION_PAYLOAD: u8 = 0x05;

    // AuthenticationAckFrame
    pub const AUTHENTICATION_ACK_OK: u8 = 0x01;
    pub const AUTHENTICATION_ACK_REASON: u8 = 0x02;

    // DataFrame
    pub const DATA_TAG: u8 = 0x01;
    pub const DATA_METADATA: u8 = 0x02;
    pub const DATA_PAYLOAD: u8 = 0x03;
    pub const DATA_STREAMED: u8 = 0x04;
    pub const DATA_BROADCAST: u8 = 0x05;

    // BackflowFrame
    pub const BACKFLOW_TAG: u8 = 0x01;
    pub const BACKFLOW_CARRIAGE: u8 = 0x02;

    // StreamFrame
    pub const STREAM_ID: u8 = 0x01;
    pub const STREAM_STREAM_ID: u8 = 0x02;
    pub const STREAM_CHUNK_SIZE: u8 = 0x03;

    // GoawayFrame
    pub const GOAWAY_REASON: u8 = 0x01;

    // CloseStreamFrame
    pub const CLOSE_STREAM_STREAM_ID: u8 = 0x01;
    pub const CLOSE_STREAM_REASON: u8 = 0x02;

    // RejectedFrame
    pub const REJECTED_REASON: u8 = 0x01;

    // ObserveFrame
    pub const OBSERVE_TAG: u8 = 0x01;
}
