//! Packet codecs for both protocol layers.
//!
//! The transport (outer) layer frames every exchange as a single ASCII type
//! digit followed by an opaque payload; batches concatenate frames with the
//! `0x1E` record separator. The application (inner) layer rides inside
//! transport MESSAGE payloads as
//! `<type>[<namespace>,][<ackId>][<json-payload>]`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Record separator between concatenated transport packets.
pub const PACKET_SEPARATOR: u8 = 0x1E;

/// The namespace every packet belongs to unless the wire says otherwise.
/// Elided from encoded packets.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Pre-encoded PING frame, written by the writer worker on every ticker tick.
pub(crate) const PING_FRAME: &[u8] = b"2";
/// Pre-encoded CLOSE frame, written when the outbound queue shuts down.
pub(crate) const CLOSE_FRAME: &[u8] = b"1";

/// Transport-layer packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePacketType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl EnginePacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'0' => Some(Self::Open),
            b'1' => Some(Self::Close),
            b'2' => Some(Self::Ping),
            b'3' => Some(Self::Pong),
            b'4' => Some(Self::Message),
            b'5' => Some(Self::Upgrade),
            b'6' => Some(Self::Noop),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        b'0' + self as u8
    }
}

/// Transport-layer packet: a type digit plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePacket {
    pub packet_type: EnginePacketType,
    pub data: Bytes,
}

impl EnginePacket {
    pub fn new(packet_type: EnginePacketType, data: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            data: data.into(),
        }
    }

    pub fn message(data: impl Into<Bytes>) -> Self {
        Self::new(EnginePacketType::Message, data.into())
    }

    pub fn ping() -> Self {
        Self::new(EnginePacketType::Ping, Bytes::new())
    }

    pub fn close() -> Self {
        Self::new(EnginePacketType::Close, Bytes::new())
    }

    /// Wire form: type digit, then payload bytes verbatim.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.packet_type.as_byte());
        out.extend_from_slice(&self.data);
        Bytes::from(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (&type_byte, payload) = data
            .split_first()
            .ok_or_else(|| Error::Protocol("empty transport packet".into()))?;
        let packet_type = EnginePacketType::from_byte(type_byte).ok_or_else(|| {
            Error::Protocol(format!("invalid transport packet type: {type_byte:#04x}"))
        })?;

        Ok(Self {
            packet_type,
            data: Bytes::copy_from_slice(payload),
        })
    }

    /// Concatenate packets with the record separator.
    pub fn encode_batch(packets: &[EnginePacket]) -> Bytes {
        let mut out = Vec::new();
        for (i, packet) in packets.iter().enumerate() {
            if i != 0 {
                out.push(PACKET_SEPARATOR);
            }
            out.extend_from_slice(&packet.encode());
        }
        Bytes::from(out)
    }

    /// Split on the record separator and decode each segment.
    pub fn decode_batch(data: &[u8]) -> Result<Vec<EnginePacket>> {
        data.split(|&b| b == PACKET_SEPARATOR)
            .map(Self::decode)
            .collect()
    }
}

/// Application-layer packet types, carried inside transport MESSAGE frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl SocketPacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'0' => Some(Self::Connect),
            b'1' => Some(Self::Disconnect),
            b'2' => Some(Self::Event),
            b'3' => Some(Self::Ack),
            b'4' => Some(Self::ConnectError),
            b'5' => Some(Self::BinaryEvent),
            b'6' => Some(Self::BinaryAck),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        b'0' + self as u8
    }
}

/// Application-layer packet.
///
/// A packet without payload has empty `data`, never null; the codec
/// preserves that distinction in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPacket {
    pub packet_type: SocketPacketType,
    pub namespace: String,
    pub ack_id: Option<u64>,
    pub data: Bytes,
}

impl SocketPacket {
    pub fn new(packet_type: SocketPacketType) -> Self {
        Self {
            packet_type,
            namespace: DEFAULT_NAMESPACE.to_string(),
            ack_id: None,
            data: Bytes::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_ack_id(mut self, ack_id: u64) -> Self {
        self.ack_id = Some(ack_id);
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Wire form: `<type>[<namespace>,][<ackId>][<payload>]`.
    ///
    /// The namespace is elided when it is the default `/`.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(1 + self.namespace.len() + self.data.len() + 8);
        out.push(self.packet_type.as_byte());
        if self.namespace != DEFAULT_NAMESPACE {
            out.extend_from_slice(self.namespace.as_bytes());
            out.push(b',');
        }
        if let Some(id) = self.ack_id {
            out.extend_from_slice(id.to_string().as_bytes());
        }
        if !self.data.is_empty() {
            out.extend_from_slice(&self.data);
        }
        Bytes::from(out)
    }

    /// Parse a packet off the wire.
    ///
    /// A namespace is present iff the first byte after the type digit is
    /// `/`; it must be terminated by a comma. An ack id is the maximal run
    /// of ASCII digits that follows; a run that does not parse is treated
    /// as absent and left for the payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (&type_byte, mut rest) = data
            .split_first()
            .ok_or_else(|| Error::Protocol("empty packet".into()))?;
        let packet_type = SocketPacketType::from_byte(type_byte)
            .ok_or_else(|| Error::Protocol(format!("invalid packet type: {type_byte:#04x}")))?;

        let mut namespace = DEFAULT_NAMESPACE.to_string();
        if rest.first() == Some(&b'/') {
            let comma = rest
                .iter()
                .position(|&b| b == b',')
                .ok_or_else(|| Error::Protocol("namespace missing ',' terminator".into()))?;
            namespace = String::from_utf8(rest[..comma].to_vec())
                .map_err(|_| Error::Protocol("namespace is not valid UTF-8".into()))?;
            rest = &rest[comma + 1..];
        }

        let mut ack_id = None;
        let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits > 0 {
            if let Some(id) = std::str::from_utf8(&rest[..digits])
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
            {
                ack_id = Some(id);
                rest = &rest[digits..];
            }
        }

        Ok(Self {
            packet_type,
            namespace,
            ack_id,
            data: Bytes::copy_from_slice(rest),
        })
    }
}

/// Body of the `{"error": ...}` payloads in CONNECT_ERROR and ACK-error
/// packets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub error: String,
}

/// Payload of the server's initial OPEN packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: String,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: usize,
}
