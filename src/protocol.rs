//! Wire packets for client/server screen-share communication.
//!
//! Wire format: `[type: u8][length: u32 big-endian][payload: bytes]`
//!
//! Payloads are JSON control messages. Inbound packets flow from
//! broadcasting clients to the registry; outbound packets carry the
//! viewport's start/stop commands back to clients.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::frame::{Resolution, ScreenFrame};

/// Packet type byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    // Client → server
    Register = 0x01,
    Deregister = 0x02,
    ScreenFrame = 0x03,
    Heartbeat = 0x04,

    // Server → client
    Send = 0x10,
    Stop = 0x11,
}

impl PacketType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::Deregister),
            0x03 => Some(Self::ScreenFrame),
            0x04 => Some(Self::Heartbeat),
            0x10 => Some(Self::Send),
            0x11 => Some(Self::Stop),
            _ => None,
        }
    }
}

/// Maximum packet payload size (16 MiB). Prevents OOM on malformed data.
const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// A protocol packet with a type tag and payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Bytes) -> Self {
        Self {
            packet_type,
            payload,
        }
    }

    /// Create a packet from a serializable control message.
    pub fn control<T: Serialize>(
        packet_type: PacketType,
        msg: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(msg)?;
        Ok(Self::new(packet_type, Bytes::from(payload)))
    }

    /// Encode this packet into bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u8(self.packet_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    /// Write this packet to an async writer.
    pub async fn write_to<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let encoded = self.encode();
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    /// Read a packet from an async reader.
    pub async fn read_from<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Self> {
        let type_byte = reader.read_u8().await?;
        let packet_type = PacketType::from_u8(type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown packet type: 0x{:02x}", type_byte),
            )
        })?;

        let length = reader.read_u32().await?;
        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet payload too large: {} bytes", length),
            ));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            packet_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode a packet from a byte buffer (synchronous, for testing).
    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        if data.len() < 5 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "packet too short",
            ));
        }

        let type_byte = data.get_u8();
        let packet_type = PacketType::from_u8(type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown packet type: 0x{:02x}", type_byte),
            )
        })?;

        let length = data.get_u32();
        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet payload too large: {} bytes", length),
            ));
        }

        if data.remaining() < length as usize {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete packet payload",
            ));
        }

        let payload = Bytes::copy_from_slice(&data[..length as usize]);

        Ok(Self {
            packet_type,
            payload,
        })
    }

    /// Parse the payload as a JSON control message.
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

// ── Control message types ──────────────────────────────────────────

/// Client → server: announce a new sharing client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMsg {
    pub id: String,
    pub name: String,
}

/// Client → server: the client stopped sharing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterMsg {
    pub id: String,
}

/// Client → server: one incremental screen update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenFrameMsg {
    pub id: String,
    pub frame: ScreenFrame,
}

/// Client → server: heartbeat acknowledgement, resetting the liveness
/// countdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub id: String,
}

/// Server → client: start (`Send`) or pause (`Stop`) streaming. `Stop`
/// carries the zero resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMsg {
    pub resolution: Resolution,
}
