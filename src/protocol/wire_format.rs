//! Wire format constants and the packet header.
//!
//! A data packet is a 5-byte header followed by `count` encoded frames:
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬───────────┐
//! │ version │ op_code │ seq_no  │ count     │
//! │ 1 byte  │ 1 byte  │ 1 byte  │ u16 BE    │
//! └─────────┴─────────┴─────────┴───────────┘
//! ```
//!
//! Each frame on the wire: `can_id` (u32 BE, flag bits included), `len`
//! (FD marker retained), `flags` (present only when the FD marker is set)
//! and the data bytes (absent for RTR frames).

use crate::error::{CanwireError, Result};

/// Packet header size in bytes (fixed, exactly 5).
pub const PACKET_HEADER_SIZE: usize = 5;

/// Header-free size of a frame record: identifier + length byte.
pub const FRAME_BASE_SIZE: usize = 5;

/// Current wire protocol version.
pub const WIRE_VERSION: u8 = 2;

/// Protocol banner exchanged on stream transports after connect.
pub const BANNER: &[u8; 12] = b"CANNELLONIv1";

/// Packet operation codes. Only `Data` is exchanged; the acknowledgment
/// codes are reserved by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Data = 0,
    Ack = 1,
    Nack = 2,
}

impl OpCode {
    /// Decode an op-code byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpCode::Data),
            1 => Some(OpCode::Ack),
            2 => Some(OpCode::Nack),
            _ => None,
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Wire protocol version; must equal [`WIRE_VERSION`].
    pub version: u8,
    /// Operation code.
    pub op_code: OpCode,
    /// Sequence number, wrapping at 256, per outbound packet.
    pub seq_no: u8,
    /// Number of frames in the packet.
    pub count: u16,
}

impl PacketHeader {
    /// Create a data packet header.
    pub fn data(seq_no: u8, count: u16) -> Self {
        Self {
            version: WIRE_VERSION,
            op_code: OpCode::Data,
            seq_no,
            count,
        }
    }

    /// Encode the header to bytes (count in network order).
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.op_code as u8;
        buf[2] = self.seq_no;
        buf[3..5].copy_from_slice(&self.count.to_be_bytes());
        buf
    }

    /// Decode and validate a header.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the buffer is shorter than the header,
    /// the version is unknown, or the op-code byte is invalid.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Err(CanwireError::Protocol(format!(
                "packet too short for header: {} bytes",
                buf.len()
            )));
        }
        if buf[0] != WIRE_VERSION {
            return Err(CanwireError::Protocol(format!(
                "unsupported wire version {}",
                buf[0]
            )));
        }
        let op_code = OpCode::from_u8(buf[1])
            .ok_or_else(|| CanwireError::Protocol(format!("invalid op code {}", buf[1])))?;
        Ok(Self {
            version: buf[0],
            op_code,
            seq_no: buf[2],
            count: u16::from_be_bytes([buf[3], buf[4]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader::data(0x42, 300);
        let decoded = PacketHeader::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_byte_order() {
        let header = PacketHeader::data(7, 0x0102);
        let bytes = header.encode();
        assert_eq!(bytes, [0x02, 0x00, 0x07, 0x01, 0x02]);
    }

    #[test]
    fn test_header_size_is_exactly_5() {
        assert_eq!(PACKET_HEADER_SIZE, 5);
        assert_eq!(PacketHeader::data(0, 0).encode().len(), 5);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(PacketHeader::decode(&[0x02, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_decode_wrong_version() {
        let result = PacketHeader::decode(&[0x01, 0x00, 0x00, 0x00, 0x01]);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("version"));
    }

    #[test]
    fn test_decode_bad_op_code() {
        let result = PacketHeader::decode(&[0x02, 0x09, 0x00, 0x00, 0x01]);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("op code"));
    }

    #[test]
    fn test_op_code_mapping() {
        assert_eq!(OpCode::from_u8(0), Some(OpCode::Data));
        assert_eq!(OpCode::from_u8(1), Some(OpCode::Ack));
        assert_eq!(OpCode::from_u8(2), Some(OpCode::Nack));
        assert_eq!(OpCode::from_u8(3), None);
    }

    #[test]
    fn test_banner_is_twelve_bytes() {
        assert_eq!(BANNER.len(), 12);
    }
}
