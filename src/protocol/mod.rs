//! Wire protocol: frame representation, packet format, packetizer and the
//! stream decoder.

pub mod codec;
pub mod frame;
pub mod stream_decoder;
pub mod wire_format;

pub use codec::{decode_packet, encode_frame, encode_packet};
pub use frame::CanFrame;
pub use stream_decoder::StreamDecoder;
pub use wire_format::{OpCode, PacketHeader, BANNER, FRAME_BASE_SIZE, PACKET_HEADER_SIZE};
