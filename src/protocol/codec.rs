//! Datagram packetizer: batches CAN frames into length-bounded wire packets
//! and decodes them back.
//!
//! Encoding fills one packet at a time and reports how many frames were
//! consumed, so the caller restarts the next packet at the first frame that
//! did not fit. Decoding obtains frame slots from an allocator callback and
//! hands each decoded frame to a receiver callback; on a truncated packet
//! the partially filled slot is handed over as invalid so the caller can
//! recycle it.

use bytes::{BufMut, BytesMut};

use super::frame::CanFrame;
use super::wire_format::{OpCode, PacketHeader, FRAME_BASE_SIZE, PACKET_HEADER_SIZE};
use crate::error::{CanwireError, Result};

/// Append one frame record to `dst`: identifier (network order), length
/// byte with the FD marker retained, the flags byte for FD frames, and the
/// data bytes unless the frame is an RTR.
pub fn encode_frame(dst: &mut BytesMut, frame: &CanFrame) {
    dst.put_u32(frame.can_id);
    dst.put_u8(frame.len);
    if frame.is_fd() {
        dst.put_u8(frame.flags);
    }
    if !frame.is_rtr() {
        dst.put_slice(frame.payload());
    }
}

/// Encode one packet of at most `payload_size` bytes into `dst`.
///
/// Writes the 5-byte header followed by as many of `frames` as fit, in
/// order. Returns the number of frames consumed; a return value smaller
/// than `frames.len()` means the packet overflowed and the next packet must
/// start at the returned index.
///
/// Never writes past `payload_size` bytes. Returns 0 without writing
/// anything when `frames` is empty or not even the first frame fits.
pub fn encode_packet(
    dst: &mut BytesMut,
    payload_size: usize,
    seq_no: u8,
    frames: &[CanFrame],
) -> usize {
    if frames.is_empty() || payload_size < PACKET_HEADER_SIZE + frames[0].buffered_size() {
        return 0;
    }

    let start = dst.len();
    dst.put_slice(&[0u8; PACKET_HEADER_SIZE]);

    let mut consumed = 0usize;
    for frame in frames {
        let written = dst.len() - start;
        if written + frame.buffered_size() > payload_size {
            break;
        }
        encode_frame(dst, frame);
        consumed += 1;
    }

    let header = PacketHeader::data(seq_no, consumed as u16);
    dst[start..start + PACKET_HEADER_SIZE].copy_from_slice(&header.encode());
    consumed
}

/// Decode a wire packet, forwarding each frame through the callbacks.
///
/// `alloc` provides an empty frame slot (typically a pool checkout);
/// `receive(frame, valid)` takes ownership of each slot back. Complete
/// frames arrive with `valid = true`. On a truncated packet the last,
/// partially filled slot is delivered with `valid = false` and a zeroed
/// length so the caller can return it to the pool, and an error is
/// returned.
///
/// A packet with `count == 0` is silently ignored (`Ok(0)`).
///
/// # Errors
///
/// Protocol errors for a bad header, a non-data op-code or a truncated
/// packet; [`CanwireError::PoolDepleted`] when `alloc` fails.
pub fn decode_packet<A, R>(buf: &[u8], mut alloc: A, mut receive: R) -> Result<u16>
where
    A: FnMut() -> Option<CanFrame>,
    R: FnMut(CanFrame, bool),
{
    let header = PacketHeader::decode(buf)?;
    if header.op_code != OpCode::Data {
        return Err(CanwireError::Protocol(format!(
            "unexpected op code {:?}",
            header.op_code
        )));
    }
    if header.count == 0 {
        return Ok(0);
    }

    let mut pos = PACKET_HEADER_SIZE;
    for _ in 0..header.count {
        if pos + FRAME_BASE_SIZE > buf.len() {
            return Err(CanwireError::Protocol(
                "truncated packet: incomplete frame header".into(),
            ));
        }
        let mut frame = alloc().ok_or(CanwireError::PoolDepleted)?;
        frame.can_id = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        pos += 4;
        frame.len = buf[pos];
        pos += 1;
        frame.flags = 0;
        if frame.is_fd() {
            if pos >= buf.len() {
                frame.len = 0;
                receive(frame, false);
                return Err(CanwireError::Protocol(
                    "truncated packet: missing FD flags".into(),
                ));
            }
            frame.flags = buf[pos];
            pos += 1;
        }
        if !frame.is_rtr() {
            let data_len = frame.data_len();
            if pos + data_len > buf.len() {
                frame.len = 0;
                receive(frame, false);
                return Err(CanwireError::Protocol(
                    "truncated packet: incomplete frame data".into(),
                ));
            }
            frame.data[..data_len].copy_from_slice(&buf[pos..pos + data_len]);
            pos += data_len;
        }
        receive(frame, true);
    }
    Ok(header.count)
}
