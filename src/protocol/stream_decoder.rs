//! Incremental frame decoder for byte-stream transports.
//!
//! TCP carries a flat concatenation of frame records with no packet header,
//! so record boundaries must be inferred field by field. The decoder
//! accumulates partial reads in a `BytesMut` and walks a state machine:
//!
//! - `Id`: need 4 bytes of identifier
//! - `Len`: need the length byte; decides whether flags and data follow
//! - `Flags`: need the FD flags byte
//! - `Data`: need the effective data length
//!
//! RTR frames complete after `Len` (or `Flags` for FD) even when their
//! length code is non-zero. A length code beyond the frame class maximum is
//! a protocol error; the caller is expected to drop the connection.

use bytes::{Buf, BytesMut};

use super::frame::{CanFrame, CAN_MAX_DLEN, CANFD_MAX_DLEN, FD_FRAME};
use crate::error::{CanwireError, Result};

/// State machine for record parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the 4-byte identifier.
    Id,
    /// Waiting for the length byte.
    Len,
    /// Waiting for the FD flags byte.
    Flags,
    /// Waiting for the data bytes.
    Data,
}

/// Buffer for accumulating incoming stream bytes and extracting complete
/// CAN frames.
pub struct StreamDecoder {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Frame under construction.
    frame: CanFrame,
}

impl StreamDecoder {
    /// Create a new decoder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            state: State::Id,
            frame: CanFrame::default(),
        }
    }

    /// Push data into the decoder and extract all complete frames.
    ///
    /// Partial records stay buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when a length byte exceeds the maximum for
    /// its frame class. The decoder is left cleared; the connection should
    /// be dropped.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<CanFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.try_extract_one() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    self.clear();
                    return Err(e);
                }
            }
        }
        Ok(frames)
    }

    /// Bytes the decoder needs before it can advance its current state.
    pub fn expected(&self) -> usize {
        match self.state {
            State::Id => 4,
            State::Len | State::Flags => 1,
            State::Data => self.frame.data_len(),
        }
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes and reset to the initial state. Called when a
    /// connection is torn down or re-established.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Id;
        self.frame = CanFrame::default();
    }

    /// Try to advance the state machine; returns a frame when one
    /// completed.
    fn try_extract_one(&mut self) -> Result<Option<CanFrame>> {
        loop {
            if self.buffer.len() < self.expected() {
                return Ok(None);
            }
            match self.state {
                State::Id => {
                    self.frame.can_id = self.buffer.get_u32();
                    self.state = State::Len;
                }
                State::Len => {
                    self.frame.len = self.buffer.get_u8();
                    self.frame.flags = 0;
                    let raw_len = (self.frame.len & !FD_FRAME) as usize;
                    let max = if self.frame.is_fd() {
                        CANFD_MAX_DLEN
                    } else {
                        CAN_MAX_DLEN
                    };
                    if raw_len > max {
                        return Err(CanwireError::Protocol(format!(
                            "frame length {raw_len} exceeds maximum {max}"
                        )));
                    }
                    if self.frame.is_fd() {
                        self.state = State::Flags;
                    } else if self.frame.is_rtr() || raw_len == 0 {
                        return Ok(Some(self.complete()));
                    } else {
                        self.state = State::Data;
                    }
                }
                State::Flags => {
                    self.frame.flags = self.buffer.get_u8();
                    if self.frame.is_rtr() || self.frame.data_len() == 0 {
                        return Ok(Some(self.complete()));
                    }
                    self.state = State::Data;
                }
                State::Data => {
                    let data_len = self.frame.data_len();
                    self.buffer.copy_to_slice(&mut self.frame.data[..data_len]);
                    return Ok(Some(self.complete()));
                }
            }
        }
    }

    /// Hand out the finished frame and reset for the next record.
    fn complete(&mut self) -> CanFrame {
        self.state = State::Id;
        std::mem::take(&mut self.frame)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}
