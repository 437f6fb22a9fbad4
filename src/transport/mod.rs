//! Carrier sockets: the raw CAN socket, TCP client/server and SCTP
//! client/server.
//!
//! The reliable carriers implement [`StreamTransport`], the seam the stream
//! worker is generic over: one connect/accept attempt, receive, send and
//! teardown. The worker owns retry pacing, the banner exchange and the
//! connection state machine; transports only move bytes.

use std::os::fd::{AsRawFd, RawFd};

use async_trait::async_trait;

use crate::error::Result;

pub mod can;
pub mod sctp;
pub mod tcp;

pub use can::CanSocket;
pub use sctp::{SctpClientTransport, SctpServerTransport};
pub use tcp::{TcpClientTransport, TcpServerTransport};

/// Transport hooks for the stream worker (TCP/SCTP).
#[async_trait]
pub trait StreamTransport: Send {
    /// Short carrier name for log lines.
    fn name(&self) -> &'static str;

    /// Whether the carrier preserves message boundaries. Message-oriented
    /// carriers exchange whole wire packets; byte streams exchange flat
    /// frame records.
    fn message_oriented(&self) -> bool;

    /// One connect (client) or accept (server) attempt. The worker sleeps
    /// and retries on failure.
    async fn attempt_connect(&mut self) -> Result<()>;

    /// Receive into `buf`. `Ok(0)` signals an orderly shutdown by the
    /// peer.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Send the whole buffer; a short or failed send is an error and
    /// disconnects.
    async fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Drop the current connection, keeping any listener for the next
    /// accept.
    fn close(&mut self);
}

/// Owned file descriptor for the libc-level sockets (CAN, SCTP). Closes on
/// drop.
pub struct RawSocket(RawFd);

impl RawSocket {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.0
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}
