//! # canwire
//!
//! A SocketCAN-over-IP tunnel: forwards classic CAN 2.0 and CAN FD frames
//! between two hosts over UDP, TCP or SCTP.
//!
//! ## Architecture
//!
//! ```text
//! CAN interface ─► CAN worker ─► net worker's FrameBuffer ─► net worker ─► IP network
//! IP network    ─► net worker ─► CAN worker's FrameBuffer ─► CAN worker ─► CAN interface
//! ```
//!
//! Two long-lived tokio tasks form a worker pair. Each worker writes the
//! frames it receives into its *peer's* bounded frame buffer and drains its
//! *own* buffer when flushing outbound, so back-pressure is absorbed by a
//! fixed-capacity frame pool instead of unbounded queues. The network
//! worker batches frames into length-bounded wire packets, driven by a
//! re-armable flush timer that honors per-CAN-ID deadlines; the reliable
//! transports add a connect/handshake state machine and an incremental
//! frame decoder for the raw byte stream.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use canwire::worker::{can, udp, CanShared, UdpShared};
//! use canwire::transport::CanSocket;
//!
//! let can_shared = Arc::new(CanShared::new(&config));
//! let net_shared = Arc::new(UdpShared::new(&config));
//! can_shared.set_peer(net_shared.clone());
//! net_shared.set_peer(can_shared.clone());
//!
//! let net = udp::start(net_shared, udp_socket);
//! let can = can::start(can_shared, CanSocket::open("can0")?);
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod protocol;
pub mod timer;
pub mod transport;
pub mod worker;

pub use buffer::FrameBuffer;
pub use config::{DebugOptions, TransportMode, TunnelConfig};
pub use error::{CanwireError, Result};
pub use protocol::CanFrame;
pub use timer::FlushTimer;
