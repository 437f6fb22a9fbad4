//! Network-side worker over the reliable transports (TCP, SCTP).
//!
//! Same role as the UDP worker plus a connection state machine:
//!
//! - `Disconnected`: the transport connects or accepts; failures retry
//!   after a fixed delay.
//! - `Connected`: both ends exchange the 12-byte protocol banner; a
//!   mismatch tears the connection down.
//! - `Negotiated`: frames flow. `transmit_frame` outside this state sends
//!   the slot straight back to the pool.
//!
//! Enqueues wake the loop through a coalescing [`Notify`], so drains
//! happen promptly without busy-waiting; a full notification queue simply
//! merges with the pending one. Byte-stream transports exchange flat frame
//! records decoded incrementally; message-oriented transports exchange
//! whole wire packets.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::buffer::FrameBuffer;
use crate::config::{DebugOptions, TunnelConfig};
use crate::error::{CanwireError, Result};
use crate::protocol::codec::{decode_packet, encode_frame, encode_packet};
use crate::protocol::{CanFrame, StreamDecoder, BANNER};
use crate::timer::FlushTimer;
use crate::transport::StreamTransport;

use super::{enqueue_adaptive, Counters, FrameSink, Lifecycle, WorkerControl, WorkerHandle};

/// Delay between connection attempts.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Connection lifecycle of a reliable transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connected = 1,
    Negotiated = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => ConnectionState::Negotiated,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// State shared between the stream worker task and its peer.
pub struct StreamShared {
    buffer: FrameBuffer,
    flush: FlushTimer,
    lifecycle: Lifecycle,
    peer: OnceLock<Arc<dyn FrameSink>>,
    state: AtomicU8,
    signal: Notify,
    payload_size: usize,
    sort: bool,
    default_timeout: Duration,
    timeout_table: std::collections::HashMap<u32, u64>,
    debug: DebugOptions,
    counters: Counters,
}

impl StreamShared {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            buffer: FrameBuffer::new(config.pool_cap),
            flush: FlushTimer::new(config.default_timeout),
            lifecycle: Lifecycle::new(),
            peer: OnceLock::new(),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            signal: Notify::new(),
            payload_size: config.payload_size(),
            sort: config.sort,
            default_timeout: config.default_timeout,
            timeout_table: config.timeout_table.clone(),
            debug: config.debug,
            counters: Counters::default(),
        }
    }

    /// Wire the peer before starting the worker.
    pub fn set_peer(&self, peer: Arc<dyn FrameSink>) {
        if self.peer.set(peer).is_err() {
            panic!("peer already wired");
        }
    }

    fn peer(&self) -> &Arc<dyn FrameSink> {
        self.peer.get().expect("peer wired before start")
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl FrameSink for StreamShared {
    fn frame_buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    fn transmit_frame(&self, frame: CanFrame) {
        if self.state() != ConnectionState::Negotiated {
            self.buffer.return_to_pool(frame);
            if self.debug.net {
                tracing::debug!("not connected, dropping frame");
            }
            return;
        }
        enqueue_adaptive(
            &self.buffer,
            &self.flush,
            self.payload_size,
            self.default_timeout,
            &self.timeout_table,
            self.debug.timer,
            frame,
        );
        self.signal.notify_one();
    }
}

impl WorkerControl for StreamShared {
    fn request_stop(&self) {
        self.lifecycle.request_stop();
        self.flush.fire();
    }
}

/// Spawn the stream worker task on a transport.
pub fn start<T: StreamTransport + 'static>(shared: Arc<StreamShared>, transport: T) -> WorkerHandle {
    let task = tokio::spawn(run(shared.clone(), transport));
    WorkerHandle::new(shared, task)
}

enum Event {
    Incoming(Result<usize>),
    Flush,
    Signal,
    Wake,
}

async fn run<T: StreamTransport>(shared: Arc<StreamShared>, mut transport: T) {
    tracing::info!(transport = transport.name(), "stream worker up and running");

    let mut decoder = StreamDecoder::new();
    let mut seq: u8 = 0;
    let mut buf = vec![0u8; 65535];

    while shared.lifecycle.is_running() {
        match shared.state() {
            ConnectionState::Disconnected => {
                let attempt = tokio::select! {
                    result = transport.attempt_connect() => Some(result),
                    _ = shared.lifecycle.wakeup() => None,
                };
                match attempt {
                    Some(Ok(())) => {
                        shared.buffer.reset();
                        decoder.clear();
                        shared.set_state(ConnectionState::Connected);
                    }
                    Some(Err(e)) => {
                        tracing::info!("connect attempt failed: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                            _ = shared.lifecycle.wakeup() => {}
                        }
                    }
                    None => {}
                }
            }
            ConnectionState::Connected => {
                let outcome = tokio::select! {
                    result = negotiate(&mut transport) => Some(result),
                    _ = shared.lifecycle.wakeup() => None,
                };
                match outcome {
                    Some(Ok(())) => {
                        tracing::info!(transport = transport.name(), "peer negotiated");
                        shared.set_state(ConnectionState::Negotiated);
                    }
                    Some(Err(e)) => {
                        tracing::warn!("banner exchange failed: {e}");
                        disconnect(&shared, &mut transport);
                    }
                    None => {}
                }
            }
            ConnectionState::Negotiated => {
                let event = tokio::select! {
                    result = transport.recv(&mut buf) => Event::Incoming(result),
                    _ = shared.flush.expired() => Event::Flush,
                    _ = shared.signal.notified() => Event::Signal,
                    _ = shared.lifecycle.wakeup() => Event::Wake,
                };
                match event {
                    Event::Incoming(Ok(0)) => {
                        tracing::info!("connection closed by peer");
                        disconnect(&shared, &mut transport);
                    }
                    Event::Incoming(Ok(n)) => {
                        let message_oriented = transport.message_oriented();
                        if let Err(e) =
                            handle_incoming(&shared, &mut decoder, &buf[..n], message_oriented)
                        {
                            tracing::warn!("protocol error: {e}");
                            disconnect(&shared, &mut transport);
                        }
                    }
                    Event::Incoming(Err(e)) => {
                        tracing::warn!("receive error: {e}");
                        disconnect(&shared, &mut transport);
                    }
                    Event::Flush => {
                        if shared.buffer.live_bytes() > 0 {
                            if let Err(e) = drain(&shared, &mut transport, &mut seq).await {
                                tracing::warn!("transmit error: {e}");
                                disconnect(&shared, &mut transport);
                            }
                        } else {
                            shared.flush.disable();
                        }
                    }
                    Event::Signal => {
                        if shared.buffer.live_bytes() > 0 {
                            if let Err(e) = drain(&shared, &mut transport, &mut seq).await {
                                tracing::warn!("transmit error: {e}");
                                disconnect(&shared, &mut transport);
                            }
                        }
                    }
                    Event::Wake => {}
                }
            }
        }
    }

    if shared.debug.buffer {
        shared.buffer.debug_stats();
    }
    shared.buffer.reset();
    transport.close();
    tracing::info!(
        tx = shared.counters.tx(),
        rx = shared.counters.rx(),
        "stream worker shutting down"
    );
}

fn disconnect<T: StreamTransport>(shared: &StreamShared, transport: &mut T) {
    shared.set_state(ConnectionState::Disconnected);
    transport.close();
}

/// Exchange the protocol banner: write ours, read exactly the peer's 12
/// bytes and compare.
async fn negotiate<T: StreamTransport>(transport: &mut T) -> Result<()> {
    transport.send(BANNER).await?;

    let mut banner = [0u8; BANNER.len()];
    let mut have = 0;
    while have < banner.len() {
        let n = transport.recv(&mut banner[have..]).await?;
        if n == 0 {
            return Err(CanwireError::Protocol(
                "connection closed during banner exchange".into(),
            ));
        }
        have += n;
    }
    if &banner != BANNER {
        return Err(CanwireError::Protocol("banner mismatch".into()));
    }
    Ok(())
}

/// Forward received bytes to the peer: whole wire packets on
/// message-oriented transports, incrementally decoded records on byte
/// streams. An error on a byte stream is fatal for the connection; a bad
/// packet on a message transport is dropped like a bad datagram.
fn handle_incoming(
    shared: &StreamShared,
    decoder: &mut StreamDecoder,
    data: &[u8],
    message_oriented: bool,
) -> Result<()> {
    let peer = shared.peer();
    if message_oriented {
        let result = decode_packet(
            data,
            || peer.frame_buffer().checkout(true),
            |frame, valid| {
                if valid {
                    if shared.debug.can {
                        tracing::debug!(frame = ?frame, "net rx");
                    }
                    peer.transmit_frame(frame);
                } else {
                    peer.frame_buffer().return_to_pool(frame);
                }
            },
        );
        match result {
            Ok(0) => {}
            Ok(_) => shared.counters.add_rx(),
            Err(e) => tracing::warn!("dropping packet: {e}"),
        }
        return Ok(());
    }

    let frames = decoder.push(data)?;
    if !frames.is_empty() {
        shared.counters.add_rx();
    }
    for frame in frames {
        // The decoded payload travels in a slot from the peer's pool, so
        // the pool cap bounds the byte-stream path too.
        match peer.frame_buffer().checkout(true) {
            Some(mut slot) => {
                slot.clone_from(&frame);
                if shared.debug.can {
                    tracing::debug!(frame = ?slot, "net rx");
                }
                peer.transmit_frame(slot);
            }
            None => tracing::warn!("peer frame pool depleted, dropping frame"),
        }
    }
    Ok(())
}

/// Swap, optionally sort, encode and transmit the buffered frames.
async fn drain<T: StreamTransport>(
    shared: &StreamShared,
    transport: &mut T,
    seq: &mut u8,
) -> Result<()> {
    shared.buffer.swap();
    if shared.sort {
        shared.buffer.sort_intermediate();
    }

    let message_oriented = transport.message_oriented();
    let chunks: Vec<Bytes> = shared.buffer.with_intermediate(|frames| {
        let slice = frames.make_contiguous();
        if message_oriented {
            let mut chunks = Vec::new();
            let mut offset = 0;
            while offset < slice.len() {
                let mut dst = BytesMut::with_capacity(shared.payload_size);
                let consumed = encode_packet(&mut dst, shared.payload_size, *seq, &slice[offset..]);
                if consumed == 0 {
                    tracing::warn!(
                        frame = ?slice[offset],
                        "frame does not fit packet payload, dropping"
                    );
                    offset += 1;
                    continue;
                }
                *seq = seq.wrapping_add(1);
                offset += consumed;
                chunks.push(dst.freeze());
            }
            chunks
        } else {
            let capacity: usize = slice.iter().map(|f| f.buffered_size()).sum();
            let mut dst = BytesMut::with_capacity(capacity);
            for frame in slice.iter() {
                encode_frame(&mut dst, frame);
            }
            if dst.is_empty() {
                Vec::new()
            } else {
                vec![dst.freeze()]
            }
        }
    });

    let mut result = Ok(());
    for chunk in &chunks {
        if let Err(e) = transport.send(chunk).await {
            result = Err(e);
            break;
        }
        shared.counters.add_tx();
        if shared.debug.net {
            tracing::debug!(bytes = chunk.len(), "net tx");
        }
    }
    shared.buffer.merge_intermediate_to_pool();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportMode;
    use std::collections::HashMap;

    fn test_config() -> TunnelConfig {
        TunnelConfig {
            interface: "vcan0".into(),
            local: "127.0.0.1:0".parse().unwrap(),
            remote: Some("127.0.0.1:20001".parse().unwrap()),
            mode: TransportMode::TcpClient,
            default_timeout: Duration::from_millis(50),
            timeout_table: HashMap::new(),
            sort: false,
            check_peer: true,
            bind_to_first: false,
            first_sender_window: Duration::from_secs(60),
            link_mtu: 1500,
            pool_cap: 0,
            debug: DebugOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_transmit_frame_dropped_when_disconnected() {
        let shared = StreamShared::new(&test_config());
        assert_eq!(shared.state(), ConnectionState::Disconnected);

        let frame = shared.buffer.checkout(false).unwrap();
        let pool_before = shared.buffer.pool_len();
        shared.transmit_frame(frame);
        assert_eq!(shared.buffer.live_len(), 0);
        assert_eq!(shared.buffer.pool_len(), pool_before + 1);
    }

    #[tokio::test]
    async fn test_transmit_frame_queued_when_negotiated() {
        let shared = StreamShared::new(&test_config());
        shared.set_state(ConnectionState::Negotiated);

        let frame = shared.buffer.checkout(false).unwrap();
        shared.transmit_frame(frame);
        assert_eq!(shared.buffer.live_len(), 1);
        assert!(shared.flush.is_enabled());
    }

    struct QueueingPeer {
        buffer: FrameBuffer,
    }

    impl FrameSink for QueueingPeer {
        fn frame_buffer(&self) -> &FrameBuffer {
            &self.buffer
        }

        fn transmit_frame(&self, frame: CanFrame) {
            self.buffer.push_live(frame);
        }
    }

    #[tokio::test]
    async fn test_byte_stream_decode_respects_peer_pool_cap() {
        let shared = StreamShared::new(&test_config());
        let peer = Arc::new(QueueingPeer {
            buffer: FrameBuffer::with_initial(4, 4),
        });
        shared.set_peer(peer.clone());

        // Six records against a four-slot pool whose consumer is stalled.
        let mut decoder = StreamDecoder::new();
        let mut data = Vec::new();
        let mut dst = BytesMut::new();
        for i in 0..6u32 {
            dst.clear();
            encode_frame(&mut dst, &CanFrame::classic(i, &[i as u8]));
            data.extend_from_slice(&dst);
        }
        handle_incoming(&shared, &mut decoder, &data, false).unwrap();

        // Pool conservation holds at the cap; the two oldest frames were
        // evicted to carry the newest.
        assert_eq!(peer.buffer.allocated(), 4);
        assert_eq!(peer.buffer.pool_len(), 0);
        assert_eq!(peer.buffer.live_len(), 4);

        let queued: Vec<CanFrame> = std::iter::from_fn(|| peer.buffer.pop_live_front()).collect();
        let ids: Vec<u32> = queued.iter().map(|f| f.can_id).collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
        for frame in &queued {
            assert_eq!(frame.payload(), &[frame.can_id as u8]);
        }
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let shared = StreamShared::new(&test_config());
        shared.set_state(ConnectionState::Connected);
        assert_eq!(shared.state(), ConnectionState::Connected);
        shared.set_state(ConnectionState::Negotiated);
        assert_eq!(shared.state(), ConnectionState::Negotiated);
        shared.set_state(ConnectionState::Disconnected);
        assert_eq!(shared.state(), ConnectionState::Disconnected);
    }
}
