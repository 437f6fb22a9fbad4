//! Network-side worker over UDP.
//!
//! Inbound datagrams are peer-checked, decoded and forwarded frame by
//! frame into the peer's buffer. Outbound frames accumulate in this
//! worker's own buffer until the flush timer expires or the live byte
//! count would overflow a packet; the flush swaps the buffers, optionally
//! sorts the snapshot by identifier, packetizes it and sends each packet
//! to the remote. Frames whose identifier carries a stricter flush budget
//! pull the pending deadline forward through the adaptive timer policy.
//!
//! With bind-to-first enabled the first sender's address is adopted as the
//! remote; the binding is dropped again after a configurable inactivity
//! window.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::buffer::FrameBuffer;
use crate::config::{DebugOptions, TunnelConfig};
use crate::protocol::codec::{decode_packet, encode_packet};
use crate::protocol::CanFrame;
use crate::timer::FlushTimer;

use super::{enqueue_adaptive, Counters, FrameSink, Lifecycle, WorkerControl, WorkerHandle};

/// Remote peer binding; interior because bind-to-first rebinds at runtime.
struct RemoteBinding {
    addr: Option<SocketAddr>,
    last_rx: Option<Instant>,
}

/// State shared between the UDP worker task and its peer.
pub struct UdpShared {
    buffer: FrameBuffer,
    flush: FlushTimer,
    lifecycle: Lifecycle,
    peer: OnceLock<Arc<dyn FrameSink>>,
    remote: Mutex<RemoteBinding>,
    payload_size: usize,
    sort: bool,
    check_peer: bool,
    bind_to_first: bool,
    first_sender_window: Duration,
    default_timeout: Duration,
    timeout_table: std::collections::HashMap<u32, u64>,
    debug: DebugOptions,
    counters: Counters,
}

impl UdpShared {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            buffer: FrameBuffer::new(config.pool_cap),
            flush: FlushTimer::new(config.default_timeout),
            lifecycle: Lifecycle::new(),
            peer: OnceLock::new(),
            remote: Mutex::new(RemoteBinding {
                addr: config.remote,
                last_rx: None,
            }),
            payload_size: config.payload_size(),
            sort: config.sort,
            check_peer: config.check_peer,
            bind_to_first: config.bind_to_first,
            first_sender_window: config.first_sender_window,
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

    /// The currently bound remote, if any.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote.lock().expect("remote lock poisoned").addr
    }

    /// Decide whether a datagram from `addr` is accepted, adopting or
    /// refreshing the bind-to-first binding along the way.
    fn accept_source(&self, addr: SocketAddr) -> bool {
        let mut binding = self.remote.lock().expect("remote lock poisoned");
        if self.bind_to_first {
            let stale = binding
                .last_rx
                .map_or(true, |t| t.elapsed() >= self.first_sender_window);
            let accepted = match binding.addr {
                None => {
                    tracing::info!(remote = %addr, "bound to first sender");
                    binding.addr = Some(addr);
                    true
                }
                Some(bound) if bound.ip() == addr.ip() => true,
                Some(_) if stale => {
                    tracing::info!(remote = %addr, "first-sender binding expired, rebinding");
                    binding.addr = Some(addr);
                    true
                }
                Some(_) if !self.check_peer => true,
                Some(_) => {
                    tracing::warn!(from = %addr, "dropping datagram from unexpected sender");
                    false
                }
            };
            if accepted {
                binding.last_rx = Some(Instant::now());
            }
            accepted
        } else if self.check_peer {
            match binding.addr {
                Some(remote) if remote.ip() == addr.ip() => true,
                _ => {
                    tracing::warn!(from = %addr, "dropping datagram from unexpected sender");
                    false
                }
            }
        } else {
            true
        }
    }
}

impl FrameSink for UdpShared {
    fn frame_buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    fn transmit_frame(&self, frame: CanFrame) {
        enqueue_adaptive(
            &self.buffer,
            &self.flush,
            self.payload_size,
            self.default_timeout,
            &self.timeout_table,
            self.debug.timer,
            frame,
        );
    }
}

impl WorkerControl for UdpShared {
    fn request_stop(&self) {
        self.lifecycle.request_stop();
        self.flush.fire();
    }
}

/// Spawn the UDP worker task on a bound socket.
pub fn start(shared: Arc<UdpShared>, socket: UdpSocket) -> WorkerHandle {
    let task = tokio::spawn(run(shared.clone(), socket));
    WorkerHandle::new(shared, task)
}

enum Event {
    Datagram(std::io::Result<(usize, SocketAddr)>),
    Flush,
    Wake,
}

async fn run(shared: Arc<UdpShared>, socket: UdpSocket) {
    tracing::info!("UDP worker up and running");
    shared
        .flush
        .adjust(shared.default_timeout, shared.default_timeout);

    let mut seq: u8 = 0;
    let mut buf = vec![0u8; 65535];
    while shared.lifecycle.is_running() {
        let event = tokio::select! {
            result = socket.recv_from(&mut buf) => Event::Datagram(result),
            _ = shared.flush.expired() => Event::Flush,
            _ = shared.lifecycle.wakeup() => Event::Wake,
        };

        match event {
            Event::Datagram(Ok((n, addr))) => handle_datagram(&shared, &buf[..n], addr),
            Event::Datagram(Err(e)) => {
                tracing::error!("recvfrom error: {e}");
                break;
            }
            Event::Flush => {
                if shared.buffer.live_bytes() > 0 {
                    flush_buffer(&shared, &socket, &mut seq).await;
                }
                if shared.buffer.live_bytes() == 0 {
                    shared.flush.disable();
                    // Re-arm if a frame slipped in between the check and
                    // the disable; its enqueue saw an armed timer.
                    if shared.buffer.live_bytes() > 0 {
                        shared.flush.enable();
                    }
                }
            }
            Event::Wake => {}
        }
    }

    if shared.debug.buffer {
        shared.buffer.debug_stats();
    }
    shared.buffer.reset();
    tracing::info!(
        tx = shared.counters.tx(),
        rx = shared.counters.rx(),
        "UDP worker shutting down"
    );
}

fn handle_datagram(shared: &UdpShared, data: &[u8], addr: SocketAddr) {
    if !shared.accept_source(addr) {
        return;
    }
    if shared.debug.net {
        tracing::debug!(bytes = data.len(), from = %addr, "udp rx");
    }

    let peer = shared.peer();
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
        Ok(0) => tracing::debug!(from = %addr, "empty packet ignored"),
        Ok(_) => shared.counters.add_rx(),
        Err(e) => tracing::warn!(from = %addr, "dropping packet: {e}"),
    }
}

/// Swap, optionally sort, packetize and transmit the buffered frames.
async fn flush_buffer(shared: &UdpShared, socket: &UdpSocket, seq: &mut u8) {
    let Some(remote) = shared.remote() else {
        // No peer bound yet; the snapshot is discarded.
        shared.buffer.swap();
        shared.buffer.merge_intermediate_to_pool();
        return;
    };

    shared.buffer.swap();
    if shared.sort {
        shared.buffer.sort_intermediate();
    }

    let packets: Vec<Bytes> = shared.buffer.with_intermediate(|frames| {
        let slice = frames.make_contiguous();
        let mut packets = Vec::new();
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
            packets.push(dst.freeze());
        }
        packets
    });

    for packet in &packets {
        match socket.send_to(packet, remote).await {
            Ok(_) => {
                shared.counters.add_tx();
                if shared.debug.net {
                    tracing::debug!(bytes = packet.len(), to = %remote, "udp tx");
                }
            }
            Err(e) => tracing::error!("UDP transmit error: {e}"),
        }
    }
    shared.buffer.merge_intermediate_to_pool();
}
