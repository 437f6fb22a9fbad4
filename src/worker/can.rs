//! CAN-side worker: bridges the local CAN interface and the peer's frame
//! buffer.
//!
//! Inbound, a readiness wait on the raw socket hands each received frame to
//! the peer worker after classifying it by byte count (classic vs FD) and
//! setting the FD marker accordingly. Outbound, the flush timer drains this
//! worker's own buffer onto the interface with nonblocking writes; a
//! would-block re-queues the frame at the front and backs the timer off
//! briefly, so a congested bus never blocks the loop.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::buffer::FrameBuffer;
use crate::config::{DebugOptions, TunnelConfig};
use crate::protocol::frame::{CANFD_MTU, CAN_MTU};
use crate::protocol::CanFrame;
use crate::timer::FlushTimer;
use crate::transport::CanSocket;

use super::{Counters, FrameSink, Lifecycle, WorkerControl, WorkerHandle};

/// Sweep interval of the outbound flush timer. Enqueues fire the timer
/// immediately, so this only bounds the retry cadence after errors.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Re-arm delay after the interface reported would-block.
const WRITE_BACKOFF: Duration = Duration::from_micros(25);

/// State shared between the CAN worker task and its peer.
pub struct CanShared {
    buffer: FrameBuffer,
    flush: FlushTimer,
    lifecycle: Lifecycle,
    peer: OnceLock<Arc<dyn FrameSink>>,
    debug: DebugOptions,
    counters: Counters,
}

impl CanShared {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            buffer: FrameBuffer::new(config.pool_cap),
            flush: FlushTimer::new(FLUSH_INTERVAL),
            lifecycle: Lifecycle::new(),
            peer: OnceLock::new(),
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
}

impl FrameSink for CanShared {
    fn frame_buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Queue a frame for the local interface and trigger an immediate
    /// flush.
    fn transmit_frame(&self, frame: CanFrame) {
        self.buffer.push_live(frame);
        self.flush.fire();
    }
}

impl WorkerControl for CanShared {
    fn request_stop(&self) {
        self.lifecycle.request_stop();
        self.flush.fire();
    }
}

/// Spawn the CAN worker task.
pub fn start(shared: Arc<CanShared>, socket: CanSocket) -> WorkerHandle {
    let task = tokio::spawn(run(shared.clone(), socket));
    WorkerHandle::new(shared, task)
}

enum Event {
    Received(std::io::Result<usize>),
    Flush,
    Wake,
}

async fn run(shared: Arc<CanShared>, socket: CanSocket) {
    tracing::info!("CAN worker up and running");
    shared.flush.adjust(FLUSH_INTERVAL, FLUSH_INTERVAL);

    let mut slot: Option<CanFrame> = None;
    while shared.lifecycle.is_running() {
        if slot.is_none() {
            slot = shared.peer().frame_buffer().checkout(true);
            if slot.is_none() {
                tracing::warn!("peer frame pool depleted");
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
        }

        let event = tokio::select! {
            result = socket.recv_into(slot.as_mut().expect("slot checked out above")) => {
                Event::Received(result)
            }
            _ = shared.flush.expired() => Event::Flush,
            _ = shared.lifecycle.wakeup() => Event::Wake,
        };

        match event {
            Event::Received(Ok(n)) if n == CAN_MTU || n == CANFD_MTU => {
                let mut frame = slot.take().expect("slot checked out above");
                frame.set_fd(n == CANFD_MTU);
                shared.counters.add_rx();
                if shared.debug.can {
                    tracing::debug!(frame = ?frame, "can rx");
                }
                shared.peer().transmit_frame(frame);
            }
            Event::Received(Ok(n)) => {
                tracing::warn!(bytes = n, "incomplete CAN frame, discarding");
            }
            Event::Received(Err(e)) => {
                tracing::error!("CAN read error: {e}");
                break;
            }
            Event::Flush => {
                if shared.buffer.live_bytes() > 0 {
                    drain(&shared, &socket);
                }
            }
            Event::Wake => {}
        }
    }

    if let Some(frame) = slot.take() {
        shared.peer().frame_buffer().return_to_pool(frame);
    }
    if shared.debug.buffer {
        shared.buffer.debug_stats();
    }
    shared.buffer.reset();
    tracing::info!(
        tx = shared.counters.tx(),
        rx = shared.counters.rx(),
        "CAN worker shutting down"
    );
}

/// Write buffered frames to the interface until the queue is empty or the
/// interface pushes back.
fn drain(shared: &CanShared, socket: &CanSocket) {
    while let Some(mut frame) = shared.buffer.pop_live_front() {
        let fd_frame = frame.is_fd();
        if fd_frame && !socket.supports_fd() {
            tracing::warn!(
                frame = ?frame,
                "dropping CAN FD frame: interface only supports classic frames"
            );
            shared.buffer.return_to_pool(frame);
            continue;
        }
        frame.set_fd(false);
        match socket.try_send(&frame, fd_frame) {
            Ok(()) => {
                shared.counters.add_tx();
                if shared.debug.can {
                    tracing::debug!(frame = ?frame, "can tx");
                }
                shared.buffer.return_to_pool(frame);
            }
            Err(e) => {
                frame.set_fd(fd_frame);
                shared.buffer.push_live_front(frame);
                shared.flush.adjust(FLUSH_INTERVAL, WRITE_BACKOFF);
                if shared.debug.can {
                    tracing::debug!("CAN write deferred: {e}");
                }
                break;
            }
        }
    }
}
