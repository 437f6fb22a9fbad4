//! Worker lifecycle and the hand-off seam between the two tunnel sides.
//!
//! A tunnel instance runs two peered workers: one bound to the CAN
//! interface, one to the network. Each worker writes received frames into
//! its *peer's* frame buffer through [`FrameSink::transmit_frame`] and
//! drains its *own* buffer when flushing outbound. The peer reference is
//! wired once before start and read-only afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::buffer::FrameBuffer;
use crate::protocol::wire_format::PACKET_HEADER_SIZE;
use crate::protocol::CanFrame;
use crate::timer::FlushTimer;

pub mod can;
pub mod stream;
pub mod udp;

pub use can::CanShared;
pub use stream::{ConnectionState, StreamShared};
pub use udp::UdpShared;

/// What a worker exposes to its peer: the buffer frames are checked out of,
/// and the entry point that accepts a frame for onward transmission.
pub trait FrameSink: Send + Sync {
    /// The buffer backing this worker's outbound queue.
    fn frame_buffer(&self) -> &FrameBuffer;

    /// Accept a frame for transmission on this worker's side. Takes
    /// ownership; a worker that cannot transmit returns the slot to its
    /// pool.
    fn transmit_frame(&self, frame: CanFrame);
}

/// Running flag plus a wakeup for loops blocked in `select!`.
pub struct Lifecycle {
    running: AtomicBool,
    wake: Notify,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            wake: Notify::new(),
        }
    }

    /// Checked at the top of every loop iteration.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the running flag and wake any pending wait.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Wait until woken. Completes spuriously at most once per
    /// notification; callers re-check their state afterwards.
    pub async fn wakeup(&self) {
        self.wake.notified().await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Stop hook a [`WorkerHandle`] drives; implemented by each worker's shared
/// state so a stop also fires the flush timer and unblocks the loop.
pub trait WorkerControl: Send + Sync {
    fn request_stop(&self);
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
    control: Arc<dyn WorkerControl>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(control: Arc<dyn WorkerControl>, task: JoinHandle<()>) -> Self {
        Self { control, task }
    }

    /// Ask the worker to exit; it observes the flag at the top of its next
    /// loop iteration.
    pub fn stop(&self) {
        self.control.request_stop();
    }

    /// Await worker termination.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!("worker task failed: {e}");
        }
    }
}

/// RX/TX packet counters, reported at shutdown.
#[derive(Default)]
pub struct Counters {
    rx: AtomicU64,
    tx: AtomicU64,
}

impl Counters {
    pub fn add_rx(&self) {
        self.rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tx(&self) {
        self.tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rx(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }

    pub fn tx(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }
}

/// Enqueue a frame on a network worker and arm its flush timer.
///
/// Fires the timer immediately when the next frame's worst case would
/// overflow the packet. Otherwise a custom per-ID deadline shorter than
/// both the default timeout and the pending expiry re-arms the timer.
/// A pending deadline is only ever shortened, never lengthened, so every
/// identifier is flushed no later than its budget.
pub(crate) fn enqueue_adaptive(
    buffer: &FrameBuffer,
    flush: &FlushTimer,
    payload_size: usize,
    default_timeout: Duration,
    timeout_table: &std::collections::HashMap<u32, u64>,
    debug_timer: bool,
    frame: CanFrame,
) {
    let id = frame.masked_id();
    buffer.push_live(frame);
    if !flush.is_enabled() {
        flush.enable();
    }
    if buffer.live_bytes() + PACKET_HEADER_SIZE >= payload_size {
        flush.fire();
    } else if let Some(&timeout_us) = timeout_table.get(&id) {
        let timeout = Duration::from_micros(timeout_us);
        if timeout < default_timeout && timeout < flush.remaining() {
            if debug_timer {
                tracing::debug!(id, timeout_us, "custom flush deadline, re-arming timer");
            }
            flush.adjust(default_timeout, timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn frame(id: u32) -> CanFrame {
        CanFrame::classic(id, &[0u8; 8])
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_enables_disabled_timer() {
        let buffer = FrameBuffer::with_initial(8, 0);
        let flush = FlushTimer::new(Duration::from_millis(100));
        assert!(!flush.is_enabled());

        enqueue_adaptive(
            &buffer,
            &flush,
            1472,
            Duration::from_millis(100),
            &HashMap::new(),
            false,
            frame(0x10),
        );
        assert!(flush.is_enabled());
        let remaining = flush.remaining();
        assert!(remaining > Duration::from_millis(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_fires_on_overflow_threshold() {
        let buffer = FrameBuffer::with_initial(8, 0);
        let flush = FlushTimer::new(Duration::from_millis(100));

        // Payload fits one 13-byte frame next to the 5-byte header but
        // not two.
        for _ in 0..2 {
            enqueue_adaptive(
                &buffer,
                &flush,
                30,
                Duration::from_millis(100),
                &HashMap::new(),
                false,
                frame(0x10),
            );
        }
        assert!(flush.remaining() <= Duration::from_micros(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_deadline_shortens_timer() {
        let buffer = FrameBuffer::with_initial(8, 0);
        let flush = FlushTimer::new(Duration::from_millis(100));
        flush.adjust(Duration::from_millis(100), Duration::from_millis(80));

        let table = HashMap::from([(0x42u32, 5000u64)]);
        enqueue_adaptive(
            &buffer,
            &flush,
            1472,
            Duration::from_millis(100),
            &table,
            false,
            frame(0x42),
        );
        let remaining = flush.remaining();
        assert!(remaining <= Duration::from_millis(5));
        assert!(remaining > Duration::from_millis(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tighter_pending_deadline_is_kept() {
        let buffer = FrameBuffer::with_initial(8, 0);
        let flush = FlushTimer::new(Duration::from_millis(100));
        flush.adjust(Duration::from_millis(100), Duration::from_millis(2));

        let table = HashMap::from([(0x42u32, 5000u64)]);
        enqueue_adaptive(
            &buffer,
            &flush,
            1472,
            Duration::from_millis(100),
            &table,
            false,
            frame(0x42),
        );
        // 2 ms pending beats the 5 ms per-ID budget; never lengthened.
        assert!(flush.remaining() <= Duration::from_millis(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_deadline_not_below_default_ignored() {
        let buffer = FrameBuffer::with_initial(8, 0);
        let flush = FlushTimer::new(Duration::from_millis(10));
        flush.adjust(Duration::from_millis(10), Duration::from_millis(8));

        // Table entry is larger than the default timeout.
        let table = HashMap::from([(0x42u32, 50_000u64)]);
        enqueue_adaptive(
            &buffer,
            &flush,
            1472,
            Duration::from_millis(10),
            &table,
            false,
            frame(0x42),
        );
        let remaining = flush.remaining();
        assert!(remaining > Duration::from_millis(7));
    }

    #[test]
    fn test_lifecycle_stop() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_running());
        lifecycle.request_stop();
        assert!(!lifecycle.is_running());
    }
}
