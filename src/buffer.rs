//! Bounded frame buffer shared between a worker pair.
//!
//! Owns three containers of frame slots:
//!
//! - `pool`: free slots available for checkout
//! - `live`: frames awaiting transmission (the producer appends)
//! - `intermediate`: snapshot under transmission (the consumer drains)
//!
//! When a flush starts, `live` and `intermediate` are swapped so the
//! producer keeps filling an empty queue while the consumer encodes the
//! snapshot; sorting happens on the intermediate side only. Every container
//! has its own lock and all critical sections are O(1) except the
//! consumer-side sort, so the hand-off between the two workers stays cheap.
//!
//! Lock order, where an operation needs more than one container:
//! pool < live < intermediate.
//!
//! `live_bytes` tracks the header-free wire size of the live queue
//! ([`CanFrame::buffered_size`] summed), maintained incrementally as frames
//! enter and leave; the network worker compares it against the packet
//! payload size to decide when to flush early.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::protocol::CanFrame;

/// Slots preallocated at construction.
pub const DEFAULT_POOL_SIZE: usize = 1000;

/// A frame queue with its running wire-size counter.
#[derive(Default)]
struct FrameQueue {
    frames: VecDeque<CanFrame>,
    bytes: usize,
}

impl FrameQueue {
    fn push_back(&mut self, frame: CanFrame) {
        self.bytes += frame.buffered_size();
        self.frames.push_back(frame);
    }

    fn push_front(&mut self, frame: CanFrame) {
        self.bytes += frame.buffered_size();
        self.frames.push_front(frame);
    }

    fn pop_front(&mut self) -> Option<CanFrame> {
        let frame = self.frames.pop_front()?;
        self.bytes -= frame.buffered_size();
        Some(frame)
    }
}

/// Thread-safe pool-backed frame buffer.
///
/// A slot is owned by exactly one of pool, live, intermediate or the caller
/// that checked it out; transfers are explicit moves through the methods
/// below, so `pool + live + intermediate + in-flight = allocated` holds at
/// all times.
pub struct FrameBuffer {
    pool: Mutex<Vec<CanFrame>>,
    live: Mutex<FrameQueue>,
    intermediate: Mutex<FrameQueue>,
    /// Slots allocated over the buffer's lifetime; never shrinks.
    allocated: AtomicUsize,
    /// Allocation cap; 0 means the pool grows without bound.
    max_slots: usize,
}

impl FrameBuffer {
    /// Create a buffer with the default preallocation and the given cap
    /// (0 = unbounded).
    pub fn new(max_slots: usize) -> Self {
        let initial = if max_slots > 0 {
            DEFAULT_POOL_SIZE.min(max_slots)
        } else {
            DEFAULT_POOL_SIZE
        };
        Self::with_initial(initial, max_slots)
    }

    /// Create a buffer with an explicit preallocation count.
    pub fn with_initial(initial: usize, max_slots: usize) -> Self {
        let initial = if max_slots > 0 {
            initial.min(max_slots)
        } else {
            initial
        };
        let pool: Vec<CanFrame> = (0..initial).map(|_| CanFrame::default()).collect();
        Self {
            pool: Mutex::new(pool),
            live: Mutex::new(FrameQueue::default()),
            intermediate: Mutex::new(FrameQueue::default()),
            allocated: AtomicUsize::new(initial),
            max_slots,
        }
    }

    /// Take a free slot.
    ///
    /// If the pool is empty it grows by `min(allocated, max_slots −
    /// allocated)` slots (at least one; unbounded growth when the cap is
    /// 0). If the cap is reached and `overwrite_oldest` is set, the oldest
    /// frame in the live queue is evicted and its slot reused, so the
    /// buffer keeps the most recent frames under pressure. Returns `None`
    /// when no slot can be produced.
    pub fn checkout(&self, overwrite_oldest: bool) -> Option<CanFrame> {
        {
            let mut pool = self.pool.lock().expect("pool lock poisoned");
            if pool.is_empty() {
                self.grow(&mut pool);
            }
            if let Some(frame) = pool.pop() {
                return Some(frame);
            }
        }
        if overwrite_oldest {
            let mut live = self.live.lock().expect("live lock poisoned");
            if let Some(frame) = live.pop_front() {
                tracing::debug!(
                    id = frame.masked_id(),
                    "pool cap reached, evicting oldest buffered frame"
                );
                return Some(frame);
            }
        }
        None
    }

    /// Put a slot back into the pool unconditionally.
    pub fn return_to_pool(&self, frame: CanFrame) {
        self.pool.lock().expect("pool lock poisoned").push(frame);
    }

    /// Append a frame to the live queue.
    pub fn push_live(&self, frame: CanFrame) {
        self.live.lock().expect("live lock poisoned").push_back(frame);
    }

    /// Prepend a frame to the live queue. Used to replay a frame after the
    /// CAN interface reported would-block.
    pub fn push_live_front(&self, frame: CanFrame) {
        self.live
            .lock()
            .expect("live lock poisoned")
            .push_front(frame);
    }

    /// Remove and return the front of the live queue.
    pub fn pop_live_front(&self) -> Option<CanFrame> {
        self.live.lock().expect("live lock poisoned").pop_front()
    }

    /// Header-free wire size of the live queue.
    pub fn live_bytes(&self) -> usize {
        self.live.lock().expect("live lock poisoned").bytes
    }

    /// Number of frames in the live queue.
    pub fn live_len(&self) -> usize {
        self.live.lock().expect("live lock poisoned").frames.len()
    }

    /// Exchange the live queue with the intermediate queue, byte counters
    /// included.
    pub fn swap(&self) {
        let mut live = self.live.lock().expect("live lock poisoned");
        let mut intermediate = self
            .intermediate
            .lock()
            .expect("intermediate lock poisoned");
        std::mem::swap(&mut *live, &mut *intermediate);
    }

    /// Stable-sort the intermediate queue by masked CAN identifier,
    /// ascending. FD and classic frames interleave by identifier.
    pub fn sort_intermediate(&self) {
        let mut intermediate = self
            .intermediate
            .lock()
            .expect("intermediate lock poisoned");
        intermediate
            .frames
            .make_contiguous()
            .sort_by_key(|frame| frame.masked_id());
    }

    /// Run `f` with the intermediate queue locked. The closure must not
    /// block; the consumer encodes the snapshot here and sends it after the
    /// lock is released.
    pub fn with_intermediate<R>(&self, f: impl FnOnce(&mut VecDeque<CanFrame>) -> R) -> R {
        let mut intermediate = self
            .intermediate
            .lock()
            .expect("intermediate lock poisoned");
        f(&mut intermediate.frames)
    }

    /// Move the intermediate suffix starting at `from_index` back onto the
    /// front of the live queue, preserving order. Used when a packet
    /// overflows mid-drain and the remainder must wait for the next flush.
    pub fn return_intermediate_tail(&self, from_index: usize) {
        let mut live = self.live.lock().expect("live lock poisoned");
        let mut intermediate = self
            .intermediate
            .lock()
            .expect("intermediate lock poisoned");
        if from_index >= intermediate.frames.len() {
            return;
        }
        let tail = intermediate.frames.split_off(from_index);
        for frame in tail.into_iter().rev() {
            intermediate.bytes -= frame.buffered_size();
            live.push_front(frame);
        }
    }

    /// Move every intermediate slot back into the pool.
    pub fn merge_intermediate_to_pool(&self) {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        let mut intermediate = self
            .intermediate
            .lock()
            .expect("intermediate lock poisoned");
        pool.extend(intermediate.frames.drain(..));
        intermediate.bytes = 0;
    }

    /// Move all live and intermediate slots back to the pool and zero both
    /// byte counters. Called when a connection is (re-)established and on
    /// shutdown.
    pub fn reset(&self) {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        let mut live = self.live.lock().expect("live lock poisoned");
        let mut intermediate = self
            .intermediate
            .lock()
            .expect("intermediate lock poisoned");
        pool.extend(live.frames.drain(..));
        pool.extend(intermediate.frames.drain(..));
        live.bytes = 0;
        intermediate.bytes = 0;
    }

    /// Total slots allocated so far.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Free slots currently in the pool.
    pub fn pool_len(&self) -> usize {
        self.pool.lock().expect("pool lock poisoned").len()
    }

    /// Log container sizes on the buffer debug channel.
    pub fn debug_stats(&self) {
        let pool = self.pool_len();
        let (live, live_bytes) = {
            let live = self.live.lock().expect("live lock poisoned");
            (live.frames.len(), live.bytes)
        };
        let intermediate = self
            .intermediate
            .lock()
            .expect("intermediate lock poisoned")
            .frames
            .len();
        tracing::info!(
            pool,
            live,
            live_bytes,
            intermediate,
            allocated = self.allocated(),
            "frame buffer state"
        );
    }

    /// Grow the pool; caller holds the pool lock. The allocation counter is
    /// only modified here.
    fn grow(&self, pool: &mut Vec<CanFrame>) {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let grow_by = if self.max_slots > 0 {
            if allocated >= self.max_slots {
                return;
            }
            allocated.max(1).min(self.max_slots - allocated)
        } else {
            allocated.max(1)
        };
        pool.extend((0..grow_by).map(|_| CanFrame::default()));
        self.allocated.fetch_add(grow_by, Ordering::Relaxed);
        tracing::debug!(total = allocated + grow_by, "frame pool grown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, data: &[u8]) -> CanFrame {
        CanFrame::classic(id, data)
    }

    #[test]
    fn test_checkout_and_return() {
        let buffer = FrameBuffer::with_initial(4, 0);
        let slot = buffer.checkout(false).unwrap();
        assert_eq!(buffer.pool_len(), 3);
        buffer.return_to_pool(slot);
        assert_eq!(buffer.pool_len(), 4);
        assert_eq!(buffer.allocated(), 4);
    }

    #[test]
    fn test_pool_grows_when_empty() {
        let buffer = FrameBuffer::with_initial(2, 0);
        let a = buffer.checkout(false).unwrap();
        let b = buffer.checkout(false).unwrap();
        // Pool empty; next checkout doubles the allocation.
        let c = buffer.checkout(false).unwrap();
        assert_eq!(buffer.allocated(), 4);
        buffer.return_to_pool(a);
        buffer.return_to_pool(b);
        buffer.return_to_pool(c);
    }

    #[test]
    fn test_growth_respects_cap() {
        let buffer = FrameBuffer::with_initial(3, 4);
        let mut slots = Vec::new();
        for _ in 0..4 {
            slots.push(buffer.checkout(false).unwrap());
        }
        assert_eq!(buffer.allocated(), 4);
        assert!(buffer.checkout(false).is_none());
    }

    #[test]
    fn test_eviction_returns_oldest_live_frame() {
        let buffer = FrameBuffer::with_initial(2, 2);
        for i in 0..2 {
            let mut slot = buffer.checkout(true).unwrap();
            slot.can_id = i;
            slot.len = 1;
            buffer.push_live(slot);
        }
        // Cap reached; the oldest live frame (id 0) is evicted.
        let evicted = buffer.checkout(true).unwrap();
        assert_eq!(evicted.can_id, 0);
        assert_eq!(buffer.live_len(), 1);
        assert_eq!(buffer.allocated(), 2);
    }

    #[test]
    fn test_ring_buffer_keeps_most_recent() {
        let buffer = FrameBuffer::with_initial(16, 16);
        for i in 0..17u32 {
            let mut slot = buffer.checkout(true).unwrap();
            slot.can_id = i;
            slot.len = 1;
            slot.data[0] = i as u8;
            buffer.push_live(slot);
        }
        let ids: Vec<u32> = {
            buffer.swap();
            buffer.with_intermediate(|frames| frames.iter().map(|f| f.can_id).collect())
        };
        assert_eq!(ids, (1..17).collect::<Vec<u32>>());
    }

    #[test]
    fn test_no_eviction_without_overwrite() {
        let buffer = FrameBuffer::with_initial(1, 1);
        let slot = buffer.checkout(false).unwrap();
        buffer.push_live(slot);
        assert!(buffer.checkout(false).is_none());
        assert_eq!(buffer.live_len(), 1);
    }

    #[test]
    fn test_live_bytes_accounting() {
        let buffer = FrameBuffer::with_initial(8, 0);
        assert_eq!(buffer.live_bytes(), 0);

        buffer.push_live(frame(0x1, &[0; 3]));
        assert_eq!(buffer.live_bytes(), 5 + 3);

        buffer.push_live(CanFrame::fd(0x2, 0, &[0; 12]));
        assert_eq!(buffer.live_bytes(), 5 + 3 + 5 + 12 + 1);

        // RTR frames count their length code toward the estimate.
        buffer.push_live(CanFrame::rtr(0x3, 8));
        assert_eq!(buffer.live_bytes(), 5 + 3 + 5 + 12 + 1 + 5 + 8);

        let popped = buffer.pop_live_front().unwrap();
        assert_eq!(buffer.live_bytes(), 5 + 12 + 1 + 5 + 8);
        buffer.return_to_pool(popped);
    }

    #[test]
    fn test_push_front_replay_order() {
        let buffer = FrameBuffer::with_initial(4, 0);
        buffer.push_live(frame(1, &[]));
        buffer.push_live(frame(2, &[]));

        let first = buffer.pop_live_front().unwrap();
        assert_eq!(first.can_id, 1);
        buffer.push_live_front(first);
        assert_eq!(buffer.pop_live_front().unwrap().can_id, 1);
        assert_eq!(buffer.pop_live_front().unwrap().can_id, 2);
    }

    #[test]
    fn test_swap_moves_frames_and_bytes() {
        let buffer = FrameBuffer::with_initial(4, 0);
        buffer.push_live(frame(1, &[0; 4]));
        buffer.push_live(frame(2, &[0; 4]));
        let bytes = buffer.live_bytes();

        buffer.swap();
        assert_eq!(buffer.live_bytes(), 0);
        assert_eq!(buffer.live_len(), 0);
        let count = buffer.with_intermediate(|frames| frames.len());
        assert_eq!(count, 2);

        // Swapping back restores the counter exactly.
        buffer.swap();
        assert_eq!(buffer.live_bytes(), bytes);
    }

    #[test]
    fn test_sort_intermediate_by_masked_id() {
        use crate::protocol::frame::CAN_EFF_FLAG;

        let buffer = FrameBuffer::with_initial(8, 0);
        buffer.push_live(frame(0x300, &[]));
        buffer.push_live(CanFrame::fd(0x100, 0, &[0; 9]));
        // Extended frame whose masked id sorts between the others.
        buffer.push_live(frame(0x200 | CAN_EFF_FLAG, &[]));
        buffer.swap();
        buffer.sort_intermediate();

        let ids: Vec<u32> = buffer.with_intermediate(|f| f.iter().map(|f| f.masked_id()).collect());
        assert_eq!(ids, vec![0x100, 0x200, 0x300]);
    }

    #[test]
    fn test_merge_intermediate_returns_slots() {
        let buffer = FrameBuffer::with_initial(4, 0);
        buffer.push_live(frame(1, &[]));
        buffer.push_live(frame(2, &[]));
        buffer.swap();
        buffer.merge_intermediate_to_pool();

        assert_eq!(buffer.pool_len(), 4);
        assert_eq!(buffer.with_intermediate(|f| f.len()), 0);
    }

    #[test]
    fn test_return_intermediate_tail() {
        let buffer = FrameBuffer::with_initial(8, 0);
        for i in 1..=5 {
            buffer.push_live(frame(i, &[0; 2]));
        }
        buffer.swap();

        // First two were sent; the rest go back to the front of live.
        buffer.return_intermediate_tail(2);
        assert_eq!(buffer.with_intermediate(|f| f.len()), 2);
        assert_eq!(buffer.live_len(), 3);
        assert_eq!(buffer.live_bytes(), 3 * (5 + 2));

        let ids: Vec<u32> = std::iter::from_fn(|| buffer.pop_live_front())
            .map(|f| f.can_id)
            .collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_return_intermediate_tail_out_of_range() {
        let buffer = FrameBuffer::with_initial(4, 0);
        buffer.push_live(frame(1, &[]));
        buffer.swap();
        buffer.return_intermediate_tail(5);
        assert_eq!(buffer.with_intermediate(|f| f.len()), 1);
        assert_eq!(buffer.live_len(), 0);
    }

    #[test]
    fn test_reset_restores_pool_conservation() {
        let buffer = FrameBuffer::with_initial(6, 6);
        for i in 0..4 {
            buffer.push_live(frame(i, &[0; 4]));
        }
        buffer.swap();
        buffer.push_live(frame(9, &[0; 4]));

        buffer.reset();
        assert_eq!(buffer.pool_len(), 6);
        assert_eq!(buffer.live_len(), 0);
        assert_eq!(buffer.live_bytes(), 0);
        assert_eq!(buffer.with_intermediate(|f| f.len()), 0);
    }

    #[test]
    fn test_pool_conservation_under_churn() {
        let buffer = FrameBuffer::with_initial(8, 8);
        for round in 0..50u32 {
            let slot = buffer.checkout(true).unwrap();
            buffer.push_live(slot);
            if round % 3 == 0 {
                buffer.swap();
                buffer.merge_intermediate_to_pool();
            }
            let in_pool = buffer.pool_len();
            let in_live = buffer.live_len();
            let in_intermediate = buffer.with_intermediate(|f| f.len());
            assert_eq!(in_pool + in_live + in_intermediate, buffer.allocated());
            assert!(buffer.allocated() <= 8);
        }
    }
}
