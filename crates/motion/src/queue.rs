//! The shared block ring buffer between the planner and the step
//! generator.
//!
//! Four indices partition the ring: `tail` is the block the consumer is
//! executing, `nonbusy` is the first block the consumer has not yet
//! latched, `planned` is the first block whose entry speed is not yet
//! proven optimal, and `head` is the next free slot. `head` is advanced
//! only by the producer — with release ordering, *after* the block fields
//! it publishes — `tail` and `nonbusy` advance as the consumer latches and
//! recycles blocks, and `planned` belongs to the look-ahead passes (the
//! consumer drags it along only when it latches the block it points at).
//!
//! Capacity is a compile-time power of two so indices wrap with a mask.
//! There is exactly one producer and one consumer; [`BlockQueue::split`]
//! hands out one half to each, in the manner of an SPSC queue split.
//! No mutex anywhere: the busy/recalculate flag handshake on each block
//! (see [`QueueProducer::try_set_entry_speed`]) is the only
//! synchronisation beyond the index ordering.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::block::{flag, Block};
use crate::config::BLOCK_DELAY_FOR_1ST_MOVE;

/// Ring buffer of [`Block`]s with single-producer/single-consumer access.
pub struct BlockQueue<const N: usize> {
    blocks: [UnsafeCell<Block>; N],
    head: AtomicUsize,
    tail: AtomicUsize,
    planned: AtomicUsize,
    nonbusy: AtomicUsize,
    /// Absolute millisecond deadline before which the first move of a
    /// freshly filled queue is withheld from the consumer; 0 when disarmed.
    deliver_after: AtomicU32,
}

// The SPSC protocol above is what makes shared access sound: block fields
// are only written on the producer side while the block is unlatched, and
// cross-flow signalling goes through the atomic flag byte and indices.
unsafe impl<const N: usize> Sync for BlockQueue<N> {}

impl<const N: usize> BlockQueue<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "block queue capacity must be a power of two");
        N - 1
    };

    pub const fn new() -> Self {
        Self {
            blocks: [const { UnsafeCell::new(Block::EMPTY) }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            planned: AtomicUsize::new(0),
            nonbusy: AtomicUsize::new(0),
            deliver_after: AtomicU32::new(0),
        }
    }

    /// Split the queue into its producer (planner) and consumer (step
    /// generator) halves.
    pub fn split(&mut self) -> (QueueProducer<'_, N>, QueueConsumer<'_, N>) {
        let queue: &Self = self;
        (QueueProducer { queue }, QueueConsumer { queue })
    }

    #[inline]
    pub(crate) fn next_index(i: usize) -> usize {
        (i + 1) & Self::MASK
    }

    #[inline]
    pub(crate) fn prev_index(i: usize) -> usize {
        (i + N - 1) & Self::MASK
    }

    #[inline]
    pub(crate) fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn planned(&self) -> usize {
        self.planned.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_planned(&self, index: usize) {
        self.planned.store(index, Ordering::Release);
    }

    /// Number of blocks currently queued (including latched ones).
    pub fn occupancy(&self) -> usize {
        (self.head().wrapping_sub(self.tail())) & Self::MASK
    }

    pub fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    /// Shared view of a slot. Sound under the SPSC protocol: the fields a
    /// reader may inspect are stable for the block states it can observe.
    pub(crate) fn block(&self, index: usize) -> &Block {
        unsafe { &*self.blocks[index].get() }
    }
}

impl<const N: usize> Default for BlockQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The planner's half of the queue: staging, publishing and retuning
/// blocks.
pub struct QueueProducer<'a, const N: usize> {
    queue: &'a BlockQueue<N>,
}

impl<'a, const N: usize> QueueProducer<'a, N> {
    pub(crate) fn queue(&self) -> &BlockQueue<N> {
        self.queue
    }

    /// Index of the free staging slot at `head`, or `None` while the ring
    /// is full (fullness: `next(head) == tail`).
    pub fn free_slot(&self) -> Option<usize> {
        let head = self.queue.head.load(Ordering::Relaxed);
        if BlockQueue::<N>::next_index(head) == self.queue.tail() {
            None
        } else {
            Some(head)
        }
    }

    /// Exclusive access to an unlatched slot. Only the staging slot at
    /// `head` and queued blocks the consumer has not latched may be handed
    /// out; the planner-side call sites uphold this.
    pub(crate) fn block_mut(&mut self, index: usize) -> &mut Block {
        unsafe { &mut *self.queue.blocks[index].get() }
    }

    pub(crate) fn block(&self, index: usize) -> &Block {
        self.queue.block(index)
    }

    /// Publish the staged block at `head`. A release store orders every
    /// block field written before it; arming of the first-move delivery
    /// delay happens while the queue is still observably empty, so the
    /// consumer cannot race it.
    pub(crate) fn commit(&mut self, now_ms: u32) {
        let q = self.queue;
        let head = q.head.load(Ordering::Relaxed);
        if head == q.tail() {
            let deadline = now_ms.wrapping_add(BLOCK_DELAY_FOR_1ST_MOVE).max(1);
            q.deliver_after.store(deadline, Ordering::Relaxed);
        }
        q.head.store(BlockQueue::<N>::next_index(head), Ordering::Release);
    }

    /// Set a block's entry speed under the busy/recalculate handshake:
    /// raise `RECALCULATE` first, re-read `BUSY`, then either write the
    /// speed (leaving the block marked for a trapezoid refit) or back out
    /// without ever leaving `RECALCULATE` set on a busy block.
    ///
    /// Returns `false` when the consumer latched the block first.
    pub(crate) fn try_set_entry_speed(&mut self, index: usize, entry_speed_sqr: f32) -> bool {
        let block = self.queue.block(index);
        block.set_flag(flag::RECALCULATE);
        if block.is_busy() {
            block.clear_flag(flag::RECALCULATE);
            return false;
        }
        self.block_mut(index).entry_speed_sqr = entry_speed_sqr;
        true
    }

    /// Drop every queued block: `head`, `planned` and `nonbusy` all snap
    /// to `tail`, and the first-move delay disarms. The one routine
    /// allowed to move `head` backwards. The caller must hold the step
    /// generator off for the duration (`tail` stays consumer-owned and is
    /// treated as read-only here).
    pub(crate) fn clear(&mut self) {
        let q = self.queue;
        let tail = q.tail();
        q.head.store(tail, Ordering::Release);
        q.planned.store(tail, Ordering::Release);
        q.nonbusy.store(tail, Ordering::Release);
        q.deliver_after.store(0, Ordering::Release);
    }

    pub fn occupancy(&self) -> usize {
        self.queue.occupancy()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The step generator's half of the queue: latching, executing and
/// recycling blocks in strict FIFO order.
pub struct QueueConsumer<'a, const N: usize> {
    queue: &'a BlockQueue<N>,
}

impl<'a, const N: usize> QueueConsumer<'a, N> {
    /// Latch the block at `tail` for execution.
    ///
    /// Returns `None` when the queue is empty, while the first-move
    /// delivery delay is still pending with fewer than 3 moves queued, or
    /// when the tail block's trapezoid is mid-refit (`RECALCULATE` set).
    ///
    /// Latching marks the block `BUSY` — freezing it against the planner —
    /// and advances `nonbusy` past it, dragging `planned` along if it
    /// pointed here. Calling again before [`Self::discard_current`]
    /// returns the same block.
    pub fn current_block(&mut self, now_ms: u32) -> Option<&Block> {
        let q = self.queue;
        let tail = q.tail.load(Ordering::Relaxed);
        if tail == q.head() {
            return None;
        }

        let deadline = q.deliver_after.load(Ordering::Acquire);
        if deadline != 0 {
            let pending = (deadline.wrapping_sub(now_ms) as i32) > 0;
            if pending && q.occupancy() < 3 {
                return None;
            }
            q.deliver_after.store(0, Ordering::Release);
        }

        let block = q.block(tail);
        if block.has(flag::RECALCULATE) {
            return None;
        }

        if !block.is_busy() {
            block.set_flag(flag::BUSY);
            let nonbusy = BlockQueue::<N>::next_index(tail);
            q.nonbusy.store(nonbusy, Ordering::Release);
            let _ = q.planned.compare_exchange(
                tail,
                nonbusy,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        Some(block)
    }

    /// Recycle the executed block and advance `tail`.
    pub fn discard_current(&mut self) {
        let q = self.queue;
        let tail = q.tail.load(Ordering::Relaxed);
        if tail == q.head() {
            return;
        }
        q.block(tail).clear_flag(flag::BUSY);
        q.tail.store(BlockQueue::<N>::next_index(tail), Ordering::Release);
    }

    /// Visit queued blocks from oldest to newest without latching them.
    /// Diagnostic aid for hosts and tests; call while the planner is
    /// quiescent.
    pub fn visit_queued(&self, mut f: impl FnMut(usize, &Block)) {
        let q = self.queue;
        let mut index = q.tail();
        let head = q.head();
        while index != head {
            f(index, q.block(index));
            index = BlockQueue::<N>::next_index(index);
        }
    }

    pub fn occupancy(&self) -> usize {
        self.queue.occupancy()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
