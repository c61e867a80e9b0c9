//! Fixed arena of reusable I/O control blocks.
//!
//! Records are addressed by [`SlotId`]. A slot id moves from the free list to
//! the submitter, through the kernel (as `aio_data`), the harvest thread and
//! the hand-off queue, and finally back to the free list. Only the stage that
//! currently holds the id touches the slot, so the per-slot mutex is never
//! contended; it exists to give each stage safe mutable access.

use parking_lot::{Mutex, MutexGuard};

use crate::buffer::AlignedBuffer;
use crate::pattern::IoClass;
use crate::sys::IoOp;
use crate::context::IoCallback;

/// Index of a control block in the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub usize);

impl SlotId {
    /// Value stored in the kernel request's user-data field.
    pub fn as_user_data(self) -> u64 {
        self.0 as u64
    }

    /// Recovers a slot id from a completion's user-data field.
    pub fn from_user_data(data: u64) -> Self {
        SlotId(data as usize)
    }
}

/// One in-flight or pooled I/O request.
#[derive(Default)]
pub struct ControlBlock {
    /// Operation kind.
    pub op: Option<IoOp>,
    /// Data buffer, owned by the block while the request is in flight.
    pub buffer: Option<AlignedBuffer>,
    /// Requested length in bytes.
    pub len: u64,
    /// Byte offset in the file.
    pub offset: u64,
    /// Per-opcode submission sequence number.
    pub index: u64,
    /// Timestamp taken just before submission.
    pub submitted_at_ns: u64,
    /// Timestamp taken when the completion batch was harvested.
    pub completed_at_ns: u64,
    /// Kernel result (bytes transferred or negative errno).
    pub res: i64,
    /// Secondary kernel result.
    pub res2: i64,
    /// Pattern classification assigned at harvest.
    pub io_class: IoClass,
    /// Same-opcode run length observed at submission.
    pub contiguous: u16,
    /// Normalized latency sample in nanoseconds.
    pub cost_ns: u64,
    /// Completion notification, taken exactly once.
    pub callback: Option<IoCallback>,
}

impl ControlBlock {
    /// Clears the block for its next use.
    pub fn reset(&mut self) {
        *self = ControlBlock::default();
    }
}

/// Mutex-protected free list over a fixed arena of control blocks.
pub struct ControlBlockPool {
    slots: Box<[Mutex<ControlBlock>]>,
    free: Mutex<Vec<SlotId>>,
}

impl ControlBlockPool {
    /// Creates a pool of exactly `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Mutex::new(ControlBlock::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free = (0..capacity).rev().map(SlotId).collect();
        Self {
            slots,
            free: Mutex::new(free),
        }
    }

    /// Sizes a pool for `depth` in-flight requests plus `slack`.
    pub fn for_depth(depth: usize, slack: usize) -> Self {
        Self::new(depth * 2 + slack)
    }

    /// Takes a free block, or `None` when the pool is exhausted.
    pub fn acquire(&self) -> Option<SlotId> {
        self.free.lock().pop()
    }

    /// Returns a block to the free list.
    pub fn release(&self, slot: SlotId) {
        self.slots[slot.0].lock().reset();
        self.free.lock().push(slot);
    }

    /// Resets every block and refills the free list, dropping any buffer or
    /// callback still attached. Returns how many blocks held a request.
    pub fn clear(&self) -> usize {
        let mut held = 0;
        for block in self.slots.iter() {
            let mut block = block.lock();
            if block.op.is_some() {
                held += 1;
            }
            block.reset();
        }
        *self.free.lock() = (0..self.slots.len()).rev().map(SlotId).collect();
        held
    }

    /// Locks the block behind `slot`.
    ///
    /// # Panics
    /// Panics if `slot` was not issued by this pool.
    pub fn slot(&self, slot: SlotId) -> MutexGuard<'_, ControlBlock> {
        self.slots[slot.0].lock()
    }

    /// Whether `slot` names a slot of this pool.
    pub fn contains(&self, slot: SlotId) -> bool {
        slot.0 < self.slots.len()
    }

    /// Total number of blocks.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of blocks currently on the free list.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}
