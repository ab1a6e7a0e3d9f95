//! The block record: one queued coordinated move and its trapezoid plan.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::NUM_AXES;

/// Block status bits, shared between the planner and the step generator.
pub mod flag {
    /// Trapezoid (re)fit pending; the consumer must not latch the block.
    pub const RECALCULATE: u8 = 1 << 0;
    /// The block can brake from nominal to minimum speed within its own
    /// length; the reverse pass never needs to lower its entry speed.
    pub const NOMINAL_LENGTH: u8 = 1 << 1;
    /// Position snapshot only; carries no motion.
    pub const SYNC_POSITION: u8 = 1 << 2;
    /// Latched by the consumer; all speed fields are frozen.
    pub const BUSY: u8 = 1 << 3;
    /// Continuation chunk of a host-split move.
    pub const CONTINUED: u8 = 1 << 4;
}

/// Direction bit assignments within [`Block::direction_bits`]. A set bit
/// means the axis moves in the negative direction.
pub mod direction {
    pub const A: u8 = 1 << 0;
    pub const B: u8 = 1 << 1;
    pub const C: u8 = 1 << 2;
    pub const E: u8 = 1 << 3;
    /// CoreXY only: the toolhead's true X/Y directions, which can differ
    /// from the motor directions.
    pub const X_HEAD: u8 = 1 << 4;
    pub const Y_HEAD: u8 = 1 << 5;
}

/// One queued coordinated move with its trapezoidal velocity plan.
///
/// Blocks live in place inside the ring buffer: admission fills the slot
/// at `head`, the look-ahead passes retune entry speeds while the block
/// stays unlatched, and the step generator executes it from `tail`. Only
/// the flag byte is written from both flows; every other field belongs to
/// the planner until the block goes busy, and is frozen afterwards.
#[derive(Debug)]
pub struct Block {
    flags: AtomicU8,

    /// Non-negative step count per motor axis.
    pub steps: [u32; NUM_AXES],
    /// Motor direction bits, plus CoreXY head bits; see [`direction`].
    pub direction_bits: u8,
    /// Bresenham master count: `max(steps)`.
    pub step_event_count: u32,
    /// Euclidean length of the move in head coordinates, mm.
    pub millimeters: f32,
    /// Effective acceleration after per-axis limiting, mm/s².
    pub acceleration: f32,
    /// The same acceleration in master-axis steps/s².
    pub acceleration_steps_per_s2: u32,
    /// Step rate at the (possibly limited) requested feedrate, steps/s.
    pub nominal_rate: u32,
    /// Requested speed squared after limiting, (mm/s)².
    pub nominal_speed_sqr: f32,
    /// Currently planned entry speed squared, (mm/s)².
    pub entry_speed_sqr: f32,
    /// Junction-limited upper bound on the entry speed, squared.
    pub max_entry_speed_sqr: f32,

    /// Step index where acceleration ends.
    pub accelerate_until: u32,
    /// Step index where deceleration begins.
    pub decelerate_after: u32,
    /// Step rate at segment entry, steps/s.
    pub initial_rate: u32,
    /// Step rate at segment exit, steps/s.
    pub final_rate: u32,

    /// Position snapshot carried by `SYNC_POSITION` blocks, in steps.
    pub sync_target: [i32; NUM_AXES],
}

impl Block {
    pub(crate) const EMPTY: Self = Self {
        flags: AtomicU8::new(0),
        steps: [0; NUM_AXES],
        direction_bits: 0,
        step_event_count: 0,
        millimeters: 0.0,
        acceleration: 0.0,
        acceleration_steps_per_s2: 0,
        nominal_rate: 0,
        nominal_speed_sqr: 0.0,
        entry_speed_sqr: 0.0,
        max_entry_speed_sqr: 0.0,
        accelerate_until: 0,
        decelerate_after: 0,
        initial_rate: 0,
        final_rate: 0,
        sync_target: [0; NUM_AXES],
    };

    /// Current flag byte.
    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has(&self, mask: u8) -> bool {
        self.flags() & mask != 0
    }

    pub fn is_busy(&self) -> bool {
        self.has(flag::BUSY)
    }

    pub fn is_sync(&self) -> bool {
        self.has(flag::SYNC_POSITION)
    }

    /// A movement block, as opposed to a sync pseudo-block.
    pub fn is_move(&self) -> bool {
        !self.is_sync()
    }

    pub(crate) fn set_flag(&self, mask: u8) {
        self.flags.fetch_or(mask, Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, mask: u8) {
        self.flags.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Reset the slot to an empty block carrying `flags`.
    pub(crate) fn reset(&mut self, flags: u8) {
        *self = Self::EMPTY;
        self.flags = AtomicU8::new(flags);
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::EMPTY
    }
}
