//! # Motion Planner Crate
//!
//! A look-ahead trapezoidal motion planner for stepper-driven machines
//! (3D printers, CNC routers, laser cutters), usable on both host and MCU
//! (`no_std`-friendly).
//!
//! The planner accepts Cartesian (or angular) target moves with a requested
//! feedrate and turns them into a bounded FIFO of per-axis stepper blocks,
//! each annotated with a trapezoidal velocity profile. A concurrently
//! running step generator (a hardware-timer ISR on a real machine, the
//! `sim` crate on a host) dequeues blocks from the shared
//! [`queue::BlockQueue`] and emits the timed pulses.
//!
//! ## Operation
//!
//! 1. [`planner::Planner::buffer_line`] converts a target position into
//!    integer step counts, applies per-axis feedrate and acceleration
//!    limits, and computes the fastest speed the move may *enter* at
//!    given the angle to the previous move.
//! 2. Every admission re-runs the look-ahead passes: a reverse pass that
//!    propagates braking constraints backwards through the queue, and a
//!    forward pass that limits entry speeds to what the previous block
//!    can actually accelerate to.
//! 3. Blocks whose junction speeds changed get their trapezoid refit.
//!    The step generator consumes finished blocks in strict FIFO order
//!    through its own half of the queue, latching each block before
//!    execution so the planner stops touching it.
//!
//! Provides:
//! - Kinematics (Cartesian, CoreXY, Delta)
//! - Move admission with per-axis feedrate/acceleration limiting
//! - Junction speed planning (junction deviation or classic jerk)
//! - Reverse/forward look-ahead over the queued blocks
//! - A single-producer single-consumer block ring buffer

#![cfg_attr(not(feature = "std"), no_std)]

pub mod block;
pub mod config;
pub mod divide;
pub mod errors;
pub mod junction;
pub mod kinematics;
mod math;
pub mod planner;
pub mod queue;

// Re-export core types for easier access
pub use block::Block;
pub use config::{ExtruderSettings, JunctionPolicy, PlannerSettings};
pub use errors::SettingsError;
pub use kinematics::Kinematics;
pub use planner::{Planner, PlannerHost};
pub use queue::{BlockQueue, QueueConsumer, QueueProducer};

/// Number of logical axes handled by the planner: three geometric axes
/// plus the extruder.
pub const NUM_AXES: usize = 4;

/// Identifiers for the logical planner axes.
///
/// On Cartesian machines A/B/C map directly onto X/Y/Z. On CoreXY the
/// queue carries motor-space step counts for A and B while lengths and
/// speeds stay in head space; on a delta, A/B/C are the tower carriages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum Axis {
    A = 0,
    B = 1,
    C = 2,
    E = 3,
}

/// A position or displacement over the four logical axes, in mm (degrees
/// for angular kinematics). The E component is filament length, not
/// geometry: it contributes to a move's length only when no geometric
/// axis moves.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct Xyze {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub e: f32,
}

impl Xyze {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0, e: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32, e: f32) -> Self {
        Self { x, y, z, e }
    }

    pub const fn to_array(self) -> [f32; NUM_AXES] {
        [self.x, self.y, self.z, self.e]
    }

    pub const fn from_array(a: [f32; NUM_AXES]) -> Self {
        Self { x: a[0], y: a[1], z: a[2], e: a[3] }
    }
}

impl core::ops::Sub for Xyze {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
            e: self.e - rhs.e,
        }
    }
}

impl core::ops::Add for Xyze {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
            e: self.e + rhs.e,
        }
    }
}

// Diagnostic line for absorbed-invalid moves (cold extrude, over-long
// extrude, dropped-tiny segments). Host builds route through `tracing`;
// bare-metal builds still type-check the arguments but emit nothing.
#[cfg(feature = "std")]
macro_rules! diag {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}
#[cfg(not(feature = "std"))]
macro_rules! diag {
    ($($arg:tt)*) => {{
        let _ = core::format_args!($($arg)*);
    }};
}
pub(crate) use diag;
