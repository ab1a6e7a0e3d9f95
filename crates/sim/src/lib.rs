//! # Step Generator Simulation
//!
//! Host-side stand-in for the firmware's stepper ISR. [`SimStepper`]
//! drains the planner's block queue through the latch/busy protocol,
//! walks Bresenham over each block's master step count, ramps the step
//! rate along the planned trapezoid, and timestamps every pulse on a
//! simulated 1 MHz step timer. [`SimHost`] wires the planner's host
//! services (clock, idle work, stepper control) to that simulated
//! generator and records a serializable trace, so integration tests and
//! tuning sessions can replay exactly what the motors would have seen.

pub mod harness;
pub mod stepper;

pub use harness::{SimHost, TraceEntry};
pub use stepper::{SimStepper, StepPulse, STEPPER_TICK_HZ};

use thiserror::Error;

/// Errors surfaced by the simulation harness.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("queue failed to drain within {0} simulated ms")]
    DrainTimeout(u32),
    #[error("trace serialization failed")]
    Trace(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
