//! Error types for planner configuration.
//!
//! Runtime planning itself never fails: invalid moves are absorbed with a
//! diagnostic and a full queue is back-pressure, not an error. What *can*
//! be rejected is a nonsensical configuration, at construction or on a
//! settings update.

use core::fmt;

use crate::Axis;

/// Rejected planner configuration.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SettingsError {
    /// An axis `steps_per_mm` was zero or negative.
    NonPositiveStepsPerMm(Axis),
    /// A per-axis feedrate or acceleration limit was zero or negative.
    NonPositiveLimit(Axis),
    /// Junction deviation must be positive under the deviation policy.
    NonPositiveJunctionDeviation,
    /// The extruder table was empty.
    NoExtruders,
    /// The extruder table exceeds the fixed capacity.
    TooManyExtruders,
    /// An extruder entry carried a zero or negative `steps_per_mm`.
    BadExtruder(usize),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveStepsPerMm(axis) => {
                write!(f, "steps-per-mm for axis {axis:?} must be positive")
            }
            Self::NonPositiveLimit(axis) => {
                write!(f, "feedrate/acceleration limit for axis {axis:?} must be positive")
            }
            Self::NonPositiveJunctionDeviation => {
                write!(f, "junction deviation must be positive")
            }
            Self::NoExtruders => write!(f, "at least one extruder entry is required"),
            Self::TooManyExtruders => write!(f, "extruder table exceeds capacity"),
            Self::BadExtruder(i) => write!(f, "extruder {i} has a non-positive steps-per-mm"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SettingsError {}
