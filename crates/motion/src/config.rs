//! Planner configuration: kinematic limits, junction policy and the rates
//! derived from them.

use crate::errors::SettingsError;
use crate::{Axis, NUM_AXES};

/// Maximum number of entries the extruder table can hold.
pub const MAX_EXTRUDERS: usize = 8;

/// Slowest speed the planner ever plans a junction or segment end at, mm/s.
/// Keeps square roots and step-rate reciprocals away from zero.
pub const MINIMUM_PLANNER_SPEED: f32 = 0.05;

/// Moves whose geometric and extruder step counts all stay below this are
/// dropped (and absorbed into the next segment's deltas).
pub const MIN_STEPS_PER_SEGMENT: u32 = 6;

/// Lowest step rate ever programmed, steps/s. Prevents 16/32-bit rate
/// counters downstream from overflowing their period.
pub const MINIMAL_STEP_RATE: u32 = 120;

/// How long the first move of a freshly filled queue is withheld from the
/// step generator, ms, so look-ahead gets a chance to chain a few moves
/// before execution starts.
pub const BLOCK_DELAY_FOR_1ST_MOVE: u32 = 100;

/// How a junction's maximum entry speed is derived.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum JunctionPolicy {
    /// Bound the junction speed by a configured maximum deviation from the
    /// ideal sharp corner.
    #[default]
    Deviation,
    /// Classic per-axis jerk: bound the instantaneous velocity change each
    /// axis sees across the junction.
    ClassicJerk,
}

/// Per-extruder parameters from the host's extruder table.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct ExtruderSettings {
    pub steps_per_mm: f32,
    pub max_feedrate_mm_s: f32,
    pub max_acceleration_mm_s2: f32,
    pub max_jerk_mm_s: f32,
    /// Flow-compensation scalar applied to E step counts.
    pub e_factor: f32,
}

impl Default for ExtruderSettings {
    fn default() -> Self {
        Self {
            steps_per_mm: 93.0,
            max_feedrate_mm_s: 120.0,
            max_acceleration_mm_s2: 10_000.0,
            max_jerk_mm_s: 5.0,
            e_factor: 1.0,
        }
    }
}

/// User-facing planner settings.
///
/// The geometric axes are indexed A/B/C; the `[Axis::E as usize]` entries
/// act as defaults that the active [`ExtruderSettings`] overrides per move.
/// Derived tables are recomputed from these by [`DerivedRates::compute`]
/// whenever the configuration changes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct PlannerSettings {
    pub axis_steps_per_mm: [f32; NUM_AXES],
    pub max_feedrate_mm_s: [f32; NUM_AXES],
    pub max_acceleration_mm_s2: [f32; NUM_AXES],
    pub max_jerk_mm_s: [f32; NUM_AXES],

    /// Default acceleration for moves that extrude, mm/s².
    pub print_acceleration_mm_s2: f32,
    /// Default acceleration for travel moves, mm/s².
    pub travel_acceleration_mm_s2: f32,
    /// Acceleration for extruder-only moves, mm/s².
    pub retract_acceleration_mm_s2: f32,

    /// Feedrate floor for extruding moves, mm/s.
    pub min_feedrate_mm_s: f32,
    /// Feedrate floor for travel moves, mm/s.
    pub min_travel_feedrate_mm_s: f32,

    pub junction_policy: JunctionPolicy,
    /// Maximum allowed deviation from the ideal corner, mm (policy
    /// [`JunctionPolicy::Deviation`] only).
    pub junction_deviation_mm: f32,

    /// Segments shorter than this are stretched while the queue is running
    /// low, so the buffer never drains faster than the host can refill it.
    pub min_segment_time_us: u32,
    /// Enables the segment-stretch slowdown above.
    pub slowdown: bool,

    /// Longest single extrusion accepted before the E component of a move
    /// is absorbed as a suspected slicer error, mm.
    pub max_extrude_length_mm: f32,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            axis_steps_per_mm: [80.0, 80.0, 400.0, 93.0],
            max_feedrate_mm_s: [300.0, 300.0, 5.0, 120.0],
            max_acceleration_mm_s2: [3000.0, 3000.0, 100.0, 10_000.0],
            max_jerk_mm_s: [10.0, 10.0, 0.4, 5.0],
            print_acceleration_mm_s2: 3000.0,
            travel_acceleration_mm_s2: 3000.0,
            retract_acceleration_mm_s2: 1500.0,
            min_feedrate_mm_s: 0.0,
            min_travel_feedrate_mm_s: 0.0,
            junction_policy: JunctionPolicy::Deviation,
            junction_deviation_mm: 0.013,
            min_segment_time_us: 20_000,
            slowdown: true,
            max_extrude_length_mm: 200.0,
        }
    }
}

impl PlannerSettings {
    /// Check the settings for values the planner cannot work with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        const AXES: [Axis; NUM_AXES] = [Axis::A, Axis::B, Axis::C, Axis::E];
        for (i, axis) in AXES.into_iter().enumerate() {
            if self.axis_steps_per_mm[i] <= 0.0 {
                return Err(SettingsError::NonPositiveStepsPerMm(axis));
            }
            if self.max_feedrate_mm_s[i] <= 0.0 || self.max_acceleration_mm_s2[i] <= 0.0 {
                return Err(SettingsError::NonPositiveLimit(axis));
            }
        }
        if self.junction_policy == JunctionPolicy::Deviation && self.junction_deviation_mm <= 0.0 {
            return Err(SettingsError::NonPositiveJunctionDeviation);
        }
        Ok(())
    }
}

/// Tables derived from [`PlannerSettings`]; recomputed on configuration
/// change so admission never divides in its inner loops.
#[derive(Debug, Clone)]
pub(crate) struct DerivedRates {
    /// `1 / axis_steps_per_mm[i]`
    pub steps_to_mm: [f32; NUM_AXES],
    /// `max_acceleration_mm_s2[i] * axis_steps_per_mm[i]`
    pub max_acceleration_steps_per_s2: [f32; NUM_AXES],
}

impl DerivedRates {
    pub fn compute(settings: &PlannerSettings) -> Self {
        let mut steps_to_mm = [0.0; NUM_AXES];
        let mut max_acceleration_steps_per_s2 = [0.0; NUM_AXES];
        for i in 0..NUM_AXES {
            steps_to_mm[i] = 1.0 / settings.axis_steps_per_mm[i];
            max_acceleration_steps_per_s2[i] =
                settings.max_acceleration_mm_s2[i] * settings.axis_steps_per_mm[i];
        }
        Self { steps_to_mm, max_acceleration_steps_per_s2 }
    }
}
