//! Kinematic models translating head-space targets into machine axes.
//!
//! The planner is agnostic of the machine geometry except at two points of
//! move admission: transforming a target position into machine-axis
//! millimetres, and deriving motor step deltas from head-axis step deltas
//! (which only differ on CoreXY). Lengths, speeds and direction unit
//! vectors always stay in head space.

use crate::math;
use crate::{Xyze, NUM_AXES};

/// Linear-delta tower geometry for the closed-form carriage transform.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct DeltaGeometry {
    pub tower_x: [f32; 3],
    pub tower_y: [f32; 3],
    /// Arm length between carriage and effector joint, mm.
    pub diagonal_rod_mm: f32,
}

impl DeltaGeometry {
    /// Towers of a standard 120°-spaced frame, at 210°, 330° and 90°.
    pub fn equilateral(delta_radius_mm: f32, diagonal_rod_mm: f32) -> Self {
        const COS_210: f32 = -0.866_025_4;
        const SIN_210: f32 = -0.5;
        const COS_330: f32 = 0.866_025_4;
        const SIN_330: f32 = -0.5;
        Self {
            tower_x: [delta_radius_mm * COS_210, delta_radius_mm * COS_330, 0.0],
            tower_y: [delta_radius_mm * SIN_210, delta_radius_mm * SIN_330, delta_radius_mm],
            diagonal_rod_mm,
        }
    }

    /// Carriage height for one tower. Unreachable targets are the caller's
    /// responsibility to pre-check; this clamps rather than faulting.
    fn carriage(&self, tower: usize, p: Xyze) -> f32 {
        let dx = p.x - self.tower_x[tower];
        let dy = p.y - self.tower_y[tower];
        let reach_sqr = math::sq(self.diagonal_rod_mm) - math::sq(dx) - math::sq(dy);
        debug_assert!(reach_sqr >= 0.0, "delta target outside reachable volume");
        p.z + math::sqrtf(reach_sqr.max(0.0))
    }
}

/// The machine's kinematic model.
///
/// [`Kinematics::to_axes`] is injective per geometry and is called once
/// per input segment. The block record carries no kinematic variant; only
/// admission consults it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum Kinematics {
    /// Motors map directly onto the Cartesian axes.
    Cartesian,
    /// CoreXY belt coupling: motor `a = x + k·y`, motor `b = x − k·y`.
    /// The planner keeps positions in head space and applies the coupling
    /// to step deltas, so `to_axes` is the identity here.
    CoreXy { factor: i32 },
    /// Linear delta towers, closed form per tower.
    Delta(DeltaGeometry),
}

impl Kinematics {
    /// Transform a head-space position into machine-axis positions, mm.
    pub fn to_axes(&self, p: Xyze) -> Xyze {
        match self {
            Kinematics::Cartesian | Kinematics::CoreXy { .. } => p,
            Kinematics::Delta(geo) => Xyze {
                x: geo.carriage(0, p),
                y: geo.carriage(1, p),
                z: geo.carriage(2, p),
                e: p.e,
            },
        }
    }

    /// Derive motor step deltas from head-axis step deltas.
    pub fn motor_deltas(&self, d: [i32; NUM_AXES]) -> [i32; NUM_AXES] {
        match *self {
            Kinematics::CoreXy { factor } => {
                [d[0] + factor * d[1], d[0] - factor * d[1], d[2], d[3]]
            }
            _ => d,
        }
    }

    /// Whether motor step deltas differ from head deltas (and the block
    /// must carry separate head direction bits).
    pub fn has_head_directions(&self) -> bool {
        matches!(self, Kinematics::CoreXy { .. })
    }
}
