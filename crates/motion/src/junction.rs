//! Junction speed policies: how fast two adjacent segments may join.
//!
//! Both policies answer the same question — the maximum squared speed at
//! which the toolhead may pass from the previous segment into the new one —
//! and both cap the answer by the nominal speeds on either side.

use crate::config::{PlannerSettings, MINIMUM_PLANNER_SPEED};
use crate::math::{self, sq};
use crate::NUM_AXES;

/// State carried across segments by the junction policies. Zeroed on a
/// position reset, which makes the next move plan from standstill.
#[derive(Debug, Clone, Default)]
pub(crate) struct JunctionState {
    /// Unit direction vector of the previous segment, head space.
    pub prev_unit: [f32; NUM_AXES],
    /// Per-axis signed speed components of the previous segment, mm/s.
    pub prev_speed: [f32; NUM_AXES],
    /// Nominal (cruise) speed of the previous segment, mm/s; 0 marks
    /// "no previous segment".
    pub prev_nominal_speed: f32,
    /// Previous segment's safe halting speed (classic jerk only).
    pub prev_safe_speed: f32,
}

impl JunctionState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Tightest bound on a quantity directed along `v`: the smallest
/// `|per_axis[i] / v[i]|` over the axes `v` actually uses, starting from
/// `max_value`.
pub(crate) fn limit_value_by_axis_maximum(
    max_value: f32,
    v: &[f32; NUM_AXES],
    per_axis: &[f32; NUM_AXES],
) -> f32 {
    let mut limit = max_value;
    for i in 0..NUM_AXES {
        if v[i] != 0.0 {
            let cap = math::fabsf(per_axis[i] / v[i]);
            if cap < limit {
                limit = cap;
            }
        }
    }
    limit
}

/// Deviation-from-straight angle `π − acos(cos_theta)` for
/// `cos_theta ∈ (−1, −√2/2)`, via a MinMax polynomial for `asin`
/// (max error ±0.033 rad). The approximation bottoms out at 0.033 rad,
/// which keeps the arc-limit divisor away from zero.
pub(crate) fn straightness_angle(cos_theta: f32) -> f32 {
    let t = -cos_theta;
    let asin_t = 0.032_843_707
        + t * (-1.451_838_349
            + t * (29.661_539_56
                + t * (-131.112_347_7
                    + t * (262.813_056_2
                        + t * (-242.719_962_7 + t * 84.314_662_02)))));
    (core::f32::consts::FRAC_PI_2 - asin_t).max(0.033)
}

/// Junction deviation policy: derive the maximum centripetal speed from a
/// configured maximum deviation from the ideal corner.
///
/// `unit` is the new segment's direction unit vector in head space;
/// `max_accel_mm_s2` the effective per-axis acceleration limits (extruder
/// entry already substituted). Returns the squared junction speed bound.
#[allow(clippy::too_many_arguments)]
pub(crate) fn junction_deviation_vmax_sqr(
    state: &JunctionState,
    unit: &[f32; NUM_AXES],
    millimeters: f32,
    block_acceleration: f32,
    nominal_speed_sqr: f32,
    max_accel_mm_s2: &[f32; NUM_AXES],
    settings: &PlannerSettings,
) -> f32 {
    if state.prev_nominal_speed <= 0.0 {
        // First move after a reset: plan the junction from standstill.
        return sq(MINIMUM_PLANNER_SPEED);
    }

    let mut cos_theta = 0.0;
    for i in 0..NUM_AXES {
        cos_theta -= state.prev_unit[i] * unit[i];
    }

    let vmax_sqr = if cos_theta > 0.999_999 {
        // A straight reversal has no corner to carry speed around.
        sq(MINIMUM_PLANNER_SPEED)
    } else {
        let cos_theta = cos_theta.max(-0.999_999);
        let sin_theta_d2 = math::sqrtf(0.5 * (1.0 - cos_theta));

        // Centripetal acceleration is bounded per axis along the
        // direction the corner actually turns through.
        let mut junction_vec = [0.0; NUM_AXES];
        let mut mag_sqr = 0.0;
        for i in 0..NUM_AXES {
            junction_vec[i] = unit[i] - state.prev_unit[i];
            mag_sqr += sq(junction_vec[i]);
        }
        let junction_acceleration = if mag_sqr > 0.0 {
            let inv_mag = 1.0 / math::sqrtf(mag_sqr);
            for v in &mut junction_vec {
                *v *= inv_mag;
            }
            limit_value_by_axis_maximum(block_acceleration, &junction_vec, max_accel_mm_s2)
        } else {
            block_acceleration
        };

        let mut vmax_sqr = junction_acceleration * settings.junction_deviation_mm * sin_theta_d2
            / (1.0 - sin_theta_d2);

        // Many short segments at a shallow angle approximate an arc; bound
        // the speed by that arc's centripetal limit instead of treating
        // every vertex as a corner.
        if millimeters < 1.0 && cos_theta < -core::f32::consts::FRAC_1_SQRT_2 {
            let deviation = straightness_angle(cos_theta);
            let limit_sqr = millimeters * junction_acceleration / deviation;
            if limit_sqr < vmax_sqr {
                vmax_sqr = limit_sqr;
            }
        }
        vmax_sqr
    };

    vmax_sqr
        .min(nominal_speed_sqr)
        .min(sq(state.prev_nominal_speed))
}

/// Classic per-axis jerk policy.
///
/// Returns `(vmax_junction_sqr, safe_speed)`; the caller stores
/// `safe_speed` into the junction state for the next segment.
pub(crate) fn classic_jerk_vmax_sqr(
    state: &JunctionState,
    current_speed: &[f32; NUM_AXES],
    nominal_speed: f32,
    max_jerk: &[f32; NUM_AXES],
    moves_queued: bool,
) -> (f32, f32) {
    // "Safe speed": the highest speed from which every axis can halt
    // within its jerk limit alone.
    let mut safe_speed = nominal_speed;
    let mut limited = false;
    for i in 0..NUM_AXES {
        let jerk = math::fabsf(current_speed[i]);
        let max_j = max_jerk[i];
        if jerk > max_j {
            if limited {
                let mjerk = nominal_speed * max_j;
                if jerk * safe_speed > mjerk {
                    safe_speed = mjerk / jerk;
                }
            } else {
                safe_speed *= max_j / jerk;
                limited = true;
            }
        }
    }

    let vmax_junction;
    if moves_queued && state.prev_nominal_speed > 0.0 {
        // Estimate the maximum velocity allowed at the joint, scaling the
        // faster segment's components down to the slower one first.
        let mut vmax = nominal_speed.min(state.prev_nominal_speed);
        let smaller_speed_factor = vmax / state.prev_nominal_speed;

        let mut v_factor = 1.0f32;
        let mut limited = false;
        for axis in 0..NUM_AXES {
            let mut v_exit = state.prev_speed[axis] * smaller_speed_factor;
            let mut v_entry = current_speed[axis];
            if limited {
                v_exit *= v_factor;
                v_entry *= v_factor;
            }
            // The jerk is the velocity difference when the axis coasts
            // through, and the larger magnitude when it reverses.
            let jerk = if v_exit > v_entry {
                if v_entry > 0.0 || v_exit < 0.0 {
                    v_exit - v_entry
                } else {
                    v_exit.max(-v_entry)
                }
            } else if v_entry < 0.0 || v_exit > 0.0 {
                v_entry - v_exit
            } else {
                (-v_exit).max(v_entry)
            };
            if jerk > max_jerk[axis] {
                v_factor *= max_jerk[axis] / jerk;
                limited = true;
            }
        }
        if limited {
            vmax *= v_factor;
        }

        // If both segments could already halt safely near this speed, the
        // junction may run at the new segment's safe speed outright.
        let vmax_threshold = vmax * 0.99;
        if state.prev_safe_speed > vmax_threshold && safe_speed > vmax_threshold {
            vmax = safe_speed;
        }
        vmax_junction = vmax;
    } else {
        vmax_junction = safe_speed;
    }

    (sq(vmax_junction), safe_speed)
}
