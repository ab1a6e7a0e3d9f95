//! The look-ahead planner: move admission, junction optimisation and
//! trapezoid generation over the shared block queue.
//!
//! ## Operation
//!
//! 1. **`buffer_line`**: a target position arrives, gets the host's
//!    position modifiers and the kinematic transform applied, and is
//!    quantized to integer steps.
//! 2. **`fill_block`**: the staged block receives its step counts,
//!    per-axis-limited feedrate and acceleration, and the junction-limited
//!    bound on its entry speed.
//! 3. **`recalculate`**: a reverse pass propagates braking constraints
//!    backwards from the newest block, a forward pass limits every entry
//!    speed to what the previous block can accelerate to, and any block
//!    whose junction speeds moved gets its trapezoid refit.
//!
//! The planner never blocks on a lock. Its only synchronisation with the
//! step generator is the queue's index ordering plus the busy/recalculate
//! flag handshake on each block: before touching a block it raises
//! `RECALCULATE`, re-reads `BUSY`, and backs out if the consumer latched
//! the block in between.

use heapless::Vec;

use crate::block::{direction, flag, Block};
use crate::config::{
    DerivedRates, ExtruderSettings, JunctionPolicy, PlannerSettings, MAX_EXTRUDERS,
    MINIMAL_STEP_RATE, MINIMUM_PLANNER_SPEED, MIN_STEPS_PER_SEGMENT,
};
use crate::errors::SettingsError;
use crate::junction::{classic_jerk_vmax_sqr, junction_deviation_vmax_sqr, JunctionState};
use crate::kinematics::Kinematics;
use crate::math::{self, sq};
use crate::queue::{BlockQueue, QueueProducer};
use crate::{diag, Axis, Xyze, NUM_AXES};

/// How long admission stays refused after a quick stop, ms.
const CLEAN_BUFFER_MS: u32 = 1000;

/// Services the planner needs from its host: a millisecond clock, an idle
/// hook it yields to while waiting, the extrusion-temperature check, the
/// (invertible) position modifiers, and control signals to the step
/// generator.
pub trait PlannerHost {
    /// Monotonic millisecond clock.
    fn millis(&self) -> u32;

    /// Called once per iteration of any busy-wait (full queue,
    /// `synchronize`). Hosts run their event loop here.
    fn idle(&mut self) {}

    /// Whether the given extruder is below its minimum extrusion
    /// temperature; such moves keep their geometry but lose their E
    /// component.
    fn too_cold_to_extrude(&self, _extruder: usize) -> bool {
        false
    }

    /// Position modifiers (bed-leveling warp, firmware retract offset),
    /// applied to every incoming target.
    fn apply_modifiers(&self, _target: &mut Xyze) {}

    /// Inverse of [`Self::apply_modifiers`], for reporting.
    fn unapply_modifiers(&self, _target: &mut Xyze) {}

    /// Tell the step generator to abandon whatever it is executing.
    fn stepper_quick_stop(&mut self) {}

    /// The step generator's actual position, read after a stop.
    fn stepper_position(&self) -> [i32; NUM_AXES] {
        [0; NUM_AXES]
    }

    /// Program the step generator's position register directly (only used
    /// while the queue is empty).
    fn stepper_set_position(&mut self, _steps: [i32; NUM_AXES]) {}

    /// Forward an endstop hit to the step generator.
    fn stepper_endstop_triggered(&mut self, _axis: Axis) {}
}

/// The look-ahead motion planner.
///
/// Owns the producer half of a [`BlockQueue`] plus everything needed to
/// turn target positions into planned blocks: settings, derived rates, the
/// kinematic model, the extruder table and a host handle. The matching
/// consumer half belongs to the step generator.
pub struct Planner<'q, H: PlannerHost, const N: usize> {
    settings: PlannerSettings,
    rates: DerivedRates,
    kinematics: Kinematics,
    extruders: Vec<ExtruderSettings, MAX_EXTRUDERS>,
    host: H,
    producer: QueueProducer<'q, N>,

    /// Canonical machine position in steps: the running sum of every
    /// queued block's step deltas, i.e. the step generator's position at
    /// queue drain.
    position_steps: [i32; NUM_AXES],
    /// Head-space float position, kept so direction unit vectors chain
    /// across segments without rounding drift.
    position_mm: Xyze,
    junction: JunctionState,
    active_extruder: usize,
    /// Admission refused until this instant after a quick stop; 0 = clear.
    clean_buffer_until: u32,
}

impl<'q, H: PlannerHost, const N: usize> Planner<'q, H, N> {
    pub fn new(
        settings: PlannerSettings,
        kinematics: Kinematics,
        extruders: &[ExtruderSettings],
        producer: QueueProducer<'q, N>,
        host: H,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        if extruders.is_empty() {
            return Err(SettingsError::NoExtruders);
        }
        for (i, e) in extruders.iter().enumerate() {
            if e.steps_per_mm <= 0.0
                || e.e_factor <= 0.0
                || e.max_feedrate_mm_s <= 0.0
                || e.max_acceleration_mm_s2 <= 0.0
            {
                return Err(SettingsError::BadExtruder(i));
            }
        }
        let extruders =
            Vec::from_slice(extruders).map_err(|()| SettingsError::TooManyExtruders)?;
        let rates = DerivedRates::compute(&settings);
        Ok(Self {
            settings,
            rates,
            kinematics,
            extruders,
            host,
            producer,
            position_steps: [0; NUM_AXES],
            position_mm: Xyze::ZERO,
            junction: JunctionState::default(),
            active_extruder: 0,
            clean_buffer_until: 0,
        })
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    pub fn kinematics(&self) -> &Kinematics {
        &self.kinematics
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn has_blocks_queued(&self) -> bool {
        !self.producer.is_empty()
    }

    pub fn moves_queued(&self) -> usize {
        self.producer.occupancy()
    }

    /// Machine position in steps (multi-word read, held consistent against
    /// the step generator by a short critical section).
    pub fn position_steps(&self) -> [i32; NUM_AXES] {
        critical_section::with(|_| self.position_steps)
    }

    /// Head-space logical position with the host's modifiers removed,
    /// i.e. the position as the user requested it.
    pub fn reported_position_mm(&self) -> Xyze {
        let mut p = self.position_mm;
        self.host.unapply_modifiers(&mut p);
        p
    }

    /// Planner's logical position of one axis, mm, for reporting.
    pub fn axis_position_mm(&self, axis: Axis) -> f32 {
        let steps = self.position_steps();
        match axis {
            Axis::E => steps[3] as f32 / self.extruders[self.active_extruder].steps_per_mm,
            _ => steps[axis as usize] as f32 * self.rates.steps_to_mm[axis as usize],
        }
    }

    pub fn select_extruder(&mut self, extruder: usize) {
        self.active_extruder = extruder.min(self.extruders.len() - 1);
    }

    /// Replace the settings, revalidating and refreshing the derived
    /// rates. Safe only while the queue is empty; see
    /// [`Self::flush_and_update`].
    pub fn apply_settings(&mut self, settings: PlannerSettings) -> Result<(), SettingsError> {
        settings.validate()?;
        self.rates = DerivedRates::compute(&settings);
        self.settings = settings;
        Ok(())
    }

    /// Drain the queue, then apply new settings: the safe way to change
    /// steps-per-mm or acceleration limits mid-session.
    pub fn flush_and_update(&mut self, settings: PlannerSettings) -> Result<(), SettingsError> {
        self.synchronize();
        self.apply_settings(settings)
    }

    // --- Move admission ---

    /// The external entry point: queue a straight move to the head-space
    /// `target` (mm; degrees for angular kinematics) at `fr_mm_s`.
    ///
    /// Returns `false` only while the clean-buffer window after a quick
    /// stop is active. Absorbed-invalid moves (cold extrude, over-long
    /// extrude, below the step threshold) return `true`.
    pub fn buffer_line(
        &mut self,
        target: Xyze,
        fr_mm_s: f32,
        extruder: usize,
        hint_mm: Option<f32>,
    ) -> bool {
        self.active_extruder = extruder.min(self.extruders.len() - 1);
        let mut modified = target;
        self.host.apply_modifiers(&mut modified);
        let machine = self.kinematics.to_axes(modified);
        let cart_dist = modified - self.position_mm;
        self.buffer_segment(machine, cart_dist, fr_mm_s, self.active_extruder, hint_mm, false)
    }

    /// Queue a move to the machine-axis position `machine` (mm), covering
    /// the head-space displacement `cart_dist`. Hosts that segment moves
    /// themselves (leveling meshes, delta interpolation) pass
    /// `continued = true` for every chunk after the first so the chain
    /// keeps its speed through the seams.
    pub fn buffer_segment(
        &mut self,
        machine: Xyze,
        cart_dist: Xyze,
        fr_mm_s: f32,
        extruder: usize,
        hint_mm: Option<f32>,
        continued: bool,
    ) -> bool {
        let extruder = extruder.min(self.extruders.len() - 1);
        let m = machine.to_array();
        let target_steps = [
            math::lroundf(m[0] * self.settings.axis_steps_per_mm[0]),
            math::lroundf(m[1] * self.settings.axis_steps_per_mm[1]),
            math::lroundf(m[2] * self.settings.axis_steps_per_mm[2]),
            math::lroundf(m[3] * self.extruders[extruder].steps_per_mm),
        ];
        self.buffer_steps(target_steps, cart_dist, fr_mm_s, extruder, hint_mm, continued)
    }

    /// Queue a move given integer target steps. Spins (yielding to the
    /// host) while the ring is full: a full queue is back-pressure, not an
    /// error.
    pub fn buffer_steps(
        &mut self,
        target_steps: [i32; NUM_AXES],
        cart_dist: Xyze,
        fr_mm_s: f32,
        extruder: usize,
        hint_mm: Option<f32>,
        continued: bool,
    ) -> bool {
        if self.cleaning_active() {
            diag!("move rejected: buffer cleaning after quick stop");
            return false;
        }
        let slot = loop {
            match self.producer.free_slot() {
                Some(slot) => break slot,
                None => self.host.idle(),
            }
        };
        if !self.fill_block(slot, target_steps, cart_dist, fr_mm_s, extruder, hint_mm, continued)
        {
            // Dropped but absorbed; the caller's stream continues.
            return true;
        }
        self.producer.commit(self.host.millis());
        self.recalculate();
        true
    }

    /// Fill the staged slot with one coordinated move. Returns `false`
    /// when the move is absorbed without queuing anything.
    #[allow(clippy::too_many_arguments)]
    fn fill_block(
        &mut self,
        slot: usize,
        target_steps: [i32; NUM_AXES],
        cart_dist: Xyze,
        fr_mm_s: f32,
        extruder: usize,
        hint_mm: Option<f32>,
        continued: bool,
    ) -> bool {
        const E: usize = Axis::E as usize;
        let ext = self.extruders[extruder];
        let e_steps_to_mm = 1.0 / ext.steps_per_mm;

        // Head-axis step deltas relative to the canonical position.
        let mut dh = [0i32; NUM_AXES];
        for i in 0..NUM_AXES {
            dh[i] = target_steps[i] - self.position_steps[i];
        }

        // Absorb invalid extrusion rather than failing the move: pretend
        // it happened, keep the geometry, say so on the host channel.
        if dh[E] != 0 {
            if self.host.too_cold_to_extrude(extruder) {
                self.position_steps[E] = target_steps[E];
                dh[E] = 0;
                diag!("cold extrusion prevented on extruder {}", extruder);
            } else {
                let e_mm = math::fabsf(dh[E] as f32 * ext.e_factor) * e_steps_to_mm;
                if e_mm > self.settings.max_extrude_length_mm {
                    self.position_steps[E] = target_steps[E];
                    dh[E] = 0;
                    diag!("over-long extrusion of {:.1} mm ignored", e_mm);
                }
            }
        }

        let dm = self.kinematics.motor_deltas(dh);

        // Below the step threshold on every axis: drop the move and let
        // its deltas fold into the next segment.
        let geo_max = dm[0].unsigned_abs().max(dm[1].unsigned_abs()).max(dm[2].unsigned_abs());
        if geo_max < MIN_STEPS_PER_SEGMENT && dm[E].unsigned_abs() < MIN_STEPS_PER_SEGMENT {
            diag!("move under the step threshold dropped");
            return false;
        }

        // Direction bits (set = negative travel); CoreXY keeps the
        // toolhead's true direction next to the motor directions.
        let mut direction_bits = 0u8;
        if dm[0] < 0 {
            direction_bits |= direction::A;
        }
        if dm[1] < 0 {
            direction_bits |= direction::B;
        }
        if dm[2] < 0 {
            direction_bits |= direction::C;
        }
        if dm[E] < 0 {
            direction_bits |= direction::E;
        }
        if self.kinematics.has_head_directions() {
            if dh[0] < 0 {
                direction_bits |= direction::X_HEAD;
            }
            if dh[1] < 0 {
                direction_bits |= direction::Y_HEAD;
            }
        }

        let e_steps = (math::fabsf(dm[E] as f32 * ext.e_factor) + 0.5) as u32;
        let steps = [
            dm[0].unsigned_abs(),
            dm[1].unsigned_abs(),
            dm[2].unsigned_abs(),
            e_steps,
        ];
        let step_event_count = steps[0].max(steps[1]).max(steps[2]).max(steps[3]);
        if step_event_count == 0 {
            return false;
        }

        // Segment length in head space; extruder-only moves use the
        // filament length instead.
        let dist = cart_dist.to_array();
        let millimeters = if steps[0] < MIN_STEPS_PER_SEGMENT
            && steps[1] < MIN_STEPS_PER_SEGMENT
            && steps[2] < MIN_STEPS_PER_SEGMENT
        {
            math::fabsf(dist[E])
        } else {
            match hint_mm {
                Some(mm) if mm > 0.0 => mm,
                _ => math::sqrtf(sq(dist[0]) + sq(dist[1]) + sq(dist[2])),
            }
        };
        // Feedrate floors.
        let fr = if e_steps != 0 {
            fr_mm_s.max(self.settings.min_feedrate_mm_s)
        } else {
            fr_mm_s.max(self.settings.min_travel_feedrate_mm_s)
        };
        let mut inverse_secs = fr / millimeters;

        // While the queue is running low, stretch sub-threshold segments
        // so the buffered time keeps its floor and the generator does not
        // starve between host refills.
        let moves_queued = self.producer.occupancy();
        if self.settings.slowdown && moves_queued >= 2 && moves_queued < N / 2 {
            let segment_time_us = math::lroundf(1_000_000.0 / inverse_secs);
            let floor_us = self.settings.min_segment_time_us as i32;
            if segment_time_us < floor_us {
                let stretched = segment_time_us
                    + math::lroundf(2.0 * (floor_us - segment_time_us) as f32
                        / moves_queued as f32);
                inverse_secs = 1_000_000.0 / stretched as f32;
            }
        }

        let mut nominal_speed = millimeters * inverse_secs;
        let mut nominal_rate = (math::ceilf(step_event_count as f32 * inverse_secs) as u32).max(1);

        // Per-axis feedrate caps over machine-space speeds, the extruder
        // table overriding the E limit. One shrink factor scales the whole
        // move so the mix of axes stays exact.
        let max_feedrate = [
            self.settings.max_feedrate_mm_s[0],
            self.settings.max_feedrate_mm_s[1],
            self.settings.max_feedrate_mm_s[2],
            ext.max_feedrate_mm_s,
        ];
        let delta_mm = [
            dm[0] as f32 * self.rates.steps_to_mm[0],
            dm[1] as f32 * self.rates.steps_to_mm[1],
            dm[2] as f32 * self.rates.steps_to_mm[2],
            dm[E] as f32 * ext.e_factor * e_steps_to_mm,
        ];
        let mut current_speed = [0.0f32; NUM_AXES];
        let mut speed_factor = 1.0f32;
        for i in 0..NUM_AXES {
            current_speed[i] = delta_mm[i] * inverse_secs;
            let cs = math::fabsf(current_speed[i]);
            if cs > max_feedrate[i] {
                speed_factor = speed_factor.min(max_feedrate[i] / cs);
            }
        }
        if speed_factor < 1.0 {
            for v in &mut current_speed {
                *v *= speed_factor;
            }
            nominal_rate = ((nominal_rate as f32 * speed_factor) as u32).max(1);
            nominal_speed *= speed_factor;
        }
        let nominal_speed_sqr = sq(nominal_speed);

        // Effective acceleration: class default, then limited per axis so
        // no motor exceeds its own steps/s² budget.
        let steps_per_mm_move = step_event_count as f32 / millimeters;
        let base_accel = if steps[0] == 0 && steps[1] == 0 && steps[2] == 0 {
            self.settings.retract_acceleration_mm_s2
        } else if e_steps == 0 {
            self.settings.travel_acceleration_mm_s2
        } else {
            self.settings.print_acceleration_mm_s2
        };
        let max_accel_steps = [
            self.rates.max_acceleration_steps_per_s2[0],
            self.rates.max_acceleration_steps_per_s2[1],
            self.rates.max_acceleration_steps_per_s2[2],
            ext.max_acceleration_mm_s2 * ext.steps_per_mm,
        ];
        let mut accel_steps_per_s2 = math::ceilf(base_accel * steps_per_mm_move);
        for i in 0..NUM_AXES {
            if steps[i] != 0 {
                let cap = max_accel_steps[i] * step_event_count as f32 / steps[i] as f32;
                if cap < accel_steps_per_s2 {
                    accel_steps_per_s2 = cap;
                }
            }
        }
        let acceleration = accel_steps_per_s2 / steps_per_mm_move;

        // Junction-limited entry speed bound.
        let mut unit = [0.0f32; NUM_AXES];
        for i in 0..NUM_AXES {
            unit[i] = dist[i] / millimeters;
        }
        let max_accel_mm = [
            self.settings.max_acceleration_mm_s2[0],
            self.settings.max_acceleration_mm_s2[1],
            self.settings.max_acceleration_mm_s2[2],
            ext.max_acceleration_mm_s2,
        ];
        let max_entry_speed_sqr = match self.settings.junction_policy {
            JunctionPolicy::Deviation => junction_deviation_vmax_sqr(
                &self.junction,
                &unit,
                millimeters,
                acceleration,
                nominal_speed_sqr,
                &max_accel_mm,
                &self.settings,
            ),
            JunctionPolicy::ClassicJerk => {
                let max_jerk = [
                    self.settings.max_jerk_mm_s[0],
                    self.settings.max_jerk_mm_s[1],
                    self.settings.max_jerk_mm_s[2],
                    ext.max_jerk_mm_s,
                ];
                let (vmax_sqr, safe_speed) = classic_jerk_vmax_sqr(
                    &self.junction,
                    &current_speed,
                    nominal_speed,
                    &max_jerk,
                    moves_queued > 0,
                );
                let prev_nominal = self.junction.prev_nominal_speed;
                self.junction.prev_safe_speed = safe_speed;
                let mut vmax_sqr = vmax_sqr.min(nominal_speed_sqr);
                if prev_nominal > 0.0 {
                    vmax_sqr = vmax_sqr.min(sq(prev_nominal));
                }
                vmax_sqr
            }
        };

        // Entry speed starts at the sentinel minimum; a continuation chunk
        // of a host-split move instead enters as fast as it can while
        // still braking to the minimum within itself.
        let v_allowable_sqr =
            max_allowable_speed_sqr(-acceleration, sq(MINIMUM_PLANNER_SPEED), millimeters);
        let entry_speed_sqr = if continued {
            max_entry_speed_sqr.min(v_allowable_sqr)
        } else {
            sq(MINIMUM_PLANNER_SPEED)
        };

        let mut flags = flag::RECALCULATE;
        if continued {
            flags |= flag::CONTINUED;
        }
        if nominal_speed_sqr <= v_allowable_sqr {
            flags |= flag::NOMINAL_LENGTH;
        }

        let block = self.producer.block_mut(slot);
        block.reset(flags);
        block.steps = steps;
        block.direction_bits = direction_bits;
        block.step_event_count = step_event_count;
        block.millimeters = millimeters;
        block.acceleration = acceleration;
        block.acceleration_steps_per_s2 = accel_steps_per_s2 as u32;
        block.nominal_rate = nominal_rate;
        block.nominal_speed_sqr = nominal_speed_sqr;
        block.entry_speed_sqr = entry_speed_sqr;
        block.max_entry_speed_sqr = max_entry_speed_sqr;

        // Chain state for the next junction.
        self.junction.prev_unit = unit;
        self.junction.prev_speed = current_speed;
        self.junction.prev_nominal_speed = nominal_speed;

        // Commit the canonical position.
        self.position_steps = target_steps;
        self.position_mm = self.position_mm + cart_dist;
        true
    }

    // --- Look-ahead ---

    /// Re-optimise junction speeds across the queue, then refit the
    /// trapezoids of everything that changed.
    fn recalculate(&mut self) {
        let (head, planned) = {
            let q = self.producer.queue();
            (q.head(), q.planned())
        };
        // With a single unplanned block there is nothing to chain.
        if BlockQueue::<N>::prev_index(head) != planned {
            self.reverse_pass();
            self.forward_pass();
        }
        self.recalculate_trapezoids();
    }

    /// Walk from the newest block back toward `planned`, raising each
    /// entry speed to the most its junction and its successor's braking
    /// distance allow.
    fn reverse_pass(&mut self) {
        let (head, mut planned) = {
            let q = self.producer.queue();
            (q.head(), q.planned())
        };
        if planned == head {
            return;
        }
        let mut block_index = BlockQueue::<N>::prev_index(head);

        // (entry_speed_sqr, recalculate) of the block after the cursor;
        // the newest block plans against the sentinel minimum.
        let mut next: Option<(f32, bool)> = None;

        while block_index != planned {
            let (is_move, max_entry, entry, nominal_len, accel, mm) = {
                let b = self.producer.block(block_index);
                (
                    b.is_move(),
                    b.max_entry_speed_sqr,
                    b.entry_speed_sqr,
                    b.has(flag::NOMINAL_LENGTH),
                    b.acceleration,
                    b.millimeters,
                )
            };
            if is_move {
                let (next_entry, next_recalc) =
                    next.unwrap_or((sq(MINIMUM_PLANNER_SPEED), false));
                let mut current_entry = entry;
                if entry != max_entry || next_recalc {
                    // A nominal-length block always reaches its junction
                    // cap; anything else is bounded by how fast it can
                    // still brake down to the next block's entry.
                    let new_entry = if nominal_len {
                        max_entry
                    } else {
                        max_entry.min(max_allowable_speed_sqr(-accel, next_entry, mm))
                    };
                    if entry != new_entry
                        && self.producer.try_set_entry_speed(block_index, new_entry)
                    {
                        current_entry = new_entry;
                    }
                }
                let recalc = self.producer.block(block_index).has(flag::RECALCULATE);
                next = Some((current_entry, recalc));
            }

            block_index = BlockQueue::<N>::prev_index(block_index);

            // The consumer may advance `planned` mid-scan; follow it one
            // step at a time and stop before touching consumed blocks.
            loop {
                let latest = self.producer.queue().planned();
                if planned == latest {
                    break;
                }
                if block_index == planned {
                    return;
                }
                planned = BlockQueue::<N>::next_index(planned);
            }
        }
    }

    /// Walk from `planned` toward the head, limiting each entry speed to
    /// what its predecessor can actually accelerate to, and pinning
    /// `planned` forward over blocks that can never improve again.
    fn forward_pass(&mut self) {
        let head = self.producer.queue().head();
        let mut block_index = self.producer.queue().planned();
        let mut prev_index: Option<usize> = None;

        while block_index != head {
            if self.producer.block(block_index).is_move() {
                if let Some(pi) = prev_index {
                    let (prev_busy, prev_nominal_len, prev_entry, prev_accel, prev_mm) = {
                        let p = self.producer.block(pi);
                        (
                            p.is_busy(),
                            p.has(flag::NOMINAL_LENGTH),
                            p.entry_speed_sqr,
                            p.acceleration,
                            p.millimeters,
                        )
                    };
                    // A busy predecessor's exit is frozen, so this entry
                    // must not change either.
                    if !prev_busy {
                        if !prev_nominal_len {
                            let entry = self.producer.block(block_index).entry_speed_sqr;
                            if prev_entry < entry {
                                let new_entry =
                                    max_allowable_speed_sqr(-prev_accel, prev_entry, prev_mm);
                                // The block is pure acceleration: optimal,
                                // never to be revisited.
                                if new_entry < entry
                                    && self
                                        .producer
                                        .try_set_entry_speed(block_index, new_entry)
                                {
                                    self.producer.queue().set_planned(block_index);
                                }
                            }
                        }
                        let b = self.producer.block(block_index);
                        if b.entry_speed_sqr == b.max_entry_speed_sqr {
                            self.producer.queue().set_planned(block_index);
                        }
                    }
                }
                prev_index = Some(block_index);
            }
            block_index = BlockQueue::<N>::next_index(block_index);
        }
    }

    /// Refit the trapezoid of every block whose entry or exit junction
    /// changed, tail to head, skipping latched blocks. The newest move
    /// block always refits with the sentinel minimum as its exit speed.
    fn recalculate_trapezoids(&mut self) {
        let mut block_index = self.producer.queue().tail();
        let mut head_index = self.producer.queue().head();

        // Trailing sync blocks carry no trapezoid; the last *move* block
        // is the one that must brake to the sentinel.
        while head_index != block_index {
            let prev = BlockQueue::<N>::prev_index(head_index);
            if self.producer.block(prev).is_move() {
                break;
            }
            head_index = prev;
        }

        let mut current: Option<usize> = None;
        let mut current_entry_sqr = 0.0f32;

        while block_index != head_index {
            let (is_move, next_entry, next_recalc) = {
                let b = self.producer.block(block_index);
                (b.is_move(), b.entry_speed_sqr, b.has(flag::RECALCULATE))
            };
            if is_move {
                if let Some(ci) = current {
                    if next_recalc || self.producer.block(ci).has(flag::RECALCULATE) {
                        self.refit_trapezoid(ci, current_entry_sqr, next_entry);
                    }
                }
                current = Some(block_index);
                current_entry_sqr = next_entry;
            }
            block_index = BlockQueue::<N>::next_index(block_index);
        }

        if let Some(ci) = current {
            self.refit_trapezoid(ci, current_entry_sqr, sq(MINIMUM_PLANNER_SPEED));
        }
    }

    /// One trapezoid refit under the busy/recalculate handshake: raise the
    /// flag (shielding the block from the consumer), fit unless the block
    /// went busy, and always lower the flag afterwards.
    fn refit_trapezoid(&mut self, index: usize, entry_speed_sqr: f32, exit_speed_sqr: f32) {
        self.producer.block(index).set_flag(flag::RECALCULATE);
        if !self.producer.block(index).is_busy() {
            calculate_trapezoid(self.producer.block_mut(index), entry_speed_sqr, exit_speed_sqr);
        }
        self.producer.block(index).clear_flag(flag::RECALCULATE);
    }

    // --- Control ---

    /// Wait for every queued move to drain and the clean-buffer window to
    /// lapse, yielding to the host's idle work each iteration.
    pub fn synchronize(&mut self) {
        while self.has_blocks_queued() || self.cleaning_active() {
            self.host.idle();
        }
    }

    /// Discard the whole queue and stop the step generator. The planner
    /// resynchronizes its position from wherever the generator actually
    /// stopped, and admission stays refused for about a second so the
    /// discarded stream cannot keep refilling the queue. Hosts with
    /// nonlinear kinematics should follow up with
    /// [`Self::set_position_mm`] once they re-establish head coordinates.
    pub fn quick_stop(&mut self) {
        // The four-index swap must be atomic with respect to the step
        // generator; `tail` itself stays consumer-owned and is only read.
        critical_section::with(|_| self.producer.clear());
        self.clean_buffer_until = self.host.millis().wrapping_add(CLEAN_BUFFER_MS).max(1);
        self.host.stepper_quick_stop();

        let reached = self.host.stepper_position();
        critical_section::with(|_| self.position_steps = reached);
        self.position_mm = Xyze::new(
            reached[0] as f32 * self.rates.steps_to_mm[0],
            reached[1] as f32 * self.rates.steps_to_mm[1],
            reached[2] as f32 * self.rates.steps_to_mm[2],
            reached[3] as f32 / self.extruders[self.active_extruder].steps_per_mm,
        );
        self.junction.reset();
    }

    /// Queue a position-synchronisation pseudo-block: the step generator
    /// adopts the planner's canonical position at this point in the
    /// stream. Carries no motion.
    pub fn buffer_sync_block(&mut self) {
        let slot = loop {
            match self.producer.free_slot() {
                Some(slot) => break slot,
                None => self.host.idle(),
            }
        };
        let position = self.position_steps;
        let block = self.producer.block_mut(slot);
        block.reset(flag::SYNC_POSITION);
        block.sync_target = position;
        self.producer.commit(self.host.millis());
    }

    /// Teach the planner (and the step generator) a new logical position:
    /// modifiers and the kinematic transform apply, then either a sync
    /// block is queued (queue busy) or the generator's position register
    /// is programmed directly (queue empty). A second call with the same
    /// target changes nothing and queues nothing.
    pub fn set_position_mm(&mut self, target: Xyze) {
        let mut modified = target;
        self.host.apply_modifiers(&mut modified);
        let machine = self.kinematics.to_axes(modified);
        self.set_machine_position_mm(machine, modified);
    }

    fn set_machine_position_mm(&mut self, machine: Xyze, head: Xyze) {
        let m = machine.to_array();
        let steps = [
            math::lroundf(m[0] * self.settings.axis_steps_per_mm[0]),
            math::lroundf(m[1] * self.settings.axis_steps_per_mm[1]),
            math::lroundf(m[2] * self.settings.axis_steps_per_mm[2]),
            math::lroundf(m[3] * self.extruders[self.active_extruder].steps_per_mm),
        ];
        if steps == self.position_steps {
            self.position_mm = head;
            return;
        }
        critical_section::with(|_| self.position_steps = steps);
        self.position_mm = head;
        // A position jump is a discontinuity: the next move plans its
        // junction from standstill.
        self.junction.reset();
        if self.has_blocks_queued() {
            self.buffer_sync_block();
        } else {
            self.host.stepper_set_position(steps);
        }
    }

    /// Reset only the extruder's logical position (G92 E-style). The
    /// geometric path stays continuous, so junction chaining is kept.
    pub fn set_e_position_mm(&mut self, e: f32) {
        const E: usize = Axis::E as usize;
        let e_steps = math::lroundf(e * self.extruders[self.active_extruder].steps_per_mm);
        if e_steps == self.position_steps[E] {
            self.position_mm.e = e;
            return;
        }
        critical_section::with(|_| self.position_steps[E] = e_steps);
        self.position_mm.e = e;
        if self.has_blocks_queued() {
            self.buffer_sync_block();
        } else {
            self.host.stepper_set_position(self.position_steps);
        }
    }

    /// An endstop fired: the planner only delegates to the step generator;
    /// the queue is untouched.
    pub fn endstop_triggered(&mut self, axis: Axis) {
        self.host.stepper_endstop_triggered(axis);
    }

    fn cleaning_active(&mut self) -> bool {
        if self.clean_buffer_until == 0 {
            return false;
        }
        let now = self.host.millis();
        if (self.clean_buffer_until.wrapping_sub(now) as i32) > 0 {
            true
        } else {
            self.clean_buffer_until = 0;
            false
        }
    }
}

/// Maximum speed (squared) at which a segment of length `distance` may
/// start so that it still reaches `target_speed_sqr` by its end under
/// `accel` (negative for deceleration): `target² − 2·a·d`, floored at 0.
pub(crate) fn max_allowable_speed_sqr(accel: f32, target_speed_sqr: f32, distance: f32) -> f32 {
    (target_speed_sqr - 2.0 * accel * distance).max(0.0)
}

/// Fit the accelerate/plateau/decelerate profile for one block given its
/// squared entry and exit speeds. All step counts refer to the Bresenham
/// master axis; when the plateau comes out negative the profile
/// degenerates to a triangle whose apex is the intersection of the two
/// ramps.
fn calculate_trapezoid(block: &mut Block, entry_speed_sqr: f32, exit_speed_sqr: f32) {
    let nominal_rate = block.nominal_rate as f32;
    // Entry and exit speeds as fractions of nominal map directly onto
    // step rates.
    let entry_factor = math::sqrtf(entry_speed_sqr / block.nominal_speed_sqr);
    let exit_factor = math::sqrtf(exit_speed_sqr / block.nominal_speed_sqr);
    let rate_ceiling = block.nominal_rate.max(MINIMAL_STEP_RATE);
    let initial_rate =
        (math::ceilf(nominal_rate * entry_factor) as u32).clamp(MINIMAL_STEP_RATE, rate_ceiling);
    let final_rate =
        (math::ceilf(nominal_rate * exit_factor) as u32).clamp(MINIMAL_STEP_RATE, rate_ceiling);

    let accel = (block.acceleration_steps_per_s2 as f32).max(1.0);
    let ir = initial_rate as f32;
    let fr = final_rate as f32;
    let mut accelerate_steps =
        math::ceilf((sq(nominal_rate) - sq(ir)) / (2.0 * accel)).max(0.0) as u32;
    let decelerate_steps =
        math::floorf((sq(nominal_rate) - sq(fr)) / (2.0 * accel)).max(0.0) as u32;

    let n = block.step_event_count;
    let mut plateau = n as i64 - accelerate_steps as i64 - decelerate_steps as i64;
    if plateau < 0 {
        // Not enough length to reach nominal: a triangle whose apex sits
        // where the entry and exit ramps intersect.
        let intersect =
            math::ceilf((2.0 * accel * n as f32 + sq(fr) - sq(ir)) / (4.0 * accel)).max(0.0);
        accelerate_steps = (intersect as u32).min(n);
        plateau = 0;
    }

    block.accelerate_until = accelerate_steps;
    block.decelerate_after = accelerate_steps + plateau as u32;
    block.initial_rate = initial_rate;
    block.final_rate = final_rate;
}
