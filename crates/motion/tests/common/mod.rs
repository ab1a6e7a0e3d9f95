//! Shared fixtures for the planner integration tests.

#![allow(dead_code)]

use motion::queue::QueueConsumer;
use motion::{Axis, ExtruderSettings, PlannerHost, PlannerSettings, Xyze, NUM_AXES};

/// A scripted host: manually advanced clock, switchable cold-extrusion
/// state, and recording of the step-generator signals.
#[derive(Debug, Default)]
pub struct TestHost {
    pub now_ms: u32,
    pub cold: bool,
    pub stepper_pos: [i32; NUM_AXES],
    pub quick_stops: usize,
    pub endstops: Vec<Axis>,
    pub register_writes: Vec<[i32; NUM_AXES]>,
    pub idles: usize,
}

impl PlannerHost for TestHost {
    fn millis(&self) -> u32 {
        self.now_ms
    }

    fn idle(&mut self) {
        self.idles += 1;
        // Nothing drains here; tests that exercise back-pressure live in
        // the sim crate where idle work runs the step generator.
        assert!(self.idles < 1_000_000, "planner busy-wait never released");
    }

    fn too_cold_to_extrude(&self, _extruder: usize) -> bool {
        self.cold
    }

    fn stepper_quick_stop(&mut self) {
        self.quick_stops += 1;
    }

    fn stepper_position(&self) -> [i32; NUM_AXES] {
        self.stepper_pos
    }

    fn stepper_set_position(&mut self, steps: [i32; NUM_AXES]) {
        self.register_writes.push(steps);
    }

    fn stepper_endstop_triggered(&mut self, axis: Axis) {
        self.endstops.push(axis);
    }
}

/// The reference machine for these tests: 80 steps/mm on X/Y, isotropic
/// 3000 mm/s² XY acceleration, junction deviation 0.05 mm, slowdown off
/// so nominal speeds stay exactly as requested.
pub fn scenario_settings() -> PlannerSettings {
    PlannerSettings {
        axis_steps_per_mm: [80.0, 80.0, 400.0, 93.0],
        max_feedrate_mm_s: [300.0, 300.0, 5.0, 120.0],
        max_acceleration_mm_s2: [3000.0, 3000.0, 100.0, 10_000.0],
        print_acceleration_mm_s2: 3000.0,
        travel_acceleration_mm_s2: 3000.0,
        junction_deviation_mm: 0.05,
        slowdown: false,
        ..Default::default()
    }
}

pub fn one_extruder() -> [ExtruderSettings; 1] {
    [ExtruderSettings::default()]
}

pub fn xyze(x: f32, y: f32, z: f32, e: f32) -> Xyze {
    Xyze::new(x, y, z, e)
}

/// A plain-data copy of one queued block.
#[derive(Debug, Clone)]
pub struct Snap {
    pub steps: [u32; NUM_AXES],
    pub direction_bits: u8,
    pub step_event_count: u32,
    pub millimeters: f32,
    pub acceleration: f32,
    pub nominal_rate: u32,
    pub nominal_speed_sqr: f32,
    pub entry_speed_sqr: f32,
    pub max_entry_speed_sqr: f32,
    pub accelerate_until: u32,
    pub decelerate_after: u32,
    pub initial_rate: u32,
    pub final_rate: u32,
    pub sync: bool,
}

/// Copy out the queued blocks, oldest first, without latching anything.
pub fn snapshots<const N: usize>(consumer: &QueueConsumer<'_, N>) -> Vec<Snap> {
    let mut out = Vec::new();
    consumer.visit_queued(|_, b| {
        out.push(Snap {
            steps: b.steps,
            direction_bits: b.direction_bits,
            step_event_count: b.step_event_count,
            millimeters: b.millimeters,
            acceleration: b.acceleration,
            nominal_rate: b.nominal_rate,
            nominal_speed_sqr: b.nominal_speed_sqr,
            entry_speed_sqr: b.entry_speed_sqr,
            max_entry_speed_sqr: b.max_entry_speed_sqr,
            accelerate_until: b.accelerate_until,
            decelerate_after: b.decelerate_after,
            initial_rate: b.initial_rate,
            final_rate: b.final_rate,
            sync: b.is_sync(),
        });
    });
    out
}

/// Drain the queue through the consumer protocol, summing signed step
/// deltas per axis the way a stepper driver would apply them.
pub fn drain_steps<const N: usize>(consumer: &mut QueueConsumer<'_, N>) -> [i64; NUM_AXES] {
    let mut totals = [0i64; NUM_AXES];
    loop {
        let latched = match consumer.current_block(u32::MAX / 2) {
            None => break,
            Some(b) => {
                if b.is_sync() {
                    None
                } else {
                    Some((b.steps, b.direction_bits))
                }
            }
        };
        if let Some((steps, dirs)) = latched {
            for axis in 0..NUM_AXES {
                let delta = steps[axis] as i64;
                totals[axis] += if dirs & (1 << axis) != 0 { -delta } else { delta };
            }
        }
        consumer.discard_current();
    }
    totals
}
