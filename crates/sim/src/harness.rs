//! Simulation harness: wires the planner's host services to the
//! simulated step generator and captures a trace for analysis and CI
//! validation.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use motion::{Axis, PlannerHost, NUM_AXES};
use serde::Serialize;
use tracing::info;

use crate::stepper::SimStepper;
use crate::SimError;

/// One recorded harness event, timestamped in simulated milliseconds.
#[derive(Debug, Clone, Serialize)]
pub enum TraceEntry {
    QuickStop { at_ms: u32, position: [i32; NUM_AXES] },
    EndstopTriggered { at_ms: u32, axis: Axis },
    PositionRegisterWrite { at_ms: u32, steps: [i32; NUM_AXES] },
}

/// The planner host used by simulations and integration tests.
///
/// Owns the simulated step generator: the planner's `idle()` yields run
/// the generator, so back-pressure and `synchronize()` drain the queue
/// exactly the way the firmware's idle loop would.
pub struct SimHost<'q, const N: usize> {
    pub stepper: SimStepper<'q, N>,
    /// Cold-extrusion switch for tests; a real host asks its thermal
    /// manager.
    pub cold_extrude: bool,
    trace: Vec<TraceEntry>,
}

impl<'q, const N: usize> SimHost<'q, N> {
    pub fn new(stepper: SimStepper<'q, N>) -> Self {
        Self { stepper, cold_extrude: false, trace: Vec::new() }
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Serialize the recorded trace as pretty JSON.
    pub fn trace_json(&self) -> Result<String, SimError> {
        Ok(serde_json::to_string_pretty(&self.trace)?)
    }

    /// Dump the recorded trace to a file.
    pub fn dump_trace(&self, path: &Path) -> Result<(), SimError> {
        info!(path = %path.display(), "dumping harness trace");
        let mut file = File::create(path)?;
        file.write_all(self.trace_json()?.as_bytes())?;
        Ok(())
    }
}

impl<'q, const N: usize> PlannerHost for SimHost<'q, N> {
    fn millis(&self) -> u32 {
        self.stepper.millis()
    }

    fn idle(&mut self) {
        // The firmware idle loop services the step timer; here one tick
        // either executes a step event or lets a millisecond pass.
        if !self.stepper.tick() {
            self.stepper.advance_idle(1);
        }
    }

    fn too_cold_to_extrude(&self, _extruder: usize) -> bool {
        self.cold_extrude
    }

    fn stepper_quick_stop(&mut self) {
        self.stepper.quick_stop();
        self.trace.push(TraceEntry::QuickStop {
            at_ms: self.stepper.millis(),
            position: self.stepper.position(),
        });
    }

    fn stepper_position(&self) -> [i32; NUM_AXES] {
        self.stepper.position()
    }

    fn stepper_set_position(&mut self, steps: [i32; NUM_AXES]) {
        self.stepper.set_position(steps);
        self.trace.push(TraceEntry::PositionRegisterWrite {
            at_ms: self.stepper.millis(),
            steps,
        });
    }

    fn stepper_endstop_triggered(&mut self, axis: Axis) {
        self.trace.push(TraceEntry::EndstopTriggered { at_ms: self.stepper.millis(), axis });
    }
}
