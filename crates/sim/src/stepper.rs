//! The simulated step generator: consumes planned blocks exactly the way
//! the firmware ISR contract describes — latch at the tail, honour the
//! direction bits, Bresenham over the master step count, ramp the step
//! timer from `initial_rate` through `nominal_rate` to `final_rate`.

use motion::block::{flag, Block};
use motion::config::MINIMAL_STEP_RATE;
use motion::divide::period_inverse;
use motion::queue::QueueConsumer;
use motion::NUM_AXES;
use serde::Serialize;

/// Simulated step-timer frequency, ticks per second.
pub const STEPPER_TICK_HZ: u64 = 1_000_000;

/// One emitted step pulse: which motors stepped, the direction bits in
/// effect, and the timer delay that preceded the pulse, in ticks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct StepPulse {
    pub stepper_mask: u8,
    pub direction_bits: u8,
    pub interval_ticks: u32,
}

/// Execution state of the latched block, copied out at latch time the way
/// an ISR snapshots into its working registers.
#[derive(Debug)]
struct Executing {
    steps: [u32; NUM_AXES],
    direction_bits: u8,
    step_event_count: u32,
    accelerate_until: u32,
    decelerate_after: u32,
    initial_rate: u32,
    nominal_rate: u32,
    final_rate: u32,
    acceleration_steps_per_s2: u32,
    /// Step events completed so far.
    done: u32,
    /// Bresenham error accumulators, one per axis.
    delta_error: [i32; NUM_AXES],
}

impl Executing {
    fn latch(block: &Block) -> Self {
        let bias = -((block.step_event_count / 2) as i32);
        Self {
            steps: block.steps,
            direction_bits: block.direction_bits,
            step_event_count: block.step_event_count,
            accelerate_until: block.accelerate_until,
            decelerate_after: block.decelerate_after,
            initial_rate: block.initial_rate,
            nominal_rate: block.nominal_rate,
            final_rate: block.final_rate,
            acceleration_steps_per_s2: block.acceleration_steps_per_s2,
            done: 0,
            delta_error: [bias; NUM_AXES],
        }
    }

    /// Step rate at event `n`, steps/s, following the fitted trapezoid:
    /// `v² = v0² + 2·a·d` on the ramps, nominal on the plateau.
    fn rate_at(&self, n: u32) -> u32 {
        let accel = self.acceleration_steps_per_s2 as f32;
        let rate = if n < self.accelerate_until {
            let v_sqr = (self.initial_rate as f32).powi(2) + 2.0 * accel * n as f32;
            v_sqr.sqrt() as u32
        } else if n >= self.decelerate_after {
            let remaining = self.step_event_count - n;
            let v_sqr = (self.final_rate as f32).powi(2) + 2.0 * accel * remaining as f32;
            v_sqr.sqrt() as u32
        } else {
            self.nominal_rate
        };
        rate.clamp(MINIMAL_STEP_RATE.min(self.nominal_rate), self.nominal_rate)
    }
}

enum Latched {
    Nothing,
    Sync([i32; NUM_AXES]),
    Move(Executing),
}

/// Simulated step generator holding the consumer half of the block queue.
pub struct SimStepper<'q, const N: usize> {
    consumer: QueueConsumer<'q, N>,
    /// Machine position in steps, as the motor drivers would track it.
    position: [i32; NUM_AXES],
    pulses: Vec<StepPulse>,
    /// Simulated time, in step-timer ticks.
    ticks: u64,
    exec: Option<Executing>,
}

impl<'q, const N: usize> SimStepper<'q, N> {
    pub fn new(consumer: QueueConsumer<'q, N>) -> Self {
        Self {
            consumer,
            position: [0; NUM_AXES],
            pulses: Vec::new(),
            ticks: 0,
            exec: None,
        }
    }

    pub fn position(&self) -> [i32; NUM_AXES] {
        self.position
    }

    pub fn set_position(&mut self, steps: [i32; NUM_AXES]) {
        self.position = steps;
    }

    pub fn pulses(&self) -> &[StepPulse] {
        &self.pulses
    }

    pub fn take_pulses(&mut self) -> Vec<StepPulse> {
        std::mem::take(&mut self.pulses)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Simulated wall clock, ms.
    pub fn millis(&self) -> u32 {
        (self.ticks / (STEPPER_TICK_HZ / 1000)) as u32
    }

    /// Let simulated time pass without stepping (idle waits).
    pub fn advance_idle(&mut self, ms: u32) {
        self.ticks += ms as u64 * (STEPPER_TICK_HZ / 1000);
    }

    /// Abandon the latched block; the planner has already emptied the
    /// queue when it signals this.
    pub fn quick_stop(&mut self) {
        self.exec = None;
    }

    /// Run one scheduling slice: latch a block if none is executing, then
    /// emit at most one step event. Returns `false` when there was nothing
    /// to do (empty queue or delivery delay pending).
    pub fn tick(&mut self) -> bool {
        if self.exec.is_none() {
            let now = self.millis();
            let latched = match self.consumer.current_block(now) {
                None => Latched::Nothing,
                Some(block) if block.has(flag::SYNC_POSITION) => Latched::Sync(block.sync_target),
                Some(block) => Latched::Move(Executing::latch(block)),
            };
            match latched {
                Latched::Nothing => return false,
                Latched::Sync(target) => {
                    // A sync block only teaches the generator where the
                    // planner believes it is.
                    self.position = target;
                    self.consumer.discard_current();
                    return true;
                }
                Latched::Move(exec) => self.exec = Some(exec),
            }
        }

        let exec = self.exec.as_mut().expect("move latched above");
        let rate = exec.rate_at(exec.done).max(1);
        // Rounded fixed-point period: ticks/step = tick_hz · (2^24/rate) / 2^24.
        let interval =
            (((STEPPER_TICK_HZ * period_inverse(rate) as u64 + (1 << 23)) >> 24).max(1)) as u32;

        // Bresenham over the master count decides which motors pulse.
        let mut stepper_mask = 0u8;
        for axis in 0..NUM_AXES {
            exec.delta_error[axis] += exec.steps[axis] as i32;
            if exec.delta_error[axis] >= 0 {
                exec.delta_error[axis] -= exec.step_event_count as i32;
                stepper_mask |= 1 << axis;
                self.position[axis] +=
                    if exec.direction_bits & (1 << axis) != 0 { -1 } else { 1 };
            }
        }

        self.ticks += interval as u64;
        self.pulses.push(StepPulse {
            stepper_mask,
            direction_bits: exec.direction_bits,
            interval_ticks: interval,
        });

        exec.done += 1;
        if exec.done >= exec.step_event_count {
            self.exec = None;
            self.consumer.discard_current();
        }
        true
    }

    /// Number of blocks still queued (latched block included).
    pub fn queued(&self) -> usize {
        self.consumer.occupancy()
    }
}
