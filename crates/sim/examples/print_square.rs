//! Queue a small printed square against the simulated step generator and
//! report what the motors would have seen.
//!
//! ```sh
//! cargo run -p sim --example print_square
//! ```

use anyhow::Result;
use motion::{BlockQueue, ExtruderSettings, Kinematics, Planner, PlannerSettings, Xyze};
use sim::{SimHost, SimStepper, STEPPER_TICK_HZ};
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let host = SimHost::new(SimStepper::new(consumer));
    let mut planner = Planner::new(
        PlannerSettings::default(),
        Kinematics::Cartesian,
        &[ExtruderSettings::default()],
        producer,
        host,
    )?;

    // A 40 mm square, extruding ~1.3 mm of filament per side.
    let corners = [
        (50.0, 10.0),
        (50.0, 50.0),
        (10.0, 50.0),
        (10.0, 10.0),
    ];
    planner.set_position_mm(Xyze::new(10.0, 10.0, 0.2, 0.0));
    let mut e = 0.0;
    for (x, y) in corners {
        e += 1.33;
        planner.buffer_line(Xyze::new(x, y, 0.2, e), 60.0, 0, None);
    }
    planner.synchronize();

    let stepper = &planner.host().stepper;
    let pulses = stepper.pulses();
    let seconds = stepper.ticks() as f64 / STEPPER_TICK_HZ as f64;
    info!(
        pulses = pulses.len(),
        seconds,
        position = ?stepper.position(),
        "square drained"
    );

    let slowest = pulses.iter().map(|p| p.interval_ticks).max().unwrap_or(0);
    let fastest = pulses.iter().map(|p| p.interval_ticks).min().unwrap_or(0);
    info!(slowest_ticks = slowest, fastest_ticks = fastest, "step interval range");

    let trace_path = std::env::temp_dir().join("print_square_trace.json");
    planner.host().dump_trace(&trace_path)?;
    info!(path = %trace_path.display(), "trace written");
    Ok(())
}
