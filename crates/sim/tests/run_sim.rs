//! End-to-end simulation: planner and simulated step generator sharing a
//! block queue, drained through the real latch/busy protocol.

use motion::{BlockQueue, ExtruderSettings, Kinematics, Planner, PlannerSettings, Xyze};
use sim::{SimHost, SimStepper};

fn sim_settings() -> PlannerSettings {
    PlannerSettings {
        axis_steps_per_mm: [80.0, 80.0, 400.0, 93.0],
        junction_deviation_mm: 0.05,
        slowdown: false,
        ..Default::default()
    }
}

fn make_planner<const N: usize>(
    queue: &mut BlockQueue<N>,
) -> Planner<'_, SimHost<'_, N>, N> {
    let (producer, consumer) = queue.split();
    let host = SimHost::new(SimStepper::new(consumer));
    Planner::new(
        sim_settings(),
        Kinematics::Cartesian,
        &[ExtruderSettings::default()],
        producer,
        host,
    )
    .unwrap()
}

fn xyze(x: f32, y: f32, z: f32, e: f32) -> Xyze {
    Xyze::new(x, y, z, e)
}

#[test]
fn square_path_drains_to_exact_step_totals() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let mut planner = make_planner(&mut queue);

    for (x, y) in [(40.0, 0.0), (40.0, 40.0), (0.0, 40.0), (0.0, 0.0)] {
        assert!(planner.buffer_line(xyze(x, y, 0.0, 0.0), 100.0, 0, None));
    }
    planner.synchronize();

    // Step integrity: back at the origin, to the step.
    assert_eq!(planner.host().stepper.position(), [0, 0, 0, 0]);
    assert!(!planner.has_blocks_queued());

    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 100.0, 0, None);
    planner.synchronize();
    assert_eq!(planner.host().stepper.position(), [800, 0, 0, 0]);
}

#[test]
fn executed_profile_ramps_like_the_planned_trapezoid() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let mut planner = make_planner(&mut queue);

    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 100.0, 0, None);
    planner.synchronize();

    let pulses = planner.host().stepper.pulses();
    assert_eq!(pulses.len(), 800);

    // Starts near the 120 steps/s floor (≈ 8333 ticks at 1 MHz)...
    assert!(pulses[0].interval_ticks > 8000, "first interval {}", pulses[0].interval_ticks);
    // ...reaches the 8000 steps/s cruise (125 ticks) mid-move...
    let min_interval = pulses.iter().map(|p| p.interval_ticks).min().unwrap();
    assert_eq!(min_interval, 125);
    // ...and only ever speeds up while accelerating.
    for pair in pulses[..100].windows(2) {
        assert!(pair[1].interval_ticks <= pair[0].interval_ticks);
    }
    // Deceleration mirrors it at the end.
    for pair in pulses[750..].windows(2) {
        assert!(pair[1].interval_ticks >= pair[0].interval_ticks);
    }
}

#[test]
fn first_move_is_withheld_for_the_delivery_delay() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let mut planner = make_planner(&mut queue);

    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 100.0, 0, None);

    let host = planner.host_mut();
    let mut guard = 0;
    while host.stepper.pulses().is_empty() {
        if !host.stepper.tick() {
            host.stepper.advance_idle(1);
        }
        guard += 1;
        assert!(guard < 100_000, "first move never delivered");
    }
    // A lone queued move waits out BLOCK_DELAY_FOR_1ST_MOVE.
    assert!(host.stepper.millis() >= 100, "delivered at {} ms", host.stepper.millis());
}

#[test]
fn full_queue_back_pressure_resolves_through_idle_work() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let mut planner = make_planner(&mut queue);

    // 20 moves into a 16-deep ring: the surplus admissions spin on idle,
    // which runs the generator, which frees slots.
    for i in 1..=20 {
        assert!(planner.buffer_line(xyze(10.0 * i as f32, 0.0, 0.0, 0.0), 100.0, 0, None));
    }
    planner.synchronize();
    assert_eq!(planner.host().stepper.position(), [16_000, 0, 0, 0]);
}

#[test]
fn quick_stop_discards_midstream_and_resyncs_position() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let mut planner = make_planner(&mut queue);

    for i in 1..=10 {
        planner.buffer_line(xyze(10.0 * i as f32, 0.0, 0.0, 0.0), 100.0, 0, None);
    }

    // Execute a couple of thousand step events, stopping mid-queue.
    for _ in 0..2500 {
        let host = planner.host_mut();
        if !host.stepper.tick() {
            host.stepper.advance_idle(1);
        }
    }
    let physically_reached = planner.host().stepper.position();
    assert!(physically_reached[0] > 0);
    assert!(planner.has_blocks_queued());

    planner.quick_stop();
    assert!(!planner.has_blocks_queued());
    // The planner adopted what the generator physically reached.
    assert_eq!(planner.position_steps(), planner.host().stepper.position());

    // Clean-buffer window: refused now, admitted a second later.
    assert!(!planner.buffer_line(xyze(5.0, 0.0, 0.0, 0.0), 100.0, 0, None));
    planner.host_mut().stepper.advance_idle(1001);
    assert!(planner.buffer_line(xyze(5.0, 0.0, 0.0, 0.0), 100.0, 0, None));
    planner.synchronize();
    assert_eq!(planner.host().stepper.position(), [400, 0, 0, 0]);

    // The stop is on the trace.
    assert!(matches!(planner.host().trace()[0], sim::TraceEntry::QuickStop { .. }));
}

#[test]
fn sync_block_teaches_the_generator_mid_stream() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let mut planner = make_planner(&mut queue);

    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 100.0, 0, None);
    // Queue is busy, so this travels as a sync block behind the move.
    planner.set_position_mm(xyze(0.0, 0.0, 0.0, 0.0));
    planner.synchronize();

    // The generator physically stepped to 800, then adopted the logical 0.
    assert_eq!(planner.host().stepper.position(), [0, 0, 0, 0]);

    planner.buffer_line(xyze(5.0, 0.0, 0.0, 0.0), 100.0, 0, None);
    planner.synchronize();
    assert_eq!(planner.host().stepper.position(), [400, 0, 0, 0]);
}

#[test]
fn cold_extrusion_never_reaches_the_extruder_motor() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let mut planner = make_planner(&mut queue);
    planner.host_mut().cold_extrude = true;

    planner.buffer_line(xyze(10.0, 0.0, 0.0, 3.0), 50.0, 0, None);
    planner.synchronize();

    assert_eq!(planner.host().stepper.position()[0], 800);
    assert_eq!(planner.host().stepper.position()[3], 0);
    // The logical position pretends the extrusion happened.
    assert_eq!(planner.position_steps()[3], (3.0f32 * 93.0).round() as i32);
}

#[test]
fn trace_serializes_and_dumps() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let mut planner = make_planner(&mut queue);

    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 100.0, 0, None);
    planner.quick_stop();
    planner.endstop_triggered(motion::Axis::A);

    let json = planner.host().trace_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(value.as_array().unwrap().len() >= 2);

    let path = std::env::temp_dir().join("motion_sim_trace.json");
    planner.host().dump_trace(&path).unwrap();
    assert!(path.exists());
    let _ = std::fs::remove_file(path);
}
