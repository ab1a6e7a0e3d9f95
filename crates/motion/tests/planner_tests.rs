//! Move admission and control-operation tests: step quantization,
//! per-axis limiting, absorbed-invalid moves, position ops and quick-stop.

mod common;

use common::{one_extruder, scenario_settings, snapshots, xyze, TestHost};
use float_cmp::approx_eq;
use motion::config::{MINIMUM_PLANNER_SPEED, MIN_STEPS_PER_SEGMENT};
use motion::{Axis, BlockQueue, ExtruderSettings, Kinematics, Planner, PlannerSettings};

const MIN_SPEED_SQR: f32 = MINIMUM_PLANNER_SPEED * MINIMUM_PLANNER_SPEED;

#[test]
fn single_straight_move_quantizes_and_fits_a_symmetric_profile() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    assert!(planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 100.0, 0, None));

    let blocks = snapshots(&consumer);
    assert_eq!(blocks.len(), 1);
    let b = &blocks[0];

    // 10 mm at 80 steps/mm along X only.
    assert_eq!(b.steps, [800, 0, 0, 0]);
    assert_eq!(b.step_event_count, 800);
    assert_eq!(b.direction_bits, 0);
    assert!(approx_eq!(f32, b.millimeters, 10.0, epsilon = 1e-4));

    // 100 mm/s over 10 mm: 8000 steps/s, entry and exit at the sentinel.
    assert_eq!(b.nominal_rate, 8000);
    assert!(approx_eq!(f32, b.nominal_speed_sqr, 10_000.0, epsilon = 0.01));
    assert!(approx_eq!(f32, b.entry_speed_sqr, MIN_SPEED_SQR, epsilon = 1e-6));

    // accel = 3000 mm/s² · 80 steps/mm = 240000 steps/s²:
    // ceil((8000² − 120²) / 480000) = 134 accelerating steps, 133 braking.
    assert_eq!(b.accelerate_until, 134);
    assert_eq!(b.decelerate_after, 800 - 133);
    assert_eq!(b.initial_rate, 120);
    assert_eq!(b.final_rate, 120);
    // Symmetric within one step.
    let tail_steps = b.step_event_count - b.decelerate_after;
    assert!(b.accelerate_until.abs_diff(tail_steps) <= 1);
}

#[test]
fn per_axis_feedrate_cap_shrinks_the_whole_move() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    // 400 mm/s requested against a 300 mm/s X limit.
    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 400.0, 0, None);

    let b = &snapshots(&consumer)[0];
    assert!(approx_eq!(f32, b.nominal_speed_sqr, 300.0 * 300.0, epsilon = 1.0));
    // nominal_rate scales by the same 0.75 factor: 32000 → 24000.
    assert!((23_990..=24_010).contains(&b.nominal_rate));
}

#[test]
fn per_axis_acceleration_cap_limits_slow_axes() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    // Z-only move: the 100 mm/s² Z budget must win over the 3000 default.
    planner.buffer_line(xyze(0.0, 0.0, 5.0, 0.0), 5.0, 0, None);

    let b = &snapshots(&consumer)[0];
    assert_eq!(b.steps, [0, 0, 2000, 0]);
    assert!(approx_eq!(f32, b.acceleration, 100.0, epsilon = 0.1));
}

#[test]
fn sub_threshold_move_is_dropped_and_absorbed() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    // 0.01 mm is less than MIN_STEPS_PER_SEGMENT steps at 80 steps/mm.
    assert!((0.01 * 80.0) < MIN_STEPS_PER_SEGMENT as f32);
    assert!(planner.buffer_line(xyze(0.01, 0.0, 0.0, 0.0), 50.0, 0, None));
    assert_eq!(planner.moves_queued(), 0);
    assert_eq!(planner.position_steps(), [0, 0, 0, 0]);

    // The dropped distance folds into the next admitted segment.
    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 50.0, 0, None);
    let b = &snapshots(&consumer)[0];
    assert_eq!(b.steps[0], 800);
    assert_eq!(planner.position_steps(), [800, 0, 0, 0]);
}

#[test]
fn cold_extrusion_keeps_geometry_and_advances_e() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let host = TestHost { cold: true, ..Default::default() };
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        host,
    )
    .unwrap();

    assert!(planner.buffer_line(xyze(10.0, 0.0, 0.0, 5.0), 50.0, 0, None));

    let b = &snapshots(&consumer)[0];
    assert_eq!(b.steps[0], 800);
    assert_eq!(b.steps[3], 0, "cold extrusion must lose its E component");
    // The logical E position still advances, as if the move happened.
    assert_eq!(planner.position_steps()[3], (5.0f32 * 93.0).round() as i32);
}

#[test]
fn over_long_extrusion_is_absorbed() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    // 250 mm of filament in one move exceeds the 200 mm default limit.
    assert!(planner.buffer_line(xyze(10.0, 0.0, 0.0, 250.0), 50.0, 0, None));
    let b = &snapshots(&consumer)[0];
    assert_eq!(b.steps[3], 0);
    assert_eq!(planner.position_steps()[3], (250.0f32 * 93.0).round() as i32);
}

#[test]
fn extruder_only_move_uses_filament_length_and_retract_acceleration() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    planner.buffer_line(xyze(0.0, 0.0, 0.0, -2.0), 40.0, 0, None);

    let b = &snapshots(&consumer)[0];
    assert_eq!(b.steps[..3], [0, 0, 0]);
    assert_eq!(b.steps[3], 186); // 2 mm · 93 steps/mm
    assert!(b.direction_bits & (1 << 3) != 0);
    assert!(approx_eq!(f32, b.millimeters, 2.0, epsilon = 1e-4));
    // Retract acceleration (1500 default), not print acceleration.
    assert!(approx_eq!(
        f32,
        b.acceleration,
        planner.settings().retract_acceleration_mm_s2,
        epsilon = 1.0
    ));
}

#[test]
fn slowdown_stretches_short_segments_while_the_queue_is_low() {
    let settings = PlannerSettings {
        slowdown: true,
        min_segment_time_us: 20_000,
        ..scenario_settings()
    };
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        settings,
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    // 0.1 mm at 100 mm/s is a 1 ms segment, far below the 20 ms floor.
    for i in 1..=4 {
        planner.buffer_line(xyze(0.1 * i as f32, 0.0, 0.0, 0.0), 100.0, 0, None);
    }

    let blocks = snapshots(&consumer);
    // Occupancy 0 and 1: no stretch yet.
    assert!(approx_eq!(f32, blocks[0].nominal_speed_sqr, 10_000.0, epsilon = 1.0));
    assert!(approx_eq!(f32, blocks[1].nominal_speed_sqr, 10_000.0, epsilon = 1.0));
    // Occupancy 2: stretched to 1000 + 2·19000/2 = 20000 µs → 5 mm/s.
    assert!(approx_eq!(f32, blocks[2].nominal_speed_sqr, 25.0, epsilon = 0.5));
    // Occupancy 3: 1000 + 2·19000/3 ≈ 13667 µs → ≈ 7.3 mm/s.
    assert!(blocks[3].nominal_speed_sqr > blocks[2].nominal_speed_sqr);
    assert!(blocks[3].nominal_speed_sqr < 100.0);
}

#[test]
fn corexy_couples_motors_and_keeps_head_directions() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::CoreXy { factor: 1 },
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    // Pure +Y head motion drives the motors in opposite directions.
    planner.buffer_line(xyze(0.0, 10.0, 0.0, 0.0), 50.0, 0, None);

    let b = &snapshots(&consumer)[0];
    assert_eq!(b.steps[0], 800);
    assert_eq!(b.steps[1], 800);
    // Motor A positive, motor B negative; head X positive, head Y positive.
    assert_eq!(b.direction_bits & 0b0000_0011, 0b0000_0010);
    assert_eq!(b.direction_bits & 0b0011_0000, 0);
    // Length is the head-space length, not the motor-space diagonal.
    assert!(approx_eq!(f32, b.millimeters, 10.0, epsilon = 1e-4));
}

#[test]
fn set_position_is_idempotent_and_emits_at_most_one_sync_block() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 100.0, 0, None);

    planner.set_position_mm(xyze(50.0, 0.0, 0.0, 0.0));
    let after_first = planner.position_steps();
    planner.set_position_mm(xyze(50.0, 0.0, 0.0, 0.0));
    assert_eq!(planner.position_steps(), after_first);
    assert_eq!(after_first[0], 4000);

    let syncs = snapshots(&consumer).iter().filter(|b| b.sync).count();
    assert_eq!(syncs, 1);
}

#[test]
fn set_position_with_empty_queue_programs_the_generator_directly() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, _consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    planner.set_position_mm(xyze(5.0, 5.0, 0.0, 0.0));
    assert_eq!(planner.moves_queued(), 0);
    // With nothing queued, the generator's position register is written
    // directly instead of a sync block travelling the queue.
    assert_eq!(planner.host().register_writes, vec![[400, 400, 0, 0]]);
    assert_eq!(planner.position_steps(), [400, 400, 0, 0]);
}

#[test]
fn quick_stop_discards_the_queue_and_rate_limits_admission() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, _consumer) = queue.split();
    let host = TestHost { now_ms: 5000, stepper_pos: [120, 0, 0, 0], ..Default::default() };
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        host,
    )
    .unwrap();

    for i in 1..=10 {
        planner.buffer_line(xyze(i as f32, 0.0, 0.0, 0.0), 100.0, 0, None);
    }
    assert_eq!(planner.moves_queued(), 10);

    planner.quick_stop();
    assert!(!planner.has_blocks_queued());
    assert_eq!(planner.host().quick_stops, 1);
    // The planner resynchronizes on where the generator actually stopped.
    assert_eq!(planner.position_steps(), [120, 0, 0, 0]);

    // Within the clean-buffer second: refused.
    assert!(!planner.buffer_line(xyze(20.0, 0.0, 0.0, 0.0), 100.0, 0, None));
    planner.host_mut().now_ms = 5999;
    assert!(!planner.buffer_line(xyze(20.0, 0.0, 0.0, 0.0), 100.0, 0, None));
    // After it: admitted again.
    planner.host_mut().now_ms = 6000;
    assert!(planner.buffer_line(xyze(20.0, 0.0, 0.0, 0.0), 100.0, 0, None));
    assert_eq!(planner.moves_queued(), 1);
}

#[test]
fn endstop_trigger_delegates_without_touching_the_queue() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, _consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 100.0, 0, None);
    planner.endstop_triggered(Axis::A);
    assert_eq!(planner.host().endstops, vec![Axis::A]);
    assert_eq!(planner.moves_queued(), 1);
}

#[test]
fn settings_validation_rejects_nonsense() {
    let mut settings = scenario_settings();
    settings.axis_steps_per_mm[1] = 0.0;
    assert!(settings.validate().is_err());

    let mut settings = scenario_settings();
    settings.junction_deviation_mm = 0.0;
    assert!(settings.validate().is_err());

    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, _consumer) = queue.split();
    let bad_extruder = [ExtruderSettings { steps_per_mm: 0.0, ..Default::default() }];
    assert!(Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &bad_extruder,
        producer,
        TestHost::default(),
    )
    .is_err());
}

#[test]
fn flush_and_update_refreshes_derived_rates() {
    let mut queue: BlockQueue<16> = BlockQueue::new();
    let (producer, consumer) = queue.split();
    let mut planner = Planner::new(
        scenario_settings(),
        Kinematics::Cartesian,
        &one_extruder(),
        producer,
        TestHost::default(),
    )
    .unwrap();

    let mut settings = scenario_settings();
    settings.axis_steps_per_mm[0] = 160.0;
    planner.flush_and_update(settings).unwrap();

    planner.buffer_line(xyze(10.0, 0.0, 0.0, 0.0), 100.0, 0, None);
    let b = &snapshots(&consumer)[0];
    assert_eq!(b.steps[0], 1600);
}
