//! Motion semantics: clamping, mutual exclusion, spin displacement and the
//! keep-alive loop, observed through the command stream.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{mock_robot, MockState};
use rollbot::protocol::commands::devices;
use rollbot::ToyModel;

/// Decoded drive commands: (speed, heading, direction flag).
fn drive_commands(state: &MockState) -> Vec<(u8, u16, u8)> {
    state
        .commands_for(devices::DRIVING, 0x07)
        .iter()
        .map(|p| {
            (
                p.data[0],
                u16::from_be_bytes([p.data[1], p.data[2]]),
                p.data[3],
            )
        })
        .collect()
}

/// Decoded raw motor commands: (left mode, left power, right mode, right power).
fn raw_commands(state: &MockState) -> Vec<(u8, u8, u8, u8)> {
    state
        .commands_for(devices::DRIVING, 0x01)
        .iter()
        .map(|p| (p.data[0], p.data[1], p.data[2], p.data[3]))
        .collect()
}

/// Total displacement of a forward heading sequence starting from `start`.
fn forward_displacement(start: u16, headings: &[u16]) -> i64 {
    let mut previous = start;
    let mut total = 0i64;
    for &heading in headings {
        total += i64::from((360 + heading - previous) % 360);
        previous = heading;
    }
    total
}

#[test]
fn heading_normalizes_into_one_turn() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.set_heading(450).unwrap();
    assert_eq!(robot.get_heading(), 90);
    robot.set_heading(-10).unwrap();
    assert_eq!(robot.get_heading(), 350);

    let headings: Vec<u16> = drive_commands(&state).iter().map(|c| c.1).collect();
    assert_eq!(headings, vec![90, 350]);
    drop(robot);
}

#[test]
fn speeds_clamp_to_the_device_range() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.set_speed(300).unwrap();
    assert_eq!(robot.get_speed(), 255);
    let (speed, _, flag) = drive_commands(&state)[0];
    assert_eq!((speed, flag), (255, 0));
    drop(robot);
}

#[test]
fn roll_drives_then_stops() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.roll(90, 200, Duration::from_millis(50)).unwrap();

    let drives = drive_commands(&state);
    assert_eq!(drives.first().copied(), Some((200, 90, 0)));
    // The roll epilogue parks the toy.
    assert_eq!(drives.last().map(|c| c.0), Some(0));
    assert_eq!(robot.get_speed(), 0);
    drop(robot);
}

#[test]
fn backward_roll_flips_heading_and_direction_flag() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.roll(0, -100, Duration::from_millis(10)).unwrap();

    let (speed, heading, flag) = drive_commands(&state)[0];
    assert_eq!(speed, 100);
    assert_eq!(heading, 180);
    assert_eq!(flag, 1);
    drop(robot);
}

#[test]
fn mini_speeds_are_remapped() {
    let (robot, state) = mock_robot(ToyModel::Mini);
    robot.set_speed(255).unwrap();
    assert_eq!(robot.get_speed(), 254);
    assert_eq!(drive_commands(&state)[0].0, 254);
    drop(robot);
}

#[test]
fn raw_motors_and_target_speed_exclude_each_other() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.set_speed(100).unwrap();
    robot.raw_motor(80, -80, None).unwrap();

    // Raw power displaced the target speed.
    assert_eq!(robot.get_speed(), 0);
    let raws = raw_commands(&state);
    assert_eq!(raws.last().copied(), Some((1, 80, 2, 80)));
    // Raw mode drops stabilization on the wire.
    let stab = state.commands_for(devices::DRIVING, 0x0C);
    assert_eq!(stab.last().map(|p| p.data[0]), Some(0));

    // Setting a speed again displaces the raw power.
    robot.set_speed(90).unwrap();
    assert_eq!(robot.get_speed(), 90);
    let raw_count = raw_commands(&state).len();
    std::thread::sleep(Duration::from_millis(250));
    // Keep-alive refreshes the drive, never the stale raw power.
    assert_eq!(raw_commands(&state).len(), raw_count);
    assert!(drive_commands(&state).iter().filter(|c| c.0 == 90).count() >= 2);
    drop(robot);
}

#[test]
fn timed_raw_motor_ends_at_rest_with_stabilization_restored() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot
        .raw_motor(255, 255, Some(Duration::from_millis(80)))
        .unwrap();

    assert_eq!(robot.get_speed(), 0);
    let raws = raw_commands(&state);
    assert_eq!(raws.first().copied(), Some((1, 255, 1, 255)));
    // The epilogue stops both motors.
    assert_eq!(raws.last().copied(), Some((0, 0, 0, 0)));
    // Stabilization went off for the hold and back on afterwards.
    let stab: Vec<u8> = state
        .commands_for(devices::DRIVING, 0x0C)
        .iter()
        .map(|p| p.data[0])
        .collect();
    assert!(stab.ends_with(&[0, 1]));
    drop(robot);
}

#[test]
fn spin_delivers_the_full_angle_and_honors_the_time_floor() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    let before = drive_commands(&state).len();

    let start = Instant::now();
    // 100 ms requested, but a Sphero needs 0.45 s per revolution.
    robot.spin(360, Duration::from_millis(100)).unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_millis(440),
        "spin finished in {elapsed:?}"
    );
    let headings: Vec<u16> = drive_commands(&state)[before..].iter().map(|c| c.1).collect();
    assert_eq!(forward_displacement(0, &headings), 360);
    assert_eq!(robot.get_heading(), 0);
    drop(robot);
}

#[test]
fn negative_spin_travels_backward() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    let before = drive_commands(&state).len();
    robot.spin(-90, Duration::from_millis(50)).unwrap();

    let headings: Vec<u16> = drive_commands(&state)[before..].iter().map(|c| c.1).collect();
    // Walking the sequence backward covers exactly 90 degrees.
    let mut previous = 0u16;
    let mut total = 0i64;
    for &heading in &headings {
        total += i64::from((360 + previous - heading) % 360);
        previous = heading;
    }
    assert_eq!(total, 90);
    assert_eq!(robot.get_heading(), 270);
    drop(robot);
}

#[test]
fn keepalive_refreshes_a_set_speed() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.set_speed(100).unwrap();
    std::thread::sleep(Duration::from_millis(350));

    // Initial command plus at least two 100 ms refreshes.
    let drives = drive_commands(&state);
    assert!(drives.len() >= 3, "only {} drive commands", drives.len());
    assert!(drives.iter().all(|c| c.0 == 100));
    drop(robot);
}

#[test]
fn keepalive_is_idle_while_the_toy_rests() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    let before = state.command_count();
    std::thread::sleep(Duration::from_millis(350));
    assert_eq!(state.command_count(), before);
    drop(robot);
}

#[test]
fn concurrent_commands_and_ticks_never_interleave_partial_state() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    let robot = Arc::new(robot);
    robot.set_speed(100).unwrap();

    let spinner = {
        let robot = Arc::clone(&robot);
        std::thread::spawn(move || {
            for heading in (0..360).step_by(15) {
                robot.set_heading(heading).unwrap();
                std::thread::sleep(Duration::from_millis(10));
            }
        })
    };
    spinner.join().unwrap();
    std::thread::sleep(Duration::from_millis(150));

    // Every observed command reflects one consistent snapshot: the speed is
    // always the commanded one, headings only ever values that were set.
    for (speed, heading, _) in drive_commands(&state) {
        assert_eq!(speed, 100);
        assert!(heading < 360);
        assert_eq!(heading % 15, 0, "heading {heading} was never commanded");
    }

    Arc::try_unwrap(robot).ok().expect("sole owner").close().unwrap();
}
