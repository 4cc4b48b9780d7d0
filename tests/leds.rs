//! LED semantics: clamping, per-model channel layouts, main-LED fan-out and
//! the timed fade/strobe effects.

mod common;

use std::time::Duration;

use common::{mock_robot, MockState};
use rollbot::protocol::commands::devices;
use rollbot::{Color, ToyModel};

/// Decoded LED writes: (mask, values).
fn led_commands(state: &MockState) -> Vec<(u16, Vec<u8>)> {
    state
        .commands_for(devices::USER_IO, 0x1A)
        .iter()
        .map(|p| {
            (
                u16::from_be_bytes([p.data[0], p.data[1]]),
                p.data[2..].to_vec(),
            )
        })
        .collect()
}

#[test]
fn out_of_range_channels_clamp() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.set_main_led(Color::new(300, -5, 10)).unwrap();

    assert_eq!(robot.get_main_led(), Some(Color::new(255, 0, 10)));
    let (mask, values) = led_commands(&state).pop().unwrap();
    assert_eq!(mask, 0b111);
    assert_eq!(values, vec![255, 0, 10]);
    drop(robot);
}

#[test]
fn droid_main_led_fans_out_to_front_and_back() {
    let (robot, state) = mock_robot(ToyModel::R2d2);
    let color = Color::new(0, 120, 255);
    robot.set_main_led(color).unwrap();

    // No main group on a droid: the write lands on front and back instead.
    let writes = led_commands(&state);
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0], (0b111, vec![0, 120, 255])); // front at slot 0
    assert_eq!(writes[1], (0b111 << 4, vec![0, 120, 255])); // back at slot 4
    assert_eq!(robot.get_front_led(), Some(color));
    assert_eq!(robot.get_back_led(), Some(color));
    drop(robot);
}

#[test]
fn tail_light_brightness_is_blue_only() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.set_back_led_brightness(300).unwrap();

    assert_eq!(robot.get_back_led(), Some(Color::new(0, 0, 255)));
    let (mask, values) = led_commands(&state).pop().unwrap();
    assert_eq!(mask, 1 << 3);
    assert_eq!(values, vec![255]);
    drop(robot);
}

#[test]
fn rgb_back_led_needs_an_rgb_slot() {
    // A plain sphere has a brightness-only tail: color writes are ignored.
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.set_back_led(Color::new(10, 20, 30)).unwrap();
    assert!(led_commands(&state).is_empty());
    drop(robot);

    // A droid tail is a full RGB group.
    let (robot, state) = mock_robot(ToyModel::R2d2);
    robot.set_back_led(Color::new(10, 20, 30)).unwrap();
    let (mask, values) = led_commands(&state).pop().unwrap();
    assert_eq!(mask, 0b111 << 4);
    assert_eq!(values, vec![10, 20, 30]);
    drop(robot);
}

#[test]
fn front_led_is_silently_ignored_without_a_slot() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    robot.set_front_led(Color::new(1, 2, 3)).unwrap();
    assert!(led_commands(&state).is_empty());
    assert_eq!(robot.get_front_led(), None);
    drop(robot);
}

#[test]
fn dome_leds_use_the_coarse_scale() {
    let (robot, state) = mock_robot(ToyModel::Bb9e);
    robot.set_dome_leds(20).unwrap();

    // Bounded to 15, then widened to the 0-255 wire range.
    assert_eq!(robot.get_dome_leds(), Some(15));
    let (mask, values) = led_commands(&state).pop().unwrap();
    assert_eq!(mask, 1 << 4);
    assert_eq!(values, vec![255]);
    drop(robot);
}

#[test]
fn droid_brightness_channels() {
    let (robot, state) = mock_robot(ToyModel::R2d2);
    robot.set_holo_projector_led(128).unwrap();
    robot.set_logic_display_leds(-20).unwrap();

    assert_eq!(robot.get_holo_projector_led(), Some(128));
    assert_eq!(robot.get_logic_display_leds(), Some(0));
    let writes = led_commands(&state);
    assert_eq!(writes[0], (1 << 7, vec![128]));
    assert_eq!(writes[1], (1 << 3, vec![0]));
    drop(robot);
}

#[test]
fn fade_lands_exactly_on_the_target_color() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    let from = Color::new(0, 255, 0);
    let to = Color::new(0, 0, 255);
    robot.fade(from, to, Duration::from_millis(80)).unwrap();

    let writes = led_commands(&state);
    assert!(writes.len() >= 2);
    assert_eq!(writes.last().unwrap().1, vec![0, 0, 255]);
    assert_eq!(robot.get_main_led(), Some(to));
    drop(robot);
}

#[test]
fn strobe_alternates_dark_and_lit() {
    let (robot, state) = mock_robot(ToyModel::Sphero);
    let color = Color::new(255, 57, 66);
    robot
        .strobe(color, Duration::from_millis(10), 3)
        .unwrap();

    let writes = led_commands(&state);
    assert_eq!(writes.len(), 6);
    for (i, (_, values)) in writes.iter().enumerate() {
        if i % 2 == 0 {
            assert_eq!(values, &vec![0, 0, 0]);
        } else {
            assert_eq!(values, &vec![255, 57, 66]);
        }
    }
    drop(robot);
}
