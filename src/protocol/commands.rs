//! Typed builders for the device commands the crate exercises.
//!
//! Payloads are opaque to the correlation layer; each builder returns a
//! [`Command`] naming the device subsystem, the command id and the payload
//! bytes. Notification keys for the asynchronous reports live here too so
//! listeners and commands stay in one place.

use crate::protocol::packet::NotificationKey;

/// Device subsystem ids.
pub mod devices {
    pub const API_SHELL: u8 = 0x10;
    pub const SYSTEM_INFO: u8 = 0x11;
    pub const POWER: u8 = 0x13;
    pub const DRIVING: u8 = 0x16;
    pub const ANIMATRONIC: u8 = 0x17;
    pub const SENSOR: u8 = 0x18;
    pub const USER_IO: u8 = 0x1A;
}

/// An outbound command: subsystem, command id and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub did: u8,
    pub cid: u8,
    pub data: Vec<u8>,
}

impl Command {
    fn new(did: u8, cid: u8, data: Vec<u8>) -> Self {
        Self { did, cid, data }
    }
}

/// How raw power is applied to one motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RawMotorMode {
    Off = 0,
    Forward = 1,
    Reverse = 2,
}

/// Direction flag for a drive command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriveFlag {
    Forward = 0x00,
    Backward = 0x01,
}

/// Leg actions available on bipedal/tripedal droids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LegAction {
    Stop = 0,
    ThreeLegs = 1,
    TwoLegs = 2,
    Waddle = 3,
}

pub mod api_shell {
    use super::*;

    pub fn ping(data: Vec<u8>) -> Command {
        Command::new(devices::API_SHELL, 0x00, data)
    }
}

pub mod system_info {
    use super::*;

    pub fn get_main_app_version() -> Command {
        Command::new(devices::SYSTEM_INFO, 0x00, vec![])
    }
}

pub mod power {
    use super::*;

    pub const BATTERY_STATE_NOTIFY: NotificationKey =
        NotificationKey::new(devices::POWER, 0x06);

    pub fn sleep() -> Command {
        Command::new(devices::POWER, 0x01, vec![])
    }

    pub fn get_battery_voltage() -> Command {
        Command::new(devices::POWER, 0x03, vec![])
    }

    pub fn get_battery_state() -> Command {
        Command::new(devices::POWER, 0x04, vec![])
    }

    pub fn enable_battery_state_notify(enable: bool) -> Command {
        Command::new(devices::POWER, 0x05, vec![enable as u8])
    }

    pub fn wake() -> Command {
        Command::new(devices::POWER, 0x0D, vec![])
    }
}

pub mod driving {
    use super::*;

    pub fn raw_motors(
        left_mode: RawMotorMode,
        left_power: u8,
        right_mode: RawMotorMode,
        right_power: u8,
    ) -> Command {
        Command::new(
            devices::DRIVING,
            0x01,
            vec![left_mode as u8, left_power, right_mode as u8, right_power],
        )
    }

    pub fn reset_yaw() -> Command {
        Command::new(devices::DRIVING, 0x06, vec![])
    }

    pub fn drive_with_heading(speed: u8, heading: u16, flag: DriveFlag) -> Command {
        let [hi, lo] = heading.to_be_bytes();
        Command::new(devices::DRIVING, 0x07, vec![speed, hi, lo, flag as u8])
    }

    pub fn set_stabilization(enabled: bool) -> Command {
        Command::new(devices::DRIVING, 0x0C, vec![enabled as u8])
    }
}

pub mod animatronic {
    use super::*;

    pub const PLAY_ANIMATION_COMPLETE_NOTIFY: NotificationKey =
        NotificationKey::new(devices::ANIMATRONIC, 0x11);

    pub fn play_animation(animation: u16) -> Command {
        Command::new(devices::ANIMATRONIC, 0x05, animation.to_be_bytes().to_vec())
    }

    pub fn perform_leg_action(action: LegAction) -> Command {
        Command::new(devices::ANIMATRONIC, 0x0D, vec![action as u8])
    }

    pub fn set_head_position(degrees: f32) -> Command {
        Command::new(devices::ANIMATRONIC, 0x0F, degrees.to_be_bytes().to_vec())
    }

    pub fn stop_animation() -> Command {
        Command::new(devices::ANIMATRONIC, 0x13, vec![])
    }
}

pub mod sensor {
    use super::*;

    pub const STREAMING_NOTIFY: NotificationKey = NotificationKey::new(devices::SENSOR, 0x02);
    pub const GYRO_MAX_NOTIFY: NotificationKey = NotificationKey::new(devices::SENSOR, 0x10);
    pub const COLLISION_NOTIFY: NotificationKey = NotificationKey::new(devices::SENSOR, 0x12);

    pub fn set_streaming_mask(interval_ms: u16, count: u8, mask: u32) -> Command {
        let mut data = Vec::with_capacity(7);
        data.extend_from_slice(&interval_ms.to_be_bytes());
        data.push(count);
        data.extend_from_slice(&mask.to_be_bytes());
        Command::new(devices::SENSOR, 0x00, data)
    }

    pub fn set_extended_streaming_mask(mask: u32) -> Command {
        Command::new(devices::SENSOR, 0x0C, mask.to_be_bytes().to_vec())
    }

    pub fn enable_gyro_max_notify(enable: bool) -> Command {
        Command::new(devices::SENSOR, 0x0F, vec![enable as u8])
    }

    pub fn configure_collision_detection(
        method: u8,
        x_threshold: u8,
        y_threshold: u8,
        x_speed: u8,
        y_speed: u8,
        dead_time: u8,
    ) -> Command {
        Command::new(
            devices::SENSOR,
            0x11,
            vec![method, x_threshold, y_threshold, x_speed, y_speed, dead_time],
        )
    }

    pub fn reset_locator() -> Command {
        Command::new(devices::SENSOR, 0x13, vec![])
    }
}

pub mod user_io {
    use super::*;

    pub fn play_audio_file(sound: u16, playback_mode: u8) -> Command {
        let [hi, lo] = sound.to_be_bytes();
        Command::new(devices::USER_IO, 0x07, vec![hi, lo, playback_mode])
    }

    pub fn set_audio_volume(volume: u8) -> Command {
        Command::new(devices::USER_IO, 0x08, vec![volume])
    }

    /// Writes a subset of the LED slots selected by a 16-bit mask; `values`
    /// carries one byte per set mask bit, lowest bit first.
    pub fn set_all_leds(mask: u16, values: &[u8]) -> Command {
        let mut data = Vec::with_capacity(2 + values.len());
        data.extend_from_slice(&mask.to_be_bytes());
        data.extend_from_slice(values);
        Command::new(devices::USER_IO, 0x1A, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_payload_layout() {
        let cmd = driving::drive_with_heading(200, 0x015E, DriveFlag::Backward);
        assert_eq!(cmd.did, devices::DRIVING);
        assert_eq!(cmd.data, vec![200, 0x01, 0x5E, 0x01]);
    }

    #[test]
    fn streaming_mask_layout() {
        let cmd = sensor::set_streaming_mask(150, 0, 0x0007_E000);
        assert_eq!(cmd.data, vec![0x00, 0x96, 0x00, 0x00, 0x07, 0xE0, 0x00]);
    }

    #[test]
    fn led_mask_layout() {
        let cmd = user_io::set_all_leds(0b0000_0111, &[10, 20, 30]);
        assert_eq!(cmd.data, vec![0x00, 0x07, 10, 20, 30]);
    }
}
